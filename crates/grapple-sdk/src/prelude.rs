//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use grapple_sdk::prelude::*;
//! ```

// 驱动层
pub use crate::driver::{BusBuilder, CanBus, DriverConfig, LaserCan, MitoCandria};
// 能力 Trait
pub use crate::driver::{PowerDistribution, Rangefinder};

// CAN 层
pub use crate::can::{CanAdapter, VirtualBus};

// 协议层常用类型
pub use crate::protocol::lasercan::{Measurement, RangingMode, RegionOfInterest, TimingBudget};

// 错误类型
pub use crate::can::CanError;
pub use crate::driver::DriverError;
pub use crate::protocol::{ConfigError, ProtocolError};
