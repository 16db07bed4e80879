//! Grapple SDK - Grapple CAN 设备 Rust SDK
//!
//! 支持 LaserCAN 测距传感器与 MitoCANdria 电源分配模块，
//! 可通过 SocketCAN、TCP 桥或进程内虚拟总线访问。
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): ID 布局与载荷编解码
//! - **CAN 层** (`can`): 传输抽象（SocketCAN / 虚拟总线 / TCP 桥）
//! - **驱动层** (`driver`): IO 线程、设备注册表、状态缓存、设备句柄
//!
//! # 快速开始
//!
//! ```rust
//! use grapple_sdk::prelude::*;
//!
//! let virtual_bus = VirtualBus::new();
//! let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
//! let sensor = bus.lasercan(1).unwrap();
//! let _ = sensor.get_measurement();
//! ```

pub mod bridge;
pub mod logging;
pub mod prelude;

pub use grapple_can as can;
pub use grapple_driver as driver;
pub use grapple_protocol as protocol;

// --- 用户以此为界 ---

pub use can::{CanAdapter, CanError, GrappleFrame, VirtualBus};
pub use driver::{
    BusBuilder, CanBus, DriverConfig, DriverError, Freshness, LaserCan, MitoCandria,
    PowerDistribution, Rangefinder, Reading,
};
pub use protocol::lasercan::{
    Measurement, MeasurementStatus, RangingMode, RegionOfInterest, TimingBudget,
};
pub use protocol::mitocandria::{Channel, ChannelStatus};
pub use protocol::{CanAddress, ConfigError, DeviceKind, ProtocolError};

pub use bridge::{BridgeHandle, run_tcp_bridge, run_tcp_bridge_in_background};
pub use logging::init_logging;
