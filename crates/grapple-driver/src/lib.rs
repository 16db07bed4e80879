//! 驱动层模块
//!
//! 本模块提供 Grapple CAN 设备的驱动功能，包括：
//! - IO 线程管理（单线程独占适配器）
//! - 设备注册表与帧路由
//! - 状态缓存（ArcSwap 无锁读取，带新鲜度）
//! - 配置请求的 ack 等待与重试
//! - 设备仿真（测试与无硬件演示）
//!
//! # 使用场景
//!
//! ```rust
//! use grapple_can::VirtualBus;
//! use grapple_driver::{BusBuilder, Rangefinder};
//!
//! let virtual_bus = VirtualBus::new();
//! let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
//! let sensor = bus.lasercan(1).unwrap();
//! if let Some(m) = sensor.get_measurement() {
//!     println!("{:.3} m", m.distance_m());
//! }
//! ```

mod builder;
mod bus;
pub mod config;
mod error;
pub mod lasercan;
pub mod metrics;
pub mod mitocandria;
pub mod pipeline;
pub mod registry;
pub mod sim;
pub mod state;

pub use builder::BusBuilder;
pub use bus::CanBus;
pub use config::DriverConfig;
pub use error::DriverError;
pub use lasercan::{LaserCan, LaserCanConfig, Rangefinder};
pub use metrics::{BusMetrics, MetricsSnapshot};
pub use mitocandria::{MitoCandria, PowerDistribution};
pub use registry::{DeviceRegistry, DeviceSlot};
pub use sim::{SimulatedDevice, SimulatedLaserCan, SimulatedMitoCandria, SimulatorHandle};
pub use state::*;
