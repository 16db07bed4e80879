//! LaserCAN 设备句柄

use crate::bus::BusInner;
use crate::error::DriverError;
use crate::registry::DeviceSlot;
use crate::state::{LaserCanState, Reading};
use grapple_protocol::lasercan::{
    LaserCanMessage, Measurement, RangingMode, RegionOfInterest, TimingBudget,
};
use grapple_protocol::{AckStatus, CanAddress};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// 测距能力
pub trait Rangefinder {
    /// 最新测量（带新鲜度）
    fn measurement(&self) -> Reading<Measurement>;

    /// 仅返回新鲜的测量
    fn get_measurement(&self) -> Option<Measurement> {
        self.measurement().valid()
    }

    fn set_ranging_mode(&self, mode: RangingMode) -> Result<(), DriverError>;

    fn set_timing_budget(&self, budget: TimingBudget) -> Result<(), DriverError>;

    fn set_roi(&self, roi: RegionOfInterest) -> Result<(), DriverError>;
}

/// 主机侧记录的 LaserCAN 配置（设备确认后才更新）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LaserCanConfig {
    pub ranging_mode: RangingMode,
    pub timing_budget: TimingBudget,
    pub roi: RegionOfInterest,
}

/// LaserCAN 测距传感器
///
/// 由 `CanBus::lasercan()` 创建；drop 时释放地址。
pub struct LaserCan {
    bus: Arc<BusInner>,
    address: CanAddress,
    state: Arc<LaserCanState>,
    config: Mutex<LaserCanConfig>,
    /// 串行化配置请求，保证 `config` 与设备确认的顺序一致
    request_lock: Mutex<()>,
}

impl LaserCan {
    pub(crate) fn attach(bus: Arc<BusInner>, address: CanAddress) -> Result<Self, DriverError> {
        let state = Arc::new(LaserCanState::new(bus.config.stale_timeout()));
        bus.ctx
            .registry
            .register(address, DeviceSlot::LaserCan(state.clone()))?;
        debug!("LaserCAN attached at address {}", address);
        Ok(Self {
            bus,
            address,
            state,
            config: Mutex::new(LaserCanConfig::default()),
            request_lock: Mutex::new(()),
        })
    }

    pub fn address(&self) -> CanAddress {
        self.address
    }

    /// 按毫秒设置测量时间（只接受 20/33/50/100）
    ///
    /// # 错误
    /// - `DriverError::InvalidConfiguration`: 非法取值，不会写总线
    pub fn set_timing_budget_ms(&self, ms: u8) -> Result<(), DriverError> {
        let budget = TimingBudget::from_ms(ms)?;
        self.set_timing_budget(budget)
    }

    /// 主机侧记录的配置（仅包含设备已确认的部分）
    pub fn requested_config(&self) -> LaserCanConfig {
        *self.config.lock()
    }

    /// 累计收到的测量帧数
    pub fn update_count(&self) -> u64 {
        self.state.measurement.update_count()
    }

    fn configure(&self, message: LaserCanMessage) -> Result<(), DriverError> {
        let frame = message.to_frame(self.address)?;
        let _serial = self.request_lock.lock();
        let status = self.bus.request(
            frame,
            self.bus.config.request_timeout(),
            self.bus.config.request_retries,
        )?;

        match status {
            AckStatus::Accepted => {
                let mut config = self.config.lock();
                match message {
                    LaserCanMessage::SetRangingMode(mode) => config.ranging_mode = mode,
                    LaserCanMessage::SetTimingBudget(budget) => config.timing_budget = budget,
                    LaserCanMessage::SetRoi(roi) => config.roi = roi,
                    _ => {},
                }
                Ok(())
            },
            AckStatus::Rejected(code) => {
                warn!(
                    "LaserCAN {} rejected {:?} (code {})",
                    self.address, message, code
                );
                Err(DriverError::Rejected { code: code.get() })
            },
        }
    }
}

impl Rangefinder for LaserCan {
    fn measurement(&self) -> Reading<Measurement> {
        self.state.measurement.read()
    }

    fn set_ranging_mode(&self, mode: RangingMode) -> Result<(), DriverError> {
        self.configure(LaserCanMessage::SetRangingMode(mode))
    }

    fn set_timing_budget(&self, budget: TimingBudget) -> Result<(), DriverError> {
        self.configure(LaserCanMessage::SetTimingBudget(budget))
    }

    fn set_roi(&self, roi: RegionOfInterest) -> Result<(), DriverError> {
        roi.validate()?;
        self.configure(LaserCanMessage::SetRoi(roi))
    }
}

impl Drop for LaserCan {
    fn drop(&mut self) {
        self.bus.ctx.registry.unregister(self.address);
    }
}

impl std::fmt::Debug for LaserCan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaserCan")
            .field("address", &self.address)
            .field("config", &self.requested_config())
            .finish()
    }
}
