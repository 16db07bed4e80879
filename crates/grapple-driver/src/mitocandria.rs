//! MitoCANdria 设备句柄
//!
//! 通道按索引访问（0..=4）：
//!
//! | 索引 | 通道          | 能力       |
//! |------|---------------|------------|
//! | 0, 1 | USB 5V        | 常开       |
//! | 2, 3 | 5V A / 5V B   | 可开关     |
//! | 4    | 可调电压      | 可开关调压 |

use crate::bus::BusInner;
use crate::error::DriverError;
use crate::registry::DeviceSlot;
use crate::state::MitoCandriaState;
use grapple_protocol::mitocandria::{
    Channel, ChannelStatus, FIXED_CHANNEL_VOLTAGE, MitoCandriaMessage,
};
use grapple_protocol::{AckStatus, CanAddress};
use std::sync::Arc;
use tracing::{debug, warn};

/// 电源分配能力
///
/// 读取类方法在设备未上报或状态过期时返回 `Ok(None)`。
pub trait PowerDistribution {
    /// 通道电流（A）
    fn channel_current(&self, channel: u8) -> Result<Option<f64>, DriverError>;

    /// 通道输出电压（V）
    fn channel_voltage(&self, channel: u8) -> Result<Option<f64>, DriverError>;

    /// 目标电压（V）；非可调通道固定 5V
    fn channel_voltage_setpoint(&self, channel: u8) -> Result<Option<f64>, DriverError>;

    fn channel_enabled(&self, channel: u8) -> Result<Option<bool>, DriverError>;

    fn set_channel_enabled(&self, channel: u8, enabled: bool) -> Result<(), DriverError>;

    fn set_channel_voltage(&self, channel: u8, volts: f64) -> Result<(), DriverError>;
}

/// MitoCANdria 电源分配模块
///
/// 由 `CanBus::mitocandria()` 创建；drop 时释放地址。
pub struct MitoCandria {
    bus: Arc<BusInner>,
    address: CanAddress,
    state: Arc<MitoCandriaState>,
}

fn channel(index: u8) -> Result<Channel, DriverError> {
    Channel::from_index(index).map_err(|_| DriverError::InvalidChannel(index))
}

impl MitoCandria {
    pub(crate) fn attach(bus: Arc<BusInner>, address: CanAddress) -> Result<Self, DriverError> {
        let state = Arc::new(MitoCandriaState::new(bus.config.stale_timeout()));
        bus.ctx
            .registry
            .register(address, DeviceSlot::MitoCandria(state.clone()))?;
        debug!("MitoCANdria attached at address {}", address);
        Ok(Self {
            bus,
            address,
            state,
        })
    }

    pub fn address(&self) -> CanAddress {
        self.address
    }

    /// 至少一路通道有新鲜状态
    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    /// 通道完整状态（仅新鲜时）
    pub fn channel_status(&self, index: u8) -> Result<Option<ChannelStatus>, DriverError> {
        let channel = channel(index)?;
        Ok(self.state.channel(channel).read().valid())
    }

    fn configure(&self, message: MitoCandriaMessage) -> Result<(), DriverError> {
        let frame = message.to_frame(self.address)?;
        if !self.is_online() {
            return Err(DriverError::DeviceOffline);
        }

        let status = self.bus.request(
            frame,
            self.bus.config.request_timeout(),
            self.bus.config.request_retries,
        )?;
        match status {
            AckStatus::Accepted => Ok(()),
            AckStatus::Rejected(code) => {
                warn!(
                    "MitoCANdria {} rejected {:?} (code {})",
                    self.address, message, code
                );
                Err(DriverError::Rejected { code: code.get() })
            },
        }
    }
}

impl PowerDistribution for MitoCandria {
    fn channel_current(&self, index: u8) -> Result<Option<f64>, DriverError> {
        Ok(self.channel_status(index)?.map(|s| s.current_a()))
    }

    fn channel_voltage(&self, index: u8) -> Result<Option<f64>, DriverError> {
        let channel = channel(index)?;
        let status = self.state.channel(channel).read().valid();
        // 只有可调通道有电压采样，其余固定 5V
        Ok(status.map(|s| {
            if channel.kind().is_adjustable() {
                s.voltage_v()
            } else {
                FIXED_CHANNEL_VOLTAGE
            }
        }))
    }

    fn channel_voltage_setpoint(&self, index: u8) -> Result<Option<f64>, DriverError> {
        let channel = channel(index)?;
        let status = self.state.channel(channel).read().valid();
        Ok(status.map(|s| {
            if channel.kind().is_adjustable() {
                s.setpoint_v()
            } else {
                FIXED_CHANNEL_VOLTAGE
            }
        }))
    }

    fn channel_enabled(&self, index: u8) -> Result<Option<bool>, DriverError> {
        Ok(self.channel_status(index)?.map(|s| s.enabled))
    }

    fn set_channel_enabled(&self, index: u8, enabled: bool) -> Result<(), DriverError> {
        let message = MitoCandriaMessage::set_enabled(channel(index)?, enabled)?;
        self.configure(message)
    }

    fn set_channel_voltage(&self, index: u8, volts: f64) -> Result<(), DriverError> {
        let message = MitoCandriaMessage::set_voltage(channel(index)?, volts)?;
        self.configure(message)
    }
}

impl Drop for MitoCandria {
    fn drop(&mut self) {
        self.bus.ctx.registry.unregister(self.address);
    }
}

impl std::fmt::Debug for MitoCandria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitoCandria")
            .field("address", &self.address)
            .field("online", &self.is_online())
            .finish()
    }
}
