//! MitoCANdria 电源分配模块编解码
//!
//! 设备有 5 路输出，每路以一个状态帧周期上报电流、电压和设定电压。

use crate::ack::AckStatus;
use crate::ids::*;
use crate::{
    ConfigError, GrappleFrame, ProtocolError, bytes_to_u16_le, expect_len, u16_to_bytes_le,
};
use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const API_INDEX_CHANNEL_STATUS: u8 = 0;
pub const API_INDEX_SET_SWITCHABLE_CHANNEL: u8 = 0;
pub const API_INDEX_SET_ADJUSTABLE_CHANNEL: u8 = 1;

/// 通道状态帧载荷长度
pub const CHANNEL_STATUS_LEN: usize = 8;

/// 可调通道电压下限（V）
pub const ADJUSTABLE_VOLTAGE_MIN: f64 = 2.5;
/// 可调通道电压上限（V）
pub const ADJUSTABLE_VOLTAGE_MAX: f64 = 12.0;
/// 不可切换通道（USB）的固定输出电压（V）
pub const FIXED_CHANNEL_VOLTAGE: f64 = 5.0;

/// 输出通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Channel {
    Usb1 = 0,
    Usb2 = 1,
    FiveVoltA = 2,
    FiveVoltB = 3,
    Adjustable = 4,
}

impl Channel {
    pub const COUNT: usize = 5;

    pub const ALL: [Channel; Self::COUNT] = [
        Channel::Usb1,
        Channel::Usb2,
        Channel::FiveVoltA,
        Channel::FiveVoltB,
        Channel::Adjustable,
    ];

    pub fn from_index(index: u8) -> Result<Self, ConfigError> {
        Self::try_from(index).map_err(|_| ConfigError::InvalidChannel(index))
    }

    pub fn index(self) -> u8 {
        self.into()
    }

    pub fn kind(self) -> ChannelKind {
        match self {
            Channel::Usb1 | Channel::Usb2 => ChannelKind::NonSwitchable,
            Channel::FiveVoltA | Channel::FiveVoltB => ChannelKind::Switchable,
            Channel::Adjustable => ChannelKind::Adjustable,
        }
    }
}

/// 通道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ChannelKind {
    /// 常开，只能读取
    NonSwitchable = 0,
    /// 可开关
    Switchable = 1,
    /// 可开关且电压可调
    Adjustable = 2,
}

impl ChannelKind {
    pub fn is_switchable(self) -> bool {
        self != ChannelKind::NonSwitchable
    }

    pub fn is_adjustable(self) -> bool {
        self == ChannelKind::Adjustable
    }
}

/// 状态帧第 1 字节的位域
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy)]
struct ChannelFlags {
    kind: u2,
    enabled: bool,
    reserved: u5,
}

/// 单路通道状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelStatus {
    pub channel: Channel,
    pub enabled: bool,
    /// 输出电流（mA）
    pub current_ma: u16,
    /// 输出电压（mV）
    pub voltage_mv: u16,
    /// 设定电压（mV），非可调通道为出厂固定值
    pub setpoint_mv: u16,
}

impl ChannelStatus {
    pub fn current_a(&self) -> f64 {
        self.current_ma as f64 / 1000.0
    }

    pub fn voltage_v(&self) -> f64 {
        self.voltage_mv as f64 / 1000.0
    }

    pub fn setpoint_v(&self) -> f64 {
        self.setpoint_mv as f64 / 1000.0
    }

    pub fn encode(&self) -> [u8; CHANNEL_STATUS_LEN] {
        let flags = ChannelFlags::new(u2::new(u8::from(self.channel.kind())), self.enabled);
        let current = u16_to_bytes_le(self.current_ma);
        let voltage = u16_to_bytes_le(self.voltage_mv);
        let setpoint = u16_to_bytes_le(self.setpoint_mv);

        [
            self.channel.index(),
            u8::from(flags),
            current[0],
            current[1],
            voltage[0],
            voltage[1],
            setpoint[0],
            setpoint[1],
        ]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(payload, CHANNEL_STATUS_LEN)?;

        let channel = Channel::try_from(payload[0])
            .map_err(|_| ProtocolError::invalid_value("channel", payload[0]))?;
        let flags = ChannelFlags::from(payload[1]);
        let kind_raw = flags.kind().value();
        // 上报的通道类型必须与通道号一致
        if ChannelKind::try_from(kind_raw).ok() != Some(channel.kind()) {
            return Err(ProtocolError::invalid_value("channel_kind", kind_raw));
        }

        Ok(Self {
            channel,
            enabled: flags.enabled(),
            current_ma: bytes_to_u16_le([payload[2], payload[3]]),
            voltage_mv: bytes_to_u16_le([payload[4], payload[5]]),
            setpoint_mv: bytes_to_u16_le([payload[6], payload[7]]),
        })
    }
}

/// 电压（V）转 mV，并校验可调范围
pub fn adjustable_voltage_to_mv(volts: f64) -> Result<u16, ConfigError> {
    if !(ADJUSTABLE_VOLTAGE_MIN..=ADJUSTABLE_VOLTAGE_MAX).contains(&volts) {
        return Err(ConfigError::VoltageOutOfRange(volts));
    }
    Ok((volts * 1000.0).round() as u16)
}

/// MitoCANdria 配置命令种类（用于匹配 ack）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MitoCandriaCommand {
    SetSwitchableChannel,
    SetAdjustableChannel,
}

impl MitoCandriaCommand {
    pub fn api_index(self) -> u8 {
        match self {
            MitoCandriaCommand::SetSwitchableChannel => API_INDEX_SET_SWITCHABLE_CHANNEL,
            MitoCandriaCommand::SetAdjustableChannel => API_INDEX_SET_ADJUSTABLE_CHANNEL,
        }
    }

    pub fn from_api_index(api_index: u8) -> Result<Self, ProtocolError> {
        match api_index {
            API_INDEX_SET_SWITCHABLE_CHANNEL => Ok(MitoCandriaCommand::SetSwitchableChannel),
            API_INDEX_SET_ADJUSTABLE_CHANNEL => Ok(MitoCandriaCommand::SetAdjustableChannel),
            _ => Err(ProtocolError::UnexpectedMessage {
                api_class: API_CLASS_CONFIG,
                api_index,
            }),
        }
    }
}

/// MitoCANdria 协议消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitoCandriaMessage {
    ChannelStatus(ChannelStatus),
    SetSwitchableChannel {
        channel: Channel,
        enabled: bool,
    },
    SetAdjustableChannel {
        channel: Channel,
        voltage_mv: u16,
    },
    Ack {
        command: MitoCandriaCommand,
        status: AckStatus,
    },
}

impl MitoCandriaMessage {
    /// 构建开关命令（通道必须可切换）
    pub fn set_enabled(channel: Channel, enabled: bool) -> Result<Self, ConfigError> {
        if !channel.kind().is_switchable() {
            return Err(ConfigError::NotSwitchable(channel.index()));
        }
        Ok(MitoCandriaMessage::SetSwitchableChannel { channel, enabled })
    }

    /// 构建调压命令（通道必须可调，电压在 2.5..=12.0V 内）
    pub fn set_voltage(channel: Channel, volts: f64) -> Result<Self, ConfigError> {
        if !channel.kind().is_adjustable() {
            return Err(ConfigError::NotAdjustable(channel.index()));
        }
        Ok(MitoCandriaMessage::SetAdjustableChannel {
            channel,
            voltage_mv: adjustable_voltage_to_mv(volts)?,
        })
    }

    pub fn command(&self) -> Option<MitoCandriaCommand> {
        match self {
            MitoCandriaMessage::SetSwitchableChannel { .. } => {
                Some(MitoCandriaCommand::SetSwitchableChannel)
            },
            MitoCandriaMessage::SetAdjustableChannel { .. } => {
                Some(MitoCandriaCommand::SetAdjustableChannel)
            },
            MitoCandriaMessage::Ack { command, .. } => Some(*command),
            MitoCandriaMessage::ChannelStatus(_) => None,
        }
    }

    pub fn message_id(&self, address: CanAddress) -> MessageId {
        let (api_class, api_index) = match self.command() {
            Some(command) => (API_CLASS_CONFIG, command.api_index()),
            None => (API_CLASS_STATUS, API_INDEX_CHANNEL_STATUS),
        };
        let id = MessageId::for_device(DeviceKind::MitoCandria, address, api_class, api_index);
        match self {
            MitoCandriaMessage::Ack { .. } => id.ack(),
            _ => id,
        }
    }

    /// 编码为 CAN 帧
    ///
    /// 直接构造的变体在这里再校验一次通道能力与电压范围。
    pub fn to_frame(&self, address: CanAddress) -> Result<GrappleFrame, ConfigError> {
        let id = self.message_id(address).to_raw();
        let frame = match self {
            MitoCandriaMessage::ChannelStatus(status) => {
                GrappleFrame::new_extended(id, &status.encode())
            },
            MitoCandriaMessage::SetSwitchableChannel { channel, enabled } => {
                Self::set_enabled(*channel, *enabled)?;
                GrappleFrame::new_extended(id, &[channel.index(), u8::from(*enabled)])
            },
            MitoCandriaMessage::SetAdjustableChannel {
                channel,
                voltage_mv,
            } => {
                Self::set_voltage(*channel, *voltage_mv as f64 / 1000.0)?;
                let mv = u16_to_bytes_le(*voltage_mv);
                GrappleFrame::new_extended(id, &[channel.index(), mv[0], mv[1]])
            },
            MitoCandriaMessage::Ack { status, .. } => {
                GrappleFrame::new_extended(id, &status.to_payload())
            },
        };
        Ok(frame)
    }
}

impl TryFrom<GrappleFrame> for MitoCandriaMessage {
    type Error = ProtocolError;

    fn try_from(frame: GrappleFrame) -> Result<Self, Self::Error> {
        let id = frame.message_id();
        if !frame.is_extended || id.device_kind() != Some(DeviceKind::MitoCandria) {
            return Err(ProtocolError::InvalidCanId { id: frame.id });
        }
        if id.fragment_flag() {
            return Err(ProtocolError::Fragmented { id: frame.id });
        }

        let payload = frame.data_slice();
        match (id.api(), id.ack_flag()) {
            ((API_CLASS_STATUS, API_INDEX_CHANNEL_STATUS), false) => {
                ChannelStatus::decode(payload).map(MitoCandriaMessage::ChannelStatus)
            },
            ((API_CLASS_CONFIG, api_index), true) => Ok(MitoCandriaMessage::Ack {
                command: MitoCandriaCommand::from_api_index(api_index)?,
                status: AckStatus::from_payload(payload)?,
            }),
            ((API_CLASS_CONFIG, api_index), false) => {
                let command = MitoCandriaCommand::from_api_index(api_index)?;
                expect_len(payload, match command {
                    MitoCandriaCommand::SetSwitchableChannel => 2,
                    MitoCandriaCommand::SetAdjustableChannel => 3,
                })?;
                let channel = Channel::try_from(payload[0])
                    .map_err(|_| ProtocolError::invalid_value("channel", payload[0]))?;
                match command {
                    MitoCandriaCommand::SetSwitchableChannel => {
                        Ok(MitoCandriaMessage::SetSwitchableChannel {
                            channel,
                            enabled: payload[1] != 0,
                        })
                    },
                    MitoCandriaCommand::SetAdjustableChannel => {
                        Ok(MitoCandriaMessage::SetAdjustableChannel {
                            channel,
                            voltage_mv: bytes_to_u16_le([payload[1], payload[2]]),
                        })
                    },
                }
            },
            ((api_class, api_index), _) => Err(ProtocolError::UnexpectedMessage {
                api_class,
                api_index,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> CanAddress {
        CanAddress::new(10).unwrap()
    }

    #[test]
    fn test_channel_kinds() {
        assert_eq!(Channel::Usb1.kind(), ChannelKind::NonSwitchable);
        assert_eq!(Channel::FiveVoltB.kind(), ChannelKind::Switchable);
        assert!(Channel::Adjustable.kind().is_adjustable());
        assert!(Channel::Adjustable.kind().is_switchable());
        assert_eq!(Channel::from_index(5), Err(ConfigError::InvalidChannel(5)));
    }

    #[test]
    fn test_status_roundtrip() {
        let status = ChannelStatus {
            channel: Channel::Adjustable,
            enabled: true,
            current_ma: 1500,
            voltage_mv: 11_980,
            setpoint_mv: 12_000,
        };
        let frame = MitoCandriaMessage::ChannelStatus(status)
            .to_frame(address())
            .unwrap();
        assert_eq!(frame.data[1], 0b0000_0110);
        match MitoCandriaMessage::try_from(frame).unwrap() {
            MitoCandriaMessage::ChannelStatus(decoded) => {
                assert_eq!(decoded, status);
                assert!((decoded.current_a() - 1.5).abs() < 1e-9);
                assert!((decoded.setpoint_v() - 12.0).abs() < 1e-9);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_kind_mismatch_is_malformed() {
        let mut bytes = ChannelStatus {
            channel: Channel::Usb1,
            enabled: true,
            current_ma: 0,
            voltage_mv: 5000,
            setpoint_mv: 5000,
        }
        .encode();
        bytes[1] = 0b0000_0110; // 声称可调
        assert!(ChannelStatus::decode(&bytes).is_err());
    }

    #[test]
    fn test_set_enabled_rejects_usb() {
        assert_eq!(
            MitoCandriaMessage::set_enabled(Channel::Usb2, false),
            Err(ConfigError::NotSwitchable(1))
        );
        let msg = MitoCandriaMessage::set_enabled(Channel::FiveVoltA, false).unwrap();
        let frame = msg.to_frame(address()).unwrap();
        assert_eq!(frame.data_slice(), &[2, 0]);
        assert_eq!(MitoCandriaMessage::try_from(frame).unwrap(), msg);
    }

    #[test]
    fn test_set_voltage_domain() {
        assert_eq!(
            MitoCandriaMessage::set_voltage(Channel::FiveVoltA, 5.0),
            Err(ConfigError::NotAdjustable(2))
        );
        assert!(matches!(
            MitoCandriaMessage::set_voltage(Channel::Adjustable, 12.5),
            Err(ConfigError::VoltageOutOfRange(_))
        ));
        assert!(MitoCandriaMessage::set_voltage(Channel::Adjustable, f64::NAN).is_err());

        let msg = MitoCandriaMessage::set_voltage(Channel::Adjustable, 3.3).unwrap();
        let frame = msg.to_frame(address()).unwrap();
        assert_eq!(frame.data_slice(), &[4, 0xE4, 0x0C]);
    }

    #[test]
    fn test_direct_variant_revalidated() {
        let msg = MitoCandriaMessage::SetAdjustableChannel {
            channel: Channel::Adjustable,
            voltage_mv: 1000,
        };
        assert!(msg.to_frame(address()).is_err());
    }

    #[test]
    fn test_ack_decoding() {
        let ack = MitoCandriaMessage::Ack {
            command: MitoCandriaCommand::SetAdjustableChannel,
            status: AckStatus::Rejected(std::num::NonZeroU8::new(2).unwrap()),
        };
        let frame = ack.to_frame(address()).unwrap();
        assert!(frame.message_id().ack_flag());
        assert_eq!(MitoCandriaMessage::try_from(frame).unwrap(), ack);
    }
}
