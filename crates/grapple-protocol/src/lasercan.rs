//! LaserCAN 测距传感器编解码
//!
//! LaserCAN 是一个 0-4m 的飞行时间（ToF）测距传感器。设备周期性发送测量帧，
//! 主机通过配置帧设置测距模式、时间预算和感兴趣区域（ROI）。
//!
//! | 消息            | class | index | 载荷 |
//! |-----------------|-------|-------|------|
//! | Measurement     | 0     | 0     | `[flags, dist(2), ambient(2), budget, roi xy, roi wh]` |
//! | SetRangingMode  | 1     | 0     | `[mode]` |
//! | SetTimingBudget | 1     | 1     | `[budget_ms]` |
//! | SetRoi          | 1     | 2     | `[roi xy, roi wh]` |

use crate::ack::AckStatus;
use crate::ids::*;
use crate::{
    ConfigError, GrappleFrame, ProtocolError, bytes_to_u16_le, expect_len, u16_to_bytes_le,
};
use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const API_INDEX_MEASUREMENT: u8 = 0;
pub const API_INDEX_SET_RANGING_MODE: u8 = 0;
pub const API_INDEX_SET_TIMING_BUDGET: u8 = 1;
pub const API_INDEX_SET_ROI: u8 = 2;

/// 测量帧载荷长度
pub const MEASUREMENT_LEN: usize = 8;

/// 测距模式
///
/// - `Long`: 可探测更远目标（最远 4m），但更易受环境光干扰
/// - `Short`: 1.3m 以内，抗环境光能力更强
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RangingMode {
    Short = 0,
    Long = 1,
}

impl Default for RangingMode {
    fn default() -> Self {
        RangingMode::Short
    }
}

/// 时间预算（判别值即毫秒数）
///
/// 预算越高，结果越准确、越可重复，但测量频率越低。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TimingBudget {
    Ms20 = 20,
    Ms33 = 33,
    Ms50 = 50,
    Ms100 = 100,
}

impl TimingBudget {
    /// 从毫秒数构造，只接受枚举内的取值
    pub fn from_ms(ms: u8) -> Result<Self, ConfigError> {
        Self::try_from(ms).map_err(|_| ConfigError::InvalidTimingBudget(ms))
    }

    pub fn as_ms(self) -> u8 {
        self.into()
    }
}

impl Default for TimingBudget {
    fn default() -> Self {
        TimingBudget::Ms33
    }
}

/// 测量状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MeasurementStatus {
    /// 有效测量
    Valid = 0,
    /// 噪声过大，增大时间预算可能提高可靠性
    NoiseIssue = 1,
    /// 信号过弱：目标过远、反射率低或过小
    WeakSignal = 2,
    /// 目标处于量程边界（通常只出现在亮目标上）
    OutOfBounds = 4,
    /// 高反射目标超出理论量程，距离“回绕”为较小值
    Wraparound = 7,
}

impl MeasurementStatus {
    pub fn is_valid(self) -> bool {
        self == MeasurementStatus::Valid
    }
}

/// 感兴趣区域（ROI）
///
/// 传感器 16x16 SPAD 阵列上的有效感光窗口：
/// - `x`, `y`: 窗口中心，0..=15
/// - `w`, `h`: 窗口宽高，4..=16
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionOfInterest {
    pub x: u8,
    pub y: u8,
    pub w: u8,
    pub h: u8,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self {
            x: 8,
            y: 8,
            w: 16,
            h: 16,
        }
    }
}

/// 两个 4 位半字节（ROI 打包用）
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy)]
struct NibblePair {
    low: u4,
    high: u4,
}

impl RegionOfInterest {
    pub fn new(x: u8, y: u8, w: u8, h: u8) -> Result<Self, ConfigError> {
        let roi = Self { x, y, w, h };
        roi.validate()?;
        Ok(roi)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = self.x <= 15
            && self.y <= 15
            && (4..=16).contains(&self.w)
            && (4..=16).contains(&self.h);
        if in_range {
            Ok(())
        } else {
            Err(ConfigError::InvalidRoi {
                x: self.x,
                y: self.y,
                w: self.w,
                h: self.h,
            })
        }
    }

    /// 打包为 2 字节：`[x | y << 4, (w-1) | (h-1) << 4]`
    pub fn encode(&self) -> Result<[u8; 2], ConfigError> {
        self.validate()?;
        let xy = NibblePair::new(u4::new(self.x), u4::new(self.y));
        let wh = NibblePair::new(u4::new(self.w - 1), u4::new(self.h - 1));
        Ok([u8::from(xy), u8::from(wh)])
    }

    pub fn decode(bytes: [u8; 2]) -> Result<Self, ProtocolError> {
        let xy = NibblePair::from(bytes[0]);
        let wh = NibblePair::from(bytes[1]);
        let roi = Self {
            x: xy.low().value(),
            y: xy.high().value(),
            w: wh.low().value() + 1,
            h: wh.high().value() + 1,
        };
        // 宽高最小为 4
        roi.validate()
            .map_err(|_| ProtocolError::invalid_value("roi", bytes[1]))?;
        Ok(roi)
    }
}

/// 测量帧第 0 字节的位域
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy)]
struct MeasurementFlags {
    status: u3,
    long_mode: bool,
    reserved: u4,
}

/// 一次测量（不可变快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Measurement {
    pub status: MeasurementStatus,
    /// 目标距离（毫米）
    pub distance_mm: u16,
    /// 环境光强度（近似值）
    pub ambient: u16,
    /// 测量时使用的测距模式
    pub ranging_mode: RangingMode,
    /// 测量时使用的时间预算
    pub timing_budget: TimingBudget,
    /// 测量时使用的 ROI
    pub roi: RegionOfInterest,
}

impl Measurement {
    /// 目标距离（米）
    pub fn distance_m(&self) -> f64 {
        self.distance_mm as f64 / 1000.0
    }

    /// 米转毫米定点值（四舍五入，饱和到 u16 范围）
    pub fn distance_mm_from_m(distance_m: f64) -> u16 {
        (distance_m * 1000.0).round().clamp(0.0, u16::MAX as f64) as u16
    }

    pub fn is_long(&self) -> bool {
        self.ranging_mode == RangingMode::Long
    }

    pub fn encode(&self) -> Result<[u8; MEASUREMENT_LEN], ConfigError> {
        let flags = MeasurementFlags::new(u3::new(u8::from(self.status)), self.is_long());
        let dist = u16_to_bytes_le(self.distance_mm);
        let ambient = u16_to_bytes_le(self.ambient);
        let roi = self.roi.encode()?;

        Ok([
            u8::from(flags),
            dist[0],
            dist[1],
            ambient[0],
            ambient[1],
            self.timing_budget.as_ms(),
            roi[0],
            roi[1],
        ])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(payload, MEASUREMENT_LEN)?;

        let flags = MeasurementFlags::from(payload[0]);
        let status_raw = flags.status().value();
        let status = MeasurementStatus::try_from(status_raw)
            .map_err(|_| ProtocolError::invalid_value("status", status_raw))?;
        let timing_budget = TimingBudget::try_from(payload[5])
            .map_err(|_| ProtocolError::invalid_value("timing_budget", payload[5]))?;

        Ok(Self {
            status,
            distance_mm: bytes_to_u16_le([payload[1], payload[2]]),
            ambient: bytes_to_u16_le([payload[3], payload[4]]),
            ranging_mode: if flags.long_mode() {
                RangingMode::Long
            } else {
                RangingMode::Short
            },
            timing_budget,
            roi: RegionOfInterest::decode([payload[6], payload[7]])?,
        })
    }
}

/// LaserCAN 配置命令种类（用于匹配 ack）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaserCanCommand {
    SetRangingMode,
    SetTimingBudget,
    SetRoi,
}

impl LaserCanCommand {
    pub fn api_index(self) -> u8 {
        match self {
            LaserCanCommand::SetRangingMode => API_INDEX_SET_RANGING_MODE,
            LaserCanCommand::SetTimingBudget => API_INDEX_SET_TIMING_BUDGET,
            LaserCanCommand::SetRoi => API_INDEX_SET_ROI,
        }
    }

    pub fn from_api_index(api_index: u8) -> Result<Self, ProtocolError> {
        match api_index {
            API_INDEX_SET_RANGING_MODE => Ok(LaserCanCommand::SetRangingMode),
            API_INDEX_SET_TIMING_BUDGET => Ok(LaserCanCommand::SetTimingBudget),
            API_INDEX_SET_ROI => Ok(LaserCanCommand::SetRoi),
            _ => Err(ProtocolError::UnexpectedMessage {
                api_class: API_CLASS_CONFIG,
                api_index,
            }),
        }
    }
}

/// LaserCAN 协议消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserCanMessage {
    Measurement(Measurement),
    SetRangingMode(RangingMode),
    SetTimingBudget(TimingBudget),
    SetRoi(RegionOfInterest),
    Ack {
        command: LaserCanCommand,
        status: AckStatus,
    },
}

impl LaserCanMessage {
    /// 配置类消息对应的命令
    pub fn command(&self) -> Option<LaserCanCommand> {
        match self {
            LaserCanMessage::SetRangingMode(_) => Some(LaserCanCommand::SetRangingMode),
            LaserCanMessage::SetTimingBudget(_) => Some(LaserCanCommand::SetTimingBudget),
            LaserCanMessage::SetRoi(_) => Some(LaserCanCommand::SetRoi),
            LaserCanMessage::Ack { command, .. } => Some(*command),
            LaserCanMessage::Measurement(_) => None,
        }
    }

    pub fn message_id(&self, address: CanAddress) -> MessageId {
        let (api_class, api_index) = match self.command() {
            Some(command) => (API_CLASS_CONFIG, command.api_index()),
            None => (API_CLASS_STATUS, API_INDEX_MEASUREMENT),
        };
        let id = MessageId::for_device(DeviceKind::LaserCan, address, api_class, api_index);
        match self {
            LaserCanMessage::Ack { .. } => id.ack(),
            _ => id,
        }
    }

    /// 编码为 CAN 帧
    ///
    /// # 错误
    /// - `ConfigError::InvalidRoi`: ROI 超出范围（此时不会产生任何帧）
    pub fn to_frame(&self, address: CanAddress) -> Result<GrappleFrame, ConfigError> {
        let id = self.message_id(address).to_raw();
        let frame = match self {
            LaserCanMessage::Measurement(m) => GrappleFrame::new_extended(id, &m.encode()?),
            LaserCanMessage::SetRangingMode(mode) => {
                GrappleFrame::new_extended(id, &[u8::from(*mode)])
            },
            LaserCanMessage::SetTimingBudget(budget) => {
                GrappleFrame::new_extended(id, &[budget.as_ms()])
            },
            LaserCanMessage::SetRoi(roi) => GrappleFrame::new_extended(id, &roi.encode()?),
            LaserCanMessage::Ack { status, .. } => {
                GrappleFrame::new_extended(id, &status.to_payload())
            },
        };
        Ok(frame)
    }
}

impl TryFrom<GrappleFrame> for LaserCanMessage {
    type Error = ProtocolError;

    fn try_from(frame: GrappleFrame) -> Result<Self, Self::Error> {
        let id = frame.message_id();
        if !frame.is_extended || id.device_kind() != Some(DeviceKind::LaserCan) {
            return Err(ProtocolError::InvalidCanId { id: frame.id });
        }
        if id.fragment_flag() {
            return Err(ProtocolError::Fragmented { id: frame.id });
        }

        let payload = frame.data_slice();
        match (id.api(), id.ack_flag()) {
            ((API_CLASS_STATUS, API_INDEX_MEASUREMENT), false) => {
                Measurement::decode(payload).map(LaserCanMessage::Measurement)
            },
            ((API_CLASS_CONFIG, api_index), true) => Ok(LaserCanMessage::Ack {
                command: LaserCanCommand::from_api_index(api_index)?,
                status: AckStatus::from_payload(payload)?,
            }),
            ((API_CLASS_CONFIG, api_index), false) => {
                match LaserCanCommand::from_api_index(api_index)? {
                    LaserCanCommand::SetRangingMode => {
                        expect_len(payload, 1)?;
                        RangingMode::try_from(payload[0])
                            .map(LaserCanMessage::SetRangingMode)
                            .map_err(|_| ProtocolError::invalid_value("ranging_mode", payload[0]))
                    },
                    LaserCanCommand::SetTimingBudget => {
                        expect_len(payload, 1)?;
                        TimingBudget::try_from(payload[0])
                            .map(LaserCanMessage::SetTimingBudget)
                            .map_err(|_| ProtocolError::invalid_value("timing_budget", payload[0]))
                    },
                    LaserCanCommand::SetRoi => {
                        expect_len(payload, 2)?;
                        RegionOfInterest::decode([payload[0], payload[1]])
                            .map(LaserCanMessage::SetRoi)
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
