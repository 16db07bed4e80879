//! # Grapple Protocol
//!
//! Grapple CAN 设备协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: 29 位仲裁 ID 布局、设备类型与地址
//! - `ack`: 配置请求的应答帧
//! - `lasercan`: LaserCAN 测距传感器编解码
//! - `mitocandria`: MitoCANdria 电源分配模块编解码
//!
//! ## 字节序
//!
//! 与 Grapple 固件一致，多字节整数使用小端（Intel, LSB first）。
//! 载荷布局属于版本化契约：任何布局变化都必须提升 crate 版本号。

pub mod ack;
pub mod ids;
pub mod lasercan;
pub mod mitocandria;

pub use ack::AckStatus;
pub use ids::*;

use thiserror::Error;

/// CAN 2.0 帧的统一抽象
///
/// 协议层与传输层之间的中间类型：协议层通过 `TryFrom<GrappleFrame>` 解析、
/// 通过 `to_frame()` 构建；传输层（SocketCAN / 虚拟总线 / TCP 桥）只搬运它。
///
/// ```rust
/// use grapple_protocol::GrappleFrame;
///
/// let frame = GrappleFrame::new_extended(0x0606_0001, &[1, 2, 3]);
/// assert_eq!(frame.id(), 0x0606_0001);
/// assert_eq!(frame.data_slice(), &[1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GrappleFrame {
    /// CAN ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl GrappleFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..(self.len as usize).min(8)]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 解析为 Grapple 仲裁 ID
    pub fn message_id(&self) -> MessageId {
        MessageId::from_raw(self.id)
    }
}

/// 协议解析错误（收到的帧无法解析）
///
/// 对应“畸形帧”：由接收方记录并丢弃，不会中断控制循环。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },

    #[error("Unexpected message: api class {api_class}, index {api_index}")]
    UnexpectedMessage { api_class: u8, api_index: u8 },

    #[error("Fragmented messages are not supported (ID 0x{id:X})")]
    Fragmented { id: u32 },
}

impl ProtocolError {
    pub(crate) fn invalid_value(field: &str, value: u8) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value,
        }
    }
}

/// 配置错误（要发送的配置超出有效范围）
///
/// 在编码阶段就会返回，此时尚未产生任何总线写入。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid CAN address {0} (valid range 0..=62)")]
    InvalidAddress(u8),

    #[error("Invalid timing budget {0}ms (supported: 20, 33, 50, 100)")]
    InvalidTimingBudget(u8),

    #[error("Invalid region of interest x={x} y={y} w={w} h={h}")]
    InvalidRoi { x: u8, y: u8, w: u8, h: u8 },

    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    #[error("Channel {0} is not switchable")]
    NotSwitchable(u8),

    #[error("Channel {0} is not adjustable")]
    NotAdjustable(u8),

    #[error("Voltage {0}V out of range (2.5V..=12.0V)")]
    VoltageOutOfRange(f64),
}

/// 校验载荷长度（固定布局，必须完全相等）
pub(crate) fn expect_len(payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// 小端字节序转 u16
pub fn bytes_to_u16_le(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// u16 转小端字节序
pub fn u16_to_bytes_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_truncates_to_eight_bytes() {
        let frame = GrappleFrame::new_extended(0x123, &[0u8; 12]);
        assert_eq!(frame.len, 8);
        assert!(frame.is_extended);
    }

    #[test]
    fn test_standard_frame() {
        let frame = GrappleFrame::new_standard(0x7FF, &[0xAA]);
        assert_eq!(frame.id(), 0x7FF);
        assert!(!frame.is_extended);
        assert_eq!(frame.data_slice(), &[0xAA]);
        assert_eq!(frame.timestamp_us, 0);
    }

    #[test]
    fn test_u16_le_roundtrip() {
        assert_eq!(u16_to_bytes_le(0x1234), [0x34, 0x12]);
        assert_eq!(bytes_to_u16_le([0x34, 0x12]), 0x1234);
    }

    #[test]
    fn test_expect_len() {
        assert!(expect_len(&[1, 2], 2).is_ok());
        assert_eq!(
            expect_len(&[1], 2),
            Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            expect_len(&[1, 2, 3], 2),
            Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: 3
            })
        );
    }
}
