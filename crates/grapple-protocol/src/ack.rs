//! 配置应答帧
//!
//! 设备收到配置帧后，以相同 API 的 ack 帧应答，载荷第 0 字节为结果码。
//! 结果码 0 表示接受，因此拒绝码永远非零。

use crate::{ProtocolError, expect_len};
use std::num::NonZeroU8;

/// 配置请求结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// 设备已接受配置
    Accepted,
    /// 设备拒绝，附带固件错误码
    Rejected(NonZeroU8),
}

impl AckStatus {
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(payload, 1)?;
        Ok(match NonZeroU8::new(payload[0]) {
            None => AckStatus::Accepted,
            Some(code) => AckStatus::Rejected(code),
        })
    }

    pub fn to_payload(self) -> [u8; 1] {
        match self {
            AckStatus::Accepted => [0],
            AckStatus::Rejected(code) => [code.get()],
        }
    }

    pub fn is_accepted(self) -> bool {
        self == AckStatus::Accepted
    }
}
