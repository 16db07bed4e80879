//! TCP 桥接记录格式
//!
//! 字节流上的每条记录（小端）：
//!
//! ```text
//! u16  body 长度 N（9..=17）
//! u32  仲裁 ID（bit 31 = 扩展帧标志）
//! u32  时间戳（毫秒，回绕）
//! u8   载荷长度 L（0..=8），N == 9 + L
//! L    载荷
//! ```
//!
//! 格式属于版本化契约（版本 1），两端必须一致。

use crate::GrappleFrame;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::debug;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8006;

/// 长度前缀字节数
pub const LENGTH_PREFIX_LEN: usize = 2;

/// 最短 body（无载荷）
pub const MIN_BODY_LEN: usize = 9;

/// 最长 body（8 字节载荷）
pub const MAX_BODY_LEN: usize = MIN_BODY_LEN + 8;

const EXTENDED_FLAG: u32 = 1 << 31;
const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;
const STANDARD_ID_MASK: u32 = 0x7FF;

/// 记录解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid record body length {0} (expected 9..=17)")]
    BodyLength(usize),

    #[error("Payload length {payload} does not match body length {body}")]
    PayloadLength { payload: usize, body: usize },
}

/// 编码一条记录并追加到 `buf`
pub fn encode_record(frame: &GrappleFrame, buf: &mut BytesMut) {
    let payload = frame.data_slice();
    let id = if frame.is_extended {
        (frame.id & EXTENDED_ID_MASK) | EXTENDED_FLAG
    } else {
        frame.id & STANDARD_ID_MASK
    };

    buf.reserve(LENGTH_PREFIX_LEN + MIN_BODY_LEN + payload.len());
    buf.put_u16_le((MIN_BODY_LEN + payload.len()) as u16);
    buf.put_u32_le(id);
    buf.put_u32_le((frame.timestamp_us / 1000) as u32);
    buf.put_u8(payload.len() as u8);
    buf.put_slice(payload);
}

/// 解码一条记录的 body（不含长度前缀）
pub fn decode_record(body: &[u8]) -> Result<GrappleFrame, RecordError> {
    if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body.len()) {
        return Err(RecordError::BodyLength(body.len()));
    }

    let raw_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let timestamp_ms = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let payload_len = body[8] as usize;
    if MIN_BODY_LEN + payload_len != body.len() {
        return Err(RecordError::PayloadLength {
            payload: payload_len,
            body: body.len(),
        });
    }

    let payload = &body[MIN_BODY_LEN..];
    let mut frame = if raw_id & EXTENDED_FLAG != 0 {
        GrappleFrame::new_extended(raw_id & EXTENDED_ID_MASK, payload)
    } else {
        GrappleFrame::new_standard((raw_id & STANDARD_ID_MASK) as u16, payload)
    };
    frame.timestamp_us = timestamp_ms as u64 * 1000;
    Ok(frame)
}

/// 流式记录解码器
///
/// 缓存不完整的读取；遇到不可能的长度或载荷长度不一致时丢弃 1 字节重新同步。
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: BytesMut,
    resync_events: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加从流中读到的字节
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 取出下一帧（数据不足时返回 `None`）
    pub fn next_frame(&mut self) -> Option<GrappleFrame> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_LEN {
                return None;
            }

            let body_len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
            if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
                self.resync(RecordError::BodyLength(body_len));
                continue;
            }
            if self.buf.len() < LENGTH_PREFIX_LEN + body_len {
                return None;
            }

            match decode_record(&self.buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + body_len]) {
                Ok(frame) => {
                    self.buf.advance(LENGTH_PREFIX_LEN + body_len);
                    return Some(frame);
                },
                Err(e) => self.resync(e),
            }
        }
    }

    fn resync(&mut self, reason: RecordError) {
        debug!("Bridge stream out of sync ({}), dropping one byte", reason);
        self.buf.advance(1);
        self.resync_events += 1;
    }

    /// 重新同步次数
    pub fn resync_events(&self) -> u64 {
        self.resync_events
    }

    /// 缓存中尚未解析的字节数
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
