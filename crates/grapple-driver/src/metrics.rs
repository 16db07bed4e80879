//! 总线指标
//!
//! 原子计数器，IO 线程写入，任意线程读取快照。

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_malformed: AtomicU64,
    pub(crate) frames_ignored: AtomicU64,
    pub(crate) acks_received: AtomicU64,
    pub(crate) send_errors: AtomicU64,
    pub(crate) receive_errors: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// 收到的帧（含被忽略和畸形的帧）
    pub frames_received: u64,
    /// 成功写入总线的帧
    pub frames_sent: u64,
    /// 解析失败被丢弃的帧
    pub frames_malformed: u64,
    /// 非 Grapple 帧或未注册地址的帧
    pub frames_ignored: u64,
    pub acks_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}
