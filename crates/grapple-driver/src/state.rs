//! 状态缓存
//!
//! 每个设备的最新状态由 IO 线程写入、用户线程读取。
//! 使用 `ArcSwapOption` 实现无锁读取：每个新样本替换（而非修改）上一个样本，
//! 读者总是拿到一份完整的快照。
//!
//! 新鲜度在读取时惰性计算：
//!
//! | 状态            | 条件                              |
//! |-----------------|-----------------------------------|
//! | `Uninitialized` | 尚未收到任何有效帧                |
//! | `Valid`         | 最后一个样本的年龄 ≤ stale 超时   |
//! | `Stale`         | 超时之后（仍携带最后已知值）      |

use arc_swap::ArcSwapOption;
use grapple_protocol::lasercan::Measurement;
use grapple_protocol::mitocandria::{Channel, ChannelStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 缓存新鲜度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Uninitialized,
    Valid,
    Stale,
}

/// 一次缓存读取的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<T> {
    /// 最后已知值（`Uninitialized` 时为 `None`）
    pub value: Option<T>,
    pub freshness: Freshness,
    /// 最后一个样本的年龄
    pub age: Option<Duration>,
}

impl<T: Copy> Reading<T> {
    /// 仅在新鲜时返回值
    pub fn valid(&self) -> Option<T> {
        match self.freshness {
            Freshness::Valid => self.value,
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.freshness == Freshness::Valid
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Reading<U> {
        Reading {
            value: self.value.map(f),
            freshness: self.freshness,
            age: self.age,
        }
    }
}

#[derive(Debug)]
struct Sample<T> {
    value: T,
    received_at: Instant,
}

/// 单值状态缓存（单写多读）
#[derive(Debug)]
pub struct StatusCache<T> {
    slot: ArcSwapOption<Sample<T>>,
    stale_after: Duration,
    updates: AtomicU64,
}

impl<T: Copy> StatusCache<T> {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stale_after,
            updates: AtomicU64::new(0),
        }
    }

    /// 写入新样本（IO 线程调用）
    pub fn store(&self, value: T) {
        self.store_at(value, Instant::now());
    }

    pub(crate) fn store_at(&self, value: T, received_at: Instant) {
        self.slot.store(Some(Arc::new(Sample { value, received_at })));
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// 读取当前快照（不阻塞）
    pub fn read(&self) -> Reading<T> {
        match self.slot.load_full() {
            None => Reading {
                value: None,
                freshness: Freshness::Uninitialized,
                age: None,
            },
            Some(sample) => {
                let age = sample.received_at.elapsed();
                let freshness = if age <= self.stale_after {
                    Freshness::Valid
                } else {
                    Freshness::Stale
                };
                Reading {
                    value: Some(sample.value),
                    freshness,
                    age: Some(age),
                }
            },
        }
    }

    /// 累计写入次数
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }
}

/// LaserCAN 设备状态
#[derive(Debug)]
pub struct LaserCanState {
    pub measurement: StatusCache<Measurement>,
}

impl LaserCanState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            measurement: StatusCache::new(stale_after),
        }
    }
}

/// MitoCANdria 设备状态（每路通道一个缓存）
#[derive(Debug)]
pub struct MitoCandriaState {
    channels: [StatusCache<ChannelStatus>; Channel::COUNT],
}

impl MitoCandriaState {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            channels: std::array::from_fn(|_| StatusCache::new(stale_after)),
        }
    }

    pub fn channel(&self, channel: Channel) -> &StatusCache<ChannelStatus> {
        &self.channels[channel.index() as usize]
    }

    /// 任一通道有新鲜状态即视为在线
    pub fn is_online(&self) -> bool {
        self.channels.iter().any(|cache| cache.read().is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_cache_is_uninitialized() {
        let cache: StatusCache<u16> = StatusCache::new(Duration::from_millis(100));
        let reading = cache.read();
        assert_eq!(reading.freshness, Freshness::Uninitialized);
        assert_eq!(reading.value, None);
        assert_eq!(reading.valid(), None);
        assert_eq!(cache.update_count(), 0);
    }

    #[test]
    fn test_store_then_read_is_valid() {
        let cache = StatusCache::new(Duration::from_millis(100));
        cache.store(42u16);
        let reading = cache.read();
        assert!(reading.is_valid());
        assert_eq!(reading.valid(), Some(42));
        assert_eq!(cache.update_count(), 1);
    }

    #[test]
    fn test_old_sample_is_stale_but_keeps_value() {
        let cache = StatusCache::new(Duration::from_millis(50));
        cache.store_at(7u16, Instant::now() - Duration::from_millis(80));
        let reading = cache.read();
        assert!(reading.is_stale());
        assert_eq!(reading.value, Some(7));
        assert_eq!(reading.valid(), None);
        assert!(reading.age.unwrap() >= Duration::from_millis(80));
    }

    #[test]
    fn test_new_sample_supersedes() {
        let cache = StatusCache::new(Duration::from_millis(50));
        cache.store_at(1u16, Instant::now() - Duration::from_secs(1));
        assert!(cache.read().is_stale());
        cache.store(2u16);
        assert_eq!(cache.read().valid(), Some(2));
    }

    #[test]
    fn test_reading_map() {
        let cache = StatusCache::new(Duration::from_millis(50));
        cache.store(1500u16);
        let reading = cache.read().map(|mv| mv as f64 / 1000.0);
        assert_eq!(reading.valid(), Some(1.5));
    }

    #[test]
    fn test_mitocandria_online() {
        let state = MitoCandriaState::new(Duration::from_millis(50));
        assert!(!state.is_online());
        state.channel(Channel::FiveVoltA).store(ChannelStatus {
            channel: Channel::FiveVoltA,
            enabled: true,
            current_ma: 10,
            voltage_mv: 5000,
            setpoint_mv: 5000,
        });
        assert!(state.is_online());
        assert!(state.channel(Channel::Usb1).read().value.is_none());
    }
}
