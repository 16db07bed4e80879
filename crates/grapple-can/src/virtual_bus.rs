//! 进程内虚拟 CAN 总线
//!
//! 多点总线：任一端点发送的帧会投递给其他所有端点（不回环给自己）。
//! 没有硬件时用于桌面测试、设备仿真，以及作为 TCP 桥服务端的本地总线。
//!
//! ```rust
//! use grapple_can::{CanAdapter, GrappleFrame, VirtualBus};
//!
//! let bus = VirtualBus::new();
//! let mut a = bus.attach();
//! let mut b = bus.attach();
//!
//! a.send(GrappleFrame::new_extended(0x123, &[1])).unwrap();
//! assert_eq!(b.receive().unwrap().id, 0x123);
//! ```

use crate::{CanAdapter, CanError, GrappleFrame};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// 每个端点的接收队列容量
pub const ENDPOINT_QUEUE_CAPACITY: usize = 1024;

struct Endpoint {
    id: u64,
    tx: Sender<GrappleFrame>,
}

struct BusShared {
    endpoints: Mutex<Vec<Endpoint>>,
    next_id: Mutex<u64>,
    epoch: Instant,
}

/// 虚拟总线（可克隆，克隆体指向同一条总线）
#[derive(Clone)]
pub struct VirtualBus {
    shared: Arc<BusShared>,
}

impl std::fmt::Debug for VirtualBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBus")
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                endpoints: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// 接入一个新端点
    pub fn attach(&self) -> VirtualCanAdapter {
        let (tx, rx) = crossbeam_channel::bounded(ENDPOINT_QUEUE_CAPACITY);
        let id = {
            let mut next_id = self.shared.next_id.lock();
            *next_id += 1;
            *next_id
        };
        self.shared.endpoints.lock().push(Endpoint { id, tx });
        trace!("Virtual bus endpoint {} attached", id);

        VirtualCanAdapter {
            id,
            shared: Some(self.shared.clone()),
            rx,
            read_timeout: Duration::from_millis(2),
        }
    }

    /// 当前接入的端点数量
    pub fn endpoint_count(&self) -> usize {
        self.shared.endpoints.lock().len()
    }
}

/// 虚拟总线端点
pub struct VirtualCanAdapter {
    id: u64,
    /// `None` 表示已关闭
    shared: Option<Arc<BusShared>>,
    rx: Receiver<GrappleFrame>,
    read_timeout: Duration,
}

impl VirtualCanAdapter {
    pub fn is_closed(&self) -> bool {
        self.shared.is_none()
    }
}

impl CanAdapter for VirtualCanAdapter {
    fn send(&mut self, mut frame: GrappleFrame) -> Result<(), CanError> {
        let shared = self.shared.as_ref().ok_or(CanError::Closed)?;
        frame.timestamp_us = shared.epoch.elapsed().as_micros() as u64;

        let endpoints = shared.endpoints.lock();
        for endpoint in endpoints.iter().filter(|e| e.id != self.id) {
            match endpoint.tx.try_send(frame) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Virtual bus endpoint {} queue full, dropping frame 0x{:X}",
                        endpoint.id, frame.id
                    );
                },
                // 端点正在关闭
                Err(TrySendError::Disconnected(_)) => {},
            }
        }
        trace!("Virtual bus frame sent: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&mut self) -> Result<GrappleFrame, CanError> {
        if self.shared.is_none() {
            return Err(CanError::Closed);
        }
        if self.read_timeout.is_zero() {
            return match self.rx.try_recv() {
                Ok(frame) => Ok(frame),
                Err(TryRecvError::Empty) => Err(CanError::Timeout),
                Err(TryRecvError::Disconnected) => Err(CanError::Closed),
            };
        }
        match self.rx.recv_timeout(self.read_timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(CanError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CanError::Closed),
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<GrappleFrame, CanError> {
        let old_timeout = self.read_timeout;
        self.read_timeout = timeout;
        let result = self.receive();
        self.read_timeout = old_timeout;
        result
    }

    fn close(&mut self) -> Result<(), CanError> {
        if let Some(shared) = self.shared.take() {
            shared.endpoints.lock().retain(|e| e.id != self.id);
            trace!("Virtual bus endpoint {} detached", self.id);
        }
        Ok(())
    }
}

impl Drop for VirtualCanAdapter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_without_self_echo() {
        let bus = VirtualBus::new();
        let mut a = bus.attach();
        let mut b = bus.attach();
        let mut c = bus.attach();

        a.send(GrappleFrame::new_extended(0x42, &[1, 2])).unwrap();

        assert_eq!(b.receive().unwrap().id, 0x42);
        assert_eq!(c.receive().unwrap().data_slice(), &[1, 2]);
        assert!(matches!(a.try_receive(), Ok(None)));
    }

    #[test]
    fn test_close_detaches_endpoint() {
        let bus = VirtualBus::new();
        let mut a = bus.attach();
        let _b = bus.attach();
        assert_eq!(bus.endpoint_count(), 2);

        a.close().unwrap();
        a.close().unwrap();
        assert_eq!(bus.endpoint_count(), 1);
        assert!(a.is_closed());
        assert!(matches!(
            a.send(GrappleFrame::new_extended(1, &[])),
            Err(CanError::Closed)
        ));
        assert!(matches!(a.receive(), Err(CanError::Closed)));
    }

    #[test]
    fn test_drop_detaches_endpoint() {
        let bus = VirtualBus::new();
        {
            let _a = bus.attach();
            assert_eq!(bus.endpoint_count(), 1);
        }
        assert_eq!(bus.endpoint_count(), 0);
    }

    #[test]
    fn test_receive_times_out() {
        let bus = VirtualBus::new();
        let mut a = bus.attach();
        let start = Instant::now();
        assert!(matches!(
            a.receive_timeout(Duration::from_millis(5)),
            Err(CanError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_timestamps_are_stamped() {
        let bus = VirtualBus::new();
        let mut a = bus.attach();
        let mut b = bus.attach();
        std::thread::sleep(Duration::from_millis(2));
        a.send(GrappleFrame::new_extended(5, &[])).unwrap();
        assert!(b.receive().unwrap().timestamp_us > 0);
    }
}
