//! Pipeline IO 循环模块
//!
//! 负责后台 IO 线程的 CAN 帧收发、解析和状态更新逻辑。
//! 只有 IO 线程接触适配器：所有写入经由有界命令队列串行化。

use crate::metrics::BusMetrics;
use crate::registry::{DeviceRegistry, DeviceSlot};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use grapple_can::{CanAdapter, CanError, GrappleFrame};
use grapple_protocol::AckStatus;
use grapple_protocol::lasercan::LaserCanMessage;
use grapple_protocol::mitocandria::MitoCandriaMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// 等待 ack 的配置请求（键为 ack 帧的原始 ID）
///
/// 同一 ack ID 同时只有一个等待者：后来的请求在 `insert` 中排队，
/// 直到前一个请求 `remove` 自己的条目。
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<u32, Waiter>>,
    released: Condvar,
    next_token: AtomicU64,
}

#[derive(Debug)]
struct Waiter {
    token: u64,
    tx: Sender<AckStatus>,
}

impl PendingRequests {
    /// 登记等待者，返回用于 `remove` 的令牌
    pub(crate) fn insert(&self, ack_id: u32, tx: Sender<AckStatus>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.waiters.lock();
        while waiters.contains_key(&ack_id) {
            trace!("Request for ack 0x{:X} queued behind another", ack_id);
            self.released.wait(&mut waiters);
        }
        waiters.insert(ack_id, Waiter { token, tx });
        token
    }

    /// 移除自己的条目（令牌不匹配时不动）
    pub(crate) fn remove(&self, ack_id: u32, token: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.get(&ack_id).is_some_and(|w| w.token == token) {
            waiters.remove(&ack_id);
            self.released.notify_all();
        }
    }

    /// 完成请求，返回是否有等待者
    ///
    /// 条目保留到请求方自行移除；重发产生的重复 ack 被丢弃。
    pub(crate) fn complete(&self, ack_id: u32, status: AckStatus) -> bool {
        match self.waiters.lock().get(&ack_id) {
            Some(waiter) => {
                let _ = waiter.tx.try_send(status);
                true
            },
            None => false,
        }
    }

    /// 丢弃所有等待者（等待方收到 Disconnected）
    pub(crate) fn fail_all(&self) {
        self.waiters.lock().clear();
        self.released.notify_all();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IO 线程与用户线程共享的上下文
#[derive(Debug, Default)]
pub struct BusContext {
    pub registry: DeviceRegistry,
    pub pending: PendingRequests,
    pub metrics: BusMetrics,
}

impl BusContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// IO 线程主循环
///
/// 退出条件：运行标志被清除、命令通道断开或适配器返回不可恢复错误。
/// 退出前关闭适配器并唤醒所有等待 ack 的请求。
pub fn io_loop(
    mut can: impl CanAdapter,
    cmd_rx: Receiver<GrappleFrame>,
    ctx: Arc<BusContext>,
    is_running: Arc<AtomicBool>,
    receive_timeout: Duration,
) {
    can.set_receive_timeout(receive_timeout);

    while is_running.load(Ordering::Acquire) {
        // 1. 先发送积压的命令
        if drain_tx_queue(&mut can, &cmd_rx, &ctx.metrics) {
            break;
        }

        // 2. 接收 CAN 帧（带超时，避免阻塞）
        match can.receive() {
            Ok(frame) => dispatch_frame(&frame, &ctx),
            Err(CanError::Timeout) => continue,
            Err(e) if e.is_fatal() => {
                error!("CAN receive failed, stopping IO thread: {}", e);
                BusMetrics::inc(&ctx.metrics.receive_errors);
                break;
            },
            Err(e) => {
                error!("CAN receive error: {}", e);
                BusMetrics::inc(&ctx.metrics.receive_errors);
                continue;
            },
        }
    }

    is_running.store(false, Ordering::Release);
    if let Err(e) = can.close() {
        warn!("Failed to close CAN adapter: {}", e);
    }
    ctx.pending.fail_all();
    trace!("IO thread exited");
}

/// Drain TX 队列（带时间预算）
///
/// - 单次最多发送 32 帧
/// - 单次最多占用 500µs，避免积压命令导致 RX 延迟突增
///
/// 返回 `true` 表示命令通道已断开。
fn drain_tx_queue(
    can: &mut impl CanAdapter,
    cmd_rx: &Receiver<GrappleFrame>,
    metrics: &BusMetrics,
) -> bool {
    const MAX_DRAIN_PER_CYCLE: usize = 32;
    const TIME_BUDGET: Duration = Duration::from_micros(500);

    let start = std::time::Instant::now();

    for _ in 0..MAX_DRAIN_PER_CYCLE {
        if start.elapsed() > TIME_BUDGET {
            trace!("Drain time budget exhausted, deferred {} frames", cmd_rx.len());
            break;
        }

        match cmd_rx.try_recv() {
            Ok(frame) => match can.send(frame) {
                Ok(()) => BusMetrics::inc(&metrics.frames_sent),
                Err(e) => {
                    // 发送失败不中断 drain，继续尝试下一帧
                    error!("Failed to send frame 0x{:X}: {}", frame.id, e);
                    BusMetrics::inc(&metrics.send_errors);
                },
            },
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return true,
        }
    }

    false
}

/// 解析一帧并更新状态
///
/// 畸形帧记录后丢弃，缓存保持不变。
pub(crate) fn dispatch_frame(frame: &GrappleFrame, ctx: &BusContext) {
    BusMetrics::inc(&ctx.metrics.frames_received);

    let id = frame.message_id();
    if !frame.is_extended || !id.is_grapple() {
        BusMetrics::inc(&ctx.metrics.frames_ignored);
        return;
    }

    if id.ack_flag() {
        match AckStatus::from_payload(frame.data_slice()) {
            Ok(status) => {
                BusMetrics::inc(&ctx.metrics.acks_received);
                if !ctx.pending.complete(id.to_raw(), status) {
                    trace!("Unsolicited ack 0x{:X}", frame.id);
                }
            },
            Err(e) => {
                BusMetrics::inc(&ctx.metrics.frames_malformed);
                warn!("Malformed ack 0x{:X}: {}", frame.id, e);
            },
        }
        return;
    }

    let Some(slot) = ctx.registry.route(id) else {
        BusMetrics::inc(&ctx.metrics.frames_ignored);
        return;
    };

    let result = match slot {
        DeviceSlot::LaserCan(state) => LaserCanMessage::try_from(*frame).map(|msg| {
            if let LaserCanMessage::Measurement(measurement) = msg {
                state.measurement.store(measurement);
            }
        }),
        DeviceSlot::MitoCandria(state) => MitoCandriaMessage::try_from(*frame).map(|msg| {
            if let MitoCandriaMessage::ChannelStatus(status) = msg {
                state.channel(status.channel).store(status);
            }
        }),
    };

    if let Err(e) = result {
        BusMetrics::inc(&ctx.metrics.frames_malformed);
        debug!("Dropping malformed frame 0x{:X}: {}", frame.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LaserCanState;
    use grapple_protocol::lasercan::*;
    use grapple_protocol::{CanAddress, DeviceKind, MessageId};
    use std::collections::VecDeque;
    use std::num::NonZeroU8;

    /// Mock CAN 适配器：接收队列为空时返回超时
    struct MockCanAdapter {
        receive_queue: VecDeque<GrappleFrame>,
        sent_frames: Arc<Mutex<Vec<GrappleFrame>>>,
        closed: Arc<AtomicBool>,
    }

    impl MockCanAdapter {
        fn new() -> Self {
            Self {
                receive_queue: VecDeque::new(),
                sent_frames: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl CanAdapter for MockCanAdapter {
        fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError> {
            self.sent_frames.lock().push(frame);
            Ok(())
        }

        fn receive(&mut self) -> Result<GrappleFrame, CanError> {
            match self.receive_queue.pop_front() {
                Some(frame) => Ok(frame),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(CanError::Timeout)
                },
            }
        }

        fn close(&mut self) -> Result<(), CanError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn address() -> CanAddress {
        CanAddress::new(4).unwrap()
    }

    fn measurement() -> Measurement {
        Measurement {
            status: MeasurementStatus::Valid,
            distance_mm: 250,
            ambient: 3,
            ranging_mode: RangingMode::Short,
            timing_budget: TimingBudget::Ms33,
            roi: RegionOfInterest::default(),
        }
    }

    fn context_with_laser() -> (Arc<BusContext>, Arc<LaserCanState>) {
        let ctx = Arc::new(BusContext::new());
        let state = Arc::new(LaserCanState::new(Duration::from_millis(500)));
        ctx.registry
            .register(address(), DeviceSlot::LaserCan(state.clone()))
            .unwrap();
        (ctx, state)
    }

    #[test]
    fn test_dispatch_updates_cache() {
        let (ctx, state) = context_with_laser();
        let frame = LaserCanMessage::Measurement(measurement()).to_frame(address()).unwrap();

        dispatch_frame(&frame, &ctx);

        assert_eq!(state.measurement.read().valid(), Some(measurement()));
        assert_eq!(ctx.metrics.snapshot().frames_received, 1);
    }

    #[test]
    fn test_malformed_frame_leaves_cache_untouched() {
        let (ctx, state) = context_with_laser();
        let id = MessageId::for_device(DeviceKind::LaserCan, address(), 0, 0);
        dispatch_frame(&GrappleFrame::new_extended(id.to_raw(), &[0, 1, 2]), &ctx);

        assert!(state.measurement.read().value.is_none());
        assert_eq!(ctx.metrics.snapshot().frames_malformed, 1);
    }

    #[test]
    fn test_unregistered_and_foreign_frames_ignored() {
        let (ctx, _state) = context_with_laser();
        let other = CanAddress::new(5).unwrap();
        let frame = LaserCanMessage::Measurement(measurement()).to_frame(other).unwrap();
        dispatch_frame(&frame, &ctx);
        dispatch_frame(&GrappleFrame::new_standard(0x123, &[1]), &ctx);

        assert_eq!(ctx.metrics.snapshot().frames_ignored, 2);
    }

    #[test]
    fn test_ack_completes_pending_request() {
        let (ctx, _state) = context_with_laser();
        let request = LaserCanMessage::SetTimingBudget(TimingBudget::Ms50);
        let ack_id = request.message_id(address()).ack().to_raw();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let token = ctx.pending.insert(ack_id, tx);

        let ack = LaserCanMessage::Ack {
            command: LaserCanCommand::SetTimingBudget,
            status: AckStatus::Rejected(NonZeroU8::new(5).unwrap()),
        };
        dispatch_frame(&ack.to_frame(address()).unwrap(), &ctx);

        assert_eq!(rx.try_recv(), Ok(AckStatus::Rejected(NonZeroU8::new(5).unwrap())));
        ctx.pending.remove(ack_id, token);
        assert!(ctx.pending.is_empty());
    }

    #[test]
    fn test_pending_requests_queue_per_ack_id() {
        let pending = Arc::new(PendingRequests::default());
        let (tx_a, rx_a) = crossbeam_channel::bounded(1);
        let token_a = pending.insert(0x42, tx_a);

        let queued = {
            let pending = pending.clone();
            std::thread::spawn(move || {
                let (tx_b, rx_b) = crossbeam_channel::bounded(1);
                let token_b = pending.insert(0x42, tx_b);
                (token_b, rx_b)
            })
        };

        // B 在 A 移除前不能登记，ack 只会交给 A
        std::thread::sleep(Duration::from_millis(20));
        assert!(!queued.is_finished());
        assert!(pending.complete(0x42, AckStatus::Accepted));
        assert_eq!(rx_a.try_recv(), Ok(AckStatus::Accepted));

        pending.remove(0x42, token_a);
        let (token_b, rx_b) = queued.join().unwrap();
        assert_ne!(token_a, token_b);

        // 过期令牌不会移除别人的条目
        pending.remove(0x42, token_a);
        assert_eq!(pending.len(), 1);
        let rejected = AckStatus::Rejected(NonZeroU8::MIN);
        assert!(pending.complete(0x42, rejected));
        assert_eq!(rx_b.try_recv(), Ok(rejected));
        pending.remove(0x42, token_b);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_io_loop_drains_and_exits_on_disconnect() {
        let (ctx, state) = context_with_laser();
        let mut adapter = MockCanAdapter::new();
        adapter
            .receive_queue
            .push_back(LaserCanMessage::Measurement(measurement()).to_frame(address()).unwrap());
        let sent = adapter.sent_frames.clone();
        let closed = adapter.closed.clone();

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(8);
        let is_running = Arc::new(AtomicBool::new(true));
        cmd_tx.send(GrappleFrame::new_extended(0x1, &[1])).unwrap();

        let handle = {
            let ctx = ctx.clone();
            let is_running = is_running.clone();
            std::thread::spawn(move || {
                io_loop(adapter, cmd_rx, ctx, is_running, Duration::from_millis(1))
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(cmd_tx);
        handle.join().unwrap();

        assert_eq!(sent.lock().len(), 1);
        assert!(closed.load(Ordering::Acquire));
        assert!(!is_running.load(Ordering::Acquire));
        assert!(state.measurement.read().is_valid());
        assert_eq!(ctx.metrics.snapshot().frames_sent, 1);
    }

    #[test]
    fn test_io_loop_stops_on_fatal_error() {
        struct BusOffAdapter;
        impl CanAdapter for BusOffAdapter {
            fn send(&mut self, _frame: GrappleFrame) -> Result<(), CanError> {
                Ok(())
            }
            fn receive(&mut self) -> Result<GrappleFrame, CanError> {
                Err(CanError::BusOff)
            }
        }

        let ctx = Arc::new(BusContext::new());
        let (_cmd_tx, cmd_rx) = crossbeam_channel::bounded(1);
        let is_running = Arc::new(AtomicBool::new(true));
        io_loop(BusOffAdapter, cmd_rx, ctx.clone(), is_running.clone(), Duration::from_millis(1));

        assert!(!is_running.load(Ordering::Acquire));
        assert_eq!(ctx.metrics.snapshot().receive_errors, 1);
    }
}
