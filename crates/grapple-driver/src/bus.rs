//! Bus API 模块
//!
//! 提供对外的 `CanBus` 结构体，封装底层 IO 线程和状态同步细节。

use crate::builder::TransportClaim;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::lasercan::LaserCan;
use crate::metrics::MetricsSnapshot;
use crate::mitocandria::MitoCandria;
use crate::pipeline::{BusContext, io_loop};
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use grapple_can::{CanAdapter, GrappleFrame};
use grapple_protocol::{AckStatus, CanAddress, DeviceKind, MessageId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: std::marker::Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // 看门狗线程负责 join，超时后它会继续在后台运行
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 总线内部状态（由 `CanBus` 与所有设备句柄共享）
pub(crate) struct BusInner {
    /// 命令发送通道；关闭时置为 `None`，使 IO 线程收到 `Disconnected`
    cmd_tx: Mutex<Option<Sender<GrappleFrame>>>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    is_running: Arc<AtomicBool>,
    pub(crate) ctx: Arc<BusContext>,
    pub(crate) config: DriverConfig,
    /// 进程级传输占用，关闭时释放
    claim: Mutex<Option<TransportClaim>>,
    name: String,
}

impl BusInner {
    pub(crate) fn send_frame(&self, frame: GrappleFrame) -> Result<(), DriverError> {
        if !self.is_running.load(Ordering::Acquire) {
            return Err(DriverError::closed());
        }
        let guard = self.cmd_tx.lock();
        let tx = guard.as_ref().ok_or_else(DriverError::closed)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DriverError::ChannelFull),
            Err(TrySendError::Disconnected(_)) => Err(DriverError::closed()),
        }
    }

    /// 发送配置帧并等待 ack（超时后重发）
    pub(crate) fn request(
        &self,
        frame: GrappleFrame,
        timeout: Duration,
        retries: u32,
    ) -> Result<AckStatus, DriverError> {
        let ack_id = MessageId::from_raw(frame.id).ack().to_raw();
        let (tx, rx) = crossbeam_channel::bounded(1);
        // 同一 ack ID 的请求在这里排队，ack 不会交错到别的调用方
        let token = self.ctx.pending.insert(ack_id, tx);

        let result = self.await_ack(frame, &rx, timeout, retries);
        self.ctx.pending.remove(ack_id, token);
        result
    }

    fn await_ack(
        &self,
        frame: GrappleFrame,
        rx: &crossbeam_channel::Receiver<AckStatus>,
        timeout: Duration,
        retries: u32,
    ) -> Result<AckStatus, DriverError> {
        for attempt in 0..=retries {
            self.send_frame(frame)?;
            match rx.recv_timeout(timeout) {
                Ok(status) => return Ok(status),
                Err(RecvTimeoutError::Timeout) => {
                    debug!(
                        "No ack for frame 0x{:X} (attempt {}/{})",
                        frame.id,
                        attempt + 1,
                        retries + 1
                    );
                },
                // IO 线程退出时会清空等待表
                Err(RecvTimeoutError::Disconnected) => return Err(DriverError::closed()),
            }
        }
        warn!("Request 0x{:X} timed out after {} attempts", frame.id, retries + 1);
        Err(DriverError::Timeout)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 关闭总线（幂等）
    pub(crate) fn close(&self) {
        self.is_running.store(false, Ordering::Release);

        // 必须在 join 之前 drop Sender，否则 IO 线程收不到 Disconnected
        let had_sender = self.cmd_tx.lock().take().is_some();

        let join_timeout = self.config.join_timeout();
        if let Some(handle) = self.io_thread.lock().take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!(
                "IO thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        }

        self.ctx.pending.fail_all();
        drop(self.claim.lock().take());

        if had_sender {
            info!("Bus '{}' closed", self.name);
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// CAN 总线驱动（对外 API）
///
/// 创建时启动唯一的 IO 线程，该线程独占适配器。
/// 设备句柄通过 `lasercan()` / `mitocandria()` 获取，可在任意线程使用。
///
/// # Example
///
/// ```rust
/// use grapple_can::VirtualBus;
/// use grapple_driver::{CanBus, DriverConfig, Rangefinder};
///
/// let virtual_bus = VirtualBus::new();
/// let bus = CanBus::new(virtual_bus.attach(), DriverConfig::default()).unwrap();
/// let sensor = bus.lasercan(5).unwrap();
/// assert!(sensor.get_measurement().is_none());
/// bus.close();
/// ```
pub struct CanBus {
    inner: Arc<BusInner>,
}

impl CanBus {
    /// 创建总线并启动 IO 线程
    ///
    /// # 错误
    /// - `DriverError::Config`: 配置校验失败
    pub fn new(
        can: impl CanAdapter + Send + 'static,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        Self::start(can, config, "anonymous".to_string(), None)
    }

    pub(crate) fn start(
        can: impl CanAdapter + Send + 'static,
        config: DriverConfig,
        name: String,
        claim: Option<TransportClaim>,
    ) -> Result<Self, DriverError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(config.command_queue_capacity);
        let ctx = Arc::new(BusContext::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let io_thread = {
            let ctx = ctx.clone();
            let is_running = is_running.clone();
            let receive_timeout = config.receive_timeout();
            std::thread::Builder::new()
                .name(format!("grapple-io-{}", name))
                .spawn(move || io_loop(can, cmd_rx, ctx, is_running, receive_timeout))
                .map_err(|e| DriverError::Config(format!("Failed to spawn IO thread: {}", e)))?
        };

        info!("Bus '{}' started", name);

        Ok(Self {
            inner: Arc::new(BusInner {
                cmd_tx: Mutex::new(Some(cmd_tx)),
                io_thread: Mutex::new(Some(io_thread)),
                is_running,
                ctx,
                config,
                claim: Mutex::new(claim),
                name,
            }),
        })
    }

    /// 总线名称（传输描述，如 `socketcan:can0`）
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// 发送原始帧（经由命令队列）
    ///
    /// # 错误
    /// - `DriverError::Transport(CanError::Closed)`: 总线已关闭
    /// - `DriverError::ChannelFull`: 命令队列已满
    pub fn send_frame(&self, frame: GrappleFrame) -> Result<(), DriverError> {
        self.inner.send_frame(frame)
    }

    /// 发送配置帧并等待设备 ack
    pub fn request(
        &self,
        frame: GrappleFrame,
        timeout: Duration,
        retries: u32,
    ) -> Result<AckStatus, DriverError> {
        self.inner.request(frame, timeout, retries)
    }

    /// 在本总线上注册 LaserCAN
    ///
    /// # 错误
    /// - `DriverError::InvalidConfiguration`: 地址超出 0..=62
    /// - `DriverError::DuplicateAddress`: 地址已被占用
    pub fn lasercan(&self, address: u8) -> Result<LaserCan, DriverError> {
        LaserCan::attach(self.inner.clone(), CanAddress::new(address)?)
    }

    /// 在本总线上注册 MitoCANdria
    pub fn mitocandria(&self, address: u8) -> Result<MitoCandria, DriverError> {
        MitoCandria::attach(self.inner.clone(), CanAddress::new(address)?)
    }

    /// 已注册设备
    pub fn devices(&self) -> Vec<(CanAddress, DeviceKind)> {
        self.inner.ctx.registry.devices()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.ctx.metrics.snapshot()
    }

    /// IO 线程是否仍在运行
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// 关闭总线（幂等）
    ///
    /// 停止 IO 线程、关闭适配器并释放传输占用；之后所有发送立即失败。
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        self.inner.close();
    }
}
