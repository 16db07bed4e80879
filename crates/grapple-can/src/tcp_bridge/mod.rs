//! TCP 桥接传输
//!
//! 把原始 CAN 帧封装成长度前缀记录，通过 TCP 在两台主机之间转发：
//!
//! - `TcpBridgeAdapter`: 客户端，实现 `CanAdapter`，可以像本地总线一样使用
//! - `BridgeServer`: 服务端，一次服务一个客户端，在 socket 与本地总线之间双向转发

pub mod protocol;

use crate::{CanAdapter, CanError, GrappleFrame, RxAdapter, SplittableAdapter, TxAdapter};
use bytes::{Buf, BytesMut};
use protocol::{RecordDecoder, encode_record};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub use protocol::DEFAULT_PORT;

const READ_CHUNK: usize = 512;

/// 服务端写缓冲上限，超过后丢弃新帧（客户端过慢）
const MAX_PENDING_OUTPUT: usize = 64 * 1024;

/// 服务端空闲时的休眠间隔
const IDLE_SLEEP: Duration = Duration::from_millis(1);

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// 从流中读一次并喂给解码器
///
/// `timeout` 为零时以非阻塞方式读取。对端关闭返回 `CanError::Closed`。
fn fill_decoder(
    stream: &mut TcpStream,
    decoder: &mut RecordDecoder,
    timeout: Duration,
) -> Result<(), CanError> {
    let mut chunk = [0u8; READ_CHUNK];
    let result = if timeout.is_zero() {
        stream.set_nonblocking(true)?;
        let result = stream.read(&mut chunk);
        stream.set_nonblocking(false)?;
        result
    } else {
        stream.set_read_timeout(Some(timeout))?;
        stream.read(&mut chunk)
    };

    match result {
        Ok(0) => Err(CanError::Closed),
        Ok(n) => {
            decoder.extend(&chunk[..n]);
            Ok(())
        },
        Err(e) if is_timeout(&e) => Err(CanError::Timeout),
        Err(e) => Err(CanError::Io(e)),
    }
}

fn write_frame(stream: &mut TcpStream, buf: &mut BytesMut, frame: &GrappleFrame) -> Result<(), CanError> {
    buf.clear();
    encode_record(frame, buf);
    stream.write_all(buf)?;
    Ok(())
}

/// TCP 桥客户端
///
/// # 示例
///
/// ```no_run
/// use grapple_can::{CanAdapter, TcpBridgeAdapter};
///
/// let mut adapter = TcpBridgeAdapter::connect("10.0.0.2:8006").unwrap();
/// let frame = adapter.receive().unwrap();
/// ```
pub struct TcpBridgeAdapter {
    /// `None` 表示已关闭
    stream: Option<TcpStream>,
    peer: SocketAddr,
    decoder: RecordDecoder,
    write_buf: BytesMut,
    read_timeout: Duration,
}

impl TcpBridgeAdapter {
    /// 连接到桥服务端
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, CanError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// 基于已建立的连接创建
    pub fn from_stream(stream: TcpStream) -> Result<Self, CanError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        trace!("TCP bridge connected to {}", peer);

        Ok(Self {
            stream: Some(stream),
            peer,
            decoder: RecordDecoder::new(),
            write_buf: BytesMut::with_capacity(64),
            read_timeout: Duration::from_millis(2),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 解码器重新同步次数
    pub fn resync_events(&self) -> u64 {
        self.decoder.resync_events()
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            trace!("TCP bridge connection to {} closed", self.peer);
        }
    }
}

impl CanAdapter for TcpBridgeAdapter {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError> {
        let stream = self.stream.as_mut().ok_or(CanError::Closed)?;
        write_frame(stream, &mut self.write_buf, &frame)?;
        trace!("Bridged frame sent: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&mut self) -> Result<GrappleFrame, CanError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            let stream = self.stream.as_mut().ok_or(CanError::Closed)?;
            match fill_decoder(stream, &mut self.decoder, self.read_timeout) {
                Ok(()) => {},
                Err(CanError::Closed) => {
                    debug!("TCP bridge peer {} closed the connection", self.peer);
                    self.shutdown();
                    return Err(CanError::Closed);
                },
                Err(e) => return Err(e),
            }
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
        self.shutdown();
        Ok(())
    }
}

impl Drop for TcpBridgeAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// TCP 桥接收端（分离后）
pub struct TcpBridgeRx {
    stream: TcpStream,
    decoder: RecordDecoder,
    read_timeout: Duration,
}

impl RxAdapter for TcpBridgeRx {
    fn receive(&mut self) -> Result<GrappleFrame, CanError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            fill_decoder(&mut self.stream, &mut self.decoder, self.read_timeout)?;
        }
    }
}

/// TCP 桥发送端（分离后）
pub struct TcpBridgeTx {
    stream: TcpStream,
    write_buf: BytesMut,
}

impl TxAdapter for TcpBridgeTx {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError> {
        write_frame(&mut self.stream, &mut self.write_buf, &frame)
    }
}

impl Drop for TcpBridgeTx {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

impl SplittableAdapter for TcpBridgeAdapter {
    type RxAdapter = TcpBridgeRx;
    type TxAdapter = TcpBridgeTx;

    /// 分离为独立的 RX 和 TX 半部（共享同一连接）
    ///
    /// 已缓存但未解析的字节会随 RX 半部一起转移。
    fn split(mut self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let stream = self.stream.take().ok_or(CanError::Closed)?;
        let tx_stream = stream.try_clone()?;

        let rx = TcpBridgeRx {
            stream,
            decoder: std::mem::take(&mut self.decoder),
            read_timeout: self.read_timeout,
        };
        let tx = TcpBridgeTx {
            stream: tx_stream,
            write_buf: BytesMut::with_capacity(64),
        };
        Ok((rx, tx))
    }
}

/// 单个会话的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// socket → 本地总线
    pub frames_to_bus: u64,
    /// 本地总线 → socket
    pub frames_to_client: u64,
    /// 因客户端过慢而丢弃的帧
    pub frames_dropped: u64,
    /// 解码器重新同步次数
    pub resync_events: u64,
}

/// TCP 桥服务端
///
/// 一次服务一个客户端；会话结束后可以继续接受下一个。
pub struct BridgeServer {
    listener: TcpListener,
}

impl BridgeServer {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, CanError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("TCP bridge listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CanError> {
        Ok(self.listener.local_addr()?)
    }

    /// 等待并服务一个客户端
    ///
    /// # 返回
    /// - `Ok(None)`: 客户端连接前收到关闭信号
    /// - `Ok(Some(stats))`: 会话结束（客户端断开、I/O 错误或关闭信号）
    /// - `Err`: 本地总线不可恢复错误
    pub fn serve_one<A: CanAdapter + ?Sized>(
        &self,
        can: &mut A,
        shutdown: &AtomicBool,
    ) -> Result<Option<SessionStats>, CanError> {
        let (stream, peer) = loop {
            if shutdown.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok(conn) => break conn,
                Err(e) if is_timeout(&e) => {
                    // 等待客户端期间丢弃本地总线流量
                    while let Ok(Some(_)) = can.try_receive() {}
                    spin_sleep::sleep(IDLE_SLEEP);
                },
                Err(e) => return Err(CanError::Io(e)),
            }
        };

        info!("TCP bridge client connected: {}", peer);
        let stats = Self::run_session(stream, can, shutdown)?;
        info!(
            "TCP bridge client {} disconnected (to bus: {}, to client: {}, dropped: {}, resync: {})",
            peer,
            stats.frames_to_bus,
            stats.frames_to_client,
            stats.frames_dropped,
            stats.resync_events
        );
        Ok(Some(stats))
    }

    /// 循环服务客户端，直到收到关闭信号（`forever == false` 时只服务一个）
    pub fn serve<A: CanAdapter + ?Sized>(
        &self,
        can: &mut A,
        shutdown: &AtomicBool,
        forever: bool,
    ) -> Result<(), CanError> {
        loop {
            if self.serve_one(can, shutdown)?.is_none() || !forever {
                return Ok(());
            }
        }
    }

    fn run_session<A: CanAdapter + ?Sized>(
        mut stream: TcpStream,
        can: &mut A,
        shutdown: &AtomicBool,
    ) -> Result<SessionStats, CanError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mut stats = SessionStats::default();
        let mut decoder = RecordDecoder::new();
        let mut pending = BytesMut::with_capacity(1024);
        let mut chunk = [0u8; READ_CHUNK];

        while !shutdown.load(Ordering::Acquire) {
            let mut busy = false;

            // 1. socket → 本地总线
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    busy = true;
                    decoder.extend(&chunk[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        match can.send(frame) {
                            Ok(()) => stats.frames_to_bus += 1,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => warn!("Failed to forward frame 0x{:X} to bus: {}", frame.id, e),
                        }
                    }
                },
                Err(e) if is_timeout(&e) => {},
                Err(e) => {
                    warn!("TCP bridge session read error: {}", e);
                    break;
                },
            }

            // 2. 本地总线 → socket
            loop {
                match can.try_receive() {
                    Ok(Some(frame)) => {
                        busy = true;
                        if pending.len() >= MAX_PENDING_OUTPUT {
                            stats.frames_dropped += 1;
                            continue;
                        }
                        encode_record(&frame, &mut pending);
                        stats.frames_to_client += 1;
                    },
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Local bus receive error: {}", e);
                        break;
                    },
                }
            }

            // 3. 刷新写缓冲
            if !pending.is_empty() {
                match stream.write(&pending) {
                    Ok(n) => pending.advance(n),
                    Err(e) if is_timeout(&e) => {},
                    Err(e) => {
                        warn!("TCP bridge session write error: {}", e);
                        break;
                    },
                }
            }

            if !busy {
                spin_sleep::sleep(IDLE_SLEEP);
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        stats.resync_events = decoder.resync_events();
        Ok(stats)
    }
}
