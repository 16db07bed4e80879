//! # Grapple CAN Adapter Layer
//!
//! CAN 硬件抽象层，提供统一的 CAN 接口抽象。
//!
//! ## 传输
//!
//! - `socketcan`: Linux SocketCAN（仅 Linux）
//! - `virtual_bus`: 进程内虚拟总线（桌面测试、仿真）
//! - `tcp_bridge`: 通过 TCP 隧道访问远端总线（客户端 + 服务端）

use std::time::Duration;
use thiserror::Error;

// 重新导出 grapple-protocol 中的 GrappleFrame
pub use grapple_protocol::GrappleFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

pub mod tcp_bridge;
pub mod virtual_bus;

pub use tcp_bridge::{BridgeServer, TcpBridgeAdapter, TcpBridgeRx, TcpBridgeTx};
pub use virtual_bus::{VirtualBus, VirtualCanAdapter};

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
    #[error("Transport closed")]
    Closed,
}

impl CanError {
    /// 是否为不可恢复错误（继续读写没有意义）
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Closed | CanError::BusOff | CanError::BufferOverflow => true,
            CanError::Device(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    UnsupportedConfig,
    InvalidResponse,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

pub trait CanAdapter {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<GrappleFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<GrappleFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<GrappleFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
    fn send_timeout(&mut self, frame: GrappleFrame, _timeout: Duration) -> Result<(), CanError> {
        self.send(frame)
    }

    /// 惰性遍历当前已到达的帧（不阻塞）
    ///
    /// 每次调用都会重新开始；遇到第一个“无帧”即结束，错误只产出一次。
    fn poll(&mut self) -> PollFrames<'_, Self>
    where
        Self: Sized,
    {
        PollFrames::new(self)
    }

    /// 关闭传输（幂等），之后的发送返回 `CanError::Closed`
    fn close(&mut self) -> Result<(), CanError> {
        Ok(())
    }
}

impl<A: CanAdapter + ?Sized> CanAdapter for Box<A> {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError> {
        (**self).send(frame)
    }
    fn receive(&mut self) -> Result<GrappleFrame, CanError> {
        (**self).receive()
    }
    fn set_receive_timeout(&mut self, timeout: Duration) {
        (**self).set_receive_timeout(timeout)
    }
    fn receive_timeout(&mut self, timeout: Duration) -> Result<GrappleFrame, CanError> {
        (**self).receive_timeout(timeout)
    }
    fn try_receive(&mut self) -> Result<Option<GrappleFrame>, CanError> {
        (**self).try_receive()
    }
    fn send_timeout(&mut self, frame: GrappleFrame, timeout: Duration) -> Result<(), CanError> {
        (**self).send_timeout(frame, timeout)
    }
    fn close(&mut self) -> Result<(), CanError> {
        (**self).close()
    }
}

/// `CanAdapter::poll()` 返回的迭代器
pub struct PollFrames<'a, A: CanAdapter + ?Sized> {
    adapter: &'a mut A,
    done: bool,
}

impl<'a, A: CanAdapter + ?Sized> PollFrames<'a, A> {
    pub fn new(adapter: &'a mut A) -> Self {
        Self {
            adapter,
            done: false,
        }
    }
}

impl<A: CanAdapter + ?Sized> Iterator for PollFrames<'_, A> {
    type Item = Result<GrappleFrame, CanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.adapter.try_receive() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

pub trait RxAdapter {
    fn receive(&mut self) -> Result<GrappleFrame, CanError>;
}

pub trait TxAdapter {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError>;
}

pub trait SplittableAdapter: CanAdapter {
    type RxAdapter: RxAdapter;
    type TxAdapter: TxAdapter;
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}
