//! 驱动层错误类型定义

use grapple_can::CanError;
use grapple_protocol::{CanAddress, ConfigError, DeviceKind, ProtocolError};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误（总线不可用、已关闭、I/O 失败）
    #[error("CAN transport error: {0}")]
    Transport(#[from] CanError),

    /// 地址已被占用
    #[error("Address {address} is already registered by a {existing} device")]
    DuplicateAddress {
        address: CanAddress,
        existing: DeviceKind,
    },

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 配置超出有效范围（未产生任何总线写入）
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    /// 设备拒绝了配置请求
    #[error("Device rejected the request (code {code})")]
    Rejected { code: u8 },

    /// 操作超时（如等待 ack）
    #[error("Operation timeout")]
    Timeout,

    /// 设备离线（没有新鲜的状态帧）
    #[error("Device is offline")]
    DeviceOffline,

    /// 通道号无效
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    /// 同一个传输已被本进程打开
    #[error("Bus '{0}' is already open in this process")]
    BusAlreadyOpen(String),

    /// 命令通道已关闭（IO 线程退出）
    #[error("Command channel closed")]
    ChannelClosed,

    /// 命令通道已满
    #[error("Command channel full")]
    ChannelFull,

    /// 驱动配置错误（加载、解析或校验失败）
    #[error("Driver config error: {0}")]
    Config(String),
}

impl DriverError {
    /// 总线已关闭
    pub(crate) fn closed() -> Self {
        DriverError::Transport(CanError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            DriverError::Transport(CanError::Closed) | DriverError::ChannelClosed
        )
    }
}
