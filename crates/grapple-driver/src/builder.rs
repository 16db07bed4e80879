//! Builder 模块
//!
//! 提供链式构造 `CanBus` 的方式，并保证同一进程内每个物理传输只打开一次。

use crate::bus::CanBus;
use crate::config::DriverConfig;
use crate::error::DriverError;
use grapple_can::{TcpBridgeAdapter, VirtualBus};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{debug, info};

#[cfg(target_os = "linux")]
use grapple_can::SocketCanAdapter;

/// 进程级已打开传输表
static OPEN_TRANSPORTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn open_transports() -> &'static Mutex<HashSet<String>> {
    OPEN_TRANSPORTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// 对某个传输的独占占用，drop 时释放
#[derive(Debug)]
pub(crate) struct TransportClaim {
    key: String,
}

impl TransportClaim {
    /// # 错误
    /// - `DriverError::BusAlreadyOpen`: 该传输已被本进程中的另一条总线占用
    pub(crate) fn acquire(key: &str) -> Result<Self, DriverError> {
        if !open_transports().lock().insert(key.to_string()) {
            return Err(DriverError::BusAlreadyOpen(key.to_string()));
        }
        debug!("Claimed transport '{}'", key);
        Ok(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for TransportClaim {
    fn drop(&mut self) {
        open_transports().lock().remove(&self.key);
        debug!("Released transport '{}'", self.key);
    }
}

/// 传输选择
#[derive(Debug, Clone)]
enum Transport {
    #[cfg(target_os = "linux")]
    SocketCan(String),
    TcpBridge(SocketAddr),
    Virtual(VirtualBus),
}

impl Transport {
    fn key(&self) -> String {
        match self {
            #[cfg(target_os = "linux")]
            Transport::SocketCan(iface) => format!("socketcan:{}", iface),
            Transport::TcpBridge(addr) => format!("tcp:{}", addr),
            Transport::Virtual(_) => "virtual".to_string(),
        }
    }
}

/// Bus Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use grapple_driver::{BusBuilder, DriverConfig};
///
/// let bus = BusBuilder::new()
///     .tcp_bridge("127.0.0.1:8006".parse().unwrap())
///     .config(DriverConfig::default())
///     .build()
///     .unwrap();
/// let sensor = bus.lasercan(1).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct BusBuilder {
    transport: Option<Transport>,
    config: Option<DriverConfig>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用 SocketCAN 接口（Linux）
    #[cfg(target_os = "linux")]
    pub fn socketcan(mut self, iface: impl Into<String>) -> Self {
        self.transport = Some(Transport::SocketCan(iface.into()));
        self
    }

    /// 通过 TCP 桥连接远端总线
    pub fn tcp_bridge(mut self, addr: SocketAddr) -> Self {
        self.transport = Some(Transport::TcpBridge(addr));
        self
    }

    /// 接入进程内虚拟总线（测试与仿真）
    pub fn virtual_bus(mut self, bus: &VirtualBus) -> Self {
        self.transport = Some(Transport::Virtual(bus.clone()));
        self
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 构建总线
    ///
    /// 未指定传输时，Linux 上默认使用 `can0`。
    ///
    /// # 错误
    /// - `DriverError::BusAlreadyOpen`: 传输已被本进程占用
    /// - `DriverError::Transport`: 打开适配器失败
    /// - `DriverError::Config`: 配置校验失败，或当前平台没有默认传输
    pub fn build(self) -> Result<CanBus, DriverError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Self::default_transport()?,
        };
        let key = transport.key();

        // 虚拟总线可以任意多次接入
        let claim = match transport {
            Transport::Virtual(_) => None,
            _ => Some(TransportClaim::acquire(&key)?),
        };

        let bus = match transport {
            #[cfg(target_os = "linux")]
            Transport::SocketCan(iface) => {
                CanBus::start(SocketCanAdapter::new(&iface)?, config, key, claim)?
            },
            Transport::TcpBridge(addr) => {
                CanBus::start(TcpBridgeAdapter::connect(addr)?, config, key, claim)?
            },
            Transport::Virtual(virtual_bus) => {
                CanBus::start(virtual_bus.attach(), config, key, claim)?
            },
        };

        info!("Opened bus '{}'", bus.name());
        Ok(bus)
    }

    #[cfg(target_os = "linux")]
    fn default_transport() -> Result<Transport, DriverError> {
        Ok(Transport::SocketCan("can0".to_string()))
    }

    #[cfg(not(target_os = "linux"))]
    fn default_transport() -> Result<Transport, DriverError> {
        Err(DriverError::Config(
            "No transport selected and no default available on this platform".to_string(),
        ))
    }
}

/// 仅供测试：当前是否占用了某个传输
#[cfg(test)]
pub(crate) fn is_claimed(key: &str) -> bool {
    open_transports().lock().contains(key)
}
