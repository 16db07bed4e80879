//! TCP 桥运行器
//!
//! 把一个本地 CAN 适配器通过 TCP 暴露给远端主机（默认端口 8006）。
//! 一次服务一个客户端，客户端断开后继续等待下一个。

use grapple_can::tcp_bridge::DEFAULT_PORT;
use grapple_can::{BridgeServer, CanAdapter, CanError};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{error, info};

/// 默认监听地址
pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

/// 在当前线程上运行桥，直到 `shutdown` 被置位
///
/// # 错误
/// - 监听失败或本地总线出现不可恢复错误
pub fn run_tcp_bridge<A>(
    addr: impl ToSocketAddrs,
    mut adapter: A,
    shutdown: &AtomicBool,
) -> Result<(), CanError>
where
    A: CanAdapter,
{
    let server = BridgeServer::bind(addr)?;
    let result = server.serve(&mut adapter, shutdown, true);
    adapter.close()?;
    result
}

/// 后台桥的句柄
///
/// drop 时停止桥并等待线程退出。
pub struct BridgeHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), CanError>>>,
}

impl BridgeHandle {
    /// 实际监听地址（绑定端口 0 时用于获取分配的端口）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// 停止并返回桥线程的结果
    pub fn stop(mut self) -> Result<(), CanError> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<(), CanError> {
        self.shutdown.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                error!("TCP bridge thread panicked");
                Err(CanError::Closed)
            }),
            None => Ok(()),
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_and_join() {
            error!("TCP bridge stopped with error: {}", e);
        }
    }
}

/// 在后台线程上运行桥
///
/// 监听在返回前完成，因此返回后即可连接。
pub fn run_tcp_bridge_in_background<A>(
    addr: impl ToSocketAddrs,
    mut adapter: A,
) -> Result<BridgeHandle, CanError>
where
    A: CanAdapter + Send + 'static,
{
    let server = BridgeServer::bind(addr)?;
    let local_addr = server.local_addr()?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let thread = {
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("grapple-bridge".to_string())
            .spawn(move || {
                let result = server.serve(&mut adapter, &shutdown, true);
                let _ = adapter.close();
                info!("TCP bridge on {} stopped", local_addr);
                result
            })?
    };

    Ok(BridgeHandle {
        local_addr,
        shutdown,
        thread: Some(thread),
    })
}
