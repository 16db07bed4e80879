//! Grapple 桥接工具主入口
//!
//! - `serve`: 把本地 CAN 总线（SocketCAN 或仿真设备）通过 TCP 暴露出去
//! - `monitor`: 经由 TCP 桥连接远端总线并打印 LaserCAN 测量

mod monitor;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[command(name = "grapple-bridge")]
#[command(about = "TCP bridge and monitor for Grapple CAN devices", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行 TCP 桥服务端
    Serve(serve::ServeArgs),

    /// 连接桥并打印测量
    Monitor(monitor::MonitorArgs),
}

fn main() -> Result<()> {
    grapple_sdk::init_logging();

    let cli = Cli::parse();

    // Ctrl+C 优雅退出
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Received interrupt signal, shutting down");
            shutdown.store(true, Ordering::Release);
        })?;
    }

    match cli.command {
        Commands::Serve(args) => serve::run(args, &shutdown),
        Commands::Monitor(args) => monitor::run(args, &shutdown),
    }
}
