//! `monitor` 子命令

use anyhow::{Context, Result};
use clap::Args;
use grapple_driver::{BusBuilder, DriverConfig, Freshness, Rangefinder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// 桥地址（HOST:PORT）
    #[arg(long)]
    pub connect: SocketAddr,

    /// LaserCAN 地址
    #[arg(long, value_name = "ID")]
    pub lasercan: u8,

    /// 打印间隔（毫秒）
    #[arg(long, default_value = "100")]
    pub interval_ms: u64,

    /// 驱动配置文件（TOML）
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn run(args: MonitorArgs, shutdown: &AtomicBool) -> Result<()> {
    let config = match &args.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };

    let bus = BusBuilder::new()
        .tcp_bridge(args.connect)
        .config(config)
        .build()
        .with_context(|| format!("Failed to connect to bridge at {}", args.connect))?;
    let sensor = bus.lasercan(args.lasercan)?;
    info!("Monitoring LaserCAN {} via {}", sensor.address(), args.connect);

    let interval = Duration::from_millis(args.interval_ms.max(1));
    while !shutdown.load(Ordering::Acquire) {
        if !bus.is_running() {
            warn!("Connection to bridge lost");
            break;
        }

        let reading = sensor.measurement();
        match (reading.freshness, reading.value) {
            (Freshness::Valid, Some(m)) => info!(
                "distance={:.3}m status={:?} ambient={} mode={:?} budget={}ms",
                m.distance_m(),
                m.status,
                m.ambient,
                m.ranging_mode,
                m.timing_budget.as_ms()
            ),
            (Freshness::Stale, Some(m)) => warn!(
                "stale: last distance={:.3}m ({:?} ago)",
                m.distance_m(),
                reading.age.unwrap_or_default()
            ),
            _ => info!("waiting for first measurement"),
        }

        std::thread::sleep(interval);
    }

    let metrics = bus.metrics();
    info!(
        "received={} malformed={} ignored={}",
        metrics.frames_received, metrics.frames_malformed, metrics.frames_ignored
    );
    Ok(())
}
