//! `serve` 子命令

use anyhow::{Context, Result};
use clap::Args;
use grapple_can::{BridgeServer, CanAdapter, VirtualBus};
use grapple_driver::sim::{self, SimulatedDevice};
use grapple_driver::{SimulatedLaserCan, SimulatedMitoCandria};
use grapple_protocol::CanAddress;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{info, warn};

/// 仿真设备的上报周期
const SIMULATION_PERIOD: Duration = Duration::from_millis(20);

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// 监听地址
    #[arg(long, default_value = "0.0.0.0:8006")]
    pub listen: SocketAddr,

    /// SocketCAN 接口（默认 can0）
    #[arg(long, conflicts_with = "simulate")]
    pub iface: Option<String>,

    /// 不使用硬件，在虚拟总线上运行仿真设备
    #[arg(long)]
    pub simulate: bool,

    /// 仿真 LaserCAN 的地址（可重复）
    #[arg(long, value_name = "ID")]
    pub lasercan: Vec<u8>,

    /// 仿真 MitoCANdria 的地址（可重复）
    #[arg(long, value_name = "ID")]
    pub mitocandria: Vec<u8>,

    /// 只服务一个客户端后退出
    #[arg(long)]
    pub once: bool,
}

pub fn run(args: ServeArgs, shutdown: &AtomicBool) -> Result<()> {
    let server = BridgeServer::bind(args.listen)
        .with_context(|| format!("Failed to listen on {}", args.listen))?;

    if args.simulate {
        let devices = simulated_devices(&args)?;
        if devices.is_empty() {
            warn!("--simulate without --lasercan/--mitocandria: the bus will be silent");
        }

        let bus = VirtualBus::new();
        let _simulator = sim::spawn(devices, bus.attach(), SIMULATION_PERIOD)?;
        serve_on(&server, bus.attach(), shutdown, args.once)
    } else {
        if !args.lasercan.is_empty() || !args.mitocandria.is_empty() {
            warn!("Device IDs are only used with --simulate; ignoring");
        }
        let iface = args.iface.as_deref().unwrap_or("can0");
        serve_socketcan(&server, iface, shutdown, args.once)
    }
}

fn simulated_devices(args: &ServeArgs) -> Result<Vec<Box<dyn SimulatedDevice>>> {
    let mut devices: Vec<Box<dyn SimulatedDevice>> = Vec::new();
    for &id in &args.lasercan {
        let address = CanAddress::new(id).with_context(|| format!("--lasercan {}", id))?;
        info!("Simulating LaserCAN at address {}", address);
        devices.push(Box::new(SimulatedLaserCan::new(address).with_noise_mm(2)));
    }
    for &id in &args.mitocandria {
        let address = CanAddress::new(id).with_context(|| format!("--mitocandria {}", id))?;
        info!("Simulating MitoCANdria at address {}", address);
        devices.push(Box::new(SimulatedMitoCandria::new(address)));
    }
    Ok(devices)
}

#[cfg(target_os = "linux")]
fn serve_socketcan(
    server: &BridgeServer,
    iface: &str,
    shutdown: &AtomicBool,
    once: bool,
) -> Result<()> {
    let adapter = grapple_can::SocketCanAdapter::new(iface)
        .with_context(|| format!("Failed to open SocketCAN interface {}", iface))?;
    info!("Bridging SocketCAN interface {}", iface);
    serve_on(server, adapter, shutdown, once)
}

#[cfg(not(target_os = "linux"))]
fn serve_socketcan(
    _server: &BridgeServer,
    iface: &str,
    _shutdown: &AtomicBool,
    _once: bool,
) -> Result<()> {
    anyhow::bail!("SocketCAN ({}) is only available on Linux; use --simulate", iface)
}

fn serve_on<A: CanAdapter>(
    server: &BridgeServer,
    mut adapter: A,
    shutdown: &AtomicBool,
    once: bool,
) -> Result<()> {
    server.serve(&mut adapter, shutdown, !once)?;
    adapter.close()?;
    info!("Bridge stopped");
    Ok(())
}
