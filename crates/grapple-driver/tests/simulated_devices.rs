//! 端到端集成测试
//!
//! 仿真设备与驱动接在同一条虚拟总线上，验证配置 ack、测量上报、
//! 缓存过期和关闭语义。

use grapple_can::VirtualBus;
use grapple_driver::sim;
use grapple_driver::*;
use grapple_protocol::CanAddress;
use grapple_protocol::lasercan::{RangingMode, RegionOfInterest, TimingBudget};
use serial_test::serial;
use std::num::NonZeroU8;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn address(value: u8) -> CanAddress {
    CanAddress::new(value).unwrap()
}

/// 轮询直到条件成立或超时
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn lasercan_measurements_reach_cache() {
    let virtual_bus = VirtualBus::new();
    let _sim = sim::spawn(
        vec![Box::new(SimulatedLaserCan::new(address(4)).with_distance_mm(750))],
        virtual_bus.attach(),
        Duration::from_millis(5),
    )
    .unwrap();

    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let sensor = bus.lasercan(4).unwrap();

    assert!(wait_until(|| sensor.get_measurement().is_some()));
    let measurement = sensor.get_measurement().unwrap();
    assert_eq!(measurement.distance_mm, 750);
    assert!((measurement.distance_m() - 0.75).abs() < 0.0005);
    assert!(bus.metrics().frames_received > 0);
}

#[test]
fn lasercan_configuration_is_acknowledged() {
    let virtual_bus = VirtualBus::new();
    let _sim = sim::spawn(
        vec![Box::new(SimulatedLaserCan::new(address(4)))],
        virtual_bus.attach(),
        Duration::from_millis(2),
    )
    .unwrap();

    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let sensor = bus.lasercan(4).unwrap();

    sensor.set_ranging_mode(RangingMode::Long).unwrap();
    sensor.set_timing_budget_ms(100).unwrap();
    let roi = RegionOfInterest::new(7, 7, 8, 8).unwrap();
    sensor.set_roi(roi).unwrap();

    let config = sensor.requested_config();
    assert_eq!(config.ranging_mode, RangingMode::Long);
    assert_eq!(config.timing_budget, TimingBudget::Ms100);
    assert_eq!(config.roi, roi);

    // 设备上报的测量会反映已应用的配置
    assert!(wait_until(|| {
        sensor
            .get_measurement()
            .is_some_and(|m| m.timing_budget == TimingBudget::Ms100 && m.roi == roi)
    }));
    assert!(bus.metrics().acks_received >= 3);
}

#[test]
fn rejected_configuration_surfaces_code() {
    let virtual_bus = VirtualBus::new();
    let mut device = SimulatedLaserCan::new(address(9));
    device.reject_next_config(NonZeroU8::new(7).unwrap());
    let _sim = sim::spawn(vec![Box::new(device)], virtual_bus.attach(), Duration::from_millis(2))
        .unwrap();

    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let sensor = bus.lasercan(9).unwrap();

    assert!(matches!(
        sensor.set_timing_budget(TimingBudget::Ms20),
        Err(DriverError::Rejected { code: 7 })
    ));
    assert_eq!(sensor.requested_config().timing_budget, TimingBudget::Ms33);

    sensor.set_timing_budget(TimingBudget::Ms20).unwrap();
    assert_eq!(sensor.requested_config().timing_budget, TimingBudget::Ms20);
}

#[test]
fn mitocandria_channels_and_setters() {
    let virtual_bus = VirtualBus::new();
    let mut device = SimulatedMitoCandria::new(address(2));
    device.set_load_ma(grapple_protocol::mitocandria::Channel::FiveVoltA, 800);
    let _sim = sim::spawn(vec![Box::new(device)], virtual_bus.attach(), Duration::from_millis(2))
        .unwrap();

    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let pdm = bus.mitocandria(2).unwrap();

    assert!(wait_until(|| pdm.is_online()));
    assert!(wait_until(|| pdm.channel_current(2).unwrap() == Some(0.8)));

    pdm.set_channel_voltage(4, 9.5).unwrap();
    assert!(wait_until(|| pdm.channel_voltage_setpoint(4).unwrap() == Some(9.5)));

    pdm.set_channel_enabled(3, false).unwrap();
    assert!(wait_until(|| pdm.channel_enabled(3).unwrap() == Some(false)));
    assert_eq!(pdm.channel_voltage(0).unwrap(), Some(5.0));
}

#[test]
fn two_device_kinds_share_one_bus() {
    let virtual_bus = VirtualBus::new();
    let _sim = sim::spawn(
        vec![
            Box::new(SimulatedLaserCan::new(address(1)).with_distance_mm(300)),
            Box::new(SimulatedMitoCandria::new(address(2))),
        ],
        virtual_bus.attach(),
        Duration::from_millis(5),
    )
    .unwrap();

    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let sensor = bus.lasercan(1).unwrap();
    let pdm = bus.mitocandria(2).unwrap();

    assert!(matches!(
        bus.lasercan(2),
        Err(DriverError::DuplicateAddress { .. })
    ));
    assert!(wait_until(|| sensor.get_measurement().is_some() && pdm.is_online()));
    assert_eq!(bus.devices().len(), 2);
}

#[test]
fn cache_goes_stale_after_silence() {
    let virtual_bus = VirtualBus::new();
    let sim = sim::spawn(
        vec![Box::new(SimulatedLaserCan::new(address(6)))],
        virtual_bus.attach(),
        Duration::from_millis(5),
    )
    .unwrap();

    let config = DriverConfig {
        stale_timeout_ms: 100,
        ..Default::default()
    };
    let bus = BusBuilder::new()
        .virtual_bus(&virtual_bus)
        .config(config)
        .build()
        .unwrap();
    let sensor = bus.lasercan(6).unwrap();

    assert!(wait_until(|| sensor.measurement().is_valid()));
    sim.stop();

    // 超时之前仍然新鲜
    assert!(!sensor.measurement().is_stale());

    assert!(wait_until(|| sensor.measurement().is_stale()));
    let reading = sensor.measurement();
    assert_eq!(reading.freshness, Freshness::Stale);
    assert!(reading.value.is_some());
    assert!(sensor.get_measurement().is_none());
}

#[test]
fn close_fails_pending_and_later_calls() {
    let virtual_bus = VirtualBus::new();
    let bus = BusBuilder::new().virtual_bus(&virtual_bus).build().unwrap();
    let sensor = bus.lasercan(4).unwrap();

    bus.close();
    assert!(!bus.is_running());
    let err = sensor.set_ranging_mode(RangingMode::Long).unwrap_err();
    assert!(err.is_closed(), "{:?}", err);

    // 关闭后适配器已断开
    assert_eq!(virtual_bus.endpoint_count(), 0);
}

#[test]
#[serial]
fn tcp_bridge_end_to_end() {
    use grapple_can::BridgeServer;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    let virtual_bus = VirtualBus::new();
    let _sim = sim::spawn(
        vec![Box::new(SimulatedLaserCan::new(address(5)).with_distance_mm(420))],
        virtual_bus.attach(),
        Duration::from_millis(5),
    )
    .unwrap();

    let server = BridgeServer::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let server_thread = {
        let shutdown = shutdown.clone();
        let mut local = virtual_bus.attach();
        std::thread::spawn(move || server.serve_one(&mut local, &shutdown))
    };

    let bus = BusBuilder::new().tcp_bridge(addr).build().unwrap();
    let sensor = bus.lasercan(5).unwrap();
    assert!(wait_until(|| sensor.get_measurement().is_some()));
    assert_eq!(sensor.get_measurement().unwrap().distance_mm, 420);

    sensor.set_ranging_mode(RangingMode::Long).unwrap();

    // 重复打开同一远端地址
    assert!(matches!(
        BusBuilder::new().tcp_bridge(addr).build(),
        Err(DriverError::BusAlreadyOpen(_))
    ));

    drop(sensor);
    bus.close();
    shutdown.store(true, Ordering::Release);
    assert!(server_thread.join().unwrap().is_ok());
}
