//! 设备仿真
//!
//! 设备侧模型：接在一个 `CanAdapter`（通常是虚拟总线端点）上，
//! 应答配置帧并周期性上报状态帧。用于测试和无硬件的桥接演示。

use grapple_can::{CanAdapter, CanError, GrappleFrame};
use grapple_protocol::lasercan::{
    LaserCanMessage, Measurement, MeasurementStatus, RangingMode, RegionOfInterest, TimingBudget,
};
use grapple_protocol::mitocandria::{
    ADJUSTABLE_VOLTAGE_MAX, Channel, ChannelStatus, MitoCandriaMessage,
};
use grapple_protocol::{AckStatus, CanAddress, DeviceKind};
use rand::Rng;
use std::num::NonZeroU8;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 短距模式下的最大量程（mm）
const SHORT_RANGE_MAX_MM: u16 = 1300;
/// 长距模式下的最大量程（mm）
const LONG_RANGE_MAX_MM: u16 = 4000;

/// 仿真设备
pub trait SimulatedDevice: Send {
    fn kind(&self) -> DeviceKind;

    fn address(&self) -> CanAddress;

    /// 处理一帧主机发来的帧，需要应答时返回 ack 帧
    fn handle_frame(&mut self, frame: &GrappleFrame) -> Option<GrappleFrame>;

    /// 本周期要上报的状态帧
    fn status_frames(&mut self) -> Vec<GrappleFrame>;

    /// 帧是否发往本设备的配置 API
    fn is_addressed_to_me(&self, frame: &GrappleFrame) -> bool {
        let id = frame.message_id();
        frame.is_extended
            && !id.ack_flag()
            && id.device_kind() == Some(self.kind())
            && id.address() == Some(self.address())
    }
}

/// 仿真 LaserCAN
#[derive(Debug, Clone)]
pub struct SimulatedLaserCan {
    address: CanAddress,
    /// 目标真实距离（mm）
    pub distance_mm: u16,
    /// 测量噪声幅度（±mm）
    pub noise_mm: u16,
    pub ambient: u16,
    pub ranging_mode: RangingMode,
    pub timing_budget: TimingBudget,
    pub roi: RegionOfInterest,
    reject_next: Option<NonZeroU8>,
}

impl SimulatedLaserCan {
    pub fn new(address: CanAddress) -> Self {
        Self {
            address,
            distance_mm: 500,
            noise_mm: 0,
            ambient: 0,
            ranging_mode: RangingMode::default(),
            timing_budget: TimingBudget::default(),
            roi: RegionOfInterest::default(),
            reject_next: None,
        }
    }

    pub fn with_distance_mm(mut self, distance_mm: u16) -> Self {
        self.distance_mm = distance_mm;
        self
    }

    pub fn with_noise_mm(mut self, noise_mm: u16) -> Self {
        self.noise_mm = noise_mm;
        self
    }

    /// 下一条配置命令以给定错误码拒绝
    pub fn reject_next_config(&mut self, code: NonZeroU8) {
        self.reject_next = Some(code);
    }

    fn max_range_mm(&self) -> u16 {
        match self.ranging_mode {
            RangingMode::Short => SHORT_RANGE_MAX_MM,
            RangingMode::Long => LONG_RANGE_MAX_MM,
        }
    }

    /// 生成一次测量
    pub fn measure(&self) -> Measurement {
        let noise = if self.noise_mm == 0 {
            0
        } else {
            let n = self.noise_mm as i32;
            rand::thread_rng().gen_range(-n..=n)
        };
        let raw = (self.distance_mm as i32 + noise).max(0) as u16;

        let (status, distance_mm) = if raw > self.max_range_mm() {
            (MeasurementStatus::OutOfBounds, self.max_range_mm())
        } else {
            (MeasurementStatus::Valid, raw)
        };

        Measurement {
            status,
            distance_mm,
            ambient: self.ambient,
            ranging_mode: self.ranging_mode,
            timing_budget: self.timing_budget,
            roi: self.roi,
        }
    }

    fn ack(&self, message: &LaserCanMessage, status: AckStatus) -> Option<GrappleFrame> {
        let command = message.command()?;
        LaserCanMessage::Ack { command, status }.to_frame(self.address).ok()
    }
}

impl SimulatedDevice for SimulatedLaserCan {
    fn kind(&self) -> DeviceKind {
        DeviceKind::LaserCan
    }

    fn address(&self) -> CanAddress {
        self.address
    }

    fn handle_frame(&mut self, frame: &GrappleFrame) -> Option<GrappleFrame> {
        if !self.is_addressed_to_me(frame) {
            return None;
        }

        let message = match LaserCanMessage::try_from(*frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Simulated LaserCAN {} got malformed frame: {}", self.address, e);
                return None;
            },
        };

        message.command()?;
        if let Some(code) = self.reject_next.take() {
            return self.ack(&message, AckStatus::Rejected(code));
        }

        match message {
            LaserCanMessage::SetRangingMode(mode) => self.ranging_mode = mode,
            LaserCanMessage::SetTimingBudget(budget) => self.timing_budget = budget,
            LaserCanMessage::SetRoi(roi) => self.roi = roi,
            _ => return None,
        }
        debug!("Simulated LaserCAN {} applied {:?}", self.address, message);
        self.ack(&message, AckStatus::Accepted)
    }

    fn status_frames(&mut self) -> Vec<GrappleFrame> {
        LaserCanMessage::Measurement(self.measure())
            .to_frame(self.address)
            .ok()
            .into_iter()
            .collect()
    }
}

/// 仿真 MitoCANdria
#[derive(Debug, Clone)]
pub struct SimulatedMitoCandria {
    address: CanAddress,
    channels: [ChannelStatus; Channel::COUNT],
}

impl SimulatedMitoCandria {
    pub fn new(address: CanAddress) -> Self {
        let channels = Channel::ALL.map(|channel| {
            let voltage_mv = 5000;
            ChannelStatus {
                channel,
                enabled: true,
                current_ma: 0,
                voltage_mv,
                setpoint_mv: voltage_mv,
            }
        });
        Self { address, channels }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelStatus {
        &self.channels[channel.index() as usize]
    }

    /// 设置仿真负载电流
    pub fn set_load_ma(&mut self, channel: Channel, current_ma: u16) {
        self.channels[channel.index() as usize].current_ma = current_ma;
    }

    fn apply(&mut self, message: &MitoCandriaMessage) -> AckStatus {
        match *message {
            MitoCandriaMessage::SetSwitchableChannel { channel, enabled } => {
                let status = &mut self.channels[channel.index() as usize];
                status.enabled = enabled;
                status.voltage_mv = if enabled { status.setpoint_mv } else { 0 };
                AckStatus::Accepted
            },
            MitoCandriaMessage::SetAdjustableChannel {
                channel,
                voltage_mv,
            } => {
                if voltage_mv as f64 > ADJUSTABLE_VOLTAGE_MAX * 1000.0 {
                    return AckStatus::Rejected(NonZeroU8::MIN);
                }
                let status = &mut self.channels[channel.index() as usize];
                status.setpoint_mv = voltage_mv;
                if status.enabled {
                    status.voltage_mv = voltage_mv;
                }
                AckStatus::Accepted
            },
            _ => AckStatus::Rejected(NonZeroU8::MAX),
        }
    }
}

impl SimulatedDevice for SimulatedMitoCandria {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MitoCandria
    }

    fn address(&self) -> CanAddress {
        self.address
    }

    fn handle_frame(&mut self, frame: &GrappleFrame) -> Option<GrappleFrame> {
        if !self.is_addressed_to_me(frame) {
            return None;
        }

        let message = match MitoCandriaMessage::try_from(*frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Simulated MitoCANdria {} got malformed frame: {}", self.address, e);
                return None;
            },
        };
        let command = message.command()?;
        let status = self.apply(&message);
        debug!(
            "Simulated MitoCANdria {} {:?} -> {:?}",
            self.address, message, status
        );
        MitoCandriaMessage::Ack { command, status }.to_frame(self.address).ok()
    }

    fn status_frames(&mut self) -> Vec<GrappleFrame> {
        self.channels
            .iter()
            .filter_map(|status| {
                MitoCandriaMessage::ChannelStatus(*status).to_frame(self.address).ok()
            })
            .collect()
    }
}

/// 推进一个仿真周期：应答所有已到达的帧，然后上报状态
///
/// 返回本周期发出的帧数。
pub fn step<D, A>(device: &mut D, can: &mut A) -> Result<usize, CanError>
where
    D: SimulatedDevice + ?Sized,
    A: CanAdapter + ?Sized,
{
    let mut sent = 0;

    while let Some(frame) = can.try_receive()? {
        if let Some(ack) = device.handle_frame(&frame) {
            can.send(ack)?;
            sent += 1;
        }
    }

    for frame in device.status_frames() {
        can.send(frame)?;
        sent += 1;
    }

    trace!("Simulated {} {} sent {} frames", device.kind(), device.address(), sent);
    Ok(sent)
}

/// 后台仿真线程句柄
pub struct SimulatorHandle {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// 停止仿真并等待线程退出
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // drop Sender 即通知线程退出
        self.stop_tx.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Simulator thread panicked");
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 在后台线程上运行一组仿真设备（共享一个适配器）
///
/// 每个周期依次推进所有设备；适配器出现不可恢复错误时线程退出。
pub fn spawn<A>(
    mut devices: Vec<Box<dyn SimulatedDevice>>,
    mut can: A,
    period: Duration,
) -> Result<SimulatorHandle, CanError>
where
    A: CanAdapter + Send + 'static,
{
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

    let thread = std::thread::Builder::new()
        .name("grapple-sim".to_string())
        .spawn(move || {
            info!("Simulator started with {} devices", devices.len());
            loop {
                // 设备之间的帧由总线转发，这里只处理主机发来的帧
                let mut frames = Vec::new();
                loop {
                    match can.try_receive() {
                        Ok(Some(frame)) => frames.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Simulator receive failed: {}", e);
                            if e.is_fatal() {
                                return;
                            }
                            break;
                        },
                    }
                }

                for device in devices.iter_mut() {
                    let mut replies: Vec<GrappleFrame> = frames
                        .iter()
                        .filter_map(|frame| device.handle_frame(frame))
                        .collect();
                    replies.extend(device.status_frames());
                    for frame in replies {
                        if let Err(e) = can.send(frame) {
                            warn!("Simulator send failed: {}", e);
                            if e.is_fatal() {
                                return;
                            }
                        }
                    }
                }

                match stop_rx.recv_timeout(period) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            let _ = can.close();
            info!("Simulator stopped");
        })
        .map_err(CanError::Io)?;

    Ok(SimulatorHandle {
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}
