//! SocketCAN CAN 适配器实现
//!
//! 支持 Linux 平台下的 SocketCAN 支持，使用内核级的 CAN 通讯接口。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等配置由系统工具（`ip link`）完成，不在应用层设置
//! - **时间戳**：使用打开接口时起算的软件时间戳

use crate::{CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, GrappleFrame};
use socketcan::{
    CanError as SocketCanError, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket,
    StandardId,
};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use grapple_can::{CanAdapter, GrappleFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(GrappleFrame::new_extended(0x0606_0001, &[1, 2, 3])).unwrap();
/// let rx_frame = adapter.receive().unwrap();
/// ```
pub struct SocketCanAdapter {
    /// `None` 表示已关闭
    socket: Option<CanSocket>,
    /// 接口名称（如 "can0"）
    interface: String,
    read_timeout: Duration,
    epoch: Instant,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在或无法打开
    /// - `CanError::Io`: 设置超时失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            ))
        })?;

        // 默认 2ms，与 DriverConfig 默认值一致，确保轮询线程能及时响应关闭
        let read_timeout = Duration::from_millis(2);
        socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket: Some(socket),
            interface,
            read_timeout,
            epoch: Instant::now(),
        })
    }

    /// 获取接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// 设置读超时
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        let socket = self.socket.as_ref().ok_or(CanError::Closed)?;
        // SO_RCVTIMEO 为 0 表示永久阻塞
        socket
            .set_read_timeout(timeout.max(Duration::from_micros(1)))
            .map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }

    fn to_can_frame(frame: &GrappleFrame) -> Result<CanFrame, CanError> {
        let data = frame.data_slice();
        let can_frame = if frame.is_extended {
            ExtendedId::new(frame.id).and_then(|id| CanFrame::new(id, data))
        } else {
            StandardId::new(frame.id as u16).and_then(|id| CanFrame::new(id, data))
        };
        can_frame.ok_or_else(|| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::InvalidFrame,
                format!("Failed to create frame with ID 0x{:X}", frame.id),
            ))
        })
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: GrappleFrame) -> Result<(), CanError> {
        let can_frame = Self::to_can_frame(&frame)?;
        let socket = self.socket.as_ref().ok_or(CanError::Closed)?;

        socket.write_frame(&can_frame).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "SocketCAN transmit error: {}",
                e
            )))
        })?;

        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    /// 接收帧（阻塞直到收到有效数据帧或超时）
    ///
    /// 自动过滤远程帧和可忽略的错误帧。
    fn receive(&mut self) -> Result<GrappleFrame, CanError> {
        let socket = self.socket.as_ref().ok_or(CanError::Closed)?;

        loop {
            let can_frame = match socket.read_frame() {
                Ok(frame) => frame,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(CanError::Io(e)),
            };

            match can_frame {
                CanFrame::Data(data_frame) => {
                    let mut frame = if data_frame.is_extended() {
                        GrappleFrame::new_extended(data_frame.raw_id(), data_frame.data())
                    } else {
                        GrappleFrame::new_standard(data_frame.raw_id() as u16, data_frame.data())
                    };
                    frame.timestamp_us = self.epoch.elapsed().as_micros() as u64;

                    trace!(
                        "Received CAN frame: ID=0x{:X}, len={}, timestamp_us={}",
                        frame.id, frame.len, frame.timestamp_us
                    );
                    return Ok(frame);
                },
                CanFrame::Remote(_) => continue,
                CanFrame::Error(error_frame) => match SocketCanError::from(error_frame) {
                    SocketCanError::BusOff => {
                        error!("CAN Bus Off error detected on '{}'", self.interface);
                        return Err(CanError::BusOff);
                    },
                    SocketCanError::ControllerProblem(problem) => {
                        let problem_str = format!("{}", problem);
                        if problem_str.contains("overflow") || problem_str.contains("Overflow") {
                            error!("CAN Buffer Overflow detected: {}", problem);
                            return Err(CanError::BufferOverflow);
                        }
                        warn!("CAN Controller Problem: {}, ignoring", problem);
                    },
                    other => {
                        warn!("CAN Error Frame received: {}, ignoring", other);
                    },
                },
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<GrappleFrame, CanError> {
        let old_timeout = self.read_timeout;
        self.set_read_timeout(timeout)?;
        let result = self.receive();
        let _ = self.set_read_timeout(old_timeout);
        result
    }

    fn close(&mut self) -> Result<(), CanError> {
        if self.socket.take().is_some() {
            trace!("SocketCAN interface '{}' closed", self.interface);
        }
        Ok(())
    }
}
