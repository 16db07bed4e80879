//! 仲裁 ID 布局、设备类型与地址
//!
//! Grapple 设备使用 29 位扩展帧 ID（FRC CAN 约定的变体），位序 LSB first：
//!
//! ```text
//!  28      24 23            16   15   14  13   10 9     6 5        0
//! +----------+----------------+----+----+-------+-------+----------+
//! | dev type |  manufacturer  |frag| ack| class | index | device id|
//! +----------+----------------+----+----+-------+-------+----------+
//! ```

use crate::ConfigError;
use bilge::prelude::*;
use std::fmt;

/// Grapple Robotics 厂商号
pub const MANUFACTURER_GRAPPLE: u8 = 6;

/// 测距传感器设备类型（LaserCAN）
pub const DEVICE_TYPE_DISTANCE_SENSOR: u8 = 6;

/// 电源分配模块设备类型（MitoCANdria）
pub const DEVICE_TYPE_POWER_DISTRIBUTION_MODULE: u8 = 8;

/// 广播设备号（不可被设备占用）
pub const DEVICE_ID_BROADCAST: u8 = 0x3F;

/// 状态类 API（设备 → 主机周期帧）
pub const API_CLASS_STATUS: u8 = 0;

/// 配置类 API（主机 → 设备，设备以 ack 帧应答）
pub const API_CLASS_CONFIG: u8 = 1;

const ID_MASK_29: u32 = 0x1FFF_FFFF;

/// Grapple 29 位仲裁 ID
#[bitsize(29)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    pub device_id: u6,
    pub api_index: u4,
    pub api_class: u4,
    pub ack_flag: bool,
    pub fragment_flag: bool,
    pub manufacturer: u8,
    pub device_type: u5,
}

impl MessageId {
    /// 构建指向某个 Grapple 设备的 ID
    pub fn for_device(kind: DeviceKind, address: CanAddress, api_class: u8, api_index: u8) -> Self {
        Self::new(
            u6::new(address.value()),
            u4::new(api_index & 0x0F),
            u4::new(api_class & 0x0F),
            false,
            false,
            MANUFACTURER_GRAPPLE,
            u5::new(kind.device_type()),
        )
    }

    /// 从原始 CAN ID 解析（高 3 位被忽略）
    pub fn from_raw(raw: u32) -> Self {
        Self::from(u29::new(raw & ID_MASK_29))
    }

    /// 转换为原始 CAN ID
    pub fn to_raw(self) -> u32 {
        u29::from(self).value()
    }

    /// 设备对本 ID 的应答 ID（ack 位置 1）
    pub fn ack(mut self) -> Self {
        self.set_ack_flag(true);
        self
    }

    pub fn is_grapple(&self) -> bool {
        self.manufacturer() == MANUFACTURER_GRAPPLE
    }

    /// (api_class, api_index)
    pub fn api(&self) -> (u8, u8) {
        (self.api_class().value(), self.api_index().value())
    }

    /// 设备类型（若为已知 Grapple 设备）
    pub fn device_kind(&self) -> Option<DeviceKind> {
        if !self.is_grapple() {
            return None;
        }
        DeviceKind::from_device_type(self.device_type().value())
    }

    /// 设备地址（广播地址返回 None）
    pub fn address(&self) -> Option<CanAddress> {
        CanAddress::new(self.device_id().value()).ok()
    }
}

/// 设备种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// LaserCAN 测距传感器
    LaserCan,
    /// MitoCANdria 电源分配模块
    MitoCandria,
}

impl DeviceKind {
    pub fn device_type(self) -> u8 {
        match self {
            DeviceKind::LaserCan => DEVICE_TYPE_DISTANCE_SENSOR,
            DeviceKind::MitoCandria => DEVICE_TYPE_POWER_DISTRIBUTION_MODULE,
        }
    }

    pub fn from_device_type(device_type: u8) -> Option<Self> {
        match device_type {
            DEVICE_TYPE_DISTANCE_SENSOR => Some(DeviceKind::LaserCan),
            DEVICE_TYPE_POWER_DISTRIBUTION_MODULE => Some(DeviceKind::MitoCandria),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::LaserCan => write!(f, "LaserCAN"),
            DeviceKind::MitoCandria => write!(f, "MitoCANdria"),
        }
    }
}

/// 设备在总线上的地址（6 位设备号，0..=62）
///
/// 构造后不可变；同一条总线上唯一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanAddress(u8);

impl CanAddress {
    pub fn new(value: u8) -> Result<Self, ConfigError> {
        if value >= DEVICE_ID_BROADCAST {
            return Err(ConfigError::InvalidAddress(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for CanAddress {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for CanAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
