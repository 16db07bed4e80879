//! 设备注册表
//!
//! 同一条总线上地址唯一（与设备种类无关）。IO 线程通过注册表把收到的帧
//! 路由到对应设备的状态缓存；设备句柄 drop 时注销自己的地址。

use crate::error::DriverError;
use crate::state::{LaserCanState, MitoCandriaState};
use grapple_protocol::{CanAddress, DeviceKind, MessageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// 注册在总线上的设备状态
#[derive(Debug, Clone)]
pub enum DeviceSlot {
    LaserCan(Arc<LaserCanState>),
    MitoCandria(Arc<MitoCandriaState>),
}

impl DeviceSlot {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceSlot::LaserCan(_) => DeviceKind::LaserCan,
            DeviceSlot::MitoCandria(_) => DeviceKind::MitoCandria,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<CanAddress, DeviceSlot>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 占用地址
    ///
    /// # 错误
    /// - `DriverError::DuplicateAddress`: 地址已被任意种类的设备占用
    pub fn register(&self, address: CanAddress, slot: DeviceSlot) -> Result<(), DriverError> {
        let mut devices = self.devices.lock();
        if let Some(existing) = devices.get(&address) {
            return Err(DriverError::DuplicateAddress {
                address,
                existing: existing.kind(),
            });
        }
        trace!("Registered {} at address {}", slot.kind(), address);
        devices.insert(address, slot);
        Ok(())
    }

    pub fn unregister(&self, address: CanAddress) {
        if let Some(slot) = self.devices.lock().remove(&address) {
            trace!("Unregistered {} at address {}", slot.kind(), address);
        }
    }

    pub fn lookup(&self, address: CanAddress) -> Option<DeviceKind> {
        self.devices.lock().get(&address).map(DeviceSlot::kind)
    }

    /// 路由：只有设备类型与注册种类一致的帧才会命中
    pub fn route(&self, id: MessageId) -> Option<DeviceSlot> {
        let kind = id.device_kind()?;
        let address = id.address()?;
        self.devices
            .lock()
            .get(&address)
            .filter(|slot| slot.kind() == kind)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已注册设备列表（按地址排序）
    pub fn devices(&self) -> Vec<(CanAddress, DeviceKind)> {
        let mut devices: Vec<_> = self
            .devices
            .lock()
            .iter()
            .map(|(address, slot)| (*address, slot.kind()))
            .collect();
        devices.sort_by_key(|(address, _)| *address);
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn laser_slot() -> DeviceSlot {
        DeviceSlot::LaserCan(Arc::new(LaserCanState::new(Duration::from_millis(500))))
    }

    fn mito_slot() -> DeviceSlot {
        DeviceSlot::MitoCandria(Arc::new(MitoCandriaState::new(Duration::from_millis(500))))
    }

    #[test]
    fn test_duplicate_address_rejected_across_kinds() {
        let registry = DeviceRegistry::new();
        let address = CanAddress::new(5).unwrap();

        registry.register(address, laser_slot()).unwrap();
        match registry.register(address, mito_slot()) {
            Err(DriverError::DuplicateAddress { address: a, existing }) => {
                assert_eq!(a, address);
                assert_eq!(existing, DeviceKind::LaserCan);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_frees_address() {
        let registry = DeviceRegistry::new();
        let address = CanAddress::new(9).unwrap();

        registry.register(address, laser_slot()).unwrap();
        registry.unregister(address);
        assert!(registry.is_empty());
        registry.register(address, mito_slot()).unwrap();
        assert_eq!(registry.lookup(address), Some(DeviceKind::MitoCandria));
    }

    #[test]
    fn test_route_requires_matching_kind() {
        let registry = DeviceRegistry::new();
        let address = CanAddress::new(2).unwrap();
        registry.register(address, laser_slot()).unwrap();

        let laser_id = MessageId::for_device(DeviceKind::LaserCan, address, 0, 0);
        let mito_id = MessageId::for_device(DeviceKind::MitoCandria, address, 0, 0);
        let other_id =
            MessageId::for_device(DeviceKind::LaserCan, CanAddress::new(3).unwrap(), 0, 0);

        assert!(matches!(registry.route(laser_id), Some(DeviceSlot::LaserCan(_))));
        assert!(registry.route(mito_id).is_none());
        assert!(registry.route(other_id).is_none());
    }

    #[test]
    fn test_devices_sorted() {
        let registry = DeviceRegistry::new();
        registry.register(CanAddress::new(8).unwrap(), mito_slot()).unwrap();
        registry.register(CanAddress::new(1).unwrap(), laser_slot()).unwrap();
        let devices = registry.devices();
        assert_eq!(devices[0].0.value(), 1);
        assert_eq!(devices[1].1, DeviceKind::MitoCandria);
    }
}
