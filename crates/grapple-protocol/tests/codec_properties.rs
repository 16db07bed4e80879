//! 编解码属性测试
//!
//! 使用 proptest 验证测量帧、ROI 与仲裁 ID 的编解码律。

use grapple_protocol::lasercan::*;
use grapple_protocol::mitocandria::*;
use grapple_protocol::*;
use proptest::prelude::*;

fn any_status() -> impl Strategy<Value = MeasurementStatus> {
    prop_oneof![
        Just(MeasurementStatus::Valid),
        Just(MeasurementStatus::NoiseIssue),
        Just(MeasurementStatus::WeakSignal),
        Just(MeasurementStatus::OutOfBounds),
        Just(MeasurementStatus::Wraparound),
    ]
}

fn any_budget() -> impl Strategy<Value = TimingBudget> {
    prop_oneof![
        Just(TimingBudget::Ms20),
        Just(TimingBudget::Ms33),
        Just(TimingBudget::Ms50),
        Just(TimingBudget::Ms100),
    ]
}

fn any_roi() -> impl Strategy<Value = RegionOfInterest> {
    (0u8..=15, 0u8..=15, 4u8..=16, 4u8..=16).prop_map(|(x, y, w, h)| RegionOfInterest {
        x,
        y,
        w,
        h,
    })
}

proptest! {
    /// 距离（米）经定点编码后再解码，误差不超过 0.5mm
    #[test]
    fn measurement_distance_roundtrip(
        distance_m in 0.0..4.0f64,
        ambient in any::<u16>(),
        status in any_status(),
        long in any::<bool>(),
        budget in any_budget(),
        roi in any_roi(),
    ) {
        let address = CanAddress::new(7).unwrap();
        let measurement = Measurement {
            status,
            distance_mm: Measurement::distance_mm_from_m(distance_m),
            ambient,
            ranging_mode: if long { RangingMode::Long } else { RangingMode::Short },
            timing_budget: budget,
            roi,
        };

        let frame = LaserCanMessage::Measurement(measurement).to_frame(address).unwrap();
        let decoded = match LaserCanMessage::try_from(frame).unwrap() {
            LaserCanMessage::Measurement(m) => m,
            other => panic!("unexpected message {:?}", other),
        };

        prop_assert_eq!(decoded, measurement);
        prop_assert!((decoded.distance_m() - distance_m).abs() <= 0.0005 + 1e-9);
    }

    /// 域外 ROI 永远无法编码
    #[test]
    fn roi_outside_domain_rejected(x in 0u8..=40, y in 0u8..=40, w in 0u8..=40, h in 0u8..=40) {
        let in_domain = x <= 15 && y <= 15 && (4..=16).contains(&w) && (4..=16).contains(&h);
        let roi = RegionOfInterest { x, y, w, h };
        prop_assert_eq!(roi.encode().is_ok(), in_domain);
        if in_domain {
            prop_assert_eq!(RegionOfInterest::decode(roi.encode().unwrap()).unwrap(), roi);
        }
    }

    /// 任意原始 ID 的 ack 只翻转 ack 位
    #[test]
    fn ack_flips_single_bit(raw in 0u32..0x2000_0000) {
        let id = MessageId::from_raw(raw);
        let ack = id.ack();
        prop_assert!(ack.ack_flag());
        prop_assert_eq!(ack.to_raw() | (1 << 14), raw | (1 << 14));
    }

    /// 可调通道：电压在域内可编码，编码值与输入相差不超过 0.5mV
    #[test]
    fn adjustable_voltage_domain(volts in 0.0..15.0f64) {
        let result = MitoCandriaMessage::set_voltage(Channel::Adjustable, volts);
        if (ADJUSTABLE_VOLTAGE_MIN..=ADJUSTABLE_VOLTAGE_MAX).contains(&volts) {
            match result.unwrap() {
                MitoCandriaMessage::SetAdjustableChannel { voltage_mv, .. } => {
                    prop_assert!((voltage_mv as f64 / 1000.0 - volts).abs() <= 0.0005 + 1e-9);
                },
                other => panic!("unexpected message {:?}", other),
            }
        } else {
            prop_assert!(result.is_err());
        }
    }
}

/// 任意字节的帧都不会让解码器 panic
#[test]
fn arbitrary_payloads_never_panic() {
    let address = CanAddress::new(1).unwrap();
    for class in 0..4u8 {
        for index in 0..4u8 {
            for len in 0..=8usize {
                let payload = [0xA5u8; 8];
                let laser = MessageId::for_device(DeviceKind::LaserCan, address, class, index);
                let mito = MessageId::for_device(DeviceKind::MitoCandria, address, class, index);
                let _ = LaserCanMessage::try_from(GrappleFrame::new_extended(
                    laser.to_raw(),
                    &payload[..len],
                ));
                let _ = MitoCandriaMessage::try_from(GrappleFrame::new_extended(
                    mito.to_raw(),
                    &payload[..len],
                ));
            }
        }
    }
}
