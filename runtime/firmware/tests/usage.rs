//! Usage statistics fetched over KCI from the mock firmware

mod common;

use common::rig;
use tpu_firmware::{BackendKind, UsageComponent, UsageStats, JANEIRO_TPU_STATES};
use tpu_kci::KciCode;
use tpu_mock::EchoFirmware;

#[test]
fn test_update_folds_firmware_report() {
    let model = EchoFirmware::new()
        .with_tpu_usage(1000, 40, 6)
        .with_tpu_usage(1000, 10, 4)
        .with_component_activity(1, 60);
    let rig = rig(BackendKind::Janeiro, model);
    let stats = UsageStats::new(JANEIRO_TPU_STATES);

    stats.update(&rig.kci).unwrap();
    stats.update(&rig.kci).unwrap();
    assert_eq!(stats.time_in_state(1000), Some(vec![20, 0, 80]));
    assert_eq!(stats.take_utilization(UsageComponent::Tpu), 60);
    assert_eq!(stats.take_utilization(UsageComponent::Tpu), 0);
}

#[test]
fn test_update_without_usage_support() {
    let rig = rig(
        BackendKind::Default,
        EchoFirmware::new().without(KciCode::GetUsage.raw()),
    );
    let stats = UsageStats::new(JANEIRO_TPU_STATES);
    stats.update(&rig.kci).unwrap();
    assert!(stats.uids().is_empty());
}
