//! Crash recovery, chip requests and image sharing between devices

mod common;

use std::sync::Arc;

use common::{eventually, info_requests, rig, rig_with, source};
use tpu_firmware::{
    BackendKind, DeviceState, FirmwareFlags, GroupStatus, JaneiroReverseHandler,
    PerformanceState, SharedFirmwareRegistry,
};
use tpu_kci::{CrashType, RKCI_FIRMWARE_CRASH};
use tpu_mailbox::KciResponseElement;
use tpu_mock::EchoFirmware;

#[test]
fn test_fatal_crash_errors_groups_and_restarts() {
    let rig = rig(BackendKind::Janeiro, EchoFirmware::new());
    rig.firmware.run("mobile.fw", FirmwareFlags::DEFAULT).unwrap();
    rig.handshake.activate(&rig.kci, 0b110).unwrap();
    let finalized = rig.groups.create().unwrap();
    let waiting = rig.groups.create().unwrap();
    finalized.finalize();

    rig.device.inject_response(KciResponseElement::reverse(
        RKCI_FIRMWARE_CRASH,
        CrashType::UnrecoverableFault.raw(),
    ));
    assert!(eventually(|| info_requests(&rig) == 2 && !rig.firmware.is_loading()));

    assert_eq!(rig.firmware.crash_count(), 1);
    assert_eq!(finalized.status(), GroupStatus::Errored);
    assert_eq!(waiting.status(), GroupStatus::Waiting);
    // the host still wants the mailboxes, the restarted firmware knows none
    assert_eq!(rig.handshake.state(), 0b110);
    assert_eq!(rig.handshake.fw_state(), 0);
    assert_eq!(rig.firmware.device_state(), DeviceState::Good);
}

#[test]
fn test_non_fatal_crash_is_only_counted() {
    let rig = rig(BackendKind::Default, EchoFirmware::new());
    rig.firmware.run("plain.fw", FirmwareFlags::DEFAULT).unwrap();
    rig.handshake.activate(&rig.kci, 0b10).unwrap();
    let group = rig.groups.create().unwrap();
    group.finalize();

    rig.device.inject_response(KciResponseElement::reverse(
        RKCI_FIRMWARE_CRASH,
        CrashType::Dummy.raw(),
    ));
    assert!(eventually(|| rig.firmware.crash_count() == 1));

    assert_eq!(group.status(), GroupStatus::Finalized);
    assert_eq!(rig.handshake.fw_state(), 0b10);
    assert_eq!(info_requests(&rig), 1);
}

#[test]
fn test_janeiro_chip_requests() {
    let rig = rig(BackendKind::Janeiro, EchoFirmware::new());
    let handler = Arc::new(JaneiroReverseHandler::new());
    rig.kci.set_chip_handler(handler.clone());

    rig.device
        .inject_response(KciResponseElement::reverse(1, (1066 << 16) | 2093));
    rig.device.inject_response(KciResponseElement::reverse(2, 1));
    assert!(eventually(|| handler.requests().len() == 2));
    assert_eq!(
        handler.state(),
        PerformanceState {
            int_khz: 1_066_000,
            mif_khz: 2_093_000,
            bts_active: true
        }
    );
}

#[test]
fn test_devices_share_one_image() {
    let registry = SharedFirmwareRegistry::new(4096).unwrap();
    let source = Arc::new(source());
    let first = rig_with(
        BackendKind::Default,
        EchoFirmware::new(),
        2000,
        registry.clone(),
        source.clone(),
    );
    let second = rig_with(
        BackendKind::Default,
        EchoFirmware::new(),
        2000,
        registry.clone(),
        source.clone(),
    );

    first.firmware.run("plain.fw", FirmwareFlags::DEFAULT).unwrap();
    second.firmware.run("plain.fw", FirmwareFlags::DEFAULT).unwrap();
    assert_eq!(registry.ref_count("plain.fw"), 2);
    assert_eq!(source.requests(), vec!["plain.fw"]);

    let image = registry.get_by_name("plain.fw").unwrap();
    assert_eq!(image.size(), 4096);
    drop(image);

    first.firmware.destroy();
    assert_eq!(registry.ref_count("plain.fw"), 1);
    second.firmware.destroy();
    assert!(registry.is_empty());
}
