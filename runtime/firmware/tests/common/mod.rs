//! Shared rig: a firmware loader on a live KCI session and mock device

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tpu_firmware::{
    backend_for, BackendKind, Firmware, FirmwareEnv, FirmwareRegion, FirmwareVersion,
    GroupRegistry, MemorySource, SharedFirmwareRegistry, SimulatedChip, IMAGE_CONFIG_OFFSET,
    MOBILE_FW_HEADER_SIZE,
};
use tpu_kci::{Handshake, Kci, KciCode, KciConfig, TimeoutProfile};
use tpu_mailbox::{MailboxManager, MailboxManagerDesc};
use tpu_mock::{FirmwareModel, MockAllocator, MockDevice, MockRegisters};

pub const REGION: FirmwareRegion = FirmwareRegion {
    base: 0x4000_0000,
    size: 0x4000,
};

pub const VERSION: FirmwareVersion = FirmwareVersion {
    major: 1,
    minor: 7,
    vii: 3,
    kci: 2,
};

pub struct Rig {
    // stopped before the loader and session go away
    pub device: MockDevice,
    pub firmware: Arc<Firmware>,
    pub kci: Kci,
    pub chip: Arc<SimulatedChip>,
    pub source: Arc<MemorySource>,
    pub registry: SharedFirmwareRegistry,
    pub handshake: Arc<Handshake>,
    pub groups: Arc<GroupRegistry>,
    pub mem: Arc<MockAllocator>,
}

/// Mobile image: a header carrying [`VERSION`], then `body` bytes of 0x5A
pub fn mobile_image(body: usize) -> Vec<u8> {
    let mut image = vec![0u8; MOBILE_FW_HEADER_SIZE];
    let words = [VERSION.major, VERSION.minor, VERSION.vii, VERSION.kci];
    for (i, word) in words.iter().enumerate() {
        let at = IMAGE_CONFIG_OFFSET + 12 + i * 4;
        image[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
    image.resize(MOBILE_FW_HEADER_SIZE + body, 0x5A);
    image
}

pub fn source() -> MemorySource {
    MemorySource::new()
        .with_image("plain.fw", vec![0x11; 100])
        .with_image("other.fw", vec![0x22; 5000])
        .with_image("mobile.fw", mobile_image(0x100))
        .with_image("short.fw", vec![0; MOBILE_FW_HEADER_SIZE / 2])
        .with_image("huge.fw", mobile_image(REGION.size + 1))
}

pub fn rig(backend: BackendKind, model: impl FirmwareModel + 'static) -> Rig {
    let registry = SharedFirmwareRegistry::new(4096).unwrap();
    rig_with(backend, model, 2000, registry, Arc::new(source()))
}

pub fn rig_with(
    backend: BackendKind,
    model: impl FirmwareModel + 'static,
    timeout_ms: u64,
    registry: SharedFirmwareRegistry,
    source: Arc<MemorySource>,
) -> Rig {
    let regs = Arc::new(MockRegisters::new(8));
    let mem = Arc::new(MockAllocator::new());
    let manager =
        Arc::new(MailboxManager::new(regs.clone(), MailboxManagerDesc::JANEIRO).unwrap());
    let config = KciConfig {
        queue_size: 8,
        timeout_ms: Some(timeout_ms),
        ..KciConfig::for_profile(TimeoutProfile::Test)
    };
    let kci = Kci::init(manager.clone(), mem.clone(), config).unwrap();
    let device = MockDevice::start(regs, mem.clone(), kci.mailbox_id(), model).unwrap();
    device.set_irq_handler(move || {
        manager.handle_irq();
    });

    let chip = Arc::new(SimulatedChip::new(REGION));
    let handshake = Arc::new(Handshake::new());
    let groups = Arc::new(GroupRegistry::new());
    let env = FirmwareEnv {
        kci: kci.clone(),
        chip: chip.clone(),
        registry: registry.clone(),
        source: source.clone(),
        handshake: handshake.clone(),
        groups: groups.clone(),
    };
    let firmware = Firmware::create(env, backend_for(backend)).unwrap();
    Rig {
        device,
        firmware,
        kci,
        chip,
        source,
        registry,
        handshake,
        groups,
        mem,
    }
}

/// FIRMWARE_INFO commands the device has seen
pub fn info_requests(rig: &Rig) -> usize {
    rig.device
        .arrivals()
        .iter()
        .filter(|c| c.code == KciCode::FirmwareInfo.raw())
        .count()
}

/// Poll `cond` for up to five seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
