//! A KCI session wired to a mock Edge TPU

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tpu_firmware::{
    backend_for, BackendKind, DirectorySource, Firmware, FirmwareConfig, FirmwareEnv,
    FirmwareRegion, FirmwareSource, GroupRegistry, JaneiroReverseHandler, MemorySource,
    SharedFirmwareRegistry, SimulatedChip, IMAGE_CONFIG_OFFSET, MOBILE_FW_HEADER_SIZE,
};
use tpu_kci::{Handshake, Kci, KciConfig};
use tpu_mailbox::{MailboxManager, MailboxManagerDesc};
use tpu_mock::{FirmwareModel, MockAllocator, MockDevice, MockRegisters};

/// Carveout the simulated control core boots from
pub const FIRMWARE_REGION: FirmwareRegion = FirmwareRegion {
    base: 0x4000_0000,
    size: 0x10_0000,
};

pub struct Sim {
    pub device: MockDevice,
    pub kci: Kci,
    pub mem: Arc<MockAllocator>,
}

impl Sim {
    pub fn start(config: KciConfig, model: impl FirmwareModel + 'static) -> Result<Self> {
        let desc = MailboxManagerDesc::JANEIRO;
        let regs = Arc::new(MockRegisters::new(desc.num_mailbox));
        let mem = Arc::new(MockAllocator::new());
        let manager = Arc::new(MailboxManager::new(regs.clone(), desc)?);
        let kci = Kci::init(manager.clone(), mem.clone(), config)
            .context("Failed to start KCI session")?;
        let device = MockDevice::start(regs, mem.clone(), kci.mailbox_id(), model)
            .context("Failed to start mock device")?;
        device.set_irq_handler(move || {
            manager.handle_irq();
        });
        log::debug!("sim: KCI on mailbox {}", kci.mailbox_id());
        Ok(Self { device, kci, mem })
    }

    /// Bring up a firmware loader on this session
    ///
    /// With `synthetic`, images are generated in memory instead of read
    /// from the configured search path.
    pub fn firmware(&self, config: &FirmwareConfig, synthetic: bool) -> Result<Arc<Firmware>> {
        let source: Arc<dyn FirmwareSource> = if synthetic {
            Arc::new(MemorySource::new().with_image(
                &config.default_image,
                synthetic_image(config.backend, 0x2000),
            ))
        } else {
            Arc::new(DirectorySource::new(&config.search_path))
        };
        if config.backend == BackendKind::Janeiro {
            self.kci.set_chip_handler(Arc::new(JaneiroReverseHandler::new()));
        }

        let env = FirmwareEnv {
            kci: self.kci.clone(),
            chip: Arc::new(SimulatedChip::new(FIRMWARE_REGION)),
            registry: SharedFirmwareRegistry::new(config.size_align)?,
            source,
            handshake: Arc::new(Handshake::new()),
            groups: Arc::new(GroupRegistry::new()),
        };
        Ok(Firmware::create(env, backend_for(config.backend))?)
    }
}

/// Image `backend` accepts: mobile chips need the signed header
pub fn synthetic_image(backend: BackendKind, body: usize) -> Vec<u8> {
    let mut image = Vec::new();
    if backend != BackendKind::Default {
        image.resize(MOBILE_FW_HEADER_SIZE, 0);
        for (i, word) in [1u32, 0, 0, 1].iter().enumerate() {
            let at = IMAGE_CONFIG_OFFSET + 12 + i * 4;
            image[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
    image.resize(image.len() + body, 0xA5);
    image
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpu_firmware::{DeviceState, FirmwareFlags, FirmwareVersion};
    use tpu_kci::TimeoutProfile;
    use tpu_mock::EchoFirmware;

    fn test_config() -> KciConfig {
        KciConfig {
            queue_size: 16,
            ..KciConfig::for_profile(TimeoutProfile::Test)
        }
    }

    #[test]
    fn test_ack_round_trip() {
        let sim = Sim::start(test_config(), EchoFirmware::new()).unwrap();
        sim.kci.ack().unwrap();
        assert_eq!(sim.device.arrivals().len(), 1);
    }

    #[test]
    fn test_synthetic_janeiro_firmware() {
        let sim = Sim::start(test_config(), EchoFirmware::new()).unwrap();
        let config = FirmwareConfig {
            backend: BackendKind::Janeiro,
            ..FirmwareConfig::default()
        };
        let firmware = sim.firmware(&config, true).unwrap();
        firmware
            .run(&config.default_image, FirmwareFlags::DEFAULT)
            .unwrap();
        assert_eq!(firmware.device_state(), DeviceState::Good);
        assert_eq!(
            firmware.version(),
            Some(FirmwareVersion {
                major: 1,
                minor: 0,
                vii: 0,
                kci: 1
            })
        );
    }

    #[test]
    fn test_synthetic_image_layout() {
        assert_eq!(synthetic_image(BackendKind::Default, 16), vec![0xA5; 16]);
        let image = synthetic_image(BackendKind::Abrolhos, 16);
        assert_eq!(image.len(), MOBILE_FW_HEADER_SIZE + 16);
        assert_eq!(image[IMAGE_CONFIG_OFFSET + 12], 1);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
