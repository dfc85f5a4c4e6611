//! Mock control firmware
//!
//! A [`FirmwareModel`] decides which responses the device writes for each
//! command it pulls off the command queue. Closures implement the trait, so
//! a test can script gaps, late responses or silence inline.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tpu_mailbox::{CommandElement, KciResponseElement};

use crate::memory::MockAllocator;

// Firmware-side view of the command codes the mock understands
const CODE_FIRMWARE_INFO: u64 = 11;
const CODE_GET_USAGE: u64 = 12;

/// Bytes per usage metric record: type, reserved word, 12-byte payload
pub const USAGE_METRIC_SIZE: usize = 20;
const METRIC_TYPE_TPU_USAGE: u32 = 1;
const METRIC_TYPE_COMPONENT_ACTIVITY: u32 = 2;

const ERROR_OK: u16 = 0;
const ERROR_UNIMPLEMENTED: u16 = 12;

/// Answers commands on behalf of the control processor
pub trait FirmwareModel: Send {
    /// Responses to write for `cmd`, in queue order
    ///
    /// Returning nothing models a command the firmware never answers.
    fn on_command(&mut self, cmd: &CommandElement, mem: &MockAllocator) -> Vec<KciResponseElement>;
}

impl<F> FirmwareModel for F
where
    F: FnMut(&CommandElement, &MockAllocator) -> Vec<KciResponseElement> + Send,
{
    fn on_command(&mut self, cmd: &CommandElement, mem: &MockAllocator) -> Vec<KciResponseElement> {
        self(cmd, mem)
    }
}

/// Contents of the FIRMWARE_INFO reply buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFwInfo {
    pub build_time: u32,
    pub flavor: u32,
    pub changelist: u32,
}

impl Default for MockFwInfo {
    fn default() -> Self {
        Self {
            build_time: 1_600_000_000,
            // production flavor
            flavor: 3,
            changelist: 4242,
        }
    }
}

impl MockFwInfo {
    /// On-wire layout: three words followed by five reserved words
    pub fn to_bytes(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&self.build_time.to_le_bytes());
        out[4..8].copy_from_slice(&self.flavor.to_le_bytes());
        out[8..12].copy_from_slice(&self.changelist.to_le_bytes());
        out
    }
}

/// Firmware that answers every command with OK, in order
#[derive(Debug)]
pub struct EchoFirmware {
    info: MockFwInfo,
    unimplemented: Vec<u64>,
    usage: Vec<[u8; USAGE_METRIC_SIZE]>,
    max_delay: Duration,
    rng: StdRng,
}

fn usage_record(kind: u32, payload: [u32; 3]) -> [u8; USAGE_METRIC_SIZE] {
    let mut record = [0u8; USAGE_METRIC_SIZE];
    record[0..4].copy_from_slice(&kind.to_le_bytes());
    for (i, word) in payload.iter().enumerate() {
        record[8 + i * 4..12 + i * 4].copy_from_slice(&word.to_le_bytes());
    }
    record
}

impl Default for EchoFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoFirmware {
    pub fn new() -> Self {
        Self {
            info: MockFwInfo::default(),
            unimplemented: Vec::new(),
            usage: Vec::new(),
            max_delay: Duration::ZERO,
            rng: StdRng::seed_from_u64(0x7470_755f_6d6f_636b),
        }
    }

    pub fn with_info(mut self, info: MockFwInfo) -> Self {
        self.info = info;
        self
    }

    /// Answer `code` with UNIMPLEMENTED, like firmware predating it
    pub fn without(mut self, code: u64) -> Self {
        self.unimplemented.push(code);
        self
    }

    /// Report `duration_us` of work for `uid` at `power_state` in GET_USAGE
    pub fn with_tpu_usage(mut self, uid: i32, duration_us: u32, power_state: u32) -> Self {
        self.usage.push(usage_record(
            METRIC_TYPE_TPU_USAGE,
            [uid as u32, duration_us, power_state],
        ));
        self
    }

    /// Report `utilization` percent for `component` in GET_USAGE
    pub fn with_component_activity(mut self, component: i32, utilization: i32) -> Self {
        self.usage.push(usage_record(
            METRIC_TYPE_COMPONENT_ACTIVITY,
            [component as u32, utilization as u32, 0],
        ));
        self
    }

    /// Sleep a random time up to `max` before answering each command
    pub fn with_jitter(mut self, max: Duration, seed: u64) -> Self {
        self.max_delay = max;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn fill_buffer(&self, cmd: &CommandElement, mem: &MockAllocator) {
        let Some(buffer) = mem.resolve(cmd.dma.address) else {
            return;
        };
        match cmd.code {
            CODE_FIRMWARE_INFO => buffer.write_bytes(0, &self.info.to_bytes()),
            CODE_GET_USAGE => {
                buffer.write_bytes(0, &(self.usage.len() as u32).to_le_bytes());
                buffer.write_bytes(4, &(USAGE_METRIC_SIZE as u32).to_le_bytes());
                for (i, record) in self.usage.iter().enumerate() {
                    buffer.write_bytes(8 + i * USAGE_METRIC_SIZE, record);
                }
            }
            _ => {}
        }
    }
}

impl FirmwareModel for EchoFirmware {
    fn on_command(&mut self, cmd: &CommandElement, mem: &MockAllocator) -> Vec<KciResponseElement> {
        if !self.max_delay.is_zero() {
            let max_us = self.max_delay.as_micros() as u64;
            std::thread::sleep(Duration::from_micros(self.rng.gen_range(0..=max_us)));
        }

        if self.unimplemented.contains(&cmd.code) {
            return vec![KciResponseElement::new(cmd.seq, ERROR_UNIMPLEMENTED, 0)];
        }
        if cmd.dma.address != 0 {
            self.fill_buffer(cmd, mem);
        }
        vec![KciResponseElement::new(cmd.seq, ERROR_OK, cmd.code as u32)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpu_mailbox::{DeviceMemoryAllocator, DmaDescriptor, DmaDirection};

    #[test]
    fn test_echo_answers_with_same_seq() {
        let mem = MockAllocator::new();
        let mut fw = EchoFirmware::new();
        let mut cmd = CommandElement::new(4, DmaDescriptor::EMPTY);
        cmd.seq = 17;

        let resp = fw.on_command(&cmd, &mem);
        assert_eq!(resp, vec![KciResponseElement::new(17, ERROR_OK, 4)]);
    }

    #[test]
    fn test_fw_info_fills_buffer() {
        let mem = MockAllocator::new();
        let info_buf = mem.alloc(32).unwrap();
        let mut fw = EchoFirmware::new().with_info(MockFwInfo {
            build_time: 1,
            flavor: 2,
            changelist: 3,
        });
        let cmd = CommandElement::new(
            CODE_FIRMWARE_INFO,
            DmaDescriptor::new(info_buf.device_addr(), 32, DmaDirection::FromDevice),
        );
        fw.on_command(&cmd, &mem);

        let mut out = [0u8; 12];
        info_buf.buffer().read_bytes(0, &mut out);
        assert_eq!(out, [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_usage_records() {
        let mem = MockAllocator::new();
        let usage_buf = mem.alloc(4096).unwrap();
        let mut fw = EchoFirmware::new()
            .with_tpu_usage(1000, 50, 5)
            .with_component_activity(1, 80);
        let cmd = CommandElement::new(
            CODE_GET_USAGE,
            DmaDescriptor::new(usage_buf.device_addr(), 4096, DmaDirection::FromDevice),
        );
        fw.on_command(&cmd, &mem);

        let mut out = [0u8; 8 + 2 * USAGE_METRIC_SIZE];
        usage_buf.buffer().read_bytes(0, &mut out);
        assert_eq!(out[0], 2);
        assert_eq!(out[4] as usize, USAGE_METRIC_SIZE);
        assert_eq!(out[8], 1);
        assert_eq!(&out[16..20], &1000u32.to_le_bytes());
        assert_eq!(out[8 + USAGE_METRIC_SIZE], 2);
        assert_eq!(out[8 + USAGE_METRIC_SIZE + 12], 80);
    }

    #[test]
    fn test_unimplemented_codes() {
        let mem = MockAllocator::new();
        let mut fw = EchoFirmware::new().without(CODE_GET_USAGE);
        let resp = fw.on_command(&CommandElement::new(CODE_GET_USAGE, DmaDescriptor::EMPTY), &mem);
        assert_eq!(resp[0].code, ERROR_UNIMPLEMENTED);
    }

    #[test]
    fn test_closure_model() {
        let mem = MockAllocator::new();
        let mut silent = |_: &CommandElement, _: &MockAllocator| -> Vec<KciResponseElement> { Vec::new() };
        assert!(silent
            .on_command(&CommandElement::default(), &mem)
            .is_empty());
    }
}
