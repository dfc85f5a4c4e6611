//! Chip-specific reverse KCI requests
//!
//! Mobile chips let the firmware ask the host for memory-interface and
//! internal-bus bandwidth (PM QoS) and for bus traffic shaping (BTS).

use std::sync::{Mutex, MutexGuard};

use tpu_kci::ChipReverseHandler;
use tpu_mailbox::sync::lock;
use tpu_mailbox::KciResponseElement;

pub const RKCI_CODE_PM_QOS: u16 = 1;
pub const RKCI_CODE_BTS: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipRequest {
    /// Minimum clock rates, in kHz
    PmQos { int_khz: u32, mif_khz: u32 },
    Bts { active: bool },
}

impl ChipRequest {
    /// Decode a reverse request; `None` for codes or values no handler
    /// accepts
    pub fn decode(code: u16, value: u32) -> Option<Self> {
        match code {
            RKCI_CODE_PM_QOS => Some(Self::PmQos {
                int_khz: (value >> 16) * 1000,
                mif_khz: (value & 0xFFFF) * 1000,
            }),
            RKCI_CODE_BTS => match value {
                0 => Some(Self::Bts { active: false }),
                1 => Some(Self::Bts { active: true }),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Performance settings the firmware last asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerformanceState {
    pub int_khz: u32,
    pub mif_khz: u32,
    pub bts_active: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    state: PerformanceState,
    history: Vec<ChipRequest>,
}

/// Reverse-KCI handler for Janeiro
#[derive(Debug, Default)]
pub struct JaneiroReverseHandler {
    recorded: Mutex<Recorded>,
}

impl JaneiroReverseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        lock(&self.recorded)
    }

    pub fn state(&self) -> PerformanceState {
        self.recorded().state
    }

    /// Every accepted request, oldest first
    pub fn requests(&self) -> Vec<ChipRequest> {
        self.recorded().history.clone()
    }
}

impl ChipReverseHandler for JaneiroReverseHandler {
    fn handle(&self, resp: &KciResponseElement) {
        let Some(request) = ChipRequest::decode(resp.code, resp.retval) else {
            match resp.code {
                RKCI_CODE_BTS => log::warn!("rkci: invalid BTS request value {}", resp.retval),
                code => log::warn!("rkci: unrecognized KCI request {code:#x}"),
            }
            return;
        };

        let mut recorded = self.recorded();
        match request {
            ChipRequest::PmQos { int_khz, mif_khz } => {
                log::debug!("rkci: pm qos int={int_khz} kHz mif={mif_khz} kHz");
                recorded.state.int_khz = int_khz;
                recorded.state.mif_khz = mif_khz;
            }
            ChipRequest::Bts { active } => {
                log::debug!("rkci: bts {}", if active { "on" } else { "off" });
                recorded.state.bts_active = active;
            }
        }
        recorded.history.push(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pm_qos() {
        assert_eq!(
            ChipRequest::decode(RKCI_CODE_PM_QOS, (800 << 16) | 1539),
            Some(ChipRequest::PmQos {
                int_khz: 800_000,
                mif_khz: 1_539_000
            })
        );
    }

    #[test]
    fn test_decode_bts() {
        assert_eq!(
            ChipRequest::decode(RKCI_CODE_BTS, 1),
            Some(ChipRequest::Bts { active: true })
        );
        assert_eq!(ChipRequest::decode(RKCI_CODE_BTS, 2), None);
        assert_eq!(ChipRequest::decode(0x77, 0), None);
    }

    #[test]
    fn test_handler_tracks_state() {
        let handler = JaneiroReverseHandler::new();
        handler.handle(&KciResponseElement::reverse(RKCI_CODE_PM_QOS, (400 << 16) | 200));
        handler.handle(&KciResponseElement::reverse(RKCI_CODE_BTS, 1));
        handler.handle(&KciResponseElement::reverse(RKCI_CODE_BTS, 7));
        handler.handle(&KciResponseElement::reverse(0x99, 0));

        assert_eq!(
            handler.state(),
            PerformanceState {
                int_khz: 400_000,
                mif_khz: 200_000,
                bts_active: true
            }
        );
        assert_eq!(handler.requests().len(), 2);
    }
}
