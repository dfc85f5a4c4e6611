//! Queue Element ABI
//!
//! Fixed-size records exchanged through the command and response queues.
//! Queue memory is an array of little-endian 64-bit words; every element
//! type knows how many words it occupies and how to pack itself into them.
//! The layouts must stay identical to the firmware build.

use static_assertions::const_assert_eq;

/// Bit of `seq` set by the firmware on requests it originates (reverse KCI)
pub const KCI_REVERSE_FLAG: u64 = 1 << 63;

/// A record that can live in a mailbox queue
pub trait QueueElement: Copy + Default + Send + Sync + 'static {
    /// Size of one element in 64-bit words
    const WORDS: usize;

    /// Pack into `out`, which holds exactly `WORDS` words
    fn encode(&self, out: &mut [u64]);

    /// Unpack from `words`, which holds exactly `WORDS` words
    fn decode(words: &[u64]) -> Self;

    /// Size of one element in bytes
    fn byte_size() -> usize {
        Self::WORDS * 8
    }

    /// Hook run on every element the host copies out of a response queue
    fn mark_fetched(&mut self) {}
}

/// Direction of a DMA buffer handed to the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum DmaDirection {
    #[default]
    Bidirectional = 0,
    ToDevice = 1,
    FromDevice = 2,
    None = 3,
}

/// Buffer described to the firmware in a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaDescriptor {
    /// Device address of the buffer
    pub address: u64,
    /// Size in bytes
    pub size: u32,
    /// Direction, or a command-specific word (mailbox id mask for OPEN_DEVICE)
    pub flags: u32,
}

impl DmaDescriptor {
    pub const EMPTY: Self = Self {
        address: 0,
        size: 0,
        flags: 0,
    };

    pub fn new(address: u64, size: u32, direction: DmaDirection) -> Self {
        Self {
            address,
            size,
            flags: direction as u32,
        }
    }

    /// Descriptor carrying only a flags word
    pub fn with_flags(flags: u32) -> Self {
        Self {
            flags,
            ..Self::EMPTY
        }
    }
}

/// Command queue element, written by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandElement {
    /// Assigned when the command is pushed
    pub seq: u64,
    pub code: u64,
    pub dma: DmaDescriptor,
}

impl CommandElement {
    pub fn new(code: u64, dma: DmaDescriptor) -> Self {
        Self { seq: 0, code, dma }
    }
}

impl QueueElement for CommandElement {
    const WORDS: usize = 4;

    fn encode(&self, out: &mut [u64]) {
        out[0] = self.seq;
        out[1] = self.code;
        out[2] = self.dma.address;
        out[3] = u64::from(self.dma.size) | (u64::from(self.dma.flags) << 32);
    }

    fn decode(words: &[u64]) -> Self {
        Self {
            seq: words[0],
            code: words[1],
            dma: DmaDescriptor {
                address: words[2],
                size: words[3] as u32,
                flags: (words[3] >> 32) as u32,
            },
        }
    }
}

/// Host-side bookkeeping state of a response
///
/// The firmware may not rely on this field: the host overwrites it when the
/// element is fetched from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Ok,
    WaitingResponse,
    /// An earlier-sequenced command was skipped by the response stream
    NoResponse,
    /// Failed locally by teardown
    Cancelled,
    Unknown(u16),
}

impl ResponseStatus {
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::WaitingResponse,
            2 => Self::NoResponse,
            3 => Self::Cancelled,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::WaitingResponse => 1,
            Self::NoResponse => 2,
            Self::Cancelled => 3,
            Self::Unknown(raw) => raw,
        }
    }
}

/// KCI response queue element, written by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KciResponseElement {
    pub seq: u64,
    /// Error code of the command, or the request code of a reverse KCI
    pub code: u16,
    pub status: u16,
    /// Firmware-defined return value (crash type for FIRMWARE_CRASH)
    pub retval: u32,
}

impl KciResponseElement {
    pub fn new(seq: u64, code: u16, retval: u32) -> Self {
        Self {
            seq,
            code,
            status: ResponseStatus::Ok.raw(),
            retval,
        }
    }

    /// Build a firmware-originated request
    pub fn reverse(code: u16, retval: u32) -> Self {
        Self::new(KCI_REVERSE_FLAG, code, retval)
    }

    pub fn is_reverse(&self) -> bool {
        self.seq & KCI_REVERSE_FLAG != 0
    }

    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_raw(self.status)
    }

    pub fn set_status(&mut self, status: ResponseStatus) {
        self.status = status.raw();
    }
}

impl QueueElement for KciResponseElement {
    const WORDS: usize = 2;

    fn encode(&self, out: &mut [u64]) {
        out[0] = self.seq;
        out[1] = u64::from(self.code)
            | (u64::from(self.status) << 16)
            | (u64::from(self.retval) << 32);
    }

    fn decode(words: &[u64]) -> Self {
        Self {
            seq: words[0],
            code: words[1] as u16,
            status: (words[1] >> 16) as u16,
            retval: (words[1] >> 32) as u32,
        }
    }

    fn mark_fetched(&mut self) {
        self.set_status(ResponseStatus::Ok);
    }
}

// Firmware ABI sizes
const_assert_eq!(CommandElement::WORDS * 8, 32);
const_assert_eq!(KciResponseElement::WORDS * 8, 16);
