//! KCI operations
//!
//! Thin wrappers over [`Kci::send_command`] that fix the command code and
//! the shape of the DMA payload. Operations with a reply buffer allocate it
//! from the session's device-memory allocator for the duration of the call.

use tpu_mailbox::{CoherentMem, CommandElement, DmaDescriptor, DmaDirection, KciResponseElement};

use crate::error::KciErrorCode;
use crate::session::Kci;
use crate::{KciError, Result};

/// Command codes understood by the control firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum KciCode {
    Ack = 0,
    UnmapBuffer = 1,
    MapLogBuffer = 2,
    JoinGroup = 3,
    LeaveGroup = 4,
    MapTraceBuffer = 5,
    Shutdown = 7,
    GetDebugDump = 8,
    OpenDevice = 9,
    CloseDevice = 10,
    FirmwareInfo = 11,
    GetUsage = 12,
}

impl KciCode {
    pub const fn raw(self) -> u64 {
        self as u64
    }
}

/// Which image the firmware reports running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FirmwareFlavor {
    /// Old firmware that cannot tell, or an unrecognized value
    #[default]
    Unknown,
    Bl1,
    Systest,
    Prod,
    Custom,
}

impl FirmwareFlavor {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Bl1,
            2 => Self::Systest,
            3 => Self::Prod,
            4 => Self::Custom,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bl1 => "stage 2 bootloader",
            Self::Systest => "test",
            Self::Prod => "prod",
            Self::Custom => "custom",
            Self::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for FirmwareFlavor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FIRMWARE_INFO reply record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FwInfo {
    /// Seconds since the epoch
    pub build_time: u32,
    pub flavor: u32,
    pub changelist: u32,
}

impl FwInfo {
    pub const SIZE: usize = 32;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            build_time: word(0),
            flavor: word(4),
            changelist: word(8),
        }
    }
}

/// GET_USAGE reply: a header followed by metric records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub num_metrics: u32,
    /// Bytes per metric record
    pub metric_size: u32,
    /// The whole reply buffer, header included
    pub raw: Vec<u8>,
}

impl UsageReport {
    pub const BUFFER_SIZE: usize = 4096;
    pub const HEADER_SIZE: usize = 8;

    /// Split a reply buffer into header and records
    pub fn parse(mut raw: Vec<u8>) -> Self {
        if raw.len() < Self::HEADER_SIZE {
            raw.resize(Self::HEADER_SIZE, 0);
        }
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            num_metrics: word(0),
            metric_size: word(4),
            raw,
        }
    }

    /// Metric records, clipped to the buffer
    pub fn metrics(&self) -> impl Iterator<Item = &[u8]> {
        let size = self.metric_size as usize;
        let body = &self.raw[Self::HEADER_SIZE..];
        let count = if size == 0 {
            0
        } else {
            (self.num_metrics as usize).min(body.len() / size)
        };
        body.chunks_exact(size.max(1)).take(count)
    }
}

/// Device-memory scratch buffer freed on drop
struct Scratch<'a> {
    kci: &'a Kci,
    mem: Option<CoherentMem>,
}

impl<'a> Scratch<'a> {
    fn alloc(kci: &'a Kci, size: usize) -> Result<Self> {
        let mem = kci.allocator().alloc(size)?;
        Ok(Self {
            kci,
            mem: Some(mem),
        })
    }

    fn mem(&self) -> Option<&CoherentMem> {
        self.mem.as_ref()
    }

    fn descriptor(&self, direction: DmaDirection) -> DmaDescriptor {
        self.mem().map_or(DmaDescriptor::EMPTY, |mem| {
            DmaDescriptor::new(mem.device_addr(), mem.size() as u32, direction)
        })
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            self.kci.allocator().free(mem);
        }
    }
}

/// Map a firmware error code to the crate error
fn check_code(resp: &KciResponseElement) -> Result<()> {
    match KciErrorCode::from_raw(resp.code) {
        Some(KciErrorCode::Ok) => Ok(()),
        Some(KciErrorCode::Unimplemented) => Err(KciError::Unimplemented),
        _ => Err(KciError::Device { code: resp.code }),
    }
}

impl Kci {
    /// Send a command and fail on a non-OK firmware code
    ///
    /// Returns the firmware's return value.
    pub fn send_cmd(&self, code: KciCode, dma: DmaDescriptor) -> Result<u32> {
        let resp = self.send_command(CommandElement::new(code.raw(), dma))?;
        check_code(&resp)?;
        Ok(resp.retval)
    }

    /// Round trip with no payload
    pub fn ack(&self) -> Result<()> {
        self.send_cmd(KciCode::Ack, DmaDescriptor::EMPTY).map(drop)
    }

    pub fn unmap_buffer(&self, device_addr: u64, size: u32, direction: DmaDirection) -> Result<()> {
        self.send_cmd(
            KciCode::UnmapBuffer,
            DmaDescriptor::new(device_addr, size, direction),
        )
        .map(drop)
    }

    /// Tell the firmware where to write its log
    pub fn map_log_buffer(&self, device_addr: u64, size: u32) -> Result<()> {
        self.send_cmd(
            KciCode::MapLogBuffer,
            DmaDescriptor::new(device_addr, size, DmaDirection::Bidirectional),
        )
        .map(drop)
    }

    /// Tell the firmware where to write its trace
    pub fn map_trace_buffer(&self, device_addr: u64, size: u32) -> Result<()> {
        self.send_cmd(
            KciCode::MapTraceBuffer,
            DmaDescriptor::new(device_addr, size, DmaDirection::Bidirectional),
        )
        .map(drop)
    }

    /// Join this die to a device group
    ///
    /// # Arguments
    /// * `n_dies` - dies in the group
    /// * `vid` - virtual id of this die within the group
    pub fn join_group(&self, n_dies: u8, vid: u8) -> Result<()> {
        const DETAIL_SIZE: usize = 8;
        let detail = Scratch::alloc(self, DETAIL_SIZE)?;
        if let Some(mem) = detail.mem() {
            mem.buffer().write_bytes(0, &[n_dies, vid]);
        }
        self.send_cmd(
            KciCode::JoinGroup,
            detail.descriptor(DmaDirection::ToDevice),
        )
        .map(drop)
    }

    pub fn leave_group(&self) -> Result<()> {
        self.send_cmd(KciCode::LeaveGroup, DmaDescriptor::EMPTY)
            .map(drop)
    }

    /// Handshake: ask the firmware what it is
    ///
    /// Also used as the first command after a firmware run. If the reply
    /// buffer cannot be allocated the command still goes out without one.
    /// Firmware that does not implement the query reports
    /// [`FirmwareFlavor::Unknown`].
    pub fn fw_info(&self) -> Result<(FirmwareFlavor, FwInfo)> {
        let info_buf = Scratch::alloc(self, FwInfo::SIZE).unwrap_or_else(|e| {
            log::warn!("kci: firmware info buffer: {e}, asking without one");
            Scratch {
                kci: self,
                mem: None,
            }
        });
        let resp = self.send_command(CommandElement::new(
            KciCode::FirmwareInfo.raw(),
            info_buf.descriptor(DmaDirection::FromDevice),
        ))?;

        match check_code(&resp) {
            Ok(()) => {}
            Err(KciError::Unimplemented) => return Ok((FirmwareFlavor::Unknown, FwInfo::default())),
            Err(e) => return Err(e),
        }
        let info = info_buf.mem().map_or_else(FwInfo::default, |mem| {
            let mut bytes = [0u8; FwInfo::SIZE];
            mem.buffer().read_bytes(0, &mut bytes);
            FwInfo::from_bytes(&bytes)
        });
        let flavor = FirmwareFlavor::from_raw(info.flavor);
        if flavor == FirmwareFlavor::Unknown {
            log::debug!("kci: unrecognized firmware flavor {}", info.flavor);
        }
        Ok((flavor, info))
    }

    /// Fetch usage statistics
    ///
    /// Returns `None` if the firmware does not report usage.
    pub fn get_usage(&self) -> Result<Option<UsageReport>> {
        let buf = Scratch::alloc(self, UsageReport::BUFFER_SIZE)?;
        // an OK reply that writes nothing must read as an empty report
        if let Some(mem) = buf.mem() {
            mem.buffer()
                .write_bytes(0, &[0u8; UsageReport::HEADER_SIZE]);
        }
        let resp = self.send_command(CommandElement::new(
            KciCode::GetUsage.raw(),
            buf.descriptor(DmaDirection::FromDevice),
        ))?;
        match KciErrorCode::from_raw(resp.code) {
            Some(KciErrorCode::Ok) => {}
            Some(KciErrorCode::Unimplemented | KciErrorCode::Unavailable) => return Ok(None),
            _ => return Err(KciError::Device { code: resp.code }),
        }
        let mut raw = vec![0u8; UsageReport::BUFFER_SIZE];
        if let Some(mem) = buf.mem() {
            mem.buffer().read_bytes(0, &mut raw);
        }
        Ok(Some(UsageReport::parse(raw)))
    }

    /// Ask the firmware to stop; it does not answer once down
    pub fn shutdown(&self) -> Result<()> {
        self.send_cmd(KciCode::Shutdown, DmaDescriptor::EMPTY)
            .map(drop)
    }

    /// Ask the firmware to write a debug dump into the given buffer
    pub fn get_debug_dump(&self, device_addr: u64, size: u32) -> Result<()> {
        self.send_cmd(
            KciCode::GetDebugDump,
            DmaDescriptor::new(device_addr, size, DmaDirection::FromDevice),
        )
        .map(drop)
    }

    /// Tell the firmware the mailboxes in `mailbox_ids` are in use
    pub fn open_device(&self, mailbox_ids: u32) -> Result<()> {
        self.send_cmd(KciCode::OpenDevice, DmaDescriptor::with_flags(mailbox_ids))
            .map(drop)
    }

    pub fn close_device(&self, mailbox_ids: u32) -> Result<()> {
        self.send_cmd(KciCode::CloseDevice, DmaDescriptor::with_flags(mailbox_ids))
            .map(drop)
    }
}
