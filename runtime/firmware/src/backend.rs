//! Chip-specific steps of firmware loading
//!
//! # Purpose
//! The generic loader in [`crate::firmware`] calls a [`FirmwareBackend`] at
//! fixed points: before and after it reads an image, before it starts the
//! control core, and when it restarts or tears down. Every step has a
//! no-op default, so a backend only implements what its chip needs.
//!
//! # Buffers
//! A backend that sets [`FirmwareBuffer::data`] in `alloc_buffer` gets the
//! image copied into that private buffer. Otherwise the image comes from
//! the [`SharedFirmwareRegistry`](crate::shared::SharedFirmwareRegistry)
//! and the buffer only refers to it.
//!
//! # Mobile image layout
//! ```text
//!  0x000 ┌────────────────────────────┐
//!        │ signature, key, hash       │
//!  0x840 │ image config + versions    │
//! 0x1000 ├────────────────────────────┤
//!        │ firmware body              │
//!        └────────────────────────────┘
//! ```

use bitflags::bitflags;
use tpu_kci::Kci;

use crate::config::BackendKind;
use crate::control::ChipControl;
use crate::shared::SharedFirmware;
use crate::{FirmwareError, Result};

/// Header in front of every mobile firmware image
pub const MOBILE_FW_HEADER_SIZE: usize = 0x1000;
/// Offset of the image config inside the header
pub const IMAGE_CONFIG_OFFSET: usize = 0x840;

bitflags! {
    /// How an image is to be run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FirmwareFlags: u32 {
        const DEFAULT = 0x1;
        /// Second-stage bootloader; does not replace the running image
        const BL1 = 0x2;
        /// The image is already resident on the device
        const ON_DEVICE = 0x4;
    }
}

/// Versions the image header declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub vii: u32,
    pub kci: u32,
}

impl FirmwareVersion {
    /// Read the versions from a mobile image header
    ///
    /// The image config holds the carveout base, firmware base and
    /// firmware size (one little-endian `u32` each) followed by the four
    /// versions.
    pub fn from_header(header: &[u8]) -> Option<Self> {
        let word = |index: usize| -> Option<u32> {
            let start = IMAGE_CONFIG_OFFSET + 12 + index * 4;
            let bytes = header.get(start..start + 4)?;
            Some(u32::from_le_bytes(bytes.try_into().ok()?))
        };
        Some(Self {
            major: word(0)?,
            minor: word(1)?,
            vii: word(2)?,
            kci: word(3)?,
        })
    }
}

impl core::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}.{} vii={} kci={}",
            self.major, self.minor, self.vii, self.kci
        )
    }
}

/// One loaded (or loading) image
#[derive(Debug, Default)]
pub struct FirmwareBuffer {
    pub flags: FirmwareFlags,
    /// Private copy target set up by the backend
    pub data: Option<Vec<u8>>,
    pub alloc_size: usize,
    /// Bytes of the buffer the image occupies, after alignment
    pub used_size: usize,
    pub used_size_align: usize,
    /// Filled in by backends that parse the image header
    pub version: Option<FirmwareVersion>,
    pub(crate) name: Option<String>,
    pub(crate) shared: Option<SharedFirmware>,
}

impl FirmwareBuffer {
    pub(crate) fn with_flags(flags: FirmwareFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The image as the backend should see it
    pub fn contents(&self) -> &[u8] {
        if let Some(shared) = &self.shared {
            return shared.data();
        }
        match &self.data {
            Some(data) => &data[..self.used_size.min(data.len())],
            None => &[],
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.used_size > 0
    }
}

/// What a backend may touch while it runs
pub struct BackendContext<'a> {
    pub kci: &'a Kci,
    pub chip: &'a dyn ChipControl,
}

pub trait FirmwareBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn after_create(&self, _ctx: &BackendContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Stop the running firmware before the loader goes away
    fn before_destroy(&self, _ctx: &BackendContext<'_>) {}

    fn alloc_buffer(&self, _ctx: &BackendContext<'_>, _buf: &mut FirmwareBuffer) -> Result<()> {
        Ok(())
    }

    fn free_buffer(&self, _buf: &mut FirmwareBuffer) {}

    /// Called once the image is in `buf`
    fn setup_buffer(&self, _ctx: &BackendContext<'_>, _buf: &mut FirmwareBuffer) -> Result<()> {
        Ok(())
    }

    fn teardown_buffer(&self, _buf: &mut FirmwareBuffer) {}

    /// Start the control core on `buf`
    fn prepare_run(&self, _ctx: &BackendContext<'_>, _buf: &FirmwareBuffer) -> Result<()> {
        Ok(())
    }

    /// Restart the image already in place
    ///
    /// The loader falls back to `prepare_run` when this fails.
    fn restart(&self, _ctx: &BackendContext<'_>) -> Result<()> {
        Err(FirmwareError::Unsupported("restart"))
    }
}

/// Backend for `kind`
pub fn backend_for(kind: BackendKind) -> Box<dyn FirmwareBackend> {
    match kind {
        BackendKind::Default => Box::new(DefaultBackend),
        BackendKind::Janeiro => Box::new(JaneiroBackend),
        BackendKind::Abrolhos => Box::new(AbrolhosBackend),
    }
}

/// Images come from the shared registry, no chip steps
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackend;

impl FirmwareBackend for DefaultBackend {
    fn name(&self) -> &'static str {
        "default"
    }
}

fn alloc_private(buf: &mut FirmwareBuffer, size: usize, align: usize) {
    buf.data = Some(vec![0; size]);
    buf.alloc_size = size;
    buf.used_size_align = align;
}

fn free_private(buf: &mut FirmwareBuffer) {
    buf.data = None;
    buf.alloc_size = 0;
    buf.used_size_align = 0;
}

fn check_header(buf: &FirmwareBuffer) -> Result<FirmwareVersion> {
    if buf.used_size < MOBILE_FW_HEADER_SIZE {
        return Err(FirmwareError::InvalidImage(format!(
            "{} bytes is smaller than the {MOBILE_FW_HEADER_SIZE} byte header",
            buf.used_size
        )));
    }
    FirmwareVersion::from_header(buf.contents())
        .ok_or_else(|| FirmwareError::InvalidImage("truncated image config".into()))
}

/// Janeiro: the host copies the image body into the carveout and points
/// the R52 core at it through the instruction remap registers
#[derive(Debug, Default, Clone, Copy)]
pub struct JaneiroBackend;

impl FirmwareBackend for JaneiroBackend {
    fn name(&self) -> &'static str {
        "janeiro"
    }

    fn before_destroy(&self, ctx: &BackendContext<'_>) {
        ctx.chip.set_core_reset(true);
    }

    fn alloc_buffer(&self, ctx: &BackendContext<'_>, buf: &mut FirmwareBuffer) -> Result<()> {
        let size = ctx.chip.firmware_region().size + MOBILE_FW_HEADER_SIZE;
        alloc_private(buf, size, 16);
        Ok(())
    }

    fn free_buffer(&self, buf: &mut FirmwareBuffer) {
        free_private(buf);
    }

    fn setup_buffer(&self, ctx: &BackendContext<'_>, buf: &mut FirmwareBuffer) -> Result<()> {
        let version = check_header(buf)?;
        buf.version = Some(version);
        ctx.chip
            .write_firmware_region(&buf.contents()[MOBILE_FW_HEADER_SIZE..])
    }

    fn prepare_run(&self, ctx: &BackendContext<'_>, _buf: &FirmwareBuffer) -> Result<()> {
        ctx.chip.set_core_reset(true);
        // nothing queued for the old image may reach the new one
        ctx.kci.reset()?;
        ctx.chip.remap_instructions(ctx.chip.firmware_region().base);
        ctx.chip.set_core_reset(false);
        Ok(())
    }
}

/// Abrolhos: the signed image, header included, goes to the carveout where
/// the secure loader authenticates it. The authenticated image stays in
/// place, so a restart only has to release the core again.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbrolhosBackend;

impl FirmwareBackend for AbrolhosBackend {
    fn name(&self) -> &'static str {
        "abrolhos"
    }

    fn before_destroy(&self, ctx: &BackendContext<'_>) {
        ctx.chip.set_core_reset(true);
    }

    fn alloc_buffer(&self, ctx: &BackendContext<'_>, buf: &mut FirmwareBuffer) -> Result<()> {
        alloc_private(buf, ctx.chip.firmware_region().size, 4096);
        Ok(())
    }

    fn free_buffer(&self, buf: &mut FirmwareBuffer) {
        free_private(buf);
    }

    fn setup_buffer(&self, ctx: &BackendContext<'_>, buf: &mut FirmwareBuffer) -> Result<()> {
        let version = check_header(buf)?;
        buf.version = Some(version);
        ctx.chip.write_firmware_region(buf.contents())
    }

    fn prepare_run(&self, ctx: &BackendContext<'_>, _buf: &FirmwareBuffer) -> Result<()> {
        ctx.chip.set_core_reset(true);
        ctx.kci.reset()?;
        ctx.chip.set_core_reset(false);
        Ok(())
    }

    fn restart(&self, ctx: &BackendContext<'_>) -> Result<()> {
        ctx.chip.set_core_reset(true);
        ctx.kci.reset()?;
        ctx.chip.set_core_reset(false);
        Ok(())
    }
}
