//! Firmware loader
//!
//! # Purpose
//! Brings the control firmware up and keeps track of what runs:
//! - [`Firmware::run`] reads an image, lets the backend start the control
//!   core on it and confirms with the KCI info handshake
//! - [`Firmware::restart`] restarts the image in place after a crash
//! - a firmware crash reported over reverse KCI is recovered here
//!
//! # Run sequence
//! ```text
//! status = Loading
//!   alloc_buffer ─► read image ─► setup_buffer          (new descriptor)
//!   prepare_run                                          (core starts)
//!   unload previous descriptor, install new one
//!   fw_info handshake
//! status = Valid | Invalid, device state = Good | Bad | NoFirmware
//! ```
//! A failure before the swap unloads the new descriptor and leaves the
//! previous one installed.
//!
//! # Integration Points
//! - [`Firmware::create`] installs the crash handler on the KCI session.
//! - Crash recovery clears the [`Handshake`] firmware state and marks
//!   finalized groups in the [`GroupRegistry`] errored.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tpu_kci::{CrashType, FirmwareCrashHandler, FirmwareFlavor, FwInfo, Handshake, Kci};
use tpu_mailbox::sync::lock;

use crate::backend::{BackendContext, FirmwareBackend, FirmwareBuffer, FirmwareFlags, FirmwareVersion};
use crate::control::ChipControl;
use crate::groups::GroupRegistry;
use crate::shared::SharedFirmwareRegistry;
use crate::source::FirmwareSource;
use crate::{FirmwareError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FirmwareStatus {
    Invalid = 0,
    Loading = 1,
    Valid = 2,
}

impl FirmwareStatus {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Loading,
            2 => Self::Valid,
            _ => Self::Invalid,
        }
    }
}

/// What the rest of the driver may do with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NoFirmware,
    Loading,
    /// The firmware answered the handshake
    Good,
    /// The firmware was started but did not answer
    Bad,
}

/// Result of the last successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareInfo {
    pub flavor: FirmwareFlavor,
    pub build_time: u32,
    pub changelist: u32,
}

/// Everything the loader works with besides its backend
pub struct FirmwareEnv {
    pub kci: Kci,
    pub chip: Arc<dyn ChipControl>,
    pub registry: SharedFirmwareRegistry,
    pub source: Arc<dyn FirmwareSource>,
    pub handshake: Arc<Handshake>,
    pub groups: Arc<GroupRegistry>,
}

#[derive(Default)]
struct Descriptors {
    current: FirmwareBuffer,
    bl1: FirmwareBuffer,
}

pub struct Firmware {
    env: FirmwareEnv,
    backend: Box<dyn FirmwareBackend>,
    descriptors: Mutex<Descriptors>,
    status: AtomicU8,
    device_state: Mutex<DeviceState>,
    info: Mutex<FirmwareInfo>,
    crash_count: AtomicU64,
    destroyed: AtomicBool,
}

/// Reverse-KCI crash handler; holds the loader weakly since the session
/// it is registered with is owned by the loader
struct CrashRecovery(Weak<Firmware>);

impl FirmwareCrashHandler for CrashRecovery {
    fn firmware_crashed(&self, crash: CrashType) {
        if let Some(firmware) = self.0.upgrade() {
            firmware.handle_crash(crash);
        }
    }
}

impl Firmware {
    /// Set up the loader and take over firmware-crash requests
    ///
    /// # Errors
    /// Whatever the backend's `after_create` reports.
    pub fn create(env: FirmwareEnv, backend: Box<dyn FirmwareBackend>) -> Result<Arc<Self>> {
        backend.after_create(&BackendContext {
            kci: &env.kci,
            chip: &*env.chip,
        })?;
        let firmware = Arc::new(Self {
            env,
            backend,
            descriptors: Mutex::new(Descriptors::default()),
            status: AtomicU8::new(FirmwareStatus::Invalid as u8),
            device_state: Mutex::new(DeviceState::NoFirmware),
            info: Mutex::new(FirmwareInfo::default()),
            crash_count: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });
        firmware
            .env
            .kci
            .set_crash_handler(Arc::new(CrashRecovery(Arc::downgrade(&firmware))));
        log::debug!("firmware: {} loader ready", firmware.backend.name());
        Ok(firmware)
    }

    fn ctx(&self) -> BackendContext<'_> {
        BackendContext {
            kci: &self.env.kci,
            chip: &*self.env.chip,
        }
    }

    /// Load `name` and start the control core on it
    ///
    /// # Errors
    /// - `Busy` if a device group is alive
    /// - `NotFound`/`Io`/`NoSpace`/`InvalidImage` if the image cannot be
    ///   used; the device state becomes `NoFirmware`
    /// - `Handshake` if the started firmware does not answer; the device
    ///   state becomes `Bad`
    pub fn run(&self, name: &str, flags: FirmwareFlags) -> Result<()> {
        let mut desc = lock(&self.descriptors);
        if !self.env.groups.set_join_lockout(true) {
            log::error!("firmware: cannot load {name}, device is in use");
            return Err(FirmwareError::Busy);
        }
        let result = self.run_locked(&mut desc, name, flags);
        self.env.groups.set_join_lockout(false);
        result
    }

    fn run_locked(&self, desc: &mut Descriptors, name: &str, flags: FirmwareFlags) -> Result<()> {
        self.set_loading();
        let result = self.load_and_start(desc, name, flags);
        self.set_state(&result);
        result
    }

    fn load_and_start(&self, desc: &mut Descriptors, name: &str, flags: FirmwareFlags) -> Result<()> {
        let mut new_desc = self.load_locked(name, flags)?;

        log::debug!("firmware: run {name} flags={:#x}", flags.bits());
        if let Err(e) = self.backend.prepare_run(&self.ctx(), &new_desc) {
            log::error!("firmware: {} failed to start {name}: {e}", self.backend.name());
            self.unload_locked(&mut new_desc);
            return Err(e);
        }

        // the core now runs from the new buffer
        let slot = if flags.contains(FirmwareFlags::BL1) {
            &mut desc.bl1
        } else {
            &mut desc.current
        };
        let mut old = core::mem::replace(slot, new_desc);
        self.unload_locked(&mut old);

        self.handshake(slot)
    }

    fn load_locked(&self, name: &str, flags: FirmwareFlags) -> Result<FirmwareBuffer> {
        let ctx = self.ctx();
        let mut buf = FirmwareBuffer::with_flags(flags);

        if let Err(e) = self.backend.alloc_buffer(&ctx, &mut buf) {
            log::debug!("firmware: alloc_buffer failed: {e}");
            return Err(e);
        }
        if let Err(e) = self.do_load(&mut buf, name) {
            log::debug!("firmware: request for {name} failed: {e}");
            self.backend.free_buffer(&mut buf);
            return Err(e);
        }
        if let Err(e) = self.backend.setup_buffer(&ctx, &mut buf) {
            log::debug!("firmware: setup_buffer failed: {e}");
            Self::do_unload(&mut buf);
            self.backend.free_buffer(&mut buf);
            return Err(e);
        }
        Ok(buf)
    }

    /// Fill `buf` from the shared registry, or copy into the backend's
    /// private buffer if it set one up
    fn do_load(&self, buf: &mut FirmwareBuffer, name: &str) -> Result<()> {
        let Some(data) = buf.data.as_mut() else {
            let shared = self.env.registry.load(name, &*self.env.source)?;
            buf.alloc_size = shared.size();
            buf.used_size = shared.size();
            buf.name = Some(name.to_owned());
            buf.shared = Some(shared);
            return Ok(());
        };

        let image = self.env.source.request(name)?;
        let aligned = image.len().next_multiple_of(buf.used_size_align.max(1));
        if aligned > buf.alloc_size || image.len() > data.len() {
            log::debug!(
                "firmware: buffer too small: alloc size={:#x}, required size={:#x}",
                buf.alloc_size,
                aligned
            );
            return Err(FirmwareError::NoSpace {
                required: aligned,
                available: buf.alloc_size,
            });
        }
        data[..image.len()].copy_from_slice(&image);
        buf.used_size = aligned;
        buf.name = Some(name.to_owned());
        Ok(())
    }

    fn do_unload(buf: &mut FirmwareBuffer) {
        if buf.shared.take().is_some() {
            buf.alloc_size = 0;
        }
        buf.used_size = 0;
        buf.name = None;
    }

    fn unload_locked(&self, buf: &mut FirmwareBuffer) {
        self.backend.teardown_buffer(buf);
        Self::do_unload(buf);
        self.backend.free_buffer(buf);
    }

    fn handshake(&self, loaded: &FirmwareBuffer) -> Result<()> {
        log::debug!("firmware: detecting firmware info");
        *lock(&self.info) = FirmwareInfo::default();

        let (flavor, fw_info) = match self.env.kci.fw_info() {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("firmware: handshake failed: {e}");
                return Err(FirmwareError::Handshake(e));
            }
        };
        if flavor == FirmwareFlavor::Bl1 {
            log::debug!("firmware: loaded stage 2 bootloader");
        } else {
            let on_device = if loaded.flags.contains(FirmwareFlags::ON_DEVICE) {
                " on device"
            } else {
                ""
            };
            let version = loaded.version.unwrap_or_default();
            log::info!(
                "firmware: loaded {flavor} firmware{on_device} ({}.{} {})",
                version.major,
                version.minor,
                fw_info.changelist
            );
        }
        *lock(&self.info) = Self::info_from(flavor, fw_info);
        Ok(())
    }

    fn info_from(flavor: FirmwareFlavor, info: FwInfo) -> FirmwareInfo {
        FirmwareInfo {
            flavor,
            build_time: info.build_time,
            changelist: info.changelist,
        }
    }

    fn set_loading(&self) {
        *lock(&self.device_state) = DeviceState::Loading;
        self.status
            .store(FirmwareStatus::Loading as u8, Ordering::Release);
    }

    fn set_state(&self, result: &Result<()>) {
        let (status, state) = match result {
            Ok(()) => (FirmwareStatus::Valid, DeviceState::Good),
            Err(FirmwareError::Handshake(_)) => (FirmwareStatus::Invalid, DeviceState::Bad),
            Err(_) => (FirmwareStatus::Invalid, DeviceState::NoFirmware),
        };
        self.status.store(status as u8, Ordering::Release);
        *lock(&self.device_state) = state;
    }

    /// Restart the installed image
    ///
    /// Tries the backend's in-place restart first and falls back to
    /// starting the core afresh.
    ///
    /// # Errors
    /// `NotLoaded` if nothing was ever run; otherwise as for
    /// [`Firmware::run`].
    pub fn restart(&self) -> Result<()> {
        let desc = lock(&self.descriptors);
        self.restart_locked(&desc)
    }

    fn restart_locked(&self, desc: &Descriptors) -> Result<()> {
        if !desc.current.is_loaded() {
            return Err(FirmwareError::NotLoaded);
        }
        self.set_loading();
        let result = self.restart_core(desc);
        self.set_state(&result);
        result
    }

    fn restart_core(&self, desc: &Descriptors) -> Result<()> {
        let ctx = self.ctx();
        if let Err(e) = self.backend.restart(&ctx) {
            log::debug!("firmware: in-place restart unavailable ({e}), starting afresh");
            self.backend.prepare_run(&ctx, &desc.current)?;
        }
        self.handshake(&desc.current)
    }

    /// Recover from a crash the firmware reported
    ///
    /// Every crash is counted. Only an unrecoverable fault stops the
    /// firmware: the mailboxes it knew and the groups set up with it are
    /// invalidated, and it is restarted unless a load is already running.
    pub fn handle_crash(&self, crash: CrashType) {
        let count = self.crash_count.fetch_add(1, Ordering::AcqRel) + 1;
        if !crash.is_fatal() {
            log::warn!("firmware: non-fatal crash {crash:?} reported ({count} so far)");
            return;
        }
        log::error!("firmware: unrecoverable fault ({count} crashes so far)");

        // CLOSE_DEVICE must not go to firmware that never saw the OPEN
        self.env.handshake.clear_fw_state();
        let errored = self.env.groups.set_errored();
        if errored > 0 {
            log::warn!("firmware: {errored} device groups errored");
        }

        if self.is_loading() {
            log::debug!("firmware: load in progress, leaving restart to it");
            return;
        }
        let desc = lock(&self.descriptors);
        if let Err(e) = self.restart_locked(&desc) {
            log::error!("firmware: restart after crash failed: {e}");
        }
    }

    /// Stop the firmware and release both descriptors
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.before_destroy(&self.ctx());
        let mut desc = lock(&self.descriptors);
        let Descriptors { current, bl1 } = &mut *desc;
        self.unload_locked(current);
        self.unload_locked(bl1);
        self.status
            .store(FirmwareStatus::Invalid as u8, Ordering::Release);
        *lock(&self.device_state) = DeviceState::NoFirmware;
    }

    pub fn status(&self) -> FirmwareStatus {
        FirmwareStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn is_loading(&self) -> bool {
        self.status() == FirmwareStatus::Loading
    }

    pub fn device_state(&self) -> DeviceState {
        *lock(&self.device_state)
    }

    pub fn info(&self) -> FirmwareInfo {
        *lock(&self.info)
    }

    pub fn flavor(&self) -> FirmwareFlavor {
        self.info().flavor
    }

    /// Name of the running image, if the last run succeeded
    pub fn name(&self) -> Option<String> {
        let desc = lock(&self.descriptors);
        if self.status() != FirmwareStatus::Valid {
            return None;
        }
        desc.current.name().map(str::to_owned)
    }

    /// Versions from the running image's header, for backends that parse it
    pub fn version(&self) -> Option<FirmwareVersion> {
        lock(&self.descriptors).current.version
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count.load(Ordering::Acquire)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn kci(&self) -> &Kci {
        &self.env.kci
    }

    pub fn handshake_state(&self) -> &Arc<Handshake> {
        &self.env.handshake
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.env.groups
    }

    pub fn registry(&self) -> &SharedFirmwareRegistry {
        &self.env.registry
    }
}

impl Drop for Firmware {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Firmware")
            .field("backend", &self.backend.name())
            .field("status", &self.status())
            .field("device_state", &self.device_state())
            .field("crashes", &self.crash_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(Firmware: Send, Sync);
