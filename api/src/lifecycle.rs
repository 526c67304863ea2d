// Licensed under the Apache-2.0 license

use crate::soc_mgr::{SecurityState, SocMailbox};
use libcaliptra_error::{FuseError, LibCaliptraResult};

/// Device life cycle states
#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum DeviceLifecycle {
    #[default]
    Unprovisioned = 0,
    Manufacturing = 1,
    Reserved2 = 2,
    Production = 3,
}

impl From<u32> for DeviceLifecycle {
    fn from(value: u32) -> Self {
        match value & 0x3 {
            0 => DeviceLifecycle::Unprovisioned,
            1 => DeviceLifecycle::Manufacturing,
            2 => DeviceLifecycle::Reserved2,
            _ => DeviceLifecycle::Production,
        }
    }
}

impl From<DeviceLifecycle> for u32 {
    fn from(value: DeviceLifecycle) -> Self {
        value as u32
    }
}

/// The RoT owns the life cycle; this only remembers the last value read
/// until somebody invalidates it.
#[derive(Debug, Default)]
pub struct LifecycleCache {
    cached: Option<DeviceLifecycle>,
}

impl LifecycleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, soc: &mut impl SocMailbox) -> DeviceLifecycle {
        match self.cached {
            Some(lifecycle) => lifecycle,
            None => {
                let lifecycle =
                    SecurityState(soc.soc_read_security_state()).device_lifecycle();
                log::debug!("device lifecycle read from RoT: {:?}", lifecycle);
                self.cached = Some(lifecycle);
                lifecycle
            }
        }
    }

    pub fn cached(&self) -> Option<DeviceLifecycle> {
        self.cached
    }

    /// Forces the next `get` to query the device, e.g. after a reset.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

/// Decides whether fuse-writing commands are currently legal.
///
/// The window only ever closes: once it has been observed closed for this
/// device instance it stays closed.
#[derive(Debug, Default)]
pub struct FuseGate {
    closed: bool,
}

impl FuseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fuse_window_open(
        &mut self,
        soc: &mut impl SocMailbox,
        lifecycle: &mut LifecycleCache,
    ) -> bool {
        if self.closed {
            return false;
        }
        let lc = lifecycle.get(soc);
        let open = matches!(
            lc,
            DeviceLifecycle::Unprovisioned | DeviceLifecycle::Manufacturing
        ) && !soc.soc_read_fuse_wr_done();
        if !open {
            log::info!("fuse provisioning window closed (lifecycle {:?})", lc);
            self.closed = true;
        }
        open
    }

    /// Records a completed fuse write. Closes the window for good.
    pub fn record_fuse_write_complete(&mut self) {
        self.closed = true;
    }

    /// Fails with `NotReadyForFuses` unless the window is open.
    pub fn require_open(
        &mut self,
        soc: &mut impl SocMailbox,
        lifecycle: &mut LifecycleCache,
    ) -> LibCaliptraResult<()> {
        if self.is_fuse_window_open(soc, lifecycle) {
            Ok(())
        } else {
            Err(FuseError::NotReadyForFuses.into())
        }
    }

    /// Caller assertion that provisioning is over. Fails with
    /// `StillReadyForFuses` while the window is still open.
    pub fn assert_closed(
        &mut self,
        soc: &mut impl SocMailbox,
        lifecycle: &mut LifecycleCache,
    ) -> LibCaliptraResult<()> {
        if self.is_fuse_window_open(soc, lifecycle) {
            Err(FuseError::StillReadyForFuses.into())
        } else {
            Ok(())
        }
    }
}
