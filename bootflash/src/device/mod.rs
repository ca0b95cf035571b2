//! Device discovery and classification.
//!
//! Finding the bootloader is a precondition, not part of the protocol: the
//! functions here only look at device descriptors and never send a
//! bootloader request.

use crate::error::{Error, Result};
use crate::transport::{DeviceEnumerator, DeviceInfo};
use log::{debug, info};
use std::fmt;

/// USB vendor/product identifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbId {
    /// Create an identifier pair.
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }

    /// Check if this identifier matches the given device.
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vid == info.vid && self.pid == info.pid
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// What identifies a device as an active bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Vendor/product identifiers.
    pub id: UsbId,
    /// Device class reported in bootloader mode; `None` skips the check.
    pub bootloader_class: Option<u8>,
}

impl DeviceFilter {
    /// Replace the identifiers, keeping the class check.
    #[must_use]
    pub fn with_id(mut self, id: UsbId) -> Self {
        self.id = id;
        self
    }

    /// Classify a device that matches [`id`](Self::id).
    pub fn mode(&self, info: &DeviceInfo) -> DeviceMode {
        match self.bootloader_class {
            Some(class) if class != info.class => DeviceMode::Application,
            _ => DeviceMode::Bootloader,
        }
    }
}

/// Operating state of a matching device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Accepting firmware updates.
    Bootloader,
    /// Running the application firmware.
    Application,
}

/// Pick the bootloader among `devices`.
///
/// Returns [`Error::DeviceNotFound`] when nothing matches the identifiers
/// and [`Error::NotInBootloaderMode`] when matching devices exist but none
/// of them is in bootloader mode.
pub fn select_bootloader<'a>(
    devices: &'a [DeviceInfo],
    filter: &DeviceFilter,
) -> Result<&'a DeviceInfo> {
    let mut candidates = devices
        .iter()
        .filter(|d| filter.id.matches(d))
        .peekable();

    let Some(first) = candidates.peek().copied() else {
        debug!("No device with id {}", filter.id);
        return Err(Error::DeviceNotFound);
    };

    candidates
        .find(|d| filter.mode(d) == DeviceMode::Bootloader)
        .ok_or(Error::NotInBootloaderMode { class: first.class })
}

/// Find the bootloader and open a transport to it.
///
/// No bootloader request is issued; on error nothing has been opened.
pub fn open_bootloader<E: DeviceEnumerator>(
    enumerator: &E,
    filter: &DeviceFilter,
) -> Result<E::Transport> {
    let devices = enumerator.list_devices()?;
    debug!("Found {} USB devices", devices.len());

    let info = select_bootloader(&devices, filter)?;
    info!("Bootloader {} at {}", filter.id, info.location());

    enumerator.open(info)
}
