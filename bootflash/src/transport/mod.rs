//! Transport abstraction for bootloader control transfers.
//!
//! The protocol layer only needs one primitive: a blocking, addressed
//! vendor control transfer in either direction. This module defines that
//! contract so the session logic can run against different backends:
//!
//! - **Native platforms** (Linux, macOS, Windows): libusb via `rusb`
//! - **Tests**: an in-memory bootloader model ([`mock`])
//!
//! ```text
//! +------------------+
//! |  Session         |
//! |  (hello, pages,  |
//! |   finalize, bye) |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Transport Trait  |
//! +--------+---------+
//!          |
//!    +-----+------+
//!    v            v
//! +------+   +---------+
//! | rusb |   |  mock   |
//! +------+   +---------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootflash::transport::{ControlSetup, Transport};
//!
//! fn example<T: Transport>(transport: &mut T) -> bootflash::Result<()> {
//!     let mut buf = [0u8; 128];
//!     let setup = ControlSetup { request: 0x01, value: 0x4d71, index: 0x6921 };
//!     let n = transport.read_control(setup, &mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!     Ok(())
//! }
//! ```

pub mod mock;
#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Default timeout applied to every single control transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// `bmRequestType` for vendor requests from host to device.
pub const REQUEST_TYPE_OUT: u8 = 0x40;

/// `bmRequestType` for vendor requests from device to host.
pub const REQUEST_TYPE_IN: u8 = 0xC0;

/// Setup stage of a vendor control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    /// `bRequest`, the operation code.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
}

/// USB device information reported by an enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// `bDeviceClass` from the device descriptor.
    pub class: u8,
}

impl DeviceInfo {
    /// Human-readable location, e.g. `usb 001:004`.
    pub fn location(&self) -> String {
        format!("usb {:03}:{:03}", self.bus, self.address)
    }
}

/// Blocking control-transfer transport.
///
/// Every call blocks until the transfer completes, fails or the transport
/// timeout elapses. Calls are never issued concurrently.
pub trait Transport {
    /// Host-to-device transfer; returns the number of bytes sent.
    fn write_control(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize>;

    /// Device-to-host transfer into `buf`; returns the number of bytes received.
    fn read_control(&mut self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize>;

    /// Set the per-transfer timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the per-transfer timeout.
    fn timeout(&self) -> Duration;

    /// Get a name identifying the device.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_control(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        (**self).write_control(setup, data)
    }

    fn read_control(&mut self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize> {
        (**self).read_control(setup, buf)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Trait for listing and opening USB devices.
///
/// This is separated from `Transport` because it is a discovery step that
/// happens before any device is open.
pub trait DeviceEnumerator {
    /// Transport produced by [`open`](Self::open).
    type Transport: Transport;

    /// List attached devices.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a listed device.
    fn open(&self, info: &DeviceInfo) -> Result<Self::Transport>;
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{UsbEnumerator, UsbTransport};

pub use mock::{MockEnumerator, MockTransport};
