//! Error types for bootflash.

use std::io;
use thiserror::Error;

/// Result type for bootflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (firmware file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// USB error reported by libusb.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// A single control transfer did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device went away in the middle of a session.
    #[error("Device disconnected")]
    Disconnected,

    /// Any other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No device with the expected identifiers is attached.
    #[error("Device not found")]
    DeviceNotFound,

    /// The device is attached but running its application firmware.
    #[error("Device found, but it is not in bootloader mode (device class {class:#04x})")]
    NotInBootloaderMode {
        /// Device class byte reported by the device.
        class: u8,
    },

    /// The bootloader did not answer the handshake.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Protocol misuse or unexpected device behaviour.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A page kept failing verification beyond the configured retry bound.
    #[error("Link unreliable: page {page} failed verification {retries} times")]
    LinkUnreliable {
        /// Logical (1-based) page number.
        page: u32,
        /// Failed verify attempts for that page.
        retries: u32,
    },

    /// The firmware image has no content.
    #[error("Firmware image is empty")]
    EmptyImage,

    /// The firmware image needs more pages than the wire format can announce.
    #[error("Firmware image too large: {pages} pages (maximum {max})")]
    ImageTooLarge {
        /// Pages required by the image.
        pages: u64,
        /// Pages the protocol can announce.
        max: u64,
    },

    /// Invalid firmware image source.
    #[error("Invalid image: {0}")]
    Image(String),

    /// The embedding application asked to stop.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the link itself failed, as opposed to a
    /// single page or a precondition.
    pub fn is_transport(&self) -> bool {
        match self {
            #[cfg(feature = "native")]
            Self::Usb(_) => true,
            Self::Timeout(_) | Self::Disconnected | Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Whether this error was raised before any protocol command was sent.
    pub fn is_discovery(&self) -> bool {
        matches!(self, Self::DeviceNotFound | Self::NotInBootloaderMode { .. })
    }
}
