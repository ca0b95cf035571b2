//! Bootloader wire contract.
//!
//! Every exchange is a single vendor control transfer addressed to the
//! device. The request byte selects the operation, `wValue`/`wIndex` carry
//! the two 16-bit parameters and the data stage carries the payload:
//!
//! ```text
//! +-----------+--------------+-------------+-------------+--------------------+
//! | Operation | Direction    | wValue      | wIndex      | Data stage         |
//! +-----------+--------------+-------------+-------------+--------------------+
//! | Hello     | device->host | 0x4d71      | 0x6921      | <= page size, ASCII|
//! | Init      | host->device | total pages | 0           | none               |
//! | Write     | host->device | 0           | 0           | [seq, len] + data  |
//! | Verify    | device->host | 0           | 0           | <= page size       |
//! | Finalize  | host->device | 0           | 0           | none               |
//! | Bye       | host->device | 0           | 0           | none               |
//! +-----------+--------------+-------------+-------------+--------------------+
//! ```
//!
//! Two generations of the bootloader exist and use different request
//! bytes; see [`ProtocolVersion`].

pub mod page;
pub mod retry;

use crate::device::{DeviceFilter, UsbId};
use crate::error::{Error, Result};
use crate::transport::ControlSetup;
use std::fmt;

pub use page::{Page, Verification, encode_header, total_pages};
pub use retry::{RetryController, RetryPolicy, RetryStats};

/// Page size used by every known bootloader build.
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Largest page size the one-byte length field can describe.
pub const MAX_PAGE_SIZE: usize = u8::MAX as usize;

/// Largest page count the 16-bit init parameter can announce.
pub const MAX_ANNOUNCED_PAGES: u64 = u16::MAX as u64;

/// Hello `wValue` magic ("Mq").
pub const HELLO_VALUE: u16 = 0x4d71;

/// Hello `wIndex` magic ("i!").
pub const HELLO_INDEX: u16 = 0x6921;

/// Vendor ID shared by both bootloader generations.
pub const USB_VID: u16 = 0x1209;

/// Product ID of the current bootloader.
pub const USB_PID: u16 = 0xdeaf;

/// Product ID of the legacy bootloader.
pub const USB_PID_LEGACY: u16 = 0xb00b;

/// Device class reported while the bootloader is running.
pub const BOOTLOADER_DEVICE_CLASS: u8 = 0xff;

/// Bootloader operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Presence check, returns the bootloader identity string.
    Hello,
    /// Announce the number of pages to come.
    UpdateInit,
    /// Transfer one framed page.
    WritePage,
    /// Read back the page stored last.
    VerifyPage,
    /// Validate and commit the received image.
    Finalize,
    /// Leave update mode.
    Bye,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => write!(f, "HELLO"),
            Self::UpdateInit => write!(f, "UPDATE_INIT"),
            Self::WritePage => write!(f, "WRITE_PAGE"),
            Self::VerifyPage => write!(f, "VERIFY_PAGE"),
            Self::Finalize => write!(f, "FINALIZE"),
            Self::Bye => write!(f, "BYE"),
        }
    }
}

/// Bootloader protocol generation.
///
/// The generations are mutually incompatible and there is no negotiation,
/// so the host has to be told which one it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolVersion {
    /// First generation: no finalize step, no device class check.
    V1,
    /// Current generation.
    #[default]
    V2,
}

impl ProtocolVersion {
    /// Request byte for `command`, or `None` if this generation lacks it.
    #[must_use]
    pub fn opcode(self, command: Command) -> Option<u8> {
        match (self, command) {
            (Self::V1, Command::Hello) => Some(0x55),
            (Self::V1, Command::UpdateInit) => Some(0x10),
            (Self::V1, Command::WritePage) => Some(0x20),
            (Self::V1, Command::VerifyPage) => Some(0x30),
            (Self::V1, Command::Finalize) => None,
            (Self::V1, Command::Bye) => Some(0xaa),
            (Self::V2, Command::Hello) => Some(0x01),
            (Self::V2, Command::UpdateInit) => Some(0x10),
            (Self::V2, Command::WritePage) => Some(0x11),
            (Self::V2, Command::VerifyPage) => Some(0x12),
            (Self::V2, Command::Finalize) => Some(0x13),
            (Self::V2, Command::Bye) => Some(0xf0),
        }
    }

    /// Reverse lookup of [`opcode`](Self::opcode).
    #[must_use]
    pub fn command(self, opcode: u8) -> Option<Command> {
        [
            Command::Hello,
            Command::UpdateInit,
            Command::WritePage,
            Command::VerifyPage,
            Command::Finalize,
            Command::Bye,
        ]
        .into_iter()
        .find(|&cmd| self.opcode(cmd) == Some(opcode))
    }

    /// Whether the bootloader expects a finalize request before bye.
    pub fn has_finalize(self) -> bool {
        self.opcode(Command::Finalize)
            .is_some()
    }

    /// USB identity of a bootloader speaking this generation.
    #[must_use]
    pub fn device_filter(self) -> DeviceFilter {
        match self {
            Self::V1 => DeviceFilter {
                id: UsbId::new(USB_VID, USB_PID_LEGACY),
                bootloader_class: None,
            },
            Self::V2 => DeviceFilter {
                id: UsbId::new(USB_VID, USB_PID),
                bootloader_class: Some(BOOTLOADER_DEVICE_CLASS),
            },
        }
    }

    /// Get the protocol generation from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .as_str()
        {
            "v1" | "1" | "legacy" => Some(Self::V1),
            "v2" | "2" => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// A bootloader request before it is bound to a protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCommand {
    command: Command,
    value: u16,
    index: u16,
}

impl WireCommand {
    /// Create a command with zero parameters.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            value: 0,
            index: 0,
        }
    }

    /// Hello request carrying the two magic values.
    pub fn hello() -> Self {
        Self {
            command: Command::Hello,
            value: HELLO_VALUE,
            index: HELLO_INDEX,
        }
    }

    /// Update init request announcing `total_pages`.
    pub fn update_init(total_pages: u16) -> Self {
        Self {
            command: Command::UpdateInit,
            value: total_pages,
            index: 0,
        }
    }

    /// Write page request; the framed page travels in the data stage.
    pub fn write_page() -> Self {
        Self::new(Command::WritePage)
    }

    /// Verify readback request.
    pub fn verify_page() -> Self {
        Self::new(Command::VerifyPage)
    }

    /// Finalize request.
    pub fn finalize() -> Self {
        Self::new(Command::Finalize)
    }

    /// Bye request.
    pub fn bye() -> Self {
        Self::new(Command::Bye)
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Resolve the request byte for `version`.
    pub fn setup(&self, version: ProtocolVersion) -> Result<ControlSetup> {
        let request = version
            .opcode(self.command)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "{} is not part of protocol {version}",
                    self.command
                ))
            })?;

        Ok(ControlSetup {
            request,
            value: self.value,
            index: self.index,
        })
    }
}
