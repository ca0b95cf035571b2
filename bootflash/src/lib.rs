//! # bootflash
//!
//! A library for flashing firmware through minimal USB bootloaders.
//!
//! The bootloaders this crate talks to expose no bulk endpoints: every
//! operation is a single vendor control transfer on endpoint 0. The crate
//! provides:
//!
//! - Device discovery by vendor/product ID and bootloader device class
//! - The page protocol (hello, init, write, verify, finalize, bye)
//! - Verify-after-write with bounded per-page retries
//! - Streaming image sources that never load the whole firmware
//!
//! ## Protocol Versions
//!
//! - **v2** (default): `1209:deaf`, device class `0xff`, with finalize
//! - **v1**: `1209:b00b`, legacy opcodes, no finalize
//!
//! ## Features
//!
//! - `native` (default): USB access through libusb (`rusb`)
//! - `serde`: Serialization support for summaries and statistics
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootflash::{FirmwareImage, ProtocolVersion, RetryPolicy, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::open("firmware.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let version = ProtocolVersion::V2;
//!         let enumerator = bootflash::UsbEnumerator::new()?;
//!         let transport = bootflash::open_bootloader(&enumerator, &version.device_filter())?;
//!
//!         let mut session = Session::new(transport, version)
//!             .with_retry_policy(RetryPolicy::default().with_max_retries(Some(10)));
//!         let summary = session.flash(image, |done, total| {
//!             println!("Page {done}/{total}");
//!         })?;
//!         println!("Flashed {} bytes", summary.image_size);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled before every page send.
///
/// The checker should return `true` when the update should stop (for
/// example after receiving Ctrl-C in CLI applications). The session then
/// fails with [`Error::Interrupted`] without sending finalize or bye.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Toggle interruption for the calling test thread only.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::cell::Cell;
    use std::sync::Once;

    thread_local! {
        static TEST_INTERRUPT_FLAG: Cell<bool> = const { Cell::new(false) };
    }
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| set_interrupt_checker(|| TEST_INTERRUPT_FLAG.with(Cell::get)));
    TEST_INTERRUPT_FLAG.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::{UsbEnumerator, UsbTransport};
pub use {
    device::{DeviceFilter, DeviceMode, UsbId, open_bootloader, select_bootloader},
    error::{Error, Result},
    image::{FirmwareImage, PageSource},
    protocol::{
        Command, DEFAULT_PAGE_SIZE, Page, ProtocolVersion, RetryPolicy, RetryStats, Verification,
        WireCommand,
    },
    session::{Phase, Session, UpdateSummary},
    transport::{ControlSetup, DeviceEnumerator, DeviceInfo, Transport},
};
