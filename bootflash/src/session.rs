//! Update session: the host side of the bootloader protocol.
//!
//! A session drives one image through one bootloader, strictly in order:
//!
//! ```text
//! hello -> init -> ( send -> verify -> compare -> [resend]* -> advance )* -> finalize -> bye
//! ```
//!
//! Every page is read back and compared byte for byte before the next one
//! is sent. A mismatch resends the same page; a transport error aborts the
//! session without finalize or bye.
//!
//! ## Example
//!
//! ```rust,no_run
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use bootflash::{FirmwareImage, ProtocolVersion, Session, UsbEnumerator, open_bootloader};
//!
//!         let version = ProtocolVersion::V2;
//!         let image = FirmwareImage::open("firmware.bin")?;
//!         let enumerator = UsbEnumerator::new()?;
//!         let transport = open_bootloader(&enumerator, &version.device_filter())?;
//!
//!         let mut session = Session::new(transport, version);
//!         let summary = session.flash(image, |done, total| {
//!             println!("Writing {done}/{total}");
//!         })?;
//!         println!("Retries: {}", summary.stats.total_retries);
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::PageSource;
use crate::protocol::{
    DEFAULT_PAGE_SIZE, MAX_ANNOUNCED_PAGES, MAX_PAGE_SIZE, Page, ProtocolVersion, RetryController,
    RetryPolicy, RetryStats, Verification, WireCommand, total_pages,
};
use crate::transport::Transport;
use log::{debug, info, trace, warn};

/// Payload bytes shown in per-page debug output.
const PREVIEW_LEN: usize = 10;

/// Where a session stands in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent yet.
    Idle,
    /// Hello answered.
    Greeted,
    /// Page count announced.
    Initialized,
    /// All pages verified.
    Transferred,
    /// Image committed.
    Finalized,
    /// Bye sent; the device has left update mode.
    Closed,
    /// A fatal error ended the session.
    Aborted,
}

/// Page loop states.
enum PageState {
    Advance,
    Send(Page),
    Verify(Page),
    Compare(Page, Vec<u8>),
    Done,
}

/// Result of a completed update.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UpdateSummary {
    /// Identity string returned by hello.
    pub bootloader: String,
    /// Protocol generation used.
    pub protocol: ProtocolVersion,
    /// Image size in bytes.
    pub image_size: u64,
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages transferred.
    pub total_pages: u32,
    /// Retry statistics.
    pub stats: RetryStats,
}

/// One end-to-end firmware update over a transport.
///
/// Generic over the transport type `T`, so the same state machine runs on
/// real hardware and against the in-memory bootloader used in tests.
pub struct Session<T: Transport> {
    transport: T,
    version: ProtocolVersion,
    page_size: usize,
    phase: Phase,
    retry: RetryController,
    total_pages: u32,
    current_page: u32,
    bootloader: Option<String>,
}

impl<T: Transport> Session<T> {
    /// Create a session over an open transport.
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport to the bootloader, owned by the session
    /// * `version` - Protocol generation the bootloader speaks
    pub fn new(transport: T, version: ProtocolVersion) -> Self {
        Self {
            transport,
            version,
            page_size: DEFAULT_PAGE_SIZE,
            phase: Phase::Idle,
            retry: RetryController::new(RetryPolicy::default()),
            total_pages: 0,
            current_page: 0,
            bootloader: None,
        }
    }

    /// Set the retry limits.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryController::new(policy);
        self
    }

    /// Set the page size (1..=255 bytes).
    pub fn with_page_size(mut self, page_size: usize) -> Result<Self> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        self.page_size = page_size;
        Ok(self)
    }

    /// Protocol generation in use.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current protocol phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Pages announced by [`init_update`](Self::init_update).
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Logical number of the page in flight (or last accepted).
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    /// Retry statistics so far.
    pub fn stats(&self) -> &RetryStats {
        self.retry
            .stats()
    }

    /// Identity string from hello, once received.
    pub fn bootloader(&self) -> Option<&str> {
        self.bootloader
            .as_deref()
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consume the session and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn expect_phase(&self, expected: Phase, operation: &str) -> Result<()> {
        if self.phase == expected {
            return Ok(());
        }
        Err(Error::Protocol(format!(
            "{operation} requires phase {expected:?}, session is {:?}",
            self.phase
        )))
    }

    fn send(&mut self, command: WireCommand, data: &[u8]) -> Result<()> {
        let setup = command.setup(self.version)?;
        trace!("Sending {}: {} bytes", command.command(), data.len());

        let result = self
            .transport
            .write_control(setup, data);
        match result {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                self.phase = Phase::Aborted;
                Err(Error::Transport(format!(
                    "{} sent {n} of {} bytes",
                    command.command(),
                    data.len()
                )))
            },
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(e)
            },
        }
    }

    fn receive(&mut self, command: WireCommand, len: usize) -> Result<Vec<u8>> {
        let setup = command.setup(self.version)?;
        let mut buf = vec![0u8; len];

        match self
            .transport
            .read_control(setup, &mut buf)
        {
            Ok(n) => {
                trace!("Received {}: {n} bytes", command.command());
                buf.truncate(n);
                Ok(buf)
            },
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(e)
            },
        }
    }

    /// Check that a bootloader is listening and fetch its identity string.
    ///
    /// The identity is informational only; no version negotiation happens.
    pub fn hello(&mut self) -> Result<String> {
        self.expect_phase(Phase::Idle, "hello")?;

        let response = self.receive(WireCommand::hello(), self.page_size)?;
        if response.is_empty() {
            self.phase = Phase::Aborted;
            return Err(Error::HandshakeFailed(
                "bootloader returned no identity (not idle, or wrong protocol version?)".into(),
            ));
        }

        let end = response
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(response.len());
        let identity = String::from_utf8_lossy(&response[..end])
            .trim()
            .to_string();
        if identity.is_empty() {
            self.phase = Phase::Aborted;
            return Err(Error::HandshakeFailed(format!(
                "bootloader identity is blank ({})",
                hex_preview(&response)
            )));
        }

        info!("Bootloader: {identity}");
        self.bootloader = Some(identity.clone());
        self.phase = Phase::Greeted;
        Ok(identity)
    }

    /// Announce how many pages will follow.
    pub fn init_update(&mut self, total_pages: u64) -> Result<()> {
        self.expect_phase(Phase::Greeted, "update init")?;

        if total_pages == 0 {
            return Err(Error::EmptyImage);
        }
        let announced = u16::try_from(total_pages).map_err(|_| Error::ImageTooLarge {
            pages: total_pages,
            max: MAX_ANNOUNCED_PAGES,
        })?;

        info!("Announcing {announced} pages of {} bytes", self.page_size);
        self.send(WireCommand::update_init(announced), &[])?;

        self.total_pages = u32::from(announced);
        self.current_page = 0;
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Transfer every page of `source`, verifying each one.
    ///
    /// `progress` is called with `(pages_done, total_pages)` after each
    /// page is accepted.
    pub fn write_pages<S, F>(&mut self, source: &mut S, mut progress: F) -> Result<()>
    where
        S: PageSource + ?Sized,
        F: FnMut(u32, u32),
    {
        self.expect_phase(Phase::Initialized, "page transfer")?;

        match self.run_page_loop(source, &mut progress) {
            Ok(()) => {
                self.phase = Phase::Transferred;
                let stats = self.retry.stats();
                info!(
                    "Transferred {} pages ({} retries)",
                    self.total_pages, stats.total_retries
                );
                Ok(())
            },
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(e)
            },
        }
    }

    fn run_page_loop<S, F>(&mut self, source: &mut S, progress: &mut F) -> Result<()>
    where
        S: PageSource + ?Sized,
        F: FnMut(u32, u32),
    {
        let mut chunk = vec![0u8; self.page_size];
        let mut state = PageState::Advance;

        loop {
            state = match state {
                PageState::Advance => {
                    let n = source.read_chunk(&mut chunk)?;
                    if n == 0 {
                        if self.current_page < self.total_pages {
                            return Err(Error::Image(format!(
                                "image ended after {} of {} pages",
                                self.current_page, self.total_pages
                            )));
                        }
                        PageState::Done
                    } else {
                        let sequence = self.current_page + 1;
                        if sequence > self.total_pages {
                            return Err(Error::Image(format!(
                                "image holds more than the {} announced pages",
                                self.total_pages
                            )));
                        }
                        let page = Page::new(sequence, chunk[..n].to_vec(), self.page_size)?;
                        self.current_page = sequence;
                        self.retry
                            .begin_page(sequence);
                        PageState::Send(page)
                    }
                },
                PageState::Send(page) => {
                    if crate::is_interrupted_requested() {
                        return Err(Error::Interrupted);
                    }
                    debug!(
                        "page {:3} #{}: {:3} bytes [{}...]",
                        page.sequence(),
                        self.retry
                            .page_retries()
                            + 1,
                        page.len(),
                        hex_preview(page.payload())
                    );
                    self.send(WireCommand::write_page(), &page.encode())?;
                    PageState::Verify(page)
                },
                PageState::Verify(page) => {
                    let readback = self.receive(WireCommand::verify_page(), self.page_size)?;
                    PageState::Compare(page, readback)
                },
                PageState::Compare(page, readback) => match page.verify(&readback) {
                    Verification::Match => {
                        let retries = self
                            .retry
                            .record_accept();
                        if retries > 0 {
                            debug!("page {} accepted after {retries} retries", page.sequence());
                        }
                        progress(page.sequence(), self.total_pages);
                        PageState::Advance
                    },
                    outcome => {
                        warn!("page {}: {outcome}, resending", page.sequence());
                        self.retry
                            .record_mismatch()?;
                        PageState::Send(page)
                    },
                },
                PageState::Done => return Ok(()),
            };
        }
    }

    /// Ask the bootloader to validate and commit the image.
    ///
    /// Protocol v1 has no such step; the call only advances the phase.
    pub fn finalize(&mut self) -> Result<()> {
        self.expect_phase(Phase::Transferred, "finalize")?;

        if self
            .version
            .has_finalize()
        {
            info!("Finalizing firmware update");
            self.send(WireCommand::finalize(), &[])?;
        } else {
            debug!("Protocol {} has no finalize step, skipping", self.version);
        }

        self.phase = Phase::Finalized;
        Ok(())
    }

    /// Tell the bootloader to leave update mode.
    pub fn bye(&mut self) -> Result<()> {
        self.expect_phase(Phase::Finalized, "bye")?;

        info!("Leaving bootloader");
        self.send(WireCommand::bye(), &[])?;
        self.phase = Phase::Closed;
        Ok(())
    }

    /// Run the complete update: hello, init, all pages, finalize, bye.
    ///
    /// Image size problems are reported before anything is sent.
    pub fn flash<S, F>(&mut self, mut source: S, progress: F) -> Result<UpdateSummary>
    where
        S: PageSource,
        F: FnMut(u32, u32),
    {
        let image_size = source.total_size();
        let pages = total_pages(image_size, self.page_size);
        if pages == 0 {
            return Err(Error::EmptyImage);
        }
        if pages > MAX_ANNOUNCED_PAGES {
            return Err(Error::ImageTooLarge {
                pages,
                max: MAX_ANNOUNCED_PAGES,
            });
        }

        self.hello()?;
        self.init_update(pages)?;
        self.write_pages(&mut source, progress)?;
        self.finalize()?;
        self.bye()?;

        self.summary(image_size)
    }

    /// Report of a completed update; only available once the session is closed.
    pub fn summary(&self, image_size: u64) -> Result<UpdateSummary> {
        self.expect_phase(Phase::Closed, "summary")?;
        let bootloader = self
            .bootloader
            .clone()
            .ok_or_else(|| Error::Protocol("closed session has no bootloader identity".into()))?;

        Ok(UpdateSummary {
            bootloader,
            protocol: self.version,
            image_size,
            page_size: self.page_size,
            total_pages: self.total_pages,
            stats: *self.stats(),
        })
    }
}

fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .take(PREVIEW_LEN)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FirmwareImage;
    use crate::protocol::Command;
    use crate::transport::mock::{Fault, MockTransport};

    const P: usize = DEFAULT_PAGE_SIZE;

    fn image_bytes(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i * 7 + i / 256) as u8)
            .collect()
    }

    fn init_logging() {
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();
    }

    fn run(mock: MockTransport, data: &[u8]) -> (Result<UpdateSummary>, MockTransport) {
        init_logging();
        let mut session = Session::new(mock, ProtocolVersion::V2);
        let image = FirmwareImage::from_bytes(data.to_vec()).unwrap();
        let result = session.flash(image, |_, _| {});
        (result, session.into_transport())
    }

    #[test]
    fn test_single_full_page() {
        let data = image_bytes(P);
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);
        let summary = result.unwrap();

        assert_eq!(summary.total_pages, 1);
        assert_eq!(summary.stats, RetryStats::default());
        assert_eq!(mock.written_headers(), vec![[1, 128]]);
        assert_eq!(mock.announced_pages(), Some(1));
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_page_plus_one_byte() {
        let data = image_bytes(P + 1);
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);

        assert_eq!(result.unwrap().total_pages, 2);
        assert_eq!(mock.written_headers(), vec![[1, 128], [2, 1]]);
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_sequence_wraps_on_the_wire() {
        let data = image_bytes(257 * P);
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);

        assert_eq!(result.unwrap().total_pages, 257);
        let headers = mock.written_headers();
        assert_eq!(headers.len(), 257);
        assert_eq!(headers[254], [255, 128]);
        assert_eq!(headers[255], [0, 128]);
        assert_eq!(headers[256], [1, 128]);
        assert_eq!(mock.announced_pages(), Some(257));
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_256_pages_keep_logical_count() {
        let data = image_bytes(256 * P);
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);

        assert_eq!(result.unwrap().total_pages, 256);
        assert_eq!(mock.announced_pages(), Some(256));
        let headers = mock.written_headers();
        assert_eq!(headers.first(), Some(&[1, 128]));
        assert_eq!(headers.last(), Some(&[0, 128]));
    }

    #[test]
    fn test_single_corrupt_readback_is_retried() {
        let data = image_bytes(5 * P);
        let mock = MockTransport::new(ProtocolVersion::V2)
            .with_fault(Fault::CorruptReadback { seq: 3, index: 17 }, 1);
        let (result, mock) = run(mock, &data);
        let summary = result.unwrap();

        assert_eq!(summary.stats.total_retries, 1);
        assert_eq!(summary.stats.max_retries_seen, 1);
        assert_eq!(summary.stats.max_retry_page, Some(3));
        assert_eq!(mock.count(Command::WritePage), 6);
        assert_eq!(mock.page(3), Some(&data[2 * P..3 * P]));
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_corrupt_write_is_repaired_by_resend() {
        let data = image_bytes(3 * P + 10);
        let mock =
            MockTransport::new(ProtocolVersion::V2).with_fault(Fault::CorruptWrite { seq: 4 }, 2);
        let (result, mock) = run(mock, &data);
        let summary = result.unwrap();

        assert_eq!(summary.stats.total_retries, 2);
        assert_eq!(summary.stats.max_retry_page, Some(4));
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_resend_is_identical() {
        let data = image_bytes(2 * P);
        let mock = MockTransport::new(ProtocolVersion::V2)
            .with_fault(Fault::CorruptReadback { seq: 2, index: 0 }, 3);
        let (_, mock) = run(mock, &data);

        let frames: Vec<&[u8]> = mock
            .requests()
            .iter()
            .filter(|r| r.command == Some(Command::WritePage))
            .map(|r| r.data.as_slice())
            .collect();
        assert_eq!(frames.len(), 5);
        for frame in &frames[1..] {
            assert_eq!(*frame, frames[1]);
        }
    }

    #[test]
    fn test_short_readback_is_retried() {
        let data = image_bytes(P);
        let mock = MockTransport::new(ProtocolVersion::V2)
            .with_fault(Fault::ShortReadback { seq: 1, len: 10 }, 1);
        let (result, _) = run(mock, &data);
        assert_eq!(result.unwrap().stats.total_retries, 1);
    }

    #[test]
    fn test_short_last_page_ignores_trailing_bytes() {
        // The mock pads readbacks with 0xFF up to the page size.
        let data = vec![0x00; P + 3];
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);
        assert_eq!(result.unwrap().stats.total_retries, 0);
        assert_eq!(mock.count(Command::VerifyPage), 2);
    }

    #[test]
    fn test_command_order() {
        let data = image_bytes(2 * P);
        let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);
        result.unwrap();

        assert_eq!(
            mock.command_log(),
            vec![
                Command::Hello,
                Command::UpdateInit,
                Command::WritePage,
                Command::VerifyPage,
                Command::WritePage,
                Command::VerifyPage,
                Command::Finalize,
                Command::Bye,
            ]
        );
        assert!(mock.is_finalized());
        assert!(mock.said_bye());
    }

    #[test]
    fn test_v1_skips_finalize() {
        let data = image_bytes(P / 2);
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V1), ProtocolVersion::V1);
        let summary = session
            .flash(FirmwareImage::from_bytes(data.clone()).unwrap(), |_, _| {})
            .unwrap();
        let mock = session.into_transport();

        assert_eq!(summary.protocol, ProtocolVersion::V1);
        assert_eq!(
            mock.command_log(),
            vec![
                Command::Hello,
                Command::UpdateInit,
                Command::WritePage,
                Command::VerifyPage,
                Command::Bye,
            ]
        );
        assert_eq!(mock.requests()[0].setup.request, 0x55);
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_disconnect_aborts_without_teardown() {
        let data = image_bytes(4 * P);
        let mock =
            MockTransport::new(ProtocolVersion::V2).with_disconnect_on(Command::WritePage, 3);
        let mut session = Session::new(mock, ProtocolVersion::V2);
        let err = session
            .flash(FirmwareImage::from_bytes(data).unwrap(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Disconnected));
        assert!(err.is_transport());
        assert_eq!(session.phase(), Phase::Aborted);
        assert!(session.finalize().is_err());
        assert!(session.bye().is_err());

        let mock = session.into_transport();
        assert_eq!(mock.count(Command::Finalize), 0);
        assert_eq!(mock.count(Command::Bye), 0);
    }

    #[test]
    fn test_verify_timeout_is_fatal() {
        let data = image_bytes(2 * P);
        let mock = MockTransport::new(ProtocolVersion::V2).with_timeout_on(Command::VerifyPage, 2);
        let (result, mock) = run(mock, &data);

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(mock.count(Command::WritePage), 2);
        assert!(!mock.said_bye());
    }

    #[test]
    fn test_retry_limit_aborts() {
        let data = image_bytes(3 * P);
        let mock = MockTransport::new(ProtocolVersion::V2)
            .with_fault(Fault::CorruptReadback { seq: 2, index: 5 }, u32::MAX);
        let mut session = Session::new(mock, ProtocolVersion::V2)
            .with_retry_policy(RetryPolicy::default().with_max_retries(Some(4)));
        let err = session
            .flash(FirmwareImage::from_bytes(data).unwrap(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::LinkUnreliable { page: 2, retries: 5 }));
        assert!(!err.is_transport());
        let mock = session.into_transport();
        assert_eq!(mock.count(Command::WritePage), 1 + 5);
        assert_eq!(mock.count(Command::Finalize), 0);
        assert_eq!(mock.count(Command::Bye), 0);
    }

    #[test]
    fn test_progress_reports_each_page() {
        let data = image_bytes(3 * P - 1);
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        let mut seen = Vec::new();
        session
            .flash(FirmwareImage::from_bytes(data).unwrap(), |done, total| {
                seen.push((done, total));
            })
            .unwrap();
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_hello_without_answer() {
        let mock = MockTransport::new(ProtocolVersion::V2);
        // v1 request bytes mean nothing to a v2 bootloader
        let mut session = Session::new(mock, ProtocolVersion::V1);
        let err = session
            .hello()
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));

        let mock = session.into_transport();
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_hello_identity_trimmed() {
        let mock = MockTransport::new(ProtocolVersion::V2).with_identity(b"4chord BL 1.2\0\0\0");
        let mut session = Session::new(mock, ProtocolVersion::V2);
        assert_eq!(session.hello().unwrap(), "4chord BL 1.2");
        assert_eq!(session.bootloader(), Some("4chord BL 1.2"));
        assert_eq!(session.phase(), Phase::Greeted);
    }

    #[test]
    fn test_hello_blank_identity_rejected() {
        init_logging();
        for identity in [&b"\0\0\0"[..], b"  \0junk", b" \t "] {
            let mock = MockTransport::new(ProtocolVersion::V2).with_identity(identity);
            let mut session = Session::new(mock, ProtocolVersion::V2);
            assert!(matches!(session.hello(), Err(Error::HandshakeFailed(_))));
            assert_eq!(session.phase(), Phase::Aborted);
            assert_eq!(session.bootloader(), None);
            assert!(matches!(session.init_update(1), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_summary_requires_closed_session() {
        init_logging();
        let data = image_bytes(2 * P + 5);
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        assert!(matches!(session.summary(0), Err(Error::Protocol(_))));

        session.hello().unwrap();
        session.init_update(3).unwrap();
        assert!(matches!(session.summary(0), Err(Error::Protocol(_))));

        let mut image = FirmwareImage::from_bytes(data.clone()).unwrap();
        session.write_pages(&mut image, |_, _| {}).unwrap();
        session.finalize().unwrap();
        assert!(matches!(session.summary(0), Err(Error::Protocol(_))));
        session.bye().unwrap();

        let stepped = session.summary(data.len() as u64).unwrap();
        let (flashed, _) = run(MockTransport::new(ProtocolVersion::V2), &data);
        assert_eq!(stepped, flashed.unwrap());
        assert_eq!(stepped.total_pages, 3);
        assert_eq!(stepped.image_size, data.len() as u64);
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        assert!(matches!(session.init_update(1), Err(Error::Protocol(_))));
        assert!(matches!(session.finalize(), Err(Error::Protocol(_))));
        assert!(matches!(session.bye(), Err(Error::Protocol(_))));

        let mut image = FirmwareImage::from_bytes(vec![1]).unwrap();
        assert!(session
            .write_pages(&mut image, |_, _| {})
            .is_err());

        session.hello().unwrap();
        assert!(matches!(session.hello(), Err(Error::Protocol(_))));
        assert_eq!(session.into_transport().requests().len(), 1);
    }

    #[test]
    fn test_init_twice_rejected() {
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        session.hello().unwrap();
        session.init_update(2).unwrap();
        assert!(session.init_update(2).is_err());
        assert_eq!(session.into_transport().count(Command::UpdateInit), 1);
    }

    #[test]
    fn test_too_many_pages_rejected_before_sending() {
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        let size = (MAX_ANNOUNCED_PAGES + 1) * P as u64;
        let image = FirmwareImage::new(std::io::empty(), size).unwrap();
        let err = session
            .flash(image, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge { .. }));
        assert!(session.into_transport().requests().is_empty());
    }

    #[test]
    fn test_source_shorter_than_announced() {
        let image = FirmwareImage::new(std::io::Cursor::new(vec![1u8; P]), 3 * P as u64).unwrap();
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        let err = session
            .flash(image, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Image(_)));
        assert_eq!(session.phase(), Phase::Aborted);
        assert_eq!(session.into_transport().count(Command::Finalize), 0);
    }

    #[test]
    fn test_source_longer_than_announced() {
        let image = FirmwareImage::new(std::io::Cursor::new(vec![1u8; 2 * P]), P as u64).unwrap();
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2);
        let err = session
            .flash(image, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Image(_)));
    }

    #[test]
    fn test_custom_page_size() {
        let data = image_bytes(100);
        let mut session = Session::new(MockTransport::new(ProtocolVersion::V2), ProtocolVersion::V2)
            .with_page_size(32)
            .unwrap();
        let summary = session
            .flash(FirmwareImage::from_bytes(data.clone()).unwrap(), |_, _| {})
            .unwrap();
        assert_eq!(summary.total_pages, 4);

        let mock = session.into_transport();
        assert_eq!(mock.written_headers(), vec![[1, 32], [2, 32], [3, 32], [4, 4]]);
        assert_eq!(mock.image(), data);
    }

    #[test]
    fn test_invalid_page_size() {
        let mock = MockTransport::new(ProtocolVersion::V2);
        assert!(Session::new(mock, ProtocolVersion::V2)
            .with_page_size(256)
            .is_err());
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x01, 0xab]), "01ab");
        assert_eq!(hex_preview(&[0xff; 20]).len(), 2 * PREVIEW_LEN);
    }

    #[test]
    fn test_payload_sum_equals_image_size() {
        for size in [1, 127, 128, 129, 1000, 4096] {
            let data = image_bytes(size);
            let (result, mock) = run(MockTransport::new(ProtocolVersion::V2), &data);
            let summary = result.unwrap();

            let headers = mock.written_headers();
            let total: usize = headers
                .iter()
                .map(|h| usize::from(h[1]))
                .sum();
            assert_eq!(total, size);
            assert_eq!(summary.total_pages as usize, size.div_ceil(P));
            for h in &headers[..headers.len() - 1] {
                assert_eq!(usize::from(h[1]), P);
            }
        }
    }
}
