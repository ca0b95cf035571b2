//! In-memory bootloader for tests.
//!
//! [`MockTransport`] behaves like the device side of the protocol: it only
//! answers hello in the idle state and with the right magic, only accepts
//! pages after update init, stores each page in a flash model and returns
//! the stored bytes on verify. Faults can be injected to exercise the retry
//! and abort paths, and every request is recorded for inspection.

use crate::error::{Error, Result};
use crate::protocol::{Command, DEFAULT_PAGE_SIZE, HELLO_INDEX, HELLO_VALUE, ProtocolVersion};
use crate::transport::{ControlSetup, DEFAULT_TIMEOUT, DeviceEnumerator, DeviceInfo, Transport};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Identity string returned by the mock on hello.
pub const MOCK_IDENTITY: &str = "mock bootloader 2.0";

/// Device-side state, mirroring the bootloader firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockState {
    /// Waiting for hello.
    Idle,
    /// Hello accepted, waiting for update init.
    Greeted,
    /// Accepting pages.
    Receiving,
}

/// Injected misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Store the page with its first byte flipped.
    CorruptWrite {
        /// Wire sequence number of the page.
        seq: u8,
    },
    /// Return the stored page with the byte at `index` flipped.
    CorruptReadback {
        /// Wire sequence number of the page.
        seq: u8,
        /// Byte to flip.
        index: usize,
    },
    /// Return only `len` bytes on verify.
    ShortReadback {
        /// Wire sequence number of the page.
        seq: u8,
        /// Bytes returned.
        len: usize,
    },
}

impl Fault {
    fn seq(&self) -> u8 {
        match *self {
            Self::CorruptWrite { seq }
            | Self::CorruptReadback { seq, .. }
            | Self::ShortReadback { seq, .. } => seq,
        }
    }
}

/// A request as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Decoded operation, `None` for request bytes the protocol lacks.
    pub command: Option<Command>,
    /// Raw setup stage.
    pub setup: ControlSetup,
    /// Data stage for host-to-device requests.
    pub data: Vec<u8>,
}

/// Scripted link failure.
#[derive(Debug, Clone, Copy)]
struct LinkFailure {
    command: Command,
    occurrence: usize,
    disconnect: bool,
}

/// Scriptable in-memory bootloader.
#[derive(Debug)]
pub struct MockTransport {
    version: ProtocolVersion,
    identity: Vec<u8>,
    timeout: Duration,
    state: MockState,
    announced_pages: Option<u16>,
    flash: BTreeMap<u32, Vec<u8>>,
    current_page: u32,
    last_seq: Option<u8>,
    finalized: bool,
    said_bye: bool,
    requests: Vec<RecordedRequest>,
    counts: HashMap<Command, usize>,
    faults: Vec<(Fault, u32)>,
    link_failure: Option<LinkFailure>,
    disconnected: bool,
}

impl MockTransport {
    /// Create a mock bootloader speaking `version`.
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            identity: MOCK_IDENTITY
                .as_bytes()
                .to_vec(),
            timeout: DEFAULT_TIMEOUT,
            state: MockState::Idle,
            announced_pages: None,
            flash: BTreeMap::new(),
            current_page: 0,
            last_seq: None,
            finalized: false,
            said_bye: false,
            requests: Vec::new(),
            counts: HashMap::new(),
            faults: Vec::new(),
            link_failure: None,
            disconnected: false,
        }
    }

    /// Replace the identity string returned on hello.
    #[must_use]
    pub fn with_identity(mut self, identity: &[u8]) -> Self {
        self.identity = identity.to_vec();
        self
    }

    /// Apply `fault` to the next `times` matching pages.
    #[must_use]
    pub fn with_fault(mut self, fault: Fault, times: u32) -> Self {
        self.faults
            .push((fault, times));
        self
    }

    /// Fail the `occurrence`-th (1-based) request of `command` with a
    /// timeout. Later requests succeed again.
    #[must_use]
    pub fn with_timeout_on(mut self, command: Command, occurrence: usize) -> Self {
        self.link_failure = Some(LinkFailure {
            command,
            occurrence,
            disconnect: false,
        });
        self
    }

    /// Unplug the device at the `occurrence`-th (1-based) request of
    /// `command`. That request and all later ones fail.
    #[must_use]
    pub fn with_disconnect_on(mut self, command: Command, occurrence: usize) -> Self {
        self.link_failure = Some(LinkFailure {
            command,
            occurrence,
            disconnect: true,
        });
        self
    }

    /// All requests received, in order.
    pub fn requests(&self) -> &[RecordedRequest] {
        &self.requests
    }

    /// Number of requests of `command` received.
    pub fn count(&self, command: Command) -> usize {
        self.counts
            .get(&command)
            .copied()
            .unwrap_or(0)
    }

    /// Decoded operations in the order they arrived.
    pub fn command_log(&self) -> Vec<Command> {
        self.requests
            .iter()
            .filter_map(|r| r.command)
            .collect()
    }

    /// Headers of every write-page request, retries included.
    pub fn written_headers(&self) -> Vec<[u8; 2]> {
        self.requests
            .iter()
            .filter(|r| r.command == Some(Command::WritePage) && r.data.len() >= 2)
            .map(|r| [r.data[0], r.data[1]])
            .collect()
    }

    /// Page count announced by update init.
    pub fn announced_pages(&self) -> Option<u16> {
        self.announced_pages
    }

    /// Contents of the flash model, pages concatenated in order.
    pub fn image(&self) -> Vec<u8> {
        self.flash
            .values()
            .flatten()
            .copied()
            .collect()
    }

    /// Bytes stored for logical page `page`.
    pub fn page(&self, page: u32) -> Option<&[u8]> {
        self.flash
            .get(&page)
            .map(Vec::as_slice)
    }

    /// Whether finalize was received.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether bye was received.
    pub fn said_bye(&self) -> bool {
        self.said_bye
    }

    /// Current device-side state.
    pub fn state(&self) -> MockState {
        self.state
    }

    fn record(&mut self, setup: ControlSetup, data: &[u8]) -> Result<Option<Command>> {
        let command = self
            .version
            .command(setup.request);

        self.requests
            .push(RecordedRequest {
                command,
                setup,
                data: data.to_vec(),
            });

        if self.disconnected {
            return Err(Error::Disconnected);
        }

        if let Some(cmd) = command {
            let count = self
                .counts
                .entry(cmd)
                .or_insert(0);
            *count += 1;
            let count = *count;

            if let Some(failure) = self.link_failure {
                if failure.command == cmd && failure.occurrence == count {
                    if failure.disconnect {
                        self.disconnected = true;
                        return Err(Error::Disconnected);
                    }
                    return Err(Error::Timeout(format!("mock {cmd} #{count}")));
                }
            }
        }

        Ok(command)
    }

    fn take_fault(&mut self, seq: u8, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let slot = self
            .faults
            .iter_mut()
            .find(|(fault, times)| *times > 0 && fault.seq() == seq && matches(fault))?;
        slot.1 -= 1;
        Some(slot.0)
    }

    fn store_page(&mut self, data: &[u8]) {
        if data.len() < 2 {
            return;
        }
        let seq = data[0];
        let len = usize::from(data[1]).min(data.len() - 2);
        let mut payload = data[2..2 + len].to_vec();

        if self.last_seq != Some(seq) {
            self.current_page += 1;
            self.last_seq = Some(seq);
        }

        if self
            .take_fault(seq, |f| matches!(f, Fault::CorruptWrite { .. }))
            .is_some()
        {
            if let Some(first) = payload.first_mut() {
                *first ^= 0xFF;
            }
        }

        self.flash
            .insert(self.current_page, payload);
    }

    fn readback(&mut self, buf: &mut [u8]) -> usize {
        let Some(seq) = self.last_seq else {
            return 0;
        };
        let mut data = self
            .flash
            .get(&self.current_page)
            .cloned()
            .unwrap_or_default();
        // Unwritten flash reads as erased.
        data.resize(data.len().max(DEFAULT_PAGE_SIZE), 0xFF);

        match self.take_fault(seq, |f| {
            matches!(
                f,
                Fault::CorruptReadback { .. } | Fault::ShortReadback { .. }
            )
        }) {
            Some(Fault::CorruptReadback { index, .. }) => {
                if let Some(byte) = data.get_mut(index) {
                    *byte ^= 0xFF;
                }
            },
            Some(Fault::ShortReadback { len, .. }) => data.truncate(len),
            _ => {},
        }

        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        n
    }
}

impl Transport for MockTransport {
    fn write_control(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        match self.record(setup, data)? {
            Some(Command::UpdateInit) if self.state == MockState::Greeted => {
                self.announced_pages = Some(setup.value);
                self.state = MockState::Receiving;
            },
            Some(Command::WritePage) if self.state == MockState::Receiving => {
                self.store_page(data);
            },
            Some(Command::Finalize) if self.state == MockState::Receiving => {
                self.finalized = true;
            },
            Some(Command::Bye) => {
                self.said_bye = true;
                self.state = MockState::Idle;
            },
            // The bootloader silently ignores anything else.
            _ => {},
        }
        Ok(data.len())
    }

    fn read_control(&mut self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize> {
        match self.record(setup, &[])? {
            Some(Command::Hello)
                if self.state == MockState::Idle
                    && setup.value == HELLO_VALUE
                    && setup.index == HELLO_INDEX =>
            {
                self.state = MockState::Greeted;
                let n = buf
                    .len()
                    .min(self.identity.len());
                buf[..n].copy_from_slice(&self.identity[..n]);
                Ok(n)
            },
            Some(Command::VerifyPage) if self.state == MockState::Receiving => {
                Ok(self.readback(buf))
            },
            _ => Ok(0),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Scriptable device list.
#[derive(Debug)]
pub struct MockEnumerator {
    devices: Vec<DeviceInfo>,
    version: ProtocolVersion,
    opened: Cell<usize>,
}

impl MockEnumerator {
    /// Create an enumerator reporting `devices`.
    pub fn new(devices: Vec<DeviceInfo>, version: ProtocolVersion) -> Self {
        Self {
            devices,
            version,
            opened: Cell::new(0),
        }
    }

    /// An empty bus.
    pub fn empty() -> Self {
        Self::new(Vec::new(), ProtocolVersion::default())
    }

    /// Number of devices opened so far.
    pub fn opened(&self) -> usize {
        self.opened
            .get()
    }
}

impl DeviceEnumerator for MockEnumerator {
    type Transport = MockTransport;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .clone())
    }

    fn open(&self, info: &DeviceInfo) -> Result<MockTransport> {
        if !self
            .devices
            .contains(info)
        {
            return Err(Error::Disconnected);
        }
        self.opened
            .set(self.opened.get() + 1);
        Ok(MockTransport::new(self.version))
    }
}
