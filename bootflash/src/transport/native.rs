//! Native USB transport using the `rusb` crate (libusb).

use {
    crate::{
        error::{Error, Result},
        transport::{
            ControlSetup, DEFAULT_TIMEOUT, DeviceEnumerator, DeviceInfo, REQUEST_TYPE_IN,
            REQUEST_TYPE_OUT, Transport,
        },
    },
    log::trace,
    rusb::{Context, DeviceHandle, UsbContext},
    std::time::Duration,
};

/// Control-transfer transport over an open libusb device handle.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    name: String,
    timeout: Duration,
}

impl UsbTransport {
    /// Wrap an already opened device handle.
    pub fn new(handle: DeviceHandle<Context>, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn map_error(&self, setup: ControlSetup, err: rusb::Error) -> Error {
        match err {
            rusb::Error::Timeout => Error::Timeout(format!(
                "request 0x{:02x} on {} after {:?}",
                setup.request, self.name, self.timeout
            )),
            rusb::Error::NoDevice => Error::Disconnected,
            other => Error::Usb(other),
        }
    }
}

impl Transport for UsbTransport {
    fn write_control(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        trace!(
            "OUT req=0x{:02x} value=0x{:04x} index=0x{:04x} len={}",
            setup.request,
            setup.value,
            setup.index,
            data.len()
        );
        self.handle
            .write_control(
                REQUEST_TYPE_OUT,
                setup.request,
                setup.value,
                setup.index,
                data,
                self.timeout,
            )
            .map_err(|e| self.map_error(setup, e))
    }

    fn read_control(&mut self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .handle
            .read_control(
                REQUEST_TYPE_IN,
                setup.request,
                setup.value,
                setup.index,
                buf,
                self.timeout,
            )
            .map_err(|e| self.map_error(setup, e))?;
        trace!(
            "IN  req=0x{:02x} value=0x{:04x} index=0x{:04x} len={n}/{}",
            setup.request,
            setup.value,
            setup.index,
            buf.len()
        );
        Ok(n)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Native USB enumerator owning its own libusb context.
pub struct UsbEnumerator {
    context: Context,
}

impl UsbEnumerator {
    /// Initialise libusb.
    ///
    /// Fails with [`Error::Usb`] when libusb cannot start, e.g. without
    /// access to the USB device nodes.
    pub fn new() -> Result<Self> {
        let context = Context::new()?;
        Ok(Self { context })
    }
}

impl DeviceEnumerator for UsbEnumerator {
    type Transport = UsbTransport;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self
            .context
            .devices()?;

        let mut found = Vec::new();
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    trace!(
                        "Skipping usb {:03}:{:03}: {e}",
                        device.bus_number(),
                        device.address()
                    );
                    continue;
                },
            };

            found.push(DeviceInfo {
                bus: device.bus_number(),
                address: device.address(),
                vid: desc.vendor_id(),
                pid: desc.product_id(),
                class: desc.class_code(),
            });
        }

        Ok(found)
    }

    fn open(&self, info: &DeviceInfo) -> Result<UsbTransport> {
        let devices = self
            .context
            .devices()?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == info.bus && d.address() == info.address)
            .ok_or(Error::Disconnected)?;

        let handle = device.open()?;
        Ok(UsbTransport::new(handle, info.location()))
    }
}
