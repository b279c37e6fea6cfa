//! Devices and open device handles.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::context::Context;
use crate::control::ControlGateway;
use crate::descriptor::{
    parse_device_info, DeviceInfo, ExtensionUnit, InputTerminal, OutputTerminal, ProcessingUnit,
    SelectorUnit,
};
use crate::error::{Error, Result};
use crate::negotiate::{commit_stream_ctrl, StreamCtrl};
use crate::status::StatusChannel;
use crate::stream::StreamHandle;
use crate::types::{DeviceDescriptor, Frame, StreamConfig};
use crate::usb::{ConfigInfo, UsbDevice, UsbDeviceDescriptor, UsbHandle};

/// Apple iSight cameras prefix every payload with their own header.
const ISIGHT_IDS: (u16, u16) = (0x05ac, 0x8501);

// =============================================================================
// Device
// =============================================================================

/// An attached UVC device, as listed by [`Context::devices`].
#[derive(Clone)]
pub struct Device {
    context: Context,
    usb: Arc<dyn UsbDevice>,
}

impl Device {
    pub(crate) fn new(context: Context, usb: Arc<dyn UsbDevice>) -> Self {
        Self { context, usb }
    }

    pub fn bus_number(&self) -> u8 {
        self.usb.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.usb.address()
    }

    pub(crate) fn usb_descriptor(&self) -> Result<UsbDeviceDescriptor> {
        self.usb.device_descriptor()
    }

    /// IDs, UVC release and descriptor strings.
    ///
    /// Strings need the device opened briefly; if that fails they are left
    /// as `None`.
    pub fn descriptor(&self) -> Result<DeviceDescriptor> {
        let usb_desc = self.usb.device_descriptor()?;
        let bcd_uvc = self
            .usb
            .config_descriptor()
            .and_then(|config| parse_device_info(&usb_desc, &config))
            .map(|info| info.control.bcd_uvc)
            .unwrap_or(0);

        let mut desc = DeviceDescriptor {
            vendor_id: usb_desc.vendor_id,
            product_id: usb_desc.product_id,
            bcd_uvc,
            ..Default::default()
        };

        match self.usb.open() {
            Ok(handle) => {
                let read = |index: Option<u8>| {
                    index.and_then(|index| match handle.read_string_descriptor(index) {
                        Ok(s) => Some(s),
                        Err(e) => {
                            debug!("reading string descriptor {index} failed: {e}");
                            None
                        }
                    })
                };
                desc.serial_number = read(usb_desc.serial_number_index);
                desc.manufacturer = read(usb_desc.manufacturer_index);
                desc.product = read(usb_desc.product_index);
            }
            Err(e) => debug!("cannot open {self:?} for descriptor strings: {e}"),
        }
        Ok(desc)
    }

    /// Open the device for control and streaming.
    pub fn open(&self) -> Result<DeviceHandle> {
        let usb = self.usb.open()?;
        let usb_desc = self.usb.device_descriptor()?;
        let config = self.usb.config_descriptor()?;
        let info = Arc::new(parse_device_info(&usb_desc, &config)?);

        let control_iface = info.control.interface_number;
        usb.claim_interface(control_iface)?;

        let status = StatusChannel::new(Arc::clone(&info), Arc::clone(&usb));
        if let Some(endpoint) = info.control.status_endpoint {
            if let Err(e) = status.start(endpoint) {
                release_quietly(&*usb, control_iface);
                return Err(e);
            }
        }

        if let Err(e) = self.context.register_handle() {
            status.stop();
            release_quietly(&*usb, control_iface);
            return Err(e);
        }

        let isight = (usb_desc.vendor_id, usb_desc.product_id) == ISIGHT_IDS;
        info!(
            "opened {:04x}:{:04x} at {:03}:{:03}, UVC {:x}.{:02x}",
            usb_desc.vendor_id,
            usb_desc.product_id,
            self.bus_number(),
            self.address(),
            info.control.bcd_uvc >> 8,
            info.control.bcd_uvc & 0xff
        );

        Ok(DeviceHandle {
            inner: Arc::new(HandleInner {
                device: self.clone(),
                usb,
                config,
                info,
                isight,
                status,
                claimed: Mutex::new(vec![control_iface]),
                streams: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({:03}:{:03})", self.bus_number(), self.address())
    }
}

fn release_quietly(usb: &dyn UsbHandle, interface: u8) {
    if let Err(e) = usb.release_interface(interface) {
        debug!("releasing interface {interface} failed: {e}");
    }
}

// =============================================================================
// Device handle
// =============================================================================

/// State shared between a [`DeviceHandle`] and the streams opened from it.
/// The device is closed when the last of them goes away.
pub(crate) struct HandleInner {
    device: Device,
    pub(crate) usb: Arc<dyn UsbHandle>,
    pub(crate) config: ConfigInfo,
    pub(crate) info: Arc<DeviceInfo>,
    pub(crate) isight: bool,
    status: Arc<StatusChannel>,
    claimed: Mutex<Vec<u8>>,
    streams: Mutex<Vec<u8>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HandleInner {
    pub(crate) fn gateway(&self) -> ControlGateway<'_> {
        ControlGateway::new(&*self.usb)
    }

    /// Claim `interface` unless this handle already holds it. Returns true
    /// if this call claimed it.
    pub(crate) fn claim_interface(&self, interface: u8) -> Result<bool> {
        let mut claimed = locked(&self.claimed);
        if claimed.contains(&interface) {
            return Ok(false);
        }
        self.usb.claim_interface(interface)?;
        debug!("claimed interface {interface}");
        claimed.push(interface);
        Ok(true)
    }

    pub(crate) fn release_interface(&self, interface: u8) {
        let mut claimed = locked(&self.claimed);
        let Some(pos) = claimed.iter().position(|&n| n == interface) else {
            return;
        };
        claimed.remove(pos);
        release_quietly(&*self.usb, interface);
    }

    fn register_stream(&self, interface: u8) -> Result<()> {
        let mut streams = locked(&self.streams);
        if streams.contains(&interface) {
            return Err(Error::Busy);
        }
        streams.push(interface);
        Ok(())
    }

    pub(crate) fn forget_stream(&self, interface: u8) {
        locked(&self.streams).retain(|&n| n != interface);
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.status.stop();
        let claimed = std::mem::take(&mut *locked(&self.claimed));
        for interface in claimed {
            release_quietly(&*self.usb, interface);
        }
        self.device.context.unregister_handle();
        debug!("closed {:?}", self.device);
    }
}

/// An open UVC device.
///
/// Streams opened from a handle keep the device open; [`close`](Self::close)
/// refuses while any of them is still alive.
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl DeviceHandle {
    /// The parsed descriptor graph.
    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn descriptor(&self) -> Result<DeviceDescriptor> {
        self.inner.device.descriptor()
    }

    pub fn input_terminals(&self) -> &[InputTerminal] {
        &self.info().control.input_terminals
    }

    pub fn output_terminals(&self) -> &[OutputTerminal] {
        &self.info().control.output_terminals
    }

    pub fn selector_units(&self) -> &[SelectorUnit] {
        &self.info().control.selector_units
    }

    pub fn processing_units(&self) -> &[ProcessingUnit] {
        &self.info().control.processing_units
    }

    pub fn extension_units(&self) -> &[ExtensionUnit] {
        &self.info().control.extension_units
    }

    pub(crate) fn gateway(&self) -> ControlGateway<'_> {
        self.inner.gateway()
    }

    pub(crate) fn status(&self) -> &StatusChannel {
        &self.inner.status
    }

    pub(crate) fn claim_interface(&self, interface: u8) -> Result<bool> {
        self.inner.claim_interface(interface)
    }

    pub(crate) fn release_interface(&self, interface: u8) {
        self.inner.release_interface(interface)
    }

    /// Commit `ctrl` and open a stream on its interface with the default
    /// configuration.
    pub fn open_stream(&self, ctrl: &StreamCtrl) -> Result<StreamHandle> {
        self.open_stream_with_config(ctrl, StreamConfig::default())
    }

    /// Commit `ctrl` and open a stream on its interface.
    ///
    /// Fails with [`Error::Busy`] if the interface already has an open stream.
    pub fn open_stream_with_config(
        &self,
        ctrl: &StreamCtrl,
        config: StreamConfig,
    ) -> Result<StreamHandle> {
        config.validate()?;
        let iface = ctrl.interface_number;
        if self.info().streaming_interface(iface).is_none() {
            return Err(Error::InvalidParam);
        }
        self.inner.register_stream(iface)?;

        let committed = self
            .claim_interface(iface)
            .and_then(|_| commit_stream_ctrl(&self.gateway(), self.info(), ctrl));
        if let Err(e) = committed {
            warn!("committing stream on interface {iface} failed: {e}");
            self.inner.forget_stream(iface);
            return Err(e);
        }

        Ok(StreamHandle::new(Arc::clone(&self.inner), *ctrl, config))
    }

    /// Open a stream and start delivering frames to `callback`.
    pub fn start_streaming<F>(&self, ctrl: &StreamCtrl, callback: F) -> Result<StreamHandle>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        let mut stream = self.open_stream(ctrl)?;
        stream.start(callback)?;
        Ok(stream)
    }

    /// Close the device.
    ///
    /// Returns the handle together with [`Error::Busy`] while streams opened
    /// from it are still alive.
    pub fn close(self) -> std::result::Result<(), (Self, Error)> {
        if !locked(&self.inner.streams).is_empty() {
            return Err((self, Error::Busy));
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.inner.device)
            .field("bcd_uvc", &self.info().control.bcd_uvc)
            .field("streams", &*locked(&self.inner.streams))
            .finish()
    }
}
