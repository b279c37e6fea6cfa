//! libusb transport built on `rusb`.
//!
//! Control requests map one to one onto `rusb` calls. Streaming transfers
//! (isochronous, bulk and interrupt) go through libusb's asynchronous API via
//! `rusb::ffi`: each submit allocates a `libusb_transfer`, and its completion
//! handler runs from [`UsbBackend::handle_events`] on whichever thread drives
//! the event loop.

use std::collections::HashMap;
use std::os::raw::{c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error};
use rusb::{ffi, UsbContext};

use crate::error::{Error, Result};
use crate::usb::{
    AltSetting, CompletedTransfer, CompletionHandler, ConfigInfo, EndpointInfo, EndpointKind,
    InterfaceInfo, IsoPacket, Transfer, TransferId, TransferKind, TransferStatus, UsbBackend,
    UsbDevice, UsbDeviceDescriptor, UsbHandle,
};

const ENDPOINT_DIR_IN: u8 = 0x80;

/// `rusb` transport rooted in a private libusb context.
pub struct RusbBackend {
    context: rusb::Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: rusb::Context::new()?,
        })
    }
}

impl UsbBackend for RusbBackend {
    fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>> {
        let list = self.context.devices()?;
        Ok(list
            .iter()
            .map(|device| Arc::new(RusbDevice { device }) as Arc<dyn UsbDevice>)
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.context.handle_events(Some(timeout))?;
        Ok(())
    }
}

struct RusbDevice {
    device: rusb::Device<rusb::Context>,
}

/// Copy a descriptor's class-specific tail. Accepts both the slice and the
/// optional-slice shapes `extra()` has had across `rusb` releases.
fn owned_extra<'a>(extra: impl Into<Option<&'a [u8]>>) -> Vec<u8> {
    extra.into().map(<[u8]>::to_vec).unwrap_or_default()
}

fn endpoint_kind(kind: rusb::TransferType) -> EndpointKind {
    match kind {
        rusb::TransferType::Control => EndpointKind::Control,
        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
        rusb::TransferType::Bulk => EndpointKind::Bulk,
        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
    }
}

impl UsbDevice for RusbDevice {
    fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn device_descriptor(&self) -> Result<UsbDeviceDescriptor> {
        let desc = self.device.device_descriptor()?;
        Ok(UsbDeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer_index: desc.manufacturer_string_index(),
            product_index: desc.product_string_index(),
            serial_number_index: desc.serial_number_string_index(),
        })
    }

    fn config_descriptor(&self) -> Result<ConfigInfo> {
        let config = self.device.config_descriptor(0)?;
        let interfaces = config
            .interfaces()
            .map(|iface| InterfaceInfo {
                number: iface.number(),
                alt_settings: iface
                    .descriptors()
                    .map(|alt| AltSetting {
                        setting: alt.setting_number(),
                        class_code: alt.class_code(),
                        subclass_code: alt.sub_class_code(),
                        endpoints: alt
                            .endpoint_descriptors()
                            .map(|ep| EndpointInfo {
                                address: ep.address(),
                                kind: endpoint_kind(ep.transfer_type()),
                                max_packet_size: ep.max_packet_size(),
                                extra: owned_extra(ep.extra()),
                            })
                            .collect(),
                        extra: owned_extra(alt.extra()),
                    })
                    .collect(),
            })
            .collect();
        Ok(ConfigInfo { interfaces })
    }

    fn open(&self) -> Result<Arc<dyn UsbHandle>> {
        let mut handle = self.device.open()?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // Not supported on every platform; claiming may still succeed.
            debug!("auto-detach of kernel driver unavailable: {e}");
        }
        Ok(Arc::new(RusbHandle {
            handle: Arc::new(handle),
            tracker: Arc::new(Tracker::default()),
        }))
    }
}

// =============================================================================
// Handle and asynchronous transfers
// =============================================================================

// Values from libusb.h.
const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;
const TRANSFER_TYPE_BULK: u8 = 2;
const TRANSFER_TYPE_INTERRUPT: u8 = 3;

const TRANSFER_COMPLETED: c_int = 0;
const TRANSFER_TIMED_OUT: c_int = 2;
const TRANSFER_CANCELLED: c_int = 3;
const TRANSFER_STALL: c_int = 4;
const TRANSFER_NO_DEVICE: c_int = 5;
const TRANSFER_OVERFLOW: c_int = 6;

fn transfer_status(code: c_int) -> TransferStatus {
    match code {
        TRANSFER_COMPLETED => TransferStatus::Completed,
        TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        TRANSFER_CANCELLED => TransferStatus::Cancelled,
        TRANSFER_STALL => TransferStatus::Stall,
        TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map a negative `libusb_error` code.
fn libusb_error(code: c_int) -> Error {
    match code {
        -1 => Error::Io,
        -2 => Error::InvalidParam,
        -3 => Error::Access,
        -4 => Error::NoDevice,
        -5 => Error::NotFound,
        -6 => Error::Busy,
        -7 => Error::Timeout,
        -8 => Error::Overflow,
        -9 => Error::Pipe,
        -10 => Error::Interrupted,
        -11 => Error::NoMem,
        -12 => Error::NotSupported,
        _ => Error::Other,
    }
}

/// libusb transfer type and packet count for a transfer shape.
fn raw_shape(kind: TransferKind, buffer_len: usize) -> Result<(u8, c_int)> {
    match kind {
        TransferKind::Bulk => Ok((TRANSFER_TYPE_BULK, 0)),
        TransferKind::Interrupt => Ok((TRANSFER_TYPE_INTERRUPT, 0)),
        TransferKind::Isochronous {
            packet_count,
            packet_len,
        } => {
            let fits = packet_count
                .checked_mul(packet_len)
                .is_some_and(|total| total <= buffer_len);
            if !fits || packet_len > c_uint::MAX as usize {
                return Err(Error::InvalidParam);
            }
            let packets = c_int::try_from(packet_count).map_err(|_| Error::InvalidParam)?;
            Ok((TRANSFER_TYPE_ISOCHRONOUS, packets))
        }
    }
}

/// A `libusb_transfer` that has been handed to libusb.
struct RawTransfer(NonNull<ffi::libusb_transfer>);

// Only dereferenced by libusb, by the completion callback, and by cancel
// under the tracker lock.
unsafe impl Send for RawTransfer {}

/// Transfers submitted and not yet handed back by libusb.
#[derive(Default)]
struct Tracker {
    in_flight: Mutex<HashMap<TransferId, RawTransfer>>,
}

impl Tracker {
    fn insert(&self, id: TransferId, raw: NonNull<ffi::libusb_transfer>) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, RawTransfer(raw));
    }

    fn remove(&self, id: TransferId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Everything a transfer owns while libusb holds it, reached via `user_data`.
struct Pending {
    transfer: Transfer,
    handler: CompletionHandler,
    tracker: Arc<Tracker>,
    // Keeps the device open until the last transfer is handed back.
    _handle: Arc<rusb::DeviceHandle<rusb::Context>>,
}

struct RusbHandle {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    tracker: Arc<Tracker>,
}

/// Runs on the thread inside `libusb_handle_events`.
extern "system" fn transfer_callback(raw: *mut ffi::libusb_transfer) {
    // SAFETY: `user_data` was produced by `Box::into_raw` in `submit`, and
    // libusb invokes the callback exactly once per submitted transfer, so the
    // box is reclaimed once. The transfer stays valid until freed below.
    let (pending, status, actual_length, iso_packets) = unsafe {
        let pending = Box::from_raw((*raw).user_data.cast::<Pending>());
        let status = transfer_status((*raw).status);
        let actual_length = usize::try_from((*raw).actual_length).unwrap_or(0);
        let count = usize::try_from((*raw).num_iso_packets).unwrap_or(0);
        let descs = ptr::addr_of!((*raw).iso_packet_desc)
            .cast::<ffi::libusb_iso_packet_descriptor>();
        let iso_packets = (0..count)
            .map(|i| {
                let desc = &*descs.add(i);
                IsoPacket {
                    status: transfer_status(desc.status),
                    actual_length: desc.actual_length as usize,
                }
            })
            .collect::<Vec<_>>();
        (pending, status, actual_length, iso_packets)
    };

    let Pending {
        transfer,
        handler,
        tracker,
        _handle,
    } = *pending;
    // Removing under the tracker lock orders the free after any cancel that
    // is still using the pointer.
    tracker.remove(transfer.id);
    // SAFETY: no longer referenced by libusb or by the tracker.
    unsafe { ffi::libusb_free_transfer(raw) };

    let done = CompletedTransfer {
        id: transfer.id,
        endpoint: transfer.endpoint,
        kind: transfer.kind,
        status,
        buffer: transfer.buffer,
        actual_length,
        iso_packets,
        timeout: transfer.timeout,
    };
    // A panic must not unwind into libusb.
    if panic::catch_unwind(AssertUnwindSafe(|| handler(done))).is_err() {
        error!("transfer completion handler panicked");
    }
}

impl UsbHandle for RusbHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, buf, timeout)?)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()> {
        Ok(self.handle.set_alternate_setting(interface, setting)?)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        Ok(self.handle.clear_halt(endpoint)?)
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String> {
        Ok(self.handle.read_string_descriptor_ascii(index)?)
    }

    fn submit(&self, mut transfer: Transfer, handler: CompletionHandler) -> Result<()> {
        if transfer.endpoint & ENDPOINT_DIR_IN == 0 {
            return Err(Error::InvalidParam);
        }
        let (transfer_type, num_packets) = raw_shape(transfer.kind, transfer.buffer.len())?;
        let length = c_int::try_from(transfer.buffer.len()).map_err(|_| Error::InvalidParam)?;
        let timeout = c_uint::try_from(transfer.timeout.as_millis()).unwrap_or(c_uint::MAX);
        let id = transfer.id;
        let endpoint = transfer.endpoint;
        let kind = transfer.kind;
        // The heap buffer does not move when the Vec moves into the box.
        let buffer = transfer.buffer.as_mut_ptr();

        // SAFETY: plain allocation; a null return is handled below.
        let raw = unsafe { ffi::libusb_alloc_transfer(num_packets) };
        let raw = NonNull::new(raw).ok_or(Error::NoMem)?;

        let pending = Box::into_raw(Box::new(Pending {
            transfer,
            handler,
            tracker: Arc::clone(&self.tracker),
            _handle: Arc::clone(&self.handle),
        }));

        // SAFETY: `raw` was allocated above with room for `num_packets`
        // descriptors and is not yet visible to libusb. `buffer` is owned by
        // `pending`, which outlives the transfer.
        unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = self.handle.as_raw();
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = transfer_type;
            (*t).timeout = timeout;
            (*t).length = length;
            (*t).callback = transfer_callback;
            (*t).user_data = pending.cast::<c_void>();
            (*t).buffer = buffer;
            (*t).num_iso_packets = num_packets;
            if let TransferKind::Isochronous { packet_len, .. } = kind {
                let descs = ptr::addr_of_mut!((*t).iso_packet_desc)
                    .cast::<ffi::libusb_iso_packet_descriptor>();
                for i in 0..num_packets as usize {
                    (*descs.add(i)).length = packet_len as c_uint;
                }
            }
        }

        self.tracker.insert(id, raw);
        // SAFETY: the transfer is fully initialised.
        let rc = unsafe { ffi::libusb_submit_transfer(raw.as_ptr()) };
        if rc < 0 {
            self.tracker.remove(id);
            // SAFETY: libusb rejected the transfer, so the callback will not
            // run and ownership of both allocations is back with us.
            unsafe {
                drop(Box::from_raw(pending));
                ffi::libusb_free_transfer(raw.as_ptr());
            }
            let err = libusb_error(rc);
            debug!("submitting transfer on endpoint {endpoint:#04x} failed: {err}");
            return Err(err);
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<()> {
        let in_flight = self
            .tracker
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let raw = in_flight.get(&id).ok_or(Error::NotFound)?;
        // SAFETY: the callback cannot free the transfer while we hold the lock.
        let rc = unsafe { ffi::libusb_cancel_transfer(raw.0.as_ptr()) };
        if rc < 0 {
            return Err(libusb_error(rc));
        }
        Ok(())
    }
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        // Anything still queued is cancelled; each `Pending` holds the device
        // open until its completion has been delivered.
        let in_flight = self
            .tracker
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.is_empty() {
            debug!("cancelling {} transfers on close", in_flight.len());
        }
        for raw in in_flight.values() {
            // SAFETY: as in `cancel`.
            unsafe { ffi::libusb_cancel_transfer(raw.0.as_ptr()) };
        }
    }
}
