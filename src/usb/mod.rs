//! USB transport seam.
//!
//! The driver core never talks to a USB stack directly. It enumerates devices
//! through [`UsbBackend`], reads their configuration through [`UsbDevice`] and
//! issues control requests and asynchronous transfers through [`UsbHandle`].
//! The default implementation lives in [`libusb`] and is backed by `rusb`.

#[cfg(feature = "rusb-backend")]
pub mod libusb;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// bmRequestType for class-specific, interface-recipient SET requests.
pub const REQ_TYPE_SET: u8 = 0x21;
/// bmRequestType for class-specific, interface-recipient GET requests.
pub const REQ_TYPE_GET: u8 = 0xa1;

// =============================================================================
// Configuration descriptors
// =============================================================================

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of an alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits.
    pub max_packet_size: u16,
    /// Class-specific bytes following the endpoint descriptor.
    pub extra: Vec<u8>,
}

impl EndpointInfo {
    /// Bytes the endpoint can move per service interval.
    ///
    /// Bits 0..10 hold the packet size, bits 11..12 the number of additional
    /// transactions per microframe.
    pub fn bytes_per_packet(&self) -> usize {
        let size = (self.max_packet_size & 0x07ff) as usize;
        let mult = ((self.max_packet_size >> 11) & 0x03) as usize;
        size * (mult + 1)
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltSetting {
    pub setting: u8,
    pub class_code: u8,
    pub subclass_code: u8,
    pub endpoints: Vec<EndpointInfo>,
    /// Class-specific bytes following the interface descriptor.
    pub extra: Vec<u8>,
}

/// An interface and its alternate settings, in descriptor order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alt_settings: Vec<AltSetting>,
}

/// The active configuration of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigInfo {
    pub interfaces: Vec<InterfaceInfo>,
}

impl ConfigInfo {
    /// Look up an interface by its bInterfaceNumber.
    pub fn interface(&self, number: u8) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|iface| iface.number == number)
    }
}

/// Standard USB device descriptor fields the driver needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbDeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_index: Option<u8>,
    pub product_index: Option<u8>,
    pub serial_number_index: Option<u8>,
}

// =============================================================================
// Asynchronous transfers
// =============================================================================

/// Identifies one submitted transfer until its completion is reported.
pub type TransferId = u64;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique transfer ID.
pub fn next_transfer_id() -> TransferId {
    NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shape of a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt,
    /// `packet_count` packets of `packet_len` bytes each, laid out back to back
    /// in the buffer.
    Isochronous { packet_count: usize, packet_len: usize },
}

/// Outcome of a transfer or of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// A transfer handed to the transport.
///
/// The buffer is moved into the transport and handed back in
/// [`CompletedTransfer`], so it cannot be freed while the device may write it.
#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    /// Zero means no timeout.
    pub timeout: Duration,
}

/// Per-packet result of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// A transfer reported back by the transport.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub status: TransferStatus,
    /// The submitted buffer, at its submitted length.
    pub buffer: Vec<u8>,
    /// Bytes received for bulk and interrupt transfers.
    pub actual_length: usize,
    /// One entry per packet for isochronous transfers.
    pub iso_packets: Vec<IsoPacket>,
    pub timeout: Duration,
}

impl CompletedTransfer {
    /// Bytes received for a bulk or interrupt transfer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    /// Bytes received in isochronous packet `index`.
    pub fn iso_packet_data(&self, index: usize) -> &[u8] {
        let TransferKind::Isochronous { packet_len, .. } = self.kind else {
            return &[];
        };
        let Some(packet) = self.iso_packets.get(index) else {
            return &[];
        };
        let start = (index * packet_len).min(self.buffer.len());
        let end = (start + packet.actual_length.min(packet_len)).min(self.buffer.len());
        &self.buffer[start..end]
    }

    /// Turn the completion back into a submittable transfer with the same ID.
    pub fn into_transfer(self) -> Transfer {
        Transfer {
            id: self.id,
            endpoint: self.endpoint,
            kind: self.kind,
            buffer: self.buffer,
            timeout: self.timeout,
        }
    }
}

/// Receives transfer completions. Called from the transport's event context,
/// never from inside [`UsbHandle::submit`] or [`UsbHandle::cancel`].
pub type CompletionHandler = Arc<dyn Fn(CompletedTransfer) + Send + Sync>;

// =============================================================================
// Transport traits
// =============================================================================

/// Entry point of a USB stack.
pub trait UsbBackend: Send + Sync + 'static {
    /// List every device currently attached.
    fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>>;

    /// Process pending transport events for up to `timeout`.
    ///
    /// Transfer completions are delivered from here unless the backend
    /// drives them from its own threads.
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

/// An attached, not necessarily opened, USB device.
pub trait UsbDevice: Send + Sync {
    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    fn device_descriptor(&self) -> Result<UsbDeviceDescriptor>;

    /// The active configuration, including class-specific extra bytes.
    fn config_descriptor(&self) -> Result<ConfigInfo>;

    fn open(&self) -> Result<Arc<dyn UsbHandle>>;
}

/// An opened USB device. Dropping the last reference closes it.
pub trait UsbHandle: Send + Sync {
    /// Device-to-host control request. Returns the number of bytes read.
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Host-to-device control request. Returns the number of bytes written.
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Claim an interface, detaching any kernel driver bound to it.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()>;

    fn clear_halt(&self, endpoint: u8) -> Result<()>;

    fn read_string_descriptor(&self, index: u8) -> Result<String>;

    /// Queue a transfer. `handler` is invoked exactly once with its result.
    fn submit(&self, transfer: Transfer, handler: CompletionHandler) -> Result<()>;

    /// Request cancellation of an in-flight transfer.
    ///
    /// Returns `Err(Error::NotFound)` if the transport no longer holds it. A
    /// successful cancel is reported later as a `Cancelled` completion.
    fn cancel(&self, id: TransferId) -> Result<()>;
}

impl fmt::Debug for dyn UsbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UsbHandle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_packet_high_bandwidth() {
        let ep = EndpointInfo {
            address: 0x81,
            kind: EndpointKind::Isochronous,
            max_packet_size: 0x1400,
            extra: Vec::new(),
        };
        assert_eq!(ep.bytes_per_packet(), 1024 * 3);

        let ep = EndpointInfo {
            max_packet_size: 0x00c0,
            ..ep
        };
        assert_eq!(ep.bytes_per_packet(), 192);
    }

    #[test]
    fn test_iso_packet_data_uses_packet_stride() {
        let mut buffer = vec![0u8; 12];
        buffer[4..7].copy_from_slice(&[1, 2, 3]);
        let done = CompletedTransfer {
            id: 1,
            endpoint: 0x81,
            kind: TransferKind::Isochronous {
                packet_count: 3,
                packet_len: 4,
            },
            status: TransferStatus::Completed,
            buffer,
            actual_length: 0,
            iso_packets: vec![
                IsoPacket {
                    status: TransferStatus::Completed,
                    actual_length: 0,
                },
                IsoPacket {
                    status: TransferStatus::Completed,
                    actual_length: 3,
                },
            ],
            timeout: Duration::ZERO,
        };
        assert!(done.iso_packet_data(0).is_empty());
        assert_eq!(done.iso_packet_data(1), &[1, 2, 3]);
        assert!(done.iso_packet_data(2).is_empty());
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        let a = next_transfer_id();
        let b = next_transfer_id();
        assert_ne!(a, b);
    }
}
