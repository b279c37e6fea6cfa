//! Scripted in-memory USB transport.
//!
//! A [`MockDevice`] serves a fixed configuration, answers control requests
//! from scripted responses (GET_CUR echoes the last SET_CUR by default) and
//! parks submitted transfers until the test completes them. Completions are
//! queued and delivered by [`MockHandle::dispatch`], which
//! [`MockBackend::handle_events`] calls, so a context that owns its event
//! loop drives them automatically.

pub mod descriptors;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::control::RequestCode;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::usb::{
    CompletedTransfer, CompletionHandler, ConfigInfo, IsoPacket, Transfer, TransferId,
    TransferKind, TransferStatus, UsbBackend, UsbDevice, UsbDeviceDescriptor, UsbHandle,
};

use self::descriptors::CameraLayout;

/// Open a single mock camera on a context that owns its event loop.
pub fn open_mock_camera(layout: &CameraLayout) -> Result<(Context, Arc<MockDevice>, DeviceHandle)> {
    open_mock_camera_with(layout, true)
}

/// Open a single mock camera. Without an owned event loop, completions are
/// only delivered by [`Context::handle_events`] or [`MockHandle::dispatch`].
pub fn open_mock_camera_with(
    layout: &CameraLayout,
    owns_event_loop: bool,
) -> Result<(Context, Arc<MockDevice>, DeviceHandle)> {
    let device = Arc::new(MockDevice::camera(layout));
    let ctx = Context::with_backend(MockBackend::new(vec![Arc::clone(&device)]), owns_event_loop);
    let handle = ctx.find_device(None, None, None)?.open()?;
    Ok((ctx, device, handle))
}

// =============================================================================
// Backend
// =============================================================================

pub struct MockBackend {
    devices: Vec<Arc<MockDevice>>,
}

impl MockBackend {
    pub fn new(devices: Vec<Arc<MockDevice>>) -> Self {
        Self { devices }
    }
}

impl UsbBackend for MockBackend {
    fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>> {
        Ok(self
            .devices
            .iter()
            .map(|device| Arc::clone(device) as Arc<dyn UsbDevice>)
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        let delivered: usize = self.devices.iter().map(|d| d.handle.dispatch()).sum();
        if delivered == 0 {
            thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(())
    }
}

// =============================================================================
// Device
// =============================================================================

pub struct MockDevice {
    bus_number: u8,
    address: u8,
    descriptor: UsbDeviceDescriptor,
    config: ConfigInfo,
    open_error: Option<Error>,
    handle: Arc<MockHandle>,
}

impl MockDevice {
    pub fn new(descriptor: UsbDeviceDescriptor, config: ConfigInfo) -> Self {
        Self {
            bus_number: 1,
            address: 1,
            descriptor,
            config,
            open_error: None,
            handle: Arc::new(MockHandle::default()),
        }
    }

    /// A 046d:0825 camera shaped by `layout`, with manufacturer, product and
    /// serial strings at indices 1, 2 and 3.
    pub fn camera(layout: &CameraLayout) -> Self {
        let descriptor = UsbDeviceDescriptor {
            vendor_id: 0x046d,
            product_id: 0x0825,
            manufacturer_index: Some(1),
            product_index: Some(2),
            serial_number_index: Some(3),
        };
        let device = Self::new(descriptor, descriptors::camera_config(layout));
        device.handle.set_string(1, "Mock Vendor");
        device.handle.set_string(2, "Mock Camera");
        device.handle.set_string(3, "0001");
        device
    }

    pub fn with_address(mut self, bus_number: u8, address: u8) -> Self {
        self.bus_number = bus_number;
        self.address = address;
        self
    }

    /// Make `open` fail with `error`.
    pub fn with_open_error(mut self, error: Error) -> Self {
        self.open_error = Some(error);
        self
    }

    /// The handle every `open` returns.
    pub fn handle(&self) -> &Arc<MockHandle> {
        &self.handle
    }
}

impl UsbDevice for MockDevice {
    fn bus_number(&self) -> u8 {
        self.bus_number
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn device_descriptor(&self) -> Result<UsbDeviceDescriptor> {
        Ok(self.descriptor.clone())
    }

    fn config_descriptor(&self) -> Result<ConfigInfo> {
        Ok(self.config.clone())
    }

    fn open(&self) -> Result<Arc<dyn UsbHandle>> {
        match self.open_error {
            Some(error) => Err(error),
            None => Ok(Arc::clone(&self.handle) as Arc<dyn UsbHandle>),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A control request seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Bytes written, or the requested length in zeros for reads.
    pub data: Vec<u8>,
}

struct Pending {
    transfer: Transfer,
    handler: CompletionHandler,
}

#[derive(Default)]
struct HandleState {
    control_log: Vec<ControlRecord>,
    responses: HashMap<(u8, u16, u16), Vec<u8>>,
    current: HashMap<(u16, u16), Vec<u8>>,
    control_errors: HashMap<(u8, u16), Error>,
    short_controls: HashSet<(u8, u16)>,
    strings: HashMap<u8, String>,
    claimed: HashSet<u8>,
    claim_error: Option<Error>,
    released: Vec<u8>,
    alt_settings: HashMap<u8, u8>,
    cleared_halts: Vec<u8>,
    pending: VecDeque<Pending>,
    ready: VecDeque<(CompletedTransfer, CompletionHandler)>,
    submit_limit: Option<usize>,
    submissions: usize,
}

#[derive(Default)]
pub struct MockHandle {
    state: Mutex<HandleState>,
}

impl MockHandle {
    fn state(&self) -> std::sync::MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_string(&self, index: u8, value: &str) {
        self.state().strings.insert(index, value.to_string());
    }

    /// Answer `request` on (`value`, `index`) with `data`.
    pub fn set_response(&self, request: RequestCode, value: u16, index: u16, data: &[u8]) {
        self.state()
            .responses
            .insert((request as u8, value, index), data.to_vec());
    }

    /// Fail `request` on control selector word `value`.
    pub fn fail_control(&self, request: RequestCode, value: u16, error: Error) {
        self.state()
            .control_errors
            .insert((request as u8, value), error);
    }

    /// Transfer one byte less than asked for `request` on `value`.
    pub fn short_control(&self, request: RequestCode, value: u16) {
        self.state().short_controls.insert((request as u8, value));
    }

    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state().control_log.clone()
    }

    pub fn clear_control_log(&self) {
        self.state().control_log.clear();
    }

    pub fn fail_claim(&self, error: Error) {
        self.state().claim_error = Some(error);
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        let mut claimed: Vec<u8> = self.state().claimed.iter().copied().collect();
        claimed.sort_unstable();
        claimed
    }

    pub fn released_interfaces(&self) -> Vec<u8> {
        self.state().released.clone()
    }

    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.state().alt_settings.get(&interface).copied()
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        self.state().cleared_halts.clone()
    }

    /// Accept only `limit` more submissions; later ones fail with `Io`.
    pub fn limit_submissions(&self, limit: usize) {
        let mut state = self.state();
        state.submit_limit = Some(state.submissions + limit);
    }

    /// Transfers parked on `endpoint`, oldest first.
    pub fn pending(&self, endpoint: u8) -> usize {
        self.state()
            .pending
            .iter()
            .filter(|p| p.transfer.endpoint == endpoint)
            .count()
    }

    /// Buffer length and kind of the oldest transfer parked on `endpoint`.
    pub fn pending_shape(&self, endpoint: u8) -> Option<(usize, TransferKind)> {
        self.state()
            .pending
            .iter()
            .find(|p| p.transfer.endpoint == endpoint)
            .map(|p| (p.transfer.buffer.len(), p.transfer.kind))
    }

    fn take_pending(state: &mut HandleState, endpoint: u8) -> Option<Pending> {
        let pos = state
            .pending
            .iter()
            .position(|p| p.transfer.endpoint == endpoint)?;
        state.pending.remove(pos)
    }

    fn finish(
        state: &mut HandleState,
        pending: Pending,
        status: TransferStatus,
        actual_length: usize,
        iso_packets: Vec<IsoPacket>,
    ) {
        let Pending { transfer, handler } = pending;
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
        state.ready.push_back((done, handler));
    }

    /// Complete the oldest bulk or interrupt transfer on `endpoint` with `data`.
    ///
    /// For an isochronous transfer `data` becomes its first packet.
    pub fn complete(&self, endpoint: u8, data: &[u8]) -> bool {
        self.complete_iso_with(endpoint, &[(TransferStatus::Completed, data)])
    }

    /// Complete the oldest isochronous transfer on `endpoint`, one entry per
    /// packet. Missing packets complete empty.
    pub fn complete_iso(&self, endpoint: u8, packets: &[&[u8]]) -> bool {
        let packets: Vec<_> = packets
            .iter()
            .map(|data| (TransferStatus::Completed, *data))
            .collect();
        self.complete_iso_with(endpoint, &packets)
    }

    pub fn complete_iso_with(&self, endpoint: u8, packets: &[(TransferStatus, &[u8])]) -> bool {
        let mut state = self.state();
        let Some(mut pending) = Self::take_pending(&mut state, endpoint) else {
            return false;
        };
        match pending.transfer.kind {
            TransferKind::Isochronous {
                packet_count,
                packet_len,
            } => {
                let mut iso = Vec::with_capacity(packet_count);
                for i in 0..packet_count {
                    let (status, data) = packets
                        .get(i)
                        .copied()
                        .unwrap_or((TransferStatus::Completed, &[][..]));
                    let n = data.len().min(packet_len);
                    let start = i * packet_len;
                    pending.transfer.buffer[start..start + n].copy_from_slice(&data[..n]);
                    iso.push(IsoPacket {
                        status,
                        actual_length: n,
                    });
                }
                Self::finish(&mut state, pending, TransferStatus::Completed, 0, iso);
            }
            TransferKind::Bulk | TransferKind::Interrupt => {
                let data = packets.first().map(|(_, d)| *d).unwrap_or(&[]);
                let n = data.len().min(pending.transfer.buffer.len());
                pending.transfer.buffer[..n].copy_from_slice(&data[..n]);
                Self::finish(&mut state, pending, TransferStatus::Completed, n, Vec::new());
            }
        }
        true
    }

    /// Complete the oldest transfer on `endpoint` with `status` and no data.
    pub fn complete_with_status(&self, endpoint: u8, status: TransferStatus) -> bool {
        let mut state = self.state();
        let Some(pending) = Self::take_pending(&mut state, endpoint) else {
            return false;
        };
        Self::finish(&mut state, pending, status, 0, Vec::new());
        true
    }

    /// Fail every parked transfer with `NoDevice`.
    pub fn disconnect(&self) {
        let mut state = self.state();
        while let Some(pending) = state.pending.pop_front() {
            Self::finish(&mut state, pending, TransferStatus::NoDevice, 0, Vec::new());
        }
    }

    /// Deliver queued completions. Returns how many handlers ran.
    pub fn dispatch(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state().ready.pop_front();
            let Some((done, handler)) = next else {
                return delivered;
            };
            handler(done);
            delivered += 1;
        }
    }

    fn check_control(&self, state: &HandleState, request: u8, value: u16) -> Result<()> {
        match state.control_errors.get(&(request, value)) {
            Some(&error) => Err(error),
            None => Ok(()),
        }
    }
}

impl UsbHandle for MockHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state();
        state.control_log.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: vec![0; buf.len()],
        });
        self.check_control(&state, request, value)?;

        let scripted = state.responses.get(&(request, value, index)).cloned();
        let echoed = (request == RequestCode::GetCur as u8)
            .then(|| state.current.get(&(value, index)).cloned())
            .flatten();
        let data = scripted.or(echoed).unwrap_or_else(|| vec![0; buf.len()]);

        let mut n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if state.short_controls.contains(&(request, value)) {
            n = n.saturating_sub(1);
        }
        Ok(n)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state();
        state.control_log.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: buf.to_vec(),
        });
        self.check_control(&state, request, value)?;
        if request == RequestCode::SetCur as u8 {
            state.current.insert((value, index), buf.to_vec());
        }
        if state.short_controls.contains(&(request, value)) {
            return Ok(buf.len().saturating_sub(1));
        }
        Ok(buf.len())
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.state();
        if let Some(error) = state.claim_error {
            return Err(error);
        }
        state.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.state();
        state.claimed.remove(&interface);
        state.released.push(interface);
        Ok(())
    }

    fn set_alternate_setting(&self, interface: u8, setting: u8) -> Result<()> {
        self.state().alt_settings.insert(interface, setting);
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<()> {
        self.state().cleared_halts.push(endpoint);
        Ok(())
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String> {
        self.state()
            .strings
            .get(&index)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn submit(&self, transfer: Transfer, handler: CompletionHandler) -> Result<()> {
        let mut state = self.state();
        if state.submit_limit.is_some_and(|limit| state.submissions >= limit) {
            return Err(Error::Io);
        }
        state.submissions += 1;
        state.pending.push_back(Pending { transfer, handler });
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<()> {
        let mut state = self.state();
        let pos = state
            .pending
            .iter()
            .position(|p| p.transfer.id == id)
            .ok_or(Error::NotFound)?;
        if let Some(pending) = state.pending.remove(pos) {
            Self::finish(&mut state, pending, TransferStatus::Cancelled, 0, Vec::new());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transfer(endpoint: u8, kind: TransferKind, len: usize) -> Transfer {
        Transfer {
            id: crate::usb::next_transfer_id(),
            endpoint,
            kind,
            buffer: vec![0; len],
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_get_cur_echoes_set_cur() {
        let handle = MockHandle::default();
        handle
            .write_control(0x21, 0x01, 0x0100, 1, &[1, 2, 3], Duration::ZERO)
            .unwrap();
        let mut buf = [0u8; 3];
        let n = handle
            .read_control(0xa1, 0x81, 0x0100, 1, &mut buf, Duration::ZERO)
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_completions_wait_for_dispatch() {
        let handle = MockHandle::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler: CompletionHandler = Arc::new(move |done: CompletedTransfer| {
            assert_eq!(done.data(), &[9, 9]);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle
            .submit(transfer(0x81, TransferKind::Bulk, 8), handler)
            .unwrap();
        assert!(handle.complete(0x81, &[9, 9]));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(handle.dispatch(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!handle.complete(0x81, &[]));
    }

    #[test]
    fn test_cancel_unknown_transfer() {
        let handle = MockHandle::default();
        assert_eq!(handle.cancel(12345), Err(Error::NotFound));
    }
}
