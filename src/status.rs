//! Status interrupt endpoint.
//!
//! Devices report control changes and button presses on the Video Control
//! interface's interrupt endpoint. One transfer is kept in flight while the
//! handle is open. Each report is decoded, handed to the registered
//! callbacks and pushed onto a bounded queue read by
//! [`DeviceHandle::drain_status_events`].
//!
//! Callbacks run on the context's event thread while the handle's callback
//! mutex is held. They must not register or clear callbacks on the same
//! handle, and must not block on other device operations.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};

use crate::descriptor::DeviceInfo;
use crate::device::DeviceHandle;
use crate::error::Result;
use crate::usb::{
    CompletedTransfer, CompletionHandler, Transfer, TransferId, TransferKind, TransferStatus,
    UsbHandle,
};

/// Size of the status transfer buffer.
const STATUS_PACKET_LEN: usize = 32;

/// Events kept for [`DeviceHandle::drain_status_events`]; older ones are
/// dropped first.
const STATUS_QUEUE_LEN: usize = 64;

const ORIGIN_VIDEO_CONTROL: u8 = 0x01;
const ORIGIN_VIDEO_STREAMING: u8 = 0x02;

/// Which kind of entity raised a control status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// The Video Control interface itself.
    Control = 0x10,
    ControlCamera = 0x11,
    ControlProcessing = 0x12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusAttribute {
    ValueChange,
    InfoChange,
    FailureChange,
    Unknown(u8),
}

impl From<u8> for StatusAttribute {
    fn from(value: u8) -> Self {
        match value {
            0x00 => StatusAttribute::ValueChange,
            0x01 => StatusAttribute::InfoChange,
            0x02 => StatusAttribute::FailureChange,
            other => StatusAttribute::Unknown(other),
        }
    }
}

/// A control change reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStatus {
    pub class: StatusClass,
    /// Terminal or unit that raised the report.
    pub entity_id: u8,
    pub selector: u8,
    pub attribute: StatusAttribute,
    /// New value, info bitmap or failure code, depending on `attribute`.
    pub data: Vec<u8>,
}

/// Anything received on the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Control(ControlStatus),
    Button { interface: u8, pressed: bool },
    StreamError { interface: u8, code: u8 },
}

/// Decode one status packet. Reports that are short, come from unknown
/// entities or carry unhandled events yield `None`.
pub fn decode_status(packet: &[u8], info: &DeviceInfo) -> Option<StatusEvent> {
    let origin = packet.first()? & 0x0f;
    match origin {
        ORIGIN_VIDEO_CONTROL => decode_control_status(packet, info),
        ORIGIN_VIDEO_STREAMING => decode_streaming_status(packet),
        other => {
            debug!("status packet from unknown originator type {other:#04x}");
            None
        }
    }
}

fn decode_control_status(packet: &[u8], info: &DeviceInfo) -> Option<StatusEvent> {
    if packet.len() < 5 {
        debug!("short control status packet ({} bytes)", packet.len());
        return None;
    }
    let (entity_id, event, selector) = (packet[1], packet[2], packet[3]);
    if entity_id == 0 {
        debug!("unhandled status from the Video Control interface");
        return None;
    }
    if event != 0 {
        debug!("unhandled Video Control event {event}");
        return None;
    }

    let control = &info.control;
    let class = if control.input_terminals.iter().any(|t| t.id == entity_id) {
        StatusClass::ControlCamera
    } else if control.processing_units.iter().any(|u| u.id == entity_id) {
        StatusClass::ControlProcessing
    } else {
        debug!("status for unknown entity {entity_id}");
        return None;
    };

    Some(StatusEvent::Control(ControlStatus {
        class,
        entity_id,
        selector,
        attribute: StatusAttribute::from(packet[4]),
        data: packet[5..].to_vec(),
    }))
}

fn decode_streaming_status(packet: &[u8]) -> Option<StatusEvent> {
    if packet.len() < 3 {
        debug!("short streaming status packet ({} bytes)", packet.len());
        return None;
    }
    let interface = packet[1];
    if packet[2] != 0 {
        return Some(StatusEvent::StreamError {
            interface,
            code: packet[2],
        });
    }
    if packet.len() < 4 {
        debug!("short button status packet ({} bytes)", packet.len());
        return None;
    }
    Some(StatusEvent::Button {
        interface,
        pressed: packet[3] != 0,
    })
}

// =============================================================================
// Channel
// =============================================================================

type StatusCallback = Box<dyn FnMut(&ControlStatus) + Send>;
type ButtonCallback = Box<dyn FnMut(u8, bool) + Send>;

#[derive(Default)]
struct Callbacks {
    status: Option<StatusCallback>,
    button: Option<ButtonCallback>,
}

#[derive(Default)]
struct TransferState {
    running: bool,
    in_flight: Option<TransferId>,
}

pub(crate) struct StatusChannel {
    info: Arc<DeviceInfo>,
    usb: Arc<dyn UsbHandle>,
    callbacks: Mutex<Callbacks>,
    events: ArrayQueue<StatusEvent>,
    transfer: Mutex<TransferState>,
    handler: CompletionHandler,
}

impl StatusChannel {
    pub fn new(info: Arc<DeviceInfo>, usb: Arc<dyn UsbHandle>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StatusChannel>| {
            let weak = weak.clone();
            let handler: CompletionHandler = Arc::new(move |done: CompletedTransfer| {
                if let Some(channel) = weak.upgrade() {
                    channel.on_complete(done);
                }
            });
            StatusChannel {
                info,
                usb,
                callbacks: Mutex::new(Callbacks::default()),
                events: ArrayQueue::new(STATUS_QUEUE_LEN),
                transfer: Mutex::new(TransferState::default()),
                handler,
            }
        })
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transfer(&self) -> std::sync::MutexGuard<'_, TransferState> {
        self.transfer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit the status transfer on `endpoint`.
    pub fn start(&self, endpoint: u8) -> Result<()> {
        let mut state = self.transfer();
        let transfer = Transfer {
            id: crate::usb::next_transfer_id(),
            endpoint,
            kind: TransferKind::Interrupt,
            buffer: vec![0; STATUS_PACKET_LEN],
            timeout: Duration::ZERO,
        };
        let id = transfer.id;
        self.usb.submit(transfer, Arc::clone(&self.handler))?;
        state.running = true;
        state.in_flight = Some(id);
        Ok(())
    }

    /// Stop resubmitting and cancel the outstanding transfer. The transport
    /// keeps the buffer until it reports the cancellation.
    pub fn stop(&self) {
        let in_flight = {
            let mut state = self.transfer();
            state.running = false;
            state.in_flight
        };
        if let Some(id) = in_flight {
            if let Err(e) = self.usb.cancel(id) {
                trace!("cancelling status transfer: {e}");
            }
        }
    }

    fn on_complete(&self, done: CompletedTransfer) {
        match done.status {
            TransferStatus::Completed => self.dispatch(done.data()),
            TransferStatus::TimedOut | TransferStatus::Stall | TransferStatus::Overflow => {
                debug!("retrying status transfer after {:?}", done.status);
            }
            TransferStatus::Cancelled | TransferStatus::NoDevice | TransferStatus::Error => {
                debug!("status transfer ended: {:?}", done.status);
                self.transfer().in_flight = None;
                return;
            }
        }

        let mut state = self.transfer();
        if !state.running {
            state.in_flight = None;
            return;
        }
        if let Err(e) = self.usb.submit(done.into_transfer(), Arc::clone(&self.handler)) {
            warn!("resubmitting status transfer failed: {e}");
            state.in_flight = None;
        }
    }

    fn dispatch(&self, packet: &[u8]) {
        let Some(event) = decode_status(packet, &self.info) else {
            return;
        };
        trace!("status event: {event:?}");

        {
            let mut callbacks = self.callbacks();
            match &event {
                StatusEvent::Control(status) => {
                    if let Some(callback) = callbacks.status.as_mut() {
                        callback(status);
                    }
                }
                StatusEvent::Button { interface, pressed } => {
                    if let Some(callback) = callbacks.button.as_mut() {
                        callback(*interface, *pressed);
                    }
                }
                StatusEvent::StreamError { interface, code } => {
                    debug!("stream error {code:#04x} on interface {interface}");
                }
            }
        }

        if self.events.force_push(event).is_some() {
            trace!("status queue full, oldest event dropped");
        }
    }
}

impl DeviceHandle {
    /// Call `callback` for every control status report.
    ///
    /// Runs on the event thread; see the module docs for what it may not do.
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: FnMut(&ControlStatus) + Send + 'static,
    {
        self.status().callbacks().status = Some(Box::new(callback));
    }

    pub fn clear_status_callback(&self) {
        self.status().callbacks().status = None;
    }

    /// Call `callback(interface, pressed)` for every still-image button event.
    pub fn set_button_callback<F>(&self, callback: F)
    where
        F: FnMut(u8, bool) + Send + 'static,
    {
        self.status().callbacks().button = Some(Box::new(callback));
    }

    pub fn clear_button_callback(&self) {
        self.status().callbacks().button = None;
    }

    /// Take every queued status event, oldest first.
    pub fn drain_status_events(&self) -> Vec<StatusEvent> {
        std::iter::from_fn(|| self.status().events.pop()).collect()
    }
}
