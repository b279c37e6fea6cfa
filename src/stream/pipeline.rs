//! Streaming transfer pool.
//!
//! A fixed number of transfers is kept in flight on the streaming endpoint.
//! Each completion is fed to the reassembler and resubmitted; terminal
//! statuses leave the slot reclaimed so [`Pipeline::cancel_and_wait`] can
//! tell when the transport has handed every buffer back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::control::ControlGateway;
use crate::error::{Error, Result};
use crate::negotiate::StreamCtrl;
use crate::types::MAX_ISO_PACKETS;
use crate::usb::{
    CompletedTransfer, CompletionHandler, InterfaceInfo, Transfer, TransferKind, TransferStatus,
    UsbHandle,
};

use super::reassembly::{PayloadOutcome, TransportMode};
use super::{Slot, StreamShared, StreamState};

/// How a stream moves its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferPlan {
    pub mode: TransportMode,
    pub endpoint: u8,
    /// Alternate setting to select before submitting, isochronous only.
    pub alt_setting: Option<u8>,
    pub kind: TransferKind,
    pub buffer_len: usize,
}

/// Work out transfer shape for a committed stream.
///
/// An interface with more than one alternate setting streams isochronously
/// from the smallest setting whose packets carry `max_payload_transfer_size ×
/// bandwidth_factor` bytes; otherwise it streams in bulk.
pub(crate) fn plan_transfers(
    interface: &InterfaceInfo,
    endpoint: u8,
    ctrl: &StreamCtrl,
    bandwidth_factor: f32,
) -> Result<TransferPlan> {
    if interface.alt_settings.len() <= 1 {
        let ep = interface
            .alt_settings
            .first()
            .and_then(|alt| alt.endpoints.iter().find(|ep| ep.address == endpoint))
            .ok_or(Error::InvalidMode)?;
        let buffer_len = match ctrl.max_payload_transfer_size as usize {
            0 => ep.max_packet_size as usize,
            n => n,
        };
        return Ok(TransferPlan {
            mode: TransportMode::Bulk,
            endpoint,
            alt_setting: None,
            kind: TransferKind::Bulk,
            buffer_len,
        });
    }

    let required =
        (ctrl.max_payload_transfer_size as f64 * f64::from(bandwidth_factor)).ceil() as usize;
    let candidates: Vec<(u8, usize)> = interface
        .alt_settings
        .iter()
        .filter_map(|alt| {
            let ep = alt.endpoints.iter().find(|ep| ep.address == endpoint)?;
            let packet = ep.bytes_per_packet();
            (packet > 0).then_some((alt.setting, packet))
        })
        .collect();

    let &(setting, packet_len) = candidates
        .iter()
        .find(|(_, packet)| *packet >= required)
        .or(candidates.last())
        .ok_or(Error::InvalidMode)?;

    let frame_size = ctrl.max_video_frame_size as usize;
    let packet_count = ((frame_size + packet_len - 1) / packet_len).clamp(1, MAX_ISO_PACKETS);

    Ok(TransferPlan {
        mode: TransportMode::Isochronous,
        endpoint,
        alt_setting: Some(setting),
        kind: TransferKind::Isochronous {
            packet_count,
            packet_len,
        },
        buffer_len: packet_count * packet_len,
    })
}

pub(crate) struct Pipeline {
    shared: Arc<StreamShared>,
    usb: Arc<dyn UsbHandle>,
    plan: TransferPlan,
    interface_number: u8,
    timeout: Duration,
    handler: CompletionHandler,
}

impl Pipeline {
    pub fn new(
        shared: Arc<StreamShared>,
        usb: Arc<dyn UsbHandle>,
        plan: TransferPlan,
        interface_number: u8,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Pipeline>| {
            let weak = weak.clone();
            let handler: CompletionHandler = Arc::new(move |done: CompletedTransfer| {
                match weak.upgrade() {
                    Some(pipeline) => pipeline.on_complete(done),
                    None => debug!("completion for a torn down stream: {:?}", done.status),
                }
            });
            Pipeline {
                shared,
                usb,
                plan,
                interface_number,
                timeout,
                handler,
            }
        })
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Fill every slot. Only a failure of the first submission is an error;
    /// later failures leave their slot reclaimed.
    pub fn submit_all(&self) -> Result<()> {
        let mut state = self.shared.lock();
        for index in 0..state.slots.len() {
            let transfer = Transfer {
                id: crate::usb::next_transfer_id(),
                endpoint: self.plan.endpoint,
                kind: self.plan.kind,
                buffer: vec![0; self.plan.buffer_len],
                timeout: self.timeout,
            };
            let id = transfer.id;
            match self.usb.submit(transfer, Arc::clone(&self.handler)) {
                Ok(()) => state.slots[index] = Slot::InFlight(id),
                Err(e) if index == 0 => return Err(e),
                Err(e) => {
                    warn!("submitting stream transfer {index} failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Mark the stream stopped, cancel every in-flight transfer and block
    /// until the transport has reported each of them back.
    pub fn cancel_and_wait(&self) {
        let in_flight: Vec<_> = {
            let mut state = self.shared.lock();
            state.running = false;
            state.slots.iter().filter_map(Slot::transfer_id).collect()
        };

        for id in in_flight {
            match self.usb.cancel(id) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => {
                    warn!("cancelling transfer {id} failed: {e}");
                    let mut state = self.shared.lock();
                    if let Some(slot) = state.slot_mut(id) {
                        *slot = Slot::Reclaimed;
                    }
                }
            }
        }

        let state = self.shared.lock();
        let _state = self
            .shared
            .wait_while(state, |state| state.slots.iter().any(Slot::is_in_flight));
        self.shared.cond.notify_all();
    }

    fn on_complete(&self, done: CompletedTransfer) {
        let mut outcome = PayloadOutcome::default();
        let mut state = self.shared.lock();
        let Some(index) = state.slot_index(done.id) else {
            debug!("completion for unknown transfer {}", done.id);
            return;
        };

        let resubmit = match done.status {
            TransferStatus::Completed => {
                outcome = self.process(&mut state, &done);
                true
            }
            TransferStatus::TimedOut | TransferStatus::Stall | TransferStatus::Overflow => {
                debug!("retrying stream transfer after {:?}", done.status);
                true
            }
            TransferStatus::NoDevice => {
                warn!("device disconnected while streaming");
                state.running = false;
                false
            }
            TransferStatus::Cancelled | TransferStatus::Error => {
                debug!("stream transfer ended: {:?}", done.status);
                false
            }
        };

        state.slots[index] = Slot::Reclaimed;
        if resubmit && state.running {
            let id = done.id;
            match self.usb.submit(done.into_transfer(), Arc::clone(&self.handler)) {
                Ok(()) => state.slots[index] = Slot::InFlight(id),
                Err(e) => warn!("resubmitting stream transfer failed: {e}"),
            }
        }
        let wake = outcome.published || !state.slots[index].is_in_flight();
        drop(state);
        if wake {
            self.shared.cond.notify_all();
        }

        if outcome.device_error {
            self.recover_from_device_error();
        }
    }

    fn process(&self, state: &mut StreamState, done: &CompletedTransfer) -> PayloadOutcome {
        let mut outcome = PayloadOutcome::default();
        let mut feed = |payload: &[u8]| {
            let step = state.frames.process_payload(payload, self.plan.mode);
            outcome.published |= step.published;
            outcome.device_error |= step.device_error;
        };

        match done.kind {
            TransferKind::Isochronous { .. } => {
                for (index, packet) in done.iso_packets.iter().enumerate() {
                    if packet.status != TransferStatus::Completed {
                        debug!("bad isochronous packet {index}: {:?}", packet.status);
                        continue;
                    }
                    feed(done.iso_packet_data(index));
                }
            }
            TransferKind::Bulk | TransferKind::Interrupt => feed(done.data()),
        }
        outcome
    }

    fn recover_from_device_error(&self) {
        if let Err(e) = self.usb.clear_halt(self.plan.endpoint) {
            debug!("clearing halt on {:#04x} failed: {e}", self.plan.endpoint);
        }
        match ControlGateway::new(&*self.usb).stream_error_code(self.interface_number) {
            Ok(code) => debug!("stream error code: {code:?}"),
            Err(e) => debug!("reading stream error code failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::{AltSetting, EndpointInfo, EndpointKind};

    fn iso_interface(sizes: &[u16]) -> InterfaceInfo {
        let mut alt_settings = vec![AltSetting::default()];
        for (i, &size) in sizes.iter().enumerate() {
            alt_settings.push(AltSetting {
                setting: i as u8 + 1,
                endpoints: vec![EndpointInfo {
                    address: 0x81,
                    kind: EndpointKind::Isochronous,
                    max_packet_size: size,
                    extra: Vec::new(),
                }],
                ..Default::default()
            });
        }
        InterfaceInfo {
            number: 1,
            alt_settings,
        }
    }

    fn ctrl(payload: u32, frame: u32) -> StreamCtrl {
        StreamCtrl {
            max_payload_transfer_size: payload,
            max_video_frame_size: frame,
            ..Default::default()
        }
    }

    #[test]
    fn test_iso_picks_smallest_sufficient_alt() {
        let interface = iso_interface(&[128, 512, 1024, 0x1400]);
        let plan = plan_transfers(&interface, 0x81, &ctrl(800, 614_400), 1.0).unwrap();
        assert_eq!(plan.mode, TransportMode::Isochronous);
        assert_eq!(plan.alt_setting, Some(3));
        assert_eq!(
            plan.kind,
            TransferKind::Isochronous {
                packet_count: 32,
                packet_len: 1024
            }
        );
        assert_eq!(plan.buffer_len, 32 * 1024);
    }

    #[test]
    fn test_iso_bandwidth_factor_scales_requirement() {
        let interface = iso_interface(&[128, 512, 1024]);
        let plan = plan_transfers(&interface, 0x81, &ctrl(800, 614_400), 0.5).unwrap();
        assert_eq!(plan.alt_setting, Some(2));
    }

    #[test]
    fn test_iso_falls_back_to_last_alt() {
        let interface = iso_interface(&[128, 512]);
        let plan = plan_transfers(&interface, 0x81, &ctrl(3000, 614_400), 1.0).unwrap();
        assert_eq!(plan.alt_setting, Some(2));
    }

    #[test]
    fn test_iso_packet_count_rounds_up() {
        // high-bandwidth endpoint: 0x1400 is 1024 bytes × 3 transactions
        let interface = iso_interface(&[0x1400]);
        let plan = plan_transfers(&interface, 0x81, &ctrl(3072, 6145), 1.0).unwrap();
        assert_eq!(
            plan.kind,
            TransferKind::Isochronous {
                packet_count: 3,
                packet_len: 3072
            }
        );
    }

    #[test]
    fn test_bulk_uses_payload_size() {
        let interface = InterfaceInfo {
            number: 1,
            alt_settings: vec![AltSetting {
                endpoints: vec![EndpointInfo {
                    address: 0x82,
                    kind: EndpointKind::Bulk,
                    max_packet_size: 512,
                    extra: Vec::new(),
                }],
                ..Default::default()
            }],
        };
        let plan = plan_transfers(&interface, 0x82, &ctrl(16_384, 614_400), 1.0).unwrap();
        assert_eq!(plan.mode, TransportMode::Bulk);
        assert_eq!(plan.alt_setting, None);
        assert_eq!(plan.buffer_len, 16_384);

        let plan = plan_transfers(&interface, 0x82, &ctrl(0, 614_400), 1.0).unwrap();
        assert_eq!(plan.buffer_len, 512);

        assert_eq!(
            plan_transfers(&interface, 0x81, &ctrl(0, 0), 1.0),
            Err(Error::InvalidMode)
        );
    }
}
