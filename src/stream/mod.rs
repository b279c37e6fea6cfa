//! Stream handles: start, stop and frame delivery.
//!
//! A [`StreamHandle`] owns one committed streaming interface. Starting it
//! selects the alternate setting, submits the transfer pool and, in callback
//! mode, spawns a delivery thread. Frames are published by swapping the
//! reassembler's working buffer with the held buffer under the stream mutex;
//! both the delivery thread and [`StreamHandle::get_frame`] copy the held
//! frame out under the same mutex, so a frame is never observed mid-write.
//!
//! # Threading
//!
//! Payloads are processed on the context's event thread. The frame callback
//! runs on a dedicated thread per stream, outside the stream mutex. Calling
//! [`StreamHandle::stop`] from inside the callback deadlocks.
//!
//! # Disconnect
//!
//! When the device goes away the stream stops by itself: pending
//! [`get_frame`](StreamHandle::get_frame) calls return, the delivery thread
//! exits, and the next poll fails with [`Error::InvalidParam`].

mod pipeline;
mod reassembly;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::device::HandleInner;
use crate::error::{Error, Result};
use crate::negotiate::{commit_stream_ctrl, StreamCtrl};
use crate::types::{Frame, FrameFormat, PollTimeout, StreamConfig};
use crate::usb::TransferId;

use self::pipeline::{plan_transfers, Pipeline};
use self::reassembly::Reassembler;

// =============================================================================
// Shared state
// =============================================================================

/// One entry of the transfer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// The transport has handed the buffer back (or never had it).
    Reclaimed,
    InFlight(TransferId),
}

impl Slot {
    pub fn transfer_id(&self) -> Option<TransferId> {
        match *self {
            Slot::InFlight(id) => Some(id),
            Slot::Reclaimed => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Slot::InFlight(_))
    }
}

/// Frame shape of the running stream, copied into every delivered frame.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub step: usize,
}

pub(crate) struct StreamState {
    pub running: bool,
    pub slots: Vec<Slot>,
    pub frames: Reassembler,
    pub geometry: Geometry,
}

impl StreamState {
    pub fn slot_index(&self, id: TransferId) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Slot::InFlight(id))
    }

    pub fn slot_mut(&mut self, id: TransferId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|slot| **slot == Slot::InFlight(id))
    }

    /// Sequence number of the held frame, 0 before the first publication.
    pub fn held_sequence(&self) -> u32 {
        self.frames.held().sequence
    }

    /// Copy the held frame into `frame`, reusing its allocation.
    pub fn populate(&self, frame: &mut Frame) {
        let held = self.frames.held();
        frame.data.clear();
        frame.data.extend_from_slice(held.bytes());
        frame.data_bytes = frame.data.len();
        frame.width = self.geometry.width;
        frame.height = self.geometry.height;
        frame.format = self.geometry.format;
        frame.step = self.geometry.step;
        frame.sequence = held.sequence;
        frame.capture_time = held.captured;
        frame.pts = held.pts;
        frame.scr = held.scr;
        frame.complete = held.complete;
        frame.error = held.error;
    }
}

/// Stream state plus the condition variable signalled on publication and
/// slot reclamation.
pub(crate) struct StreamShared {
    state: Mutex<StreamState>,
    pub cond: Condvar,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState {
                running: false,
                slots: Vec::new(),
                frames: Reassembler::new(0, Default::default(), false),
                geometry: Geometry::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_while<'a, F>(
        &self,
        guard: MutexGuard<'a, StreamState>,
        condition: F,
    ) -> MutexGuard<'a, StreamState>
    where
        F: FnMut(&mut StreamState) -> bool,
    {
        self.cond
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Stream handle
// =============================================================================

/// An open stream on one streaming interface.
///
/// Created by [`DeviceHandle::open_stream`](crate::DeviceHandle::open_stream).
/// Dropping the handle stops the stream and releases its interface.
pub struct StreamHandle {
    device: Arc<HandleInner>,
    ctrl: StreamCtrl,
    config: StreamConfig,
    shared: Arc<StreamShared>,
    pipeline: Option<Arc<Pipeline>>,
    callback_thread: Option<JoinHandle<()>>,
    frame: Frame,
    last_polled_seq: u32,
}

impl StreamHandle {
    pub(crate) fn new(device: Arc<HandleInner>, ctrl: StreamCtrl, config: StreamConfig) -> Self {
        Self {
            device,
            ctrl,
            config,
            shared: Arc::new(StreamShared::new()),
            pipeline: None,
            callback_thread: None,
            frame: Frame::default(),
            last_polled_seq: 0,
        }
    }

    /// The committed stream control block.
    pub fn ctrl(&self) -> &StreamCtrl {
        &self.ctrl
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn interface_number(&self) -> u8 {
        self.ctrl.interface_number
    }

    /// Whether transfers are being submitted.
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Commit a new control block. The stream must be stopped.
    pub fn set_ctrl(&mut self, ctrl: &StreamCtrl) -> Result<()> {
        if ctrl.interface_number != self.ctrl.interface_number {
            return Err(Error::InvalidParam);
        }
        if self.is_running() {
            return Err(Error::Busy);
        }
        commit_stream_ctrl(&self.device.gateway(), &self.device.info, ctrl)?;
        self.ctrl = *ctrl;
        Ok(())
    }

    /// Start streaming and deliver each frame to `callback` on a dedicated
    /// thread.
    ///
    /// The callback must not call back into this stream; see the module
    /// docs.
    pub fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.start_inner(Some(Box::new(callback)))
    }

    /// Start streaming; frames are fetched with [`get_frame`](Self::get_frame).
    pub fn start_polling(&mut self) -> Result<()> {
        self.start_inner(None)
    }

    fn start_inner(&mut self, callback: Option<Box<dyn FnMut(&Frame) + Send>>) -> Result<()> {
        if self.is_running() {
            return Err(Error::Busy);
        }
        if self.pipeline.is_some() {
            // stopped by a disconnect but never cleaned up
            self.stop()?;
        }
        self.config.validate()?;

        let device = Arc::clone(&self.device);
        let iface = self.ctrl.interface_number;
        let (format, frame) = device
            .info
            .find_frame(iface, self.ctrl.format_index, self.ctrl.frame_index)
            .ok_or(Error::InvalidParam)?;
        let frame_format = format.frame_format();
        if frame_format == FrameFormat::Unknown {
            return Err(Error::NotSupported);
        }
        let streaming = device
            .info
            .streaming_interface(iface)
            .ok_or(Error::InvalidParam)?;
        let interface = device.config.interface(iface).ok_or(Error::InvalidDevice)?;
        let plan = plan_transfers(
            interface,
            streaming.endpoint_address,
            &self.ctrl,
            self.config.bandwidth_factor,
        )?;

        let capacity = match self.ctrl.max_video_frame_size {
            0 => frame.max_video_frame_buffer_size as usize,
            n => n as usize,
        };
        let width = u32::from(frame.width);
        {
            let mut state = self.shared.lock();
            state.frames =
                Reassembler::new(capacity, self.config.incomplete_frames, device.isight);
            state.geometry = Geometry {
                width,
                height: u32::from(frame.height),
                format: frame_format,
                step: frame_format.step(width),
            };
            state.slots = vec![Slot::Reclaimed; self.config.transfer_buffers];
            state.running = true;
        }
        self.last_polled_seq = 0;

        if let Some(alt) = plan.alt_setting {
            if let Err(e) = device.usb.set_alternate_setting(iface, alt) {
                self.shared.lock().running = false;
                return Err(e);
            }
        }

        debug!(
            "starting {frame_format} {}x{} on interface {iface}: {:?}",
            frame.width, frame.height, plan
        );
        let pipeline = Pipeline::new(
            Arc::clone(&self.shared),
            Arc::clone(&device.usb),
            plan,
            iface,
            self.config.transfer_timeout,
        );
        self.pipeline = Some(Arc::clone(&pipeline));
        if let Err(e) = pipeline.submit_all() {
            warn!("starting stream on interface {iface} failed: {e}");
            self.teardown();
            return Err(e);
        }

        if let Some(callback) = callback {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("uvc-frames-{iface}"))
                .spawn(move || run_callback(shared, callback));
            match spawned {
                Ok(thread) => self.callback_thread = Some(thread),
                Err(e) => {
                    warn!("spawning frame callback thread failed: {e}");
                    self.teardown();
                    return Err(Error::NoMem);
                }
            }
        }
        Ok(())
    }

    /// Stop streaming.
    ///
    /// Cancels every transfer and blocks until the transport has reported
    /// each one back, then joins the delivery thread. Needs the context's
    /// events to be handled meanwhile, which an owning context does on its
    /// own.
    pub fn stop(&mut self) -> Result<()> {
        if self.pipeline.is_none() {
            return Err(Error::InvalidParam);
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        pipeline.cancel_and_wait();

        if let Some(thread) = self.callback_thread.take() {
            if thread.join().is_err() {
                warn!("frame callback panicked");
            }
        }

        if pipeline.plan().alt_setting.is_some() {
            let iface = self.ctrl.interface_number;
            if let Err(e) = self.device.usb.set_alternate_setting(iface, 0) {
                debug!("resetting alternate setting of interface {iface} failed: {e}");
            }
        }
    }

    /// Wait for the next frame in polling mode.
    ///
    /// Returns immediately when a frame newer than the last polled one is
    /// held. Otherwise waits per `timeout`: [`PollTimeout::NoWait`] yields
    /// `Ok(None)`, an expired [`PollTimeout::Within`] fails with
    /// [`Error::Timeout`], and a stream stopping meanwhile yields `Ok(None)`.
    pub fn get_frame(&mut self, timeout: impl Into<PollTimeout>) -> Result<Option<&Frame>> {
        let mut frame = std::mem::take(&mut self.frame);
        let got = self.poll_into(&mut frame, timeout.into());
        self.frame = frame;
        Ok(got?.then_some(&self.frame))
    }

    /// Like [`get_frame`](Self::get_frame) but fills a caller-owned frame.
    /// Returns whether a frame was written.
    pub fn get_frame_into(
        &mut self,
        frame: &mut Frame,
        timeout: impl Into<PollTimeout>,
    ) -> Result<bool> {
        self.poll_into(frame, timeout.into())
    }

    fn poll_into(&mut self, frame: &mut Frame, timeout: PollTimeout) -> Result<bool> {
        let last = self.last_polled_seq;
        let fresh = move |state: &StreamState| {
            let seq = state.held_sequence();
            seq != 0 && seq != last
        };

        let mut state = self.shared.lock();
        if !state.running {
            return Err(Error::InvalidParam);
        }
        if self.callback_thread.is_some() {
            return Err(Error::CallbackExists);
        }

        if !fresh(&*state) {
            state = match timeout {
                PollTimeout::NoWait => return Ok(false),
                PollTimeout::Forever => self
                    .shared
                    .wait_while(state, |state| state.running && !fresh(&*state)),
                PollTimeout::Within(duration) => {
                    let (state, result) = self
                        .shared
                        .cond
                        .wait_timeout_while(state, duration, |state| {
                            state.running && !fresh(&*state)
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() {
                        return Err(Error::Timeout);
                    }
                    state
                }
            };
        }

        if !fresh(&*state) {
            return Ok(false);
        }
        self.last_polled_seq = state.held_sequence();
        state.populate(frame);
        Ok(true)
    }

    /// Stop if needed and release the streaming interface.
    pub fn close(self) {}
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.teardown();
        self.device.release_interface(self.ctrl.interface_number);
        self.device.forget_stream(self.ctrl.interface_number);
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("interface", &self.ctrl.interface_number)
            .field("format_index", &self.ctrl.format_index)
            .field("frame_index", &self.ctrl.frame_index)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Body of the delivery thread.
fn run_callback(shared: Arc<StreamShared>, mut callback: Box<dyn FnMut(&Frame) + Send>) {
    let mut frame = Frame::default();
    let mut last_seq = 0;
    loop {
        let state = shared.lock();
        let state = shared.wait_while(state, |state| {
            state.running && state.held_sequence() == last_seq
        });
        if !state.running {
            break;
        }
        last_seq = state.held_sequence();
        state.populate(&mut frame);
        drop(state);

        callback(&frame);
    }
    debug!("frame callback thread exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::mock::descriptors::{CameraLayout, STREAM_ENDPOINT};
    use crate::mock::{open_mock_camera, open_mock_camera_with};
    use crate::usb::TransferStatus;

    fn yuyv_ctrl() -> StreamCtrl {
        StreamCtrl {
            interface_number: 1,
            format_index: 1,
            frame_index: 1,
            frame_interval: 333_333,
            max_video_frame_size: 614_400,
            max_payload_transfer_size: 1000,
            ..Default::default()
        }
    }

    fn payload(info: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![2, info];
        out.extend_from_slice(data);
        out
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_selects_alt_and_fills_pool() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();

        let mock = device.handle();
        assert_eq!(mock.alt_setting(1), Some(3));
        assert_eq!(mock.pending(STREAM_ENDPOINT), 4);
        assert!(stream.is_running());
        assert_eq!(stream.start_polling(), Err(Error::Busy));

        stream.stop().unwrap();
        assert_eq!(mock.pending(STREAM_ENDPOINT), 0);
        assert_eq!(mock.alt_setting(1), Some(0));
        assert!(!stream.is_running());
        assert_eq!(stream.stop(), Err(Error::InvalidParam));
    }

    #[test]
    fn test_polling_receives_frames_in_order() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();
        let mock = device.handle();

        assert!(mock.complete_iso(STREAM_ENDPOINT, &[&payload(0, &[1, 2]), &payload(0x02, &[3])]));
        let frame = stream
            .get_frame(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(frame.bytes(), &[1, 2, 3]);
        assert_eq!(frame.sequence, 1);
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.format, FrameFormat::Yuyv);
        assert_eq!(frame.step, 1280);
        assert!(frame.complete);

        // the same frame is not returned twice
        assert!(stream.get_frame(PollTimeout::NoWait).unwrap().is_none());

        assert!(mock.complete_iso(STREAM_ENDPOINT, &[&payload(0x03, &[4])]));
        let mut mine = Frame::default();
        assert!(stream
            .get_frame_into(&mut mine, PollTimeout::Forever)
            .unwrap());
        assert_eq!(mine.sequence, 2);
        assert_eq!(mine.bytes(), &[4]);
    }

    #[test]
    fn test_poll_timeout_and_state_errors() {
        let (_ctx, _device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        assert_eq!(
            stream.get_frame(PollTimeout::NoWait).err(),
            Some(Error::InvalidParam)
        );

        stream.start_polling().unwrap();
        assert_eq!(
            stream.get_frame(Duration::from_millis(10)).err(),
            Some(Error::Timeout)
        );
        assert!(stream.get_frame(-1).unwrap().is_none());
    }

    #[test]
    fn test_callback_mode() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        let (tx, rx) = mpsc::channel();
        stream
            .start(move |frame: &Frame| {
                let _ = tx.send((frame.sequence, frame.bytes().to_vec()));
            })
            .unwrap();
        assert_eq!(
            stream.get_frame(PollTimeout::NoWait).err(),
            Some(Error::CallbackExists)
        );

        let mock = device.handle();
        mock.complete_iso(STREAM_ENDPOINT, &[&payload(0x02, &[7])]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (1, vec![7]));
        mock.complete_iso(STREAM_ENDPOINT, &[&payload(0x03, &[8, 9])]);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (2, vec![8, 9])
        );

        stream.stop().unwrap();
        // polling is allowed again once the callback is gone
        stream.start_polling().unwrap();
        assert!(stream.get_frame(PollTimeout::NoWait).unwrap().is_none());
    }

    #[test]
    fn test_bulk_stream() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::bulk()).unwrap();
        let ctrl = StreamCtrl {
            max_payload_transfer_size: 4096,
            ..yuyv_ctrl()
        };
        let mut stream = handle.open_stream(&ctrl).unwrap();
        stream.start_polling().unwrap();
        let mock = device.handle();
        assert_eq!(mock.alt_setting(1), None);
        assert_eq!(
            mock.pending_shape(STREAM_ENDPOINT),
            Some((4096, crate::usb::TransferKind::Bulk))
        );

        mock.complete(STREAM_ENDPOINT, &payload(0, &[1]));
        mock.complete(STREAM_ENDPOINT, &payload(0x02, &[]));
        let frame = stream.get_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(frame.bytes(), &[1]);
    }

    #[test]
    fn test_bulk_frame_split_across_transfers() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::bulk()).unwrap();
        let ctrl = StreamCtrl {
            max_payload_transfer_size: 4096,
            ..yuyv_ctrl()
        };
        let mut stream = handle.open_stream(&ctrl).unwrap();
        stream.start_polling().unwrap();
        let mock = device.handle();

        // image bytes that look like a header are not parsed as one
        mock.complete(STREAM_ENDPOINT, &payload(0, &[1, 2, 0x02, 0x8e]));
        // an idle bulk read timing out keeps the partial frame
        mock.complete_with_status(STREAM_ENDPOINT, TransferStatus::TimedOut);
        mock.complete(STREAM_ENDPOINT, &payload(0x02, &[5]));

        let frame = stream.get_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(frame.bytes(), &[1, 2, 0x02, 0x8e, 5]);
        assert_eq!(frame.sequence, 1);
        assert!(frame.complete);
        wait_until(|| mock.pending(STREAM_ENDPOINT) == 4);
    }

    #[test]
    fn test_transient_errors_are_resubmitted() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();
        let mock = device.handle();

        mock.complete_with_status(STREAM_ENDPOINT, TransferStatus::Stall);
        mock.complete_with_status(STREAM_ENDPOINT, TransferStatus::TimedOut);
        wait_until(|| mock.pending(STREAM_ENDPOINT) == 4);

        mock.complete_with_status(STREAM_ENDPOINT, TransferStatus::Error);
        wait_until(|| mock.pending(STREAM_ENDPOINT) == 3);
        assert!(stream.is_running());
    }

    #[test]
    fn test_disconnect_stops_stream() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();

        let waiter = {
            let mock = Arc::clone(device.handle());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mock.disconnect();
            })
        };
        // a blocked poll returns when the stream stops underneath it
        assert!(stream.get_frame(PollTimeout::Forever).unwrap().is_none());
        waiter.join().unwrap();

        assert!(!stream.is_running());
        assert_eq!(
            stream.get_frame(PollTimeout::NoWait).err(),
            Some(Error::InvalidParam)
        );
        stream.stop().unwrap();
    }

    #[test]
    fn test_device_error_bit_clears_halt() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();
        let mock = device.handle();

        mock.complete_iso(STREAM_ENDPOINT, &[&payload(0x40 | 0x02, &[5])]);
        let frame = stream.get_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(frame.bytes(), &[5]);
        wait_until(|| mock.cleared_halts() == vec![STREAM_ENDPOINT]);
    }

    #[test]
    fn test_bad_iso_packets_are_skipped() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();

        device.handle().complete_iso_with(
            STREAM_ENDPOINT,
            &[
                (TransferStatus::Completed, &payload(0, &[1])[..]),
                (TransferStatus::Error, &payload(0, &[2])[..]),
                (TransferStatus::Completed, &payload(0x02, &[3])[..]),
            ],
        );
        let frame = stream.get_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(frame.bytes(), &[1, 3]);
    }

    #[test]
    fn test_set_ctrl_rules() {
        let (_ctx, _device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();

        let other = StreamCtrl {
            interface_number: 2,
            ..yuyv_ctrl()
        };
        assert_eq!(stream.set_ctrl(&other), Err(Error::InvalidParam));

        let slower = StreamCtrl {
            frame_interval: 666_666,
            ..yuyv_ctrl()
        };
        stream.set_ctrl(&slower).unwrap();
        assert_eq!(stream.ctrl().frame_interval, 666_666);

        stream.start_polling().unwrap();
        assert_eq!(stream.set_ctrl(&slower), Err(Error::Busy));
    }

    #[test]
    fn test_start_rejects_unknown_frame() {
        let (_ctx, _device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let ctrl = StreamCtrl {
            frame_index: 9,
            ..yuyv_ctrl()
        };
        let mut stream = handle.open_stream(&ctrl).unwrap();
        assert_eq!(stream.start_polling(), Err(Error::InvalidParam));
        assert!(!stream.is_running());
    }

    #[test]
    fn test_first_submit_failure_fails_start() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        device.handle().limit_submissions(0);
        assert_eq!(stream.start_polling(), Err(Error::Io));
        assert!(!stream.is_running());

        device.handle().limit_submissions(2);
        stream.start_polling().unwrap();
        assert_eq!(device.handle().pending(STREAM_ENDPOINT), 2);
    }

    #[test]
    fn test_stop_waits_for_every_slot() {
        let (ctx, device, handle) =
            open_mock_camera_with(&CameraLayout::default(), false).unwrap();
        let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
        stream.start_polling().unwrap();
        let mock = Arc::clone(device.handle());
        assert_eq!(mock.pending(STREAM_ENDPOINT), 4);

        let (tx, rx) = mpsc::channel();
        let stopper = thread::spawn(move || {
            stream.stop().unwrap();
            tx.send(()).unwrap();
            stream
        });

        // cancellations are queued but nobody delivers them yet
        wait_until(|| mock.pending(STREAM_ENDPOINT) == 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while rx.try_recv().is_err() {
            assert!(Instant::now() < deadline, "stop never returned");
            ctx.handle_events(Duration::from_millis(1)).unwrap();
        }
        let stream = stopper.join().unwrap();
        assert!(!stream.is_running());
    }

    #[test]
    fn test_stop_under_randomized_completions() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mut seed: u64 = 0x2545_f491;
        let mut next = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            seed >> 33
        };

        for _ in 0..16 {
            let mut stream = handle.open_stream(&yuyv_ctrl()).unwrap();
            stream.start_polling().unwrap();

            let mock = Arc::clone(device.handle());
            let delays: Vec<u64> = (0..12).map(|_| next() % 400).collect();
            let completer = thread::spawn(move || {
                for (i, delay) in delays.into_iter().enumerate() {
                    thread::sleep(Duration::from_micros(delay));
                    let info = if i % 3 == 2 { 0x02 } else { 0 };
                    mock.complete_iso(STREAM_ENDPOINT, &[&payload(info, &[i as u8])]);
                }
            });

            thread::sleep(Duration::from_micros(next() % 800));
            stream.stop().unwrap();
            completer.join().unwrap();

            assert_eq!(device.handle().pending(STREAM_ENDPOINT), 0);
            assert!(stream.shared.lock().slots.iter().all(|s| !s.is_in_flight()));
        }
    }
}
