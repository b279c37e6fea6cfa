//! Stream negotiation.
//!
//! A stream is configured by writing a [`StreamCtrl`] block to the probe
//! control, reading back what the device is willing to do, and finally
//! writing the agreed block to the commit control. The block grows with the
//! UVC release: 26 bytes for 1.0, 34 for 1.1 and 48 for 1.5.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::control::{ControlGateway, RequestCode, VS_COMMIT_CONTROL, VS_PROBE_CONTROL};
use crate::descriptor::{DeviceInfo, FormatDesc, FrameDesc, FrameIntervals, StreamingInterface};
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::types::FrameFormat;

/// Size of the largest (UVC 1.5) stream control block.
pub const MAX_STREAM_CTRL_LEN: usize = 48;

/// Frame intervals are expressed in 100 ns units.
const INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

/// Length of the stream control block for a UVC release.
pub fn stream_ctrl_len(bcd_uvc: u16) -> usize {
    if bcd_uvc >= 0x0150 {
        48
    } else if bcd_uvc >= 0x0110 {
        34
    } else {
        26
    }
}

/// Negotiated streaming parameters (the probe/commit control block).
///
/// A block starts out `Idle` as returned by [`DeviceHandle::stream_ctrl_for`]
/// after a successful probe, and is committed by
/// [`DeviceHandle::open_stream`] or [`StreamHandle::set_ctrl`](crate::StreamHandle::set_ctrl).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamCtrl {
    /// bmHint: which fields the device should keep fixed.
    pub hint: u16,
    /// bFormatIndex.
    pub format_index: u8,
    /// bFrameIndex.
    pub frame_index: u8,
    /// Frame interval in 100 ns units.
    pub frame_interval: u32,
    /// wKeyFrameRate.
    pub key_frame_rate: u16,
    /// wPFrameRate.
    pub p_frame_rate: u16,
    /// wCompQuality.
    pub comp_quality: u16,
    /// wCompWindowSize.
    pub comp_window_size: u16,
    /// wDelay, internal latency in milliseconds.
    pub delay: u16,
    /// dwMaxVideoFrameSize in bytes.
    pub max_video_frame_size: u32,
    /// dwMaxPayloadTransferSize in bytes.
    pub max_payload_transfer_size: u32,
    // UVC 1.1
    /// dwClockFrequency in Hz.
    pub clock_frequency: u32,
    /// bmFramingInfo.
    pub framing_info: u8,
    /// bPreferedVersion.
    pub preferred_version: u8,
    /// bMinVersion.
    pub min_version: u8,
    /// bMaxVersion.
    pub max_version: u8,
    // UVC 1.5
    /// bUsage.
    pub usage: u8,
    /// bBitDepthLuma.
    pub bit_depth_luma: u8,
    /// bmSettings.
    pub settings: u8,
    /// bMaxNumberOfRefFramesPlus1.
    pub max_number_of_ref_frames_plus1: u8,
    /// bmRateControlModes.
    pub rate_control_modes: u16,
    /// bmLayoutPerStream.
    pub layout_per_stream: u64,
    /// Streaming interface the block belongs to. Not part of the wire format.
    pub interface_number: u8,
}

impl StreamCtrl {
    /// Serialize every field; send the first [`stream_ctrl_len`] bytes.
    pub fn encode(&self) -> [u8; MAX_STREAM_CTRL_LEN] {
        let mut buf = [0u8; MAX_STREAM_CTRL_LEN];
        LittleEndian::write_u16(&mut buf[0..2], self.hint);
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        LittleEndian::write_u32(&mut buf[4..8], self.frame_interval);
        LittleEndian::write_u16(&mut buf[8..10], self.key_frame_rate);
        LittleEndian::write_u16(&mut buf[10..12], self.p_frame_rate);
        LittleEndian::write_u16(&mut buf[12..14], self.comp_quality);
        LittleEndian::write_u16(&mut buf[14..16], self.comp_window_size);
        LittleEndian::write_u16(&mut buf[16..18], self.delay);
        LittleEndian::write_u32(&mut buf[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut buf[22..26], self.max_payload_transfer_size);

        LittleEndian::write_u32(&mut buf[26..30], self.clock_frequency);
        buf[30] = self.framing_info;
        buf[31] = self.preferred_version;
        buf[32] = self.min_version;
        buf[33] = self.max_version;

        buf[34] = self.usage;
        buf[35] = self.bit_depth_luma;
        buf[36] = self.settings;
        buf[37] = self.max_number_of_ref_frames_plus1;
        LittleEndian::write_u16(&mut buf[38..40], self.rate_control_modes);
        LittleEndian::write_u64(&mut buf[40..48], self.layout_per_stream);
        buf
    }

    /// Update the fields present in a block of 26, 34 or 48 bytes.
    pub fn decode(&mut self, buf: &[u8]) {
        if buf.len() < 26 {
            return;
        }
        self.hint = LittleEndian::read_u16(&buf[0..2]);
        self.format_index = buf[2];
        self.frame_index = buf[3];
        self.frame_interval = LittleEndian::read_u32(&buf[4..8]);
        self.key_frame_rate = LittleEndian::read_u16(&buf[8..10]);
        self.p_frame_rate = LittleEndian::read_u16(&buf[10..12]);
        self.comp_quality = LittleEndian::read_u16(&buf[12..14]);
        self.comp_window_size = LittleEndian::read_u16(&buf[14..16]);
        self.delay = LittleEndian::read_u16(&buf[16..18]);
        self.max_video_frame_size = LittleEndian::read_u32(&buf[18..22]);
        self.max_payload_transfer_size = LittleEndian::read_u32(&buf[22..26]);

        if buf.len() >= 34 {
            self.clock_frequency = LittleEndian::read_u32(&buf[26..30]);
            self.framing_info = buf[30];
            self.preferred_version = buf[31];
            self.min_version = buf[32];
            self.max_version = buf[33];
        }

        if buf.len() >= 48 {
            self.usage = buf[34];
            self.bit_depth_luma = buf[35];
            self.settings = buf[36];
            self.max_number_of_ref_frames_plus1 = buf[37];
            self.rate_control_modes = LittleEndian::read_u16(&buf[38..40]);
            self.layout_per_stream = LittleEndian::read_u64(&buf[40..48]);
        }
    }

    /// Frames per second implied by the frame interval.
    pub fn fps(&self) -> Option<u32> {
        (self.frame_interval != 0).then(|| INTERVAL_UNITS_PER_SEC / self.frame_interval)
    }
}

/// Run one probe or commit request, rebuilding `ctrl` from GET responses.
pub(crate) fn query_stream_ctrl(
    gateway: &ControlGateway<'_>,
    info: &DeviceInfo,
    ctrl: &mut StreamCtrl,
    probe: bool,
    request: RequestCode,
) -> Result<()> {
    let len = stream_ctrl_len(info.control.bcd_uvc);
    let selector = if probe {
        VS_PROBE_CONTROL
    } else {
        VS_COMMIT_CONTROL
    };
    let index = ctrl.interface_number as u16;

    if request == RequestCode::SetCur {
        return gateway.set(index, selector, &ctrl.encode()[..len]);
    }

    let mut buf = [0u8; MAX_STREAM_CTRL_LEN];
    gateway.get_into(index, selector, request, &mut buf[..len])?;
    ctrl.decode(&buf[..len]);

    // Some devices leave dwMaxVideoFrameSize unset; fall back to the frame descriptor.
    if ctrl.max_video_frame_size == 0 {
        if let Some((_, frame)) =
            info.find_frame(ctrl.interface_number, ctrl.format_index, ctrl.frame_index)
        {
            ctrl.max_video_frame_size = frame.max_video_frame_buffer_size;
        }
    }
    Ok(())
}

/// Commit a negotiated block.
pub(crate) fn commit_stream_ctrl(
    gateway: &ControlGateway<'_>,
    info: &DeviceInfo,
    ctrl: &StreamCtrl,
) -> Result<()> {
    let mut ctrl = *ctrl;
    query_stream_ctrl(gateway, info, &mut ctrl, false, RequestCode::SetCur)
}

// =============================================================================
// Candidate selection
// =============================================================================

/// Pick a frame interval giving a rate within `[min_fps, max_fps]`.
///
/// Discrete lists yield their first qualifying entry. Continuous ranges are
/// searched from `max_fps` down, yielding the first interval on the step grid.
pub fn select_interval(frame: &FrameDesc, min_fps: u32, max_fps: u32) -> Option<u32> {
    let fps_range = min_fps..=max_fps;
    match &frame.intervals {
        FrameIntervals::Discrete(intervals) => intervals
            .iter()
            .copied()
            .find(|&interval| interval != 0 && fps_range.contains(&(INTERVAL_UNITS_PER_SEC / interval))),
        &FrameIntervals::Continuous { min, max, step } => fps_range
            .rev()
            .filter(|&fps| fps != 0)
            .map(|fps| INTERVAL_UNITS_PER_SEC / fps)
            .find(|&interval| {
                interval >= min
                    && interval <= max
                    && if step == 0 {
                        interval == min
                    } else {
                        (interval - min) % step == 0
                    }
            }),
    }
}

/// Formats and frames of `stream` that match the requested format and size.
fn matching_frames<'a>(
    stream: &'a StreamingInterface,
    format: FrameFormat,
    width: u16,
    height: u16,
) -> impl Iterator<Item = (&'a FormatDesc, &'a FrameDesc)> + 'a {
    stream
        .formats
        .iter()
        .filter(move |desc| format.matches_guid(&desc.guid))
        .flat_map(|desc| desc.frames.iter().map(move |frame| (desc, frame)))
        .filter(move |(_, frame)| frame.width == width && frame.height == height)
}

impl DeviceHandle {
    /// Negotiate a stream for `format` at `width` × `height` with a frame rate
    /// in `[min_fps, max_fps]`.
    ///
    /// The first matching streaming interface, format and frame wins. The
    /// returned block has been probed but not committed.
    pub fn stream_ctrl_for(
        &self,
        format: FrameFormat,
        width: u16,
        height: u16,
        min_fps: u32,
        max_fps: u32,
    ) -> Result<StreamCtrl> {
        if min_fps > max_fps {
            return Err(Error::InvalidParam);
        }

        for stream in &self.info().streaming {
            let mut candidates = matching_frames(stream, format, width, height).peekable();
            if candidates.peek().is_none() {
                continue;
            }

            let newly_claimed = self.claim_interface(stream.interface_number)?;
            let result = self.negotiate_on(stream.interface_number, candidates, min_fps, max_fps);
            if let Ok(Some(ctrl)) = result {
                return Ok(ctrl);
            }
            // Leave the interface as it was before this call.
            if newly_claimed {
                self.release_interface(stream.interface_number);
            }
            result?;
        }

        Err(Error::InvalidMode)
    }

    /// Probe the first candidate frame with an interval in range. `Ok(None)`
    /// when no candidate has one.
    fn negotiate_on<'a>(
        &self,
        interface_number: u8,
        candidates: impl Iterator<Item = (&'a FormatDesc, &'a FrameDesc)>,
        min_fps: u32,
        max_fps: u32,
    ) -> Result<Option<StreamCtrl>> {
        let info = self.info();
        let gateway = self.gateway();
        let mut ctrl = StreamCtrl {
            interface_number,
            ..Default::default()
        };
        query_stream_ctrl(&gateway, info, &mut ctrl, true, RequestCode::GetCur)?;
        query_stream_ctrl(&gateway, info, &mut ctrl, true, RequestCode::GetMin)?;
        if let Err(e) = query_stream_ctrl(&gateway, info, &mut ctrl, true, RequestCode::GetMax) {
            warn!("GET_MAX on probe control failed: {e}");
        }

        for (desc, frame) in candidates {
            let Some(interval) = select_interval(frame, min_fps, max_fps) else {
                continue;
            };
            debug!(
                "selected format {} frame {} ({}x{}) interval {interval}",
                desc.index, frame.index, frame.width, frame.height
            );
            ctrl.hint = 1;
            ctrl.format_index = desc.index;
            ctrl.frame_index = frame.index;
            ctrl.frame_interval = interval;
            self.probe_stream_ctrl(&mut ctrl)?;
            return Ok(Some(ctrl));
        }
        Ok(None)
    }

    /// SET_CUR then GET_CUR on the probe control, updating `ctrl` with the
    /// device's answer.
    pub fn probe_stream_ctrl(&self, ctrl: &mut StreamCtrl) -> Result<()> {
        self.claim_interface(ctrl.interface_number)?;
        let gateway = self.gateway();
        query_stream_ctrl(&gateway, self.info(), ctrl, true, RequestCode::SetCur)?;
        query_stream_ctrl(&gateway, self.info(), ctrl, true, RequestCode::GetCur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::descriptors::CameraLayout;
    use crate::mock::open_mock_camera;

    fn discrete_640x480() -> FrameDesc {
        FrameDesc {
            width: 640,
            height: 480,
            intervals: FrameIntervals::Discrete(vec![333_333, 666_666]),
            ..Default::default()
        }
    }

    #[test]
    fn test_discrete_interval_selection() {
        let frame = discrete_640x480();
        assert_eq!(select_interval(&frame, 25, 30), Some(333_333));
        assert_eq!(select_interval(&frame, 10, 20), Some(666_666));
        assert_eq!(select_interval(&frame, 40, 50), None);
    }

    #[test]
    fn test_continuous_interval_selection() {
        let frame = FrameDesc {
            intervals: FrameIntervals::Continuous {
                min: 333_333,
                max: 1_000_000,
                step: 333_333,
            },
            ..Default::default()
        };
        assert_eq!(select_interval(&frame, 10, 30), Some(333_333));
        // 29..16 fps land off the step grid
        assert_eq!(select_interval(&frame, 11, 29), Some(666_666));
        assert_eq!(select_interval(&frame, 31, 60), None);
    }

    #[test]
    fn test_stream_ctrl_len_by_version() {
        assert_eq!(stream_ctrl_len(0x0100), 26);
        assert_eq!(stream_ctrl_len(0x010a), 26);
        assert_eq!(stream_ctrl_len(0x0110), 34);
        assert_eq!(stream_ctrl_len(0x0150), 48);
    }

    #[test]
    fn test_encode_field_offsets() {
        let ctrl = StreamCtrl {
            hint: 1,
            format_index: 2,
            frame_index: 3,
            frame_interval: 333_333,
            max_video_frame_size: 614_400,
            max_payload_transfer_size: 3072,
            clock_frequency: 48_000_000,
            layout_per_stream: 0x0102_0304_0506_0708,
            ..Default::default()
        };
        let buf = ctrl.encode();
        assert_eq!(&buf[0..4], &[1, 0, 2, 3]);
        assert_eq!(LittleEndian::read_u32(&buf[4..8]), 333_333);
        assert_eq!(LittleEndian::read_u32(&buf[18..22]), 614_400);
        assert_eq!(LittleEndian::read_u32(&buf[22..26]), 3072);
        assert_eq!(LittleEndian::read_u32(&buf[26..30]), 48_000_000);
        assert_eq!(buf[40], 0x08);

        let mut short = StreamCtrl::default();
        short.decode(&buf[..26]);
        assert_eq!(short.max_payload_transfer_size, 3072);
        assert_eq!(short.clock_frequency, 0);
        assert_eq!(short.layout_per_stream, 0);

        let mut full = StreamCtrl::default();
        full.decode(&buf);
        assert_eq!(full, ctrl);
    }

    #[test]
    fn test_fps() {
        let ctrl = StreamCtrl {
            frame_interval: 333_333,
            ..Default::default()
        };
        assert_eq!(ctrl.fps(), Some(30));
        assert_eq!(StreamCtrl::default().fps(), None);
    }

    #[test]
    fn test_negotiate_yuyv_640x480() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();

        let ctrl = handle
            .stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30)
            .unwrap();
        assert_eq!(ctrl.interface_number, 1);
        assert_eq!((ctrl.format_index, ctrl.frame_index), (1, 1));
        assert_eq!(ctrl.frame_interval, 333_333);
        assert_eq!(ctrl.hint, 1);
        // device echoed a zero frame size; taken from the frame descriptor
        assert_eq!(ctrl.max_video_frame_size, 614_400);
        assert!(device.handle().claimed_interfaces().contains(&1));

        let ctrl = handle
            .stream_ctrl_for(FrameFormat::Uncompressed, 640, 480, 10, 20)
            .unwrap();
        assert_eq!(ctrl.frame_interval, 666_666);

        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 40, 50),
            Err(Error::InvalidMode)
        );
        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Mjpeg, 640, 480, 1, 60),
            Err(Error::InvalidMode)
        );
    }

    #[test]
    fn test_failed_negotiation_releases_interface() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let mock = device.handle();

        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 40, 50),
            Err(Error::InvalidMode)
        );
        assert_eq!(mock.claimed_interfaces(), vec![0]);
        assert_eq!(mock.released_interfaces(), vec![1]);

        mock.fail_control(RequestCode::GetMin, 0x0100, Error::Pipe);
        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30),
            Err(Error::Pipe)
        );
        assert_eq!(mock.claimed_interfaces(), vec![0]);
        assert_eq!(mock.released_interfaces(), vec![1, 1]);
    }

    #[test]
    fn test_failed_negotiation_keeps_earlier_claim() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let ctrl = handle
            .stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30)
            .unwrap();
        let _stream = handle.open_stream(&ctrl).unwrap();

        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 40, 50),
            Err(Error::InvalidMode)
        );
        let mock = device.handle();
        assert_eq!(mock.claimed_interfaces(), vec![0, 1]);
        assert!(mock.released_interfaces().is_empty());
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let (_ctx, _device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        let first = handle
            .stream_ctrl_for(FrameFormat::Any, 1280, 720, 10, 30)
            .unwrap();
        let second = handle
            .stream_ctrl_for(FrameFormat::Any, 1280, 720, 10, 30)
            .unwrap();
        assert_eq!(
            (first.format_index, first.frame_index, first.frame_interval),
            (second.format_index, second.frame_index, second.frame_interval)
        );
        assert_eq!(first.format_index, 2);
    }

    #[test]
    fn test_priming_then_probe_sequence() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        device.handle().clear_control_log();
        handle
            .stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30)
            .unwrap();

        let requests: Vec<(u8, u16)> = device
            .handle()
            .control_log()
            .iter()
            .map(|record| (record.request, record.value))
            .collect();
        assert_eq!(
            requests,
            vec![
                (0x81, 0x0100),
                (0x82, 0x0100),
                (0x83, 0x0100),
                (0x01, 0x0100),
                (0x81, 0x0100),
            ]
        );
    }

    #[test]
    fn test_get_max_failure_is_ignored() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        device
            .handle()
            .fail_control(RequestCode::GetMax, 0x0100, Error::Pipe);
        assert!(handle
            .stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30)
            .is_ok());

        device
            .handle()
            .fail_control(RequestCode::GetMin, 0x0100, Error::Pipe);
        assert_eq!(
            handle.stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 25, 30),
            Err(Error::Pipe)
        );
    }

    #[test]
    fn test_probe_payload_length_follows_version() {
        for (bcd_uvc, expected) in [(0x0100, 26usize), (0x0110, 34), (0x0150, 48)] {
            let layout = CameraLayout {
                bcd_uvc,
                ..CameraLayout::default()
            };
            let (_ctx, device, handle) = open_mock_camera(&layout).unwrap();
            let mut ctrl = StreamCtrl {
                interface_number: 1,
                format_index: 1,
                frame_index: 1,
                frame_interval: 333_333,
                ..Default::default()
            };
            handle.probe_stream_ctrl(&mut ctrl).unwrap();
            let set = device
                .handle()
                .control_log()
                .into_iter()
                .find(|record| record.request == 0x01 && record.value == 0x0100)
                .unwrap();
            assert_eq!(set.data.len(), expected, "bcdUVC {bcd_uvc:#06x}");
        }
    }

    #[test]
    fn test_uvc15_stream_ctrl_block_layout() {
        let layout = CameraLayout {
            bcd_uvc: 0x0150,
            ..CameraLayout::default()
        };
        let (_ctx, device, handle) = open_mock_camera(&layout).unwrap();
        let mut ctrl = StreamCtrl {
            hint: 0x0001,
            interface_number: 1,
            format_index: 1,
            frame_index: 2,
            frame_interval: 0x0005_1615,
            clock_frequency: 48_000_000,
            usage: 0x11,
            bit_depth_luma: 0x08,
            settings: 0x05,
            max_number_of_ref_frames_plus1: 0x03,
            rate_control_modes: 0x1234,
            layout_per_stream: 0x0807_0605_0403_0201,
            ..Default::default()
        };
        handle.probe_stream_ctrl(&mut ctrl).unwrap();

        let data = device
            .handle()
            .control_log()
            .into_iter()
            .find(|record| record.request == 0x01 && record.value == 0x0100)
            .unwrap()
            .data;
        assert_eq!(data.len(), 48);
        assert_eq!(&data[0..4], &[0x01, 0x00, 1, 2]);
        assert_eq!(&data[4..8], &[0x15, 0x16, 0x05, 0x00]);
        assert_eq!(&data[26..30], &48_000_000u32.to_le_bytes());
        assert_eq!(
            &data[34..48],
            &[0x11, 0x08, 0x05, 0x03, 0x34, 0x12, 1, 2, 3, 4, 5, 6, 7, 8]
        );

        // the echoed block decodes back into the same fields
        assert_eq!(ctrl.usage, 0x11);
        assert_eq!(ctrl.rate_control_modes, 0x1234);
        assert_eq!(ctrl.layout_per_stream, 0x0807_0605_0403_0201);
    }

    #[test]
    fn test_short_probe_read_is_io() {
        let (_ctx, device, handle) = open_mock_camera(&CameraLayout::default()).unwrap();
        device
            .handle()
            .short_control(RequestCode::GetCur, 0x0100);
        let mut ctrl = StreamCtrl {
            interface_number: 1,
            ..Default::default()
        };
        assert_eq!(handle.probe_stream_ctrl(&mut ctrl), Err(Error::Io));
    }
}
