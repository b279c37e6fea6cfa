//! Builders for class-specific descriptor blocks and whole camera
//! configurations, used to script mock devices.

use crate::descriptor::{
    CC_VIDEO, CS_INTERFACE, SC_VIDEOCONTROL, SC_VIDEOSTREAMING, VC_EXTENSION_UNIT, VC_HEADER,
    VC_INPUT_TERMINAL, VC_OUTPUT_TERMINAL, VC_PROCESSING_UNIT, VC_SELECTOR_UNIT, VS_COLORFORMAT,
    VS_FORMAT_FRAME_BASED, VS_FORMAT_MJPEG, VS_FORMAT_UNCOMPRESSED, VS_FRAME_FRAME_BASED,
    VS_FRAME_MJPEG, VS_FRAME_UNCOMPRESSED, VS_INPUT_HEADER, VS_STILL_IMAGE_FRAME,
};
use crate::types::FrameFormat;
use crate::usb::{AltSetting, ConfigInfo, EndpointInfo, EndpointKind, InterfaceInfo};

/// Streaming data endpoint used by [`camera_config`].
pub const STREAM_ENDPOINT: u8 = 0x81;
/// Status interrupt endpoint used by [`camera_config`].
pub const STATUS_ENDPOINT: u8 = 0x83;
/// Camera terminal ID used by [`camera_config`].
pub const CAMERA_TERMINAL_ID: u8 = 1;
/// Processing unit ID used by [`camera_config`].
pub const PROCESSING_UNIT_ID: u8 = 2;

fn block(subtype: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![(body.len() + 3) as u8, CS_INTERFACE, subtype];
    out.extend_from_slice(body);
    out
}

fn guid_for(fourcc: &[u8; 4]) -> [u8; 16] {
    let mut guid = FrameFormat::Yuyv.guid().unwrap_or_default();
    guid[..4].copy_from_slice(fourcc);
    guid
}

// =============================================================================
// Video Control blocks
// =============================================================================

/// VC header listing `interfaces`; reports a 48 MHz clock.
pub fn vc_header(bcd_uvc: u16, interfaces: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&bcd_uvc.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&48_000_000u32.to_le_bytes());
    body.push(interfaces.len() as u8);
    body.extend_from_slice(interfaces);
    block(VC_HEADER, &body)
}

pub fn camera_terminal(id: u8, controls: &[u8]) -> Vec<u8> {
    let mut body = vec![id];
    body.extend_from_slice(&0x0201u16.to_le_bytes());
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(&[0; 6]);
    body.push(controls.len() as u8);
    body.extend_from_slice(controls);
    block(VC_INPUT_TERMINAL, &body)
}

pub fn input_terminal_of_type(id: u8, terminal_type: u16) -> Vec<u8> {
    let mut body = vec![id];
    body.extend_from_slice(&terminal_type.to_le_bytes());
    body.extend_from_slice(&[0, 0]);
    block(VC_INPUT_TERMINAL, &body)
}

pub fn output_terminal(id: u8, terminal_type: u16, source: u8) -> Vec<u8> {
    let mut body = vec![id];
    body.extend_from_slice(&terminal_type.to_le_bytes());
    body.extend_from_slice(&[0, source, 0]);
    block(VC_OUTPUT_TERMINAL, &body)
}

pub fn selector_unit(id: u8, sources: &[u8]) -> Vec<u8> {
    let mut body = vec![id, sources.len() as u8];
    body.extend_from_slice(sources);
    body.push(0);
    block(VC_SELECTOR_UNIT, &body)
}

/// Processing unit with wMaxMultiplier 0x4000.
pub fn processing_unit(id: u8, source: u8, controls: &[u8]) -> Vec<u8> {
    let mut body = vec![id, source];
    body.extend_from_slice(&0x4000u16.to_le_bytes());
    body.push(controls.len() as u8);
    body.extend_from_slice(controls);
    body.extend_from_slice(&[0, 0]);
    block(VC_PROCESSING_UNIT, &body)
}

/// Extension unit with a single source and a GUID starting 0xa5.
pub fn extension_unit(id: u8, source: u8, controls: &[u8]) -> Vec<u8> {
    let mut body = vec![id];
    let mut guid = [0u8; 16];
    guid[0] = 0xa5;
    body.extend_from_slice(&guid);
    body.push(8);
    body.push(1);
    body.push(source);
    body.push(controls.len() as u8);
    body.extend_from_slice(controls);
    body.push(0);
    block(VC_EXTENSION_UNIT, &body)
}

// =============================================================================
// Video Streaming blocks
// =============================================================================

/// Input header with terminal link 3.
pub fn input_header(endpoint: u8, formats: u8) -> Vec<u8> {
    let mut body = vec![formats];
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&[endpoint, 0, 3, 0, 0, 0, 1]);
    body.extend(std::iter::repeat(0).take(formats as usize));
    block(VS_INPUT_HEADER, &body)
}

pub fn uncompressed_format(index: u8, fourcc: &[u8; 4], bpp: u8, frames: u8) -> Vec<u8> {
    let mut body = vec![index, frames];
    body.extend_from_slice(&guid_for(fourcc));
    body.extend_from_slice(&[bpp, 1, 0, 0, 0, 0]);
    block(VS_FORMAT_UNCOMPRESSED, &body)
}

pub fn frame_based_format(index: u8, fourcc: &[u8; 4], bpp: u8) -> Vec<u8> {
    let mut body = vec![index, 1];
    body.extend_from_slice(&guid_for(fourcc));
    body.extend_from_slice(&[bpp, 1, 0, 0, 0, 0, 1]);
    block(VS_FORMAT_FRAME_BASED, &body)
}

pub fn mjpeg_format(index: u8) -> Vec<u8> {
    block(VS_FORMAT_MJPEG, &[index, 1, 1, 1, 0, 0, 0, 0])
}

fn frame_head(index: u8, width: u16, height: u16) -> Vec<u8> {
    let mut body = vec![index, 0];
    body.extend_from_slice(&width.to_le_bytes());
    body.extend_from_slice(&height.to_le_bytes());
    body.extend_from_slice(&1_000_000u32.to_le_bytes());
    body.extend_from_slice(&100_000_000u32.to_le_bytes());
    body
}

fn discrete_frame(
    subtype: u8,
    index: u8,
    width: u16,
    height: u16,
    max_buffer: u32,
    intervals: &[u32],
) -> Vec<u8> {
    let mut body = frame_head(index, width, height);
    body.extend_from_slice(&max_buffer.to_le_bytes());
    body.extend_from_slice(&intervals.first().copied().unwrap_or(0).to_le_bytes());
    body.push(intervals.len() as u8);
    for interval in intervals {
        body.extend_from_slice(&interval.to_le_bytes());
    }
    block(subtype, &body)
}

/// Uncompressed frame with a discrete interval list.
pub fn uncompressed_frame(
    index: u8,
    width: u16,
    height: u16,
    max_buffer: u32,
    intervals: &[u32],
) -> Vec<u8> {
    discrete_frame(VS_FRAME_UNCOMPRESSED, index, width, height, max_buffer, intervals)
}

/// MJPEG frame with a discrete interval list.
pub fn mjpeg_frame(
    index: u8,
    width: u16,
    height: u16,
    max_buffer: u32,
    intervals: &[u32],
) -> Vec<u8> {
    discrete_frame(VS_FRAME_MJPEG, index, width, height, max_buffer, intervals)
}

/// MJPEG frame with a continuous interval range and no reported buffer size.
pub fn continuous_frame(index: u8, width: u16, height: u16, min: u32, max: u32, step: u32) -> Vec<u8> {
    let mut body = frame_head(index, width, height);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&min.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&min.to_le_bytes());
    body.extend_from_slice(&max.to_le_bytes());
    body.extend_from_slice(&step.to_le_bytes());
    block(VS_FRAME_MJPEG, &body)
}

pub fn frame_based_frame(
    index: u8,
    width: u16,
    height: u16,
    default_interval: u32,
    bytes_per_line: u32,
    intervals: &[u32],
) -> Vec<u8> {
    let mut body = frame_head(index, width, height);
    body.extend_from_slice(&default_interval.to_le_bytes());
    body.push(intervals.len() as u8);
    body.extend_from_slice(&bytes_per_line.to_le_bytes());
    for interval in intervals {
        body.extend_from_slice(&interval.to_le_bytes());
    }
    block(VS_FRAME_FRAME_BASED, &body)
}

pub fn still_frame(sizes: &[(u16, u16)], compression: &[u8]) -> Vec<u8> {
    let mut body = vec![0, sizes.len() as u8];
    for (width, height) in sizes {
        body.extend_from_slice(&width.to_le_bytes());
        body.extend_from_slice(&height.to_le_bytes());
    }
    body.push(compression.len() as u8);
    body.extend_from_slice(compression);
    block(VS_STILL_IMAGE_FRAME, &body)
}

pub fn color_matching(primaries: u8, transfer: u8, matrix: u8) -> Vec<u8> {
    block(VS_COLORFORMAT, &[primaries, transfer, matrix])
}

// =============================================================================
// Whole configurations
// =============================================================================

/// How the streaming interface moves data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransport {
    /// Alternate setting 0 without endpoints, then one setting per packet size.
    Isochronous { max_packet_sizes: Vec<u16> },
    /// A single alternate setting with a bulk endpoint.
    Bulk { max_packet_size: u16 },
}

/// Shape of the camera built by [`camera_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraLayout {
    pub bcd_uvc: u16,
    pub transport: StreamTransport,
    /// Class-specific bytes of the streaming interface.
    pub streaming_blocks: Vec<u8>,
}

impl Default for CameraLayout {
    fn default() -> Self {
        Self {
            bcd_uvc: 0x0110,
            transport: StreamTransport::Isochronous {
                max_packet_sizes: vec![128, 512, 1024, 0x1400],
            },
            streaming_blocks: default_streaming_blocks(),
        }
    }
}

impl CameraLayout {
    pub fn bulk() -> Self {
        Self {
            transport: StreamTransport::Bulk {
                max_packet_size: 512,
            },
            ..Self::default()
        }
    }
}

/// YUYV 640x480 at 30 or 15 fps, then MJPEG 1280x720 with a continuous range.
pub fn default_streaming_blocks() -> Vec<u8> {
    let mut blocks = input_header(STREAM_ENDPOINT, 2);
    blocks.extend(uncompressed_format(1, b"YUY2", 16, 1));
    blocks.extend(uncompressed_frame(1, 640, 480, 0, &[333_333, 666_666]));
    blocks.extend(mjpeg_format(2));
    blocks.extend(continuous_frame(1, 1280, 720, 333_333, 1_000_000, 333_333));
    blocks
}

/// A camera with a control interface (number 0) and one streaming
/// interface (number 1).
pub fn camera_config(layout: &CameraLayout) -> ConfigInfo {
    let mut control_blocks = vc_header(layout.bcd_uvc, &[1]);
    control_blocks.extend(camera_terminal(CAMERA_TERMINAL_ID, &[0x0a, 0x00, 0x00]));
    control_blocks.extend(processing_unit(
        PROCESSING_UNIT_ID,
        CAMERA_TERMINAL_ID,
        &[0x7f, 0x15],
    ));

    let control = InterfaceInfo {
        number: 0,
        alt_settings: vec![AltSetting {
            setting: 0,
            class_code: CC_VIDEO,
            subclass_code: SC_VIDEOCONTROL,
            endpoints: vec![EndpointInfo {
                address: STATUS_ENDPOINT,
                kind: EndpointKind::Interrupt,
                max_packet_size: 16,
                extra: Vec::new(),
            }],
            extra: control_blocks,
        }],
    };

    let streaming_alt = |setting: u8, endpoints: Vec<EndpointInfo>, extra: Vec<u8>| AltSetting {
        setting,
        class_code: CC_VIDEO,
        subclass_code: SC_VIDEOSTREAMING,
        endpoints,
        extra,
    };
    let alt_settings = match &layout.transport {
        StreamTransport::Isochronous { max_packet_sizes } => {
            let mut alts = vec![streaming_alt(0, Vec::new(), layout.streaming_blocks.clone())];
            for (i, &size) in max_packet_sizes.iter().enumerate() {
                alts.push(streaming_alt(
                    i as u8 + 1,
                    vec![EndpointInfo {
                        address: STREAM_ENDPOINT,
                        kind: EndpointKind::Isochronous,
                        max_packet_size: size,
                        extra: Vec::new(),
                    }],
                    Vec::new(),
                ));
            }
            alts
        }
        StreamTransport::Bulk { max_packet_size } => vec![streaming_alt(
            0,
            vec![EndpointInfo {
                address: STREAM_ENDPOINT,
                kind: EndpointKind::Bulk,
                max_packet_size: *max_packet_size,
                extra: Vec::new(),
            }],
            layout.streaming_blocks.clone(),
        )],
    };

    ConfigInfo {
        interfaces: vec![
            control,
            InterfaceInfo {
                number: 1,
                alt_settings,
            },
        ],
    }
}
