//! Decoding of class-specific descriptor blocks.
//!
//! Every block starts with bLength, bDescriptorType and bDescriptorSubtype.
//! Fields sit at fixed offsets per subtype, followed by tails whose length is
//! given by a count field earlier in the block. All reads are bounds-checked
//! against the block's own length; reading past it is a malformed descriptor.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use super::model::{
    ColorMatching, ControlInterface, ExtensionUnit, FormatDesc, FormatSubtype, FrameDesc,
    FrameIntervals, InputTerminal, OutputTerminal, ProcessingUnit, SelectorUnit, StillFrameDesc,
    StreamingInterface,
};
use super::{
    CS_INTERFACE, ITT_CAMERA, OTT_DISPLAY, UVC_VERSIONS, VC_EXTENSION_UNIT, VC_HEADER,
    VC_INPUT_TERMINAL, VC_OUTPUT_TERMINAL, VC_PROCESSING_UNIT, VC_SELECTOR_UNIT, VS_COLORFORMAT,
    VS_FORMAT_FRAME_BASED, VS_FORMAT_MJPEG, VS_FORMAT_UNCOMPRESSED, VS_FRAME_FRAME_BASED,
    VS_FRAME_MJPEG, VS_FRAME_UNCOMPRESSED, VS_INPUT_HEADER, VS_STILL_IMAGE_FRAME,
};
use crate::error::{Error, Result};
use crate::types::MJPEG_GUID;

// =============================================================================
// Block access
// =============================================================================

/// Iterator over the descriptor blocks packed into an interface's extra bytes.
///
/// Stops when fewer than three bytes remain. A block whose length is below
/// three or runs past the buffer yields `InvalidDevice` and ends the walk.
pub(crate) struct Blocks<'a> {
    rest: &'a [u8],
}

pub(crate) fn blocks(extra: &[u8]) -> Blocks<'_> {
    Blocks { rest: extra }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Result<Block<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 3 {
            return None;
        }
        let len = self.rest[0] as usize;
        if len < 3 || len > self.rest.len() {
            debug!(
                "malformed descriptor block: length {len}, {} bytes left",
                self.rest.len()
            );
            self.rest = &[];
            return Some(Err(Error::InvalidDevice));
        }
        let (block, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Ok(Block(block)))
    }
}

/// One descriptor block with checked little-endian field access.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block<'a>(pub(crate) &'a [u8]);

impl<'a> Block<'a> {
    pub(crate) fn descriptor_type(&self) -> u8 {
        self.0[1]
    }

    pub(crate) fn subtype(&self) -> u8 {
        self.0[2]
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.0.get(offset..end))
            .ok_or(Error::InvalidDevice)
    }

    pub(crate) fn u8(&self, offset: usize) -> Result<u8> {
        self.0.get(offset).copied().ok_or(Error::InvalidDevice)
    }

    pub(crate) fn u16(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.bytes(offset, 2)?))
    }

    pub(crate) fn u32(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    pub(crate) fn guid(&self, offset: usize) -> Result<[u8; 16]> {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(self.bytes(offset, 16)?);
        Ok(guid)
    }
}

/// Fold a bmControls field into a mask with byte 0 as the low byte.
fn control_mask(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |mask, &byte| (mask << 8) | byte as u64)
}

// =============================================================================
// Video Control interface
// =============================================================================

/// Parse the Video-Control interface's blocks into `control`.
///
/// Returns the streaming interface numbers listed by the header.
pub(crate) fn parse_control_blocks(
    control: &mut ControlInterface,
    extra: &[u8],
) -> Result<Vec<u8>> {
    let mut streaming = Vec::new();
    for block in blocks(extra) {
        let block = block?;
        if block.descriptor_type() != CS_INTERFACE {
            trace!("skipping non class-specific block {:#04x}", block.descriptor_type());
            continue;
        }
        if control.bcd_uvc == 0 && block.subtype() != VC_HEADER {
            debug!("video control block before header");
            return Err(Error::InvalidDevice);
        }
        match block.subtype() {
            VC_HEADER => streaming = parse_vc_header(control, block)?,
            VC_INPUT_TERMINAL => {
                if let Some(terminal) = parse_input_terminal(control, block)? {
                    control.input_terminals.push(terminal);
                }
            }
            VC_OUTPUT_TERMINAL => {
                if let Some(terminal) = parse_output_terminal(control, block)? {
                    control.output_terminals.push(terminal);
                }
            }
            VC_SELECTOR_UNIT => {
                let unit = parse_selector_unit(control, block)?;
                control.selector_units.push(unit);
            }
            VC_PROCESSING_UNIT => {
                let unit = parse_processing_unit(control, block)?;
                control.processing_units.push(unit);
            }
            VC_EXTENSION_UNIT => {
                let unit = parse_extension_unit(control, block)?;
                control.extension_units.push(unit);
            }
            other => debug!("unsupported video control subtype {other:#04x}"),
        }
    }
    Ok(streaming)
}

fn parse_vc_header(control: &mut ControlInterface, block: Block<'_>) -> Result<Vec<u8>> {
    let bcd_uvc = block.u16(3)?;
    if !UVC_VERSIONS.contains(&bcd_uvc) {
        debug!("unsupported UVC version {bcd_uvc:#06x}");
        return Err(Error::NotSupported);
    }
    control.bcd_uvc = bcd_uvc;
    if matches!(bcd_uvc, 0x0100 | 0x010a) {
        control.clock_frequency = block.u32(7)?;
    }
    let count = block.u8(11)? as usize;
    Ok(block.bytes(12, count)?.to_vec())
}

fn parse_input_terminal(
    control: &ControlInterface,
    block: Block<'_>,
) -> Result<Option<InputTerminal>> {
    let terminal_type = block.u16(4)?;
    if terminal_type != ITT_CAMERA {
        debug!("ignoring input terminal of type {terminal_type:#06x}");
        return Ok(None);
    }
    let id = block.u8(3)?;
    let control_size = block.u8(14)? as usize;
    Ok(Some(InputTerminal {
        id,
        terminal_type,
        assoc_terminal: block.u8(6)?,
        string_index: block.u8(7)?,
        objective_focal_length_min: block.u16(8)?,
        objective_focal_length_max: block.u16(10)?,
        ocular_focal_length: block.u16(12)?,
        controls: control_mask(block.bytes(15, control_size)?),
        request: control.entity_request(id),
    }))
}

fn parse_output_terminal(
    control: &ControlInterface,
    block: Block<'_>,
) -> Result<Option<OutputTerminal>> {
    let terminal_type = block.u16(4)?;
    if terminal_type != OTT_DISPLAY {
        debug!("ignoring output terminal of type {terminal_type:#06x}");
        return Ok(None);
    }
    let id = block.u8(3)?;
    Ok(Some(OutputTerminal {
        id,
        terminal_type,
        assoc_terminal: block.u8(6)?,
        source_id: block.u8(7)?,
        string_index: block.u8(8)?,
        request: control.entity_request(id),
    }))
}

fn parse_selector_unit(control: &ControlInterface, block: Block<'_>) -> Result<SelectorUnit> {
    let id = block.u8(3)?;
    let pins = block.u8(4)? as usize;
    Ok(SelectorUnit {
        id,
        source_ids: block.bytes(5, pins)?.to_vec(),
        string_index: block.u8(5 + pins).unwrap_or(0),
        request: control.entity_request(id),
    })
}

fn parse_processing_unit(control: &ControlInterface, block: Block<'_>) -> Result<ProcessingUnit> {
    let id = block.u8(3)?;
    let control_size = block.u8(7)? as usize;
    let video_standards = if control.bcd_uvc >= 0x0110 {
        block.u8(9 + control_size).unwrap_or(0)
    } else {
        0
    };
    Ok(ProcessingUnit {
        id,
        source_id: block.u8(4)?,
        max_multiplier: block.u16(5)?,
        controls: control_mask(block.bytes(8, control_size)?),
        string_index: block.u8(8 + control_size).unwrap_or(0),
        video_standards,
        request: control.entity_request(id),
    })
}

fn parse_extension_unit(control: &ControlInterface, block: Block<'_>) -> Result<ExtensionUnit> {
    let id = block.u8(3)?;
    let pins = block.u8(21)? as usize;
    let control_size = block.u8(22 + pins)? as usize;
    Ok(ExtensionUnit {
        id,
        guid: block.guid(4)?,
        num_controls: block.u8(20)?,
        source_ids: block.bytes(22, pins)?.to_vec(),
        controls: control_mask(block.bytes(23 + pins, control_size)?),
        string_index: block.u8(23 + pins + control_size).unwrap_or(0),
        request: control.entity_request(id),
    })
}

// =============================================================================
// Video Streaming interface
// =============================================================================

/// Parse a Video-Streaming interface's blocks into `stream`.
pub(crate) fn parse_streaming_blocks(stream: &mut StreamingInterface, extra: &[u8]) -> Result<()> {
    for block in blocks(extra) {
        let block = block?;
        if block.descriptor_type() != CS_INTERFACE {
            trace!("skipping non class-specific block {:#04x}", block.descriptor_type());
            continue;
        }
        match block.subtype() {
            VS_INPUT_HEADER => parse_input_header(stream, block)?,
            VS_FORMAT_UNCOMPRESSED => stream
                .formats
                .push(parse_uncompressed_format(block, FormatSubtype::Uncompressed)?),
            VS_FORMAT_FRAME_BASED => stream
                .formats
                .push(parse_uncompressed_format(block, FormatSubtype::FrameBased)?),
            VS_FORMAT_MJPEG => stream.formats.push(parse_mjpeg_format(block)?),
            VS_FRAME_UNCOMPRESSED | VS_FRAME_MJPEG | VS_FRAME_FRAME_BASED => {
                let format = stream.formats.last_mut().ok_or_else(|| {
                    debug!("frame descriptor before any format");
                    Error::InvalidDevice
                })?;
                let frame = parse_frame(format, block)?;
                format.frames.push(frame);
            }
            VS_STILL_IMAGE_FRAME => {
                let still = parse_still_frame(block)?;
                match stream.formats.last_mut() {
                    Some(format) => format.still_frames.push(still),
                    None => debug!("still image frame descriptor before any format"),
                }
            }
            VS_COLORFORMAT => {
                let color = ColorMatching {
                    primaries: block.u8(3)?,
                    transfer_characteristics: block.u8(4)?,
                    matrix_coefficients: block.u8(5)?,
                };
                match stream.formats.last_mut() {
                    Some(format) => format.color = Some(color),
                    None => debug!("color matching descriptor before any format"),
                }
            }
            other => debug!("unsupported video streaming subtype {other:#04x}"),
        }
    }
    Ok(())
}

fn parse_input_header(stream: &mut StreamingInterface, block: Block<'_>) -> Result<()> {
    stream.endpoint_address = block.u8(6)? & 0x8f;
    stream.info_flags = block.u8(7)?;
    stream.terminal_link = block.u8(8)?;
    stream.still_capture_method = block.u8(9)?;
    stream.trigger_support = block.u8(10)?;
    stream.trigger_usage = block.u8(11)?;
    Ok(())
}

fn parse_uncompressed_format(block: Block<'_>, subtype: FormatSubtype) -> Result<FormatDesc> {
    Ok(FormatDesc {
        subtype,
        index: block.u8(3)?,
        guid: block.guid(5)?,
        bits_per_pixel: block.u8(21)?,
        default_frame_index: block.u8(22)?,
        aspect_ratio_x: block.u8(23)?,
        aspect_ratio_y: block.u8(24)?,
        interlace_flags: block.u8(25)?,
        copy_protect: block.u8(26)?,
        variable_size: subtype == FormatSubtype::FrameBased && block.u8(27)? != 0,
        ..Default::default()
    })
}

fn parse_mjpeg_format(block: Block<'_>) -> Result<FormatDesc> {
    Ok(FormatDesc {
        subtype: FormatSubtype::Mjpeg,
        index: block.u8(3)?,
        guid: MJPEG_GUID,
        flags: block.u8(5)?,
        default_frame_index: block.u8(6)?,
        aspect_ratio_x: block.u8(7)?,
        aspect_ratio_y: block.u8(8)?,
        interlace_flags: block.u8(9)?,
        copy_protect: block.u8(10)?,
        ..Default::default()
    })
}

fn parse_intervals(block: Block<'_>, interval_type: u8) -> Result<FrameIntervals> {
    if interval_type == 0 {
        return Ok(FrameIntervals::Continuous {
            min: block.u32(26)?,
            max: block.u32(30)?,
            step: block.u32(34)?,
        });
    }
    (0..interval_type as usize)
        .map(|i| block.u32(26 + 4 * i))
        .collect::<Result<Vec<_>>>()
        .map(FrameIntervals::Discrete)
}

fn parse_frame(format: &FormatDesc, block: Block<'_>) -> Result<FrameDesc> {
    let mut frame = FrameDesc {
        index: block.u8(3)?,
        capabilities: block.u8(4)?,
        width: block.u16(5)?,
        height: block.u16(7)?,
        min_bit_rate: block.u32(9)?,
        max_bit_rate: block.u32(13)?,
        ..Default::default()
    };

    if block.subtype() == VS_FRAME_FRAME_BASED {
        frame.default_frame_interval = block.u32(17)?;
        frame.bytes_per_line = block.u32(22)?;
        frame.intervals = parse_intervals(block, block.u8(21)?)?;
    } else {
        frame.max_video_frame_buffer_size = block.u32(17)?;
        frame.default_frame_interval = block.u32(21)?;
        frame.intervals = parse_intervals(block, block.u8(25)?)?;
    }

    if frame.max_video_frame_buffer_size == 0
        && matches!(
            format.subtype,
            FormatSubtype::Uncompressed | FormatSubtype::FrameBased
        )
    {
        frame.max_video_frame_buffer_size = (format.bits_per_pixel as u32)
            .saturating_mul(frame.width as u32)
            .saturating_mul(frame.height as u32)
            / 8;
    }
    Ok(frame)
}

fn parse_still_frame(block: Block<'_>) -> Result<StillFrameDesc> {
    let patterns = block.u8(4)? as usize;
    let sizes = (0..patterns)
        .map(|i| Ok((block.u16(5 + 4 * i)?, block.u16(7 + 4 * i)?)))
        .collect::<Result<Vec<_>>>()?;
    let compression_at = 5 + 4 * patterns;
    let compression = match block.u8(compression_at) {
        Ok(count) => block.bytes(compression_at + 1, count as usize)?.to_vec(),
        Err(_) => Vec::new(),
    };
    Ok(StillFrameDesc {
        endpoint_address: block.u8(3)?,
        sizes,
        compression,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::descriptors::*;

    #[test]
    fn test_control_mask_is_lsb_first() {
        assert_eq!(control_mask(&[0x0a, 0x00, 0x02]), 0x02000a);
        assert_eq!(control_mask(&[]), 0);
    }

    #[test]
    fn test_zero_length_block_is_invalid() {
        let extra = [0u8, 0x24, 0x01, 0x00];
        let result: Result<Vec<_>> = blocks(&extra).collect();
        assert_eq!(result.unwrap_err(), Error::InvalidDevice);
    }

    #[test]
    fn test_block_past_end_is_invalid() {
        let extra = [9u8, 0x24, 0x01, 0x00];
        let result: Result<Vec<_>> = blocks(&extra).collect();
        assert_eq!(result.unwrap_err(), Error::InvalidDevice);
    }

    #[test]
    fn test_trailing_bytes_end_walk() {
        let extra = [3u8, 0x24, 0x99, 0x00, 0x00];
        assert_eq!(blocks(&extra).count(), 1);
    }

    #[test]
    fn test_vc_header_collection() {
        let mut control = ControlInterface::default();
        let extra = vc_header(0x0110, &[1, 2]);
        let streaming = parse_control_blocks(&mut control, &extra).unwrap();
        assert_eq!(streaming, vec![1, 2]);
        assert_eq!(control.bcd_uvc, 0x0110);
        assert_eq!(control.clock_frequency, 0);
    }

    #[test]
    fn test_vc_header_clock_for_uvc_10() {
        let mut control = ControlInterface::default();
        let extra = vc_header(0x0100, &[1]);
        parse_control_blocks(&mut control, &extra).unwrap();
        assert_eq!(control.clock_frequency, 48_000_000);
    }

    #[test]
    fn test_unsupported_version() {
        let mut control = ControlInterface::default();
        let extra = vc_header(0x0200, &[1]);
        assert_eq!(
            parse_control_blocks(&mut control, &extra).unwrap_err(),
            Error::NotSupported
        );
    }

    #[test]
    fn test_unit_before_header_is_invalid() {
        let mut control = ControlInterface::default();
        let extra = processing_unit(2, 1, &[0x7f, 0x15]);
        assert_eq!(
            parse_control_blocks(&mut control, &extra).unwrap_err(),
            Error::InvalidDevice
        );
    }

    #[test]
    fn test_entities() {
        let mut control = ControlInterface {
            interface_number: 0,
            ..Default::default()
        };
        let mut extra = vc_header(0x0110, &[1]);
        extra.extend(camera_terminal(1, &[0x0a, 0x00, 0x02]));
        extra.extend(input_terminal_of_type(7, 0x0401));
        extra.extend(processing_unit(2, 1, &[0x7f, 0x15]));
        extra.extend(selector_unit(4, &[1, 2]));
        extra.extend(extension_unit(3, 2, &[0xff, 0x01]));
        extra.extend(output_terminal(5, 0x0302, 3));
        extra.extend(output_terminal(6, 0x0101, 3));
        parse_control_blocks(&mut control, &extra).unwrap();

        assert_eq!(control.input_terminals.len(), 1);
        let camera = &control.input_terminals[0];
        assert_eq!(camera.id, 1);
        assert_eq!(camera.controls, 0x02000a);
        assert_eq!(camera.request, 0x0100);

        let pu = &control.processing_units[0];
        assert_eq!((pu.id, pu.source_id), (2, 1));
        assert_eq!(pu.controls, 0x157f);
        assert_eq!(pu.max_multiplier, 0x4000);

        let su = &control.selector_units[0];
        assert_eq!(su.source_ids, vec![1, 2]);

        let xu = &control.extension_units[0];
        assert_eq!(xu.id, 3);
        assert_eq!(xu.source_ids, vec![2]);
        assert_eq!(xu.controls, 0x01ff);
        assert_eq!(xu.guid[0], 0xa5);
        assert_eq!(xu.request, 0x0300);

        assert_eq!(control.output_terminals.len(), 1);
        assert_eq!(control.output_terminals[0].source_id, 3);
    }

    #[test]
    fn test_discrete_frame() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 1);
        extra.extend(uncompressed_format(1, b"YUY2", 16, 1));
        extra.extend(uncompressed_frame(1, 640, 480, 0, &[333_333, 666_666]));
        parse_streaming_blocks(&mut stream, &extra).unwrap();

        assert_eq!(stream.endpoint_address, 0x81);
        assert_eq!(stream.terminal_link, 3);
        let format = &stream.formats[0];
        assert_eq!(format.fourcc(), *b"YUY2");
        assert_eq!(format.bits_per_pixel, 16);
        let frame = &format.frames[0];
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(
            frame.intervals,
            FrameIntervals::Discrete(vec![333_333, 666_666])
        );
        // 16 bpp × 640 × 480 / 8
        assert_eq!(frame.max_video_frame_buffer_size, 614_400);
    }

    #[test]
    fn test_reported_buffer_size_is_kept() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 1);
        extra.extend(uncompressed_format(1, b"YUY2", 16, 1));
        extra.extend(uncompressed_frame(1, 640, 480, 1000, &[333_333]));
        parse_streaming_blocks(&mut stream, &extra).unwrap();
        assert_eq!(stream.formats[0].frames[0].max_video_frame_buffer_size, 1000);
    }

    #[test]
    fn test_continuous_frame() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 1);
        extra.extend(mjpeg_format(1));
        extra.extend(continuous_frame(1, 1280, 720, 333_333, 1_000_000, 333_333));
        parse_streaming_blocks(&mut stream, &extra).unwrap();

        let format = &stream.formats[0];
        assert_eq!(format.subtype, FormatSubtype::Mjpeg);
        assert_eq!(format.guid, MJPEG_GUID);
        assert_eq!(
            format.frames[0].intervals,
            FrameIntervals::Continuous {
                min: 333_333,
                max: 1_000_000,
                step: 333_333
            }
        );
        // MJPEG frames never get a computed buffer size
        assert_eq!(format.frames[0].max_video_frame_buffer_size, 0);
    }

    #[test]
    fn test_frame_based_frame_offsets() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 1);
        extra.extend(frame_based_format(1, b"H264", 12));
        extra.extend(frame_based_frame(1, 320, 240, 400_000, 320, &[400_000]));
        parse_streaming_blocks(&mut stream, &extra).unwrap();

        let format = &stream.formats[0];
        assert_eq!(format.subtype, FormatSubtype::FrameBased);
        assert!(format.variable_size);
        let frame = &format.frames[0];
        assert_eq!(frame.default_frame_interval, 400_000);
        assert_eq!(frame.bytes_per_line, 320);
        assert_eq!(frame.intervals, FrameIntervals::Discrete(vec![400_000]));
        assert_eq!(frame.max_video_frame_buffer_size, 12 * 320 * 240 / 8);
    }

    #[test]
    fn test_still_and_color_attach_to_latest_format() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 2);
        extra.extend(uncompressed_format(1, b"YUY2", 16, 1));
        extra.extend(mjpeg_format(2));
        extra.extend(still_frame(&[(640, 480), (320, 240)], &[1]));
        extra.extend(color_matching(1, 1, 4));
        parse_streaming_blocks(&mut stream, &extra).unwrap();

        assert!(stream.formats[0].still_frames.is_empty());
        let mjpeg = &stream.formats[1];
        assert_eq!(mjpeg.still_frames[0].sizes, vec![(640, 480), (320, 240)]);
        assert_eq!(mjpeg.still_frames[0].compression, vec![1]);
        assert_eq!(mjpeg.color.unwrap().matrix_coefficients, 4);
    }

    #[test]
    fn test_frame_before_format_is_invalid() {
        let mut stream = StreamingInterface::default();
        let extra = uncompressed_frame(1, 640, 480, 0, &[333_333]);
        assert_eq!(
            parse_streaming_blocks(&mut stream, &extra).unwrap_err(),
            Error::InvalidDevice
        );
    }

    #[test]
    fn test_truncated_interval_list_is_invalid() {
        let mut stream = StreamingInterface::default();
        let mut extra = input_header(0x81, 1);
        extra.extend(uncompressed_format(1, b"YUY2", 16, 1));
        let mut frame = uncompressed_frame(1, 640, 480, 0, &[333_333, 666_666]);
        // claim three intervals while carrying two
        frame[25] = 3;
        extra.extend(frame);
        assert_eq!(
            parse_streaming_blocks(&mut stream, &extra).unwrap_err(),
            Error::InvalidDevice
        );
    }
}
