//! In-memory model of a UVC device's class-specific descriptors.
//!
//! Built once when a device is opened and never mutated afterwards.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::FrameFormat;

/// Everything the descriptor parser learned about a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub control: ControlInterface,
    /// Streaming interfaces in the order the control header lists them.
    pub streaming: Vec<StreamingInterface>,
}

impl DeviceInfo {
    pub fn streaming_interface(&self, interface_number: u8) -> Option<&StreamingInterface> {
        self.streaming
            .iter()
            .find(|stream| stream.interface_number == interface_number)
    }

    /// Find a format and frame by their 1-based indices on one interface.
    pub fn find_frame(
        &self,
        interface_number: u8,
        format_index: u8,
        frame_index: u8,
    ) -> Option<(&FormatDesc, &FrameDesc)> {
        let format = self
            .streaming_interface(interface_number)?
            .format(format_index)?;
        let frame = format.frame(frame_index)?;
        Some((format, frame))
    }
}

/// The Video-Control interface and its entity graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ControlInterface {
    pub interface_number: u8,
    /// UVC release in BCD, e.g. 0x0110.
    pub bcd_uvc: u16,
    /// Device clock in Hz; only reported by UVC 1.0 and 1.0a devices.
    pub clock_frequency: u32,
    /// Interrupt endpoint carrying status packets.
    pub status_endpoint: Option<u8>,
    pub input_terminals: Vec<InputTerminal>,
    pub output_terminals: Vec<OutputTerminal>,
    pub selector_units: Vec<SelectorUnit>,
    pub processing_units: Vec<ProcessingUnit>,
    pub extension_units: Vec<ExtensionUnit>,
}

impl ControlInterface {
    /// Entity request word: `id << 8 | interface number`.
    pub fn entity_request(&self, id: u8) -> u16 {
        (id as u16) << 8 | self.interface_number as u16
    }
}

/// A camera input terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InputTerminal {
    /// bTerminalID.
    pub id: u8,
    /// wTerminalType, 0x0201 for a camera sensor.
    pub terminal_type: u16,
    /// Associated output terminal, 0 if none.
    pub assoc_terminal: u8,
    /// iTerminal string descriptor index.
    pub string_index: u8,
    /// wObjectiveFocalLengthMin.
    pub objective_focal_length_min: u16,
    /// wObjectiveFocalLengthMax.
    pub objective_focal_length_max: u16,
    /// wOcularFocalLength.
    pub ocular_focal_length: u16,
    /// bmControls, least significant byte first.
    pub controls: u64,
    /// Entity request word used as wIndex for this terminal's controls.
    pub request: u16,
}

/// A display output terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputTerminal {
    pub id: u8,
    pub terminal_type: u16,
    pub assoc_terminal: u8,
    pub source_id: u8,
    pub string_index: u8,
    pub request: u16,
}

/// A selector unit switching between input pins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectorUnit {
    /// bUnitID.
    pub id: u8,
    /// baSourceID, one entry per input pin.
    pub source_ids: Vec<u8>,
    /// iSelector string descriptor index.
    pub string_index: u8,
    /// Entity request word used as wIndex.
    pub request: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessingUnit {
    /// bUnitID.
    pub id: u8,
    /// bSourceID.
    pub source_id: u8,
    /// wMaxMultiplier for digital zoom, times 100.
    pub max_multiplier: u16,
    /// bmControls, least significant byte first.
    pub controls: u64,
    /// iProcessing string descriptor index.
    pub string_index: u8,
    /// bmVideoStandards, UVC 1.1 and later.
    pub video_standards: u8,
    /// Entity request word used as wIndex.
    pub request: u16,
}

/// A vendor extension unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtensionUnit {
    /// bUnitID.
    pub id: u8,
    /// guidExtensionCode identifying the vendor protocol.
    pub guid: [u8; 16],
    /// bNumControls.
    pub num_controls: u8,
    /// baSourceID, one entry per input pin.
    pub source_ids: Vec<u8>,
    /// bmControls, least significant byte first.
    pub controls: u64,
    /// iExtension string descriptor index.
    pub string_index: u8,
    /// Entity request word used as wIndex.
    pub request: u16,
}

/// One Video-Streaming interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamingInterface {
    pub interface_number: u8,
    pub endpoint_address: u8,
    /// bmInfo from the input header.
    pub info_flags: u8,
    pub terminal_link: u8,
    pub still_capture_method: u8,
    pub trigger_support: u8,
    pub trigger_usage: u8,
    pub formats: Vec<FormatDesc>,
}

impl StreamingInterface {
    pub fn format(&self, index: u8) -> Option<&FormatDesc> {
        self.formats.iter().find(|format| format.index == index)
    }
}

/// Format descriptor subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FormatSubtype {
    #[default]
    Uncompressed,
    Mjpeg,
    FrameBased,
}

/// A format descriptor with its frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FormatDesc {
    /// Which VS_FORMAT_* block this came from.
    pub subtype: FormatSubtype,
    /// bFormatIndex, 1-based.
    pub index: u8,
    /// guidFormat; synthesized as "MJPG" for MJPEG formats.
    pub guid: [u8; 16],
    /// bBitsPerPixel, 0 for MJPEG.
    pub bits_per_pixel: u8,
    /// bDefaultFrameIndex.
    pub default_frame_index: u8,
    /// bAspectRatioX.
    pub aspect_ratio_x: u8,
    /// bAspectRatioY.
    pub aspect_ratio_y: u8,
    /// bmInterlaceFlags.
    pub interlace_flags: u8,
    /// bCopyProtect.
    pub copy_protect: u8,
    /// bmFlags of MJPEG formats.
    pub flags: u8,
    /// bVariableSize of frame-based formats.
    pub variable_size: bool,
    /// Color matching block following the frames, if any.
    pub color: Option<ColorMatching>,
    /// Frame descriptors in descriptor order.
    pub frames: Vec<FrameDesc>,
    /// Still image frame descriptors.
    pub still_frames: Vec<StillFrameDesc>,
}

impl FormatDesc {
    pub fn frame(&self, index: u8) -> Option<&FrameDesc> {
        self.frames.iter().find(|frame| frame.index == index)
    }

    /// The first four GUID bytes, which spell the FourCC for most formats.
    pub fn fourcc(&self) -> [u8; 4] {
        [self.guid[0], self.guid[1], self.guid[2], self.guid[3]]
    }

    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::from_guid(&self.guid)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ColorMatching {
    pub primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

/// A still image frame descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StillFrameDesc {
    /// bEndpointAddress for method 3 still capture, 0 otherwise.
    pub endpoint_address: u8,
    /// (width, height) patterns.
    pub sizes: Vec<(u16, u16)>,
    /// bCompression values.
    pub compression: Vec<u8>,
}

/// Frame intervals supported by a frame descriptor, in 100 ns units.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrameIntervals {
    Continuous { min: u32, max: u32, step: u32 },
    Discrete(Vec<u32>),
}

impl Default for FrameIntervals {
    fn default() -> Self {
        FrameIntervals::Discrete(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameDesc {
    pub index: u8,
    pub capabilities: u8,
    pub width: u16,
    pub height: u16,
    pub min_bit_rate: u32,
    pub max_bit_rate: u32,
    pub max_video_frame_buffer_size: u32,
    pub default_frame_interval: u32,
    /// dwBytesPerLine of frame-based frames, 0 otherwise.
    pub bytes_per_line: u32,
    pub intervals: FrameIntervals,
}

impl FrameDesc {
    /// The discrete interval list followed by a 0 terminator, for consumers
    /// that expect that layout. `None` for continuous frames.
    pub fn intervals_zero_terminated(&self) -> Option<Vec<u32>> {
        match &self.intervals {
            FrameIntervals::Discrete(list) => {
                let mut out = list.clone();
                out.push(0);
                Some(out)
            }
            FrameIntervals::Continuous { .. } => None,
        }
    }
}
