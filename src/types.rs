//! Shared types for UVC streaming.
//!
//! Frame formats and their GUIDs, stream configuration, poll timeouts and the
//! delivered [`Frame`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Number of transfer buffers in a stream's pool.
pub const NUM_TRANSFER_BUFS: usize = 4;

/// Upper bound on isochronous packets per transfer.
pub const MAX_ISO_PACKETS: usize = 32;

/// Tail shared by the Microsoft-registered FourCC GUIDs.
const GUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
];

const fn fourcc_guid(code: [u8; 4]) -> [u8; 16] {
    let mut guid = [0u8; 16];
    let mut i = 0;
    while i < 4 {
        guid[i] = code[i];
        i += 1;
    }
    while i < 16 {
        guid[i] = GUID_SUFFIX[i - 4];
        i += 1;
    }
    guid
}

/// GUID used for MJPEG formats: "MJPG" followed by zeros.
pub const MJPEG_GUID: [u8; 16] = [b'M', b'J', b'P', b'G', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

// =============================================================================
// Frame formats
// =============================================================================

/// Pixel format of a stream or frame.
///
/// `Any`, `Uncompressed` and `Compressed` are abstract: they match every
/// concrete format beneath them when selecting a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrameFormat {
    #[default]
    Unknown,
    Any,
    Uncompressed,
    Compressed,
    Yuyv,
    Uyvy,
    Gray8,
    Gray16,
    Nv12,
    P010,
    By8,
    Ba81,
    Sgrbg8,
    Sgbrg8,
    Srggb8,
    Sbggr8,
    Mjpeg,
    H264,
}

impl FrameFormat {
    const CONCRETE: [FrameFormat; 14] = [
        FrameFormat::Yuyv,
        FrameFormat::Uyvy,
        FrameFormat::Gray8,
        FrameFormat::Gray16,
        FrameFormat::Nv12,
        FrameFormat::P010,
        FrameFormat::By8,
        FrameFormat::Ba81,
        FrameFormat::Sgrbg8,
        FrameFormat::Sgbrg8,
        FrameFormat::Srggb8,
        FrameFormat::Sbggr8,
        FrameFormat::Mjpeg,
        FrameFormat::H264,
    ];

    /// The GUID a format descriptor carries for this format.
    pub fn guid(self) -> Option<[u8; 16]> {
        let guid = match self {
            FrameFormat::Yuyv => fourcc_guid(*b"YUY2"),
            FrameFormat::Uyvy => fourcc_guid(*b"UYVY"),
            FrameFormat::Gray8 => fourcc_guid(*b"Y800"),
            FrameFormat::Gray16 => fourcc_guid(*b"Y16 "),
            FrameFormat::Nv12 => fourcc_guid(*b"NV12"),
            FrameFormat::P010 => fourcc_guid(*b"P010"),
            FrameFormat::By8 => fourcc_guid(*b"BY8 "),
            FrameFormat::Ba81 => fourcc_guid(*b"BA81"),
            FrameFormat::Sgrbg8 => fourcc_guid(*b"GRBG"),
            FrameFormat::Sgbrg8 => fourcc_guid(*b"GBRG"),
            FrameFormat::Srggb8 => fourcc_guid(*b"RGGB"),
            FrameFormat::Sbggr8 => fourcc_guid(*b"BGGR"),
            FrameFormat::Mjpeg => MJPEG_GUID,
            FrameFormat::H264 => fourcc_guid(*b"H264"),
            _ => return None,
        };
        Some(guid)
    }

    /// Map a descriptor GUID to its concrete format, or `Unknown`.
    pub fn from_guid(guid: &[u8; 16]) -> FrameFormat {
        Self::CONCRETE
            .into_iter()
            .find(|format| format.guid().as_ref() == Some(guid))
            .unwrap_or(FrameFormat::Unknown)
    }

    fn children(self) -> &'static [FrameFormat] {
        match self {
            FrameFormat::Any => &[FrameFormat::Uncompressed, FrameFormat::Compressed],
            FrameFormat::Uncompressed => &[
                FrameFormat::Yuyv,
                FrameFormat::Uyvy,
                FrameFormat::Gray8,
                FrameFormat::Gray16,
                FrameFormat::Nv12,
                FrameFormat::P010,
                FrameFormat::By8,
                FrameFormat::Ba81,
                FrameFormat::Sgrbg8,
                FrameFormat::Sgbrg8,
                FrameFormat::Srggb8,
                FrameFormat::Sbggr8,
            ],
            FrameFormat::Compressed => &[FrameFormat::Mjpeg, FrameFormat::H264],
            _ => &[],
        }
    }

    /// Whether a format descriptor with `guid` satisfies a request for `self`.
    pub fn matches_guid(self, guid: &[u8; 16]) -> bool {
        if self.guid().as_ref() == Some(guid) {
            return true;
        }
        self.children().iter().any(|child| child.matches_guid(guid))
    }

    /// Bytes per row for packed formats, 0 when rows are not meaningful.
    pub fn step(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            FrameFormat::Yuyv | FrameFormat::Uyvy | FrameFormat::Gray16 | FrameFormat::P010 => {
                width * 2
            }
            FrameFormat::Gray8
            | FrameFormat::Nv12
            | FrameFormat::By8
            | FrameFormat::Ba81
            | FrameFormat::Sgrbg8
            | FrameFormat::Sgbrg8
            | FrameFormat::Srggb8
            | FrameFormat::Sbggr8 => width,
            _ => 0,
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameFormat::Unknown => "unknown",
            FrameFormat::Any => "any",
            FrameFormat::Uncompressed => "uncompressed",
            FrameFormat::Compressed => "compressed",
            FrameFormat::Yuyv => "YUYV",
            FrameFormat::Uyvy => "UYVY",
            FrameFormat::Gray8 => "GRAY8",
            FrameFormat::Gray16 => "GRAY16",
            FrameFormat::Nv12 => "NV12",
            FrameFormat::P010 => "P010",
            FrameFormat::By8 => "BY8",
            FrameFormat::Ba81 => "BA81",
            FrameFormat::Sgrbg8 => "SGRBG8",
            FrameFormat::Sgbrg8 => "SGBRG8",
            FrameFormat::Srggb8 => "SRGGB8",
            FrameFormat::Sbggr8 => "SBGGR8",
            FrameFormat::Mjpeg => "MJPEG",
            FrameFormat::H264 => "H264",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Stream configuration
// =============================================================================

/// What to do with a frame cut short by a FID toggle or PTS change before EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IncompleteFramePolicy {
    /// Publish it with `complete == false`.
    #[default]
    Deliver,
    /// Discard it. Its sequence number is consumed and consumers are not woken.
    Drop,
}

/// Configuration for starting a stream.
///
/// The negotiated [`StreamCtrl`](crate::StreamCtrl) decides format and
/// bandwidth; this only tunes how the host side runs the transfer pool.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamConfig {
    /// Handling of frames that end without EOF (default: deliver).
    pub incomplete_frames: IncompleteFramePolicy,

    /// Fraction of the negotiated payload size used to pick an isochronous
    /// alternate setting, in (0, 1] (default: 1.0).
    pub bandwidth_factor: f32,

    /// Timeout applied to each streaming transfer (default: 5s).
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub transfer_timeout: Duration,

    /// Number of transfers kept in flight (default: 4).
    pub transfer_buffers: usize,
}

#[cfg(feature = "serde")]
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis().min(u64::MAX as u128) as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            incomplete_frames: IncompleteFramePolicy::default(),
            bandwidth_factor: 1.0,
            transfer_timeout: Duration::from_secs(5),
            transfer_buffers: NUM_TRANSFER_BUFS,
        }
    }
}

impl StreamConfig {
    /// Set the incomplete-frame policy (builder pattern).
    pub fn with_incomplete_frames(mut self, policy: IncompleteFramePolicy) -> Self {
        self.incomplete_frames = policy;
        self
    }

    /// Set the isochronous bandwidth factor (builder pattern).
    ///
    /// Values below 1.0 let the stream pick a smaller alternate setting than
    /// the device asked for, which helps on shared buses.
    pub fn with_bandwidth_factor(mut self, factor: f32) -> Self {
        self.bandwidth_factor = factor;
        self
    }

    /// Set the per-transfer timeout (builder pattern).
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the number of in-flight transfers (builder pattern).
    pub fn with_transfer_buffers(mut self, count: usize) -> Self {
        self.transfer_buffers = count;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.bandwidth_factor > 0.0 && self.bandwidth_factor <= 1.0) {
            return Err(crate::Error::InvalidParam);
        }
        if self.transfer_buffers == 0 {
            return Err(crate::Error::InvalidParam);
        }
        Ok(())
    }
}

/// How long [`StreamHandle::get_frame`](crate::StreamHandle::get_frame) waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Block until a frame arrives or the stream stops.
    Forever,
    /// Return immediately.
    NoWait,
    /// Block for at most this long, then fail with `Timeout`.
    Within(Duration),
}

impl From<i32> for PollTimeout {
    /// 0 waits forever, a negative value does not wait, a positive value is
    /// a timeout in microseconds.
    fn from(micros: i32) -> Self {
        match micros {
            0 => PollTimeout::Forever,
            m if m < 0 => PollTimeout::NoWait,
            m => PollTimeout::Within(Duration::from_micros(m as u64)),
        }
    }
}

impl From<Duration> for PollTimeout {
    fn from(timeout: Duration) -> Self {
        PollTimeout::Within(timeout)
    }
}

// =============================================================================
// Frames and devices
// =============================================================================

/// A reassembled video frame.
///
/// `data` is the allocated buffer; only the first `data_bytes` bytes hold
/// image data.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub data_bytes: usize,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    /// Bytes per row, 0 for compressed formats.
    pub step: usize,
    /// Strictly increasing within a stream.
    pub sequence: u32,
    /// When the frame was published on the host.
    pub capture_time: Option<Instant>,
    /// Presentation time stamp from the payload header.
    pub pts: u32,
    /// Source clock reference from the payload header.
    pub scr: u32,
    /// False when the frame ended without EOF.
    pub complete: bool,
    /// True when the device flagged an error or the frame overflowed.
    pub error: bool,
}

impl Frame {
    /// The received image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.data_bytes.min(self.data.len())]
    }
}

/// Identity of a UVC device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdUVC from the control interface header, 0 if unknown.
    pub bcd_uvc: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(product) = &self.product {
            write!(f, " {product}")?;
        }
        if let Some(serial) = &self.serial_number {
            write!(f, " ({serial})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_guid_layout() {
        let guid = FrameFormat::Yuyv.guid().unwrap();
        assert_eq!(&guid[..4], b"YUY2");
        assert_eq!(&guid[4..], &GUID_SUFFIX);
        assert_eq!(FrameFormat::from_guid(&guid), FrameFormat::Yuyv);
    }

    #[test]
    fn test_mjpeg_guid_is_zero_padded() {
        assert_eq!(FrameFormat::from_guid(&MJPEG_GUID), FrameFormat::Mjpeg);
        assert!(MJPEG_GUID[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_abstract_formats_match_children() {
        let yuyv = FrameFormat::Yuyv.guid().unwrap();
        assert!(FrameFormat::Any.matches_guid(&yuyv));
        assert!(FrameFormat::Uncompressed.matches_guid(&yuyv));
        assert!(!FrameFormat::Compressed.matches_guid(&yuyv));
        assert!(FrameFormat::Compressed.matches_guid(&MJPEG_GUID));
        assert!(!FrameFormat::Yuyv.matches_guid(&MJPEG_GUID));
        assert!(!FrameFormat::Unknown.matches_guid(&[0u8; 16]));
    }

    #[test]
    fn test_unknown_guid() {
        assert_eq!(FrameFormat::from_guid(&[0xff; 16]), FrameFormat::Unknown);
    }

    #[test]
    fn test_step() {
        assert_eq!(FrameFormat::Yuyv.step(640), 1280);
        assert_eq!(FrameFormat::Gray8.step(640), 640);
        assert_eq!(FrameFormat::Mjpeg.step(640), 0);
    }

    #[test]
    fn test_poll_timeout_from_micros() {
        assert_eq!(PollTimeout::from(0), PollTimeout::Forever);
        assert_eq!(PollTimeout::from(-1), PollTimeout::NoWait);
        assert_eq!(
            PollTimeout::from(1500),
            PollTimeout::Within(Duration::from_micros(1500))
        );
    }

    #[test]
    fn test_stream_config_validate() {
        assert!(StreamConfig::default().validate().is_ok());
        assert!(StreamConfig::default()
            .with_bandwidth_factor(0.0)
            .validate()
            .is_err());
        assert!(StreamConfig::default()
            .with_bandwidth_factor(1.5)
            .validate()
            .is_err());
        assert!(StreamConfig::default()
            .with_transfer_buffers(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_frame_bytes_clamped() {
        let frame = Frame {
            data: vec![1, 2, 3, 4],
            data_bytes: 2,
            ..Frame::default()
        };
        assert_eq!(frame.bytes(), &[1, 2]);
    }

    // ==========================================================================
    // StreamConfig Serde Tests
    // ==========================================================================

    #[cfg(feature = "serde")]
    #[test]
    fn test_stream_config_serde_roundtrip() {
        let config = StreamConfig::default()
            .with_incomplete_frames(IncompleteFramePolicy::Drop)
            .with_bandwidth_factor(0.5)
            .with_transfer_timeout(Duration::from_millis(2500))
            .with_transfer_buffers(6);

        let json = serde_json::to_string(&config).expect("serialize to JSON");
        let restored: StreamConfig = serde_json::from_str(&json).expect("deserialize from JSON");

        assert_eq!(restored, config);
    }
}
