//! UVC descriptor parsing.
//!
//! [`parse_device_info`] locates the Video-Control interface in a device's
//! configuration, walks its class-specific blocks and then those of every
//! streaming interface the control header names.

pub mod codec;
pub mod model;

pub use model::*;

use log::debug;

use crate::error::{Error, Result};
use crate::usb::{AltSetting, ConfigInfo, UsbDeviceDescriptor};

/// bDescriptorType of class-specific interface descriptors.
pub const CS_INTERFACE: u8 = 0x24;

/// USB video class code.
pub const CC_VIDEO: u8 = 0x0e;
/// Vendor-specific class code.
pub const CC_VENDOR_SPEC: u8 = 0xff;
pub const SC_VIDEOCONTROL: u8 = 0x01;
pub const SC_VIDEOSTREAMING: u8 = 0x02;

// Video Control subtypes
pub const VC_HEADER: u8 = 0x01;
pub const VC_INPUT_TERMINAL: u8 = 0x02;
pub const VC_OUTPUT_TERMINAL: u8 = 0x03;
pub const VC_SELECTOR_UNIT: u8 = 0x04;
pub const VC_PROCESSING_UNIT: u8 = 0x05;
pub const VC_EXTENSION_UNIT: u8 = 0x06;

// Video Streaming subtypes
pub const VS_INPUT_HEADER: u8 = 0x01;
pub const VS_STILL_IMAGE_FRAME: u8 = 0x03;
pub const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
pub const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
pub const VS_FORMAT_MJPEG: u8 = 0x06;
pub const VS_FRAME_MJPEG: u8 = 0x07;
pub const VS_COLORFORMAT: u8 = 0x0d;
pub const VS_FORMAT_FRAME_BASED: u8 = 0x10;
pub const VS_FRAME_FRAME_BASED: u8 = 0x11;

/// Camera sensor input terminal.
pub const ITT_CAMERA: u16 = 0x0201;
/// Display output terminal.
pub const OTT_DISPLAY: u16 = 0x0302;

/// UVC releases this driver understands.
pub const UVC_VERSIONS: [u16; 4] = [0x0100, 0x010a, 0x0110, 0x0150];

/// Devices that use vendor class codes but speak UVC.
const VENDOR_CLASS_UVC: (u16, u16) = (0x199e, 0x8101);
/// Same vendor; these product IDs are not UVC despite their class codes.
const EXCLUDED_VENDOR: u16 = 0x199e;
const EXCLUDED_PRODUCTS: std::ops::RangeInclusive<u16> = 0x8201..=0x8208;

fn uses_vendor_class(desc: &UsbDeviceDescriptor) -> bool {
    (desc.vendor_id, desc.product_id) == VENDOR_CLASS_UVC
}

fn video_class(desc: &UsbDeviceDescriptor) -> u8 {
    if uses_vendor_class(desc) {
        CC_VENDOR_SPEC
    } else {
        CC_VIDEO
    }
}

/// Whether a device exposes a Video-Streaming interface and should be listed.
pub fn is_uvc_device(desc: &UsbDeviceDescriptor, config: &ConfigInfo) -> bool {
    if desc.vendor_id == EXCLUDED_VENDOR && EXCLUDED_PRODUCTS.contains(&desc.product_id) {
        return false;
    }
    let class = video_class(desc);
    config.interfaces.iter().any(|iface| {
        iface
            .alt_settings
            .iter()
            .any(|alt| alt.class_code == class && alt.subclass_code == SC_VIDEOSTREAMING)
    })
}

/// Class-specific bytes of an alternate setting, falling back to the first
/// endpoint carrying extra bytes when the interface itself has none.
fn class_specific_bytes(alt: &AltSetting) -> &[u8] {
    if !alt.extra.is_empty() {
        return &alt.extra;
    }
    alt.endpoints
        .iter()
        .map(|ep| ep.extra.as_slice())
        .find(|extra| !extra.is_empty())
        .unwrap_or(&[])
}

/// Build the device model from a device's configuration.
pub fn parse_device_info(desc: &UsbDeviceDescriptor, config: &ConfigInfo) -> Result<DeviceInfo> {
    let class = video_class(desc);
    let (interface_number, alt) = config
        .interfaces
        .iter()
        .find_map(|iface| {
            iface
                .alt_settings
                .first()
                .filter(|alt| alt.class_code == class && alt.subclass_code == SC_VIDEOCONTROL)
                .map(|alt| (iface.number, alt))
        })
        .ok_or_else(|| {
            debug!(
                "{:04x}:{:04x} has no video control interface",
                desc.vendor_id, desc.product_id
            );
            Error::InvalidDevice
        })?;

    let mut info = DeviceInfo::default();
    info.control.interface_number = interface_number;
    info.control.status_endpoint = alt.endpoints.first().map(|ep| ep.address);

    let streaming = codec::parse_control_blocks(&mut info.control, class_specific_bytes(alt))?;
    if info.control.bcd_uvc == 0 {
        debug!("video control interface has no header");
        return Err(Error::InvalidDevice);
    }

    for number in streaming {
        let alt = config
            .interface(number)
            .and_then(|iface| iface.alt_settings.first())
            .ok_or_else(|| {
                debug!("streaming interface {number} listed in header but missing");
                Error::InvalidDevice
            })?;
        let mut stream = StreamingInterface {
            interface_number: number,
            ..Default::default()
        };
        codec::parse_streaming_blocks(&mut stream, class_specific_bytes(alt))?;
        info.streaming.push(stream);
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::descriptors::{self, CameraLayout};
    use crate::usb::{InterfaceInfo, UsbDeviceDescriptor};

    fn camera_descriptor() -> UsbDeviceDescriptor {
        UsbDeviceDescriptor {
            vendor_id: 0x046d,
            product_id: 0x0825,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_camera() {
        let config = descriptors::camera_config(&CameraLayout::default());
        let info = parse_device_info(&camera_descriptor(), &config).unwrap();

        assert_eq!(info.control.interface_number, 0);
        assert_eq!(info.control.status_endpoint, Some(0x83));
        assert_eq!(info.control.input_terminals.len(), 1);
        assert_eq!(info.control.processing_units.len(), 1);
        assert_eq!(info.streaming.len(), 1);

        let stream = &info.streaming[0];
        assert_eq!(stream.interface_number, 1);
        assert_eq!(stream.endpoint_address, 0x81);
        let format = &stream.formats[0];
        assert_eq!(format.frames.len(), 1);
        assert_eq!(
            format.frames[0].intervals,
            FrameIntervals::Discrete(vec![333_333, 666_666])
        );
    }

    #[test]
    fn test_missing_control_interface() {
        let config = ConfigInfo {
            interfaces: vec![InterfaceInfo {
                number: 0,
                alt_settings: vec![AltSetting {
                    class_code: 0x03,
                    ..Default::default()
                }],
            }],
        };
        assert_eq!(
            parse_device_info(&camera_descriptor(), &config).unwrap_err(),
            Error::InvalidDevice
        );
    }

    #[test]
    fn test_header_names_missing_streaming_interface() {
        let mut config = descriptors::camera_config(&CameraLayout::default());
        config.interfaces.retain(|iface| iface.number == 0);
        assert_eq!(
            parse_device_info(&camera_descriptor(), &config).unwrap_err(),
            Error::InvalidDevice
        );
    }

    #[test]
    fn test_endpoint_extra_fallback() {
        let mut config = descriptors::camera_config(&CameraLayout::default());
        let control = &mut config.interfaces[0].alt_settings[0];
        control.endpoints[0].extra = std::mem::take(&mut control.extra);
        let info = parse_device_info(&camera_descriptor(), &config).unwrap();
        assert_eq!(info.control.bcd_uvc, 0x0110);
    }

    #[test]
    fn test_enumeration_filter() {
        let config = descriptors::camera_config(&CameraLayout::default());
        assert!(is_uvc_device(&camera_descriptor(), &config));

        let excluded = UsbDeviceDescriptor {
            vendor_id: 0x199e,
            product_id: 0x8204,
            ..Default::default()
        };
        assert!(!is_uvc_device(&excluded, &config));

        // The vendor-class device only counts with vendor class codes
        let vendor = UsbDeviceDescriptor {
            vendor_id: 0x199e,
            product_id: 0x8101,
            ..Default::default()
        };
        assert!(!is_uvc_device(&vendor, &config));
        let mut vendor_config = config.clone();
        for iface in &mut vendor_config.interfaces {
            for alt in &mut iface.alt_settings {
                alt.class_code = CC_VENDOR_SPEC;
            }
        }
        assert!(is_uvc_device(&vendor, &vendor_config));
        assert!(parse_device_info(&vendor, &vendor_config).is_ok());
    }
}
