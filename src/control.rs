//! Class-specific control requests.
//!
//! Every UVC control is addressed by an entity request word
//! (`entity id << 8 | interface number`) in wIndex and the control selector
//! in the high byte of wValue. A request only succeeds when the device moves
//! exactly the number of bytes the control is defined to carry.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::usb::{UsbHandle, REQ_TYPE_GET, REQ_TYPE_SET};

/// Control transfers block until the device answers.
pub const CONTROL_TIMEOUT: Duration = Duration::ZERO;

/// UVC request codes (bRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

// Video Streaming interface control selectors
pub const VS_PROBE_CONTROL: u8 = 0x01;
pub const VS_COMMIT_CONTROL: u8 = 0x02;
pub const VS_STILL_PROBE_CONTROL: u8 = 0x03;
pub const VS_STILL_COMMIT_CONTROL: u8 = 0x04;
pub const VS_STILL_IMAGE_TRIGGER_CONTROL: u8 = 0x05;
pub const VS_STREAM_ERROR_CODE_CONTROL: u8 = 0x06;

// Video Control interface control selectors
pub const VC_VIDEO_POWER_MODE_CONTROL: u8 = 0x01;
pub const VC_REQUEST_ERROR_CODE_CONTROL: u8 = 0x02;

// =============================================================================
// Gateway
// =============================================================================

/// Issues GET/SET requests on one device.
pub(crate) struct ControlGateway<'a> {
    usb: &'a dyn UsbHandle,
}

impl<'a> ControlGateway<'a> {
    pub(crate) fn new(usb: &'a dyn UsbHandle) -> Self {
        Self { usb }
    }

    /// GET request filling all of `buf`.
    pub(crate) fn get_into(
        &self,
        index: u16,
        selector: u8,
        request: RequestCode,
        buf: &mut [u8],
    ) -> Result<()> {
        let n = self.usb.read_control(
            REQ_TYPE_GET,
            request as u8,
            (selector as u16) << 8,
            index,
            buf,
            CONTROL_TIMEOUT,
        )?;
        if n != buf.len() {
            debug!(
                "short {request:?} on selector {selector:#04x} index {index:#06x}: {n} of {} bytes",
                buf.len()
            );
            return Err(Error::Io);
        }
        Ok(())
    }

    pub(crate) fn get(
        &self,
        index: u16,
        selector: u8,
        request: RequestCode,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.get_into(index, selector, request, &mut buf)?;
        Ok(buf)
    }

    /// SET_CUR with `data`.
    pub(crate) fn set(&self, index: u16, selector: u8, data: &[u8]) -> Result<()> {
        let n = self.usb.write_control(
            REQ_TYPE_SET,
            RequestCode::SetCur as u8,
            (selector as u16) << 8,
            index,
            data,
            CONTROL_TIMEOUT,
        )?;
        if n != data.len() {
            debug!(
                "short SET_CUR on selector {selector:#04x} index {index:#06x}: {n} of {} bytes",
                data.len()
            );
            return Err(Error::Io);
        }
        Ok(())
    }

    pub(crate) fn get_len(&self, index: u16, selector: u8) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.get_into(index, selector, RequestCode::GetLen, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub(crate) fn get_info(&self, index: u16, selector: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_into(index, selector, RequestCode::GetInfo, &mut buf)?;
        Ok(buf[0])
    }

    /// Read VS_STREAM_ERROR_CODE_CONTROL of a streaming interface.
    pub(crate) fn stream_error_code(&self, interface_number: u8) -> Result<StreamErrorCode> {
        let mut buf = [0u8; 1];
        self.get_into(
            interface_number as u16,
            VS_STREAM_ERROR_CODE_CONTROL,
            RequestCode::GetCur,
            &mut buf,
        )?;
        Ok(StreamErrorCode::from(buf[0]))
    }
}

/// Reason reported through VS_STREAM_ERROR_CODE_CONTROL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCode {
    NoError,
    ProtectedContent,
    InputBufferUnderrun,
    DataDiscontinuity,
    OutputBufferUnderrun,
    OutputBufferOverrun,
    FormatChange,
    StillImageCaptureError,
    Unknown(u8),
}

impl From<u8> for StreamErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0 => StreamErrorCode::NoError,
            1 => StreamErrorCode::ProtectedContent,
            2 => StreamErrorCode::InputBufferUnderrun,
            3 => StreamErrorCode::DataDiscontinuity,
            4 => StreamErrorCode::OutputBufferUnderrun,
            5 => StreamErrorCode::OutputBufferOverrun,
            6 => StreamErrorCode::FormatChange,
            7 => StreamErrorCode::StillImageCaptureError,
            other => StreamErrorCode::Unknown(other),
        }
    }
}

// =============================================================================
// Control tables
// =============================================================================

/// Camera terminal controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CameraControl {
    ScanningMode = 0x01,
    AeMode = 0x02,
    AePriority = 0x03,
    ExposureTimeAbsolute = 0x04,
    ExposureTimeRelative = 0x05,
    FocusAbsolute = 0x06,
    FocusRelative = 0x07,
    FocusAuto = 0x08,
    IrisAbsolute = 0x09,
    IrisRelative = 0x0a,
    ZoomAbsolute = 0x0b,
    ZoomRelative = 0x0c,
    PanTiltAbsolute = 0x0d,
    PanTiltRelative = 0x0e,
    RollAbsolute = 0x0f,
    RollRelative = 0x10,
    Privacy = 0x11,
    FocusSimple = 0x12,
}

impl CameraControl {
    pub fn selector(self) -> u8 {
        self as u8
    }

    /// Payload size in bytes.
    pub fn width(self) -> usize {
        use CameraControl::*;
        match self {
            ScanningMode | AeMode | AePriority | ExposureTimeRelative | FocusAuto
            | IrisRelative | Privacy | FocusSimple => 1,
            FocusAbsolute | FocusRelative | IrisAbsolute | ZoomAbsolute | RollAbsolute
            | RollRelative => 2,
            ZoomRelative => 3,
            ExposureTimeAbsolute | PanTiltRelative => 4,
            PanTiltAbsolute => 8,
        }
    }
}

/// Processing unit controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessingControl {
    BacklightCompensation = 0x01,
    Brightness = 0x02,
    Contrast = 0x03,
    Gain = 0x04,
    PowerLineFrequency = 0x05,
    Hue = 0x06,
    Saturation = 0x07,
    Sharpness = 0x08,
    Gamma = 0x09,
    WhiteBalanceTemperature = 0x0a,
    WhiteBalanceTemperatureAuto = 0x0b,
    WhiteBalanceComponent = 0x0c,
    WhiteBalanceComponentAuto = 0x0d,
    DigitalMultiplier = 0x0e,
    DigitalMultiplierLimit = 0x0f,
    HueAuto = 0x10,
    AnalogVideoStandard = 0x11,
    AnalogLockStatus = 0x12,
    ContrastAuto = 0x13,
}

impl ProcessingControl {
    pub fn selector(self) -> u8 {
        self as u8
    }

    /// Payload size in bytes.
    pub fn width(self) -> usize {
        use ProcessingControl::*;
        match self {
            PowerLineFrequency | WhiteBalanceTemperatureAuto | WhiteBalanceComponentAuto
            | HueAuto | AnalogVideoStandard | AnalogLockStatus | ContrastAuto => 1,
            WhiteBalanceComponent => 4,
            _ => 2,
        }
    }
}

// =============================================================================
// Device accessors
// =============================================================================

impl DeviceHandle {
    fn camera_request(&self) -> Result<u16> {
        self.info()
            .control
            .input_terminals
            .first()
            .map(|terminal| terminal.request)
            .ok_or(Error::NotSupported)
    }

    fn processing_request(&self) -> Result<u16> {
        self.info()
            .control
            .processing_units
            .first()
            .map(|unit| unit.request)
            .ok_or(Error::NotSupported)
    }

    /// Query a camera terminal control.
    pub fn camera_control(&self, control: CameraControl, request: RequestCode) -> Result<Vec<u8>> {
        let index = self.camera_request()?;
        self.gateway()
            .get(index, control.selector(), request, control.width())
    }

    /// SET_CUR a camera terminal control. `data` must match the control's width.
    pub fn set_camera_control(&self, control: CameraControl, data: &[u8]) -> Result<()> {
        if data.len() != control.width() {
            return Err(Error::InvalidParam);
        }
        let index = self.camera_request()?;
        self.gateway().set(index, control.selector(), data)
    }

    /// Query a processing unit control.
    pub fn processing_control(
        &self,
        control: ProcessingControl,
        request: RequestCode,
    ) -> Result<Vec<u8>> {
        let index = self.processing_request()?;
        self.gateway()
            .get(index, control.selector(), request, control.width())
    }

    /// SET_CUR a processing unit control. `data` must match the control's width.
    pub fn set_processing_control(&self, control: ProcessingControl, data: &[u8]) -> Result<()> {
        if data.len() != control.width() {
            return Err(Error::InvalidParam);
        }
        let index = self.processing_request()?;
        self.gateway().set(index, control.selector(), data)
    }

    fn unit_request(&self, unit: u8) -> u16 {
        self.info().control.entity_request(unit)
    }

    /// GET_LEN of an arbitrary unit's control, typically an extension unit.
    pub fn get_ctrl_len(&self, unit: u8, selector: u8) -> Result<u16> {
        self.gateway().get_len(self.unit_request(unit), selector)
    }

    /// GET_INFO capability bits of an arbitrary unit's control.
    pub fn get_ctrl_info(&self, unit: u8, selector: u8) -> Result<u8> {
        self.gateway().get_info(self.unit_request(unit), selector)
    }

    /// Raw GET request on an arbitrary unit's control.
    pub fn get_ctrl(
        &self,
        unit: u8,
        selector: u8,
        request: RequestCode,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.gateway()
            .get(self.unit_request(unit), selector, request, len)
    }

    /// Raw SET_CUR on an arbitrary unit's control.
    pub fn set_ctrl(&self, unit: u8, selector: u8, data: &[u8]) -> Result<()> {
        self.gateway().set(self.unit_request(unit), selector, data)
    }

    /// Last error reported by a streaming interface.
    pub fn stream_error_code(&self, interface_number: u8) -> Result<StreamErrorCode> {
        self.gateway().stream_error_code(interface_number)
    }

    pub fn ae_mode(&self, request: RequestCode) -> Result<u8> {
        Ok(self.camera_control(CameraControl::AeMode, request)?[0])
    }

    pub fn set_ae_mode(&self, mode: u8) -> Result<()> {
        self.set_camera_control(CameraControl::AeMode, &[mode])
    }

    /// Exposure time in 100 µs units.
    pub fn exposure_abs(&self, request: RequestCode) -> Result<u32> {
        let data = self.camera_control(CameraControl::ExposureTimeAbsolute, request)?;
        Ok(LittleEndian::read_u32(&data))
    }

    pub fn set_exposure_abs(&self, time: u32) -> Result<()> {
        self.set_camera_control(CameraControl::ExposureTimeAbsolute, &time.to_le_bytes())
    }

    pub fn focus_abs(&self, request: RequestCode) -> Result<u16> {
        let data = self.camera_control(CameraControl::FocusAbsolute, request)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn set_focus_abs(&self, focus: u16) -> Result<()> {
        self.set_camera_control(CameraControl::FocusAbsolute, &focus.to_le_bytes())
    }

    pub fn focus_auto(&self, request: RequestCode) -> Result<bool> {
        Ok(self.camera_control(CameraControl::FocusAuto, request)?[0] != 0)
    }

    pub fn set_focus_auto(&self, enabled: bool) -> Result<()> {
        self.set_camera_control(CameraControl::FocusAuto, &[enabled as u8])
    }

    pub fn zoom_abs(&self, request: RequestCode) -> Result<u16> {
        let data = self.camera_control(CameraControl::ZoomAbsolute, request)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn set_zoom_abs(&self, zoom: u16) -> Result<()> {
        self.set_camera_control(CameraControl::ZoomAbsolute, &zoom.to_le_bytes())
    }

    /// Pan and tilt in arc seconds.
    pub fn pan_tilt_abs(&self, request: RequestCode) -> Result<(i32, i32)> {
        let data = self.camera_control(CameraControl::PanTiltAbsolute, request)?;
        Ok((
            LittleEndian::read_i32(&data[0..4]),
            LittleEndian::read_i32(&data[4..8]),
        ))
    }

    pub fn set_pan_tilt_abs(&self, pan: i32, tilt: i32) -> Result<()> {
        let mut data = [0u8; 8];
        LittleEndian::write_i32(&mut data[0..4], pan);
        LittleEndian::write_i32(&mut data[4..8], tilt);
        self.set_camera_control(CameraControl::PanTiltAbsolute, &data)
    }

    pub fn brightness(&self, request: RequestCode) -> Result<i16> {
        let data = self.processing_control(ProcessingControl::Brightness, request)?;
        Ok(LittleEndian::read_i16(&data))
    }

    pub fn set_brightness(&self, brightness: i16) -> Result<()> {
        self.set_processing_control(ProcessingControl::Brightness, &brightness.to_le_bytes())
    }

    pub fn contrast(&self, request: RequestCode) -> Result<u16> {
        let data = self.processing_control(ProcessingControl::Contrast, request)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn set_contrast(&self, contrast: u16) -> Result<()> {
        self.set_processing_control(ProcessingControl::Contrast, &contrast.to_le_bytes())
    }

    pub fn gain(&self, request: RequestCode) -> Result<u16> {
        let data = self.processing_control(ProcessingControl::Gain, request)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn set_gain(&self, gain: u16) -> Result<()> {
        self.set_processing_control(ProcessingControl::Gain, &gain.to_le_bytes())
    }

    /// White balance temperature in kelvin.
    pub fn white_balance_temperature(&self, request: RequestCode) -> Result<u16> {
        let data =
            self.processing_control(ProcessingControl::WhiteBalanceTemperature, request)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn set_white_balance_temperature(&self, kelvin: u16) -> Result<()> {
        self.set_processing_control(
            ProcessingControl::WhiteBalanceTemperature,
            &kelvin.to_le_bytes(),
        )
    }

    pub fn white_balance_temperature_auto(&self, request: RequestCode) -> Result<bool> {
        let data =
            self.processing_control(ProcessingControl::WhiteBalanceTemperatureAuto, request)?;
        Ok(data[0] != 0)
    }

    pub fn set_white_balance_temperature_auto(&self, enabled: bool) -> Result<()> {
        self.set_processing_control(
            ProcessingControl::WhiteBalanceTemperatureAuto,
            &[enabled as u8],
        )
    }

    /// 0 disabled, 1 50 Hz, 2 60 Hz, 3 auto.
    pub fn power_line_frequency(&self, request: RequestCode) -> Result<u8> {
        Ok(self.processing_control(ProcessingControl::PowerLineFrequency, request)?[0])
    }

    pub fn set_power_line_frequency(&self, mode: u8) -> Result<()> {
        self.set_processing_control(ProcessingControl::PowerLineFrequency, &[mode])
    }
}
