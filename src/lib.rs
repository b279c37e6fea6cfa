//! User-space host driver for USB Video Class cameras.
//!
//! This crate enumerates UVC devices, parses their class-specific
//! descriptors, negotiates stream parameters over the probe/commit protocol
//! and reassembles isochronous or bulk payloads into whole frames.
//!
//! # Getting Started
//!
//! ## Polling Mode
//!
//! Use `start_polling()` and then `get_frame()` to pull frames as they arrive:
//!
//! ```no_run
//! use std::time::Duration;
//! use uvc_host::{Context, FrameFormat};
//!
//! let ctx = Context::new().unwrap();
//! let device = ctx.find_device(None, None, None).unwrap();
//! let handle = device.open().unwrap();
//!
//! // 640x480 YUYV at 15 to 30 fps
//! let ctrl = handle
//!     .stream_ctrl_for(FrameFormat::Yuyv, 640, 480, 15, 30)
//!     .unwrap();
//! let mut stream = handle.open_stream(&ctrl).unwrap();
//! stream.start_polling().unwrap();
//!
//! for _ in 0..30 {
//!     if let Some(frame) = stream.get_frame(Duration::from_secs(1)).unwrap() {
//!         println!("frame {} ({} bytes)", frame.sequence, frame.data_bytes);
//!     }
//! }
//! stream.stop().unwrap();
//! ```
//!
//! ## Callback Mode
//!
//! Use `start()` with a closure. It runs on a dedicated thread, one call per
//! completed frame:
//!
//! ```no_run
//! use uvc_host::{Context, FrameFormat};
//!
//! let ctx = Context::new().unwrap();
//! let handle = ctx.find_device(Some(0x046d), None, None).unwrap().open().unwrap();
//! let ctrl = handle
//!     .stream_ctrl_for(FrameFormat::Mjpeg, 1280, 720, 1, 30)
//!     .unwrap();
//!
//! let stream = handle
//!     .start_streaming(&ctrl, |frame| {
//!         println!("{}x{} {:?}", frame.width, frame.height, frame.format);
//!     })
//!     .unwrap();
//!
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! stream.close();
//! ```
//!
//! # Features
//!
//! - `rusb-backend` (default): libusb transport through `rusb`
//! - `serde`: `Serialize`/`Deserialize` for configuration and descriptor types
//! - `testutils`: the scripted `mock` transport, for integration tests
//!
//! # Threading
//!
//! A [`Context`] that owns its event loop runs one background thread while
//! any device is open. Status callbacks run on that thread and must not
//! close the device they were registered on. Frame callbacks run on a
//! per-stream thread.

pub mod context;
pub mod control;
pub mod descriptor;
pub mod device;
mod error;
pub mod negotiate;
pub mod status;
pub mod stream;
pub mod types;
pub mod usb;

#[cfg(any(test, feature = "testutils"))]
pub mod mock;

// Crate-level error types
pub use error::{Error, Result};

// Context and devices
pub use context::Context;
pub use device::{Device, DeviceHandle};

// Descriptor model
pub use descriptor::{
    DeviceInfo, ExtensionUnit, FormatDesc, FrameDesc, FrameIntervals, InputTerminal,
    OutputTerminal, ProcessingUnit, SelectorUnit, StreamingInterface,
};

// Controls and status
pub use control::{CameraControl, ProcessingControl, RequestCode, StreamErrorCode};
pub use status::{ControlStatus, StatusAttribute, StatusClass, StatusEvent};

// Streaming
pub use negotiate::StreamCtrl;
pub use stream::StreamHandle;
pub use types::{
    DeviceDescriptor, Frame, FrameFormat, IncompleteFramePolicy, PollTimeout, StreamConfig,
};
