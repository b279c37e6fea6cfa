//! Library context: transport ownership, enumeration and the event thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, warn};

use crate::descriptor::is_uvc_device;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::usb::UsbBackend;

/// How long one pass of the event thread waits for transport events.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Last pass after shutdown, for cancellations issued while closing.
const EVENT_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Entry point of the library.
///
/// A context wraps a USB transport. When it owns the event loop, a
/// background thread handles transfer completions while at least one
/// device is open; otherwise the caller must call
/// [`handle_events`](Self::handle_events) regularly.
///
/// Cloning is cheap and yields a handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    backend: Arc<dyn UsbBackend>,
    owns_event_loop: bool,
    events: Mutex<EventLoop>,
}

#[derive(Default)]
pub(crate) struct EventLoop {
    pub(crate) open_handles: usize,
    pub(crate) thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
    shutdown: Arc<AtomicBool>,
}

impl Context {
    /// Create a context on the system's libusb, owning its event loop.
    #[cfg(feature = "rusb-backend")]
    pub fn new() -> Result<Self> {
        let backend = crate::usb::libusb::RusbBackend::new()?;
        Ok(Self::with_backend(backend, true))
    }

    /// Create a context on an arbitrary transport.
    pub fn with_backend<B: UsbBackend>(backend: B, owns_event_loop: bool) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                backend: Arc::new(backend),
                owns_event_loop,
                events: Mutex::new(EventLoop::default()),
            }),
        }
    }

    pub fn owns_event_loop(&self) -> bool {
        self.inner.owns_event_loop
    }

    /// All attached UVC devices.
    pub fn devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for usb in self.inner.backend.devices()? {
            let (desc, config) = match (usb.device_descriptor(), usb.config_descriptor()) {
                (Ok(desc), Ok(config)) => (desc, config),
                (Err(e), _) | (_, Err(e)) => {
                    debug!(
                        "skipping device {:03}:{:03}: {e}",
                        usb.bus_number(),
                        usb.address()
                    );
                    continue;
                }
            };
            if is_uvc_device(&desc, &config) {
                devices.push(Device::new(self.clone(), usb));
            }
        }
        debug!("found {} UVC device(s)", devices.len());
        Ok(devices)
    }

    /// First UVC device matching every given filter.
    ///
    /// Matching on `serial_number` opens each candidate briefly to read its
    /// string descriptor.
    pub fn find_device(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        serial_number: Option<&str>,
    ) -> Result<Device> {
        for device in self.devices()? {
            let usb_desc = device.usb_descriptor()?;
            if vendor_id.is_some_and(|vid| vid != usb_desc.vendor_id)
                || product_id.is_some_and(|pid| pid != usb_desc.product_id)
            {
                continue;
            }
            if let Some(wanted) = serial_number {
                match device.descriptor() {
                    Ok(desc) if desc.serial_number.as_deref() == Some(wanted) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("reading descriptor for serial match failed: {e}");
                        continue;
                    }
                }
            }
            return Ok(device);
        }
        Err(Error::NotFound)
    }

    /// Handle pending transport events, waiting at most `timeout`.
    pub fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.inner.backend.handle_events(timeout)
    }

    pub(crate) fn event_loop(&self) -> std::sync::MutexGuard<'_, EventLoop> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Count an opened handle, starting the event thread on the first one.
    pub(crate) fn register_handle(&self) -> Result<()> {
        let mut events = self.event_loop();
        if self.inner.owns_event_loop && events.thread.is_none() {
            let backend = Arc::clone(&self.inner.backend);
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            let thread = thread::Builder::new()
                .name("uvc-events".into())
                .spawn(move || run_event_loop(backend, flag))
                .map_err(|e| {
                    warn!("spawning event thread failed: {e}");
                    Error::NoMem
                })?;
            events.thread_id = Some(thread.thread().id());
            events.thread = Some(thread);
            events.shutdown = shutdown;
        }
        events.open_handles += 1;
        Ok(())
    }

    /// Forget a closed handle, joining the event thread after the last one.
    pub(crate) fn unregister_handle(&self) {
        let thread = {
            let mut events = self.event_loop();
            events.open_handles = events.open_handles.saturating_sub(1);
            if events.open_handles > 0 {
                return;
            }
            events.shutdown.store(true, Ordering::SeqCst);
            events.thread_id = None;
            events.thread.take()
        };

        let Some(thread) = thread else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // last handle dropped from a completion callback; the loop exits on its own
            return;
        }
        if thread.join().is_err() {
            warn!("event thread panicked");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.event_loop();
        f.debug_struct("Context")
            .field("owns_event_loop", &self.inner.owns_event_loop)
            .field("open_handles", &events.open_handles)
            .field("event_thread", &events.thread_id)
            .finish()
    }
}

fn run_event_loop(backend: Arc<dyn UsbBackend>, shutdown: Arc<AtomicBool>) {
    debug!("event thread started");
    while !shutdown.load(Ordering::SeqCst) {
        match backend.handle_events(EVENT_POLL_INTERVAL) {
            Ok(()) | Err(Error::Interrupted) | Err(Error::Timeout) => {}
            Err(e) => {
                warn!("handling USB events failed: {e}");
                thread::sleep(EVENT_POLL_INTERVAL);
            }
        }
    }
    if let Err(e) = backend.handle_events(EVENT_DRAIN_INTERVAL) {
        debug!("final event pass failed: {e}");
    }
    debug!("event thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::descriptors::{camera_config, CameraLayout};
    use crate::mock::{MockBackend, MockDevice};
    use crate::usb::{ConfigInfo, UsbDeviceDescriptor};

    fn context(devices: Vec<MockDevice>, owns: bool) -> Context {
        let devices = devices.into_iter().map(Arc::new).collect();
        Context::with_backend(MockBackend::new(devices), owns)
    }

    fn camera(vid: u16, pid: u16) -> MockDevice {
        MockDevice::new(
            UsbDeviceDescriptor {
                vendor_id: vid,
                product_id: pid,
                ..Default::default()
            },
            camera_config(&CameraLayout::default()),
        )
    }

    #[test]
    fn test_devices_filters_non_uvc() {
        let printer = MockDevice::new(UsbDeviceDescriptor::default(), ConfigInfo::default());
        let ctx = context(
            vec![
                MockDevice::camera(&CameraLayout::default()),
                printer,
                camera(0x199e, 0x8202),
            ],
            false,
        );
        let devices = ctx.devices().unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_find_device_filters() {
        let ctx = context(
            vec![
                camera(0x1111, 0x0001).with_address(1, 2),
                MockDevice::camera(&CameraLayout::default()).with_address(1, 3),
            ],
            false,
        );
        assert_eq!(ctx.find_device(None, None, None).unwrap().address(), 2);
        assert_eq!(
            ctx.find_device(Some(0x046d), None, None).unwrap().address(),
            3
        );
        assert_eq!(
            ctx.find_device(None, None, Some("0001")).unwrap().address(),
            3
        );
        assert_eq!(
            ctx.find_device(Some(0x046d), Some(0x0001), None).err(),
            Some(Error::NotFound)
        );
        assert_eq!(
            ctx.find_device(None, None, Some("9999")).err(),
            Some(Error::NotFound)
        );
    }

    #[test]
    fn test_event_thread_follows_open_handles() {
        let ctx = context(vec![MockDevice::camera(&CameraLayout::default())], true);
        let device = ctx.find_device(None, None, None).unwrap();

        let first = device.open().unwrap();
        assert!(ctx.event_loop().thread.is_some());
        let second = device.open().unwrap();
        assert_eq!(ctx.event_loop().open_handles, 2);

        drop(first);
        assert!(ctx.event_loop().thread.is_some());
        drop(second);
        assert!(ctx.event_loop().thread.is_none());
        assert_eq!(ctx.event_loop().open_handles, 0);

        // reopening starts a fresh thread
        let _again = device.open().unwrap();
        assert!(ctx.event_loop().thread.is_some());
    }

    #[test]
    fn test_non_owning_context_has_no_thread() {
        let ctx = context(vec![MockDevice::camera(&CameraLayout::default())], false);
        let _handle = ctx.find_device(None, None, None).unwrap().open().unwrap();
        assert!(ctx.event_loop().thread.is_none());
        assert_eq!(ctx.event_loop().open_handles, 1);
    }
}
