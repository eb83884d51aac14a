//! Contexts: a set of devices plus error reporting.

use crate::device::{Device, NativeDevice};
use crate::error::{ClError, Result, StatusCode, INVALID_DEVICE, INVALID_VALUE};
use crate::platform::Platform;
use crate::refs::OwnedRef;

use rocl_hal::Backend;

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// Callback invoked with diagnostic messages for errors raised against
/// this context.
pub type ErrorCallback = Box<dyn Fn(&str, StatusCode) + Send + Sync>;

pub(crate) struct ContextDevice<B: Backend> {
    pub device: OwnedRef<Device<B>>,
    pub native: Arc<NativeDevice<B>>,
}

/// A set of `(device, native-device)` pairs plus the error reporter.
pub struct Context<B: Backend> {
    platform: Arc<Platform<B>>,
    devices: Vec<ContextDevice<B>>,
    properties: Vec<u64>,
    error_callback: Option<ErrorCallback>,
    destructor_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<B: Backend> Context<B> {
    /// Create a context over `devices`. The property array is opaque to
    /// the runtime and only echoed back through queries.
    pub fn create(
        platform: &Arc<Platform<B>>,
        devices: &[OwnedRef<Device<B>>],
        properties: Vec<u64>,
        error_callback: Option<ErrorCallback>,
    ) -> Result<OwnedRef<Context<B>>> {
        if devices.is_empty() {
            return Err(ClError::new(INVALID_VALUE, "context needs at least one device"));
        }
        let mut entries = Vec::with_capacity(devices.len());
        for device in devices {
            if !platform
                .devices()
                .iter()
                .any(|d| std::ptr::eq(d.as_raw(), device.as_raw()))
            {
                // Unwind partial initialization before reporting.
                for entry in &entries {
                    let entry: &ContextDevice<B> = entry;
                    entry.device.release_native(&entry.native);
                }
                return Err(ClError::new(
                    INVALID_DEVICE,
                    "device does not belong to this platform",
                ));
            }
            let native = device.init_native()?;
            entries.push(ContextDevice {
                device: device.clone(),
                native,
            });
        }
        Ok(OwnedRef::new(Context {
            platform: Arc::clone(platform),
            devices: entries,
            properties,
            error_callback,
            destructor_callbacks: Mutex::new(Vec::new()),
        }))
    }

    pub fn platform(&self) -> &Arc<Platform<B>> {
        &self.platform
    }

    pub fn properties(&self) -> &[u64] {
        &self.properties
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> Vec<OwnedRef<Device<B>>> {
        self.devices.iter().map(|d| d.device.clone()).collect()
    }

    pub(crate) fn entries(&self) -> &[ContextDevice<B>] {
        &self.devices
    }

    /// The native device paired with `device` in this context.
    pub(crate) fn native_for(&self, device: &Device<B>) -> Option<Arc<NativeDevice<B>>> {
        self.devices
            .iter()
            .find(|entry| std::ptr::eq(entry.device.as_raw(), device as *const _))
            .map(|entry| Arc::clone(&entry.native))
    }

    pub(crate) fn has_device(&self, device: &Device<B>) -> bool {
        self.native_for(device).is_some()
    }

    /// Report an error through the context callback and produce the
    /// `ClError` the API entry returns.
    pub fn report_error(&self, message: &str, code: StatusCode) -> ClError {
        if let Some(callback) = &self.error_callback {
            callback(message, code);
        }
        ClError::new(code, message)
    }

    /// Register a callback to run when the context is destroyed. Callbacks
    /// run in reverse registration order.
    pub fn set_destructor_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.destructor_callbacks.lock().push(Box::new(callback));
    }
}

impl<B: Backend> Drop for Context<B> {
    fn drop(&mut self) {
        debug!("context dropped");
        let callbacks: Vec<_> = self.destructor_callbacks.lock().drain(..).collect();
        for callback in callbacks.into_iter().rev() {
            callback();
        }
        for entry in &self.devices {
            entry.device.release_native(&entry.native);
        }
    }
}

impl<B: Backend> std::fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices.len())
            .finish()
    }
}
