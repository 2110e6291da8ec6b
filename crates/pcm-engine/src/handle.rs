//! Exclusive ownership of one open sink.

use crate::pcm::PcmDevice;

/// Owns an open [`PcmDevice`] and closes it exactly once.
///
/// The device is released by [`DeviceHandle::release`] or, failing that, on drop, so every
/// early return out of negotiation or the delivery loop gives the sink back.
pub struct DeviceHandle<D: PcmDevice> {
    name: String,
    device: D,
    open: bool,
}

impl<D: PcmDevice> DeviceHandle<D> {
    pub fn new(name: impl Into<String>, device: D) -> Self {
        Self {
            name: name.into(),
            device,
            open: true,
        }
    }

    /// Sink name the handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Close the sink. Returns `true` if this call closed it, `false` if it was already closed.
    pub fn release(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.device.close();
        tracing::debug!(device = %self.name, "device released");
        true
    }
}

impl<D: PcmDevice> Drop for DeviceHandle<D> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<D: PcmDevice> std::fmt::Debug for DeviceHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("open", &self.open)
            .finish()
    }
}
