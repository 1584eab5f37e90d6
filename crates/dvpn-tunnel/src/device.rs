//! Exclusive ownership of an opened crypto device.

use crate::setup::CryptoDevice;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Crypto device that is closed exactly once.
///
/// Dropping an `OwnedDevice` that was not shut down closes it and waits for
/// the close to finish, so an early return during tunnel construction cannot
/// leak the device.
pub(crate) struct OwnedDevice {
    device: Box<dyn CryptoDevice>,
    closed: bool,
}

impl OwnedDevice {
    pub(crate) fn new(device: Box<dyn CryptoDevice>) -> Self {
        Self { device, closed: false }
    }

    /// Close the device and block until it confirms shutdown.
    pub(crate) fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.device.close();
        self.device.wait();
        debug!("Crypto device closed");
    }
}

impl Deref for OwnedDevice {
    type Target = dyn CryptoDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl DerefMut for OwnedDevice {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.device.as_mut()
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        if !self.closed {
            debug!("Releasing crypto device that was never started");
            self.shutdown();
        }
    }
}
