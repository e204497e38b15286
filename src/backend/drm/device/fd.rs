use drm::{
    buffer,
    control::{framebuffer, Device as ControlDevice, FbCmd2Flags},
    Device as BasicDevice,
};
use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    sync::Arc,
};
use tracing::{error, info, warn};

use crate::{
    backend::drm::{binder::ScanoutLayout, KmsDevice},
    utils::DevPath,
};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// file descriptor, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
        };

        // The composer usually runs as the display server and thus as master.
        // Newer kernels grant buffer and framebuffer ioctls without it, so this is not fatal.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns if this device holds the drm master lock
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> rustix::io::Result<rustix::fs::Dev> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev)
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl KmsDevice for DrmDeviceFd {
    fn import_prime(&self, fd: BorrowedFd<'_>) -> io::Result<buffer::Handle> {
        self.prime_fd_to_buffer(fd)
    }

    fn add_framebuffer(&self, layout: &ScanoutLayout) -> io::Result<framebuffer::Handle> {
        self.add_planar_framebuffer(layout, FbCmd2Flags::empty())
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, fb)
    }

    fn close_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        ControlDevice::close_buffer(self, handle)
    }

    fn dev_path(&self) -> Option<PathBuf> {
        DevPath::dev_path(self)
    }
}
