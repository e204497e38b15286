//! Access to an open drm device node

mod fd;

pub use self::fd::DrmDeviceFd;
