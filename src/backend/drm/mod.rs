//! Binding native buffers to drm framebuffers
//!
//! A buffer can only be scanned out by the display controller once the kernel knows about it.
//! This module provides the pieces to get there:
//!
//! - [`KmsDevice`] is the narrow interface to the kernel mode-setting driver this crate needs:
//!   importing dma-bufs as GEM handles, creating and destroying framebuffers and closing
//!   GEM handles. It is implemented for [`DrmDeviceFd`].
//! - [`binder`] turns a [`NativeBuffer`] into a [`ScanoutBuffer`] and back.
//! - [`BoCache`] remembers those bindings per [`BufferIdentity`], so repeated frames showing
//!   the same buffer do not create new kernel resources, and reclaims them once no
//!   composition pass references them anymore.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::{fs::OpenOptions, sync::Arc};
//! use hwcomposer_drm::{
//!     backend::drm::{BoCache, DrmDeviceFd, FlushCache, ImportBuffer},
//!     config::Config,
//! };
//! # use hwcomposer_drm::backend::allocator::ImgBufferHandle;
//! # fn buffer_from_host() -> ImgBufferHandle { unimplemented!() }
//!
//! let file = OpenOptions::new().read(true).write(true).open("/dev/dri/card0").unwrap();
//! let drm = DrmDeviceFd::new(file.into());
//! let cache = Arc::new(BoCache::new(drm, &Config::default()));
//!
//! let buffer = buffer_from_host();
//! let scanout = cache.import_buffer(&buffer).unwrap();
//! // ... present `scanout.framebuffer()` ...
//! ImportBuffer::<ImgBufferHandle>::release_buffer(&cache, scanout.identity());
//!
//! // on memory pressure
//! cache.flush_cache();
//! ```

use std::{
    io,
    os::unix::io::BorrowedFd,
    path::PathBuf,
    rc::Rc,
    sync::Arc,
};

use drm::{buffer, control::framebuffer};

use crate::backend::allocator::{BufferIdentity, NativeBuffer};

pub mod binder;
mod cache;
mod device;
pub mod error;

pub use self::binder::{ScanoutBuffer, ScanoutLayout};
pub use self::cache::{BoCache, BoState};
pub use self::device::DrmDeviceFd;
pub use self::error::{AccessError, ImportError};

/// Kernel mode-setting operations needed to scan out native buffers
///
/// Every operation may fail independently. Implementations are expected to be
/// thin wrappers around the respective ioctls.
pub trait KmsDevice {
    /// Import a dma-buf as a GEM handle usable for scan-out
    fn import_prime(&self, fd: BorrowedFd<'_>) -> io::Result<buffer::Handle>;
    /// Create a framebuffer object for the given plane layout
    fn add_framebuffer(&self, layout: &ScanoutLayout) -> io::Result<framebuffer::Handle>;
    /// Remove a framebuffer object
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;
    /// Close a GEM handle
    fn close_buffer(&self, handle: buffer::Handle) -> io::Result<()>;
    /// Path of the device node, used for error reporting
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }
}

impl<D: KmsDevice + ?Sized> KmsDevice for Arc<D> {
    #[inline]
    fn import_prime(&self, fd: BorrowedFd<'_>) -> io::Result<buffer::Handle> {
        (**self).import_prime(fd)
    }

    #[inline]
    fn add_framebuffer(&self, layout: &ScanoutLayout) -> io::Result<framebuffer::Handle> {
        (**self).add_framebuffer(layout)
    }

    #[inline]
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        (**self).destroy_framebuffer(fb)
    }

    #[inline]
    fn close_buffer(&self, handle: buffer::Handle) -> io::Result<()> {
        (**self).close_buffer(handle)
    }

    #[inline]
    fn dev_path(&self) -> Option<PathBuf> {
        (**self).dev_path()
    }
}

/// Import native buffers as framebuffers
pub trait ImportBuffer<B: NativeBuffer> {
    /// Type of the error
    type Error: std::error::Error;

    /// Bind the buffer to a framebuffer, or return the existing binding of its allocation.
    ///
    /// The binding stays alive at least until [`ImportBuffer::release_buffer`] is called
    /// for the buffer's identity.
    fn import_buffer(&self, buffer: &B) -> Result<ScanoutBuffer, Self::Error>;

    /// Signal that no composition pass references the binding of `identity` anymore.
    ///
    /// Unknown identities are ignored.
    fn release_buffer(&self, identity: BufferIdentity);

    /// Test if the provided buffer is eligible for import, without creating any kernel resources
    fn can_import(&self, buffer: &B) -> bool;
}

/// Reclaim unused bindings
pub trait FlushCache {
    /// Mark every binding for teardown and release all currently unused ones.
    ///
    /// Returns the number of released bindings.
    fn flush_cache(&self) -> usize;

    /// Called when the display connectivity changed
    fn handle_hotplug(&self) {
        self.flush_cache();
    }
}

impl<T, B> ImportBuffer<B> for Arc<T>
where
    T: ImportBuffer<B> + ?Sized,
    B: NativeBuffer,
{
    type Error = <T as ImportBuffer<B>>::Error;

    #[inline]
    fn import_buffer(&self, buffer: &B) -> Result<ScanoutBuffer, Self::Error> {
        (**self).import_buffer(buffer)
    }

    #[inline]
    fn release_buffer(&self, identity: BufferIdentity) {
        (**self).release_buffer(identity)
    }

    #[inline]
    fn can_import(&self, buffer: &B) -> bool {
        (**self).can_import(buffer)
    }
}

impl<T, B> ImportBuffer<B> for Rc<T>
where
    T: ImportBuffer<B> + ?Sized,
    B: NativeBuffer,
{
    type Error = <T as ImportBuffer<B>>::Error;

    #[inline]
    fn import_buffer(&self, buffer: &B) -> Result<ScanoutBuffer, Self::Error> {
        (**self).import_buffer(buffer)
    }

    #[inline]
    fn release_buffer(&self, identity: BufferIdentity) {
        (**self).release_buffer(identity)
    }

    #[inline]
    fn can_import(&self, buffer: &B) -> bool {
        (**self).can_import(buffer)
    }
}

impl<T: FlushCache + ?Sized> FlushCache for Arc<T> {
    #[inline]
    fn flush_cache(&self) -> usize {
        (**self).flush_cache()
    }

    #[inline]
    fn handle_hotplug(&self) {
        (**self).handle_hotplug()
    }
}
