//! Utilities to attach [`framebuffer::Handle`]s to native buffers
//!
//! [`bind`] imports the memory regions of a [`NativeBuffer`] as GEM handles and creates a
//! framebuffer for them, [`unbind`] tears both down again. Neither caches anything, see
//! [`BoCache`](super::BoCache) for that.

use std::{io, os::unix::io::AsFd};

use drm::{
    buffer::{self, PlanarBuffer},
    control::framebuffer,
};
use drm_fourcc::DrmModifier;
use scopeguard::ScopeGuard;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{error::AccessError, KmsDevice};
use crate::backend::allocator::{
    format::FormatLayout, BufferIdentity, Format, Fourcc, Modifier, NativeBuffer, MAX_PLANES,
};

/// Plane layout of a buffer imported into the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutLayout {
    handles: [Option<buffer::Handle>; MAX_PLANES],
    pitches: [u32; MAX_PLANES],
    offsets: [u32; MAX_PLANES],
    format: Fourcc,
    size: (u32, u32),
}

impl ScanoutLayout {
    /// Distinct GEM handles referenced by the planes of this layout
    pub fn gem_handles(&self) -> impl Iterator<Item = buffer::Handle> + '_ {
        self.handles.iter().enumerate().filter_map(move |(idx, handle)| {
            let handle = (*handle)?;
            (!self.handles[..idx].contains(&Some(handle))).then_some(handle)
        })
    }

    /// Number of planes of this layout
    pub fn plane_count(&self) -> usize {
        self.handles.iter().filter(|handle| handle.is_some()).count()
    }
}

impl PlanarBuffer for ScanoutLayout {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// A native buffer bound to a framebuffer
///
/// This is a plain descriptor: dropping it does not release any kernel resources,
/// [`unbind`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutBuffer {
    identity: BufferIdentity,
    layout: ScanoutLayout,
    fb: framebuffer::Handle,
}

impl ScanoutBuffer {
    /// Identity of the allocation this framebuffer shows
    pub fn identity(&self) -> BufferIdentity {
        self.identity
    }

    /// The framebuffer handle to present
    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.fb
    }

    /// Plane layout the framebuffer was created with
    pub fn layout(&self) -> &ScanoutLayout {
        &self.layout
    }

    /// Format of the framebuffer
    pub fn format(&self) -> Format {
        Format {
            code: self.layout.format,
            modifier: Modifier::Invalid,
        }
    }

    /// Size (w x h) of the framebuffer
    pub fn size(&self) -> (u32, u32) {
        self.layout.size
    }
}

impl AsRef<framebuffer::Handle> for ScanoutBuffer {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.fb
    }
}

/// Attach a [`framebuffer::Handle`] to a [`NativeBuffer`]
///
/// Every memory region referenced by `layout` is imported once, planes sharing a region
/// share the GEM handle. If any step fails, the handles created so far are closed again.
#[profiling::function]
pub fn bind<D, B>(drm: &D, buffer: &B, layout: &FormatLayout) -> Result<ScanoutBuffer, AccessError>
where
    D: KmsDevice + ?Sized,
    B: NativeBuffer + ?Sized,
{
    let identity = buffer.identity();
    let fds = buffer.fds();
    // Handles imported so far are closed again unless the framebuffer gets created.
    let mut imported = scopeguard::guard(
        SmallVec::<[(usize, buffer::Handle); MAX_PLANES]>::new(),
        |imported| close_handles(drm, imported.into_iter().map(|(_, handle)| handle)),
    );
    let mut scanout = ScanoutLayout {
        handles: [None; MAX_PLANES],
        pitches: [0; MAX_PLANES],
        offsets: [0; MAX_PLANES],
        format: layout.code,
        size: buffer.size(),
    };

    for (idx, plane) in layout.planes.iter().enumerate().take(MAX_PLANES) {
        let existing = imported
            .iter()
            .find(|(fd_index, _)| *fd_index == plane.fd_index)
            .map(|(_, handle)| *handle);
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let fd = fds.get(plane.fd_index).ok_or_else(|| AccessError {
                    errmsg: "Buffer is missing a memory region",
                    dev: drm.dev_path(),
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                })?;
                let handle = drm.import_prime(fd.as_fd()).map_err(|source| AccessError {
                    errmsg: "Failed to import prime fd",
                    dev: drm.dev_path(),
                    source,
                })?;
                trace!(%identity, ?handle, plane = idx, "imported prime fd");
                imported.push((plane.fd_index, handle));
                handle
            }
        };

        scanout.handles[idx] = Some(handle);
        scanout.pitches[idx] = plane.pitch;
        scanout.offsets[idx] = plane.offset;
    }

    let fb = drm.add_framebuffer(&scanout).map_err(|source| AccessError {
        errmsg: "Failed to add framebuffer",
        dev: drm.dev_path(),
        source,
    })?;
    ScopeGuard::into_inner(imported);

    debug!(%identity, ?fb, format = ?scanout.format, size = ?scanout.size, "bound buffer");
    Ok(ScanoutBuffer {
        identity,
        layout: scanout,
        fb,
    })
}

/// Destroy the framebuffer of a [`ScanoutBuffer`] and close its GEM handles
///
/// Failures are logged and otherwise ignored, the resources may already be gone
/// after a device reset.
#[profiling::function]
pub fn unbind<D>(drm: &D, buffer: &ScanoutBuffer)
where
    D: KmsDevice + ?Sized,
{
    trace!(identity = %buffer.identity, fb = ?buffer.fb, "destroying framebuffer");
    if let Err(err) = drm.destroy_framebuffer(buffer.fb) {
        warn!(fb = ?buffer.fb, ?err, "failed to destroy framebuffer");
    }
    close_handles(drm, buffer.layout.gem_handles());
}

fn close_handles<D>(drm: &D, handles: impl IntoIterator<Item = buffer::Handle>)
where
    D: KmsDevice + ?Sized,
{
    for handle in handles {
        if let Err(err) = drm.close_buffer(handle) {
            warn!(?handle, ?err, "failed to close gem handle");
        }
    }
}
