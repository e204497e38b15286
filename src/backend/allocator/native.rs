//! Vendor buffer handles.
//!
//! Buffers reach the hardware composer as opaque handles allocated by the vendor gralloc.
//! Several handle instances (e.g. one per process the buffer was passed through) may refer
//! to the same backing allocation. All of them report the same [`BufferIdentity`], which is
//! what bindings to kernel resources are keyed by.

use std::{
    fmt, io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
};

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

/// Stable identity of one backing memory allocation.
///
/// The identity stays the same for the lifetime of the allocation, independent
/// of the handle instance it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferIdentity(u64);

impl BufferIdentity {
    /// Raw value of this identity
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for BufferIdentity {
    #[inline]
    fn from(stamp: u64) -> Self {
        BufferIdentity(stamp)
    }
}

impl From<BufferIdentity> for u64 {
    #[inline]
    fn from(identity: BufferIdentity) -> Self {
        identity.0
    }
}

impl fmt::Display for BufferIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Pixel format word of a vendor buffer.
///
/// The low bits (`0x10f`) carry the format code, every other bit selects a
/// compression or memory layout mode. The only exception is [`VendorFormat::YV12`],
/// which is a fourcc and has to be matched as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorFormat(u32);

impl VendorFormat {
    const CODE_MASK: u32 = 0x10f;
    const VENDOR_EXT: u32 = 0x100;

    /// 32-bit RGBA, 8 bits per channel
    pub const RGBA_8888: VendorFormat = VendorFormat(1);
    /// 32-bit RGB with unused alpha, 8 bits per channel
    pub const RGBX_8888: VendorFormat = VendorFormat(2);
    /// 24-bit packed RGB
    pub const RGB_888: VendorFormat = VendorFormat(3);
    /// 16-bit RGB 5:6:5
    pub const RGB_565: VendorFormat = VendorFormat(4);
    /// 32-bit BGRA, 8 bits per channel
    pub const BGRA_8888: VendorFormat = VendorFormat(5);
    /// 32-bit BGR with unused alpha, a vendor extension
    pub const BGRX_8888: VendorFormat = VendorFormat(Self::VENDOR_EXT | 1);
    /// Planar YUV 4:2:0
    pub const YV12: VendorFormat = VendorFormat(0x3231_5659);

    /// Wrap a raw vendor format word
    pub const fn from_raw(raw: u32) -> Self {
        VendorFormat(raw)
    }

    /// The raw vendor format word
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The format code with all layout bits stripped
    pub const fn code(self) -> u32 {
        if self.0 == Self::YV12.0 {
            self.0
        } else {
            self.0 & Self::CODE_MASK
        }
    }

    /// Compression and memory layout bits of this format word
    pub const fn layout_bits(self) -> u32 {
        if self.0 == Self::YV12.0 {
            0
        } else {
            self.0 & !Self::CODE_MASK
        }
    }
}

impl From<u32> for VendorFormat {
    #[inline]
    fn from(raw: u32) -> Self {
        VendorFormat(raw)
    }
}

/// Common interface of native buffer handles
pub trait NativeBuffer {
    /// Stable identity of the backing allocation
    fn identity(&self) -> BufferIdentity;
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32;
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32;
    /// Size (w x h) of the two-dimensional buffer
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Vendor pixel format of the buffer
    fn format(&self) -> VendorFormat;
    /// Dma-buf file descriptors of the buffer, one per memory region
    fn fds(&self) -> &[OwnedFd];
}

impl<B: NativeBuffer + ?Sized> NativeBuffer for &B {
    fn identity(&self) -> BufferIdentity {
        (**self).identity()
    }
    fn width(&self) -> u32 {
        (**self).width()
    }
    fn height(&self) -> u32 {
        (**self).height()
    }
    fn format(&self) -> VendorFormat {
        (**self).format()
    }
    fn fds(&self) -> &[OwnedFd] {
        (**self).fds()
    }
}

/// Checks a handle for structural validity.
///
/// Returns a description of the first defect found.
pub(crate) fn check_handle(buffer: &impl NativeBuffer) -> Result<(), &'static str> {
    let fds = buffer.fds();
    if fds.is_empty() {
        return Err("buffer has no memory regions");
    }
    if fds.len() > MAX_PLANES {
        return Err("buffer has more memory regions than supported");
    }
    let (width, height) = buffer.size();
    if width == 0 || height == 0 {
        return Err("buffer has an empty size");
    }
    Ok(())
}

/// Buffer handle as produced by the vendor gralloc
#[derive(Debug)]
pub struct ImgBufferHandle {
    stamp: u64,
    width: u32,
    height: u32,
    format: VendorFormat,
    usage: u64,
    fds: Vec<OwnedFd>,
}

impl ImgBufferHandle {
    /// Create a handle for an allocation identified by `stamp`
    pub fn new(
        stamp: u64,
        (width, height): (u32, u32),
        format: impl Into<VendorFormat>,
        fds: Vec<OwnedFd>,
    ) -> Self {
        ImgBufferHandle {
            stamp,
            width,
            height,
            format: format.into(),
            usage: 0,
            fds,
        }
    }

    /// Set the gralloc usage flags of this handle
    pub fn with_usage(mut self, usage: u64) -> Self {
        self.usage = usage;
        self
    }

    /// Gralloc usage flags the buffer was allocated with
    pub fn usage(&self) -> u64 {
        self.usage
    }

    /// Borrow the file descriptor of the given memory region
    pub fn fd(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.fds.get(index).map(AsFd::as_fd)
    }

    /// Create a second handle instance for the same allocation.
    ///
    /// The file descriptors are duplicated, the identity is shared.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(ImgBufferHandle {
            stamp: self.stamp,
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage,
            fds: self
                .fds
                .iter()
                .map(OwnedFd::try_clone)
                .collect::<io::Result<Vec<_>>>()?,
        })
    }
}

impl NativeBuffer for ImgBufferHandle {
    fn identity(&self) -> BufferIdentity {
        BufferIdentity(self.stamp)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> VendorFormat {
        self.format
    }

    fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }
}
