//! Format info tables and vendor format translation.
//!
//! This module provides [`get_bpp`] and [`has_alpha`] for the DRM formats the display
//! pipeline can scan out, and [`translate`] to map a [`VendorFormat`] onto one of them.
//!
//! [`get_bpp`] returns the number of bits per pixel of a format (for planar formats of
//! its first plane).
//!
//! ```
//! # use hwcomposer_drm::backend::allocator::Fourcc;
//! # use hwcomposer_drm::backend::allocator::format::get_bpp;
//! assert_eq!(get_bpp(Fourcc::Argb8888), Some(32));
//! assert_eq!(get_bpp(Fourcc::Nv12), Some(8));
//! ```
//!
//! [`translate`] computes the DRM format and plane layout of a vendor buffer.
//!
//! ```
//! # use hwcomposer_drm::backend::allocator::{Fourcc, VendorFormat};
//! # use hwcomposer_drm::backend::allocator::format::translate;
//! let layout = translate(VendorFormat::BGRX_8888, (100, 100), 64).unwrap();
//! assert_eq!(layout.code, Fourcc::Xrgb8888);
//! assert_eq!(layout.planes[0].pitch, 512);
//! ```

use smallvec::{smallvec, SmallVec};

use super::{Fourcc, VendorFormat, MAX_PLANES};
use crate::utils::align_up;

/// Macro to generate table lookup functions for formats.
///
/// See the module documentation for usage details.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            alpha: $alpha: expr,
            bpp: $bpp: expr $(,)?
        }),*
    ) => {
        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: $crate::backend::allocator::Fourcc) -> bool {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [$crate::backend::allocator::Fourcc] {
            &[
                $(
                    $crate::backend::allocator::Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // 16-bit bpp RGB, no alpha, 6 bits for green channel and 5 bits for blue and red
    Rgb565 { alpha: false, bpp: 16 },

    // 24-bit bpp RGB
    Rgb888 { alpha: false, bpp: 24 },

    // 32-bit bpp RGB, 8 bits per channel
    Argb8888 { alpha: true, bpp: 32 },

    Xrgb8888 { alpha: false, bpp: 32 },

    Abgr8888 { alpha: true, bpp: 32 },

    Xbgr8888 { alpha: false, bpp: 32 },

    // 2 plane YCbCr, bpp of the luma plane
    Nv12 { alpha: false, bpp: 8 }
}

/// Errors of the vendor format translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The format word selects a compression or memory layout mode
    #[error("format {format:#x} uses unsupported compression or layout bits {bits:#x}")]
    SpecialLayout {
        /// Raw vendor format word
        format: u32,
        /// The offending layout bits
        bits: u32,
    },
    /// The format code has no DRM equivalent
    #[error("vendor format {0:#x} has no drm equivalent")]
    Unmapped(u32),
    /// The buffer size does not fit the pitch or offset range of the format
    #[error("buffer size {width}x{height} is out of range for format {format}")]
    InvalidDimensions {
        /// Width of the buffer
        width: u32,
        /// Height of the buffer
        height: u32,
        /// Translated format
        format: Fourcc,
    },
    /// The hardware alignment is not a power of two
    #[error("hardware alignment {0} is not a power of two")]
    InvalidAlignment(u32),
}

/// Layout of a single plane of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Index of the memory region (file descriptor) holding the plane
    pub fd_index: usize,
    /// Pitch of the plane in bytes
    pub pitch: u32,
    /// Offset of the plane inside its memory region
    pub offset: u32,
}

/// DRM format and plane layout of a vendor buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatLayout {
    /// DRM format of the buffer
    pub code: Fourcc,
    /// Layout of every plane, in plane order
    pub planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
}

/// Returns the DRM format matching a vendor format, ignoring its layout bits.
pub const fn get_fourcc(format: VendorFormat) -> Option<Fourcc> {
    match format.code() {
        c if c == VendorFormat::RGBA_8888.code() => Some(Fourcc::Abgr8888),
        c if c == VendorFormat::RGBX_8888.code() => Some(Fourcc::Xbgr8888),
        c if c == VendorFormat::RGB_888.code() => Some(Fourcc::Rgb888),
        c if c == VendorFormat::RGB_565.code() => Some(Fourcc::Rgb565),
        c if c == VendorFormat::BGRA_8888.code() => Some(Fourcc::Argb8888),
        c if c == VendorFormat::BGRX_8888.code() => Some(Fourcc::Xrgb8888),
        // scanned out as its semi-planar equivalent, the chroma plane follows the luma plane
        c if c == VendorFormat::YV12.code() => Some(Fourcc::Nv12),
        _ => None,
    }
}

/// Translate a vendor format into a DRM format and plane layout.
///
/// The pitch of the first plane is the buffer width rounded up to `hw_align` pixels,
/// multiplied by the bytes per pixel. Planar formats store their second plane in the
/// same memory region, directly behind the first one.
///
/// Formats with compression or layout bits set are rejected, as are formats
/// without a DRM equivalent.
pub fn translate(
    format: VendorFormat,
    (width, height): (u32, u32),
    hw_align: u32,
) -> Result<FormatLayout, FormatError> {
    if !hw_align.is_power_of_two() {
        return Err(FormatError::InvalidAlignment(hw_align));
    }

    let bits = format.layout_bits();
    if bits != 0 {
        return Err(FormatError::SpecialLayout {
            format: format.raw(),
            bits,
        });
    }

    let code = get_fourcc(format).ok_or(FormatError::Unmapped(format.raw()))?;
    let bpp = get_bpp(code).ok_or(FormatError::Unmapped(format.raw()))? as u32;
    let invalid = || FormatError::InvalidDimensions { width, height, format: code };

    let pitch = align_up(width, hw_align)
        .and_then(|stride_width| stride_width.checked_mul(bpp / 8))
        .ok_or_else(invalid)?;

    let planes = match code {
        Fourcc::Nv12 => {
            let offset = pitch.checked_mul(height).ok_or_else(invalid)?;
            smallvec![
                PlaneLayout {
                    fd_index: 0,
                    pitch,
                    offset: 0,
                },
                PlaneLayout {
                    fd_index: 0,
                    pitch,
                    offset,
                },
            ]
        }
        _ => smallvec![PlaneLayout {
            fd_index: 0,
            pitch,
            offset: 0,
        }],
    };

    Ok(FormatLayout { code, planes })
}
