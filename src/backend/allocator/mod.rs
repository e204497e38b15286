//! Native buffer description and format handling.
//!
//! Collection of the types describing the buffers a host compositor hands
//! to the hardware composer:
//!
//! - [`NativeBuffer`] is the interface of a vendor buffer handle
//! - [`ImgBufferHandle`] is the handle produced by the vendor gralloc
//! - [`format::translate`] maps vendor formats to DRM formats and plane layouts

pub mod format;
pub mod native;

pub use native::{BufferIdentity, ImgBufferHandle, NativeBuffer, VendorFormat, MAX_PLANES};

pub use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};
