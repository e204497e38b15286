//! Backend helpers for driving a display controller
//!
//! Collection of the types and traits a hardware composer needs to hand
//! client buffers to the kernel display driver:
//!
//! - [`allocator`] describes native vendor buffers and their pixel formats
//! - [`drm`] binds buffers to framebuffers and caches those bindings
//! - [`composition`] decides which layers are scanned out directly
//! - [`hotplug`] reacts to display connectivity changes

pub mod allocator;
pub mod composition;
pub mod drm;
pub mod hotplug;
