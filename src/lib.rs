#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # hwcomposer-drm: scan-out buffer import for hardware composers
//!
//! This crate is the buffer side of a DRM based hardware composer. A host compositor hands it
//! opaque vendor buffer handles; the crate decides which layers of a display can be scanned out
//! directly by the display controller and turns the corresponding buffers into kernel
//! framebuffers.
//!
//! ## Structure of the crate
//!
//! - [`backend::allocator`] describes native vendor buffers and translates their pixel formats
//!   into DRM fourcc codes and plane layouts.
//! - [`backend::drm`] binds buffers to GEM handles and framebuffers and caches those bindings
//!   per buffer allocation in a [`BoCache`](backend::drm::BoCache).
//! - [`backend::composition`] classifies the layers of a display as device or client composited.
//! - [`backend::hotplug`] forwards display connectivity changes to the cache.
//! - [`config`] holds the start-up configuration selecting the composition backend and
//!   sizing the cache.
//!
//! ## Buffer lifetime
//!
//! Framebuffers handed out by the cache may be scanned out by the display hardware at any
//! time until the host releases them again. The cache therefore never destroys a binding that
//! is still in use: flushing the cache (on hotplug, on memory pressure or once the cache
//! grows beyond its capacity) only marks used bindings, and they are torn down by their
//! next release.
//!
//! ## Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod config;
pub mod utils;

pub mod reexports;
