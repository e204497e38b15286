//! Classification of display layers into device and client composition
//!
//! Before every frame the host composer hands over the layers of a display. Each layer is
//! either presented directly by the display controller ([`Composition::Device`]) or has to be
//! blended into the client target by the host first ([`Composition::Client`]). Which layers the
//! hardware can take depends on the display pipeline, so the decision is made by a
//! [`Backend`] selected through the [`Config`](crate::config::Config).
//!
//! Validation only probes buffers with [`ImportBuffer::can_import`], it does not import them.
//! Importing and releasing happens when the host commits the frame.

use std::{fmt, str::FromStr};

use smallvec::SmallVec;
use tracing::trace;

use crate::{
    backend::{allocator::NativeBuffer, drm::ImportBuffer},
    config::Config,
};

/// How a layer is composited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Composition {
    /// Blended by the host into the client target
    Client,
    /// Scanned out directly by the display controller
    Device,
    /// A single color fill
    SolidColor,
    /// A cursor plane
    Cursor,
}

impl Composition {
    /// Returns true if display hardware can present layers of this type at all
    pub fn hardware_supported(self) -> bool {
        matches!(self, Composition::Device | Composition::Cursor)
    }
}

/// Identifier of a layer, assigned by the host
pub type LayerId = u64;

/// A layer of a display
#[derive(Debug)]
pub struct Layer<B> {
    id: LayerId,
    z_pos: u32,
    requested: Composition,
    validated: Option<Composition>,
    buffer: Option<B>,
}

impl<B> Layer<B> {
    /// Create a new layer without buffer requesting the given composition type
    pub fn new(id: LayerId, requested: Composition) -> Self {
        Layer {
            id,
            z_pos: 0,
            requested,
            validated: None,
            buffer: None,
        }
    }

    /// Set the z-position of this layer, higher values are stacked on top
    pub fn with_z_pos(mut self, z_pos: u32) -> Self {
        self.z_pos = z_pos;
        self
    }

    /// Set the buffer of this layer
    pub fn with_buffer(mut self, buffer: B) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Identifier of this layer
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Z-position of this layer
    pub fn z_pos(&self) -> u32 {
        self.z_pos
    }

    /// Composition type requested by the host
    pub fn requested_type(&self) -> Composition {
        self.requested
    }

    /// Update the composition type requested by the host
    pub fn set_requested_type(&mut self, requested: Composition) {
        self.requested = requested;
    }

    /// Composition type decided by the last validation, if any
    pub fn validated_type(&self) -> Option<Composition> {
        self.validated
    }

    fn set_validated_type(&mut self, validated: Composition) {
        self.validated = Some(validated);
    }

    /// The buffer currently attached to this layer
    pub fn buffer(&self) -> Option<&B> {
        self.buffer.as_ref()
    }

    /// Attach a new buffer, returning the previous one
    pub fn set_buffer(&mut self, buffer: Option<B>) -> Option<B> {
        std::mem::replace(&mut self.buffer, buffer)
    }
}

/// Outcome of validating a display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateResult {
    /// Number of layers whose composition type was set
    pub num_types: u32,
    /// Number of layer requests issued
    pub num_requests: u32,
    /// The host has to accept changed composition types before presenting
    pub has_changes: bool,
}

/// Name of a composition policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Single scan-out plane, `oneplane-du`
    OnePlane,
    /// Para-virtualized Xen display, `xendrm-du`
    XenDrm,
    /// Everything is composited by the host, `client`
    Client,
}

impl BackendKind {
    /// Name of the policy as used in configuration
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::OnePlane => "oneplane-du",
            BackendKind::XenDrm => "xendrm-du",
            BackendKind::Client => "client",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The backend name is not known
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown composition backend `{0}`")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        [BackendKind::OnePlane, BackendKind::XenDrm, BackendKind::Client]
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| UnknownBackend(name.to_owned()))
    }
}

/// Composition policy of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The display has a single scan-out plane.
    ///
    /// With `one_layer_enhancement`, a display showing exactly one layer the hardware can
    /// present is scanned out directly. Everything else is composited by the host.
    OnePlane {
        /// Enables the single layer fast path
        one_layer_enhancement: bool,
    },
    /// The display is backed by a para-virtualized Xen frontend.
    ///
    /// A single layer is always handed to the device, any more are composited by the host.
    XenDrm,
    /// Every layer is composited by the host
    Client,
}

impl Backend {
    /// Create the backend selected by `config`
    pub fn from_config(config: &Config) -> Self {
        match config.backend {
            BackendKind::OnePlane => Backend::OnePlane {
                one_layer_enhancement: config.one_layer_enhancement,
            },
            BackendKind::XenDrm => Backend::XenDrm,
            BackendKind::Client => Backend::Client,
        }
    }

    /// Name of this backend
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::OnePlane { .. } => BackendKind::OnePlane,
            Backend::XenDrm => BackendKind::XenDrm,
            Backend::Client => BackendKind::Client,
        }
    }

    /// Decide the composition type of every layer of a display.
    ///
    /// `importer` is only used to test whether buffers could be scanned out.
    #[profiling::function]
    pub fn validate_display<B, I>(&self, layers: &mut [Layer<B>], importer: &I) -> ValidateResult
    where
        B: NativeBuffer,
        I: ImportBuffer<B> + ?Sized,
    {
        let mut result = ValidateResult::default();
        let count = layers.len();
        let mut ordered: SmallVec<[&mut Layer<B>; 4]> = layers.iter_mut().collect();
        ordered.sort_by_key(|layer| layer.z_pos);

        match (self, ordered.as_mut_slice()) {
            (Backend::XenDrm, []) => {}
            (
                Backend::OnePlane {
                    one_layer_enhancement: true,
                },
                [layer],
            ) if !is_client_layer(&**layer, importer) => {
                layer.set_validated_type(Composition::Device);
                result.num_types += 1;
            }
            (Backend::XenDrm, [layer]) => {
                layer.set_validated_type(Composition::Device);
                result.has_changes = true;
            }
            (_, ordered) => {
                for layer in ordered.iter_mut() {
                    layer.set_validated_type(Composition::Client);
                    result.num_types += 1;
                }
                result.has_changes = true;
            }
        }

        trace!(
            backend = %self.kind(),
            layers = count,
            num_types = result.num_types,
            has_changes = result.has_changes,
            "validated display"
        );
        result
    }
}

/// Returns true if the layer has to be composited by the host
///
/// That is the case if the requested type cannot be presented by the hardware, the layer
/// has no buffer or the buffer cannot be imported.
pub fn is_client_layer<B, I>(layer: &Layer<B>, importer: &I) -> bool
where
    B: NativeBuffer,
    I: ImportBuffer<B> + ?Sized,
{
    if !layer.requested.hardware_supported() {
        return true;
    }
    match layer.buffer.as_ref() {
        Some(buffer) => !importer.can_import(buffer),
        None => true,
    }
}
