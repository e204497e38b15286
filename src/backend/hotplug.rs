//! Reaction to display connectivity changes
//!
//! When a display is plugged in or removed, the buffers the host shows on it change
//! completely and most cached bindings become stale. [`HotplugHandler`] receives the
//! connectivity events, for example from a udev monitor, and flushes the buffer cache on
//! each of them. Bindings still scanned out survive until their release.

use std::{collections::HashSet, path::PathBuf};

use rustix::fs::Dev;
use tracing::info;

use crate::backend::drm::FlushCache;

/// A display connectivity change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A new device was discovered
    Added {
        /// Device number of the drm node
        device_id: Dev,
        /// Path of the drm node
        path: PathBuf,
    },
    /// The connectors of a device changed
    Changed {
        /// Device number of the drm node
        device_id: Dev,
    },
    /// A device was removed
    Removed {
        /// Device number of the drm node
        device_id: Dev,
    },
}

impl HotplugEvent {
    /// Device number of the node this event refers to
    pub fn device_id(&self) -> Dev {
        match self {
            HotplugEvent::Added { device_id, .. }
            | HotplugEvent::Changed { device_id }
            | HotplugEvent::Removed { device_id } => *device_id,
        }
    }
}

/// Forwards connectivity changes to a buffer cache
#[derive(Debug)]
pub struct HotplugHandler<F: FlushCache> {
    cache: F,
    devices: HashSet<Dev>,
}

impl<F: FlushCache> HotplugHandler<F> {
    /// Create a handler flushing `cache`
    pub fn new(cache: F) -> Self {
        HotplugHandler {
            cache,
            devices: HashSet::new(),
        }
    }

    /// The cache flushed by this handler
    pub fn cache(&self) -> &F {
        &self.cache
    }

    /// Device numbers of the currently known devices
    pub fn devices(&self) -> impl Iterator<Item = Dev> + '_ {
        self.devices.iter().copied()
    }

    /// Process a connectivity change
    pub fn handle_event(&mut self, event: &HotplugEvent) {
        match event {
            HotplugEvent::Added { device_id, path } => {
                info!(device_id, ?path, "display device added");
                self.devices.insert(*device_id);
            }
            HotplugEvent::Changed { device_id } => {
                let known = self.devices.contains(device_id);
                info!(device_id, known, "display device changed");
            }
            HotplugEvent::Removed { device_id } => {
                info!(device_id, "display device removed");
                self.devices.remove(device_id);
            }
        }
        self.cache.handle_hotplug();
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, sync::Arc};

    use super::{HotplugEvent, HotplugHandler};
    use crate::{
        backend::{
            allocator::{BufferIdentity, ImgBufferHandle, VendorFormat},
            drm::{
                test::{DummyKmsDevice, KmsCall},
                BoCache, BoState,
            },
        },
        config::Config,
    };

    fn buffer(stamp: u64) -> ImgBufferHandle {
        let fd = File::open("/dev/null").unwrap().into();
        ImgBufferHandle::new(stamp, (32, 32), VendorFormat::RGBX_8888, vec![fd])
    }

    #[test]
    fn every_event_flushes() {
        let cache = Arc::new(BoCache::new(Arc::new(DummyKmsDevice::new()), &Config::default()));
        let mut handler = HotplugHandler::new(cache.clone());

        cache.import_buffer(&buffer(1)).unwrap();
        cache.import_buffer(&buffer(2)).unwrap();
        cache.release_buffer(BufferIdentity::from(2));

        handler.handle_event(&HotplugEvent::Added {
            device_id: 226,
            path: "/dev/dri/card0".into(),
        });
        assert_eq!(handler.devices().collect::<Vec<_>>(), vec![226]);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.state(BufferIdentity::from(1)),
            Some(BoState {
                in_use: true,
                pending_flush: true,
            })
        );

        cache.import_buffer(&buffer(3)).unwrap();
        cache.release_buffer(BufferIdentity::from(3));
        handler.handle_event(&HotplugEvent::Changed { device_id: 226 });
        assert_eq!(cache.state(BufferIdentity::from(3)), None);

        handler.handle_event(&HotplugEvent::Removed { device_id: 226 });
        assert_eq!(handler.devices().count(), 0);
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 2);

        cache.release_buffer(BufferIdentity::from(1));
        assert!(cache.is_empty());
        assert_eq!(cache.device().invalid_releases(), 0);
    }

    #[test]
    fn change_on_unknown_device_still_flushes() {
        let cache = Arc::new(BoCache::new(Arc::new(DummyKmsDevice::new()), &Config::default()));
        let mut handler = HotplugHandler::new(cache.clone());

        cache.import_buffer(&buffer(1)).unwrap();
        cache.release_buffer(BufferIdentity::from(1));

        handler.handle_event(&HotplugEvent::Changed { device_id: 99 });
        assert_eq!(handler.devices().count(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 1);
    }

    #[test]
    fn event_device_id() {
        let event = HotplugEvent::Removed { device_id: 7 };
        assert_eq!(event.device_id(), 7);
    }
}
