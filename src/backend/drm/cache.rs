//! Cache of buffer bindings keyed by allocation
//!
//! Every frame the host composer imports the buffers of all device composited layers and
//! releases them once the frame is no longer on screen. Most frames show the same few
//! allocations again, so bindings are kept around after their release and reused by the
//! next import of the same [`BufferIdentity`].
//!
//! A binding is only ever torn down while it is unused. Flushing the cache marks all
//! bindings; the unused ones are released right away, the used ones on their next release.
//! The cache is flushed on display hotplug, on explicit request and whenever a release
//! leaves more bindings than the configured capacity. Imports alone never shrink the
//! cache, so a burst of imports without releases may exceed the capacity until the
//! next release.

use std::{
    collections::HashMap,
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use scopeguard::ScopeGuard;
use tracing::{debug, info, trace, warn};

use super::{
    binder::{bind, unbind, ScanoutBuffer},
    error::ImportError,
    FlushCache, ImportBuffer, KmsDevice,
};
use crate::{
    backend::allocator::{
        format::{translate, FormatLayout},
        native::check_handle,
        BufferIdentity, NativeBuffer,
    },
    config::Config,
};

/// Usage state of a cached binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoState {
    /// A composition pass references the binding
    pub in_use: bool,
    /// The binding is torn down as soon as it is unused
    pub pending_flush: bool,
}

#[derive(Debug)]
struct CachedBo {
    buffer: ScanoutBuffer,
    state: BoState,
}

#[derive(Debug)]
enum Slot {
    // The binding is being created by an importer that does not hold the lock
    Binding { flush_requested: bool },
    Bound(CachedBo),
}

/// Cache of [`ScanoutBuffer`]s
///
/// The cache is meant to be shared (e.g. in an [`Arc`](std::sync::Arc)) between the thread
/// validating and committing frames and the thread receiving hotplug events.
pub struct BoCache<D: KmsDevice> {
    drm: D,
    capacity: usize,
    hw_align: u32,
    slots: Mutex<HashMap<BufferIdentity, Slot>>,
    bound: Condvar,
}

impl<D: KmsDevice + fmt::Debug> fmt::Debug for BoCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoCache")
            .field("drm", &self.drm)
            .field("capacity", &self.capacity)
            .field("hw_align", &self.hw_align)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl<D: KmsDevice> BoCache<D> {
    /// Create an empty cache binding buffers on `drm`.
    pub fn new(drm: D, config: &Config) -> Self {
        BoCache {
            drm,
            capacity: config.cache_capacity,
            hw_align: config.hw_align,
            slots: Mutex::new(HashMap::new()),
            bound: Condvar::new(),
        }
    }

    /// The device bindings are created on
    pub fn device(&self) -> &D {
        &self.drm
    }

    /// Number of bound buffers held by the cache
    pub fn len(&self) -> usize {
        bound_count(&self.lock())
    }

    /// Returns true if the cache holds no bound buffers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usage state of the binding of `identity`, if one is cached
    pub fn state(&self, identity: BufferIdentity) -> Option<BoState> {
        match self.lock().get(&identity) {
            Some(Slot::Bound(bo)) => Some(bo.state),
            _ => None,
        }
    }

    /// Translate the format of `buffer` into its scan-out layout.
    ///
    /// This creates no kernel resources.
    pub fn convert<B: NativeBuffer + ?Sized>(&self, buffer: &B) -> Result<FormatLayout, ImportError> {
        check_handle(&buffer).map_err(ImportError::InvalidHandle)?;
        Ok(translate(buffer.format(), buffer.size(), self.hw_align)?)
    }

    /// Return the binding of the buffer's allocation, binding it if necessary.
    ///
    /// The binding is marked as used until the next [`BoCache::release_buffer`] of its
    /// identity. A failed import leaves the cache untouched.
    #[profiling::function]
    pub fn import_buffer<B: NativeBuffer + ?Sized>(&self, buffer: &B) -> Result<ScanoutBuffer, ImportError> {
        check_handle(&buffer).map_err(ImportError::InvalidHandle)?;
        let identity = buffer.identity();

        {
            let mut slots = self.lock();
            loop {
                match slots.get_mut(&identity) {
                    Some(Slot::Bound(bo)) => {
                        trace!(%identity, fb = ?bo.buffer.framebuffer(), "reusing cached binding");
                        bo.state.in_use = true;
                        return Ok(bo.buffer.clone());
                    }
                    Some(Slot::Binding { .. }) => {
                        trace!(%identity, "waiting for concurrent binding");
                        slots = self.bound.wait(slots).unwrap_or_else(PoisonError::into_inner);
                    }
                    None => {
                        slots.insert(
                            identity,
                            Slot::Binding {
                                flush_requested: false,
                            },
                        );
                        break;
                    }
                }
            }
        }

        // Drops the reservation and wakes waiting importers if binding unwinds.
        let reservation = scopeguard::guard((), |()| {
            self.lock().remove(&identity);
            self.bound.notify_all();
        });

        trace!(%identity, "binding uncached buffer");
        let result = self
            .convert(buffer)
            .and_then(|layout| bind(&self.drm, buffer, &layout).map_err(ImportError::from));
        ScopeGuard::into_inner(reservation);

        let mut slots = self.lock();
        let flush_requested = matches!(
            slots.remove(&identity),
            Some(Slot::Binding {
                flush_requested: true
            })
        );
        let result = match result {
            Ok(scanout) => {
                slots.insert(
                    identity,
                    Slot::Bound(CachedBo {
                        buffer: scanout.clone(),
                        state: BoState {
                            in_use: true,
                            pending_flush: flush_requested,
                        },
                    }),
                );
                Ok(scanout)
            }
            Err(err) => {
                warn!(%identity, ?err, "could not import buffer");
                Err(err)
            }
        };
        drop(slots);
        self.bound.notify_all();

        result
    }

    /// Mark the binding of `identity` as unused.
    ///
    /// Bindings marked by a flush are torn down right away. If the cache holds more
    /// bindings than its capacity afterwards, it is flushed.
    #[profiling::function]
    pub fn release_buffer(&self, identity: BufferIdentity) {
        let mut slots = self.lock();

        let teardown = match slots.get_mut(&identity) {
            Some(Slot::Bound(bo)) => {
                bo.state.in_use = false;
                bo.state.pending_flush
            }
            _ => {
                trace!(%identity, "release of uncached buffer");
                false
            }
        };
        if teardown {
            if let Some(Slot::Bound(bo)) = slots.remove(&identity) {
                debug!(%identity, "releasing flushed binding");
                unbind(&self.drm, &bo.buffer);
            }
        }

        if bound_count(&slots) > self.capacity {
            let released = self.sweep(&mut slots);
            debug!(released, capacity = self.capacity, "cache exceeded capacity");
        }
    }

    /// Mark every binding for teardown and release the unused ones.
    ///
    /// Returns the number of released bindings.
    #[profiling::function]
    pub fn flush(&self) -> usize {
        let mut slots = self.lock();
        debug!(size = bound_count(&slots), "flushing buffer cache");
        self.sweep(&mut slots)
    }

    fn sweep(&self, slots: &mut HashMap<BufferIdentity, Slot>) -> usize {
        let mut unused = Vec::new();
        for (identity, slot) in slots.iter_mut() {
            match slot {
                Slot::Binding { flush_requested } => *flush_requested = true,
                Slot::Bound(bo) => {
                    bo.state.pending_flush = true;
                    if !bo.state.in_use {
                        unused.push(*identity);
                    }
                }
            }
        }

        let mut released = 0;
        for identity in unused {
            if let Some(Slot::Bound(bo)) = slots.remove(&identity) {
                trace!(%identity, fb = ?bo.buffer.framebuffer(), "releasing unused binding");
                unbind(&self.drm, &bo.buffer);
                released += 1;
            }
        }
        released
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BufferIdentity, Slot>> {
        // every mutation leaves the map consistent, so a poisoned lock is still usable
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bound_count(slots: &HashMap<BufferIdentity, Slot>) -> usize {
    slots
        .values()
        .filter(|slot| matches!(slot, Slot::Bound(_)))
        .count()
}

impl<D: KmsDevice> Drop for BoCache<D> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (identity, slot) in slots.drain() {
            if let Slot::Bound(bo) = slot {
                if bo.state.in_use {
                    warn!(%identity, "dropping cache with binding in use");
                }
                unbind(&self.drm, &bo.buffer);
            }
        }
    }
}

impl<D, B> ImportBuffer<B> for BoCache<D>
where
    D: KmsDevice,
    B: NativeBuffer,
{
    type Error = ImportError;

    #[inline]
    fn import_buffer(&self, buffer: &B) -> Result<ScanoutBuffer, ImportError> {
        BoCache::import_buffer(self, buffer)
    }

    #[inline]
    fn release_buffer(&self, identity: BufferIdentity) {
        BoCache::release_buffer(self, identity)
    }

    #[inline]
    fn can_import(&self, buffer: &B) -> bool {
        self.convert(buffer).is_ok()
    }
}

impl<D: KmsDevice> FlushCache for BoCache<D> {
    #[inline]
    fn flush_cache(&self) -> usize {
        self.flush()
    }

    fn handle_hotplug(&self) {
        let released = self.flush();
        info!(released, "display hotplug, flushed buffer cache");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        os::unix::io::OwnedFd,
        sync::{mpsc, Arc, Barrier},
        thread,
        time::Duration,
    };

    use super::{BoCache, BoState};
    use crate::{
        backend::{
            allocator::{BufferIdentity, Fourcc, ImgBufferHandle, VendorFormat},
            drm::{
                error::ImportError,
                test::{DummyKmsDevice, KmsCall},
                FlushCache, ImportBuffer,
            },
        },
        config::Config,
    };

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    fn buffer(stamp: u64) -> ImgBufferHandle {
        ImgBufferHandle::new(stamp, (100, 100), VendorFormat::BGRX_8888, vec![fd()])
    }

    fn cache() -> BoCache<Arc<DummyKmsDevice>> {
        init_logging();
        BoCache::new(Arc::new(DummyKmsDevice::new()), &Config::default())
    }

    fn id(stamp: u64) -> BufferIdentity {
        BufferIdentity::from(stamp)
    }

    const USED: BoState = BoState {
        in_use: true,
        pending_flush: false,
    };
    const UNUSED: BoState = BoState {
        in_use: false,
        pending_flush: false,
    };
    const USED_FLUSHING: BoState = BoState {
        in_use: true,
        pending_flush: true,
    };

    #[test]
    fn repeated_import_hits_cache() {
        let cache = cache();
        let first = cache.import_buffer(&buffer(1)).unwrap();
        let second = cache.import_buffer(&buffer(1)).unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.device().count(KmsCall::ImportPrime), 1);
        assert_eq!(cache.device().count(KmsCall::AddFramebuffer), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.state(id(1)), Some(USED));
    }

    #[test]
    fn handle_instances_share_binding() {
        let cache = cache();
        let original = buffer(1);
        let duplicate = original.try_clone().unwrap();

        let first = cache.import_buffer(&original).unwrap();
        let second = cache.import_buffer(&duplicate).unwrap();
        assert_eq!(first.framebuffer(), second.framebuffer());
        assert_eq!(cache.device().count(KmsCall::AddFramebuffer), 1);
    }

    #[test]
    fn release_keeps_binding_cached() {
        let cache = cache();
        let scanout = cache.import_buffer(&buffer(1)).unwrap();
        cache.release_buffer(id(1));

        assert_eq!(cache.state(id(1)), Some(UNUSED));
        assert!(cache.device().is_live(scanout.framebuffer()));

        let again = cache.import_buffer(&buffer(1)).unwrap();
        assert_eq!(again, scanout);
        assert_eq!(cache.state(id(1)), Some(USED));
        assert_eq!(cache.device().count(KmsCall::AddFramebuffer), 1);
    }

    #[test]
    fn release_of_unknown_identity_is_ignored() {
        let cache = cache();
        cache.release_buffer(id(99));
        assert!(cache.is_empty());
        assert_eq!(cache.state(id(99)), None);
    }

    #[test]
    fn import_release_hotplug_scenario() {
        let cache = cache();

        let scanout = cache.import_buffer(&buffer(1)).unwrap();
        assert_eq!(scanout.format().code, Fourcc::Xrgb8888);
        assert_eq!(scanout.layout().gem_handles().count(), 1);
        assert_eq!(drm::buffer::PlanarBuffer::pitches(scanout.layout())[0], 512);

        assert_eq!(cache.import_buffer(&buffer(1)).unwrap(), scanout);
        assert_eq!(cache.device().count(KmsCall::AddFramebuffer), 1);

        cache.release_buffer(id(1));
        assert_eq!(cache.state(id(1)), Some(UNUSED));

        // the binding is unused, so the flush releases it right away
        cache.handle_hotplug();
        assert_eq!(cache.state(id(1)), None);
        assert!(!cache.device().is_live(scanout.framebuffer()));
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 1);

        cache.release_buffer(id(1));
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 1);
        assert_eq!(cache.device().invalid_releases(), 0);
    }

    #[test]
    fn hotplug_defers_teardown_of_used_bindings() {
        let cache = cache();
        let scanouts: Vec<_> = (1..=3)
            .map(|stamp| cache.import_buffer(&buffer(stamp)).unwrap())
            .collect();

        assert_eq!(cache.flush_cache(), 0);
        for (stamp, scanout) in (1..=3).zip(&scanouts) {
            assert_eq!(cache.state(id(stamp)), Some(USED_FLUSHING));
            assert!(cache.device().is_live(scanout.framebuffer()));
        }
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 0);

        cache.release_buffer(id(2));
        assert_eq!(cache.state(id(2)), None);
        assert!(!cache.device().is_live(scanouts[1].framebuffer()));
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn flushed_binding_is_reused_until_release() {
        let cache = cache();
        let scanout = cache.import_buffer(&buffer(1)).unwrap();
        cache.flush();

        // a second consumer picks the binding up before the first releases it
        assert_eq!(cache.import_buffer(&buffer(1)).unwrap(), scanout);
        assert_eq!(cache.state(id(1)), Some(USED_FLUSHING));

        cache.release_buffer(id(1));
        assert_eq!(cache.state(id(1)), None);
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 1);
        assert_eq!(cache.device().live_handles(), 0);
    }

    #[test]
    fn unsupported_format_is_not_cached() {
        let cache = cache();
        let compressed = ImgBufferHandle::new(
            1,
            (100, 100),
            VendorFormat::from_raw(VendorFormat::RGBA_8888.raw() | 0x4000),
            vec![fd()],
        );

        let err = cache.import_buffer(&compressed).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedFormat(_)));
        assert!(!err.is_transient());
        assert!(cache.is_empty());
        assert_eq!(cache.device().count(KmsCall::ImportPrime), 0);
        assert!(!cache.can_import(&compressed));
        assert!(cache.can_import(&buffer(2)));
    }

    #[test]
    fn invalid_handle_is_rejected() {
        let cache = cache();
        let empty = ImgBufferHandle::new(1, (100, 100), VendorFormat::RGBA_8888, Vec::new());

        assert!(matches!(
            cache.import_buffer(&empty),
            Err(ImportError::InvalidHandle(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn bind_failure_leaves_cache_unchanged() {
        let cache = cache();
        cache.device().fail_next(KmsCall::AddFramebuffer);

        let err = cache.import_buffer(&buffer(1)).unwrap_err();
        assert!(matches!(err, ImportError::ResourceBindFailed(_)));
        assert!(err.is_transient());
        assert!(cache.is_empty());
        assert_eq!(cache.device().live_handles(), 0);

        // the next frame may try again
        cache.import_buffer(&buffer(1)).unwrap();
        assert_eq!(cache.state(id(1)), Some(USED));
    }

    #[test]
    fn capacity_exceeded_without_release() {
        let cache = cache();
        for stamp in 1..=7 {
            cache.import_buffer(&buffer(stamp)).unwrap();
        }
        assert_eq!(cache.len(), 7);

        assert_eq!(cache.flush(), 0);
        assert_eq!(cache.len(), 7);
        for stamp in 1..=7 {
            assert_eq!(cache.state(id(stamp)), Some(USED_FLUSHING));
        }
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 0);
    }

    #[test]
    fn release_over_capacity_sweeps_unused() {
        let cache = cache();
        for stamp in 1..=6 {
            cache.import_buffer(&buffer(stamp)).unwrap();
            cache.release_buffer(id(stamp));
        }
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 0);

        cache.import_buffer(&buffer(7)).unwrap();
        cache.import_buffer(&buffer(8)).unwrap();
        cache.release_buffer(id(8));

        // 8 bindings over a capacity of 6: every unused one goes, the used one is marked
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.state(id(7)), Some(USED_FLUSHING));
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 7);

        cache.release_buffer(id(7));
        assert!(cache.is_empty());
        assert_eq!(cache.device().live_framebuffers(), 0);
        assert_eq!(cache.device().live_handles(), 0);
        assert_eq!(cache.device().invalid_releases(), 0);
    }

    #[test]
    fn concurrent_imports_share_one_binding() {
        let drm = Arc::new(DummyKmsDevice::new());
        drm.set_import_delay(Duration::from_millis(20));
        let cache = Arc::new(BoCache::new(drm.clone(), &Config::default()));
        let barrier = Arc::new(Barrier::new(4));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let handle = buffer(1);
                    barrier.wait();
                    cache.import_buffer(&handle).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(drm.count(KmsCall::AddFramebuffer), 1);
        assert_eq!(cache.state(id(1)), Some(USED));
    }

    #[test]
    fn flush_during_bind_marks_new_binding() {
        init_logging();
        let drm = Arc::new(DummyKmsDevice::new());
        let gate = Arc::new(Barrier::new(2));
        drm.gate_next_import(gate.clone());
        let cache = Arc::new(BoCache::new(drm.clone(), &Config::default()));

        let importer = {
            let cache = cache.clone();
            thread::spawn(move || cache.import_buffer(&buffer(1)).unwrap())
        };
        // the importer is inside the prime import, its slot is reserved but not bound yet
        gate.wait();
        assert_eq!(cache.flush(), 0);
        assert_eq!(cache.state(id(1)), None);
        gate.wait();
        let scanout = importer.join().unwrap();

        assert_eq!(cache.state(id(1)), Some(USED_FLUSHING));
        assert!(drm.is_live(scanout.framebuffer()));

        BoCache::release_buffer(&cache, id(1));
        assert_eq!(cache.state(id(1)), None);
        assert!(cache.is_empty());
        assert!(!drm.is_live(scanout.framebuffer()));
        assert_eq!(drm.count(KmsCall::DestroyFramebuffer), 1);
        assert_eq!(drm.live_handles(), 0);
    }

    #[test]
    fn panicking_bind_drops_reservation() {
        init_logging();
        let drm = Arc::new(DummyKmsDevice::new());
        drm.panic_next_import();
        let cache = Arc::new(BoCache::new(drm.clone(), &Config::default()));

        let panicked = {
            let cache = cache.clone();
            thread::spawn(move || BoCache::import_buffer(&cache, &buffer(1))).join()
        };
        assert!(panicked.is_err());
        assert_eq!(cache.state(id(1)), None);

        // a later import of the same allocation must not wait for the abandoned binding
        let (tx, rx) = mpsc::channel();
        {
            let cache = cache.clone();
            thread::spawn(move || {
                let _ = tx.send(BoCache::import_buffer(&cache, &buffer(1)).is_ok());
            });
        }
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(cache.state(id(1)), Some(USED));
        assert_eq!(drm.count(KmsCall::AddFramebuffer), 1);
    }

    #[test]
    fn unbind_happens_once_per_binding() {
        let cache = cache();
        for _ in 0..3 {
            cache.import_buffer(&buffer(1)).unwrap();
            cache.flush();
            cache.release_buffer(id(1));
            cache.release_buffer(id(1));
            cache.flush();
        }
        assert_eq!(cache.device().count(KmsCall::AddFramebuffer), 3);
        assert_eq!(cache.device().count(KmsCall::DestroyFramebuffer), 3);
        assert_eq!(cache.device().invalid_releases(), 0);
    }

    #[test]
    fn dropping_cache_releases_everything() {
        let drm = Arc::new(DummyKmsDevice::new());
        {
            let cache = BoCache::new(drm.clone(), &Config::default());
            cache.import_buffer(&buffer(1)).unwrap();
            cache.import_buffer(&buffer(2)).unwrap();
            cache.release_buffer(id(2));
        }
        assert_eq!(drm.live_framebuffers(), 0);
        assert_eq!(drm.live_handles(), 0);
    }

    #[test]
    fn cache_is_send_and_sync() {
        fn is_send_sync<S: Send + Sync>() {}
        is_send_sync::<BoCache<Arc<DummyKmsDevice>>>();
    }

    #[test]
    fn import_through_trait_object() {
        let cache: Arc<dyn ImportBuffer<ImgBufferHandle, Error = ImportError>> = Arc::new(self::cache());
        let scanout = cache.import_buffer(&buffer(5)).unwrap();
        cache.release_buffer(scanout.identity());
        assert!(cache.can_import(&buffer(6)));
    }
}
