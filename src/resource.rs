//! The resource capability trait and the objects the manager keeps per resource.

use std::{
    any::{Any, TypeId},
    fmt,
    io::Read,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use derivative::Derivative;
use parking_lot::{Mutex, RwLock};

use crate::{
    handle::Handle,
    loader::ResourceLoader,
    state::{
        AtomicResourceFlags, AtomicResourceState, LoadDesc, MemoryUsage, ResourceFlags,
        ResourcePriority, ResourceState, Unload,
    },
};

/// A kind of loadable content, like a texture or a mesh.
///
/// The manager owns one instance per resource ID and drives it through
/// `update_content` and `unload_data`. Implementations never report errors;
/// a failed load returns a `LoadDesc` with `ResourceState::LoadedResourceMissing`.
///
/// Content is published as immutable snapshots: a `ResourceLock` keeps the
/// snapshot it was acquired with, and every change is made on a clone of the
/// current snapshot that replaces it once done.
pub trait Resource: Clone + Default + Send + Sync + 'static {
    /// Name of the resource type, used for logging and events.
    const NAME: &'static str;

    /// Data used to create a resource in memory, see `ResourceManager::create_resource`.
    type Descriptor: Send;

    /// Whether content updates of this type have to happen on the main thread.
    fn update_on_main_thread() -> bool {
        false
    }

    /// Loader used for this type when neither a custom nor a registered type loader exists.
    fn default_loader() -> Option<Arc<dyn ResourceLoader>> {
        None
    }

    /// Creates the content from an in-memory descriptor.
    fn create_from_descriptor(&mut self, info: &ResourceInfo, descriptor: Self::Descriptor)
        -> LoadDesc;

    /// Loads content from `data`. `None` means the loader could not provide any data.
    ///
    /// May be called several times to load additional quality levels.
    fn update_content(&mut self, info: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc;

    /// Drops content. The returned state must not be above `LoadedResourceMissing`
    /// when unloading all quality levels.
    ///
    /// Queued resources are unloaded while the manager is locked, so this
    /// must not call back into the `ResourceManager`.
    fn unload_data(&mut self, unload: Unload) -> LoadDesc;

    /// Memory currently held by the content.
    fn memory_usage(&self) -> MemoryUsage;
}

/// Identity and bookkeeping of a resource, independent of its type.
///
/// Everything in here can be read without locking, so checking the state of a
/// resource never contends with loading it.
pub struct ResourceInfo {
    id: String,
    type_id: TypeId,
    type_name: &'static str,
    description: Mutex<String>,
    state: AtomicResourceState,
    flags: AtomicResourceFlags,
    priority: AtomicU8,
    last_acquire: AtomicU64,
    quality_levels_discardable: AtomicU8,
    quality_levels_loadable: AtomicU8,
    memory_cpu: AtomicU64,
    memory_gpu: AtomicU64,
    change_counter: AtomicU32,
    modification_time: Mutex<Option<SystemTime>>,
    acquire_count: AtomicUsize,
}

impl ResourceInfo {
    pub(crate) fn new(
        id: String,
        type_id: TypeId,
        type_name: &'static str,
        flags: ResourceFlags,
        priority: ResourcePriority,
    ) -> Self {
        ResourceInfo {
            description: Mutex::new(id.clone()),
            id,
            type_id,
            type_name,
            state: AtomicResourceState::new(ResourceState::Unloaded),
            flags: AtomicResourceFlags::new(flags),
            priority: AtomicU8::new(priority as u8),
            last_acquire: AtomicU64::new(0),
            quality_levels_discardable: AtomicU8::new(0),
            quality_levels_loadable: AtomicU8::new(0),
            memory_cpu: AtomicU64::new(0),
            memory_gpu: AtomicU64::new(0),
            change_counter: AtomicU32::new(0),
            modification_time: Mutex::new(None),
            acquire_count: AtomicUsize::new(0),
        }
    }

    /// The resource ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `TypeId` of the resource type.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// `Resource::NAME` of the resource type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Human readable description, set by the loader. Defaults to the ID.
    pub fn description(&self) -> String {
        self.description.lock().clone()
    }

    pub(crate) fn set_description(&self, description: &str) {
        *self.description.lock() = description.to_owned();
    }

    /// Current loading state.
    pub fn state(&self) -> ResourceState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.state.store(state);
    }

    /// Current flags.
    pub fn flags(&self) -> ResourceFlags {
        self.flags.get()
    }

    pub(crate) fn flags_mut(&self) -> &AtomicResourceFlags {
        &self.flags
    }

    /// Whether the resource is queued for loading or claimed by a worker.
    pub fn is_queued_for_loading(&self) -> bool {
        self.flags.contains(ResourceFlags::IS_QUEUED_FOR_LOADING)
    }

    /// Base priority of the resource.
    pub fn priority(&self) -> ResourcePriority {
        ResourcePriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    /// Sets the priority, returning the previous one.
    pub(crate) fn set_priority(&self, priority: ResourcePriority) -> ResourcePriority {
        ResourcePriority::from_u8(self.priority.swap(priority as u8, Ordering::Relaxed))
    }

    /// Frame time of the last acquire that needed content.
    pub fn last_acquire(&self) -> Duration {
        Duration::from_nanos(self.last_acquire.load(Ordering::Relaxed))
    }

    pub(crate) fn set_last_acquire(&self, time: Duration) {
        self.last_acquire
            .store(time.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Quality levels that could be dropped while staying usable.
    pub fn quality_levels_discardable(&self) -> u8 {
        self.quality_levels_discardable.load(Ordering::Acquire)
    }

    /// Quality levels that could still be loaded.
    pub fn quality_levels_loadable(&self) -> u8 {
        self.quality_levels_loadable.load(Ordering::Acquire)
    }

    /// Stores the outcome of a content change. The state is written last.
    pub(crate) fn apply(&self, desc: LoadDesc) {
        self.quality_levels_discardable
            .store(desc.quality_levels_discardable, Ordering::Release);
        self.quality_levels_loadable
            .store(desc.quality_levels_loadable, Ordering::Release);
        self.state.store(desc.state);
    }

    /// Memory used by the content, as of the last content change.
    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(
            self.memory_cpu.load(Ordering::Relaxed),
            self.memory_gpu.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_memory_usage(&self, usage: MemoryUsage) {
        self.memory_cpu.store(usage.cpu, Ordering::Relaxed);
        self.memory_gpu.store(usage.gpu, Ordering::Relaxed);
    }

    /// Incremented every time the content changes.
    pub fn change_counter(&self) -> u32 {
        self.change_counter.load(Ordering::Acquire)
    }

    pub(crate) fn increment_change_counter(&self) {
        self.change_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Modification time of the data the content was loaded from, if known.
    pub fn modification_time(&self) -> Option<SystemTime> {
        *self.modification_time.lock()
    }

    pub(crate) fn set_modification_time(&self, time: SystemTime) {
        *self.modification_time.lock() = Some(time);
    }

    /// Number of `ResourceLock`s currently held for this resource.
    pub fn acquire_count(&self) -> usize {
        self.acquire_count.load(Ordering::Acquire)
    }

    pub(crate) fn begin_acquire(&self) {
        self.acquire_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_acquire(&self) {
        let previous = self.acquire_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "Unbalanced end of acquire on '{}'", self.id);
    }

    /// Priority used to order the loading queue. Smaller loads earlier.
    pub fn loading_priority(&self, now: Duration) -> f32 {
        let priority = self.priority();
        if priority == ResourcePriority::Critical {
            return 0.0;
        }

        let mut value = priority as u8 as f32 * 10.0;

        if self.state() == ResourceState::Loaded {
            // loaded content can already be shown, more details are less urgent
            value += 30.0;
            value += self.quality_levels_discardable() as f32 * 10.0;
        } else {
            let flags = self.flags();
            if flags.contains(ResourceFlags::RESOURCE_HAS_FALLBACK) {
                value += 20.0;
            } else if flags.contains(ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK) {
                value += 10.0;
            }
        }

        let since_acquire = now.checked_sub(self.last_acquire()).unwrap_or_default();
        value + since_acquire.as_secs_f32().min(10.0)
    }
}

impl fmt::Debug for ResourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInfo")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .finish()
    }
}

/// A resource as stored in the registry: bookkeeping plus the content.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ResourceObject<R: Resource> {
    info: ResourceInfo,
    #[derivative(Debug = "ignore")]
    content: RwLock<Arc<R>>,
    #[derivative(Debug = "ignore")]
    loading_fallback: Mutex<Option<Handle<R>>>,
}

impl<R: Resource> ResourceObject<R> {
    pub(crate) fn new(id: String, flags: ResourceFlags, priority: ResourcePriority) -> Self {
        ResourceObject {
            info: ResourceInfo::new(id, TypeId::of::<R>(), R::NAME, flags, priority),
            content: RwLock::new(Arc::new(R::default())),
            loading_fallback: Mutex::new(None),
        }
    }

    /// Bookkeeping of this resource.
    pub fn info(&self) -> &ResourceInfo {
        &self.info
    }

    /// The current content snapshot.
    pub(crate) fn content(&self) -> Arc<R> {
        Arc::clone(&*self.content.read())
    }

    /// Changes a copy of the content and publishes it. Only the thread that
    /// claimed the resource writes, so no change gets lost.
    fn modify<F>(&self, change: F) -> LoadDesc
    where
        F: FnOnce(&mut R) -> LoadDesc,
    {
        let mut next = R::clone(&self.content());
        let desc = change(&mut next);
        *self.content.write() = Arc::new(next);
        desc
    }

    pub(crate) fn loading_fallback(&self) -> Option<Handle<R>> {
        self.loading_fallback.lock().clone()
    }

    pub(crate) fn set_loading_fallback(&self, fallback: Option<Handle<R>>) {
        self.info
            .flags
            .set(ResourceFlags::RESOURCE_HAS_FALLBACK, fallback.is_some());
        *self.loading_fallback.lock() = fallback;
    }

    pub(crate) fn create(&self, descriptor: R::Descriptor) -> LoadDesc {
        self.modify(|content| content.create_from_descriptor(&self.info, descriptor))
    }
}

/// Type erased access to a `ResourceObject`, used by the queue and the workers.
pub(crate) trait AnyResource: Send + Sync {
    fn info(&self) -> &ResourceInfo;

    fn update_content(&self, data: Option<&mut dyn Read>) -> LoadDesc;

    fn unload_data(&self, unload: Unload) -> LoadDesc;

    fn memory_usage(&self) -> MemoryUsage;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Resource> AnyResource for ResourceObject<R> {
    fn info(&self) -> &ResourceInfo {
        &self.info
    }

    fn update_content(&self, data: Option<&mut dyn Read>) -> LoadDesc {
        self.modify(|content| content.update_content(&self.info, data))
    }

    fn unload_data(&self, unload: Unload) -> LoadDesc {
        self.modify(|content| content.unload_data(unload))
    }

    fn memory_usage(&self) -> MemoryUsage {
        self.content().memory_usage()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shared reference to a type erased resource. Compares by identity.
#[derive(Clone)]
pub(crate) struct ResourceRef(pub Arc<dyn AnyResource>);

impl ResourceRef {
    pub fn downcast<R: Resource>(&self) -> Option<Arc<ResourceObject<R>>> {
        Arc::clone(&self.0).into_any().downcast::<ResourceObject<R>>().ok()
    }

    /// Only the registry holds on to it.
    pub fn is_unused(&self) -> bool {
        Arc::strong_count(&self.0) == 1 && !self.info().is_queued_for_loading()
    }

    fn addr(&self) -> *const u8 {
        Arc::as_ptr(&self.0) as *const u8
    }
}

impl<R: Resource> From<Arc<ResourceObject<R>>> for ResourceRef {
    fn from(object: Arc<ResourceObject<R>>) -> Self {
        ResourceRef(object)
    }
}

impl std::ops::Deref for ResourceRef {
    type Target = dyn AnyResource;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ResourceRef {}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.info().type_name(), self.info().id())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, sync::Arc, time::Duration};

    use super::*;

    #[derive(Clone, Default)]
    struct Blob(Vec<u8>);

    impl Resource for Blob {
        const NAME: &'static str = "Blob";
        type Descriptor = Vec<u8>;

        fn create_from_descriptor(&mut self, _: &ResourceInfo, descriptor: Vec<u8>) -> LoadDesc {
            self.0 = descriptor;
            LoadDesc::loaded()
        }

        fn update_content(&mut self, _: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc {
            match data {
                Some(data) => {
                    self.0.clear();
                    data.read_to_end(&mut self.0).expect("Failed to read blob");
                    LoadDesc::loaded()
                }
                None => LoadDesc::missing(),
            }
        }

        fn unload_data(&mut self, _: Unload) -> LoadDesc {
            self.0.clear();
            LoadDesc::unloaded()
        }

        fn memory_usage(&self) -> MemoryUsage {
            MemoryUsage::new(self.0.len() as u64, 0)
        }
    }

    fn blob(flags: ResourceFlags, priority: ResourcePriority) -> ResourceObject<Blob> {
        ResourceObject::new("blob".to_string(), flags, priority)
    }

    #[test]
    fn critical_priority_is_always_zero() {
        let object = blob(ResourceFlags::empty(), ResourcePriority::Critical);
        assert_eq!(0.0, object.info().loading_priority(Duration::from_secs(100)));
    }

    #[test]
    fn loading_priority_penalizes_fallbacks_and_age() {
        let now = Duration::from_secs(100);

        let plain = blob(ResourceFlags::empty(), ResourcePriority::Normal);
        plain.info().set_last_acquire(now);
        assert_eq!(30.0, plain.info().loading_priority(now));

        let type_fallback = blob(
            ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK,
            ResourcePriority::Normal,
        );
        type_fallback.info().set_last_acquire(now);
        assert_eq!(40.0, type_fallback.info().loading_priority(now));

        let own_fallback = blob(
            ResourceFlags::RESOURCE_HAS_FALLBACK | ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK,
            ResourcePriority::Normal,
        );
        own_fallback.info().set_last_acquire(now - Duration::from_secs(4));
        assert_eq!(54.0, own_fallback.info().loading_priority(now));

        // the age penalty is capped
        let stale = blob(ResourceFlags::empty(), ResourcePriority::Low);
        assert_eq!(50.0, stale.info().loading_priority(now));
    }

    #[test]
    fn loaded_resources_rank_behind_unloaded_ones() {
        let now = Duration::from_secs(1);
        let object = blob(ResourceFlags::empty(), ResourcePriority::High);
        object.info().set_last_acquire(now);
        object.info().apply(LoadDesc::new(ResourceState::Loaded, 2, 1));

        assert_eq!(20.0 + 30.0 + 20.0, object.info().loading_priority(now));
    }

    #[test]
    fn erased_update_reaches_the_content() {
        let object = Arc::new(blob(ResourceFlags::empty(), ResourcePriority::Normal));
        let erased = ResourceRef::from(Arc::clone(&object));

        let mut data: &[u8] = b"abc";
        let desc = erased.update_content(Some(&mut data));

        assert_eq!(LoadDesc::loaded(), desc);
        assert_eq!(MemoryUsage::new(3, 0), erased.memory_usage());
        assert_eq!(b"abc".to_vec(), object.content().0);
        assert!(erased.downcast::<Blob>().is_some());
    }

    #[test]
    fn updates_publish_a_new_snapshot() {
        let object = blob(ResourceFlags::empty(), ResourcePriority::Normal);
        let mut data: &[u8] = b"old";
        object.update_content(Some(&mut data));

        let pinned = object.content();
        let mut data: &[u8] = b"new";
        object.update_content(Some(&mut data));
        object.unload_data(Unload::AllQualityLevels);

        assert_eq!(b"old".to_vec(), pinned.0);
        assert!(object.content().0.is_empty());
    }

    #[test]
    fn refs_compare_by_identity() {
        let a = ResourceRef::from(Arc::new(blob(ResourceFlags::empty(), ResourcePriority::Normal)));
        let b = ResourceRef::from(Arc::new(blob(ResourceFlags::empty(), ResourcePriority::Normal)));

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
