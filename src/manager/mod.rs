//! The resource manager: registry, loading queue, worker tasks, acquiring and reloading.

pub use self::acquire::ResourceLock;

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use derive_new::new;
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, error, info};
use parking_lot::Mutex;
#[cfg(feature = "profiler")]
use thread_profiler::profile_scope;

use self::workers::WorkerSlot;
use crate::{
    config::StreamingConfig,
    error::Error,
    events::{EventChannel, ManagerEvent, ResourceEvent, ResourceEventType, SubscriberId},
    handle::Handle,
    loader::{FileLoader, ResourceLoader},
    queue::LoadingQueue,
    resource::{Resource, ResourceInfo, ResourceObject, ResourceRef},
    state::{ResourceFlags, ResourcePriority, ResourceState},
    task::{RayonTaskSystem, TaskSystem},
};

mod acquire;
mod loading;
mod workers;

/// Per type settings.
struct TypeInfo {
    loader: Option<Arc<dyn ResourceLoader>>,
    default_loader: Option<Arc<dyn ResourceLoader>>,
    default_priority: ResourcePriority,
    // both hold a `Handle<R>` of the type they are registered for
    loading_fallback: Option<Box<dyn Any + Send + Sync>>,
    missing_fallback: Option<Box<dyn Any + Send + Sync>>,
    incremental_unload: bool,
}

impl TypeInfo {
    fn of<R: Resource>() -> Self {
        TypeInfo {
            loader: None,
            default_loader: R::default_loader(),
            default_priority: ResourcePriority::default(),
            loading_fallback: None,
            missing_fallback: None,
            incremental_unload: true,
        }
    }

    fn loading_fallback<R: Resource>(&self) -> Option<Handle<R>> {
        self.loading_fallback
            .as_ref()
            .and_then(|f| f.downcast_ref::<Handle<R>>())
            .cloned()
    }

    fn missing_fallback<R: Resource>(&self) -> Option<Handle<R>> {
        self.missing_fallback
            .as_ref()
            .and_then(|f| f.downcast_ref::<Handle<R>>())
            .cloned()
    }
}

/// Everything guarded by the manager lock.
struct ManagerState {
    resources: BTreeMap<TypeId, BTreeMap<String, ResourceRef>>,
    type_infos: FnvHashMap<TypeId, TypeInfo>,
    queue: LoadingQueue<ResourceRef>,
    data_load_slots: Vec<WorkerSlot>,
    update_content_slots: Vec<WorkerSlot>,
    worker_slots_initialized: bool,
    allow_launch_data_load: bool,
    custom_loaders: FnvHashMap<(TypeId, String), Arc<dyn ResourceLoader>>,
    default_loader: Option<Arc<dyn ResourceLoader>>,
    named_resources: FnvHashMap<String, String>,
    next_resource_id: u64,
    main_thread_unloads: BTreeSet<(TypeId, String)>,
    nested_acquire: FnvHashMap<TypeId, FnvHashSet<TypeId>>,
    nested_acquire_closure: FnvHashMap<TypeId, FnvHashSet<TypeId>>,
    export_mode: bool,
    broadcast_exists: bool,
    auto_free_unused: Option<(Duration, Duration)>,
    free_unused_cursor: Option<(TypeId, String)>,
    cleanup_callbacks: Vec<(CleanupCallbackId, CleanupCallback)>,
    next_cleanup_callback: u64,
}

impl ManagerState {
    fn new(config: &StreamingConfig) -> Self {
        ManagerState {
            resources: BTreeMap::new(),
            type_infos: FnvHashMap::default(),
            queue: LoadingQueue::new(),
            data_load_slots: Vec::new(),
            update_content_slots: Vec::new(),
            worker_slots_initialized: false,
            allow_launch_data_load: true,
            custom_loaders: FnvHashMap::default(),
            default_loader: Some(Arc::new(FileLoader::new(&config.resource_root))),
            named_resources: FnvHashMap::default(),
            next_resource_id: 0,
            main_thread_unloads: BTreeSet::new(),
            nested_acquire: FnvHashMap::default(),
            nested_acquire_closure: FnvHashMap::default(),
            export_mode: false,
            broadcast_exists: false,
            auto_free_unused: config
                .auto_free_unused_timeout
                .map(|timeout| (timeout, config.auto_free_unused_threshold)),
            free_unused_cursor: None,
            cleanup_callbacks: Vec::new(),
            next_cleanup_callback: 0,
        }
    }

    fn type_info<R: Resource>(&mut self) -> &mut TypeInfo {
        self.type_infos
            .entry(TypeId::of::<R>())
            .or_insert_with(TypeInfo::of::<R>)
    }

    /// Loader for resources of `type_id`, ignoring custom loaders.
    fn type_loader(&self, type_id: TypeId) -> Option<Arc<dyn ResourceLoader>> {
        self.type_infos
            .get(&type_id)
            .and_then(|info| info.loader.clone().or_else(|| info.default_loader.clone()))
            .or_else(|| self.default_loader.clone())
    }

    /// Whether content updates of `updating` may acquire resources of `acquired`,
    /// directly or through other allowed types.
    fn acquire_allowed(&mut self, updating: TypeId, acquired: TypeId) -> bool {
        if !self.nested_acquire_closure.contains_key(&updating) {
            let mut visited = FnvHashSet::default();
            let mut stack = vec![updating];

            while let Some(current) = stack.pop() {
                if let Some(direct) = self.nested_acquire.get(&current) {
                    for &next in direct {
                        if visited.insert(next) {
                            stack.push(next);
                        }
                    }
                }
            }

            self.nested_acquire_closure.insert(updating, visited);
        }

        self.nested_acquire_closure
            .get(&updating)
            .map_or(false, |allowed| allowed.contains(&acquired))
    }

    fn find(&self, type_id: TypeId, id: &str) -> Option<&ResourceRef> {
        self.resources.get(&type_id).and_then(|r| r.get(id))
    }

    fn all_resources(&self) -> impl Iterator<Item = &ResourceRef> + '_ {
        self.resources.values().flat_map(|r| r.values())
    }
}

type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Identifies a callback registered with `ResourceManager::add_resource_cleanup_callback`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CleanupCallbackId(u64);

/// An entry of the loading queue, see `ResourceManager::loading_queue`.
#[derive(Clone, Debug, PartialEq, new)]
pub struct QueueEntry {
    /// Name of the resource type.
    pub type_name: &'static str,
    /// ID of the resource.
    pub id: String,
    /// Priority value the entry is sorted by.
    pub priority: f32,
}

struct Shared {
    config: StreamingConfig,
    tasks: Arc<dyn TaskSystem>,
    state: Mutex<ManagerState>,
    last_frame_update: AtomicU64,
    force_no_fallback: AtomicU32,
    shut_down: AtomicBool,
    resource_events: EventChannel<ResourceEvent>,
    manager_events: EventChannel<ManagerEvent>,
}

/// Turns resource IDs into loaded resources.
///
/// Resources are created on first use and loaded in the background by tasks
/// submitted to a `TaskSystem`: a data load task reads the bytes through a
/// `ResourceLoader`, then a content update task hands them to the resource.
/// What gets loaded next is decided by a loading queue, re-prioritized a bit
/// every frame in `per_frame_update`.
///
/// The manager is a cheap handle; clones share the same state.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.shared.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ResourceManager {
    /// Creates a manager running its work on `tasks`.
    pub fn new(config: StreamingConfig, tasks: Arc<dyn TaskSystem>) -> Self {
        let state = ManagerState::new(&config);

        ResourceManager {
            shared: Arc::new(Shared {
                config,
                tasks,
                state: Mutex::new(state),
                last_frame_update: AtomicU64::new(0),
                force_no_fallback: AtomicU32::new(0),
                shut_down: AtomicBool::new(false),
                resource_events: EventChannel::new(),
                manager_events: EventChannel::new(),
            }),
        }
    }

    /// Creates a manager with a `RayonTaskSystem`. The calling thread becomes the main thread.
    pub fn with_thread_pools(config: StreamingConfig) -> Result<Self, Error> {
        let tasks = RayonTaskSystem::new(&config)?;
        Ok(Self::new(config, Arc::new(tasks)))
    }

    /// Loads the configuration from a RON file, then creates the thread pools.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config = StreamingConfig::load_no_fallback(path).map_err(Error::Config)?;
        Self::with_thread_pools(config)
    }

    /// The configuration the manager was created with.
    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    /// The task system loading work runs on.
    pub fn task_system(&self) -> &Arc<dyn TaskSystem> {
        &self.shared.tasks
    }

    /// Time passed to the last `per_frame_update`.
    pub fn last_frame_update(&self) -> Duration {
        Duration::from_nanos(self.shared.last_frame_update.load(Ordering::Acquire))
    }

    /// Whether `shutdown` was called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    fn broadcast_resource(&self, event_type: ResourceEventType, info: &ResourceInfo) {
        self.shared
            .resource_events
            .broadcast(ResourceEvent::of(event_type, info));
    }

    fn typed<R: Resource>(resource: &ResourceRef) -> Handle<R> {
        match resource.downcast::<R>() {
            Some(object) => Handle::new(object),
            None => unreachable!(
                "'{}' is registered as {}",
                resource.info().id(),
                R::NAME
            ),
        }
    }

    fn get_or_create_locked<R: Resource>(&self, state: &mut ManagerState, id: &str) -> Handle<R> {
        let id = state
            .named_resources
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_owned());
        let type_id = TypeId::of::<R>();

        if let Some(existing) = state.find(type_id, &id) {
            return Self::typed(existing);
        }

        let (has_type_fallback, priority) = {
            let type_info = state.type_info::<R>();
            (type_info.loading_fallback.is_some(), type_info.default_priority)
        };
        let mut flags = ResourceFlags::IS_RELOADABLE;
        flags.set(ResourceFlags::UPDATE_ON_MAIN_THREAD, R::update_on_main_thread());
        flags.set(ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK, has_type_fallback);

        let object = Arc::new(ResourceObject::<R>::new(id.clone(), flags, priority));
        state
            .resources
            .entry(type_id)
            .or_default()
            .insert(id, ResourceRef::from(Arc::clone(&object)));

        self.broadcast_resource(ResourceEventType::ResourceCreated, object.info());
        Handle::new(object)
    }

    /// Returns the resource with `id`, creating it if necessary. Nothing is loaded yet.
    ///
    /// Named resources are resolved first, see `register_named_resource`.
    pub fn load_resource<R: Resource>(&self, id: &str) -> Handle<R> {
        let mut state = self.shared.state.lock();
        self.get_or_create_locked(&mut state, id)
    }

    /// Returns the resource with `id` if it exists.
    pub fn find_existing_resource<R: Resource>(&self, id: &str) -> Option<Handle<R>> {
        let state = self.shared.state.lock();
        let id = state.named_resources.get(id).map_or(id, String::as_str);
        state.find(TypeId::of::<R>(), id).map(Self::typed)
    }

    /// Creates the content of resource `id` from `descriptor` right away.
    ///
    /// The resource is not file backed and won't be reloaded. Fails if the
    /// resource already has content or is being loaded.
    pub fn create_resource<R: Resource>(
        &self,
        id: &str,
        descriptor: R::Descriptor,
        description: &str,
    ) -> Result<Handle<R>, Error> {
        let handle = {
            let mut state = self.shared.state.lock();
            let handle = self.get_or_create_locked::<R>(&mut state, id);
            let info = handle.info();

            if info.state() != ResourceState::Unloaded || info.is_queued_for_loading() {
                return Err(Error::AlreadyCreated {
                    type_name: R::NAME,
                    id: info.id().to_owned(),
                });
            }

            // claimed until the content exists
            info.flags_mut().insert(
                ResourceFlags::IS_QUEUED_FOR_LOADING | ResourceFlags::IS_CREATED_RESOURCE,
            );
            info.flags_mut().remove(ResourceFlags::IS_RELOADABLE);
            handle
        };

        let info = handle.info();
        if !description.is_empty() {
            info.set_description(description);
        }

        let desc = handle.object().create(descriptor);
        assert!(
            desc.state != ResourceState::Unloaded,
            "Creating '{}' did not set the loading state",
            info.id()
        );
        self.content_changed(&**handle.object(), desc);

        let _state = self.shared.state.lock();
        info.flags_mut().remove(ResourceFlags::IS_QUEUED_FOR_LOADING);
        Ok(handle)
    }

    /// Returns the existing resource `id`, or creates it from `descriptor`.
    pub fn get_or_create_resource<R: Resource>(
        &self,
        id: &str,
        descriptor: R::Descriptor,
        description: &str,
    ) -> Result<Handle<R>, Error> {
        if let Some(existing) = self.find_existing_resource(id) {
            return Ok(existing);
        }

        match self.create_resource(id, descriptor, description) {
            // somebody else was faster
            Err(Error::AlreadyCreated { .. }) => Ok(self.load_resource(id)),
            result => result,
        }
    }

    /// Returns the existing resource `id`, or creates one that loads through `loader`.
    ///
    /// A created resource is not reloadable; its data comes from `loader` only.
    pub fn get_existing_resource_or_create_async<R, L>(&self, id: &str, loader: L) -> Handle<R>
    where
        R: Resource,
        L: ResourceLoader,
    {
        let mut state = self.shared.state.lock();
        let type_id = TypeId::of::<R>();

        if let Some(existing) = state.find(type_id, id) {
            return Self::typed(existing);
        }

        let handle = self.get_or_create_locked::<R>(&mut state, id);
        let info = handle.info();
        info.flags_mut().insert(
            ResourceFlags::HAS_CUSTOM_DATA_LOADER | ResourceFlags::IS_CREATED_RESOURCE,
        );
        info.flags_mut().remove(ResourceFlags::IS_RELOADABLE);
        state
            .custom_loaders
            .insert((type_id, info.id().to_owned()), Arc::new(loader));

        handle
    }

    /// Current loading state of a resource.
    pub fn get_loading_state<R: Resource>(&self, handle: &Handle<R>) -> ResourceState {
        handle.state()
    }

    /// Every resource object of type `R`, ordered by ID.
    pub fn resources_of_type<R: Resource>(&self) -> Vec<Handle<R>> {
        self.shared
            .state
            .lock()
            .resources
            .get(&TypeId::of::<R>())
            .map(|r| r.values().map(Self::typed).collect())
            .unwrap_or_default()
    }

    /// Number of resource objects of all types.
    pub fn resource_count(&self) -> usize {
        self.shared.state.lock().all_resources().count()
    }

    /// Number of resource objects of type `R`.
    pub fn resource_count_of<R: Resource>(&self) -> usize {
        self.shared
            .state
            .lock()
            .resources
            .get(&TypeId::of::<R>())
            .map_or(0, |r| r.len())
    }

    /// Snapshot of the loading queue, front to back.
    pub fn loading_queue(&self) -> Vec<QueueEntry> {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .map(|(r, priority)| {
                QueueEntry::new(r.info().type_name(), r.info().id().to_owned(), priority)
            })
            .collect()
    }

    /// Whether anything is queued or a worker task is running.
    pub fn is_any_loading_in_progress(&self) -> bool {
        let state = self.shared.state.lock();
        if !state.queue.is_empty() {
            return true;
        }

        let tasks = &self.shared.tasks;
        state
            .data_load_slots
            .iter()
            .chain(state.update_content_slots.iter())
            .filter_map(|slot| slot.ticket)
            .any(|ticket| !tasks.is_finished(ticket))
    }

    /// Sets the loader used for resources of type `R`, instead of the default loader.
    pub fn set_resource_type_loader<R: Resource>(&self, loader: Option<Arc<dyn ResourceLoader>>) {
        self.shared.state.lock().type_info::<R>().loader = loader;
    }

    /// Sets the loader used when a type has no loader of its own.
    pub fn set_default_resource_loader(&self, loader: Option<Arc<dyn ResourceLoader>>) {
        self.shared.state.lock().default_loader = loader;
    }

    /// Sets the resource shown while resources of type `R` are loading.
    pub fn set_resource_type_loading_fallback<R: Resource>(&self, fallback: Option<Handle<R>>) {
        let mut state = self.shared.state.lock();
        let has_fallback = fallback.is_some();
        state.type_info::<R>().loading_fallback =
            fallback.map(|f| Box::new(f) as Box<dyn Any + Send + Sync>);

        if let Some(resources) = state.resources.get(&TypeId::of::<R>()) {
            for resource in resources.values() {
                resource
                    .info()
                    .flags_mut()
                    .set(ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK, has_fallback);
            }
        }
    }

    /// Sets the resource returned instead of missing resources of type `R`.
    pub fn set_resource_type_missing_fallback<R: Resource>(&self, fallback: Option<Handle<R>>) {
        self.shared.state.lock().type_info::<R>().missing_fallback =
            fallback.map(|f| Box::new(f) as Box<dyn Any + Send + Sync>);
    }

    /// Priority given to new resources of type `R`.
    pub fn set_resource_type_default_priority<R: Resource>(&self, priority: ResourcePriority) {
        self.shared.state.lock().type_info::<R>().default_priority = priority;
    }

    /// Whether `free_unused_resources` may free resources of type `R`.
    pub fn set_incremental_unload_for_resource_type<R: Resource>(&self, enabled: bool) {
        self.shared.state.lock().type_info::<R>().incremental_unload = enabled;
    }

    /// Allows content updates of `U` to acquire resources of type `A`.
    ///
    /// Without this, acquiring anything but `PointerOnly` during a content
    /// update panics. Allowances are transitive.
    pub fn allow_resource_type_acquire_during_update_content<U: Resource, A: Resource>(&self) {
        let mut state = self.shared.state.lock();
        state
            .nested_acquire
            .entry(TypeId::of::<U>())
            .or_default()
            .insert(TypeId::of::<A>());
        state.nested_acquire_closure.clear();
    }

    /// Whether content updates of `updating` may acquire resources of `acquired`.
    pub fn is_resource_type_acquire_during_update_content_allowed(
        &self,
        updating: TypeId,
        acquired: TypeId,
    ) -> bool {
        self.shared
            .state
            .lock()
            .acquire_allowed(updating, acquired)
    }

    /// Makes lookups of `lookup` resolve to `target`.
    pub fn register_named_resource(&self, lookup: &str, target: &str) {
        self.shared
            .state
            .lock()
            .named_resources
            .insert(lookup.to_owned(), target.to_owned());
    }

    /// Removes a named resource. Returns `false` if it was not registered.
    pub fn unregister_named_resource(&self, lookup: &str) -> bool {
        self.shared
            .state
            .lock()
            .named_resources
            .remove(lookup)
            .is_some()
    }

    /// Returns a resource ID that has not been generated before, like `"prefix-7"`.
    pub fn generate_unique_resource_id(&self, prefix: &str) -> String {
        let mut state = self.shared.state.lock();
        let id = format!("{}-{}", prefix, state.next_resource_id);
        state.next_resource_id += 1;
        id
    }

    /// In export mode nothing may be loaded.
    pub fn enable_export_mode(&self, enable: bool) {
        self.shared.state.lock().export_mode = enable;
    }

    /// Whether export mode is enabled.
    pub fn is_export_mode_enabled(&self) -> bool {
        self.shared.state.lock().export_mode
    }

    /// Treats `AllowLoadingFallback` as `BlockTillLoaded` for the next `frames`
    /// frames. `u32::MAX` keeps it on until set to `0`.
    pub fn force_no_fallback_acquisition(&self, frames: u32) {
        self.shared.force_no_fallback.store(frames, Ordering::Release);
    }

    /// Remaining frames of `force_no_fallback_acquisition`.
    pub fn force_no_fallback_frames(&self) -> u32 {
        self.shared.force_no_fallback.load(Ordering::Acquire)
    }

    /// Makes the next `per_frame_update` send `ResourceExists` for every resource.
    pub fn broadcast_exists_event(&self) {
        self.shared.state.lock().broadcast_exists = true;
    }

    /// Subscribes to resource events.
    pub fn subscribe_resource_events(&self) -> (SubscriberId, Receiver<ResourceEvent>) {
        self.shared.resource_events.subscribe()
    }

    /// Unsubscribes from resource events.
    pub fn unsubscribe_resource_events(&self, id: SubscriberId) -> bool {
        self.shared.resource_events.unsubscribe(id)
    }

    /// Subscribes to manager events.
    pub fn subscribe_manager_events(&self) -> (SubscriberId, Receiver<ManagerEvent>) {
        self.shared.manager_events.subscribe()
    }

    /// Unsubscribes from manager events.
    pub fn unsubscribe_manager_events(&self, id: SubscriberId) -> bool {
        self.shared.manager_events.unsubscribe(id)
    }

    /// Registers `callback` to run once on `shutdown`, before unused
    /// resources are freed. Typically it drops handles kept elsewhere, like
    /// fallbacks stored by the caller.
    pub fn add_resource_cleanup_callback<F>(&self, callback: F) -> CleanupCallbackId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = CleanupCallbackId(state.next_cleanup_callback);
        state.next_cleanup_callback += 1;
        state.cleanup_callbacks.push((id, Box::new(callback)));
        id
    }

    /// Removes a cleanup callback without running it. Returns `false` if it was not registered.
    pub fn clear_resource_cleanup_callback(&self, id: CleanupCallbackId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.cleanup_callbacks.len();
        state.cleanup_callbacks.retain(|(other, _)| *other != id);
        state.cleanup_callbacks.len() != before
    }

    /// Runs and removes all cleanup callbacks.
    pub fn execute_all_resource_cleanup_callbacks(&self) {
        let callbacks = std::mem::take(&mut self.shared.state.lock().cleanup_callbacks);
        debug!("Running {} resource cleanup callbacks", callbacks.len());

        for (_, callback) in callbacks {
            callback();
        }

        debug_assert!(
            self.shared.state.lock().cleanup_callbacks.is_empty(),
            "Resource cleanup callbacks registered more cleanup callbacks"
        );
    }

    /// Unloads every reloadable resource that is not being loaded, so the
    /// next acquire loads its original data again. Returns how many were reset.
    ///
    /// Resources acquired within the reload grace period are queued again right away.
    pub fn reset_all_resources(&self) -> usize {
        let claimed: Vec<ResourceRef> = {
            let state = self.shared.state.lock();
            if self.is_shut_down() {
                return 0;
            }

            state
                .all_resources()
                .filter(|resource| {
                    let info = resource.info();
                    info.flags().contains(ResourceFlags::IS_RELOADABLE)
                        && !info.is_queued_for_loading()
                        && info.state() != ResourceState::Unloaded
                })
                .map(|resource| {
                    resource
                        .info()
                        .flags_mut()
                        .insert(ResourceFlags::IS_QUEUED_FOR_LOADING);
                    resource.clone()
                })
                .collect()
        };

        for resource in &claimed {
            self.unload_claimed(resource);
        }

        debug!("Reset {} resources", claimed.len());
        claimed.len()
    }

    /// Frees resources not acquired for `threshold` during `per_frame_update`,
    /// spending at most `timeout` per frame. `None` turns it off.
    pub fn set_auto_free_unused(&self, timeout: Option<Duration>, threshold: Duration) {
        self.shared.state.lock().auto_free_unused = timeout.map(|timeout| (timeout, threshold));
    }

    /// Drives the manager; call once per frame from the main thread.
    ///
    /// `now` is the current frame time. It is used for acquire timestamps and
    /// loading priorities.
    pub fn per_frame_update(&self, now: Duration) {
        #[cfg(feature = "profiler")]
        profile_scope!("resource_manager_update");

        if self.is_shut_down() {
            return;
        }

        self.shared
            .last_frame_update
            .store(now.as_nanos() as u64, Ordering::Release);

        let _ = self
            .shared
            .force_no_fallback
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |frames| {
                if frames > 0 && frames != u32::MAX {
                    Some(frames - 1)
                } else {
                    None
                }
            });

        {
            let mut state = self.shared.state.lock();
            if state.broadcast_exists {
                state.broadcast_exists = false;
                for resource in state.all_resources() {
                    self.broadcast_resource(ResourceEventType::ResourceExists, resource.info());
                }
            }
        }

        self.process_main_thread_unloads();

        let auto_free = {
            let mut state = self.shared.state.lock();
            let batch = self.shared.config.priority_update_batch;
            state
                .queue
                .refresh_priorities(batch, |r| r.info().loading_priority(now));
            state.auto_free_unused
        };

        self.shared.tasks.run_main_thread_tasks();

        if let Some((timeout, threshold)) = auto_free {
            self.free_unused_resources(timeout, threshold);
        }
    }

    fn drop_freed(&self, state: &mut ManagerState, freed: &[ResourceRef]) {
        for resource in freed {
            let info = resource.info();
            state
                .custom_loaders
                .remove(&(info.type_id(), info.id().to_owned()));
            self.broadcast_resource(ResourceEventType::ResourceDeleted, info);
        }
    }

    /// Frees every resource nobody refers to, repeating until nothing is left to free.
    pub fn free_all_unused_resources(&self) -> usize {
        #[cfg(feature = "profiler")]
        profile_scope!("free_all_unused_resources");

        let mut count = 0;

        loop {
            let freed = {
                let mut state = self.shared.state.lock();
                let mut freed = Vec::new();

                for resources in state.resources.values_mut() {
                    let unused: Vec<String> = resources
                        .iter()
                        .filter(|(_, r)| r.is_unused())
                        .map(|(id, _)| id.clone())
                        .collect();

                    freed.extend(unused.iter().filter_map(|id| resources.remove(id)));
                }

                self.drop_freed(&mut state, &freed);
                freed
            };

            if freed.is_empty() {
                break;
            }

            count += freed.len();
            // dropping resources may release handles to more resources
            drop(freed);
        }

        count
    }

    /// Frees unused resources not acquired within `last_acquire_threshold`,
    /// for at most `timeout`. Continues where the previous call stopped.
    pub fn free_unused_resources(&self, timeout: Duration, last_acquire_threshold: Duration) -> usize {
        if timeout == Duration::from_secs(0) {
            return 0;
        }

        #[cfg(feature = "profiler")]
        profile_scope!("free_unused_resources");

        let start = Instant::now();
        let now = self.last_frame_update();

        let freed = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;

            let types: Vec<TypeId> = state.resources.keys().copied().collect();
            let (mut type_index, mut resume_at) = match state.free_unused_cursor.take() {
                Some((type_id, id)) => match types.iter().position(|t| *t == type_id) {
                    Some(index) => (index, Some(id)),
                    None => (0, None),
                },
                None => (0, None),
            };

            let mut freed = Vec::new();

            'types: while type_index < types.len() {
                let type_id = types[type_index];
                type_index += 1;

                let incremental = state
                    .type_infos
                    .get(&type_id)
                    .map_or(true, |info| info.incremental_unload);
                let resources = match state.resources.get_mut(&type_id) {
                    Some(resources) if incremental => resources,
                    _ => continue,
                };

                let ids: Vec<String> = match resume_at.take() {
                    Some(from) => resources.range(from..).map(|(id, _)| id.clone()).collect(),
                    None => resources.keys().cloned().collect(),
                };

                for id in ids {
                    if start.elapsed() >= timeout {
                        state.free_unused_cursor = Some((type_id, id));
                        break 'types;
                    }

                    let stale = resources.get(&id).map_or(false, |r| {
                        r.is_unused()
                            && now.checked_sub(r.info().last_acquire()).unwrap_or_default()
                                > last_acquire_threshold
                    });

                    if stale {
                        if let Some(resource) = resources.remove(&id) {
                            debug!("Freed '{}'", id);
                            freed.push(resource);
                        }
                    }
                }
            }

            self.drop_freed(state, &freed);
            freed
        };

        freed.len()
    }

    /// Stops all loading and frees what can be freed.
    ///
    /// Cleanup callbacks run first. Pending worker tasks are cancelled and the
    /// queue is emptied. Resources that are still referenced afterwards are
    /// logged. Loading and reloading do nothing after this.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down resource manager");
        self.shared
            .manager_events
            .broadcast(ManagerEvent::ManagerShuttingDown);
        self.shared.tasks.notify_state_change();

        self.execute_all_resource_cleanup_callbacks();

        let tickets: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.allow_launch_data_load = false;
            state
                .data_load_slots
                .iter()
                .chain(state.update_content_slots.iter())
                .filter_map(|slot| slot.ticket)
                .collect()
        };

        for ticket in tickets {
            self.shared.tasks.cancel(ticket);
        }

        {
            let mut state = self.shared.state.lock();
            let queued: Vec<ResourceRef> = state.queue.drain().collect();
            debug!("Dropped {} queued loads", queued.len());

            // whatever was claimed by a cancelled task can't finish loading either
            for resource in state.all_resources() {
                let info = resource.info();
                info.flags_mut()
                    .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);
                if info.state() == ResourceState::LoadingInProgress {
                    info.set_state(ResourceState::Unloaded);
                }
            }
        }

        let freed = self.free_all_unused_resources();
        debug!("Freed {} resources on shutdown", freed);

        let state = self.shared.state.lock();
        for resource in state.all_resources() {
            error!(
                "{} '{}' is still referenced after shutdown",
                resource.info().type_name(),
                resource.info().id()
            );
        }
    }
}
