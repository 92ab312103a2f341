use std::{any::TypeId, sync::Arc};

use log::debug;
#[cfg(feature = "profiler")]
use thread_profiler::profile_scope;

use super::{ManagerState, ResourceManager};
use crate::{
    error::Error,
    events::{ManagerEvent, ResourceEventType},
    handle::Handle,
    loader::ResourceLoader,
    resource::{Resource, ResourceInfo, ResourceRef},
    state::{ResourceFlags, ResourcePriority, ResourceState, Unload},
    task::WorkerClass,
};

impl ResourceManager {
    /// Queues a resource for loading, unless it is fully loaded already.
    ///
    /// With `highest_priority` the resource goes to the front of the queue,
    /// even if it was queued before.
    pub fn preload_resource<R: Resource>(&self, handle: &Handle<R>, highest_priority: bool) {
        self.internal_preload(&handle.erased(), highest_priority);
    }

    pub(super) fn internal_preload(&self, resource: &ResourceRef, highest_priority: bool) {
        if self.is_shut_down() {
            return;
        }

        let mut state = self.shared.state.lock();
        self.internal_preload_locked(&mut state, resource, highest_priority);
    }

    pub(super) fn internal_preload_locked(
        &self,
        state: &mut ManagerState,
        resource: &ResourceRef,
        highest_priority: bool,
    ) {
        if self.is_shut_down() {
            return;
        }

        #[cfg(feature = "profiler")]
        profile_scope!("preload_resource");

        let info = resource.info();
        if info.state() == ResourceState::Loaded && info.quality_levels_loadable() == 0 {
            return;
        }

        debug_assert!(
            !state.export_mode,
            "Resources should not be loaded in export mode"
        );

        if info.is_queued_for_loading() {
            // only entries still waiting in the queue can be moved to the front
            if highest_priority && Self::remove_from_loading_queue(state, resource) {
                self.add_to_loading_queue(state, resource, true);
            }
            return;
        }

        self.add_to_loading_queue(state, resource, highest_priority);

        if highest_priority && self.shared.tasks.current_worker_class() == WorkerClass::FileAccess
        {
            // the file thread is blocked on this, don't wait for the running data load
            state.allow_launch_data_load = true;
        }

        self.run_worker_task(state);
    }

    fn add_to_loading_queue(
        &self,
        state: &mut ManagerState,
        resource: &ResourceRef,
        highest_priority: bool,
    ) {
        let info = resource.info();
        debug_assert!(
            !info.is_queued_for_loading(),
            "'{}' is in the loading queue already",
            info.id()
        );

        info.flags_mut().insert(ResourceFlags::IS_QUEUED_FOR_LOADING);
        if info.state() == ResourceState::Unloaded {
            info.set_state(ResourceState::LoadingInProgress);
        }

        if highest_priority {
            self.set_priority_of(info, ResourcePriority::Critical);
            state.queue.push_front(resource.clone(), 0.0);
        } else {
            let priority = info.loading_priority(self.last_frame_update());
            state.queue.push_back(resource.clone(), priority);
        }
    }

    /// Returns `false` if a worker owns the resource.
    fn remove_from_loading_queue(state: &mut ManagerState, resource: &ResourceRef) -> bool {
        let info = resource.info();
        if !info.is_queued_for_loading() {
            return true;
        }

        if state.queue.remove(resource) {
            info.flags_mut()
                .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);
            true
        } else {
            false
        }
    }

    fn set_priority_of(&self, info: &ResourceInfo, priority: ResourcePriority) {
        if info.set_priority(priority) != priority {
            self.broadcast_resource(ResourceEventType::ResourcePriorityChanged, info);
        }
    }

    /// Changes the base priority of a resource.
    pub fn set_resource_priority<R: Resource>(&self, handle: &Handle<R>, priority: ResourcePriority) {
        self.set_priority_of(handle.info(), priority);
    }

    /// Sets the resource shown while this resource is loading, overriding the type fallback.
    pub fn set_resource_loading_fallback<R: Resource>(
        &self,
        handle: &Handle<R>,
        fallback: Option<Handle<R>>,
    ) {
        handle.object().set_loading_fallback(fallback);
    }

    /// Whether the resource was acquired recently enough to load it again right away.
    fn recently_acquired(&self, info: &ResourceInfo) -> bool {
        info.last_acquire() + self.shared.config.reload_grace_period >= self.last_frame_update()
    }

    fn unload_all_levels(&self, resource: &ResourceRef) {
        let info = resource.info();
        self.call_unload_data(&**resource, Unload::AllQualityLevels);

        debug_assert!(
            matches!(
                info.state(),
                ResourceState::Unloaded | ResourceState::LoadedResourceMissing
            ),
            "'{}' is still loaded after unloading all quality levels",
            info.id()
        );
    }

    /// Unloads a resource waiting in the queue, keeping its place there.
    ///
    /// The caller holds the manager lock, so no data load task can take it
    /// out of the queue meanwhile.
    fn unload_in_queue(&self, resource: &ResourceRef) {
        self.unload_all_levels(resource);

        let info = resource.info();
        if info.state() == ResourceState::Unloaded {
            info.set_state(ResourceState::LoadingInProgress);
        }
    }

    /// Unloads a resource this thread has claimed, then releases the claim.
    ///
    /// It is loaded again right away if somebody acquired it lately.
    pub(super) fn unload_claimed(&self, resource: &ResourceRef) {
        self.unload_all_levels(resource);

        let info = resource.info();
        let mut state = self.shared.state.lock();
        info.flags_mut()
            .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);

        if !self.is_shut_down() && self.recently_acquired(info) {
            self.internal_preload_locked(&mut state, resource, false);
        }
    }

    /// Reloads a resource if its data changed, or always with `force`.
    ///
    /// Returns whether the resource was unloaded (or scheduled to be, for
    /// resources updated on the main thread).
    pub fn reload_resource<R: Resource>(&self, handle: &Handle<R>, force: bool) -> bool {
        self.reload(&handle.erased(), force)
    }

    fn reload(&self, resource: &ResourceRef, force: bool) -> bool {
        let info = resource.info();

        {
            let mut state = self.shared.state.lock();
            if self.is_shut_down() {
                return false;
            }

            let flags = info.flags();
            if !flags.contains(ResourceFlags::IS_RELOADABLE) {
                return false;
            }
            if !force && flags.contains(ResourceFlags::PREVENT_FILE_RELOAD) {
                return false;
            }

            let loader = match state.type_loader(info.type_id()) {
                Some(loader) => loader,
                None => return false,
            };

            if info.state() == ResourceState::Unloaded {
                return false;
            }

            let in_queue = info.is_queued_for_loading();
            if in_queue && !state.queue.contains(resource) {
                debug!("'{}' is being loaded right now, not reloading it", info.id());
                return false;
            }

            if !force {
                if !loader.is_resource_outdated(info) {
                    return false;
                }

                if info.state() == ResourceState::LoadedResourceMissing {
                    debug!("'{}' is missing and will be tried again", info.id());
                } else {
                    debug!("'{}' is outdated and will be reloaded", info.id());
                }
            }

            if flags.contains(ResourceFlags::UPDATE_ON_MAIN_THREAD)
                && !self.shared.tasks.is_main_thread()
            {
                state
                    .main_thread_unloads
                    .insert((info.type_id(), info.id().to_owned()));
                return true;
            }

            if in_queue {
                self.unload_in_queue(resource);
                return true;
            }

            // claimed while unloading, so no worker starts on it
            info.flags_mut().insert(ResourceFlags::IS_QUEUED_FOR_LOADING);
        }

        self.unload_claimed(resource);
        true
    }

    /// Reloads every resource of type `R`, returning how many were reloaded.
    pub fn reload_resources_of_type<R: Resource>(&self, force: bool) -> usize {
        let resources: Vec<ResourceRef> = self
            .shared
            .state
            .lock()
            .resources
            .get(&TypeId::of::<R>())
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();

        let count = resources.iter().filter(|r| self.reload(r, force)).count();
        if count > 0 {
            debug!("Reloaded {} resources of type {}", count, R::NAME);
            self.shared
                .manager_events
                .broadcast(ManagerEvent::ResourcesOfTypeReloaded(TypeId::of::<R>()));
        }

        count
    }

    /// Reloads every resource, returning how many were reloaded.
    pub fn reload_all_resources(&self, force: bool) -> usize {
        let resources: Vec<ResourceRef> = self
            .shared
            .state
            .lock()
            .all_resources()
            .cloned()
            .collect();

        let count = resources.iter().filter(|r| self.reload(r, force)).count();
        if count > 0 {
            debug!("Reloaded {} resources", count);
            self.shared
                .manager_events
                .broadcast(ManagerEvent::ReloadAllResources);
        }

        count
    }

    /// Loads the resource from `loader` once, instead of its regular source.
    ///
    /// Afterwards the resource is no longer reloaded when its file changes,
    /// see `restore_resource`.
    pub fn update_resource_with_custom_loader<R, L>(&self, handle: &Handle<R>, loader: L) -> bool
    where
        R: Resource,
        L: ResourceLoader,
    {
        {
            let mut state = self.shared.state.lock();
            let info = handle.info();
            info.flags_mut()
                .insert(ResourceFlags::HAS_CUSTOM_DATA_LOADER);
            state.custom_loaders.insert(
                (info.type_id(), info.id().to_owned()),
                Arc::new(loader) as Arc<dyn ResourceLoader>,
            );
        }

        self.reload_resource(handle, true)
    }

    /// Brings back the regular data of a resource loaded with a custom loader.
    pub fn restore_resource<R: Resource>(&self, handle: &Handle<R>) -> bool {
        handle
            .info()
            .flags_mut()
            .remove(ResourceFlags::PREVENT_FILE_RELOAD);
        self.reload_resource(handle, true)
    }

    /// Loads the resource before returning, at least to some quality level.
    pub fn force_load_resource_now<R: Resource>(&self, handle: &Handle<R>) -> Result<(), Error> {
        let state = handle.state();
        if state == ResourceState::Loaded || state == ResourceState::LoadedResourceMissing {
            return Ok(());
        }

        let resource = handle.erased();
        self.internal_preload(&resource, true);
        self.ensure_loading_state(&resource, ResourceState::Loaded)
    }

    /// Gives a resource low resolution content right away, e.g. from a
    /// thumbnail. Only done once per resource; returns whether it was applied.
    pub fn set_resource_low_res_data<R: Resource>(&self, handle: &Handle<R>, data: &[u8]) -> bool {
        let info = handle.info();
        let flags = info.flags();
        if flags.contains(ResourceFlags::HAS_LOW_RES_DATA)
            || !flags.contains(ResourceFlags::IS_RELOADABLE)
        {
            return false;
        }

        let resource = handle.erased();

        let was_queued = {
            let mut state = self.shared.state.lock();
            if self.is_shut_down() {
                return false;
            }

            let was_queued = info.is_queued_for_loading();
            if was_queued {
                // taken out of the queue but still flagged, so it stays claimed
                if !state.queue.remove(&resource) {
                    return false;
                }
            } else {
                info.flags_mut().insert(ResourceFlags::IS_QUEUED_FOR_LOADING);
            }

            info.flags_mut().insert(ResourceFlags::HAS_LOW_RES_DATA);
            was_queued
        };

        let mut reader = data;
        self.call_update_content(&*resource, Some(&mut reader));

        let mut state = self.shared.state.lock();
        info.flags_mut()
            .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);

        if was_queued {
            self.internal_preload_locked(&mut state, &resource, false);
        }
        true
    }

    /// Unloads resources whose reload was requested off the main thread.
    pub(super) fn process_main_thread_unloads(&self) {
        let pending: Vec<(TypeId, String)> = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.main_thread_unloads)
                .into_iter()
                .collect()
        };

        for key in pending {
            let resource = {
                let mut state = self.shared.state.lock();
                let resource = match state.find(key.0, &key.1) {
                    Some(resource) => resource.clone(),
                    None => continue,
                };

                if resource.info().is_queued_for_loading() {
                    if state.queue.contains(&resource) {
                        self.unload_in_queue(&resource);
                    } else {
                        // a worker owns it, try again next frame
                        state.main_thread_unloads.insert(key);
                    }
                    continue;
                }

                resource
                    .info()
                    .flags_mut()
                    .insert(ResourceFlags::IS_QUEUED_FOR_LOADING);
                resource
            };

            self.unload_claimed(&resource);
        }
    }
}
