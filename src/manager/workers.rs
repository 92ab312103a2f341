use std::{any::TypeId, cell::Cell, io::Read, sync::Arc};

use log::{debug, error, warn};
#[cfg(feature = "profiler")]
use thread_profiler::profile_scope;

use super::{ManagerState, ResourceManager};
use crate::{
    events::ResourceEventType,
    loader::{LoadData, ResourceLoader},
    resource::{AnyResource, ResourceRef},
    state::{LoadDesc, ResourceFlags, ResourceState, Unload},
    task::{TaskPriority, TaskTicket},
};

thread_local! {
    static UPDATING_CONTENT: Cell<Option<TypeId>> = Cell::new(None);
}

/// Type whose content is being updated on the calling thread, if any.
pub(super) fn currently_updating_content() -> Option<TypeId> {
    UPDATING_CONTENT.with(Cell::get)
}

/// A reusable place for one worker task.
#[derive(Debug, Default)]
pub(super) struct WorkerSlot {
    pub ticket: Option<TaskTicket>,
    /// The resource a content update task is working on.
    pub resource: Option<ResourceRef>,
}

impl ResourceManager {
    fn setup_worker_slots(&self, state: &mut ManagerState) {
        if state.worker_slots_initialized {
            return;
        }

        state.worker_slots_initialized = true;
        let config = &self.shared.config;
        state
            .data_load_slots
            .resize_with(config.initial_data_load_tasks, WorkerSlot::default);
        state
            .update_content_slots
            .resize_with(config.initial_update_content_tasks, WorkerSlot::default);
    }

    /// Index of a slot whose task is done, growing the pool if there is none.
    fn free_slot(&self, slots: &mut Vec<WorkerSlot>) -> usize {
        let tasks = &self.shared.tasks;
        let free = slots
            .iter()
            .position(|slot| slot.ticket.map_or(true, |t| tasks.is_finished(t)));

        match free {
            Some(index) => index,
            None => {
                slots.push(WorkerSlot::default());
                debug!("Grew worker slots to {}", slots.len());
                slots.len() - 1
            }
        }
    }

    /// Starts a data load task, unless one is running or nothing is queued.
    pub(super) fn run_worker_task(&self, state: &mut ManagerState) {
        if self.is_shut_down() {
            return;
        }

        self.setup_worker_slots(state);

        if state.allow_launch_data_load && !state.queue.is_empty() {
            state.allow_launch_data_load = false;

            let index = self.free_slot(&mut state.data_load_slots);
            let manager = self.clone();
            let ticket = self
                .shared
                .tasks
                .submit(Box::new(move || manager.load_data()), TaskPriority::FileAccess);
            state.data_load_slots[index].ticket = Some(ticket);
        }
    }

    /// Loader for the next load of `resource`. A custom loader is used once.
    fn take_loader(
        &self,
        state: &mut ManagerState,
        resource: &ResourceRef,
    ) -> Option<Arc<dyn ResourceLoader>> {
        let info = resource.info();

        if info.flags().contains(ResourceFlags::HAS_CUSTOM_DATA_LOADER) {
            info.flags_mut()
                .remove(ResourceFlags::HAS_CUSTOM_DATA_LOADER);
            info.flags_mut().insert(ResourceFlags::PREVENT_FILE_RELOAD);

            let key = (info.type_id(), info.id().to_owned());
            if let Some(loader) = state.custom_loaders.remove(&key) {
                return Some(loader);
            }
        }

        state.type_loader(info.type_id())
    }

    /// Body of a data load task: takes the front of the queue and reads its data.
    fn load_data(&self) {
        #[cfg(feature = "profiler")]
        profile_scope!("load_resource_data");

        let (resource, loader) = {
            let mut state = self.shared.state.lock();
            // stays flagged as queued, which marks it as claimed by this task
            let resource = match state.queue.pop_front() {
                Some(resource) => resource,
                None => {
                    state.allow_launch_data_load = true;
                    return;
                }
            };
            let loader = self.take_loader(&mut state, &resource);
            (resource, loader)
        };

        let info = resource.info();
        let load_data = match &loader {
            Some(loader) => loader.open_data_stream(info),
            None => {
                error!("No loader for {} '{}'", info.type_name(), info.id());
                LoadData::new(info.description(), None, None)
            }
        };

        let priority = if info.flags().contains(ResourceFlags::UPDATE_ON_MAIN_THREAD) {
            TaskPriority::MainThread
        } else {
            TaskPriority::LateNextFrame
        };

        let mut state = self.shared.state.lock();

        if self.is_shut_down() {
            info.flags_mut()
                .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);
            if info.state() == ResourceState::LoadingInProgress {
                info.set_state(ResourceState::Unloaded);
            }
            return;
        }

        let index = self.free_slot(&mut state.update_content_slots);
        let manager = self.clone();
        let task_resource = resource.clone();
        let ticket = self.shared.tasks.submit(
            Box::new(move || manager.update_content(index, task_resource, loader, load_data)),
            priority,
        );

        let slot = &mut state.update_content_slots[index];
        slot.ticket = Some(ticket);
        slot.resource = Some(resource);

        state.allow_launch_data_load = true;
        self.run_worker_task(&mut state);
    }

    /// Body of a content update task: hands the data to the resource.
    fn update_content(
        &self,
        slot: usize,
        resource: ResourceRef,
        loader: Option<Arc<dyn ResourceLoader>>,
        load_data: LoadData,
    ) {
        #[cfg(feature = "profiler")]
        profile_scope!("update_resource_content");

        let info = resource.info();
        if !load_data.description.is_empty() {
            info.set_description(&load_data.description);
        }

        let mut data = load_data.data.as_deref();
        self.call_update_content(&*resource, data.as_mut().map(|d| d as &mut dyn Read));

        if let Some(time) = load_data.modification_time {
            info.set_modification_time(time);
        }

        debug_assert!(
            info.state() != ResourceState::Unloaded,
            "Updating '{}' did not change its loading state",
            info.id()
        );

        if let Some(loader) = &loader {
            loader.close_data_stream(info, &load_data);
        }

        let mut state = self.shared.state.lock();
        debug_assert!(
            info.is_queued_for_loading(),
            "'{}' was modified while a worker owned it",
            info.id()
        );

        info.flags_mut()
            .remove(ResourceFlags::IS_QUEUED_FOR_LOADING);
        info.set_last_acquire(self.last_frame_update());

        if let Some(slot) = state.update_content_slots.get_mut(slot) {
            slot.resource = None;
        }

        if info.quality_levels_loadable() > 0 {
            // more quality levels to come
            self.internal_preload_locked(&mut state, &resource, false);
        }
    }

    /// Updates the content while tracking which type is being updated on this thread.
    pub(super) fn call_update_content(
        &self,
        resource: &dyn AnyResource,
        data: Option<&mut dyn Read>,
    ) {
        let type_id = resource.info().type_id();
        let previous = UPDATING_CONTENT.with(|c| c.replace(Some(type_id)));
        let desc = resource.update_content(data);
        UPDATING_CONTENT.with(|c| c.set(previous));

        self.content_changed(resource, desc);
    }

    /// Records the result of an update or creation.
    pub(super) fn content_changed(&self, resource: &dyn AnyResource, desc: LoadDesc) {
        let info = resource.info();

        if desc.state == ResourceState::LoadedResourceMissing {
            warn!(
                "Missing {} '{}' ({})",
                info.type_name(),
                info.id(),
                info.description()
            );
        }

        info.increment_change_counter();
        info.set_memory_usage(resource.memory_usage());
        info.apply(desc);
        self.shared.tasks.notify_state_change();

        self.broadcast_resource(ResourceEventType::ResourceContentUpdated, info);
        debug!("Updated {} '{}'", info.type_name(), info.description());
    }

    pub(super) fn call_unload_data(&self, resource: &dyn AnyResource, unload: Unload) {
        let info = resource.info();
        self.broadcast_resource(ResourceEventType::ResourceContentUnloading, info);

        let desc = resource.unload_data(unload);
        info.set_memory_usage(resource.memory_usage());
        info.apply(desc);
        self.shared.tasks.notify_state_change();
    }
}
