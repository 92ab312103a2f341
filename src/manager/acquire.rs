use std::{any::TypeId, fmt, ops::Deref, sync::Arc};

use log::error;

use super::{workers::currently_updating_content, ResourceManager};
use crate::{
    error::Error,
    handle::Handle,
    resource::{Resource, ResourceInfo, ResourceObject, ResourceRef},
    state::{AcquireMode, AcquireResult, ResourceState},
};

/// Read access to the content of a resource, see `ResourceManager::begin_acquire`.
///
/// The lock may refer to a fallback instead of the requested resource;
/// `result` tells which. It keeps the content as it was when acquired:
/// updates and reloads go ahead meanwhile and are seen by the next acquire.
pub struct ResourceLock<R: Resource> {
    object: Arc<ResourceObject<R>>,
    content: Arc<R>,
    result: AcquireResult,
}

impl<R: Resource> ResourceLock<R> {
    fn new(object: Arc<ResourceObject<R>>, result: AcquireResult) -> Self {
        object.info().begin_acquire();
        let content = object.content();

        ResourceLock {
            object,
            content,
            result,
        }
    }

    /// Whether this is the requested resource or a fallback.
    pub fn result(&self) -> AcquireResult {
        self.result
    }

    /// Handle of the resource actually locked.
    pub fn handle(&self) -> Handle<R> {
        Handle::new(Arc::clone(&self.object))
    }

    /// Bookkeeping of the resource actually locked.
    pub fn info(&self) -> &ResourceInfo {
        self.object.info()
    }
}

impl<R: Resource> Deref for ResourceLock<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.content
    }
}

impl<R: Resource> Drop for ResourceLock<R> {
    fn drop(&mut self) {
        self.object.info().end_acquire();
    }
}

impl<R: Resource> fmt::Debug for ResourceLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("type", &R::NAME)
            .field("id", &self.object.info().id())
            .field("result", &self.result)
            .finish()
    }
}

impl ResourceManager {
    /// Gets read access to a resource, loading it as far as `mode` asks for.
    ///
    /// * `PointerOnly` returns immediately, whatever the state.
    /// * The `AllowLoadingFallback` modes return a loading fallback (of the
    ///   resource, the caller or the type, in that order) while the resource
    ///   is not loaded. Without any fallback they block.
    /// * The `BlockTillLoaded` modes load the resource at highest priority and block.
    ///
    /// A missing resource is replaced by its type's missing fallback. Without
    /// one, `NeverFail` modes return `Ok(None)` and the others fail.
    pub fn begin_acquire<R: Resource>(
        &self,
        handle: &Handle<R>,
        mode: AcquireMode,
        fallback: Option<&Handle<R>>,
    ) -> Result<Option<ResourceLock<R>>, Error> {
        if mode == AcquireMode::PointerOnly {
            return Ok(Some(ResourceLock::new(
                Arc::clone(handle.object()),
                AcquireResult::Final,
            )));
        }

        self.check_nested_acquire::<R>();

        let mode = if mode == AcquireMode::AllowLoadingFallback && self.force_no_fallback_frames() > 0
        {
            AcquireMode::BlockTillLoaded
        } else {
            mode
        };

        let info = handle.info();
        let resource = handle.erased();
        info.set_last_acquire(self.last_frame_update());

        match info.state() {
            ResourceState::Unloaded | ResourceState::LoadingInProgress => {
                self.internal_preload(&resource, mode >= AcquireMode::BlockTillLoaded);

                if mode.allows_loading_fallback() {
                    let fallback = handle
                        .object()
                        .loading_fallback()
                        .or_else(|| fallback.cloned())
                        .or_else(|| self.type_loading_fallback::<R>());

                    if let Some(fallback) = fallback.filter(|f| !f.ptr_eq(handle)) {
                        return self.acquire_fallback(&fallback, AcquireResult::LoadingFallback);
                    }
                }

                self.ensure_loading_state(&resource, ResourceState::Loaded)?;
            }
            ResourceState::Loaded => {
                // keep refining resources that have more quality levels to load
                if !info.is_queued_for_loading() && info.quality_levels_loadable() > 0 {
                    self.internal_preload(&resource, false);
                }
            }
            ResourceState::LoadedResourceMissing => {}
        }

        if info.state() == ResourceState::LoadedResourceMissing {
            if let Some(missing) = self.type_missing_fallback::<R>() {
                if !missing.ptr_eq(handle) {
                    return self.acquire_fallback(&missing, AcquireResult::MissingFallback);
                }
            }

            if mode.is_never_fail() {
                return Ok(None);
            }

            error!(
                "{} '{}' is missing and has no fallback",
                R::NAME,
                info.id()
            );
            return Err(Error::MissingResource {
                type_name: R::NAME,
                id: info.id().to_owned(),
            });
        }

        Ok(Some(ResourceLock::new(
            Arc::clone(handle.object()),
            AcquireResult::Final,
        )))
    }

    /// Releases a lock. Dropping it does the same.
    pub fn end_acquire<R: Resource>(&self, lock: ResourceLock<R>) {
        drop(lock);
    }

    fn acquire_fallback<R: Resource>(
        &self,
        fallback: &Handle<R>,
        result: AcquireResult,
    ) -> Result<Option<ResourceLock<R>>, Error> {
        let lock = self.begin_acquire(fallback, AcquireMode::BlockTillLoaded, None)?;
        Ok(lock.map(|mut lock| {
            lock.result = result;
            lock
        }))
    }

    fn type_loading_fallback<R: Resource>(&self) -> Option<Handle<R>> {
        self.shared
            .state
            .lock()
            .type_infos
            .get(&TypeId::of::<R>())
            .and_then(|t| t.loading_fallback::<R>())
    }

    fn type_missing_fallback<R: Resource>(&self) -> Option<Handle<R>> {
        self.shared
            .state
            .lock()
            .type_infos
            .get(&TypeId::of::<R>())
            .and_then(|t| t.missing_fallback::<R>())
    }

    fn check_nested_acquire<R: Resource>(&self) {
        if let Some(updating) = currently_updating_content() {
            let allowed = self
                .shared
                .state
                .lock()
                .acquire_allowed(updating, TypeId::of::<R>());

            assert!(
                allowed,
                "Acquiring a {} during a content update of another type. \
                 Allow it with `allow_resource_type_acquire_during_update_content`.",
                R::NAME
            );
        }
    }

    /// Blocks until the resource reaches `requested`, helping with the work meanwhile.
    pub(super) fn ensure_loading_state(
        &self,
        resource: &ResourceRef,
        requested: ResourceState,
    ) -> Result<(), Error> {
        let info = resource.info();
        let own_type = info.type_id();

        while !info.state().satisfies(requested) {
            if self.is_shut_down() {
                return Err(Error::Shutdown);
            }

            // A content update of a type that may not acquire this one can't
            // be waiting on us, so finishing it first is safe and frees its
            // thread up.
            let blocking = {
                let mut state = self.shared.state.lock();
                let tasks = &self.shared.tasks;
                let running: Vec<_> = state
                    .update_content_slots
                    .iter()
                    .filter_map(|slot| match (&slot.resource, slot.ticket) {
                        (Some(other), Some(ticket))
                            if other != resource && !tasks.is_finished(ticket) =>
                        {
                            Some((other.info().type_id(), ticket))
                        }
                        _ => None,
                    })
                    .collect();

                running
                    .into_iter()
                    .find(|(type_id, _)| !state.acquire_allowed(*type_id, own_type))
                    .map(|(_, ticket)| ticket)
            };

            match blocking {
                Some(ticket) => self.shared.tasks.wait_for_ticket(ticket),
                None => self.shared.tasks.wait_for_condition(&mut || {
                    info.state().satisfies(requested) || self.is_shut_down()
                }),
            }
        }

        Ok(())
    }
}
