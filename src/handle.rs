use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use derivative::Derivative;

use crate::{
    resource::{Resource, ResourceInfo, ResourceObject, ResourceRef},
    state::ResourceState,
};

/// A handle to a resource of type `R`.
///
/// Handles are cheap to clone and keep the resource object alive; once no
/// handle, lock or pending load refers to a resource, it can be freed by
/// `ResourceManager::free_all_unused_resources`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Handle<R: Resource> {
    object: Arc<ResourceObject<R>>,
}

impl<R: Resource> Handle<R> {
    pub(crate) fn new(object: Arc<ResourceObject<R>>) -> Self {
        Handle { object }
    }

    pub(crate) fn object(&self) -> &Arc<ResourceObject<R>> {
        &self.object
    }

    pub(crate) fn erased(&self) -> ResourceRef {
        ResourceRef::from(Arc::clone(&self.object))
    }

    /// The resource ID.
    pub fn id(&self) -> &str {
        self.object.info().id()
    }

    /// Bookkeeping of the resource.
    pub fn info(&self) -> &ResourceInfo {
        self.object.info()
    }

    /// Current loading state, read without locking.
    pub fn state(&self) -> ResourceState {
        self.object.info().state()
    }

    /// Whether both handles point to the same resource.
    pub fn ptr_eq(&self, other: &Handle<R>) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<R: Resource> PartialEq for Handle<R> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<R: Resource> Eq for Handle<R> {}

impl<R: Resource> Hash for Handle<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.object) as usize).hash(state);
    }
}

impl<R: Resource> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type", &R::NAME)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
