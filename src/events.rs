//! Notifications about resources and the manager.

use std::{
    any::TypeId,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use derive_new::new;
use parking_lot::Mutex;

use crate::resource::ResourceInfo;

/// What happened to a resource.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceEventType {
    /// The resource object was created.
    ResourceCreated,
    /// The resource object was freed.
    ResourceDeleted,
    /// New content was loaded or created.
    ResourceContentUpdated,
    /// The content is about to be unloaded.
    ResourceContentUnloading,
    /// The priority of the resource changed.
    ResourcePriorityChanged,
    /// Sent for every resource after `ResourceManager::broadcast_exists_event`.
    ResourceExists,
}

/// An event about a single resource.
#[derive(Clone, Debug, PartialEq, new)]
pub struct ResourceEvent {
    /// What happened.
    pub event_type: ResourceEventType,
    /// `TypeId` of the resource type.
    pub type_id: TypeId,
    /// Name of the resource type.
    pub type_name: &'static str,
    /// ID of the resource.
    pub id: String,
}

impl ResourceEvent {
    pub(crate) fn of(event_type: ResourceEventType, info: &ResourceInfo) -> Self {
        ResourceEvent::new(
            event_type,
            info.type_id(),
            info.type_name(),
            info.id().to_owned(),
        )
    }
}

/// An event about the manager as a whole.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagerEvent {
    /// `ResourceManager::shutdown` started.
    ManagerShuttingDown,
    /// `ResourceManager::reload_all_resources` reloaded at least one resource.
    ReloadAllResources,
    /// `ResourceManager::reload_resources_of_type` reloaded at least one resource.
    ResourcesOfTypeReloaded(TypeId),
}

/// Identifies a subscription to an `EventChannel`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriberId(u64);

/// Broadcasts events to any number of subscribers.
///
/// Every subscriber gets its own unbounded channel. Dropping the receiver
/// unsubscribes as well.
#[derive(Debug)]
pub struct EventChannel<E> {
    subscribers: Mutex<Vec<(SubscriberId, Sender<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        EventChannel {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E: Clone> EventChannel<E> {
    /// Creates a channel without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> (SubscriberId, Receiver<E>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push((id, sender));

        (id, receiver)
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(other, _)| *other != id);
        subscribers.len() != before
    }

    /// Sends `event` to every subscriber, dropping those that hung up.
    pub fn broadcast(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
