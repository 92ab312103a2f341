use std::{any::TypeId, sync::Arc};

use amethyst_streaming::{
    AcquireMode, AcquireResult, Error, ResourceLoader, ResourceManager, ResourceState,
    SerialTaskSystem, StreamingConfig, Task, TaskPriority, TaskSystem, TaskTicket, WorkerClass,
};
use parking_lot::Mutex;

use self::common::{
    frame, serial_manager, setup_logger, CountingLoader, MainThreadMaterial, Mesh,
    ProgressiveTexture, TEXTURE_LEVELS,
};

mod common;

#[test]
fn loading_fallbacks_are_picked_in_order() {
    let loader = CountingLoader::with_files(&[("mesh/rock", b"rock")]);
    let (manager, _tasks) = serial_manager(&loader);

    let own = manager
        .create_resource::<Mesh>("fallback/own", b"own".to_vec(), "")
        .expect("Failed to create fallback");
    let caller = manager
        .create_resource::<Mesh>("fallback/caller", b"caller".to_vec(), "")
        .expect("Failed to create fallback");
    let by_type = manager
        .create_resource::<Mesh>("fallback/type", b"type".to_vec(), "")
        .expect("Failed to create fallback");
    manager.set_resource_type_loading_fallback(Some(by_type.clone()));

    let rock = manager.load_resource::<Mesh>("mesh/rock");
    manager.set_resource_loading_fallback(&rock, Some(own.clone()));

    let acquire = |caller: Option<&_>| {
        let lock = manager
            .begin_acquire(&rock, AcquireMode::AllowLoadingFallback, caller)
            .expect("Acquire failed")
            .expect("Acquire returned nothing");
        assert_eq!(AcquireResult::LoadingFallback, lock.result());
        lock.handle()
    };

    assert!(acquire(Some(&caller)).ptr_eq(&own));

    manager.set_resource_loading_fallback(&rock, None);
    assert!(acquire(Some(&caller)).ptr_eq(&caller));
    assert!(acquire(None).ptr_eq(&by_type));

    // nothing was loaded in the meantime
    assert_eq!(ResourceState::LoadingInProgress, rock.state());
    assert_eq!(0, loader.opens("mesh/rock"));
}

#[test]
fn type_fallback_flags_new_and_existing_resources() {
    let loader = CountingLoader::with_files(&[]);
    let (manager, _tasks) = serial_manager(&loader);

    let existing = manager.load_resource::<Mesh>("a");
    let fallback = manager
        .create_resource::<Mesh>("fallback", Vec::new(), "")
        .expect("Failed to create fallback");
    manager.set_resource_type_loading_fallback(Some(fallback));

    let created = manager.load_resource::<Mesh>("b");
    let flag = amethyst_streaming::ResourceFlags::RESOURCE_HAS_TYPE_FALLBACK;
    assert!(existing.info().flags().contains(flag));
    assert!(created.info().flags().contains(flag));

    manager.set_resource_type_loading_fallback::<Mesh>(None);
    assert!(!existing.info().flags().contains(flag));
}

#[test]
fn forced_no_fallback_blocks_for_the_given_frames() {
    let loader = CountingLoader::with_files(&[("a", b"a"), ("b", b"b")]);
    let (manager, _tasks) = serial_manager(&loader);

    let fallback = manager
        .create_resource::<Mesh>("fallback", Vec::new(), "")
        .expect("Failed to create fallback");
    manager.set_resource_type_loading_fallback(Some(fallback));
    manager.force_no_fallback_acquisition(1);

    let a = manager.load_resource::<Mesh>("a");
    let lock = manager
        .begin_acquire(&a, AcquireMode::AllowLoadingFallback, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    assert_eq!(AcquireResult::Final, lock.result());
    drop(lock);

    manager.per_frame_update(frame(1));
    assert_eq!(0, manager.force_no_fallback_frames());

    let b = manager.load_resource::<Mesh>("b");
    let lock = manager
        .begin_acquire(&b, AcquireMode::AllowLoadingFallback, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    assert_eq!(AcquireResult::LoadingFallback, lock.result());
}

#[test]
fn missing_without_fallback_fails_unless_never_fail() {
    let loader = CountingLoader::with_files(&[]);
    let (manager, tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<Mesh>("mesh/nothing");

    let none = manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoadedNeverFail, None)
        .expect("Acquire failed");
    assert!(none.is_none());
    assert_eq!(ResourceState::LoadedResourceMissing, handle.state());

    match manager.begin_acquire(&handle, AcquireMode::BlockTillLoaded, None) {
        Err(Error::MissingResource { type_name, id }) => {
            assert_eq!("Mesh", type_name);
            assert_eq!("mesh/nothing", id);
        }
        other => panic!("Expected a missing resource error, got {:?}", other),
    }

    // no fallback resolution, no loading
    let lock = manager
        .begin_acquire(&handle, AcquireMode::PointerOnly, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    assert_eq!(AcquireResult::Final, lock.result());
    assert_eq!(0, tasks.pending_count());
    assert_eq!(1, loader.opens("mesh/nothing"));
}

#[test]
fn pointer_only_never_loads() {
    let loader = CountingLoader::with_files(&[("a", b"a")]);
    let (manager, tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<Mesh>("a");
    let lock = manager
        .begin_acquire(&handle, AcquireMode::PointerOnly, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");

    assert!(lock.bytes.is_empty());
    assert_eq!(ResourceState::Unloaded, handle.state());
    assert!(manager.loading_queue().is_empty());
    assert_eq!(0, tasks.pending_count());
}

#[test]
fn locks_are_counted_until_dropped() {
    let loader = CountingLoader::with_files(&[("a", b"a")]);
    let (manager, _tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<Mesh>("a");
    let first = manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    let second = manager
        .begin_acquire(&handle, AcquireMode::PointerOnly, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    assert_eq!(2, handle.info().acquire_count());

    manager.end_acquire(first);
    drop(second);
    assert_eq!(0, handle.info().acquire_count());
}

#[test]
fn loaded_resources_keep_refining_quality() {
    let loader = CountingLoader::with_files(&[("tex/grass", b"grass")]);
    let (manager, tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<ProgressiveTexture>("tex/grass");
    {
        let lock = manager
            .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None)
            .expect("Acquire failed")
            .expect("Acquire returned nothing");
        assert_eq!(1, lock.levels);
    }
    assert_eq!(TEXTURE_LEVELS - 1, handle.info().quality_levels_loadable());

    tasks.run_pending();
    assert_eq!(0, handle.info().quality_levels_loadable());
    assert_eq!(TEXTURE_LEVELS - 1, handle.info().quality_levels_discardable());
    assert_eq!(TEXTURE_LEVELS as usize, loader.opens("tex/grass"));

    // fully loaded, acquiring doesn't queue anything
    manager
        .begin_acquire(&handle, AcquireMode::AllowLoadingFallback, None)
        .expect("Acquire failed");
    assert!(manager.loading_queue().is_empty());
    assert_eq!(0, tasks.pending_count());
}

#[test]
fn main_thread_resources_load_while_blocking_on_the_main_thread() {
    let loader = CountingLoader::with_files(&[("mat/wood", b"wood")]);
    let (manager, _tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<MainThreadMaterial>("mat/wood");
    let lock = manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");

    assert_eq!("wood", lock.source);
    assert_eq!(Some(std::thread::current().id()), lock.updated_on);
}

#[test]
fn nested_acquire_permissions_are_transitive() {
    let loader = CountingLoader::with_files(&[]);
    let (manager, _tasks) = serial_manager(&loader);

    manager.allow_resource_type_acquire_during_update_content::<MainThreadMaterial, ProgressiveTexture>();
    manager.allow_resource_type_acquire_during_update_content::<ProgressiveTexture, Mesh>();

    let allowed = |a, b| manager.is_resource_type_acquire_during_update_content_allowed(a, b);
    let material = TypeId::of::<MainThreadMaterial>();
    let texture = TypeId::of::<ProgressiveTexture>();
    let mesh = TypeId::of::<Mesh>();

    assert!(allowed(material, texture));
    assert!(allowed(material, mesh));
    assert!(allowed(texture, mesh));
    assert!(!allowed(mesh, texture));
    assert!(!allowed(mesh, mesh));
}

#[test]
fn reloading_a_locked_resource_keeps_the_locked_content() {
    let loader = CountingLoader::with_files(&[("mesh/rock", b"old")]);
    let (manager, _tasks) = serial_manager(&loader);

    let handle = manager.load_resource::<Mesh>("mesh/rock");
    let held = manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");

    loader.set_file("mesh/rock", b"new");
    assert!(manager.reload_resource(&handle, true));
    // acquired just now, so it is queued again right away
    assert_eq!(ResourceState::LoadingInProgress, handle.state());
    assert_eq!(b"old".to_vec(), held.bytes);

    let fresh = manager
        .begin_acquire(&handle, AcquireMode::BlockTillLoaded, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");
    assert_eq!(b"new".to_vec(), fresh.bytes);
    assert_eq!(b"old".to_vec(), held.bytes);
    assert_eq!(2, handle.info().acquire_count());
}

/// Serial task system that records which tickets were waited for.
#[derive(Debug, Default)]
struct TicketRecorder {
    inner: SerialTaskSystem,
    submitted: Mutex<Vec<TaskTicket>>,
    waited: Mutex<Vec<TaskTicket>>,
}

impl TaskSystem for TicketRecorder {
    fn submit(&self, task: Task, priority: TaskPriority) -> TaskTicket {
        let ticket = self.inner.submit(task, priority);
        self.submitted.lock().push(ticket);
        ticket
    }

    fn is_finished(&self, ticket: TaskTicket) -> bool {
        self.inner.is_finished(ticket)
    }

    fn wait_for_ticket(&self, ticket: TaskTicket) {
        self.waited.lock().push(ticket);
        self.inner.wait_for_ticket(ticket);
    }

    fn wait_for_condition(&self, condition: &mut dyn FnMut() -> bool) {
        self.inner.wait_for_condition(condition);
    }

    fn current_worker_class(&self) -> WorkerClass {
        self.inner.current_worker_class()
    }

    fn is_main_thread(&self) -> bool {
        self.inner.is_main_thread()
    }

    fn cancel(&self, ticket: TaskTicket) -> bool {
        self.inner.cancel(ticket)
    }

    fn run_main_thread_tasks(&self) -> usize {
        self.inner.run_main_thread_tasks()
    }
}

/// Blocks on "b" while the content update of "a" is in flight. Returns the
/// tickets waited for and the ticket of that update.
fn wait_behind_running_update(allow_nested: bool) -> (Vec<TaskTicket>, TaskTicket) {
    setup_logger();

    let loader = CountingLoader::with_files(&[("a", b"a"), ("b", b"b")]);
    let tasks = Arc::new(TicketRecorder::default());
    let manager = ResourceManager::new(
        StreamingConfig::default(),
        Arc::clone(&tasks) as Arc<dyn TaskSystem>,
    );
    manager.set_default_resource_loader(Some(Arc::clone(&loader) as Arc<dyn ResourceLoader>));
    if allow_nested {
        manager.allow_resource_type_acquire_during_update_content::<Mesh, Mesh>();
    }

    let a = manager.load_resource::<Mesh>("a");
    manager.preload_resource(&a, false);
    // reads the data of "a" and submits its content update
    assert!(tasks.inner.run_one());
    let update_a = tasks.submitted.lock()[1];
    assert!(!tasks.is_finished(update_a));

    let b = manager.load_resource::<Mesh>("b");
    let lock = manager
        .begin_acquire(&b, AcquireMode::BlockTillLoaded, None)
        .expect("Acquire failed")
        .expect("Acquire returned nothing");

    assert_eq!(b"b".to_vec(), lock.bytes);
    assert_eq!(ResourceState::Loaded, a.state());

    let waited = tasks.waited.lock().clone();
    (waited, update_a)
}

#[test]
fn blocking_acquire_first_finishes_updates_that_cannot_depend_on_it() {
    let (waited, update_a) = wait_behind_running_update(false);
    assert_eq!(vec![update_a], waited);
}

#[test]
fn blocking_acquire_does_not_wait_for_updates_allowed_to_acquire_it() {
    let (waited, _) = wait_behind_running_update(true);
    assert!(waited.is_empty());
}
