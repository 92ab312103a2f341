use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use ::rayon::{ThreadPool, ThreadPoolBuilder};
use crossbeam_queue::SegQueue;
use fnv::FnvHashSet;
use log::error;
use parking_lot::{Condvar, Mutex};

use super::{Task, TaskPriority, TaskSystem, TaskTicket, WorkerClass};
use crate::{config::StreamingConfig, error::Error};

#[derive(Default)]
struct Tickets {
    unfinished: FnvHashSet<u64>,
    cancelled: FnvHashSet<u64>,
    /// Bumped on every submit, finished task and state change notification.
    generation: u64,
}

struct Shared {
    next_ticket: AtomicU64,
    tickets: Mutex<Tickets>,
    changed: Condvar,
    main_thread_tasks: SegQueue<Task>,
}

impl Shared {
    fn run(&self, ticket: u64, task: Task) {
        let cancelled = self.tickets.lock().cancelled.remove(&ticket);
        if !cancelled {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Task {} panicked", ticket);
            }
        }

        let mut tickets = self.tickets.lock();
        tickets.unfinished.remove(&ticket);
        tickets.cancelled.remove(&ticket);
        tickets.generation += 1;
        self.changed.notify_all();
    }

    fn generation(&self) -> u64 {
        self.tickets.lock().generation
    }

    fn notify(&self) {
        self.tickets.lock().generation += 1;
        self.changed.notify_all();
    }

    /// Sleeps until something happened after `seen` was read.
    fn wait_past(&self, seen: u64) {
        let mut tickets = self.tickets.lock();
        while tickets.generation == seen {
            self.changed.wait(&mut tickets);
        }
    }
}

/// Task system backed by two rayon pools, one for file access and one for
/// general work, plus a queue drained by the main thread.
///
/// The thread creating the task system is the main thread.
pub struct RayonTaskSystem {
    file_access: ThreadPool,
    workers: ThreadPool,
    main_thread: ThreadId,
    shared: Arc<Shared>,
}

impl fmt::Debug for RayonTaskSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonTaskSystem")
            .field("file_access_threads", &self.file_access.current_num_threads())
            .field("worker_threads", &self.workers.current_num_threads())
            .finish()
    }
}

impl RayonTaskSystem {
    /// Creates the pools as configured.
    pub fn new(config: &StreamingConfig) -> Result<Self, Error> {
        let file_access =
            Self::build_pool("file-access", Some(config.file_access_threads.max(1)))?;
        let workers = Self::build_pool("resource-worker", config.worker_threads)?;

        Ok(RayonTaskSystem {
            file_access,
            workers,
            main_thread: thread::current().id(),
            shared: Arc::new(Shared {
                next_ticket: AtomicU64::new(1),
                tickets: Mutex::new(Tickets::default()),
                changed: Condvar::new(),
                main_thread_tasks: SegQueue::new(),
            }),
        })
    }

    fn build_pool(name: &'static str, thread_count: Option<usize>) -> Result<ThreadPool, Error> {
        let builder = ThreadPoolBuilder::new().thread_name(move |i| format!("{}-{}", name, i));
        #[cfg(feature = "profiler")]
        let builder = builder.start_handler(|_index| {
            thread_profiler::register_thread_with_profiler();
        });
        let builder = if let Some(thread_count) = thread_count {
            builder.num_threads(thread_count)
        } else {
            builder
        };

        builder.build().map_err(|e| Error::ThreadPool(e.to_string()))
    }

    /// Makes progress on other work instead of idling.
    fn help(&self) -> bool {
        if self.is_main_thread() {
            return self.run_main_thread_tasks() > 0;
        }

        // runs pending work of the pool the calling thread belongs to, if any
        matches!(::rayon::yield_now(), Some(::rayon::Yield::Executed))
    }
}

impl TaskSystem for RayonTaskSystem {
    fn submit(&self, task: Task, priority: TaskPriority) -> TaskTicket {
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut tickets = self.shared.tickets.lock();
            tickets.unfinished.insert(ticket);
            // waiting threads may be able to help with it
            tickets.generation += 1;
        }

        let shared = Arc::clone(&self.shared);
        let job = move || shared.run(ticket, task);

        match priority {
            TaskPriority::FileAccess => self.file_access.spawn(job),
            TaskPriority::LateNextFrame => self.workers.spawn(job),
            TaskPriority::MainThread => self.shared.main_thread_tasks.push(Box::new(job)),
        }

        self.shared.changed.notify_all();
        TaskTicket(ticket)
    }

    fn is_finished(&self, ticket: TaskTicket) -> bool {
        !self.shared.tickets.lock().unfinished.contains(&ticket.0)
    }

    fn wait_for_ticket(&self, ticket: TaskTicket) {
        self.wait_for_condition(&mut || self.is_finished(ticket));
    }

    fn wait_for_condition(&self, condition: &mut dyn FnMut() -> bool) {
        loop {
            let seen = self.shared.generation();
            if condition() {
                return;
            }
            if !self.help() {
                self.shared.wait_past(seen);
            }
        }
    }

    fn notify_state_change(&self) {
        self.shared.notify();
    }

    fn current_worker_class(&self) -> WorkerClass {
        if self.is_main_thread() {
            WorkerClass::MainThread
        } else if self.file_access.current_thread_index().is_some() {
            WorkerClass::FileAccess
        } else if self.workers.current_thread_index().is_some() {
            WorkerClass::Worker
        } else {
            WorkerClass::Other
        }
    }

    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    fn cancel(&self, ticket: TaskTicket) -> bool {
        let mut tickets = self.shared.tickets.lock();
        if tickets.unfinished.contains(&ticket.0) {
            tickets.cancelled.insert(ticket.0)
        } else {
            false
        }
    }

    fn run_main_thread_tasks(&self) -> usize {
        debug_assert!(self.is_main_thread(), "Main thread tasks run on the main thread");

        let mut count = 0;
        while let Some(task) = self.shared.main_thread_tasks.pop() {
            task();
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::RayonTaskSystem;
    use crate::{
        config::StreamingConfig,
        task::{TaskPriority, TaskSystem, WorkerClass},
    };

    fn task_system() -> Arc<RayonTaskSystem> {
        let mut config = StreamingConfig::default();
        config.worker_threads = Some(2);
        Arc::new(RayonTaskSystem::new(&config).expect("Failed to create pools"))
    }

    #[test]
    fn tasks_run_on_their_thread_class() {
        let tasks = task_system();
        assert_eq!(WorkerClass::MainThread, tasks.current_worker_class());

        let classes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut tickets = Vec::new();
        for priority in &[TaskPriority::FileAccess, TaskPriority::LateNextFrame] {
            let inner = Arc::clone(&tasks);
            let classes = Arc::clone(&classes);
            tickets.push(tasks.submit(
                Box::new(move || classes.lock().push(inner.current_worker_class())),
                *priority,
            ));
        }

        for ticket in tickets {
            tasks.wait_for_ticket(ticket);
        }

        let classes = classes.lock();
        assert!(classes.contains(&WorkerClass::FileAccess));
        assert!(classes.contains(&WorkerClass::Worker));
    }

    #[test]
    fn waiting_on_the_main_thread_runs_main_thread_tasks() {
        let tasks = task_system();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let ticket = tasks.submit(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::MainThread,
        );

        assert!(!tasks.is_finished(ticket));
        tasks.wait_for_ticket(ticket);
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let tasks = task_system();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let ticket = tasks.submit(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::MainThread,
        );

        assert!(tasks.cancel(ticket));
        tasks.run_main_thread_tasks();

        assert!(tasks.is_finished(ticket));
        assert_eq!(0, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn condition_wait_sees_worker_progress() {
        let tasks = task_system();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let c = Arc::clone(&counter);
            tasks.submit(
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                TaskPriority::LateNextFrame,
            );
        }

        tasks.wait_for_condition(&mut || counter.load(Ordering::SeqCst) == 8);
        assert_eq!(8, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn state_changes_outside_of_tasks_wake_waiters() {
        let tasks = task_system();
        let done = Arc::new(AtomicBool::new(false));

        let changer = {
            let tasks = Arc::clone(&tasks);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                done.store(true, Ordering::SeqCst);
                tasks.notify_state_change();
            })
        };

        tasks.wait_for_condition(&mut || done.load(Ordering::SeqCst));
        changer.join().expect("Changing thread panicked");
    }
}
