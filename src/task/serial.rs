use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
    thread::{self, ThreadId},
};

use fnv::FnvHashSet;
use parking_lot::Mutex;

use super::{Task, TaskPriority, TaskSystem, TaskTicket, WorkerClass};

const IDLE: u8 = 0;
const FILE_ACCESS: u8 = 1;
const WORKER: u8 = 2;

/// Runs every task on the main thread, in submission order, when asked to.
///
/// Nothing happens in the background: tasks run from `run_pending`,
/// `run_main_thread_tasks` and while waiting. This makes loading fully
/// deterministic, which is what tests and tools want.
pub struct SerialTaskSystem {
    main_thread: ThreadId,
    next_ticket: AtomicU64,
    pending: Mutex<VecDeque<(u64, TaskPriority, Task)>>,
    unfinished: Mutex<FnvHashSet<u64>>,
    running: AtomicU8,
}

impl fmt::Debug for SerialTaskSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTaskSystem")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Default for SerialTaskSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTaskSystem {
    /// Creates a task system whose main thread is the calling thread.
    pub fn new() -> Self {
        SerialTaskSystem {
            main_thread: thread::current().id(),
            next_ticket: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            unfinished: Mutex::new(FnvHashSet::default()),
            running: AtomicU8::new(IDLE),
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs the oldest pending task. Returns `false` if there was none.
    pub fn run_one(&self) -> bool {
        let next = self.pending.lock().pop_front();

        match next {
            Some((ticket, priority, task)) => {
                let class = match priority {
                    TaskPriority::FileAccess => FILE_ACCESS,
                    TaskPriority::LateNextFrame => WORKER,
                    TaskPriority::MainThread => IDLE,
                };
                let previous = self.running.swap(class, Ordering::AcqRel);
                task();
                self.running.store(previous, Ordering::Release);

                self.unfinished.lock().remove(&ticket);
                true
            }
            None => false,
        }
    }

    /// Runs tasks until none are left, including tasks submitted meanwhile.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }
}

impl TaskSystem for SerialTaskSystem {
    fn submit(&self, task: Task, priority: TaskPriority) -> TaskTicket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.unfinished.lock().insert(ticket);
        self.pending.lock().push_back((ticket, priority, task));

        TaskTicket(ticket)
    }

    fn is_finished(&self, ticket: TaskTicket) -> bool {
        !self.unfinished.lock().contains(&ticket.0)
    }

    fn wait_for_ticket(&self, ticket: TaskTicket) {
        while !self.is_finished(ticket) {
            // a task that is still unfinished with nothing pending is running further up this stack
            assert!(
                self.run_one(),
                "Waiting for task {} which can never finish",
                ticket
            );
        }
    }

    fn wait_for_condition(&self, condition: &mut dyn FnMut() -> bool) {
        while !condition() {
            assert!(
                self.run_one(),
                "Waiting for a condition no pending task can satisfy"
            );
        }
    }

    fn current_worker_class(&self) -> WorkerClass {
        match self.running.load(Ordering::Acquire) {
            FILE_ACCESS => WorkerClass::FileAccess,
            WORKER => WorkerClass::Worker,
            _ if self.is_main_thread() => WorkerClass::MainThread,
            _ => WorkerClass::Other,
        }
    }

    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    fn cancel(&self, ticket: TaskTicket) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|(t, _, _)| *t == ticket.0) {
            Some(index) => {
                pending.remove(index);
                self.unfinished.lock().remove(&ticket.0);
                true
            }
            None => false,
        }
    }

    fn run_main_thread_tasks(&self) -> usize {
        self.run_pending()
    }
}
