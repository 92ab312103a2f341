//! The scheduler the resource manager runs its loading work on.

pub use self::{rayon::RayonTaskSystem, serial::SerialTaskSystem};

use std::fmt;

mod rayon;
mod serial;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one submitted task.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskTicket(pub(crate) u64);

impl fmt::Display for TaskTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where and how urgently a task runs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TaskPriority {
    /// On a file access thread.
    FileAccess,
    /// On a general worker thread, no later than the next frame.
    LateNextFrame,
    /// On the main thread, during some later frame update.
    MainThread,
}

/// The class of thread code is running on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkerClass {
    /// The thread that drives the frame updates.
    MainThread,
    /// A file access thread.
    FileAccess,
    /// A general worker thread.
    Worker,
    /// Any other thread.
    Other,
}

/// Runs tasks on behalf of the resource manager.
///
/// `submit` must never run the task inline, because the manager submits
/// while holding its lock.
pub trait TaskSystem: Send + Sync {
    /// Schedules `task`.
    fn submit(&self, task: Task, priority: TaskPriority) -> TaskTicket;

    /// Whether the task has run (or was cancelled before running).
    fn is_finished(&self, ticket: TaskTicket) -> bool;

    /// Blocks until the task is finished, helping with other work meanwhile.
    fn wait_for_ticket(&self, ticket: TaskTicket);

    /// Blocks until `condition` holds. The condition is checked again whenever
    /// a task is submitted or finishes, and on `notify_state_change`.
    fn wait_for_condition(&self, condition: &mut dyn FnMut() -> bool);

    /// Wakes threads blocked in `wait_for_condition`. Called whenever loading
    /// state changes outside of a task.
    fn notify_state_change(&self) {}

    /// Class of the calling thread.
    fn current_worker_class(&self) -> WorkerClass;

    /// Whether the calling thread is the main thread.
    fn is_main_thread(&self) -> bool;

    /// Prevents a task from running if it has not started yet.
    ///
    /// Returns `true` if the task will not run.
    fn cancel(&self, ticket: TaskTicket) -> bool;

    /// Runs tasks that have to run on the main thread. Returns how many ran.
    fn run_main_thread_tasks(&self) -> usize;
}
