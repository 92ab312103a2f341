//! Asynchronous resource streaming for games.
//!
//! Resources (textures, meshes, sounds...) are referred to by string IDs and
//! loaded in the background by a `ResourceManager`. Code that needs one asks
//! for read access through `ResourceManager::begin_acquire` and decides how
//! long it is willing to wait: not at all, long enough to get a loading
//! fallback, or until the real thing is loaded.
//!
//! # Example
//!
//! ```no_run
//! use std::{io::Read, time::Duration};
//!
//! use amethyst_streaming::{
//!     AcquireMode, LoadDesc, MemoryUsage, Resource, ResourceInfo, ResourceManager,
//!     StreamingConfig, Unload,
//! };
//!
//! #[derive(Clone, Default)]
//! struct Text(String);
//!
//! impl Resource for Text {
//!     const NAME: &'static str = "Text";
//!     type Descriptor = String;
//!
//!     fn create_from_descriptor(&mut self, _: &ResourceInfo, text: String) -> LoadDesc {
//!         self.0 = text;
//!         LoadDesc::loaded()
//!     }
//!
//!     fn update_content(&mut self, _: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc {
//!         match data.map(|d| d.read_to_string(&mut self.0)) {
//!             Some(Ok(_)) => LoadDesc::loaded(),
//!             _ => LoadDesc::missing(),
//!         }
//!     }
//!
//!     fn unload_data(&mut self, _: Unload) -> LoadDesc {
//!         self.0.clear();
//!         LoadDesc::unloaded()
//!     }
//!
//!     fn memory_usage(&self) -> MemoryUsage {
//!         MemoryUsage::new(self.0.len() as u64, 0)
//!     }
//! }
//!
//! fn main() -> amethyst_streaming::Result<()> {
//!     let manager = ResourceManager::with_thread_pools(StreamingConfig::default())?;
//!     let readme = manager.load_resource::<Text>("README.md");
//!
//!     if let Some(text) = manager.begin_acquire(&readme, AcquireMode::BlockTillLoaded, None)? {
//!         println!("{}", text.0);
//!     }
//!
//!     manager.per_frame_update(Duration::from_millis(16));
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

#![doc(
    html_logo_url = "https://amethyst.rs/brand/logo-standard.svg",
    html_root_url = "https://docs.amethyst.rs/stable"
)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    rust_2018_compatibility
)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub use crate::{
    config::{ConfigError, StreamingConfig},
    error::{Error, Result},
    events::{
        EventChannel, ManagerEvent, ResourceEvent, ResourceEventType, SubscriberId,
    },
    handle::Handle,
    loader::{FileLoader, LoadData, MemoryLoader, ResourceLoader},
    manager::{CleanupCallbackId, QueueEntry, ResourceLock, ResourceManager},
    queue::LoadingQueue,
    resource::{Resource, ResourceInfo, ResourceObject},
    state::{
        AcquireMode, AcquireResult, LoadDesc, MemoryUsage, ResourceFlags, ResourcePriority,
        ResourceState, Unload,
    },
    task::{
        RayonTaskSystem, SerialTaskSystem, Task, TaskPriority, TaskSystem, TaskTicket,
        WorkerClass,
    },
};

mod config;
mod error;
mod events;
mod handle;
mod loader;
mod manager;
mod queue;
mod resource;
mod state;
mod task;
