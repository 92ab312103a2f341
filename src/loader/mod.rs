//! Byte sources that provide the data resources are loaded from.

pub use self::{file::FileLoader, memory::MemoryLoader};

use std::time::SystemTime;

use derive_new::new;

use crate::resource::ResourceInfo;

mod file;
mod memory;

/// The result of opening the data of a resource.
#[derive(Clone, Debug, Default, new)]
pub struct LoadData {
    /// Human readable description of where the data came from.
    pub description: String,
    /// Modification time of the data, if the source knows it.
    pub modification_time: Option<SystemTime>,
    /// The data. `None` if it could not be found or read.
    pub data: Option<Vec<u8>>,
}

/// Provides the data of resources, e.g. from the file system.
///
/// Loaders are called from data load tasks and have to be thread safe.
/// They never fail; a resource without data is handed `None` and decides
/// itself how to treat that.
pub trait ResourceLoader: Send + Sync + 'static {
    /// Reads the data for `info`.
    fn open_data_stream(&self, info: &ResourceInfo) -> LoadData;

    /// Called after the content has been updated from `data`.
    fn close_data_stream(&self, _info: &ResourceInfo, _data: &LoadData) {}

    /// Whether the data changed since the resource was loaded.
    fn is_resource_outdated(&self, _info: &ResourceInfo) -> bool {
        false
    }
}
