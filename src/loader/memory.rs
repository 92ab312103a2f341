use std::time::SystemTime;

use parking_lot::Mutex;

use super::{LoadData, ResourceLoader};
use crate::resource::ResourceInfo;

/// Hands out a fixed buffer once.
///
/// Meant for `ResourceManager::update_resource_with_custom_loader` and
/// `ResourceManager::get_existing_resource_or_create_async`, where the data of
/// a resource comes from memory instead of the default loader.
#[derive(Debug)]
pub struct MemoryLoader {
    description: String,
    modification_time: Option<SystemTime>,
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryLoader {
    /// Creates a loader that provides `data` on the next load.
    pub fn new<D: Into<Vec<u8>>>(data: D) -> Self {
        MemoryLoader {
            description: String::from("memory"),
            modification_time: None,
            data: Mutex::new(Some(data.into())),
        }
    }

    /// Sets the description reported to the resource.
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the modification time reported to the resource.
    pub fn with_modification_time(mut self, time: SystemTime) -> Self {
        self.modification_time = Some(time);
        self
    }
}

impl ResourceLoader for MemoryLoader {
    fn open_data_stream(&self, _info: &ResourceInfo) -> LoadData {
        LoadData::new(
            self.description.clone(),
            self.modification_time,
            self.data.lock().take(),
        )
    }
}
