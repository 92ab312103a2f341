#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io::Read,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use amethyst_streaming::{
    LoadData, LoadDesc, MemoryUsage, ResourceInfo, ResourceLoader, ResourceManager,
    ResourceState, SerialTaskSystem, StreamingConfig, TaskSystem, Unload,
};
use parking_lot::Mutex;

static LOGGER: Once = Once::new();

pub fn setup_logger() {
    LOGGER.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}] {}",
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply()
            .unwrap_or_else(|_| {
                log::debug!("Global logger already set, default logger will be used")
            });
    });
}

pub fn frame(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

/// Plain resource, missing when the loader has no data.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub bytes: Vec<u8>,
}

impl amethyst_streaming::Resource for Mesh {
    const NAME: &'static str = "Mesh";
    type Descriptor = Vec<u8>;

    fn create_from_descriptor(&mut self, _: &ResourceInfo, descriptor: Vec<u8>) -> LoadDesc {
        self.bytes = descriptor;
        LoadDesc::loaded()
    }

    fn update_content(&mut self, _: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc {
        self.bytes.clear();
        match data.map(|d| d.read_to_end(&mut self.bytes)) {
            Some(Ok(_)) => LoadDesc::loaded(),
            _ => LoadDesc::missing(),
        }
    }

    fn unload_data(&mut self, _: Unload) -> LoadDesc {
        self.bytes.clear();
        LoadDesc::unloaded()
    }

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(self.bytes.len() as u64, 0)
    }
}

pub const TEXTURE_LEVELS: u8 = 3;

/// Gains one quality level per content update.
#[derive(Clone, Debug, Default)]
pub struct ProgressiveTexture {
    pub levels: u8,
    pub low_res: Vec<u8>,
}

impl amethyst_streaming::Resource for ProgressiveTexture {
    const NAME: &'static str = "ProgressiveTexture";
    type Descriptor = u8;

    fn create_from_descriptor(&mut self, _: &ResourceInfo, levels: u8) -> LoadDesc {
        self.levels = levels;
        LoadDesc::new(ResourceState::Loaded, levels.saturating_sub(1), 0)
    }

    fn update_content(&mut self, info: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc {
        let data = match data {
            Some(data) => data,
            None => return LoadDesc::missing(),
        };

        if info.flags().contains(amethyst_streaming::ResourceFlags::HAS_LOW_RES_DATA)
            && self.levels == 0
            && self.low_res.is_empty()
        {
            let _ = data.read_to_end(&mut self.low_res);
        }

        self.levels = (self.levels + 1).min(TEXTURE_LEVELS);
        LoadDesc::new(
            ResourceState::Loaded,
            self.levels - 1,
            TEXTURE_LEVELS - self.levels,
        )
    }

    fn unload_data(&mut self, _: Unload) -> LoadDesc {
        self.levels = 0;
        self.low_res.clear();
        LoadDesc::unloaded()
    }

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(0, self.levels as u64 * 1024)
    }
}

/// Has to be updated on the main thread, records where it was.
#[derive(Clone, Debug, Default)]
pub struct MainThreadMaterial {
    pub source: String,
    pub updated_on: Option<ThreadId>,
}

impl amethyst_streaming::Resource for MainThreadMaterial {
    const NAME: &'static str = "MainThreadMaterial";
    type Descriptor = String;

    fn update_on_main_thread() -> bool {
        true
    }

    fn create_from_descriptor(&mut self, _: &ResourceInfo, source: String) -> LoadDesc {
        self.source = source;
        LoadDesc::loaded()
    }

    fn update_content(&mut self, _: &ResourceInfo, data: Option<&mut dyn Read>) -> LoadDesc {
        self.updated_on = Some(thread::current().id());
        self.source.clear();
        match data.map(|d| d.read_to_string(&mut self.source)) {
            Some(Ok(_)) => LoadDesc::loaded(),
            _ => LoadDesc::missing(),
        }
    }

    fn unload_data(&mut self, _: Unload) -> LoadDesc {
        self.source.clear();
        LoadDesc::unloaded()
    }

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(self.source.len() as u64, 0)
    }
}

/// In-memory loader that counts how often each resource was opened.
#[derive(Debug, Default)]
pub struct CountingLoader {
    files: Mutex<HashMap<String, Vec<u8>>>,
    outdated: Mutex<HashSet<String>>,
    opens: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
    total_opens: AtomicUsize,
}

impl CountingLoader {
    pub fn with_files(files: &[(&str, &[u8])]) -> Arc<Self> {
        let loader = CountingLoader::default();
        for (id, data) in files {
            loader.set_file(id, data);
        }
        Arc::new(loader)
    }

    pub fn set_file(&self, id: &str, data: &[u8]) {
        self.files.lock().insert(id.to_owned(), data.to_vec());
    }

    pub fn mark_outdated(&self, id: &str) {
        self.outdated.lock().insert(id.to_owned());
    }

    pub fn opens(&self, id: &str) -> usize {
        self.opens.lock().get(id).copied().unwrap_or(0)
    }

    /// IDs in the order they were opened.
    pub fn open_order(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn total_opens(&self) -> usize {
        self.total_opens.load(Ordering::SeqCst)
    }
}

impl ResourceLoader for CountingLoader {
    fn open_data_stream(&self, info: &ResourceInfo) -> LoadData {
        *self.opens.lock().entry(info.id().to_owned()).or_insert(0) += 1;
        self.order.lock().push(info.id().to_owned());
        self.total_opens.fetch_add(1, Ordering::SeqCst);
        self.outdated.lock().remove(info.id());

        LoadData::new(
            format!("memory:{}", info.id()),
            None,
            self.files.lock().get(info.id()).cloned(),
        )
    }

    fn is_resource_outdated(&self, info: &ResourceInfo) -> bool {
        self.outdated.lock().contains(info.id())
    }
}

/// Manager on a `SerialTaskSystem`, so nothing loads until tasks are run.
pub fn serial_manager(
    loader: &Arc<CountingLoader>,
) -> (ResourceManager, Arc<SerialTaskSystem>) {
    setup_logger();

    let tasks = Arc::new(SerialTaskSystem::new());
    let manager = ResourceManager::new(
        StreamingConfig::default(),
        Arc::clone(&tasks) as Arc<dyn TaskSystem>,
    );
    manager.set_default_resource_loader(Some(Arc::clone(loader) as Arc<dyn ResourceLoader>));

    (manager, tasks)
}
