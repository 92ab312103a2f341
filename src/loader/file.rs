use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::debug;
#[cfg(feature = "profiler")]
use thread_profiler::profile_scope;

use super::{LoadData, ResourceLoader};
use crate::resource::ResourceInfo;

/// Loads resources from a directory, treating the resource ID as a relative path.
///
/// This is the default loader of a `ResourceManager`, rooted at
/// `StreamingConfig::resource_root`.
#[derive(Debug)]
pub struct FileLoader {
    loc: PathBuf,
}

impl FileLoader {
    /// Creates a new loader reading from `loc`.
    pub fn new<P>(loc: P) -> Self
    where
        P: Into<PathBuf>,
    {
        FileLoader { loc: loc.into() }
    }

    /// Path of the file backing resource `id`.
    pub fn path(&self, id: &str) -> PathBuf {
        let mut path = self.loc.clone();
        path.extend(Path::new(id).iter());

        path
    }

    fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

impl ResourceLoader for FileLoader {
    fn open_data_stream(&self, info: &ResourceInfo) -> LoadData {
        #[cfg(feature = "profiler")]
        profile_scope!("file_loader_open");

        let path = self.path(info.id());
        let mut load_data = LoadData::new(path.display().to_string(), None, None);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Failed to open file {:?}: {}", path, e);
                return load_data;
            }
        };

        let mut bytes = Vec::new();
        if let Err(e) = file.read_to_end(&mut bytes) {
            debug!("Failed to read file {:?}: {}", path, e);
            return load_data;
        }

        load_data.modification_time = Self::modified(&path);
        load_data.data = Some(bytes);
        load_data
    }

    fn is_resource_outdated(&self, info: &ResourceInfo) -> bool {
        match info.modification_time() {
            Some(loaded) => Self::modified(&self.path(info.id())) != Some(loaded),
            // never loaded from a file, so any file is newer
            None => true,
        }
    }
}
