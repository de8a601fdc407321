use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const META_DIR: &str = "meta";
pub const ERRORS_DIR: &str = "errors";
pub const RESPONSE_CACHE_DIR: &str = "ResponseCache";
pub const META_SUFFIX: &str = ".meta.json";

/// Directory of one queue, relative to the storage root.
///
/// ```text
/// <connection>/<queue>/<guid>[.ext]
/// <connection>/<queue>/meta/<guid>.meta.json
/// <connection>/<queue>/errors/...
/// ResponseCache/<queue>/meta/<guid>.meta.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueuePath {
    dir: PathBuf,
}

impl QueuePath {
    pub fn queue(connection: &str, queue: &str) -> Self {
        Self {
            dir: Path::new(connection).join(queue),
        }
    }

    pub fn cache(queue: &str) -> Self {
        Self {
            dir: Path::new(RESPONSE_CACHE_DIR).join(queue),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.dir.join(META_DIR)
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.dir.join(ERRORS_DIR)
    }

    pub fn errors_meta_dir(&self) -> PathBuf {
        self.errors_dir().join(META_DIR)
    }

    pub fn payload_path(&self, guid: &str, extension: Option<&OsStr>) -> PathBuf {
        let mut path = self.dir.join(guid);
        if let Some(extension) = extension {
            path.set_extension(extension);
        }
        path
    }

    pub fn meta_path(&self, guid: &str) -> PathBuf {
        self.meta_dir().join(format!("{guid}{META_SUFFIX}"))
    }
}

pub fn is_meta_file(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.ends_with(META_SUFFIX))
}
