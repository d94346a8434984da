//! Persisted display size for execution contexts.
//!
//! Read once and cached. Writes either merge into what is on disk (keeping
//! keys this crate does not know about) or replace it outright. IO failures
//! are logged and never surface to callers.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 800,
        }
    }
}

#[derive(Debug)]
pub struct DisplayStore {
    path: PathBuf,
    cached: Mutex<Option<Map<String, Value>>>,
}

impl DisplayStore {
    pub const FILE_NAME: &'static str = "fleet-display.json";

    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(Self::FILE_NAME),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size. A missing or unreadable file yields the default.
    #[must_use]
    pub fn read(&self) -> DisplaySize {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = cached.get_or_insert_with(|| self.read_from_file());
        size_from(raw)
    }

    /// Persist `size`. With `flush`, the stored document is replaced;
    /// otherwise `size` is merged over it.
    pub fn write(&self, size: DisplaySize, flush: bool) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = if flush {
            Map::new()
        } else {
            cached
                .take()
                .unwrap_or_else(|| self.read_from_file())
        };
        doc.insert("width".to_string(), Value::from(size.width));
        doc.insert("height".to_string(), Value::from(size.height));

        match serde_json::to_vec(&doc) {
            Ok(bytes) => {
                if let Err(e) = fleet_utils::atomic_write(&self.path, &bytes) {
                    tracing::warn!(path = %self.path.display(), "Failed to persist display size: {e}");
                }
            }
            Err(e) => tracing::warn!("Failed to encode display size: {e}"),
        }
        *cached = Some(doc);
    }

    fn read_from_file(&self) -> Map<String, Value> {
        let parsed = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Map<String, Value>>(&bytes).ok());
        match parsed {
            Some(doc) => doc,
            None => {
                tracing::debug!(path = %self.path.display(), "Using default display size");
                let mut doc = Map::new();
                let size = DisplaySize::default();
                doc.insert("width".to_string(), Value::from(size.width));
                doc.insert("height".to_string(), Value::from(size.height));
                doc
            }
        }
    }
}

fn size_from(doc: &Map<String, Value>) -> DisplaySize {
    let fallback = DisplaySize::default();
    let dim = |key: &str, default: u32| {
        doc.get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    };
    DisplaySize {
        width: dim("width", fallback.width),
        height: dim("height", fallback.height),
    }
}
