//! The store file on disk: one JSON object mapping keys to values.
//!
//! The file is read once at open. `set` only touches memory; `save` writes
//! the whole object to a sibling temp file and renames it over the store
//! file, so a crash mid-save leaves the previous file intact.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use parking_lot::RwLock;
use pzmm_core::{StoreGateway, StoreValue};
use tracing::{debug, info};

use crate::config::StoreConfig;

pub struct JsonFileGateway {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, StoreValue>>,
    /// Set by `set`/`clear`, reset by a successful `save`.
    dirty: AtomicBool,
}

impl JsonFileGateway {
    /// Loads the store file at `path`. A missing file opens an empty store.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a JSON object.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => parse(&bytes).with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "store file not found, starting empty");
                BTreeMap::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        info!(path = %path.display(), keys = entries.len(), "store file opened");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    /// Opens `config.store_file_name` inside `dir`.
    ///
    /// # Errors
    ///
    /// See [`JsonFileGateway::open`].
    pub async fn open_in(dir: impl AsRef<Path>, config: &StoreConfig) -> anyhow::Result<Self> {
        Self::open(dir.as_ref().join(&config.store_file_name)).await
    }

    #[must_use]
    pub fn store_file_path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn parse(bytes: &[u8]) -> anyhow::Result<BTreeMap<String, StoreValue>> {
    match serde_json::from_slice::<StoreValue>(bytes)? {
        StoreValue::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("expected a JSON object at the top level, found {}", kind(&other)),
    }
}

fn kind(value: &StoreValue) -> &'static str {
    match value {
        StoreValue::Null => "null",
        StoreValue::Bool(_) => "a boolean",
        StoreValue::Number(_) => "a number",
        StoreValue::String(_) => "a string",
        StoreValue::Array(_) => "an array",
        StoreValue::Object(_) => "an object",
    }
}

#[async_trait]
impl StoreGateway for JsonFileGateway {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<StoreValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn get_batch(&self, keys: &[String]) -> anyhow::Result<HashMap<String, Option<StoreValue>>> {
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .map(|key| (key.clone(), entries.get(key).cloned()))
            .collect())
    }

    async fn set(&self, key: &str, value: &StoreValue) -> anyhow::Result<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let bytes = {
            let entries = self.entries.read();
            serde_json::to_vec_pretty(&*entries)
        };
        let result = async {
            let bytes = bytes.context("encoding store")?;
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let temp = self.temp_path();
            tokio::fs::write(&temp, &bytes)
                .await
                .with_context(|| format!("writing {}", temp.display()))?;
            tokio::fs::rename(&temp, &self.path)
                .await
                .with_context(|| format!("replacing {}", self.path.display()))?;
            debug!(path = %self.path.display(), bytes = bytes.len(), "store file written");
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if result.is_err() {
            // Unsaved changes remain; the next save retries.
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.entries.write().clear();
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, _)| key.clone())
            .collect())
    }
}
