use crate::errors::StorageError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{env, path::Path, path::PathBuf};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

pub mod keys {
    pub const ENABLED: &str = "enabledDataCollection";
    pub const ENABLED_LEGACY: &str = "dataCollectionEnabled";
    pub const EXPORT_PATH: &str = "pathDataCollection";
    pub const EXPORT_PATH_LEGACY: &str = "dataCollectionPath";
    pub const SAVE_EVERY_N: &str = "saveEveryN";
    pub const FILTER_THRESHOLD: &str = "filterThreshold";
    pub const SHOW_ZEROS: &str = "showZeros";
    pub const ONLY_ZEROS: &str = "onlyZeros";
    pub const ACCUMULATED_CSV: &str = "accumulatedCsv";
    pub const ACCUMULATED_CSV_HASH: &str = "accumulatedCsvHash";
    pub const LAST_SAVED_STATS: &str = "lastSavedStats";
    pub const LAST_SAVE_ERROR: &str = "lastSaveError";
    pub const PROCESSED_IDS: &str = "processedIds";
    pub const PENDING_SAVE_DATA: &str = "pendingSaveData";
    pub const PENDING_SAVE_HASH: &str = "pendingSaveHash";
}

pub const EXPORT_FILE: &str = "XData/xd.csv";

pub type Entries = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub keys: Vec<String>,
}

impl StorageChange {
    pub fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StorageError>;
    async fn set(&self, entries: Entries) -> Result<(), StorageError>;
    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub async fn get_value(store: &dyn KeyValueStore, key: &str) -> Result<Option<Value>, StorageError> {
    let mut entries = store.get(&[key]).await?;
    Ok(entries.remove(key))
}

pub fn resolve_data_path() -> Result<PathBuf, std::io::Error> {
    if let Ok(path) = env::var("APP_DATA_PATH") {
        return Ok(PathBuf::from(path));
    }

    Ok(PathBuf::from("data/state.json"))
}

pub fn resolve_export_dir() -> PathBuf {
    env::var("APP_EXPORT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("exports"))
}

pub struct JsonFileStore {
    path: Option<PathBuf>,
    data: Mutex<Entries>,
    changes: broadcast::Sender<StorageChange>,
}

impl JsonFileStore {
    pub async fn open(path: PathBuf) -> Self {
        let data = load_entries(&path).await;
        Self::with_entries(Some(path), data)
    }

    pub fn in_memory() -> Self {
        Self::with_entries(None, Entries::new())
    }

    fn with_entries(path: Option<PathBuf>, data: Entries) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            path,
            data: Mutex::new(data),
            changes,
        }
    }

    async fn persist(&self, data: &Entries) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(data)?;
        fs::write(path, payload).await?;
        Ok(())
    }

    fn notify(&self, keys: Vec<String>) {
        // No receivers is fine.
        let _ = self.changes.send(StorageChange { keys });
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, keys: &[&str]) -> Result<Entries, StorageError> {
        let data = self.data.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| data.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    async fn set(&self, entries: Entries) -> Result<(), StorageError> {
        let changed: Vec<String> = entries.keys().cloned().collect();
        {
            let mut data = self.data.lock().await;
            data.extend(entries);
            self.persist(&data).await?;
        }
        self.notify(changed);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        {
            let mut data = self.data.lock().await;
            for key in keys {
                data.remove(*key);
            }
            self.persist(&data).await?;
        }
        self.notify(keys.iter().map(|k| k.to_string()).collect());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

async fn load_entries(path: &Path) -> Entries {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to parse data file: {err}");
                Entries::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Entries::new(),
        Err(err) => {
            error!("failed to read data file: {err}");
            Entries::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredFile {
    pub relative_path: String,
    pub contents: String,
    pub hash: String,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, file: &DeliveredFile) -> Result<(), StorageError>;
}

pub struct FileDelivery {
    root: PathBuf,
}

impl FileDelivery {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }
}

#[async_trait]
impl Delivery for FileDelivery {
    async fn deliver(&self, file: &DeliveredFile) -> Result<(), StorageError> {
        let path = self.path_for(&file.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, file.contents.as_bytes()).await?;
        debug!("wrote {} ({} bytes, sha256 {})", path.display(), file.contents.len(), file.hash);
        Ok(())
    }
}
