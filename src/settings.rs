use crate::errors::{SettingsError, StorageError};
use crate::reconcile::SettingsMeta;
use crate::storage::{keys, Entries, KeyValueStore, EXPORT_FILE};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_SAVE_EVERY_N: u64 = 500;
pub const MIN_FILTER_THRESHOLD: f64 = 0.01;
pub const MAX_FILTER_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub enabled: bool,
    pub path: Option<String>,
    pub save_every_n: Option<u64>,
    pub filter_threshold: Option<f64>,
    pub show_zeros: bool,
    pub only_zeros: bool,
}

impl Settings {
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self, StorageError> {
        let entries = store
            .get(&[
                keys::ENABLED,
                keys::ENABLED_LEGACY,
                keys::EXPORT_PATH,
                keys::EXPORT_PATH_LEGACY,
                keys::SAVE_EVERY_N,
                keys::FILTER_THRESHOLD,
                keys::SHOW_ZEROS,
                keys::ONLY_ZEROS,
            ])
            .await?;

        let current_enabled = present(&entries, keys::ENABLED);
        let legacy_enabled = present(&entries, keys::ENABLED_LEGACY);
        let current_path = present(&entries, keys::EXPORT_PATH);
        let legacy_path = present(&entries, keys::EXPORT_PATH_LEGACY);

        let mut migration = Entries::new();
        if let (None, Some(legacy)) = (current_enabled, legacy_enabled) {
            migration.insert(keys::ENABLED.to_string(), Value::Bool(truthy(legacy)));
        }
        if let (None, Some(legacy)) = (current_path, legacy_path) {
            migration.insert(keys::EXPORT_PATH.to_string(), legacy.clone());
        }
        if !migration.is_empty() {
            if let Err(err) = store.set(migration).await {
                warn!("failed to migrate legacy settings keys: {err}");
            }
        }

        Ok(Self {
            enabled: current_enabled.or(legacy_enabled).is_some_and(truthy),
            path: current_path
                .or(legacy_path)
                .and_then(Value::as_str)
                .map(str::to_string),
            save_every_n: present(&entries, keys::SAVE_EVERY_N).and_then(positive_int),
            filter_threshold: present(&entries, keys::FILTER_THRESHOLD).and_then(float),
            show_zeros: present(&entries, keys::SHOW_ZEROS).is_some_and(truthy),
            only_zeros: present(&entries, keys::ONLY_ZEROS).is_some_and(truthy),
        })
    }

    pub fn effective_save_every_n(&self) -> u64 {
        self.save_every_n.unwrap_or(DEFAULT_SAVE_EVERY_N)
    }

    pub fn meta(&self, saved_at: String) -> SettingsMeta {
        SettingsMeta {
            saved_at,
            save_every_n: self.save_every_n,
            filter_threshold: self.filter_threshold,
            show_zeros: self.show_zeros,
            only_zeros: self.only_zeros,
        }
    }
}

fn present<'a>(entries: &'a Entries, key: &str) -> Option<&'a Value> {
    entries.get(key).filter(|value| !value.is_null())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn positive_int(value: &Value) -> Option<u64> {
    let parsed = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| n.is_finite() && *n >= 1.0).map(|n| n.trunc() as u64)),
        Value::String(text) => {
            let text = text.trim();
            let digits_end = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
            text[..digits_end].parse().ok()
        }
        _ => None,
    };
    parsed.filter(|n| *n > 0)
}

fn float(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

// Explicit `null` clears a nullable field; an absent field leaves it alone.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "explicit")]
    pub save_every_n: Option<Option<i64>>,
    #[serde(default, deserialize_with = "explicit")]
    pub filter_threshold: Option<Option<f64>>,
    #[serde(default)]
    pub show_zeros: Option<bool>,
    #[serde(default)]
    pub only_zeros: Option<bool>,
}

fn explicit<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, PartialEq)]
pub struct SettingsChanges {
    pub set: Entries,
    pub remove: Vec<&'static str>,
}

impl SettingsUpdate {
    pub fn into_changes(self) -> Result<SettingsChanges, SettingsError> {
        let mut changes = SettingsChanges::default();

        if let Some(enabled) = self.enabled {
            changes.set.insert(keys::ENABLED.to_string(), Value::Bool(enabled));
            let path = if enabled {
                Value::String(EXPORT_FILE.to_string())
            } else {
                Value::Null
            };
            changes.set.insert(keys::EXPORT_PATH.to_string(), path);
        }

        match self.save_every_n {
            Some(Some(n)) if n > 0 => {
                changes.set.insert(keys::SAVE_EVERY_N.to_string(), Value::from(n));
            }
            Some(Some(n)) => return Err(SettingsError::SaveEveryNotPositive(n)),
            Some(None) => changes.remove.push(keys::SAVE_EVERY_N),
            None => {}
        }

        match self.filter_threshold {
            Some(Some(t)) if (MIN_FILTER_THRESHOLD..=MAX_FILTER_THRESHOLD).contains(&t) => {
                changes.set.insert(keys::FILTER_THRESHOLD.to_string(), Value::from(t));
            }
            Some(Some(t)) => return Err(SettingsError::ThresholdOutOfRange(t)),
            Some(None) => changes.remove.push(keys::FILTER_THRESHOLD),
            None => {}
        }

        if let Some(show) = self.show_zeros {
            changes.set.insert(keys::SHOW_ZEROS.to_string(), Value::Bool(show));
        }
        if let Some(only) = self.only_zeros {
            changes.set.insert(keys::ONLY_ZEROS.to_string(), Value::Bool(only));
        }

        Ok(changes)
    }
}

impl SettingsChanges {
    pub async fn apply(self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        if !self.set.is_empty() {
            store.set(self.set).await?;
        }
        if !self.remove.is_empty() {
            store.remove(&self.remove).await?;
        }
        Ok(())
    }
}
