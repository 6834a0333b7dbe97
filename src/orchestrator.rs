use crate::csv::{self, timestamp};
use crate::errors::StorageError;
use crate::models::{AggregateStore, PostObservation, SaveErrorRecord, StatsResponse};
use crate::processed::{ProcessedIdSet, PROCESSED_CAPACITY};
use crate::reconcile::{reconcile, split_header_and_rows};
use crate::schedule::ScheduledTask;
use crate::settings::{Settings, DEFAULT_SAVE_EVERY_N};
use crate::snapshot::{rehydrate, StatsSnapshot};
use crate::storage::{get_value, keys, DeliveredFile, Delivery, Entries, KeyValueStore, EXPORT_FILE};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PROCESSED_FLUSH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    Idle,
    Accumulating,
    Saving,
}

impl SavePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Accumulating => "accumulating",
            Self::Saving => "saving",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Threshold,
    IdleTimeout,
    Unload,
    Manual,
}

impl SaveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::IdleTimeout => "idleTimeout",
            Self::Unload => "unload",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { hash: String, rows: usize, bytes: usize },
    Disabled,
    Empty,
    InFlight,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Accepted { post_count: u64, save: Option<SaveOutcome> },
    Duplicate,
    Rejected,
}

struct Collector {
    store: AggregateStore,
    processed: ProcessedIdSet,
    save_every_n: u64,
    saving: bool,
    idle_timer: ScheduledTask,
    processed_flush: ScheduledTask,
}

impl Collector {
    fn phase(&self) -> SavePhase {
        if self.saving {
            SavePhase::Saving
        } else if self.idle_timer.is_armed() {
            SavePhase::Accumulating
        } else {
            SavePhase::Idle
        }
    }
}

struct SaveFailure {
    step: &'static str,
    error: StorageError,
}

fn at(step: &'static str) -> impl FnOnce(StorageError) -> SaveFailure {
    move |error| SaveFailure { step, error }
}

fn entries<const N: usize>(pairs: [(&str, Value); N]) -> Entries {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[derive(Clone)]
pub struct SaveOrchestrator {
    inner: Arc<Mutex<Collector>>,
    storage: Arc<dyn KeyValueStore>,
    delivery: Arc<dyn Delivery>,
    idle_timeout: Duration,
}

impl SaveOrchestrator {
    pub fn new(storage: Arc<dyn KeyValueStore>, delivery: Arc<dyn Delivery>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collector {
                store: AggregateStore::default(),
                processed: ProcessedIdSet::default(),
                save_every_n: DEFAULT_SAVE_EVERY_N,
                saving: false,
                idle_timer: ScheduledTask::default(),
                processed_flush: ScheduledTask::default(),
            })),
            storage,
            delivery,
            idle_timeout,
        }
    }

    pub async fn restore(&self) -> Result<(), StorageError> {
        let stored = self
            .storage
            .get(&[keys::LAST_SAVED_STATS, keys::PROCESSED_IDS])
            .await?;
        let settings = Settings::load(self.storage.as_ref()).await?;

        let mut collector = self.inner.lock().await;
        rehydrate(&mut collector.store, stored.get(keys::LAST_SAVED_STATS), Utc::now());
        if let Some(Value::Array(ids)) = stored.get(keys::PROCESSED_IDS) {
            let ids = ids.iter().filter_map(|id| id.as_str().map(str::to_string));
            collector.processed = ProcessedIdSet::from_ids(ids, PROCESSED_CAPACITY);
        }
        collector.save_every_n = settings.effective_save_every_n();

        info!(
            "restored post count {}, {} processed ids, saving every {}",
            collector.store.post_count,
            collector.processed.len(),
            collector.save_every_n
        );
        Ok(())
    }

    pub async fn accept_observation(&self, observation: PostObservation) -> AcceptOutcome {
        if observation.author_key.trim().is_empty() {
            return AcceptOutcome::Rejected;
        }

        let (post_count, threshold_reached) = {
            let mut collector = self.inner.lock().await;

            if let Some(id) = observation.post_id.as_deref().filter(|id| !id.is_empty()) {
                if !collector.processed.insert(id.to_string()) {
                    return AcceptOutcome::Duplicate;
                }
                let this = self.clone();
                collector
                    .processed_flush
                    .arm(PROCESSED_FLUSH_DELAY, async move { this.flush_processed_ids().await });
            }

            collector.idle_timer.cancel();
            collector.store.update(&observation, Utc::now());

            let post_count = collector.store.post_count;
            let threshold_reached = post_count % collector.save_every_n.max(1) == 0;
            if !threshold_reached {
                let this = self.clone();
                collector
                    .idle_timer
                    .arm(self.idle_timeout, async move { this.on_idle().await });
            }
            (post_count, threshold_reached)
        };

        let save = if threshold_reached {
            Some(self.trigger(SaveReason::Threshold).await)
        } else {
            None
        };
        AcceptOutcome::Accepted { post_count, save }
    }

    pub async fn force_save(&self) -> SaveOutcome {
        self.trigger(SaveReason::Manual).await
    }

    pub async fn flush_on_unload(&self) -> Option<SaveOutcome> {
        let pending = self.inner.lock().await.store.post_count > 0;
        let outcome = if pending {
            Some(self.trigger(SaveReason::Unload).await)
        } else {
            None
        };

        self.inner.lock().await.processed_flush.cancel();
        if let Err(err) = self.persist_processed_ids().await {
            warn!("failed to persist processed ids on unload: {err}");
        }
        outcome
    }

    pub async fn trigger(&self, reason: SaveReason) -> SaveOutcome {
        let this = self.clone();
        match tokio::spawn(async move { this.run_trigger(reason).await }).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("save task for {} did not finish: {err}", reason.as_str());
                SaveOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn run_trigger(&self, reason: SaveReason) -> SaveOutcome {
        {
            let mut collector = self.inner.lock().await;
            if collector.saving {
                debug!("dropping {} trigger, save already in flight", reason.as_str());
                return SaveOutcome::InFlight;
            }
            collector.idle_timer.cancel();
            if collector.store.post_count == 0 {
                return SaveOutcome::Empty;
            }
            collector.saving = true;
        }

        let outcome = match self.save_cycle(reason).await {
            Ok(outcome) => outcome,
            Err(failure) => self.record_failure(reason, failure).await,
        };

        self.inner.lock().await.saving = false;
        outcome
    }

    async fn save_cycle(&self, reason: SaveReason) -> Result<SaveOutcome, SaveFailure> {
        let storage = self.storage.as_ref();

        let settings = Settings::load(storage).await.map_err(at("loadSettings"))?;
        if !settings.enabled {
            debug!("data collection disabled, skipping {} save", reason.as_str());
            return Ok(SaveOutcome::Disabled);
        }

        let now = Utc::now();
        let (rendered, snapshot) = {
            let collector = self.inner.lock().await;
            (
                csv::render(&collector.store, now),
                StatsSnapshot::capture(&collector.store, now),
            )
        };

        let previous = get_value(storage, keys::ACCUMULATED_CSV)
            .await
            .map_err(at("readAccumulated"))?
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        let merged = reconcile(&previous, &rendered, &settings.meta(timestamp(now)));
        let hash = format!("{:x}", Sha256::digest(merged.as_bytes()));
        let rows = split_header_and_rows(&merged).rows.len();
        let bytes = merged.len();

        storage
            .set(entries([
                (keys::PENDING_SAVE_DATA, Value::String(merged.clone())),
                (keys::PENDING_SAVE_HASH, Value::String(hash.clone())),
            ]))
            .await
            .map_err(at("writePending"))?;

        let file = DeliveredFile {
            relative_path: EXPORT_FILE.to_string(),
            contents: merged,
            hash: hash.clone(),
        };
        self.delivery.deliver(&file).await.map_err(at("deliver"))?;

        let snapshot = serde_json::to_value(&snapshot)
            .map_err(StorageError::from)
            .map_err(at("snapshot"))?;
        storage
            .set(entries([
                (keys::ACCUMULATED_CSV, Value::String(file.contents)),
                (keys::ACCUMULATED_CSV_HASH, Value::String(hash.clone())),
                (keys::LAST_SAVED_STATS, snapshot),
            ]))
            .await
            .map_err(at("persistAccumulated"))?;
        storage
            .remove(&[keys::PENDING_SAVE_DATA, keys::PENDING_SAVE_HASH])
            .await
            .map_err(at("clearPending"))?;

        info!("{} save wrote {rows} rows ({bytes} bytes), sha256 {hash}", reason.as_str());
        Ok(SaveOutcome::Saved { hash, rows, bytes })
    }

    async fn record_failure(&self, reason: SaveReason, failure: SaveFailure) -> SaveOutcome {
        let message = failure.error.to_string();
        error!("{} save failed at {}: {message}", reason.as_str(), failure.step);

        let record = SaveErrorRecord {
            source: reason.as_str().to_string(),
            step: failure.step.to_string(),
            message: message.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(err) = self.storage.set(entries([(keys::LAST_SAVE_ERROR, value)])).await {
                    warn!("failed to record save error: {err}");
                }
            }
            Err(err) => warn!("failed to encode save error: {err}"),
        }

        SaveOutcome::Failed { message }
    }

    async fn on_idle(&self) {
        self.inner.lock().await.idle_timer.release();
        let outcome = self.trigger(SaveReason::IdleTimeout).await;
        debug!("idle save finished: {outcome:?}");
    }

    async fn flush_processed_ids(&self) {
        self.inner.lock().await.processed_flush.release();
        if let Err(err) = self.persist_processed_ids().await {
            warn!("failed to persist processed ids: {err}");
        }
    }

    pub async fn persist_processed_ids(&self) -> Result<(), StorageError> {
        let ids = self.inner.lock().await.processed.to_vec();
        self.storage
            .set(entries([(keys::PROCESSED_IDS, Value::from(ids))]))
            .await
    }

    pub async fn clear_processed(&self) -> Result<usize, StorageError> {
        let cleared = {
            let mut collector = self.inner.lock().await;
            collector.processed_flush.cancel();
            let cleared = collector.processed.len();
            collector.processed.clear();
            cleared
        };
        self.storage
            .set(entries([(keys::PROCESSED_IDS, Value::Array(Vec::new()))]))
            .await?;
        info!("cleared {cleared} processed ids");
        Ok(cleared)
    }

    pub async fn apply_settings(&self, settings: &Settings) {
        let save_every_n = settings.effective_save_every_n();
        let mut collector = self.inner.lock().await;
        if collector.save_every_n != save_every_n {
            info!("saving every {save_every_n} posts");
            collector.save_every_n = save_every_n;
        }
    }

    async fn reload_settings(&self) {
        match Settings::load(self.storage.as_ref()).await {
            Ok(settings) => self.apply_settings(&settings).await,
            Err(err) => warn!("failed to reload settings: {err}"),
        }
    }

    pub fn spawn_settings_watcher(&self) -> JoinHandle<()> {
        let mut changes = self.storage.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.touches(keys::SAVE_EVERY_N) => this.reload_settings().await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("settings watcher skipped {skipped} changes");
                        this.reload_settings().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn stats(&self) -> StatsResponse {
        let collector = self.inner.lock().await;
        StatsResponse {
            post_count: collector.store.post_count,
            authors: collector.store.users.len(),
            processed_ids: collector.processed.len(),
            phase: collector.phase().as_str().to_string(),
            save_every_n: collector.save_every_n,
        }
    }
}
