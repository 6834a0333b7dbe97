use crate::models::{AggregateStore, CategoryBucket, EngagementTotals, LengthBucket, MediaBucket, UserAggregate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    pub users: Vec<UserSnapshot>,
    pub categories: CategorySnapshot,
    pub engagement: Option<EngagementSnapshot>,
    pub post_count: u64,
    pub last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSnapshot {
    pub author: String,
    pub count: u64,
    pub total_score: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorySnapshot {
    pub length: BTreeMap<String, CategoryBucket>,
    pub media: BTreeMap<String, CategoryBucket>,
}

// Ratio bounds are `None` while unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngagementSnapshot {
    pub total_likes: u64,
    pub total_views: u64,
    pub total_comments: u64,
    pub avg_engagement_ratio: f64,
    pub min_engagement_ratio: Option<f64>,
    pub max_engagement_ratio: Option<f64>,
}

impl StatsSnapshot {
    pub fn capture(store: &AggregateStore, now: DateTime<Utc>) -> Self {
        let users = store
            .users
            .iter()
            .map(|(author, user)| UserSnapshot {
                author: author.clone(),
                count: user.count,
                total_score: user.total_score,
                last_seen: Some(user.last_seen),
            })
            .collect();

        let categories = CategorySnapshot {
            length: LengthBucket::ALL
                .into_iter()
                .map(|bucket| (bucket.key().to_string(), store.length_bucket(bucket).clone()))
                .collect(),
            media: MediaBucket::ALL
                .into_iter()
                .map(|bucket| (bucket.key().to_string(), store.media_bucket(bucket).clone()))
                .collect(),
        };

        let engagement = &store.engagement;
        Self {
            users,
            categories,
            engagement: Some(EngagementSnapshot {
                total_likes: engagement.total_likes,
                total_views: engagement.total_views,
                total_comments: engagement.total_comments,
                avg_engagement_ratio: engagement.avg_engagement_ratio,
                min_engagement_ratio: Some(engagement.min_engagement_ratio).filter(|r| r.is_finite()),
                max_engagement_ratio: Some(engagement.max_engagement_ratio).filter(|r| r.is_finite()),
            }),
            post_count: store.post_count,
            last_saved: Some(now),
        }
    }

    pub fn into_store(self, now: DateTime<Utc>) -> AggregateStore {
        let mut store = AggregateStore::default();

        for user in self.users {
            if user.author.is_empty() {
                continue;
            }
            let mut aggregate = UserAggregate::new(None, user.last_seen.unwrap_or(now));
            aggregate.count = user.count;
            aggregate.total_score = user.total_score;
            store.users.insert(user.author, aggregate);
        }

        for (key, bucket) in self.categories.length {
            if let Some(slot) = LengthBucket::from_key(&key) {
                *store.length_bucket_mut(slot) = bucket;
            }
        }
        for (key, bucket) in self.categories.media {
            if let Some(slot) = MediaBucket::from_key(&key) {
                *store.media_bucket_mut(slot) = bucket;
            }
        }

        if let Some(engagement) = self.engagement {
            store.engagement = EngagementTotals {
                total_likes: engagement.total_likes,
                total_views: engagement.total_views,
                total_comments: engagement.total_comments,
                avg_engagement_ratio: engagement.avg_engagement_ratio,
                min_engagement_ratio: engagement.min_engagement_ratio.unwrap_or(f64::INFINITY),
                max_engagement_ratio: engagement.max_engagement_ratio.unwrap_or(f64::NEG_INFINITY),
            };
        }

        store.post_count = self.post_count;
        store
    }
}

pub fn rehydrate(store: &mut AggregateStore, raw: Option<&Value>, now: DateTime<Utc>) -> bool {
    let Some(raw) = raw.filter(|value| !value.is_null()) else {
        return false;
    };

    match serde_json::from_value::<StatsSnapshot>(raw.clone()) {
        Ok(snapshot) => {
            let loaded = snapshot.into_store(now);
            info!(
                "rehydrated {} authors, post count {}",
                loaded.users.len(),
                loaded.post_count
            );
            store.merge(loaded);
            true
        }
        Err(err) => {
            warn!("failed to parse stored snapshot: {err}");
            false
        }
    }
}
