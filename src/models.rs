use crate::count::{count_from_label, parse_count};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use indexmap::IndexMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostObservation {
    #[serde(default)]
    pub post_id: Option<String>,
    pub author_key: String,
    #[serde(default)]
    pub engagement_score: f64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub likes: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub views: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub comments: Option<u64>,
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub has_image: bool,
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n.round() as u64)
        }),
        Some(Value::String(text)) => parse_count(&text).or_else(|| count_from_label(&text)),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAggregate {
    pub count: u64,
    pub total_score: f64,
    pub last_seen: DateTime<Utc>,
    pub total_views: u64,
    pub view_running_avg: f64,
    // Zero doubles as "no minimum seen yet".
    pub min_views: u64,
    pub max_views: u64,
    pub total_comments: u64,
    pub comment_running_avg: f64,
}

impl UserAggregate {
    pub fn new(first_views: Option<u64>, now: DateTime<Utc>) -> Self {
        let seed = first_views.unwrap_or(0);
        Self {
            count: 0,
            total_score: 0.0,
            last_seen: now,
            total_views: 0,
            view_running_avg: 0.0,
            min_views: seed,
            max_views: seed,
            total_comments: 0,
            comment_running_avg: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryBucket {
    pub count: u64,
    pub total_score: f64,
    pub total_views: u64,
    pub avg_views: f64,
    pub total_comments: u64,
    pub avg_comments: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngagementTotals {
    pub total_likes: u64,
    pub total_views: u64,
    pub total_comments: u64,
    pub avg_engagement_ratio: f64,
    pub min_engagement_ratio: f64,
    pub max_engagement_ratio: f64,
}

impl Default for EngagementTotals {
    fn default() -> Self {
        Self {
            total_likes: 0,
            total_views: 0,
            total_comments: 0,
            avg_engagement_ratio: 0.0,
            min_engagement_ratio: f64::INFINITY,
            max_engagement_ratio: f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LengthBucket {
    Short,
    Mid,
    Long,
    Extended,
}

impl LengthBucket {
    pub const ALL: [LengthBucket; 4] = [Self::Short, Self::Mid, Self::Long, Self::Extended];

    pub fn classify(text_length: usize) -> Self {
        match text_length {
            0..=70 => Self::Short,
            71..=140 => Self::Mid,
            141..=280 => Self::Long,
            _ => Self::Extended,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Mid => "mid",
            Self::Long => "long",
            Self::Extended => "extended",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bucket| bucket.key() == key)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaBucket {
    WithImage,
    WithoutImage,
}

impl MediaBucket {
    pub const ALL: [MediaBucket; 2] = [Self::WithImage, Self::WithoutImage];

    pub fn classify(has_image: bool) -> Self {
        if has_image { Self::WithImage } else { Self::WithoutImage }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::WithImage => "withImage",
            Self::WithoutImage => "withoutImage",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bucket| bucket.key() == key)
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStore {
    pub users: IndexMap<String, UserAggregate>,
    pub length: [CategoryBucket; 4],
    pub media: [CategoryBucket; 2],
    pub engagement: EngagementTotals,
    pub post_count: u64,
}

impl AggregateStore {
    pub fn length_bucket(&self, bucket: LengthBucket) -> &CategoryBucket {
        &self.length[bucket.index()]
    }

    pub fn length_bucket_mut(&mut self, bucket: LengthBucket) -> &mut CategoryBucket {
        &mut self.length[bucket.index()]
    }

    pub fn media_bucket(&self, bucket: MediaBucket) -> &CategoryBucket {
        &self.media[bucket.index()]
    }

    pub fn media_bucket_mut(&mut self, bucket: MediaBucket) -> &mut CategoryBucket {
        &mut self.media[bucket.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveErrorRecord {
    pub source: String,
    pub step: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    pub status: String,
    pub post_count: u64,
    pub save: Option<SaveResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub success: bool,
    pub status: String,
    pub error: Option<String>,
    pub hash: Option<String>,
    pub rows: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub post_count: u64,
    pub authors: usize,
    pub processed_ids: usize,
    pub phase: String,
    pub save_every_n: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedResponse {
    pub cleared: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_buckets_split_on_inclusive_limits() {
        assert_eq!(LengthBucket::classify(0), LengthBucket::Short);
        assert_eq!(LengthBucket::classify(70), LengthBucket::Short);
        assert_eq!(LengthBucket::classify(71), LengthBucket::Mid);
        assert_eq!(LengthBucket::classify(140), LengthBucket::Mid);
        assert_eq!(LengthBucket::classify(280), LengthBucket::Long);
        assert_eq!(LengthBucket::classify(281), LengthBucket::Extended);
    }

    #[test]
    fn observation_counts_accept_display_text() {
        let observation: PostObservation = serde_json::from_value(serde_json::json!({
            "postId": "123",
            "authorKey": "alice",
            "engagementScore": 0.5,
            "likes": "1.2K",
            "views": 4000,
            "comments": "3 replies",
            "textLength": 12,
            "hasImage": true
        }))
        .unwrap();

        assert_eq!(observation.likes, Some(1200));
        assert_eq!(observation.views, Some(4000));
        assert_eq!(observation.comments, Some(3));
    }

    #[test]
    fn observation_unparseable_counts_are_absent() {
        let observation: PostObservation = serde_json::from_value(serde_json::json!({
            "authorKey": "bob",
            "likes": "lots",
            "views": null
        }))
        .unwrap();

        assert_eq!(observation.likes, None);
        assert_eq!(observation.views, None);
        assert_eq!(observation.comments, None);
        assert_eq!(observation.post_id, None);
    }
}
