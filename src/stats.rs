use crate::models::{
    AggregateStore, CategoryBucket, EngagementTotals, LengthBucket, MediaBucket,
    PostObservation, UserAggregate,
};
use chrono::{DateTime, Utc};

impl AggregateStore {
    pub fn update(&mut self, observation: &PostObservation, now: DateTime<Utc>) {
        let score = finite_or_zero(observation.engagement_score);

        let user = self
            .users
            .entry(observation.author_key.clone())
            .or_insert_with(|| UserAggregate::new(observation.views, now));
        user.record(score, observation.views, observation.comments, now);

        self.length_bucket_mut(LengthBucket::classify(observation.text_length))
            .record(score, observation.views, observation.comments);
        self.media_bucket_mut(MediaBucket::classify(observation.has_image))
            .record(score, observation.views, observation.comments);

        self.engagement
            .record(observation.likes, observation.views, observation.comments);

        self.post_count = self.post_count.saturating_add(1);
    }

    // Post count is a high-water mark, everything else is summed.
    pub fn merge(&mut self, loaded: AggregateStore) {
        for (author, incoming) in loaded.users {
            match self.users.get_mut(&author) {
                Some(existing) => existing.merge(&incoming),
                None => {
                    self.users.insert(author, incoming);
                }
            }
        }

        for (bucket, incoming) in self.length.iter_mut().zip(loaded.length.iter()) {
            bucket.merge(incoming);
        }
        for (bucket, incoming) in self.media.iter_mut().zip(loaded.media.iter()) {
            bucket.merge(incoming);
        }

        self.engagement.merge(&loaded.engagement);
        self.post_count = self.post_count.max(loaded.post_count);
    }
}

impl UserAggregate {
    pub fn avg_score(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.total_score / self.count as f64 }
    }

    fn record(&mut self, score: f64, views: Option<u64>, comments: Option<u64>, now: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.total_score += score;
        self.last_seen = self.last_seen.max(now);

        if let Some(views) = views {
            self.total_views = self.total_views.saturating_add(views);
            if self.min_views == 0 || views < self.min_views {
                self.min_views = views;
            }
            self.max_views = self.max_views.max(views);
        }
        if let Some(comments) = comments {
            self.total_comments = self.total_comments.saturating_add(comments);
        }

        self.refresh_averages();
    }

    fn merge(&mut self, other: &UserAggregate) {
        self.count = self.count.saturating_add(other.count);
        self.total_score += other.total_score;
        self.total_views = self.total_views.saturating_add(other.total_views);
        self.total_comments = self.total_comments.saturating_add(other.total_comments);
        self.min_views = self.min_views.min(other.min_views);
        self.max_views = self.max_views.max(other.max_views);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.refresh_averages();
    }

    fn refresh_averages(&mut self) {
        self.view_running_avg = average(self.total_views, self.count);
        self.comment_running_avg = average(self.total_comments, self.count);
    }
}

impl CategoryBucket {
    fn record(&mut self, score: f64, views: Option<u64>, comments: Option<u64>) {
        self.count = self.count.saturating_add(1);
        self.total_score += score;
        if let Some(views) = views {
            self.total_views = self.total_views.saturating_add(views);
        }
        if let Some(comments) = comments {
            self.total_comments = self.total_comments.saturating_add(comments);
        }
        self.refresh_averages();
    }

    fn merge(&mut self, other: &CategoryBucket) {
        self.count = self.count.saturating_add(other.count);
        self.total_score += other.total_score;
        self.total_views = self.total_views.saturating_add(other.total_views);
        self.total_comments = self.total_comments.saturating_add(other.total_comments);
        self.refresh_averages();
    }

    pub fn avg_score(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.total_score / self.count as f64 }
    }

    fn refresh_averages(&mut self) {
        self.avg_views = average(self.total_views, self.count);
        self.avg_comments = average(self.total_comments, self.count);
    }
}

impl EngagementTotals {
    fn record(&mut self, likes: Option<u64>, views: Option<u64>, comments: Option<u64>) {
        if let Some(likes) = likes {
            self.total_likes = self.total_likes.saturating_add(likes);
        }
        if let Some(views) = views {
            self.total_views = self.total_views.saturating_add(views);
        }
        if let Some(comments) = comments {
            self.total_comments = self.total_comments.saturating_add(comments);
        }

        if let (Some(likes), Some(views)) = (likes, views) {
            if views > 0 {
                let ratio = likes as f64 / views as f64;
                self.min_engagement_ratio = self.min_engagement_ratio.min(ratio);
                self.max_engagement_ratio = self.max_engagement_ratio.max(ratio);
            }
        }
        self.refresh_average();
    }

    fn merge(&mut self, other: &EngagementTotals) {
        self.total_likes = self.total_likes.saturating_add(other.total_likes);
        self.total_views = self.total_views.saturating_add(other.total_views);
        self.total_comments = self.total_comments.saturating_add(other.total_comments);
        self.min_engagement_ratio = self.min_engagement_ratio.min(other.min_engagement_ratio);
        self.max_engagement_ratio = self.max_engagement_ratio.max(other.max_engagement_ratio);
        self.refresh_average();
    }

    pub fn has_ratio_sample(&self) -> bool {
        self.min_engagement_ratio.is_finite() && self.max_engagement_ratio.is_finite()
    }

    fn refresh_average(&mut self) {
        if self.total_views > 0 {
            self.avg_engagement_ratio = self.total_likes as f64 / self.total_views as f64;
        }
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { total as f64 / count as f64 }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn post(author: &str, likes: Option<u64>, views: Option<u64>, comments: Option<u64>) -> PostObservation {
        PostObservation {
            post_id: None,
            author_key: author.to_string(),
            engagement_score: 1.5,
            likes,
            views,
            comments,
            text_length: 100,
            has_image: false,
        }
    }

    fn assert_close(left: f64, right: f64) {
        assert!((left - right).abs() < 1e-9, "{left} != {right}");
    }

    #[test]
    fn running_averages_track_totals() {
        let mut store = AggregateStore::default();
        store.update(&post("alice", Some(10), Some(100), Some(2)), at(0));
        store.update(&post("alice", None, None, None), at(1));
        store.update(&post("alice", Some(5), Some(400), Some(7)), at(2));

        let alice = &store.users["alice"];
        assert_eq!(alice.count, 3);
        assert_eq!(alice.total_views, 500);
        assert_close(alice.view_running_avg, 500.0 / 3.0);
        assert_close(alice.comment_running_avg, 3.0);
        assert_eq!(alice.min_views, 100);
        assert_eq!(alice.max_views, 400);
        assert!(alice.min_views <= alice.max_views);
        assert_eq!(alice.last_seen, at(2));
        assert_close(alice.avg_score(), 1.5);

        let mid = store.length_bucket(LengthBucket::Mid);
        assert_eq!(mid.count, 3);
        assert_close(mid.avg_views, mid.total_views as f64 / 3.0);
        assert_eq!(store.media_bucket(MediaBucket::WithoutImage).count, 3);
        assert_eq!(store.media_bucket(MediaBucket::WithImage).count, 0);
        assert_eq!(store.post_count, 3);
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let mut store = AggregateStore::default();
        store.update(&post("alice", None, None, None), at(5));
        store.update(&post("alice", None, None, None), at(1));
        assert_eq!(store.users["alice"].last_seen, at(5));
    }

    #[test]
    fn zero_min_views_is_treated_as_unset() {
        let mut store = AggregateStore::default();
        store.update(&post("bob", None, Some(0), None), at(0));
        store.update(&post("bob", None, Some(50), None), at(1));
        let bob = &store.users["bob"];
        assert_eq!(bob.min_views, 50);
        assert_eq!(bob.max_views, 50);
    }

    #[test]
    fn engagement_ratio_bounds_need_a_sample() {
        let mut store = AggregateStore::default();
        store.update(&post("carol", Some(3), None, Some(1)), at(0));
        assert!(!store.engagement.has_ratio_sample());
        assert_eq!(store.engagement.total_likes, 3);

        store.update(&post("carol", Some(10), Some(100), None), at(1));
        store.update(&post("carol", Some(1), Some(50), None), at(2));
        assert!(store.engagement.has_ratio_sample());
        assert_close(store.engagement.min_engagement_ratio, 0.02);
        assert_close(store.engagement.max_engagement_ratio, 0.1);
        assert_close(store.engagement.avg_engagement_ratio, 14.0 / 150.0);
    }

    #[test]
    fn merge_sums_and_keeps_high_water_post_count() {
        let mut live = AggregateStore::default();
        live.update(&post("alice", Some(1), Some(100), Some(1)), at(0));

        let mut loaded = AggregateStore::default();
        loaded.update(&post("alice", Some(2), Some(300), Some(3)), at(3));
        loaded.update(&post("bob", Some(2), Some(10), None), at(1));
        loaded.update(&post("bob", None, None, None), at(2));

        live.merge(loaded);

        let alice = &live.users["alice"];
        assert_eq!(alice.count, 2);
        assert_eq!(alice.total_views, 400);
        assert_close(alice.view_running_avg, 200.0);
        assert_eq!(alice.min_views, 100);
        assert_eq!(alice.max_views, 300);
        assert_eq!(alice.last_seen, at(3));
        assert_eq!(live.users["bob"].count, 2);
        assert_eq!(live.post_count, 3);
        assert_eq!(live.length_bucket(LengthBucket::Mid).count, 4);
        assert_eq!(live.engagement.total_views, 410);
    }

    #[test]
    fn merge_is_associative_for_additive_fields() {
        let build = |seed: u64| {
            let mut store = AggregateStore::default();
            for i in 0..seed {
                let author = if i % 2 == 0 { "alice" } else { "bob" };
                let mut observation = post(author, Some(i), Some(10 * (i + seed)), Some(seed));
                observation.text_length = (i as usize) * 90;
                observation.has_image = i % 3 == 0;
                store.update(&observation, at(i as i64));
            }
            store
        };

        let mut left = build(3);
        let mut bc = build(4);
        bc.merge(build(5));
        left.merge(bc);

        let mut right = build(3);
        right.merge(build(4));
        right.merge(build(5));

        for author in ["alice", "bob"] {
            let (l, r) = (&left.users[author], &right.users[author]);
            assert_eq!(l.count, r.count);
            assert_eq!(l.total_views, r.total_views);
            assert_eq!(l.total_comments, r.total_comments);
            assert_close(l.total_score, r.total_score);
        }
        assert_eq!(left.length, right.length);
        assert_eq!(left.media, right.media);
        assert_eq!(left.engagement.total_likes, right.engagement.total_likes);
        assert_eq!(left.engagement.total_views, right.engagement.total_views);
        assert_eq!(left.post_count, right.post_count);
    }
}
