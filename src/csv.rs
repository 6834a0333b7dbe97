use crate::models::{AggregateStore, CategoryBucket, LengthBucket, MediaBucket};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;
use std::mem::take;

pub const HEADER: &str = "Type,Name,Count,Average Score,Total Views, Avg Views, Min Views, Max Views, Total Comments, Avg Comments, Last Seen";

/* ---------------- Rendering ---------------- */

pub fn render(store: &AggregateStore, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(128 * (store.users.len() + 8));
    out.push_str(HEADER);
    out.push('\n');

    for (author, user) in &store.users {
        if user.count < 1 {
            continue;
        }
        let _ = writeln!(
            out,
            "User,{},{},{:.3},{},{:.1},{},{},{},{:.1},{}",
            quote_field(author),
            user.count,
            fixed(user.avg_score(), 3),
            user.total_views,
            fixed(user.view_running_avg, 1),
            user.min_views,
            user.max_views,
            user.total_comments,
            fixed(user.comment_running_avg, 1),
            timestamp(user.last_seen),
        );
    }

    for bucket in LengthBucket::ALL {
        push_category_row(&mut out, "Length", bucket.key(), store.length_bucket(bucket));
    }
    for bucket in MediaBucket::ALL {
        push_category_row(&mut out, "Media", bucket.key(), store.media_bucket(bucket));
    }

    if store.post_count > 0 {
        let engagement = &store.engagement;
        let posts = store.post_count as f64;
        let _ = writeln!(
            out,
            "Engagement,Overall,{},{:.6},{},{:.3},{:.6},{:.6},{},{:.3},{}",
            store.post_count,
            fixed(engagement.avg_engagement_ratio, 6),
            engagement.total_views,
            fixed(engagement.total_likes as f64 / posts, 3),
            fixed(finite_or_zero(engagement.min_engagement_ratio), 6),
            fixed(finite_or_zero(engagement.max_engagement_ratio), 6),
            engagement.total_comments,
            fixed(engagement.total_comments as f64 / posts, 3),
            timestamp(now),
        );
    }

    out
}

fn push_category_row(out: &mut String, kind: &str, name: &str, bucket: &CategoryBucket) {
    if bucket.count == 0 {
        return;
    }
    let _ = writeln!(
        out,
        "{kind},{name},{},{:.3},{},{:.1},N/A,N/A,{},{:.1},N/A",
        bucket.count,
        fixed(bucket.avg_score(), 3),
        bucket.total_views,
        fixed(bucket.avg_views, 1),
        bucket.total_comments,
        fixed(bucket.avg_comments, 1),
    );
}

// `2026-01-05T10:00:00.000Z`
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

// Exact halves round away from zero.
fn fixed(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/* ---------------- Fields ---------------- */

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

pub fn quote_field(field: &str) -> String {
    if needs_quotes(field) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn split_records(text: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (idx, ch) in text.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '\n' if !in_quotes => {
                let record = &text[start..idx];
                records.push(record.strip_suffix('\r').unwrap_or(record));
                start = idx + 1;
            }
            _ => {}
        }
    }

    if start < text.len() {
        records.push(&text[start..]);
    }
    records
}

pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => fields.push(take(&mut field)),
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || line.ends_with(',') {
        fields.push(field);
    }

    fields.into_iter().map(|f| f.trim().to_string()).collect()
}
