use crate::csv::{split_fields, split_records, HEADER};
use serde::Serialize;
use std::collections::HashMap;

pub const SETTINGS_PREFIX: &str = "#PERMSTER_SETTINGS:";

const HEADER_COLUMNS: [&str; 5] = ["Type", "Name", "Count", "Average Score", "Total Views"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsMeta {
    pub saved_at: String,
    pub save_every_n: Option<u64>,
    pub filter_threshold: Option<f64>,
    pub show_zeros: bool,
    pub only_zeros: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCsv {
    pub header: String,
    pub rows: Vec<String>,
}

pub fn split_header_and_rows(text: &str) -> ParsedCsv {
    let lines = split_records(text);
    let Some(header_idx) = lines.iter().position(|line| is_header(line)) else {
        return ParsedCsv {
            header: HEADER.to_string(),
            rows: Vec::new(),
        };
    };

    let rows = lines[header_idx + 1..]
        .iter()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with(SETTINGS_PREFIX)
        })
        .map(|line| line.to_string())
        .collect();

    ParsedCsv {
        header: lines[header_idx].trim().to_string(),
        rows,
    }
}

fn is_header(line: &str) -> bool {
    let mut columns = line.trim().split(',');
    let last = HEADER_COLUMNS.len() - 1;
    HEADER_COLUMNS.iter().enumerate().all(|(idx, expected)| {
        let Some(column) = columns.next() else {
            return false;
        };
        let column = if idx == 0 { column } else { column.trim_start() };
        if idx == last {
            column
                .get(..expected.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(expected))
        } else {
            column.eq_ignore_ascii_case(expected)
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowGroup {
    User,
    Length,
    Media,
    Other,
}

impl RowGroup {
    fn of(kind: &str) -> Self {
        match kind {
            "User" => Self::User,
            "Length" => Self::Length,
            "Media" => Self::Media,
            _ => Self::Other,
        }
    }
}

// Replacing a row keeps its first position.
#[derive(Default)]
struct RowSet {
    rows: Vec<(RowGroup, String)>,
    index: HashMap<(String, String), usize>,
}

impl RowSet {
    fn insert(&mut self, raw: &str) {
        let fields = split_fields(raw);
        let kind = fields.first().cloned().unwrap_or_default();
        let name = fields.get(1).cloned().unwrap_or_default();
        let group = RowGroup::of(&kind);

        match self.index.get(&(kind.clone(), name.clone())) {
            Some(&slot) => self.rows[slot] = (group, raw.to_string()),
            None => {
                self.index.insert((kind, name), self.rows.len());
                self.rows.push((group, raw.to_string()));
            }
        }
    }

    fn into_grouped(self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.rows.len());
        for group in [RowGroup::User, RowGroup::Length, RowGroup::Media, RowGroup::Other] {
            out.extend(
                self.rows
                    .iter()
                    .filter(|(row_group, _)| *row_group == group)
                    .map(|(_, raw)| raw.clone()),
            );
        }
        out
    }
}

pub fn reconcile(previous: &str, incoming: &str, meta: &SettingsMeta) -> String {
    let previous = split_header_and_rows(previous);
    let incoming = split_header_and_rows(incoming);

    let mut set = RowSet::default();
    for row in previous.rows.iter().chain(incoming.rows.iter()) {
        set.insert(row);
    }
    let rows = set.into_grouped();

    let meta_json = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}\n\n{}\n\n{SETTINGS_PREFIX}{meta_json}\n",
        previous.header,
        rows.join("\n")
    )
}
