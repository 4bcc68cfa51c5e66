//! Merging the PBX's live tables with its historical views.
//!
//! Both sources are read with the same keyset cursor. Rows are tagged with
//! where they came from, and when the same natural key shows up in both the
//! historical copy wins: once the PBX archives a conversation the view is
//! authoritative.

use std::{cmp::Ordering, collections::HashMap, fmt, hash::Hash};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    Live,
    Historical,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Live => "live",
            SourceKind::Historical => "historical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live" => Some(SourceKind::Live),
            "historical" => Some(SourceKind::Historical),
            _ => None,
        }
    }

    /// Whether a row from `self` may replace one already stored from `stored`.
    pub fn may_replace(&self, stored: SourceKind) -> bool {
        *self >= stored
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sourced<T> {
    pub source: SourceKind,
    pub row: T,
}

pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

/// Rows that are extracted incrementally by `(timestamp, external id)`.
pub trait Paged {
    fn position(&self) -> CursorPosition;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub at: NaiveDateTime,
    pub id: String,
}

impl CursorPosition {
    pub fn new(at: NaiveDateTime, id: impl Into<String>) -> Self {
        Self { at, id: id.into() }
    }

    /// Sorts before every real row.
    pub fn origin() -> Self {
        Self {
            at: DateTime::<Utc>::UNIX_EPOCH.naive_utc(),
            id: String::new(),
        }
    }

    pub fn from_ledger(value: Option<&Value>) -> Self {
        value
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_else(Self::origin)
    }

    pub fn to_ledger(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Ord for CursorPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for CursorPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct Page<T> {
    pub rows: Vec<Sourced<T>>,
    /// Largest position delivered; `None` when the page is empty.
    pub next: Option<CursorPosition>,
    /// Neither source filled its page, so nothing newer is pending.
    pub exhausted: bool,
}

/// De-duplicates by natural key, preferring the historical copy.
pub fn reconcile<T: Keyed>(live: Vec<T>, historical: Vec<T>) -> Vec<Sourced<T>> {
    let mut order = Vec::with_capacity(live.len() + historical.len());
    let mut by_key: HashMap<T::Key, Sourced<T>> = HashMap::new();

    let tagged = live
        .into_iter()
        .map(|row| (SourceKind::Live, row))
        .chain(historical.into_iter().map(|row| (SourceKind::Historical, row)));

    for (source, row) in tagged {
        let key = row.key();
        let stored = by_key.get(&key).map(|existing| existing.source);
        match stored {
            Some(stored) if !source.may_replace(stored) => {}
            Some(_) => {
                by_key.insert(key, Sourced { source, row });
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, Sourced { source, row });
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Combines one keyset page from each source into a single ordered page.
///
/// Both inputs must be sorted by position and hold at most `limit` rows. If a
/// source returned a full page, rows beyond its last position might still be
/// pending in that source, so the other source's rows past that point are
/// held back for the next page. This keeps the cursor from skipping rows.
pub fn merge_pages<T>(live: Vec<T>, historical: Vec<T>, limit: usize) -> Page<T>
where
    T: Keyed + Paged,
{
    let live_full = limit > 0 && live.len() >= limit;
    let historical_full = limit > 0 && historical.len() >= limit;

    let cutoff = [
        live_full.then(|| live.last().map(Paged::position)).flatten(),
        historical_full
            .then(|| historical.last().map(Paged::position))
            .flatten(),
    ]
    .into_iter()
    .flatten()
    .min();

    let within = |row: &T| match &cutoff {
        Some(cutoff) => row.position() <= *cutoff,
        None => true,
    };
    let live: Vec<T> = live.into_iter().filter(|row| within(row)).collect();
    let historical: Vec<T> = historical.into_iter().filter(|row| within(row)).collect();

    let next = live
        .iter()
        .chain(historical.iter())
        .map(Paged::position)
        .max();

    let mut rows = reconcile(live, historical);
    rows.sort_by(|a, b| a.row.position().cmp(&b.row.position()));

    Page {
        rows,
        next,
        exhausted: !live_full && !historical_full,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::remote::rows::{RemoteConversation, RemoteParticipant};

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, minute, 0)
            .unwrap()
    }

    fn conversation(id: &str, name: &str, minute: u32) -> RemoteConversation {
        RemoteConversation {
            external_id: id.to_string(),
            chat_name: Some(name.to_string()),
            is_group: false,
            provider: None,
            updated_at: at(minute),
        }
    }

    #[test]
    fn historical_copy_wins_over_live() {
        let live = vec![conversation("7", "live name", 1), conversation("8", "only live", 2)];
        let historical = vec![conversation("7", "archived name", 5)];

        let rows = reconcile(live, historical);

        assert_eq!(rows.len(), 2);
        let seven = rows.iter().find(|r| r.row.external_id == "7").unwrap();
        assert_eq!(seven.source, SourceKind::Historical);
        assert_eq!(seven.row.chat_name.as_deref(), Some("archived name"));
        let eight = rows.iter().find(|r| r.row.external_id == "8").unwrap();
        assert_eq!(eight.source, SourceKind::Live);
    }

    #[test]
    fn participants_dedupe_on_conversation_and_key() {
        let participant = |conv: &str, key: &str, name: &str| RemoteParticipant {
            conversation_external_id: conv.into(),
            participant_key: key.into(),
            participant_name: Some(name.into()),
            extension_number: None,
            external_identity: None,
        };
        let rows = reconcile(
            vec![participant("1", "a", "Live"), participant("2", "a", "Other")],
            vec![participant("1", "a", "History")],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row.participant_name.as_deref(), Some("History"));
    }

    #[test]
    fn full_page_holds_back_rows_past_its_last_position() {
        let live = vec![conversation("1", "a", 1), conversation("2", "b", 2)];
        let historical = vec![conversation("3", "c", 3), conversation("4", "d", 4)];

        let page = merge_pages(live, historical.clone(), 2);

        // Live is full at minute 2, so minute 3+ from history waits.
        let ids: Vec<_> = page.rows.iter().map(|r| r.row.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(page.next, Some(CursorPosition::new(at(2), "2")));
        assert!(!page.exhausted);
    }

    #[test]
    fn short_pages_are_exhausted_and_sorted() {
        let live = vec![conversation("2", "b", 4)];
        let historical = vec![conversation("1", "a", 1), conversation("2", "b2", 6)];

        let page = merge_pages(live, historical, 10);

        assert!(page.exhausted);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].row.external_id, "1");
        assert_eq!(page.rows[1].row.chat_name.as_deref(), Some("b2"));
        assert_eq!(page.next, Some(CursorPosition::new(at(6), "2")));
    }

    #[test]
    fn cursor_orders_by_time_then_id() {
        let a = CursorPosition::new(at(1), "9");
        let b = CursorPosition::new(at(1), "10");
        let c = CursorPosition::new(at(2), "0");
        assert!(b < a, "same instant falls back to text order of the id");
        assert!(a < c);
        assert!(CursorPosition::origin() < b);
    }

    #[test]
    fn ledger_cursor_survives_json_and_defaults_to_origin() {
        let position = CursorPosition::new(at(3), "42");
        let stored = position.to_ledger();
        assert_eq!(CursorPosition::from_ledger(Some(&stored)), position);
        assert_eq!(CursorPosition::from_ledger(None), CursorPosition::origin());
        assert_eq!(
            CursorPosition::from_ledger(Some(&serde_json::json!({"bogus": true}))),
            CursorPosition::origin()
        );
    }
}
