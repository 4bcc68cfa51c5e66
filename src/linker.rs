//! Attaches orphaned media files to the messages that mention them.
//!
//! Matching is a fixed first-match rule over four textual heuristics, tried
//! strongest first. Within a heuristic the most recently sent candidate wins.
//! Files nothing refers to stay unlinked; that is a normal outcome.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::OnceLock,
};

use chrono::{NaiveDateTime, Utc};
use diesel::{pg::PgConnection, prelude::*};
use percent_encoding::percent_decode_str;
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncResult},
    merge::{register_media_file, MediaRegistration},
    models::MediaFile,
    schema::{media_files, messages},
    state::EngineState,
    storage::StorageBackend,
};

/// Stems shorter than this match too much ordinary text.
pub const MIN_STEM_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Heuristic {
    ExactName,
    Stem,
    PercentDecoded,
    UuidPattern,
}

impl Heuristic {
    pub const ORDER: [Heuristic; 4] = [
        Heuristic::ExactName,
        Heuristic::Stem,
        Heuristic::PercentDecoded,
        Heuristic::UuidPattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Heuristic::ExactName => "exact_name",
            Heuristic::Stem => "stem",
            Heuristic::PercentDecoded => "percent_decoded",
            Heuristic::UuidPattern => "uuid_pattern",
        }
    }
}

/// A message that might have produced an orphan.
#[derive(Debug, Clone, Queryable)]
pub struct Candidate {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sent_at: NaiveDateTime,
    pub content: String,
    pub attachment_name: Option<String>,
}

impl Candidate {
    fn haystack(&self) -> String {
        match &self.attachment_name {
            Some(name) => format!("{}\n{}", self.content, name),
            None => self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked {
        message_id: Uuid,
        conversation_id: Uuid,
        heuristic: Heuristic,
    },
    Unlinked,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkReport {
    pub examined: usize,
    pub linked: usize,
    pub unlinked: usize,
}

fn uuid_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok()
        })
        .as_ref()
}

fn file_stem(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name)
}

/// Whether `text` refers to `file_name` under one heuristic.
pub fn references(heuristic: Heuristic, text: &str, file_name: &str) -> bool {
    let file_name = file_name.trim();
    if file_name.is_empty() {
        return false;
    }
    match heuristic {
        Heuristic::ExactName => text.contains(file_name),
        Heuristic::Stem => {
            let stem = file_stem(file_name);
            stem.chars().count() >= MIN_STEM_LEN && text.contains(stem)
        }
        Heuristic::PercentDecoded => {
            let decoded_text = percent_decode_str(text).decode_utf8_lossy();
            let decoded_name = percent_decode_str(file_name).decode_utf8_lossy();
            if decoded_text == text && decoded_name == file_name {
                // Nothing was encoded; the plain heuristics already decided.
                return false;
            }
            let stem = file_stem(&decoded_name);
            decoded_text.contains(decoded_name.as_ref())
                || (stem.chars().count() >= MIN_STEM_LEN && decoded_text.contains(stem))
        }
        Heuristic::UuidPattern => {
            let Some(pattern) = uuid_pattern() else {
                return false;
            };
            let text = text.to_ascii_lowercase();
            pattern
                .find_iter(file_name)
                .any(|found| text.contains(&found.as_str().to_ascii_lowercase()))
        }
    }
}

/// Picks the message an orphan belongs to. `candidates` must be newest first.
pub fn find_match<'a>(
    file_name: &str,
    candidates: &'a [Candidate],
) -> Option<(&'a Candidate, Heuristic)> {
    let haystacks: Vec<String> = candidates.iter().map(Candidate::haystack).collect();
    Heuristic::ORDER.into_iter().find_map(|heuristic| {
        candidates
            .iter()
            .zip(&haystacks)
            .find(|(_, text)| references(heuristic, text, file_name))
            .map(|(candidate, _)| (candidate, heuristic))
    })
}

/// Media-flagged messages plus the `recent_window` newest, newest first.
pub fn load_candidates(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    recent_window: i64,
) -> SyncResult<Vec<Candidate>> {
    let columns = (
        messages::id,
        messages::conversation_id,
        messages::sent_at,
        messages::content,
        messages::attachment_name,
    );

    let mut candidates: Vec<Candidate> = messages::table
        .filter(messages::tenant_id.eq(tenant_id))
        .filter(messages::has_media.eq(true))
        .select(columns)
        .load(conn)?;

    if recent_window > 0 {
        let recent: Vec<Candidate> = messages::table
            .filter(messages::tenant_id.eq(tenant_id))
            .order((messages::sent_at.desc(), messages::id.desc()))
            .limit(recent_window)
            .select(columns)
            .load(conn)?;
        let seen: HashSet<Uuid> = candidates.iter().map(|c| c.id).collect();
        candidates.extend(recent.into_iter().filter(|c| !seen.contains(&c.id)));
    }

    candidates.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then_with(|| b.id.cmp(&a.id)));
    Ok(candidates)
}

pub fn load_orphans(conn: &mut PgConnection, tenant_id: Uuid) -> SyncResult<Vec<MediaFile>> {
    let orphans = media_files::table
        .filter(media_files::tenant_id.eq(tenant_id))
        .filter(media_files::message_id.is_null())
        .order(media_files::created_at.asc())
        .load(conn)?;
    Ok(orphans)
}

/// Sets the owning message on one orphan. A file linked in the meantime is left alone.
fn link(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    media_id: Uuid,
    candidate: &Candidate,
) -> SyncResult<bool> {
    let updated = diesel::update(
        media_files::table
            .filter(media_files::id.eq(media_id))
            .filter(media_files::tenant_id.eq(tenant_id))
            .filter(media_files::message_id.is_null()),
    )
    .set((
        media_files::message_id.eq(Some(candidate.id)),
        media_files::conversation_id.eq(Some(candidate.conversation_id)),
        media_files::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

pub fn link_orphan(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    orphan: &MediaFile,
    candidates: &[Candidate],
) -> SyncResult<LinkOutcome> {
    let Some((candidate, heuristic)) = find_match(&orphan.file_name, candidates) else {
        return Ok(LinkOutcome::Unlinked);
    };
    if !link(conn, tenant_id, orphan.id, candidate)? {
        return Ok(LinkOutcome::Unlinked);
    }
    debug!(
        media_id = %orphan.id,
        message_id = %candidate.id,
        heuristic = heuristic.as_str(),
        "linked orphan media"
    );
    Ok(LinkOutcome::Linked {
        message_id: candidate.id,
        conversation_id: candidate.conversation_id,
        heuristic,
    })
}

pub fn link_orphans(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    recent_window: i64,
) -> SyncResult<LinkReport> {
    let orphans = load_orphans(conn, tenant_id)?;
    if orphans.is_empty() {
        return Ok(LinkReport::default());
    }
    let candidates = load_candidates(conn, tenant_id, recent_window)?;

    let mut report = LinkReport::default();
    for orphan in &orphans {
        report.examined += 1;
        match link_orphan(conn, tenant_id, orphan, &candidates)? {
            LinkOutcome::Linked { .. } => report.linked += 1,
            LinkOutcome::Unlinked => report.unlinked += 1,
        }
    }

    info!(
        tenant_id = %tenant_id,
        examined = report.examined,
        linked = report.linked,
        unlinked = report.unlinked,
        "media link pass finished"
    );
    Ok(report)
}

/// Storage prefix that holds a tenant's media.
pub fn tenant_media_prefix(tenant_id: Uuid) -> String {
    format!("tenants/{tenant_id}/media/")
}

/// Registers objects under the tenant's prefix that have no MediaFile yet.
pub async fn discover_orphans(
    state: &EngineState,
    tenant_id: Uuid,
    backend: StorageBackend,
) -> SyncResult<usize> {
    let storage = state.storage.get(backend).map_err(SyncError::Storage)?;
    let prefix = tenant_media_prefix(tenant_id);
    let objects = storage
        .list_objects(&prefix)
        .await
        .map_err(SyncError::Storage)?;
    if objects.is_empty() {
        return Ok(0);
    }

    state
        .with_db(move |conn| {
            let keys: Vec<String> = objects.iter().map(|o| o.key.clone()).collect();
            let known: HashSet<String> = media_files::table
                .filter(media_files::storage_backend.eq(backend.as_str()))
                .filter(media_files::storage_path.eq_any(&keys))
                .select(media_files::storage_path)
                .load::<String>(conn)?
                .into_iter()
                .collect();

            let mut registered = 0;
            for object in objects.iter().filter(|o| !known.contains(&o.key)) {
                let file_name = object
                    .key
                    .rsplit('/')
                    .next()
                    .unwrap_or(object.key.as_str())
                    .to_string();
                let mime_type = mime_guess::from_path(&file_name)
                    .first()
                    .map(|mime| mime.essence_str().to_string());
                let (_, created) = register_media_file(
                    conn,
                    tenant_id,
                    &MediaRegistration {
                        file_name,
                        storage_backend: backend.as_str().to_string(),
                        storage_path: object.key.clone(),
                        mime_type,
                        file_size: object.size,
                        message_external_id: None,
                    },
                )?;
                if created {
                    registered += 1;
                }
            }

            if registered > 0 {
                info!(tenant_id = %tenant_id, backend = %backend, registered, "registered orphan media");
            }
            Ok(registered)
        })
        .await
}

/// Orphan counts per tenant, for operator output.
pub fn orphan_counts(conn: &mut PgConnection) -> SyncResult<HashMap<Uuid, i64>> {
    let rows: Vec<(Uuid, i64)> = media_files::table
        .filter(media_files::message_id.is_null())
        .group_by(media_files::tenant_id)
        .select((media_files::tenant_id, diesel::dsl::count_star()))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn candidate(minute: u32, content: &str) -> Candidate {
        Candidate {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sent_at: NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(12, minute, 0)
                .unwrap(),
            content: content.to_string(),
            attachment_name: None,
        }
    }

    #[test]
    fn exact_file_name_links() {
        let candidates = vec![candidate(5, "IMG_20240115_123456.jpg")];
        let (found, heuristic) = find_match("IMG_20240115_123456.jpg", &candidates).unwrap();
        assert_eq!(found.id, candidates[0].id);
        assert_eq!(heuristic, Heuristic::ExactName);
    }

    #[test]
    fn unreferenced_file_stays_unlinked() {
        let candidates = vec![
            candidate(1, "see the quarterly numbers"),
            candidate(2, "IMG_20240115_123456.jpg"),
        ];
        assert!(find_match("report.pdf", &candidates).is_none());
    }

    #[test]
    fn stem_needs_six_characters() {
        assert!(references(Heuristic::Stem, "sent voicemail earlier", "voicemail.wav"));
        assert!(!references(Heuristic::Stem, "the scan is attached", "scan.png"));
    }

    #[test]
    fn percent_encoded_reference_matches() {
        let text = "https://files.example/u/Site%20Photo%202024.jpg";
        assert!(!references(Heuristic::ExactName, text, "Site Photo 2024.jpg"));
        assert!(references(Heuristic::PercentDecoded, text, "Site Photo 2024.jpg"));
    }

    #[test]
    fn uuid_in_file_name_matches_case_insensitively() {
        let name = "3F2504E0-4F89-11D3-9A0C-0305E82C3301_upload.bin";
        let text = "attachment 3f2504e0-4f89-11d3-9a0c-0305e82c3301 received";
        assert!(references(Heuristic::UuidPattern, text, name));
        assert!(!references(Heuristic::UuidPattern, "no id here", name));
    }

    #[test]
    fn newest_candidate_wins_a_tie() {
        // Newest first, as load_candidates returns them.
        let candidates = vec![
            candidate(30, "VID_20240110_0930.mp4"),
            candidate(10, "VID_20240110_0930.mp4"),
        ];
        let (found, _) = find_match("VID_20240110_0930.mp4", &candidates).unwrap();
        assert_eq!(found.id, candidates[0].id);
    }

    #[test]
    fn stronger_heuristic_beats_recency() {
        let candidates = vec![
            candidate(30, "about IMG_20240115_123456 earlier"),
            candidate(10, "IMG_20240115_123456.jpg"),
        ];
        let (found, heuristic) = find_match("IMG_20240115_123456.jpg", &candidates).unwrap();
        assert_eq!(found.id, candidates[1].id);
        assert_eq!(heuristic, Heuristic::ExactName);
    }

    #[test]
    fn attachment_name_counts_as_a_reference() {
        let mut with_attachment = candidate(3, "");
        with_attachment.attachment_name = Some("contract_final.pdf".into());
        let candidates = [with_attachment.clone()];
        let (found, _) = find_match("contract_final.pdf", &candidates).unwrap();
        assert_eq!(found.id, with_attachment.id);
    }
}
