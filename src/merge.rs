//! Upserts extracted PBX rows into the central store.
//!
//! Every function is scoped to one tenant and keyed by the PBX's own
//! identifiers, so replaying a batch converges on the same rows. Rows that
//! were merged from a historical view are never downgraded by a later live
//! copy.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{NaiveDateTime, Utc};
use diesel::{pg::PgConnection, prelude::*};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncResult},
    models::{
        Conversation, Extension, MediaFile, Message, NewConversation, NewExtension, NewMediaFile,
        NewMessage, NewParticipant, Participant,
    },
    remote::{RemoteConversation, RemoteExtension, RemoteMessage, RemoteParticipant, SourceKind, Sourced},
    schema::{conversations, extensions, media_files, messages, participants},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub renamed_conversations: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: MergeReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.renamed_conversations += other.renamed_conversations;
    }

    pub fn touched(&self) -> usize {
        self.inserted + self.updated
    }
}

fn stored_source(value: &str) -> SourceKind {
    SourceKind::parse(value).unwrap_or(SourceKind::Live)
}

pub fn merge_extensions(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    rows: &[RemoteExtension],
) -> SyncResult<MergeReport> {
    if rows.is_empty() {
        return Ok(MergeReport::default());
    }

    conn.transaction(|conn| {
        let numbers: Vec<String> = rows.iter().map(|row| row.number.clone()).collect();
        let mut existing: HashMap<String, Extension> = extensions::table
            .filter(extensions::tenant_id.eq(tenant_id))
            .filter(extensions::number.eq_any(&numbers))
            .load::<Extension>(conn)?
            .into_iter()
            .map(|ext| (ext.number.clone(), ext))
            .collect();

        let mut report = MergeReport::default();
        let mut renamed_numbers = Vec::new();
        let now = Utc::now().naive_utc();

        for row in rows {
            let display_name = row.display_name();
            match existing.remove(&row.number) {
                None => {
                    let inserted = diesel::insert_into(extensions::table)
                        .values(&NewExtension {
                            id: Uuid::new_v4(),
                            tenant_id,
                            number: row.number.clone(),
                            display_name,
                            email: row.email.clone(),
                        })
                        .on_conflict((extensions::tenant_id, extensions::number))
                        .do_nothing()
                        .execute(conn)?;
                    if inserted > 0 {
                        report.inserted += 1;
                        // Participants may have been stored with a fallback name.
                        renamed_numbers.push(row.number.clone());
                    } else {
                        report.unchanged += 1;
                    }
                }
                Some(current) => {
                    if current.display_name == display_name && current.email == row.email {
                        report.unchanged += 1;
                        continue;
                    }
                    if current.display_name != display_name {
                        renamed_numbers.push(row.number.clone());
                    }
                    diesel::update(extensions::table.find(current.id))
                        .set((
                            extensions::display_name.eq(&display_name),
                            extensions::email.eq(&row.email),
                            extensions::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    report.updated += 1;
                }
            }
        }

        if !renamed_numbers.is_empty() {
            let affected = refresh_participants_for_extensions(conn, tenant_id, &renamed_numbers)?;
            report.renamed_conversations += recompute_conversation_names(conn, tenant_id, &affected)?;
        }

        debug!(tenant_id = %tenant_id, ?report, "merged extensions");
        Ok(report)
    })
}

pub fn merge_conversations(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    rows: &[Sourced<RemoteConversation>],
) -> SyncResult<MergeReport> {
    if rows.is_empty() {
        return Ok(MergeReport::default());
    }

    conn.transaction(|conn| {
        let external_ids: Vec<String> = rows.iter().map(|r| r.row.external_id.clone()).collect();
        let existing: HashMap<String, Conversation> = conversations::table
            .filter(conversations::tenant_id.eq(tenant_id))
            .filter(conversations::external_id.eq_any(&external_ids))
            .load::<Conversation>(conn)?
            .into_iter()
            .map(|conv| (conv.external_id.clone(), conv))
            .collect();

        let mut report = MergeReport::default();
        let now = Utc::now().naive_utc();

        for Sourced { source, row } in rows {
            match existing.get(&row.external_id) {
                None => {
                    let inserted = diesel::insert_into(conversations::table)
                        .values(&NewConversation {
                            id: Uuid::new_v4(),
                            tenant_id,
                            external_id: row.external_id.clone(),
                            name: row.chat_name.clone(),
                            remote_name: row.chat_name.clone(),
                            is_group: row.is_group,
                            provider: row.provider.clone(),
                            source: source.as_str().to_string(),
                            remote_updated_at: row.updated_at,
                        })
                        .on_conflict((conversations::tenant_id, conversations::external_id))
                        .do_nothing()
                        .execute(conn)?;
                    if inserted > 0 {
                        report.inserted += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Some(current) => {
                    if !source.may_replace(stored_source(&current.source))
                        || conversation_matches(current, *source, row)
                    {
                        report.unchanged += 1;
                        continue;
                    }
                    // Non-group names are derived from participants and left alone here.
                    let name = if row.is_group {
                        row.chat_name.clone()
                    } else {
                        current.name.clone().or_else(|| row.chat_name.clone())
                    };
                    diesel::update(conversations::table.find(current.id))
                        .set((
                            conversations::remote_name.eq(&row.chat_name),
                            conversations::name.eq(name),
                            conversations::is_group.eq(row.is_group),
                            conversations::provider.eq(&row.provider),
                            conversations::source.eq(source.as_str()),
                            conversations::remote_updated_at.eq(row.updated_at),
                            conversations::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    report.updated += 1;
                }
            }
        }

        debug!(tenant_id = %tenant_id, ?report, "merged conversations");
        Ok(report)
    })
}

fn conversation_matches(current: &Conversation, source: SourceKind, row: &RemoteConversation) -> bool {
    current.remote_name == row.chat_name
        && current.is_group == row.is_group
        && current.provider == row.provider
        && current.remote_updated_at == row.updated_at
        && current.source == source.as_str()
}

/// Maps external conversation ids to central ids for one tenant.
pub fn conversation_ids(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    external_ids: &[String],
) -> SyncResult<HashMap<String, Uuid>> {
    let rows: Vec<(String, Uuid)> = conversations::table
        .filter(conversations::tenant_id.eq(tenant_id))
        .filter(conversations::external_id.eq_any(external_ids))
        .select((conversations::external_id, conversations::id))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

/// External ids from `external_ids` that have no central conversation yet.
pub fn missing_conversations(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    external_ids: &[String],
) -> SyncResult<Vec<String>> {
    let known = conversation_ids(conn, tenant_id, external_ids)?;
    let missing: BTreeSet<String> = external_ids
        .iter()
        .filter(|id| !known.contains_key(*id))
        .cloned()
        .collect();
    Ok(missing.into_iter().collect())
}

pub fn merge_participants(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    rows: &[Sourced<RemoteParticipant>],
) -> SyncResult<MergeReport> {
    if rows.is_empty() {
        return Ok(MergeReport::default());
    }

    conn.transaction(|conn| {
        let conversation_external_ids: Vec<String> = rows
            .iter()
            .map(|r| r.row.conversation_external_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let conversation_map = conversation_ids(conn, tenant_id, &conversation_external_ids)?;

        let numbers: Vec<String> = rows
            .iter()
            .filter_map(|r| r.row.extension_number.clone())
            .collect();
        let extension_names = extension_names(conn, tenant_id, &numbers)?;

        let conversation_uuids: Vec<Uuid> = conversation_map.values().copied().collect();
        let existing: HashMap<(Uuid, String), Participant> = participants::table
            .filter(participants::tenant_id.eq(tenant_id))
            .filter(participants::conversation_id.eq_any(&conversation_uuids))
            .load::<Participant>(conn)?
            .into_iter()
            .map(|p| ((p.conversation_id, p.participant_key.clone()), p))
            .collect();

        let mut report = MergeReport::default();
        let mut affected = HashSet::new();
        let now = Utc::now().naive_utc();

        for Sourced { source, row } in rows {
            let conversation_id = *conversation_map
                .get(&row.conversation_external_id)
                .ok_or_else(|| {
                    SyncError::merge(format!(
                        "participant {} references unmerged conversation {}",
                        row.participant_key, row.conversation_external_id
                    ))
                })?;

            let display_name = derive_participant_name(
                row.extension_number
                    .as_ref()
                    .and_then(|number| extension_names.get(number))
                    .map(String::as_str),
                row.participant_name.as_deref(),
                row.external_identity.as_deref(),
                &row.participant_key,
            );

            match existing.get(&(conversation_id, row.participant_key.clone())) {
                None => {
                    let inserted = diesel::insert_into(participants::table)
                        .values(&NewParticipant {
                            id: Uuid::new_v4(),
                            tenant_id,
                            conversation_id,
                            participant_key: row.participant_key.clone(),
                            extension_number: row.extension_number.clone(),
                            external_identity: row.external_identity.clone(),
                            remote_name: row.participant_name.clone(),
                            display_name,
                            source: source.as_str().to_string(),
                        })
                        .on_conflict((participants::conversation_id, participants::participant_key))
                        .do_nothing()
                        .execute(conn)?;
                    if inserted > 0 {
                        report.inserted += 1;
                        affected.insert(conversation_id);
                    } else {
                        report.unchanged += 1;
                    }
                }
                Some(current) => {
                    let unchanged = current.extension_number == row.extension_number
                        && current.external_identity == row.external_identity
                        && current.remote_name == row.participant_name
                        && current.display_name == display_name
                        && current.source == source.as_str();
                    if unchanged || !source.may_replace(stored_source(&current.source)) {
                        report.unchanged += 1;
                        continue;
                    }
                    diesel::update(participants::table.find(current.id))
                        .set((
                            participants::extension_number.eq(&row.extension_number),
                            participants::external_identity.eq(&row.external_identity),
                            participants::remote_name.eq(&row.participant_name),
                            participants::display_name.eq(&display_name),
                            participants::source.eq(source.as_str()),
                            participants::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    report.updated += 1;
                    affected.insert(conversation_id);
                }
            }
        }

        let affected: Vec<Uuid> = affected.into_iter().collect();
        report.renamed_conversations = recompute_conversation_names(conn, tenant_id, &affected)?;

        debug!(tenant_id = %tenant_id, ?report, "merged participants");
        Ok(report)
    })
}

pub fn merge_messages(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    rows: &[Sourced<RemoteMessage>],
) -> SyncResult<MergeReport> {
    if rows.is_empty() {
        return Ok(MergeReport::default());
    }

    conn.transaction(|conn| {
        let conversation_external_ids: Vec<String> = rows
            .iter()
            .map(|r| r.row.conversation_external_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let conversation_map = conversation_ids(conn, tenant_id, &conversation_external_ids)?;

        let external_ids: Vec<String> = rows.iter().map(|r| r.row.external_id.clone()).collect();
        let existing: HashMap<String, Message> = messages::table
            .filter(messages::tenant_id.eq(tenant_id))
            .filter(messages::external_id.eq_any(&external_ids))
            .load::<Message>(conn)?
            .into_iter()
            .map(|m| (m.external_id.clone(), m))
            .collect();

        let mut report = MergeReport::default();
        let now = Utc::now().naive_utc();

        for Sourced { source, row } in rows {
            let conversation_id = *conversation_map
                .get(&row.conversation_external_id)
                .ok_or_else(|| {
                    SyncError::merge(format!(
                        "message {} references unmerged conversation {}",
                        row.external_id, row.conversation_external_id
                    ))
                })?;
            let content = row.content.clone().unwrap_or_default();
            let attachment_name = row
                .file_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);

            match existing.get(&row.external_id) {
                None => {
                    let inserted = diesel::insert_into(messages::table)
                        .values(&NewMessage {
                            id: Uuid::new_v4(),
                            tenant_id,
                            conversation_id,
                            external_id: row.external_id.clone(),
                            sent_at: row.sent_at,
                            sender_number: row.sender_number.clone(),
                            sender_name: row.sender_name.clone(),
                            content,
                            has_media: attachment_name.is_some(),
                            attachment_name,
                            source: source.as_str().to_string(),
                        })
                        .on_conflict((messages::tenant_id, messages::external_id))
                        .do_nothing()
                        .execute(conn)?;
                    if inserted > 0 {
                        report.inserted += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Some(current) => {
                    // Once flagged, a message keeps has_media even if a later copy drops the name.
                    let has_media = current.has_media || attachment_name.is_some();
                    let attachment_name = attachment_name.or_else(|| current.attachment_name.clone());
                    let unchanged = current.sent_at == row.sent_at
                        && current.sender_number == row.sender_number
                        && current.sender_name == row.sender_name
                        && current.content == content
                        && current.attachment_name == attachment_name
                        && current.has_media == has_media
                        && current.source == source.as_str();
                    if unchanged || !source.may_replace(stored_source(&current.source)) {
                        report.unchanged += 1;
                        continue;
                    }
                    diesel::update(messages::table.find(current.id))
                        .set((
                            messages::sent_at.eq(row.sent_at),
                            messages::sender_number.eq(&row.sender_number),
                            messages::sender_name.eq(&row.sender_name),
                            messages::content.eq(&content),
                            messages::attachment_name.eq(&attachment_name),
                            messages::has_media.eq(has_media),
                            messages::source.eq(source.as_str()),
                            messages::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    report.updated += 1;
                }
            }
        }

        debug!(tenant_id = %tenant_id, ?report, "merged messages");
        Ok(report)
    })
}

fn extension_names(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    numbers: &[String],
) -> SyncResult<HashMap<String, String>> {
    if numbers.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(String, String)> = extensions::table
        .filter(extensions::tenant_id.eq(tenant_id))
        .filter(extensions::number.eq_any(numbers))
        .select((extensions::number, extensions::display_name))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

/// Re-derives participant names after extension renames; returns touched conversations.
fn refresh_participants_for_extensions(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    numbers: &[String],
) -> SyncResult<Vec<Uuid>> {
    let names = extension_names(conn, tenant_id, numbers)?;
    let linked: Vec<Participant> = participants::table
        .filter(participants::tenant_id.eq(tenant_id))
        .filter(participants::extension_number.eq_any(numbers))
        .load(conn)?;

    let mut affected = BTreeSet::new();
    let now = Utc::now().naive_utc();
    for participant in linked {
        let display_name = derive_participant_name(
            participant
                .extension_number
                .as_ref()
                .and_then(|number| names.get(number))
                .map(String::as_str),
            participant.remote_name.as_deref(),
            participant.external_identity.as_deref(),
            &participant.participant_key,
        );
        if display_name == participant.display_name {
            continue;
        }
        diesel::update(participants::table.find(participant.id))
            .set((
                participants::display_name.eq(&display_name),
                participants::updated_at.eq(now),
            ))
            .execute(conn)?;
        affected.insert(participant.conversation_id);
    }
    Ok(affected.into_iter().collect())
}

/// Sets each non-group conversation's name to its participants' names,
/// sorted and comma-joined. Returns how many names changed.
pub fn recompute_conversation_names(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    conversation_ids: &[Uuid],
) -> SyncResult<usize> {
    if conversation_ids.is_empty() {
        return Ok(0);
    }

    let targets: Vec<Conversation> = conversations::table
        .filter(conversations::tenant_id.eq(tenant_id))
        .filter(conversations::id.eq_any(conversation_ids))
        .filter(conversations::is_group.eq(false))
        .load(conn)?;
    if targets.is_empty() {
        return Ok(0);
    }

    let target_ids: Vec<Uuid> = targets.iter().map(|c| c.id).collect();
    let mut names_by_conversation: HashMap<Uuid, Vec<String>> = HashMap::new();
    let rows: Vec<(Uuid, String)> = participants::table
        .filter(participants::tenant_id.eq(tenant_id))
        .filter(participants::conversation_id.eq_any(&target_ids))
        .select((participants::conversation_id, participants::display_name))
        .load(conn)?;
    for (conversation_id, name) in rows {
        names_by_conversation
            .entry(conversation_id)
            .or_default()
            .push(name);
    }

    let now = Utc::now().naive_utc();
    let mut renamed = 0;
    for conversation in targets {
        let Some(names) = names_by_conversation.remove(&conversation.id) else {
            continue;
        };
        let name = conversation_display_name(names);
        if conversation.name.as_deref() == Some(name.as_str()) {
            continue;
        }
        diesel::update(conversations::table.find(conversation.id))
            .set((
                conversations::name.eq(Some(&name)),
                conversations::updated_at.eq(now),
            ))
            .execute(conn)?;
        renamed += 1;
    }

    if renamed > 0 {
        info!(tenant_id = %tenant_id, renamed, "recomputed conversation names");
    }
    Ok(renamed)
}

/// Extension name, then the PBX's own name, then the caller identity, then the raw key.
pub fn derive_participant_name(
    extension_name: Option<&str>,
    remote_name: Option<&str>,
    external_identity: Option<&str>,
    participant_key: &str,
) -> String {
    [extension_name, remote_name, external_identity]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(participant_key)
        .to_string()
}

/// One entry per participant, sorted; equal names are not collapsed.
pub fn conversation_display_name(mut names: Vec<String>) -> String {
    names.sort();
    names.join(", ")
}

/// A stored object to be recorded as a MediaFile.
#[derive(Debug, Clone)]
pub struct MediaRegistration {
    pub file_name: String,
    pub storage_backend: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    /// Owning message when it is known at ingest time.
    pub message_external_id: Option<String>,
}

/// Records a stored object, returning the row and whether it was created.
///
/// `(storage_backend, storage_path)` identifies the object; registering it
/// again is a no-op. A path already owned by another tenant is rejected.
pub fn register_media_file(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    registration: &MediaRegistration,
) -> SyncResult<(MediaFile, bool)> {
    conn.transaction(|conn| {
        let owner: Option<(Uuid, Uuid)> = match &registration.message_external_id {
            Some(external_id) => messages::table
                .filter(messages::tenant_id.eq(tenant_id))
                .filter(messages::external_id.eq(external_id))
                .select((messages::id, messages::conversation_id))
                .first(conn)
                .optional()?,
            None => None,
        };

        let inserted = diesel::insert_into(media_files::table)
            .values(&NewMediaFile {
                id: Uuid::new_v4(),
                tenant_id,
                message_id: owner.map(|(message_id, _)| message_id),
                conversation_id: owner.map(|(_, conversation_id)| conversation_id),
                file_name: registration.file_name.clone(),
                storage_backend: registration.storage_backend.clone(),
                storage_path: registration.storage_path.clone(),
                mime_type: registration.mime_type.clone(),
                file_size: registration.file_size,
            })
            .on_conflict((media_files::storage_backend, media_files::storage_path))
            .do_nothing()
            .execute(conn)?;

        let media: MediaFile = media_files::table
            .filter(media_files::storage_backend.eq(&registration.storage_backend))
            .filter(media_files::storage_path.eq(&registration.storage_path))
            .first(conn)?;

        if media.tenant_id != tenant_id {
            return Err(SyncError::merge(format!(
                "storage path {} belongs to another tenant",
                registration.storage_path
            )));
        }

        if inserted > 0 {
            if let Some((message_id, _)) = owner {
                mark_has_media(conn, tenant_id, message_id)?;
            }
        }

        Ok((media, inserted > 0))
    })
}

fn mark_has_media(conn: &mut PgConnection, tenant_id: Uuid, message_id: Uuid) -> SyncResult<()> {
    diesel::update(
        messages::table
            .filter(messages::tenant_id.eq(tenant_id))
            .filter(messages::id.eq(message_id))
            .filter(messages::has_media.eq(false)),
    )
    .set((
        messages::has_media.eq(true),
        messages::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(())
}

/// Latest remote timestamp merged for the tenant, used for activity tracking.
pub fn latest_message_at(conn: &mut PgConnection, tenant_id: Uuid) -> SyncResult<Option<NaiveDateTime>> {
    let latest = messages::table
        .filter(messages::tenant_id.eq(tenant_id))
        .select(diesel::dsl::max(messages::sent_at))
        .first::<Option<NaiveDateTime>>(conn)?;
    Ok(latest)
}
