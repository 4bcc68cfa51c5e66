use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use diesel::{
    connection::SimpleConnection,
    pg::PgConnection,
    prelude::*,
    sql_types::{Array, BigInt, Text, Timestamptz},
};
use tokio::task;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

pub mod reconcile;
pub mod rows;

pub use reconcile::{CursorPosition, Page, SourceKind, Sourced};
pub use rows::{RemoteConversation, RemoteExtension, RemoteMessage, RemoteParticipant};

use reconcile::{merge_pages, reconcile};
use rows::RelationPresence;

/// A conceptual PBX table and the view it is archived into.
#[derive(Clone, Copy, Debug)]
pub struct SourcePair {
    pub live: &'static str,
    pub historical: &'static str,
}

pub const CONVERSATIONS: SourcePair = SourcePair {
    live: "chat_conversation",
    historical: "chat_conversation_history_view",
};

pub const MESSAGES: SourcePair = SourcePair {
    live: "chat_message",
    historical: "chat_message_history_view",
};

pub const PARTICIPANTS: SourcePair = SourcePair {
    live: "chat_participant",
    historical: "chat_participant_history_view",
};

pub const EXTENSIONS: &str = "extension";

/// Every relation extraction reads, in probe order.
pub fn required_relations() -> Vec<&'static str> {
    vec![
        EXTENSIONS,
        CONVERSATIONS.live,
        CONVERSATIONS.historical,
        MESSAGES.live,
        MESSAGES.historical,
        PARTICIPANTS.live,
        PARTICIPANTS.historical,
    ]
}

/// Read-only client for one tenant's PBX database.
///
/// Diesel connections block, so every query runs on the blocking pool while
/// holding the connection's mutex.
#[derive(Clone)]
pub struct RemoteClient {
    conn: Arc<Mutex<PgConnection>>,
    batch_size: i64,
}

impl RemoteClient {
    pub async fn connect(
        database_url: String,
        statement_timeout: Duration,
        batch_size: i64,
    ) -> SyncResult<Self> {
        let conn = task::spawn_blocking(move || -> SyncResult<PgConnection> {
            let mut conn = PgConnection::establish(&database_url)
                .map_err(|err| SyncError::SourceQuery(format!("connect: {err}")))?;
            conn.batch_execute(&format!(
                "SET statement_timeout = {}; SET default_transaction_read_only = on;",
                statement_timeout.as_millis()
            ))
            .map_err(SyncError::source_query)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            batch_size: batch_size.max(1),
        })
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    async fn with_conn<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut PgConnection) -> QueryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SyncError::SourceQuery("remote connection poisoned".into()))?;
            f(&mut *guard).map_err(SyncError::source_query)
        })
        .await?
    }

    /// `SELECT 1` through the tunnel.
    pub async fn ping(&self) -> SyncResult<()> {
        self.with_conn(|conn| conn.batch_execute("SELECT 1")).await
    }

    /// Reports which of the required tables and views exist.
    pub async fn probe_schema(&self) -> SyncResult<Vec<(&'static str, bool)>> {
        self.with_conn(|conn| {
            required_relations()
                .into_iter()
                .map(|relation| {
                    let row: RelationPresence =
                        diesel::sql_query("SELECT to_regclass($1) IS NOT NULL AS present")
                            .bind::<Text, _>(relation)
                            .get_result(conn)?;
                    Ok::<_, diesel::result::Error>((relation, row.present))
                })
                .collect()
        })
        .await
    }

    /// Extensions ordered by number, strictly after `after`.
    pub async fn extensions_after(&self, after: Option<String>) -> SyncResult<Vec<RemoteExtension>> {
        let limit = self.batch_size;
        self.with_conn(move |conn| {
            diesel::sql_query(format!(
                "SELECT number::text AS number, first_name, last_name, email \
                 FROM {EXTENSIONS} \
                 WHERE number::text > $1 \
                 ORDER BY number::text \
                 LIMIT $2"
            ))
            .bind::<Text, _>(after.unwrap_or_default())
            .bind::<BigInt, _>(limit)
            .load(conn)
        })
        .await
    }

    pub async fn conversations_page(
        &self,
        cursor: &CursorPosition,
    ) -> SyncResult<Page<RemoteConversation>> {
        let limit = self.batch_size;
        let cursor = cursor.clone();
        let (live, historical) = self
            .with_conn(move |conn| {
                let live = load_conversations_after(conn, CONVERSATIONS.live, &cursor, limit)?;
                let historical =
                    load_conversations_after(conn, CONVERSATIONS.historical, &cursor, limit)?;
                Ok((live, historical))
            })
            .await?;
        debug!(
            live = live.len(),
            historical = historical.len(),
            "fetched conversation page"
        );
        Ok(merge_pages(live, historical, limit as usize))
    }

    /// Looks conversations up by external id in both sources.
    pub async fn conversations_by_ids(
        &self,
        external_ids: Vec<String>,
    ) -> SyncResult<Vec<Sourced<RemoteConversation>>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (live, historical) = self
            .with_conn(move |conn| {
                let live = load_conversations_by_ids(conn, CONVERSATIONS.live, &external_ids)?;
                let historical =
                    load_conversations_by_ids(conn, CONVERSATIONS.historical, &external_ids)?;
                Ok((live, historical))
            })
            .await?;
        Ok(reconcile(live, historical))
    }

    pub async fn messages_page(&self, cursor: &CursorPosition) -> SyncResult<Page<RemoteMessage>> {
        let limit = self.batch_size;
        let cursor = cursor.clone();
        let (live, historical) = self
            .with_conn(move |conn| {
                let live = load_messages_after(conn, MESSAGES.live, &cursor, limit)?;
                let historical = load_messages_after(conn, MESSAGES.historical, &cursor, limit)?;
                Ok((live, historical))
            })
            .await?;
        debug!(
            live = live.len(),
            historical = historical.len(),
            "fetched message page"
        );
        Ok(merge_pages(live, historical, limit as usize))
    }

    pub async fn participants_for(
        &self,
        conversation_external_ids: Vec<String>,
    ) -> SyncResult<Vec<Sourced<RemoteParticipant>>> {
        if conversation_external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (live, historical) = self
            .with_conn(move |conn| {
                let live =
                    load_participants(conn, PARTICIPANTS.live, &conversation_external_ids)?;
                let historical =
                    load_participants(conn, PARTICIPANTS.historical, &conversation_external_ids)?;
                Ok((live, historical))
            })
            .await?;
        Ok(reconcile(live, historical))
    }
}

const CONVERSATION_COLUMNS: &str =
    "id::text AS external_id, chat_name, is_group, provider, updated_at";

const MESSAGE_COLUMNS: &str = "id::text AS external_id, \
     conversation_id::text AS conversation_external_id, \
     sent_at, sender_number, sender_name, message AS content, file_name";

const PARTICIPANT_COLUMNS: &str = "conversation_id::text AS conversation_external_id, \
     participant_no::text AS participant_key, participant_name, \
     extension_number, external_identity";

/// Byte order for text ids, so the database pages ids the way
/// `CursorPosition` compares them regardless of the remote's collation.
const ID_ORDER: &str = "id::text COLLATE \"C\"";

fn load_conversations_after(
    conn: &mut PgConnection,
    relation: &str,
    cursor: &CursorPosition,
    limit: i64,
) -> QueryResult<Vec<RemoteConversation>> {
    diesel::sql_query(format!(
        "SELECT {CONVERSATION_COLUMNS} FROM {relation} \
         WHERE (updated_at, {ID_ORDER}) > ($1, $2::text COLLATE \"C\") \
         ORDER BY updated_at, {ID_ORDER} \
         LIMIT $3"
    ))
    .bind::<Timestamptz, _>(cursor.at)
    .bind::<Text, _>(&cursor.id)
    .bind::<BigInt, _>(limit)
    .load(conn)
}

fn load_conversations_by_ids(
    conn: &mut PgConnection,
    relation: &str,
    external_ids: &[String],
) -> QueryResult<Vec<RemoteConversation>> {
    diesel::sql_query(format!(
        "SELECT {CONVERSATION_COLUMNS} FROM {relation} \
         WHERE id::text = ANY($1) \
         ORDER BY updated_at, {ID_ORDER}"
    ))
    .bind::<Array<Text>, _>(external_ids)
    .load(conn)
}

fn load_messages_after(
    conn: &mut PgConnection,
    relation: &str,
    cursor: &CursorPosition,
    limit: i64,
) -> QueryResult<Vec<RemoteMessage>> {
    diesel::sql_query(format!(
        "SELECT {MESSAGE_COLUMNS} FROM {relation} \
         WHERE (sent_at, {ID_ORDER}) > ($1, $2::text COLLATE \"C\") \
         ORDER BY sent_at, {ID_ORDER} \
         LIMIT $3"
    ))
    .bind::<Timestamptz, _>(cursor.at)
    .bind::<Text, _>(&cursor.id)
    .bind::<BigInt, _>(limit)
    .load(conn)
}

fn load_participants(
    conn: &mut PgConnection,
    relation: &str,
    conversation_external_ids: &[String],
) -> QueryResult<Vec<RemoteParticipant>> {
    diesel::sql_query(format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM {relation} \
         WHERE conversation_id::text = ANY($1) \
         ORDER BY conversation_id::text, participant_no::text"
    ))
    .bind::<Array<Text>, _>(conversation_external_ids)
    .load(conn)
}
