use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: i32,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub ssh_host_fingerprint: Option<String>,
    pub db_host: String,
    pub db_port: i32,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub sync_enabled: bool,
    pub sync_interval_minutes: Option<i32>,
    pub default_storage_backend: String,
    pub last_sync_at: Option<NaiveDateTime>,
    pub last_activity_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tenants)]
pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: i32,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub db_host: String,
    pub db_port: i32,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub sync_enabled: bool,
    pub default_storage_backend: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = extensions)]
pub struct Extension {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub number: String,
    pub display_name: String,
    pub email: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = extensions)]
pub struct NewExtension {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub number: String,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub remote_name: Option<String>,
    pub is_group: bool,
    pub provider: Option<String>,
    pub source: String,
    pub remote_updated_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = conversations)]
pub struct NewConversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub remote_name: Option<String>,
    pub is_group: bool,
    pub provider: Option<String>,
    pub source: String,
    pub remote_updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = participants)]
#[diesel(belongs_to(Conversation))]
pub struct Participant {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub participant_key: String,
    pub extension_number: Option<String>,
    pub external_identity: Option<String>,
    pub remote_name: Option<String>,
    pub display_name: String,
    pub source: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = participants)]
pub struct NewParticipant {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub participant_key: String,
    pub extension_number: Option<String>,
    pub external_identity: Option<String>,
    pub remote_name: Option<String>,
    pub display_name: String,
    pub source: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = messages)]
#[diesel(belongs_to(Conversation))]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub external_id: String,
    pub sent_at: NaiveDateTime,
    pub sender_number: Option<String>,
    pub sender_name: Option<String>,
    pub content: String,
    pub attachment_name: Option<String>,
    pub has_media: bool,
    pub source: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub external_id: String,
    pub sent_at: NaiveDateTime,
    pub sender_number: Option<String>,
    pub sender_name: Option<String>,
    pub content: String,
    pub attachment_name: Option<String>,
    pub has_media: bool,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Identifiable)]
#[diesel(table_name = media_files)]
pub struct MediaFile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub message_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub file_name: String,
    pub storage_backend: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    pub original_size: Option<i64>,
    pub compression_status: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = media_files)]
pub struct NewMediaFile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub message_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub file_name: String,
    pub storage_backend: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
}

#[derive(Debug, Clone, Queryable, QueryableByName, Identifiable)]
#[diesel(table_name = sync_states)]
pub struct SyncState {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub sync_kind: String,
    pub status: String,
    pub cursor: Option<serde_json::Value>,
    pub trigger_requested_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub last_started_at: Option<NaiveDateTime>,
    pub last_finished_at: Option<NaiveDateTime>,
    pub last_success_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    /// Token of the run that holds the row while `running`.
    pub run_id: Option<Uuid>,
}
