use chrono::NaiveDateTime;
use diesel::{
    sql_types::{Bool, Nullable, Text, Timestamptz},
    QueryableByName,
};

use super::reconcile::{CursorPosition, Keyed, Paged};

#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct RemoteExtension {
    #[diesel(sql_type = Text)]
    pub number: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub first_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub email: Option<String>,
}

impl RemoteExtension {
    /// "First Last", falling back to the extension number.
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.number.clone()
        } else {
            name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct RemoteConversation {
    #[diesel(sql_type = Text)]
    pub external_id: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub chat_name: Option<String>,
    #[diesel(sql_type = Bool)]
    pub is_group: bool,
    #[diesel(sql_type = Nullable<Text>)]
    pub provider: Option<String>,
    #[diesel(sql_type = Timestamptz)]
    pub updated_at: NaiveDateTime,
}

impl Keyed for RemoteConversation {
    type Key = String;

    fn key(&self) -> String {
        self.external_id.clone()
    }
}

impl Paged for RemoteConversation {
    fn position(&self) -> CursorPosition {
        CursorPosition::new(self.updated_at, self.external_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct RemoteMessage {
    #[diesel(sql_type = Text)]
    pub external_id: String,
    #[diesel(sql_type = Text)]
    pub conversation_external_id: String,
    #[diesel(sql_type = Timestamptz)]
    pub sent_at: NaiveDateTime,
    #[diesel(sql_type = Nullable<Text>)]
    pub sender_number: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub sender_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub content: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub file_name: Option<String>,
}

impl Keyed for RemoteMessage {
    type Key = String;

    fn key(&self) -> String {
        self.external_id.clone()
    }
}

impl Paged for RemoteMessage {
    fn position(&self) -> CursorPosition {
        CursorPosition::new(self.sent_at, self.external_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct RemoteParticipant {
    #[diesel(sql_type = Text)]
    pub conversation_external_id: String,
    #[diesel(sql_type = Text)]
    pub participant_key: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub participant_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub extension_number: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub external_identity: Option<String>,
}

impl Keyed for RemoteParticipant {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (
            self.conversation_external_id.clone(),
            self.participant_key.clone(),
        )
    }
}

#[derive(Debug, QueryableByName)]
pub(crate) struct RelationPresence {
    #[diesel(sql_type = Bool)]
    pub present: bool,
}
