use serde::Deserialize;

use ichigo_core::{AccessPolicy, ConversationId};

use crate::commands::{parse_command, ChatCommand};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Other,
}

/// A text message from an allow-listed identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub conversation_id: ConversationId,
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub private: bool,
    pub text: String,
}

impl InboundMessage {
    pub fn command(&self) -> Option<ChatCommand> {
        parse_command(&self.text)
    }

    pub fn is_from_admin(&self, access: &AccessPolicy) -> bool {
        self.user_id.is_some_and(|user_id| access.is_admin(user_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Accepted(InboundMessage),
    Unauthorized { user_id: Option<i64>, chat_id: i64 },
    /// Updates without a text message.
    Ignored,
}

/// Maps an update to its conversation: the sender's own conversation first,
/// then the chat's (group) conversation.
pub fn resolve_update(update: Update, access: &AccessPolicy) -> Resolution {
    let Some(message) = update.message else {
        return Resolution::Ignored;
    };
    let Some(text) = message.text else {
        return Resolution::Ignored;
    };

    let user_id = message.from.as_ref().map(|user| user.id);
    let chat_id = message.chat.id;
    let conversation_id = user_id
        .map(ConversationId)
        .filter(|id| access.is_allowed(*id))
        .or_else(|| Some(ConversationId(chat_id)).filter(|id| access.is_allowed(*id)));

    match conversation_id {
        Some(conversation_id) => Resolution::Accepted(InboundMessage {
            update_id: update.update_id,
            conversation_id,
            chat_id,
            user_id,
            private: message.chat.kind == ChatKind::Private,
            text,
        }),
        None => Resolution::Unauthorized { user_id, chat_id },
    }
}
