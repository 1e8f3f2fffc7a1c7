use std::collections::{BTreeSet, HashSet};

use crate::config::{AccessConfig, BlocklistRule};
use crate::domain::catalog::Catalog;
use crate::domain::conversation::ConversationId;

/// A blocklist rule with its `except_*` inversions already applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Rejection {
    conversations: HashSet<i64>,
    models: HashSet<String>,
}

/// Precomputed allow-list: which identities may talk to the bot, which of
/// them are admins, and which models each identity may select.
#[derive(Clone, Debug, Default)]
pub struct AccessPolicy {
    admins: HashSet<i64>,
    conversations: BTreeSet<i64>,
    rejections: Vec<Rejection>,
    all_models: Vec<String>,
}

impl AccessPolicy {
    pub fn new(access: &AccessConfig, blocklist: &[BlocklistRule], catalog: &Catalog) -> Self {
        let conversations: BTreeSet<i64> = access
            .admins
            .iter()
            .chain(access.users.iter())
            .chain(access.groups.iter())
            .copied()
            .collect();
        let all_models: Vec<String> = catalog.aliases().map(str::to_string).collect();

        let rejections = blocklist
            .iter()
            .map(|rule| {
                let listed: HashSet<i64> = rule.sessions.iter().copied().collect();
                let conversations = if rule.except_sessions {
                    conversations.iter().copied().filter(|id| !listed.contains(id)).collect()
                } else {
                    listed
                };

                let models = if rule.except_models {
                    all_models
                        .iter()
                        .filter(|alias| !rule.models.contains(*alias))
                        .cloned()
                        .collect()
                } else {
                    rule.models.iter().cloned().collect()
                };

                Rejection { conversations, models }
            })
            .collect();

        Self {
            admins: access.admins.iter().copied().collect(),
            conversations,
            rejections,
            all_models,
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn is_allowed(&self, id: ConversationId) -> bool {
        self.conversations.contains(&id.0)
    }

    /// Every allow-listed conversation id, ascending.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.conversations.iter().copied().map(ConversationId).collect()
    }

    /// Catalog aliases minus every rejection that applies to `id`, in catalog
    /// order.
    pub fn available_models(&self, id: ConversationId) -> Vec<String> {
        self.all_models
            .iter()
            .filter(|alias| {
                !self.rejections.iter().any(|rejection| {
                    rejection.conversations.contains(&id.0) && rejection.models.contains(*alias)
                })
            })
            .cloned()
            .collect()
    }
}
