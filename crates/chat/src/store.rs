use std::collections::HashMap;

use palaver_llm::Message;
use tokio::sync::RwLock;

use super::error::{ChatResult, ConversationNotFoundSnafu};
use super::ids::ConversationId;
use super::types::Conversation;

/// Owned map of live conversations.
///
/// Lock discipline: one `RwLock` guards membership and every conversation
/// field. Reads take the shared side, create/delete/append/truncate the
/// exclusive side. No guard is ever held across an await point.
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, system_prompt: Option<&str>) -> Conversation {
        let mut conversations = self.conversations.write().await;

        let mut id = ConversationId::new_v7();
        while conversations.contains_key(&id) {
            tracing::warn!(conversation_id = %id, "conversation id collision; minting another");
            id = ConversationId::new_v7();
        }

        let conversation = Conversation::new(id, system_prompt);
        conversations.insert(id, conversation.clone());
        conversation
    }

    pub async fn get(&self, id: ConversationId) -> ChatResult<Conversation> {
        self.inspect(id, "get-conversation", Conversation::clone).await
    }

    /// Snapshot of every live conversation, in no particular order.
    pub async fn list(&self) -> Vec<Conversation> {
        let conversations = self.conversations.read().await;
        conversations.values().cloned().collect()
    }

    pub async fn delete(&self, id: ConversationId) -> ChatResult<()> {
        let mut conversations = self.conversations.write().await;
        if conversations.remove(&id).is_none() {
            return ConversationNotFoundSnafu {
                stage: "delete-conversation",
                id,
            }
            .fail();
        }

        Ok(())
    }

    /// Appends `message` and returns a copy of the full history in one critical section.
    pub async fn append_and_snapshot(
        &self,
        id: ConversationId,
        message: Message,
    ) -> ChatResult<Vec<Message>> {
        self.mutate(id, "append-and-snapshot", |conversation| {
            conversation.push(message);
            conversation.messages.clone()
        })
        .await
    }

    pub async fn append(&self, id: ConversationId, message: Message) -> ChatResult<()> {
        self.mutate(id, "append-message", |conversation| {
            conversation.push(message)
        })
        .await
    }

    pub async fn truncate_to_system(&self, id: ConversationId) -> ChatResult<()> {
        self.mutate(id, "truncate-to-system", Conversation::truncate_to_system)
            .await
    }

    pub async fn set_metadata(
        &self,
        id: ConversationId,
        key: String,
        value: String,
    ) -> ChatResult<()> {
        self.mutate(id, "set-metadata", |conversation| {
            conversation.metadata.insert(key, value);
        })
        .await
    }

    /// Runs `read` against one conversation under the shared lock.
    pub async fn inspect<R>(
        &self,
        id: ConversationId,
        stage: &'static str,
        read: impl FnOnce(&Conversation) -> R,
    ) -> ChatResult<R> {
        let conversations = self.conversations.read().await;
        match conversations.get(&id) {
            Some(conversation) => Ok(read(conversation)),
            None => ConversationNotFoundSnafu { stage, id }.fail(),
        }
    }

    /// Folds over every conversation under the shared lock.
    pub async fn fold<A>(&self, init: A, step: impl FnMut(A, &Conversation) -> A) -> A {
        let conversations = self.conversations.read().await;
        conversations.values().fold(init, step)
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn mutate<R>(
        &self,
        id: ConversationId,
        stage: &'static str,
        write: impl FnOnce(&mut Conversation) -> R,
    ) -> ChatResult<R> {
        let mut conversations = self.conversations.write().await;
        match conversations.get_mut(&id) {
            Some(conversation) => Ok(write(conversation)),
            None => ConversationNotFoundSnafu { stage, id }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use palaver_llm::Role;

    use super::*;

    #[tokio::test]
    async fn create_seeds_optional_system_prompt() {
        let store = ConversationStore::new();

        let empty = store.create(None).await;
        let seeded = store.create(Some("You are a helpful assistant")).await;

        assert!(empty.messages.is_empty());
        assert_eq!(seeded.messages.len(), 1);
        assert_eq!(seeded.messages[0].role, Role::System);
        assert_ne!(empty.id, seeded.id);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_appends() {
        let store = ConversationStore::new();
        let id = store.create(None).await.id;

        let snapshot = store
            .append_and_snapshot(id, Message::user("first"))
            .await
            .unwrap();
        store.append(id, Message::assistant("reply")).await.unwrap();

        assert_eq!(snapshot, vec![Message::user("first")]);
        assert_eq!(store.get(id).await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_missing_ids() {
        let store = ConversationStore::new();
        let id = store.create(None).await.id;

        store.delete(id).await.unwrap();
        assert!(store.delete(id).await.unwrap_err().is_not_found());
        assert!(store.get(id).await.unwrap_err().is_not_found());
        assert!(store.append(id, Message::user("late")).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reads_do_not_touch_updated_at() {
        let store = ConversationStore::new();
        let id = store.create(Some("sys")).await.id;
        let before = store.get(id).await.unwrap().updated_at;

        let _ = store.list().await;
        let _ = store.get(id).await.unwrap();
        let _ = store.inspect(id, "test", |c| c.messages.len()).await.unwrap();

        assert_eq!(store.get(id).await.unwrap().updated_at, before);
    }

    #[tokio::test]
    async fn metadata_updates_leave_history_alone() {
        let store = ConversationStore::new();
        let id = store.create(None).await.id;
        let before = store.get(id).await.unwrap();

        store
            .set_metadata(id, "topic".to_string(), "billing".to_string())
            .await
            .unwrap();

        let after = store.get(id).await.unwrap();
        assert_eq!(after.metadata.get("topic").map(String::as_str), Some("billing"));
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.messages.is_empty());
    }
}
