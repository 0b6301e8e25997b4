use log::debug;
use std::collections::HashSet;

use crate::models::chat::{ Conversation, Message };

/// Working set for the displayed conversation plus the known-conversation list.
///
/// Messages are kept in acceptance order. An id is accepted at most once for
/// the lifetime of an activation; a late duplicate never moves the original.
#[derive(Debug, Default)]
pub struct ConversationStore {
    active: Option<Conversation>,
    messages: Vec<Message>,
    ids: HashSet<String>,
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `conversation` the displayed one with an empty message list.
    pub fn activate(&mut self, conversation: Conversation) {
        self.messages.clear();
        self.ids.clear();
        self.upsert_conversation(conversation.clone());
        self.active = Some(conversation);
    }

    pub fn deactivate(&mut self) -> Option<Conversation> {
        self.messages.clear();
        self.ids.clear();
        self.active.take()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|c| c.id.as_str())
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_id() == Some(conversation_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    /// Appends `message` unless its id is already present or it belongs to a
    /// conversation other than the active one. Returns whether it was stored.
    pub fn apply_incoming(&mut self, message: Message) -> bool {
        if !self.is_active(&message.conversation_id) {
            debug!(
                "Ignoring message {} for inactive conversation {}",
                message.id,
                message.conversation_id
            );
            return false;
        }
        if !self.ids.insert(message.id.clone()) {
            debug!("Duplicate message {} dropped", message.id);
            return false;
        }

        if let Some(active) = self.active.as_mut() {
            bump(active, &message);
        }
        if let Some(listed) = self.conversations.iter_mut().find(|c| c.id == message.conversation_id) {
            bump(listed, &message);
        }
        self.messages.push(message);
        true
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Replaces the list with the server's; the active entry picks up new metadata.
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        if let Some(active) = self.active.as_mut() {
            if let Some(fresh) = conversations.iter().find(|c| c.id == active.id) {
                active.title = fresh.title.clone();
                active.updated_at = active.updated_at.max(fresh.updated_at);
                active.message_count = active.message_count.max(fresh.message_count);
            }
        }
        self.conversations = conversations;
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        if let Some(active) = self.active.as_mut() {
            if active.id == conversation.id {
                active.title = conversation.title.clone();
            }
        }
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => {
                *existing = conversation;
            }
            None => self.conversations.insert(0, conversation),
        }
    }

    /// Returns true when the removed conversation was the displayed one.
    pub fn remove_conversation(&mut self, conversation_id: &str) -> bool {
        self.conversations.retain(|c| c.id != conversation_id);
        if self.is_active(conversation_id) {
            self.deactivate();
            return true;
        }
        false
    }
}

fn bump(conversation: &mut Conversation, message: &Message) {
    conversation.message_count += 1;
    if message.timestamp > conversation.updated_at {
        conversation.updated_at = message.timestamp;
    }
}
