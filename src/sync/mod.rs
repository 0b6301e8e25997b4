pub mod channel;
pub mod reconnect;

use log::{ debug, info, warn, error };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ broadcast, mpsc, oneshot };

use crate::api::Transport;
use crate::error::{ ClientError, Result };
use crate::models::chat::{ Conversation, Message, Role };
use crate::recording::AudioClip;
use crate::store::ConversationStore;

pub use self::channel::{ ChannelHandle, ChannelId, ChannelState };

const EVENT_QUEUE: usize = 64;
const NOTIFICATION_QUEUE: usize = 256;
/// Stream messages held while history loads. Past this they are applied directly.
const PENDING_LIMIT: usize = 256;
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub heartbeat: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

/// What the view hears about. Messages arrive in acceptance order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    ConversationActivated(Conversation),
    ConversationClosed(String),
    MessageAppended(Message),
    ChannelStateChanged {
        conversation_id: String,
        state: ChannelState,
    },
    /// The current channel closed from the remote side while its
    /// conversation is still displayed.
    StreamDropped {
        conversation_id: String,
    },
    ConversationsChanged(Vec<Conversation>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub active: Option<Conversation>,
    pub messages: Vec<Message>,
    pub conversations: Vec<Conversation>,
    pub channel: ChannelState,
}

#[derive(Debug)]
pub enum SyncEvent {
    /// `reply` resolves once the new channel is open or has failed. It gets
    /// `false` when another activation supersedes this one first.
    Activate {
        conversation: Conversation,
        reply: oneshot::Sender<bool>,
    },
    History {
        conversation_id: String,
        messages: Vec<Message>,
    },
    Deactivate {
        reply: oneshot::Sender<Option<Conversation>>,
    },
    Reopen {
        conversation_id: String,
        reply: oneshot::Sender<bool>,
    },
    Deliver {
        message: Message,
        reply: oneshot::Sender<bool>,
    },
    Streamed {
        channel: ChannelId,
        conversation_id: String,
        message: Message,
    },
    ChannelState {
        channel: ChannelId,
        conversation_id: String,
        state: ChannelState,
    },
    Conversations(Vec<Conversation>),
    UpsertConversation(Conversation),
    RemoveConversation {
        conversation_id: String,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Single writer of the conversation store. Every event runs to completion
/// before the next is taken off the queue.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    store: ConversationStore,
    channel: Option<ChannelHandle>,
    channel_state: ChannelState,
    next_channel: ChannelId,
    /// Waiter for the current channel to leave `Connecting`.
    settle: Option<(ChannelId, oneshot::Sender<bool>)>,
    /// Stream deliveries held back until history for the activation lands.
    pending: Option<Vec<Message>>,
    config: SyncConfig,
    events: mpsc::WeakSender<SyncEvent>,
    notifications: broadcast::Sender<SyncNotification>,
}

impl SyncEngine {
    /// Starts the engine task. It stops once every handle has been dropped.
    pub fn spawn(transport: Arc<dyn Transport>, config: SyncConfig) -> SyncHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (notifications, _) = broadcast::channel(NOTIFICATION_QUEUE);
        let engine = SyncEngine {
            transport: transport.clone(),
            store: ConversationStore::new(),
            channel: None,
            channel_state: ChannelState::Closed,
            next_channel: 1,
            settle: None,
            pending: None,
            config,
            events: events_tx.downgrade(),
            notifications: notifications.clone(),
        };
        tokio::spawn(engine.run(events_rx));
        SyncHandle {
            events: events_tx,
            notifications,
            transport,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>) {
        info!("Sync engine started (heartbeat {:?})", self.config.heartbeat);
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        self.close_channel();
        info!("Sync engine stopped");
    }

    fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Activate { conversation, reply } => {
                self.close_channel();
                info!("Activating conversation {} ({})", conversation.id, conversation.title);
                let id = conversation.id.clone();
                self.store.activate(conversation.clone());
                self.pending = Some(Vec::new());
                self.notify(SyncNotification::ConversationActivated(conversation));
                self.open_channel(&id, reply);
            }
            SyncEvent::History { conversation_id, messages } => {
                if !self.store.is_active(&conversation_id) {
                    debug!("Discarding history for inactive conversation {}", conversation_id);
                    return;
                }
                let count = messages.len();
                for message in messages {
                    self.accept(message);
                }
                let flushed = self.flush_pending();
                debug!(
                    "History for {} applied ({} loaded, {} buffered from stream)",
                    conversation_id,
                    count,
                    flushed
                );
            }
            SyncEvent::Deactivate { reply } => {
                self.close_channel();
                self.pending = None;
                let closed = self.store.deactivate();
                if let Some(conversation) = &closed {
                    info!("Closed conversation {}", conversation.id);
                    self.notify(SyncNotification::ConversationClosed(conversation.id.clone()));
                }
                let _ = reply.send(closed);
            }
            SyncEvent::Reopen { conversation_id, reply } => {
                if !self.store.is_active(&conversation_id) || self.channel.is_some() {
                    let _ = reply.send(false);
                    return;
                }
                // Hold stream deliveries until the backfill lands, keeping
                // anything an unfinished activation already buffered.
                self.pending.get_or_insert_with(Vec::new);
                self.open_channel(&conversation_id, reply);
            }
            SyncEvent::Deliver { message, reply } => {
                let inserted = self.accept(message);
                let _ = reply.send(inserted);
            }
            SyncEvent::Streamed { channel, conversation_id, message } => {
                if !self.is_current(channel, &conversation_id) {
                    debug!(
                        "Dropping message {} from stale channel {} ({})",
                        message.id,
                        channel,
                        conversation_id
                    );
                    return;
                }
                match self.pending.as_ref().map(Vec::len) {
                    None => {
                        self.accept(message);
                    }
                    Some(held) if held < PENDING_LIMIT => {
                        if let Some(buffer) = self.pending.as_mut() {
                            buffer.push(message);
                        }
                    }
                    Some(held) => {
                        warn!(
                            "History for {} still missing after {} stream messages, applying them directly",
                            conversation_id,
                            held
                        );
                        self.flush_pending();
                        self.accept(message);
                    }
                }
            }
            SyncEvent::ChannelState { channel, conversation_id, state } => {
                if !self.is_current(channel, &conversation_id) {
                    return;
                }
                self.channel_state = state;
                self.notify(SyncNotification::ChannelStateChanged {
                    conversation_id: conversation_id.clone(),
                    state,
                });
                if state != ChannelState::Connecting {
                    self.settled(channel);
                }
                if state == ChannelState::Closed {
                    self.channel = None;
                    warn!("Stream for conversation {} dropped", conversation_id);
                    self.notify(SyncNotification::StreamDropped { conversation_id });
                }
            }
            SyncEvent::Conversations(conversations) => {
                self.store.set_conversations(conversations);
                self.notify_conversations();
            }
            SyncEvent::UpsertConversation(conversation) => {
                self.store.upsert_conversation(conversation);
                self.notify_conversations();
            }
            SyncEvent::RemoveConversation { conversation_id, reply } => {
                let was_active = self.store.is_active(&conversation_id);
                if was_active {
                    self.close_channel();
                    self.pending = None;
                }
                self.store.remove_conversation(&conversation_id);
                if was_active {
                    self.notify(SyncNotification::ConversationClosed(conversation_id));
                }
                self.notify_conversations();
                let _ = reply.send(was_active);
            }
            SyncEvent::Snapshot { reply } => {
                let _ = reply.send(Snapshot {
                    active: self.store.active().cloned(),
                    messages: self.store.messages().to_vec(),
                    conversations: self.store.conversations().to_vec(),
                    channel: self.channel_state,
                });
            }
        }
    }

    /// The one place messages enter the store.
    fn accept(&mut self, message: Message) -> bool {
        let inserted = self.store.apply_incoming(message.clone());
        if inserted {
            self.notify(SyncNotification::MessageAppended(message));
        }
        inserted
    }

    fn flush_pending(&mut self) -> usize {
        let buffered = self.pending.take().unwrap_or_default();
        let count = buffered.len();
        for message in buffered {
            self.accept(message);
        }
        count
    }

    fn settled(&mut self, channel: ChannelId) {
        if matches!(&self.settle, Some((id, _)) if *id == channel) {
            if let Some((_, waiter)) = self.settle.take() {
                let _ = waiter.send(true);
            }
        }
    }

    fn is_current(&self, channel: ChannelId, conversation_id: &str) -> bool {
        match &self.channel {
            Some(handle) =>
                handle.id == channel &&
                    handle.conversation_id == conversation_id &&
                    self.store.is_active(conversation_id),
            None => false,
        }
    }

    fn open_channel(&mut self, conversation_id: &str, settle: oneshot::Sender<bool>) {
        let url = match self.transport.stream_url(conversation_id) {
            Ok(url) => url,
            Err(e) => {
                error!("No stream url for conversation {}: {}", conversation_id, e);
                let _ = settle.send(true);
                return;
            }
        };
        let id = self.next_channel;
        self.next_channel += 1;
        self.channel_state = ChannelState::Connecting;
        self.channel = Some(
            ChannelHandle::spawn(
                id,
                conversation_id.to_string(),
                url,
                self.config.heartbeat,
                self.events.clone()
            )
        );
        self.settle = Some((id, settle));
    }

    fn close_channel(&mut self) {
        if let Some((_, waiter)) = self.settle.take() {
            let _ = waiter.send(false);
        }
        if let Some(handle) = self.channel.take() {
            debug!("Closing channel {} for {}", handle.id, handle.conversation_id);
            let conversation_id = handle.conversation_id.clone();
            handle.close();
            if self.channel_state != ChannelState::Closed {
                self.notify(SyncNotification::ChannelStateChanged {
                    conversation_id,
                    state: ChannelState::Closed,
                });
            }
        }
        self.channel_state = ChannelState::Closed;
    }

    fn notify(&self, notification: SyncNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    fn notify_conversations(&self) {
        self.notify(SyncNotification::ConversationsChanged(self.store.conversations().to_vec()));
    }
}

/// Cloneable entry point to a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    events: mpsc::Sender<SyncEvent>,
    notifications: broadcast::Sender<SyncNotification>,
    transport: Arc<dyn Transport>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn post(&self, event: SyncEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| ClientError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SyncEvent) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Switches the view to `conversation`: the previous channel is closed,
    /// a new one is opened, and history is loaded once that channel is open
    /// (or has failed). A failed history load is returned but leaves the
    /// conversation active with its live stream.
    pub async fn open_conversation(&self, conversation: Conversation) -> Result<()> {
        let conversation_id = conversation.id.clone();
        let settled = self.request(|reply| SyncEvent::Activate { conversation, reply }).await?;
        if !settled {
            debug!("Activation of {} superseded before its stream settled", conversation_id);
            return Ok(());
        }
        self.load_history(&conversation_id).await
    }

    pub async fn open_conversation_by_id(&self, conversation_id: &str) -> Result<Conversation> {
        let conversation = self.transport.get_conversation(conversation_id).await?;
        self.open_conversation(conversation.clone()).await?;
        Ok(conversation)
    }

    pub async fn close_conversation(&self) -> Result<Option<Conversation>> {
        self.request(|reply| SyncEvent::Deactivate { reply }).await
    }

    /// Opens a fresh channel for the active conversation if it has none, then
    /// backfills whatever was sent while the stream was down.
    pub async fn reopen_stream(&self, conversation_id: &str) -> Result<bool> {
        let id = conversation_id.to_string();
        let reopened = self.request(|reply| SyncEvent::Reopen { conversation_id: id, reply }).await?;
        if reopened {
            self.load_history(conversation_id).await?;
        }
        Ok(reopened)
    }

    /// Only called once the conversation's stream is listening, so a message
    /// created after the query is delivered on the stream instead.
    async fn load_history(&self, conversation_id: &str) -> Result<()> {
        let (messages, outcome) = match self.transport.list_messages(conversation_id).await {
            Ok(messages) => (messages, Ok(())),
            Err(e) => {
                error!("Failed to load messages for {}: {}", conversation_id, e);
                (Vec::new(), Err(e))
            }
        };
        let conversation_id = conversation_id.to_string();
        self.post(SyncEvent::History { conversation_id, messages }).await?;
        outcome
    }

    /// Runs `message` through the store's dedup. Returns whether it was inserted.
    pub async fn apply_incoming(&self, message: Message) -> Result<bool> {
        self.request(|reply| SyncEvent::Deliver { message, reply }).await
    }

    /// Sends a message and merges the server's copy. On failure nothing in
    /// the store changes; restoring the typed text is up to the caller.
    pub async fn send(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        audio_url: Option<&str>
    ) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() && audio_url.is_none() {
            return Err(ClientError::validation("Message text is empty"));
        }
        let message = self.transport.send_message(conversation_id, role, text, audio_url).await?;
        let inserted = self.apply_incoming(message.clone()).await?;
        debug!("Sent message {} (inserted: {})", message.id, inserted);
        Ok(message)
    }

    pub async fn send_audio(
        &self,
        conversation_id: &str,
        role: Role,
        clip: &AudioClip
    ) -> Result<Message> {
        if clip.is_empty() {
            return Err(ClientError::validation("Recording is empty"));
        }
        let upload = self.transport.upload_audio(clip).await?;
        debug!("Uploaded clip {} as {}", clip.id, upload.url);
        self.send(conversation_id, role, "", Some(&upload.url)).await
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations = self.transport.list_conversations().await?;
        self.post(SyncEvent::Conversations(conversations.clone())).await?;
        Ok(conversations)
    }

    pub async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
        title: Option<&str>
    ) -> Result<Conversation> {
        let doctor_language = doctor_language.trim();
        let patient_language = patient_language.trim();
        if doctor_language.is_empty() || patient_language.is_empty() {
            return Err(ClientError::validation("Both languages are required"));
        }
        let conversation = self.transport.create_conversation(
            doctor_language,
            patient_language,
            title
        ).await?;
        info!("Created conversation {}", conversation.id);
        self.post(SyncEvent::UpsertConversation(conversation.clone())).await?;
        Ok(conversation)
    }

    /// Returns `Ok(None)` without calling the backend when the title is
    /// empty or unchanged.
    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str
    ) -> Result<Option<Conversation>> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        let snapshot = self.snapshot().await?;
        let current = snapshot.active
            .iter()
            .chain(snapshot.conversations.iter())
            .find(|c| c.id == conversation_id)
            .map(|c| c.title.clone());
        if current.as_deref() == Some(title) {
            return Ok(None);
        }
        let renamed = self.transport.rename_conversation(conversation_id, title).await?;
        self.post(SyncEvent::UpsertConversation(renamed.clone())).await?;
        Ok(Some(renamed))
    }

    /// Returns true when the deleted conversation was the displayed one.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        self.transport.delete_conversation(conversation_id).await?;
        let conversation_id = conversation_id.to_string();
        self.request(|reply| SyncEvent::RemoveConversation { conversation_id, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| SyncEvent::Snapshot { reply }).await
    }

    #[cfg(test)]
    pub(crate) async fn inject(&self, event: SyncEvent) {
        self.post(event).await.unwrap();
    }
}
