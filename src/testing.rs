//! Fixtures shared by the unit tests: an in-memory transport and a loopback
//! websocket server that behaves like the backend's `/ws/{id}` endpoint.

use async_trait::async_trait;
use chrono::{ TimeZone, Utc };
use futures::{ SinkExt, StreamExt };
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::{ broadcast, mpsc };
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::api::Transport;
use crate::error::{ ClientError, Result };
use crate::models::chat::{ AudioUpload, Conversation, Message, Role, SearchResult, Summary };
use crate::recording::AudioClip;
use crate::sync::SyncNotification;

const WAIT: Duration = Duration::from_secs(5);

pub fn conversation(id: &str) -> Conversation {
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    Conversation {
        id: id.to_string(),
        title: format!("Visit {}", id),
        doctor_language: "en".to_string(),
        patient_language: "es".to_string(),
        created_at: at,
        updated_at: at,
        message_count: 0,
    }
}

pub fn message(id: &str, conversation_id: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        role: Role::Doctor,
        original_text: format!("text of {}", id),
        translated_text: format!("texto de {}", id),
        original_language: "en".to_string(),
        translated_language: "es".to_string(),
        audio_url: None,
        translated_audio_url: None,
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 9, 5, 0).unwrap(),
    }
}

pub fn message_json(id: &str, conversation_id: &str) -> String {
    serde_json::to_string(&message(id, conversation_id)).unwrap()
}

pub async fn recv_within<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv()).await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn wait_for<F>(
    rx: &mut broadcast::Receiver<SyncNotification>,
    mut matches: F
) -> SyncNotification
    where F: FnMut(&SyncNotification) -> bool
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let note = tokio::time::timeout_at(deadline, rx.recv()).await
            .expect("timed out waiting for notification")
            .expect("notification channel closed");
        if matches(&note) {
            return note;
        }
    }
}

type Sent = (String, Role, String, Option<String>);
type HistoryHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    conversations: Vec<Conversation>,
    histories: HashMap<String, Vec<Message>>,
    reply: Option<Message>,
    sent: Vec<Sent>,
    searches: Vec<String>,
    renames: usize,
    next_id: usize,
    history_hook: Option<HistoryHook>,
}

/// Transport double. Sends fail with a connection error unless a reply was
/// queued with [`FakeTransport::reply_with`].
pub struct FakeTransport {
    stream_base: String,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new(stream_base: &str) -> Self {
        Self {
            stream_base: stream_base.trim_end_matches('/').to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Streams point at a closed port.
    pub fn unreachable() -> Self {
        Self::new("ws://127.0.0.1:9")
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.state.lock().unwrap().conversations.push(conversation);
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.state.lock().unwrap().histories.insert(conversation_id.to_string(), messages);
    }

    /// Runs `hook` each time history is read, before the result is returned.
    pub fn on_history(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.state.lock().unwrap().history_hook = Some(Arc::new(hook));
    }

    pub fn reply_with(&self, message: Message) {
        self.state.lock().unwrap().reply = Some(message);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn searches(&self) -> Vec<String> {
        self.state.lock().unwrap().searches.clone()
    }

    pub fn rename_calls(&self) -> usize {
        self.state.lock().unwrap().renames
    }

    fn not_found(id: &str) -> ClientError {
        ClientError::Status {
            status: 404,
            body: format!("{} not found", id),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
        title: Option<&str>
    ) -> Result<Conversation> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let mut created = conversation(&format!("new-{}", state.next_id));
        created.title = title.unwrap_or(crate::models::chat::DEFAULT_TITLE).to_string();
        created.doctor_language = doctor_language.to_string();
        created.patient_language = patient_language.to_string();
        state.conversations.insert(0, created.clone());
        Ok(created)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.state.lock().unwrap().conversations.clone())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.state.lock().unwrap()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
            .ok_or_else(|| Self::not_found(conversation_id))
    }

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<Conversation> {
        let mut state = self.state.lock().unwrap();
        state.renames += 1;
        let existing = state.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| Self::not_found(conversation_id))?;
        existing.title = title.to_string();
        Ok(existing.clone())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.conversations.len();
        state.conversations.retain(|c| c.id != conversation_id);
        if state.conversations.len() == before {
            return Err(Self::not_found(conversation_id));
        }
        Ok(())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        audio_url: Option<&str>
    ) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        state.sent.push((
            conversation_id.to_string(),
            role,
            text.to_string(),
            audio_url.map(str::to_string),
        ));
        state.reply
            .clone()
            .ok_or_else(||
                ClientError::Io(
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")
                )
            )
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let (history, hook) = {
            let state = self.state.lock().unwrap();
            (
                state.histories.get(conversation_id).cloned().unwrap_or_default(),
                state.history_hook.clone(),
            )
        };
        if let Some(hook) = hook {
            hook(conversation_id);
        }
        Ok(history)
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let mut state = self.state.lock().unwrap();
        state.searches.push(query.to_string());
        let needle = query.to_lowercase();
        let results = state.histories
            .values()
            .flatten()
            .filter(|m| {
                m.original_text.to_lowercase().contains(&needle) ||
                    m.translated_text.to_lowercase().contains(&needle)
            })
            .map(|m| SearchResult {
                conversation_id: m.conversation_id.clone(),
                conversation_title: format!("Visit {}", m.conversation_id),
                message_id: m.id.clone(),
                role: m.role,
                original_text: m.original_text.clone(),
                translated_text: m.translated_text.clone(),
                timestamp: m.timestamp,
                context_before: String::new(),
                context_after: String::new(),
            })
            .collect();
        Ok(results)
    }

    async fn generate_summary(&self, conversation_id: &str) -> Result<Summary> {
        let state = self.state.lock().unwrap();
        let count = state.histories.get(conversation_id).map(|h| h.len()).unwrap_or(0);
        Ok(Summary {
            summary: format!("{} messages exchanged", count),
            message_count: count as u64,
        })
    }

    async fn upload_audio(&self, clip: &AudioClip) -> Result<AudioUpload> {
        let filename = format!("{}.webm", clip.id);
        Ok(AudioUpload {
            url: format!("/api/audio/{}", filename),
            filename,
            size: Some(clip.bytes.len() as u64),
        })
    }

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>> {
        Ok(reference.as_bytes().to_vec())
    }

    fn stream_url(&self, conversation_id: &str) -> Result<Url> {
        Ok(Url::parse(&format!("{}/ws/{}", self.stream_base, conversation_id))?)
    }
}

#[derive(Debug, Clone)]
enum Outbound {
    Text(String, String),
    Disconnect(String),
}

#[derive(Default)]
struct ServerLog {
    received: Vec<(String, String)>,
    closed: Vec<String>,
}

/// Websocket server on 127.0.0.1 that answers `ping` with `pong` and lets a
/// test push frames to whoever is connected for a conversation.
pub struct LoopbackServer {
    addr: SocketAddr,
    outbound: broadcast::Sender<Outbound>,
    log: Arc<Mutex<ServerLog>>,
}

impl LoopbackServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outbound, _) = broadcast::channel(64);
        let log = Arc::new(Mutex::new(ServerLog::default()));

        let accept_outbound = outbound.clone();
        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let rx = accept_outbound.subscribe();
                tokio::spawn(serve(stream, rx, accept_log.clone()));
            }
        });

        Self { addr, outbound, log }
    }

    pub fn base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn url_for(&self, conversation_id: &str) -> Url {
        Url::parse(&format!("{}/ws/{}", self.base(), conversation_id)).unwrap()
    }

    pub fn push(&self, conversation_id: &str, text: &str) {
        let _ = self.outbound.send(Outbound::Text(conversation_id.to_string(), text.to_string()));
    }

    /// Detached `push` for use inside transport hooks.
    pub fn pusher(&self) -> impl Fn(&str, &str) + Send + Sync + 'static {
        let outbound = self.outbound.clone();
        move |conversation_id: &str, text: &str| {
            let _ = outbound.send(Outbound::Text(conversation_id.to_string(), text.to_string()));
        }
    }

    pub fn disconnect(&self, conversation_id: &str) {
        let _ = self.outbound.send(Outbound::Disconnect(conversation_id.to_string()));
    }

    pub async fn wait_received(&self, conversation_id: &str, text: &str, count: usize) {
        self.wait_until(|log| {
            log.received
                .iter()
                .filter(|(c, t)| c == conversation_id && t == text)
                .count() >= count
        }).await;
    }

    pub async fn wait_closed(&self, conversation_id: &str) {
        self.wait_until(|log| log.closed.iter().any(|c| c == conversation_id)).await;
    }

    async fn wait_until<F>(&self, check: F) where F: Fn(&ServerLog) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.log.lock().unwrap()) {
            assert!(tokio::time::Instant::now() < deadline, "loopback server condition timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn serve(stream: TcpStream, mut outbound: broadcast::Receiver<Outbound>, log: Arc<Mutex<ServerLog>>) {
    let path = Arc::new(Mutex::new(String::new()));
    let slot = path.clone();
    let callback = move |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        *slot.lock().unwrap() = req.uri().path().to_string();
        Ok(response)
    };
    let websocket = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let conversation_id = path.lock().unwrap().trim_start_matches("/ws/").to_string();
    let (mut tx, mut rx) = websocket.split();

    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Ok(Outbound::Text(target, text)) if target == conversation_id => {
                        if tx.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Outbound::Disconnect(target)) if target == conversation_id => {
                        let _ = tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        log.lock().unwrap().received.push((conversation_id.clone(), text.clone()));
                        if text == "ping" && tx.send(WsMessage::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    log.lock().unwrap().closed.push(conversation_id);
}
