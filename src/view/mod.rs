pub mod composer;
pub mod intent;
pub mod reconnector;

use log::{ debug, info, warn, error };
use std::error::Error;
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::{ broadcast, mpsc };

use crate::models::chat::{ Conversation, Message, Role, SearchResult };
use crate::recording;
use crate::search::SearchDebouncer;
use crate::sync::reconnect::ReconnectPolicy;
use crate::sync::{ Snapshot, SyncHandle, SyncNotification };

use self::composer::Composer;
use self::intent::{ Intent, HELP };
use self::reconnector::{ ReconnectStep, Reconnector };

#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub reconnect: ReconnectPolicy,
    pub max_recording_bytes: usize,
    pub doctor_language: String,
    pub patient_language: String,
}

/// Line-oriented view over a running sync engine.
pub struct Terminal {
    handle: SyncHandle,
    role: Role,
    composer: Composer,
    search: Arc<SearchDebouncer>,
    reconnector: Reconnector,
    max_recording_bytes: usize,
    default_languages: (String, String),
    active: Option<Conversation>,
}

impl Terminal {
    pub fn new(
        handle: SyncHandle,
        role: Role,
        search: SearchDebouncer,
        options: TerminalOptions
    ) -> (Self, mpsc::Receiver<String>) {
        let (reconnector, reconnect_rx) = Reconnector::new(handle.clone(), &options.reconnect);
        let terminal = Self {
            handle,
            role,
            composer: Composer::new(),
            search: Arc::new(search),
            reconnector,
            max_recording_bytes: options.max_recording_bytes,
            default_languages: (options.doctor_language, options.patient_language),
            active: None,
        };
        (terminal, reconnect_rx)
    }

    pub async fn run(
        mut self,
        mut reconnect_rx: mpsc::Receiver<String>,
        initial: Option<String>
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut notes = self.handle.subscribe();

        match initial {
            Some(conversation_id) => self.open(&conversation_id).await,
            None => self.list().await,
        }
        println!("Speaking as {}. Type /help for commands.", self.role);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if !self.on_line(&line).await {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("Failed to read input: {}", e);
                            break;
                        }
                    }
                }
                note = notes.recv() => {
                    match note {
                        Ok(note) => self.on_notification(note),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("View fell behind by {} updates, redrawing", missed);
                            self.redraw().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                Some(conversation_id) = reconnect_rx.recv() => {
                    if let Err(e) = self.reconnector.reconnect(&conversation_id).await {
                        error!("Reconnect to {} failed: {}", conversation_id, e);
                    }
                }
            }
        }

        if let Err(e) = self.handle.close_conversation().await {
            debug!("Close on exit failed: {}", e);
        }
        Ok(())
    }

    /// Returns false when the user asked to quit.
    async fn on_line(&mut self, line: &str) -> bool {
        let intent = match Intent::parse(line) {
            Ok(intent) => intent,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };

        match intent {
            Intent::Nothing => {
                // enter on an empty line retries a restored message
                if !self.composer.text().is_empty() {
                    self.submit().await;
                }
            }
            Intent::Send(text) => {
                self.composer.set(text);
                self.submit().await;
            }
            Intent::SetRole(role) => {
                self.role = role;
                self.print_role();
            }
            Intent::New { languages, title } => {
                let (doctor_language, patient_language) = languages.unwrap_or_else(||
                    self.default_languages.clone()
                );
                self.create(&doctor_language, &patient_language, title.as_deref()).await;
            }
            Intent::List => self.list().await,
            Intent::Open(conversation_id) => self.open(&conversation_id).await,
            Intent::Rename(title) => self.rename(&title).await,
            Intent::Delete(conversation_id) => self.delete(conversation_id).await,
            Intent::Search(query) => self.search(query),
            Intent::Summary => self.summary().await,
            Intent::Audio(path) => self.send_audio(&path).await,
            Intent::Play(message_id) => self.play(&message_id).await,
            Intent::Close => {
                if let Err(e) = self.handle.close_conversation().await {
                    error!("Close failed: {}", e);
                }
            }
            Intent::Help => println!("{}", HELP),
            Intent::Quit => {
                return false;
            }
        }
        true
    }

    fn on_notification(&mut self, note: SyncNotification) {
        match self.reconnector.observe(&note) {
            Some(ReconnectStep::GaveUp) | Some(ReconnectStep::Disabled) => {
                println!("Live updates stopped. Reopen the conversation to resume.");
            }
            Some(ReconnectStep::Scheduled(_)) | None => {}
        }

        match note {
            SyncNotification::MessageAppended(message) => {
                println!("{}", render_message(&message));
            }
            SyncNotification::ConversationActivated(conversation) => {
                println!("{}", header(&conversation));
                self.active = Some(conversation);
                self.print_role();
            }
            SyncNotification::ConversationClosed(conversation_id) => {
                if self.active_id() == Some(conversation_id.as_str()) {
                    self.active = None;
                    println!("== conversation {} closed", conversation_id);
                }
            }
            SyncNotification::ChannelStateChanged { conversation_id, state } => {
                debug!("Stream for {} is {:?}", conversation_id, state);
            }
            SyncNotification::StreamDropped { conversation_id } => {
                debug!("Stream for {} dropped", conversation_id);
            }
            SyncNotification::ConversationsChanged(conversations) => {
                if let Some(active) = self.active.as_mut() {
                    if let Some(fresh) = conversations.iter().find(|c| c.id == active.id) {
                        active.title = fresh.title.clone();
                    }
                }
            }
        }
    }

    fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|c| c.id.as_str())
    }

    fn require_active(&self) -> Option<String> {
        let id = self.active_id().map(str::to_string);
        if id.is_none() {
            println!("Open or create a conversation first (/list, /open, /new).");
        }
        id
    }

    fn print_role(&self) {
        match &self.active {
            Some(conversation) =>
                println!(
                    "Speaking as {} ({}), translating for {} ({})",
                    self.role,
                    conversation.language_of(self.role),
                    self.role.other(),
                    conversation.language_of(self.role.other())
                ),
            None => println!("Speaking as {}", self.role),
        }
    }

    async fn submit(&mut self) {
        let Some(conversation_id) = self.require_active() else {
            return;
        };
        let Some(text) = self.composer.take() else {
            return;
        };
        if let Err(e) = self.handle.send(&conversation_id, self.role, &text, None).await {
            error!("Send failed: {}", e);
            self.composer.restore(text);
            println!("Not sent: \"{}\". Press enter to retry.", self.composer.text());
        }
    }

    async fn create(&mut self, doctor_language: &str, patient_language: &str, title: Option<&str>) {
        match self.handle.create_conversation(doctor_language, patient_language, title).await {
            Ok(conversation) => {
                if let Err(e) = self.handle.open_conversation(conversation).await {
                    error!("Failed to open new conversation: {}", e);
                }
            }
            Err(e) => {
                eprintln!("\n!! Could not create conversation: {}\n", e);
            }
        }
    }

    async fn list(&mut self) {
        match self.handle.refresh_conversations().await {
            Ok(conversations) if conversations.is_empty() => {
                println!("No conversations yet. Start one with /new <doctor_lang> <patient_lang>.");
            }
            Ok(conversations) => {
                for conversation in &conversations {
                    let marker = if self.active_id() == Some(conversation.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{} {}  {}  ({} <-> {}, {} messages, updated {})",
                        marker,
                        conversation.id,
                        conversation.title,
                        conversation.doctor_language,
                        conversation.patient_language,
                        conversation.message_count,
                        conversation.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Err(e) => error!("Failed to load conversations: {}", e),
        }
    }

    async fn open(&mut self, conversation_id: &str) {
        if let Err(e) = self.handle.open_conversation_by_id(conversation_id).await {
            error!("Failed to open conversation {}: {}", conversation_id, e);
        }
    }

    async fn rename(&mut self, title: &str) {
        let Some(conversation_id) = self.require_active() else {
            return;
        };
        match self.handle.rename_conversation(&conversation_id, title).await {
            Ok(Some(renamed)) => println!("== renamed to {}", renamed.title),
            Ok(None) => debug!("Rename skipped, title unchanged"),
            Err(e) => error!("Rename failed: {}", e),
        }
    }

    async fn delete(&mut self, conversation_id: Option<String>) {
        let Some(target) = conversation_id.or_else(|| self.require_active()) else {
            return;
        };
        match self.handle.delete_conversation(&target).await {
            Ok(_) => println!("== deleted {}", target),
            Err(e) => error!("Delete failed: {}", e),
        }
    }

    fn search(&self, query: String) {
        let search = self.search.clone();
        tokio::spawn(async move {
            match search.search(&query).await {
                Ok(Some(results)) => print_results(query.trim(), &results),
                Ok(None) => {}
                Err(e) => error!("Search failed: {}", e),
            }
        });
    }

    async fn summary(&mut self) {
        let Some(conversation_id) = self.require_active() else {
            return;
        };
        println!("Generating summary...");
        match self.handle.transport().generate_summary(&conversation_id).await {
            Ok(summary) => {
                println!("== summary of {} messages", summary.message_count);
                println!("{}", summary.summary);
            }
            Err(e) => error!("Summary failed: {}", e),
        }
    }

    async fn send_audio(&mut self, path: &Path) {
        let Some(conversation_id) = self.require_active() else {
            return;
        };
        let clip = match recording::clip_from_file(path, self.max_recording_bytes).await {
            Ok(clip) => clip,
            Err(e) => {
                error!("Cannot send {}: {}", path.display(), e);
                return;
            }
        };

        info!("Sending {} ({} bytes)", path.display(), clip.bytes.len());
        if let Err(e) = self.handle.send_audio(&conversation_id, self.role, &clip).await {
            error!("Audio send failed: {}", e);
        }
    }

    async fn play(&mut self, message_id: &str) {
        let snapshot = match self.handle.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        let reference = snapshot.messages
            .iter()
            .find(|m| m.id == message_id)
            .and_then(|m| m.translated_audio_url.clone().or_else(|| m.audio_url.clone()));
        let Some(reference) = reference else {
            println!("No audio for message {}", message_id);
            return;
        };

        match self.handle.transport().fetch_audio(&reference).await {
            Ok(bytes) => {
                let target = audio_target(message_id, &reference);
                match tokio::fs::write(&target, &bytes).await {
                    Ok(()) => println!("Saved audio to {}", target.display()),
                    Err(e) => error!("Cannot write {}: {}", target.display(), e),
                }
            }
            Err(e) => error!("Audio download failed: {}", e),
        }
    }

    async fn redraw(&mut self) {
        match self.handle.snapshot().await {
            Ok(snapshot) => {
                self.active = snapshot.active.clone();
                println!("{}", transcript(&snapshot));
            }
            Err(e) => error!("Redraw failed: {}", e),
        }
    }
}

fn header(conversation: &Conversation) -> String {
    format!(
        "== {} [{}] {} <-> {}",
        conversation.title,
        conversation.id,
        conversation.doctor_language,
        conversation.patient_language
    )
}

/// Everything the store holds for the open conversation, header first.
pub fn transcript(snapshot: &Snapshot) -> String {
    let mut lines = vec![match &snapshot.active {
        Some(conversation) => header(conversation),
        None => "== no conversation open".to_string(),
    }];
    lines.extend(snapshot.messages.iter().map(render_message));
    lines.join("\n")
}

pub fn render_message(message: &Message) -> String {
    let mut line = format!(
        "[{}] {:<7} {}\n                ({} -> {}) {}",
        message.timestamp.format("%H:%M"),
        message.role.as_str(),
        message.original_text,
        message.original_language,
        message.translated_language,
        message.translated_text
    );
    if message.audio_url.is_some() || message.translated_audio_url.is_some() {
        line.push_str(&format!("  [audio: /play {}]", message.id));
    }
    line
}

fn print_results(query: &str, results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found for \"{}\"", query);
        return;
    }
    println!("== {} results for \"{}\"", results.len(), query);
    for result in results {
        println!(
            "  {} [{}] {}: {} / {}",
            result.conversation_title,
            result.conversation_id,
            result.role,
            result.original_text,
            result.translated_text
        );
    }
}

fn audio_target(message_id: &str, reference: &str) -> PathBuf {
    let extension = Path::new(reference.split('?').next().unwrap_or(reference))
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav");
    PathBuf::from(format!("{}.{}", message_id, extension))
}
