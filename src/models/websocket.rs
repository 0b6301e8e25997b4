use crate::models::chat::Message;

/// Liveness payload the client sends on the stream.
pub const PING: &str = "ping";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Message(Message),
    /// Anything that does not decode as a message (`pong`, truncated json, ...).
    Noise,
}

impl StreamFrame {
    pub fn parse(text: &str) -> StreamFrame {
        match serde_json::from_str::<Message>(text) {
            Ok(message) => StreamFrame::Message(message),
            Err(_) => StreamFrame::Noise,
        }
    }
}
