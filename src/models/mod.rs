pub mod chat;
pub mod timestamp;
pub mod websocket;
