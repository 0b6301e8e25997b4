use clap::Parser;
use std::time::Duration;

use crate::models::chat::Role;
use crate::sync::reconnect::ReconnectPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Backend ---
    /// Base URL of the translation backend (REST under /api, stream under /ws)
    #[arg(long, env = "API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Per-request timeout in seconds for REST calls. Unset means no timeout.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    // --- Streaming ---
    /// Seconds between keep-alive pings on the message stream
    #[arg(long, env = "HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Reopen a dropped stream with exponential backoff (off: stay disconnected)
    #[arg(long, env = "RECONNECT", default_value = "false")]
    pub reconnect: bool,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "RECONNECT_INITIAL_MS", default_value = "1000")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds
    #[arg(long, env = "RECONNECT_MAX_MS", default_value = "30000")]
    pub reconnect_max_ms: u64,

    /// Reconnect attempts before giving up (0 retries forever)
    #[arg(long, env = "RECONNECT_MAX_ATTEMPTS", default_value = "10")]
    pub reconnect_max_attempts: u32,

    // --- Session ---
    /// Role this terminal speaks as (doctor, patient)
    #[arg(long, env = "ROLE", default_value = "doctor")]
    pub role: Role,

    /// Conversation to open on startup
    #[arg(long, env = "CONVERSATION_ID")]
    pub conversation_id: Option<String>,

    /// Doctor language used by a bare /new
    #[arg(long, env = "DOCTOR_LANGUAGE", default_value = "en")]
    pub doctor_language: String,

    /// Patient language used by a bare /new
    #[arg(long, env = "PATIENT_LANGUAGE", default_value = "es")]
    pub patient_language: String,

    // --- Search & Audio ---
    /// Quiet period in milliseconds before a search is sent
    #[arg(long, env = "SEARCH_DEBOUNCE_MS", default_value = "400")]
    pub search_debounce_ms: u64,

    /// Shortest query (after trimming) that reaches the backend
    #[arg(long, env = "SEARCH_MIN_CHARS", default_value = "2")]
    pub search_min_chars: usize,

    /// Largest audio clip accepted for upload, in bytes
    #[arg(long, env = "MAX_RECORDING_BYTES", default_value = "10485760")]
    pub max_recording_bytes: usize,

    // --- General ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn search_delay(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        if !self.reconnect {
            return ReconnectPolicy::Never;
        }
        ReconnectPolicy::Backoff {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            max_attempts: self.reconnect_max_attempts,
        }
    }
}
