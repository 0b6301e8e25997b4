use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::Patient => "patient",
        }
    }

    pub fn other(&self) -> Role {
        match self {
            Role::Doctor => Role::Patient,
            Role::Patient => Role::Doctor,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseRoleError {
    message: String,
}

impl fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseRoleError {}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "doctor" => Ok(Role::Doctor),
            "patient" => Ok(Role::Patient),
            _ =>
                Err(ParseRoleError {
                    message: format!("Invalid role: '{}' (expected doctor or patient)", s),
                }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub doctor_language: String,
    pub patient_language: String,
    #[serde(with = "super::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "super::timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
}

impl Conversation {
    /// Language a message from `role` is written in.
    pub fn language_of(&self, role: Role) -> &str {
        match role {
            Role::Doctor => &self.doctor_language,
            Role::Patient => &self.patient_language,
        }
    }
}

/// One translated turn. Immutable once the server has assigned its id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub original_text: String,
    pub translated_text: String,
    pub original_language: String,
    pub translated_language: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub translated_audio_url: Option<String>,
    #[serde(with = "super::timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub conversation_id: String,
    pub conversation_title: String,
    pub message_id: String,
    pub role: Role,
    pub original_text: String,
    pub translated_text: String,
    #[serde(with = "super::timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context_before: String,
    #[serde(default)]
    pub context_after: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub message_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioUpload {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateConversationRequest<'a> {
    pub title: &'a str,
    pub doctor_language: &'a str,
    pub patient_language: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RenameConversationRequest<'a> {
    pub title: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    pub conversation_id: &'a str,
    pub role: Role,
    pub text: &'a str,
    pub audio_url: Option<&'a str>,
}
