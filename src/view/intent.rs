use std::path::PathBuf;

use crate::error::{ ClientError, Result };
use crate::models::chat::Role;

pub const HELP: &str = "\
Type a message and press enter to send it as the current role.
  /role doctor|patient          switch speaking role
  /new [<doctor> <patient> [title]]  start a conversation (language codes)
  /list                         list conversations
  /open <id>                    switch to a conversation
  /rename <title>               rename the open conversation
  /delete [id]                  delete a conversation (default: open one)
  /search <query>               search every conversation
  /summary                      summarise the open conversation
  /audio <file>                 send a recorded clip
  /play <message id>            save a message's translated audio
  /close                        leave the open conversation
  /help                         show this help
  /quit                         exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Send(String),
    SetRole(Role),
    /// `None` languages fall back to the configured pair.
    New {
        languages: Option<(String, String)>,
        title: Option<String>,
    },
    List,
    Open(String),
    Rename(String),
    Delete(Option<String>),
    Search(String),
    Summary,
    Audio(PathBuf),
    Play(String),
    Close,
    Help,
    Quit,
    Nothing,
}

impl Intent {
    pub fn parse(line: &str) -> Result<Intent> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Intent::Nothing);
        }
        if !line.starts_with('/') {
            return Ok(Intent::Send(line.to_string()));
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let intent = match command {
            "/role" => {
                let role = rest.parse::<Role>().map_err(|e| ClientError::validation(e.to_string()))?;
                Intent::SetRole(role)
            }
            "/new" => {
                let mut words = rest.splitn(3, char::is_whitespace);
                let doctor_language = words.next().filter(|w| !w.is_empty());
                let patient_language = words.next().filter(|w| !w.is_empty());
                match (doctor_language, patient_language) {
                    (None, _) => Intent::New { languages: None, title: None },
                    (Some(doctor), Some(patient)) =>
                        Intent::New {
                            languages: Some((doctor.to_string(), patient.to_string())),
                            title: words
                                .next()
                                .map(str::trim)
                                .filter(|t| !t.is_empty())
                                .map(str::to_string),
                        },
                    _ => {
                        return Err(ClientError::validation("Usage: /new [<doctor_lang> <patient_lang> [title]]"));
                    }
                }
            }
            "/list" => Intent::List,
            "/open" => Intent::Open(required(rest, "/open <conversation id>")?),
            "/rename" => Intent::Rename(required(rest, "/rename <title>")?),
            "/delete" => Intent::Delete(Some(rest.to_string()).filter(|r| !r.is_empty())),
            "/search" => Intent::Search(rest.to_string()),
            "/summary" => Intent::Summary,
            "/audio" => Intent::Audio(PathBuf::from(required(rest, "/audio <file>")?)),
            "/play" => Intent::Play(required(rest, "/play <message id>")?),
            "/close" => Intent::Close,
            "/help" => Intent::Help,
            "/quit" | "/exit" => Intent::Quit,
            other => {
                return Err(ClientError::validation(format!("Unknown command {} (try /help)", other)));
            }
        };
        Ok(intent)
    }
}

fn required(rest: &str, usage: &str) -> Result<String> {
    if rest.is_empty() {
        return Err(ClientError::validation(format!("Usage: {}", usage)));
    }
    Ok(rest.to_string())
}
