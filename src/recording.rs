use log::{ debug, warn };
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ ClientError, Result };

pub const CLIP_MIME: &str = "audio/webm";
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
const FILE_CHUNK: usize = 16 * 1024;

/// A finished recording, ready to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub id: Uuid,
    pub bytes: Vec<u8>,
    pub mime: String,
    pub duration: Duration,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, duration: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes,
            mime: CLIP_MIME.to_string(),
            duration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopped,
}

#[derive(Debug)]
pub struct RecordingSession {
    state: RecordingState,
    chunks: Vec<Vec<u8>>,
    buffered: usize,
    max_bytes: usize,
    started_at: Option<Instant>,
    clip: Option<AudioClip>,
}

impl RecordingSession {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: RecordingState::Idle,
            chunks: Vec::new(),
            buffered: 0,
            max_bytes,
            started_at: None,
            clip: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Starting discards any clip from a previous take.
    pub fn start(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
        self.clip = None;
        self.started_at = Some(Instant::now());
        self.state = RecordingState::Recording;
        debug!("Recording started (limit {} bytes)", self.max_bytes);
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.state != RecordingState::Recording {
            return Err(ClientError::validation("Not recording"));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        if self.buffered + chunk.len() > self.max_bytes {
            warn!(
                "Recording exceeds size limit ({} > {})",
                self.buffered + chunk.len(),
                self.max_bytes
            );
            return Err(ClientError::validation("Recording too large"));
        }
        self.buffered += chunk.len();
        self.chunks.push(chunk.to_vec());
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        match (&self.clip, self.started_at) {
            (Some(clip), _) => clip.duration,
            (None, Some(started)) if self.is_recording() => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Stopping an idle or already stopped session is a no-op.
    pub fn stop(&mut self) -> Option<&AudioClip> {
        if self.state != RecordingState::Recording {
            return self.clip.as_ref();
        }
        let duration = self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let bytes = self.chunks.concat();
        self.chunks.clear();
        self.state = RecordingState::Stopped;
        debug!("Recording stopped: {} bytes over {:?}", bytes.len(), duration);
        self.clip = Some(AudioClip::new(bytes, duration));
        self.clip.as_ref()
    }

    pub fn take_clip(&mut self) -> Option<AudioClip> {
        let clip = self.clip.take();
        if clip.is_some() {
            self.clear();
        }
        clip
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.buffered = 0;
        self.clip = None;
        self.started_at = None;
        self.state = RecordingState::Idle;
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

/// Loads a clip recorded elsewhere, held to the same size limit as a live take.
pub async fn clip_from_file(path: &Path, max_bytes: usize) -> Result<AudioClip> {
    let bytes = tokio::fs::read(path).await?;
    let mut session = RecordingSession::new(max_bytes);
    session.start();
    for chunk in bytes.chunks(FILE_CHUNK) {
        session.push_chunk(chunk)?;
    }
    session.stop();
    session.take_clip().ok_or_else(|| ClientError::validation("Recording is empty"))
}
