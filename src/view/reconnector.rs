use log::{ debug, info, warn };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{ sleep_until, Instant };

use crate::error::Result;
use crate::sync::reconnect::{ Backoff, ReconnectPolicy };
use crate::sync::{ ChannelState, SyncHandle, SyncNotification };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Scheduled(Duration),
    GaveUp,
    Disabled,
}

/// Applies a [`ReconnectPolicy`] to stream drops. Each scheduled attempt
/// comes back as a conversation id on the receiver returned by `new` once
/// its delay has passed.
pub struct Reconnector {
    handle: SyncHandle,
    backoff: Option<Backoff>,
    due: mpsc::Sender<String>,
}

impl Reconnector {
    pub fn new(handle: SyncHandle, policy: &ReconnectPolicy) -> (Self, mpsc::Receiver<String>) {
        let (due, due_rx) = mpsc::channel(4);
        let reconnector = Self {
            handle,
            backoff: policy.backoff(),
            due,
        };
        (reconnector, due_rx)
    }

    pub fn attempts(&self) -> u32 {
        self.backoff.as_ref().map(Backoff::attempts).unwrap_or(0)
    }

    /// Returns the decision taken for a dropped stream, `None` for anything else.
    pub fn observe(&mut self, note: &SyncNotification) -> Option<ReconnectStep> {
        match note {
            SyncNotification::ChannelStateChanged { state: ChannelState::Open, .. } => {
                if let Some(backoff) = self.backoff.as_mut() {
                    backoff.reset();
                }
                None
            }
            SyncNotification::StreamDropped { conversation_id } => {
                Some(self.schedule(conversation_id.clone()))
            }
            _ => None,
        }
    }

    fn schedule(&mut self, conversation_id: String) -> ReconnectStep {
        let Some(backoff) = self.backoff.as_mut() else {
            return ReconnectStep::Disabled;
        };
        let Some(delay) = backoff.next_delay() else {
            warn!(
                "Giving up on live updates for {} after {} attempts",
                conversation_id,
                backoff.attempts()
            );
            return ReconnectStep::GaveUp;
        };

        info!(
            "Reconnecting to {} in {:?} (attempt {})",
            conversation_id,
            delay,
            backoff.attempts()
        );
        let at = Instant::now() + delay;
        let due = self.due.clone();
        tokio::spawn(async move {
            sleep_until(at).await;
            let _ = due.send(conversation_id).await;
        });
        ReconnectStep::Scheduled(delay)
    }

    /// Reopens the stream. The engine backfills missed messages once it is listening.
    pub async fn reconnect(&self, conversation_id: &str) -> Result<bool> {
        let reopened = self.handle.reopen_stream(conversation_id).await?;
        if reopened {
            info!("Stream for {} reopened", conversation_id);
        } else {
            debug!("No reconnect needed for {}", conversation_id);
        }
        Ok(reopened)
    }
}
