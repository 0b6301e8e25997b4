use futures::{ SinkExt, StreamExt };
use log::{ debug, info, warn, error };
use std::time::Duration;
use tokio::sync::{ mpsc, oneshot };
use tokio::task::JoinHandle;
use tokio::time::{ interval_at, Instant, MissedTickBehavior };
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use super::SyncEvent;
use crate::models::websocket::{ StreamFrame, PING };

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
}

/// Owner side of one streaming channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub conversation_id: String,
    close_tx: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn spawn(
        id: ChannelId,
        conversation_id: String,
        url: Url,
        heartbeat: Duration,
        events: mpsc::WeakSender<SyncEvent>
    ) -> Self {
        let (close_tx, close_rx) = oneshot::channel();
        let link = Link {
            id,
            conversation_id: conversation_id.clone(),
            events,
        };
        let task = tokio::spawn(run_channel(link, url, heartbeat, close_rx));
        Self {
            id,
            conversation_id,
            close_tx: Some(close_tx),
            _task: task,
        }
    }

    pub fn close(mut self) {
        self.signal_close();
    }

    fn signal_close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.signal_close();
    }
}

/// Route back into the engine. Holds only a weak sender so an abandoned
/// engine can shut down while channels are still draining.
struct Link {
    id: ChannelId,
    conversation_id: String,
    events: mpsc::WeakSender<SyncEvent>,
}

impl Link {
    async fn emit(&self, event: SyncEvent) -> bool {
        match self.events.upgrade() {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    async fn state(&self, state: ChannelState) -> bool {
        self.emit(SyncEvent::ChannelState {
            channel: self.id,
            conversation_id: self.conversation_id.clone(),
            state,
        }).await
    }
}

async fn run_channel(
    link: Link,
    url: Url,
    heartbeat: Duration,
    mut close_rx: oneshot::Receiver<()>
) {
    if !link.state(ChannelState::Connecting).await {
        return;
    }
    debug!("Channel {} connecting to {}", link.id, url);

    let connected = tokio::select! {
        _ = &mut close_rx => {
            debug!("Channel {} closed before connecting", link.id);
            link.state(ChannelState::Closed).await;
            return;
        }
        res = connect_async(url.as_str()) => res,
    };

    let websocket = match connected {
        Ok((websocket, _)) => websocket,
        Err(e) => {
            warn!("Channel {} failed to connect to {}: {}", link.id, url, e);
            link.state(ChannelState::Closed).await;
            return;
        }
    };

    info!("Channel {} open for conversation {}", link.id, link.conversation_id);
    if !link.state(ChannelState::Open).await {
        return;
    }

    let (mut tx, mut rx) = websocket.split();
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                debug!("Channel {} closing on request", link.id);
                let _ = tx.send(WsMessage::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = tx.send(WsMessage::Text(PING.to_string())).await {
                    warn!("Channel {} heartbeat failed: {}", link.id, e);
                    break;
                }
            }
            frame = rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match StreamFrame::parse(&text) {
                            StreamFrame::Message(message) => {
                                let event = SyncEvent::Streamed {
                                    channel: link.id,
                                    conversation_id: link.conversation_id.clone(),
                                    message,
                                };
                                if !link.emit(event).await {
                                    break;
                                }
                            }
                            StreamFrame::Noise => {
                                debug!("Channel {} dropped non-message payload", link.id);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Channel {} received close frame", link.id);
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("Channel {} ignoring binary frame", link.id);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::AlreadyClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_) => {
                                info!("Channel {} closed: {}", link.id, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("Channel {} reset by peer", link.id);
                            }
                            _ => {
                                error!("Channel {} receive error: {}", link.id, e);
                            }
                        }
                        break;
                    }
                    None => {
                        info!("Channel {} stream ended", link.id);
                        break;
                    }
                }
            }
        }
    }

    link.state(ChannelState::Closed).await;
}
