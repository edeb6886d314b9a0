//! Attachment to the real-time channel.
//!
//! Delivery is best effort and at most once. A full outbound queue drops
//! the event; a lagging subscriber loses whatever it missed. Each client
//! stamps what it publishes with its origin id and ignores its own echoes.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{ChannelEvent, Envelope};

/// Upper bound on a single newline-delimited envelope.
pub const MAX_LINE_BYTES: usize = 1 << 20;

const QUEUE_DEPTH: usize = 64;

pub fn generate_client_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("client-{}", suffix.to_lowercase())
}

/// Publish half of a [`Link`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Publisher {
    origin: String,
    outbound: mpsc::Sender<Envelope>,
}

impl Publisher {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Fire and forget.
    pub fn publish(&self, message: ChannelEvent) {
        let name = message.name();
        let envelope = Envelope {
            origin: self.origin.clone(),
            message,
        };
        match self.outbound.try_send(envelope) {
            Ok(()) => debug!(event = name, "published"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = name, "outbound channel queue full; dropping event")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = name, "channel detached; event not sent")
            }
        }
    }
}

/// One client's attachment: a publisher plus the stream of events other
/// clients published.
#[derive(Debug)]
pub struct Link {
    publisher: Publisher,
    inbound: mpsc::Receiver<ChannelEvent>,
}

impl Link {
    /// A link connected to nothing. Publishing is a logged no-op and the
    /// inbound stream ends immediately.
    pub fn detached() -> Self {
        let (outbound, _) = mpsc::channel(1);
        let (_, inbound) = mpsc::channel(1);
        Self {
            publisher: Publisher {
                origin: generate_client_id(),
                outbound,
            },
            inbound,
        }
    }

    pub fn origin(&self) -> &str {
        self.publisher.origin()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn publish(&self, message: ChannelEvent) {
        self.publisher.publish(message);
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (Publisher, mpsc::Receiver<ChannelEvent>) {
        (self.publisher, self.inbound)
    }
}

/// In-process fan-out used when several sessions share one runtime.
#[derive(Debug, Clone)]
pub struct LocalHub {
    tx: broadcast::Sender<Envelope>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(QUEUE_DEPTH)
    }
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new client. The bridge task stops on `cancel`.
    pub fn join(&self, cancel: CancellationToken) -> Link {
        let origin = generate_client_id();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(QUEUE_DEPTH);
        let hub = self.tx.clone();
        let mut sub = hub.subscribe();
        let me = origin.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(envelope) = out_rx.recv() => {
                        // No subscribers is fine: nobody else is listening.
                        let _ = hub.send(envelope);
                    }
                    received = sub.recv() => match received {
                        Ok(envelope) if envelope.origin == me => {}
                        Ok(envelope) => forward(&in_tx, envelope.message),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(client = %me, missed, "hub subscriber lagged; events lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(client = %me, "hub link closed");
        });

        Link {
            publisher: Publisher {
                origin,
                outbound: out_tx,
            },
            inbound: in_rx,
        }
    }
}

fn forward(in_tx: &mpsc::Sender<ChannelEvent>, message: ChannelEvent) {
    if let Err(mpsc::error::TrySendError::Full(ev)) = in_tx.try_send(message) {
        warn!(event = ev.name(), "inbound queue full; dropping remote event");
    }
}

/// Connect to a relay daemon and bridge the socket into a [`Link`].
pub async fn connect<A: ToSocketAddrs>(addr: A, cancel: CancellationToken) -> Result<Link> {
    let stream = TcpStream::connect(addr)
        .await
        .context("failed to connect to relay")?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    info!(%peer, "connected to relay");

    let origin = generate_client_id();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(QUEUE_DEPTH);
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (mut sink, mut lines) = framed.split();
    let me = origin.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(envelope) = out_rx.recv() => {
                    let line = match serde_json::to_string(&envelope) {
                        Ok(line) => line,
                        Err(err) => {
                            warn!(error = %err, "failed to encode envelope");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(line).await {
                        warn!(error = %err, "relay write failed; closing link");
                        break;
                    }
                }
                frame = lines.next() => match frame {
                    Some(Ok(line)) => match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) if envelope.origin == me => {}
                        Ok(envelope) => forward(&in_tx, envelope.message),
                        Err(err) => warn!(error = %err, "dropping malformed relay message"),
                    },
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("dropping oversized relay message");
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "relay read failed; closing link");
                        break;
                    }
                    None => {
                        info!(%peer, "relay closed the connection");
                        break;
                    }
                },
            }
        }
    });

    Ok(Link {
        publisher: Publisher {
            origin,
            outbound: out_tx,
        },
        inbound: in_rx,
    })
}

/// Publish a single event to a relay and disconnect.
pub async fn send_once<A: ToSocketAddrs>(addr: A, message: ChannelEvent) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .context("failed to connect to relay")?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let envelope = Envelope {
        origin: generate_client_id(),
        message,
    };
    let name = envelope.message.name();
    // `send` flushes before returning.
    framed
        .send(serde_json::to_string(&envelope)?)
        .await
        .context("failed to write to relay")?;
    info!(event = name, "sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SlideAction, SlideCommand};
    use std::time::Duration;
    use tokio::time::timeout;

    fn pause() -> ChannelEvent {
        ChannelEvent::SlideAction(SlideCommand {
            action: SlideAction::Pause,
        })
    }

    #[test]
    fn client_ids_are_distinct() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("client-"));
        assert_eq!(a.len(), "client-".len() + 8);
        assert_ne!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hub_delivers_to_others_but_not_self() {
        let cancel = CancellationToken::new();
        let hub = LocalHub::default();
        let mut a = hub.join(cancel.clone());
        let mut b = hub.join(cancel.clone());

        a.publish(pause());
        let got = timeout(Duration::from_secs(1), b.recv()).await.unwrap();
        assert_eq!(got, Some(pause()));
        assert!(
            timeout(Duration::from_millis(100), a.recv()).await.is_err(),
            "publisher must not hear its own echo"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn detached_link_is_inert() {
        let mut link = Link::detached();
        link.publish(pause());
        assert_eq!(link.recv().await, None);
    }
}
