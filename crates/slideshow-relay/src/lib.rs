//! Fan-out relay for slideshow channel envelopes.
//!
//! Every line a client writes is checked to be an envelope
//! (`{"origin": .., "message": {..}}`) and copied to every other connected
//! client. There is no replay: a client only sees what arrives while it is
//! connected, and one that falls behind loses the lines it missed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
struct Frame {
    from: u64,
    line: Arc<str>,
}

/// Accept clients until `cancel` fires. `capacity` bounds how far a client
/// may fall behind before it starts losing lines.
pub async fn serve(listener: TcpListener, capacity: usize, cancel: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, capacity, "relay listening");
    let (hub, _) = broadcast::channel::<Frame>(capacity.max(1));
    let mut clients = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancel received; closing relay");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    clients.spawn(handle_client(next_id, peer, stream, hub.clone(), cancel.child_token()));
                }
                Err(err) => warn!("accept failed: {err}"),
            },
            Some(res) = clients.join_next() => {
                if let Err(err) = res {
                    warn!("client task failed: {err}");
                }
            }
        }
    }

    clients.shutdown().await;
    Ok(())
}

#[instrument(skip(stream, hub, cancel), fields(client = id))]
async fn handle_client(
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    hub: broadcast::Sender<Frame>,
    cancel: CancellationToken,
) {
    info!(%peer, "client connected");
    let mut sub = hub.subscribe();
    let (mut sink, mut lines) =
        Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES)).split();
    let mut relayed: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = lines.next() => match frame {
                Some(Ok(line)) if is_envelope(&line) => {
                    relayed += 1;
                    // No other clients is fine.
                    let _ = hub.send(Frame { from: id, line: line.into() });
                }
                Some(Ok(_)) => warn!("dropping malformed line"),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("dropping oversized line");
                }
                Some(Err(err)) => {
                    warn!("read failed: {err}");
                    break;
                }
                None => break,
            },
            received = sub.recv() => match received {
                Ok(frame) if frame.from == id => {}
                Ok(frame) => {
                    if let Err(err) = sink.send(frame.line).await {
                        warn!("write failed: {err}");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "client lagging; lines dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    info!(%peer, relayed, "client disconnected");
    debug!("connection closed");
}

/// An object with a string `origin` and an object `message` carrying an
/// `event` name.
pub fn is_envelope(line: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return false;
    };
    value.get("origin").is_some_and(Value::is_string)
        && value
            .get("message")
            .and_then(|m| m.get("event"))
            .is_some_and(Value::is_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_is_checked() {
        assert!(is_envelope(
            r#"{"origin":"client-a","message":{"event":"slideAction","data":{"action":"play"}}}"#
        ));
        assert!(!is_envelope("not json"));
        assert!(!is_envelope(r#"{"origin":1,"message":{"event":"x"}}"#));
        assert!(!is_envelope(r#"{"origin":"a","message":{}}"#));
        assert!(!is_envelope(r#"[1,2,3]"#));
    }
}
