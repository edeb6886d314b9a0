use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

type Client = Framed<TcpStream, LinesCodec>;

const PLAY: &str =
    r#"{"origin":"client-a","message":{"event":"slideAction","data":{"action":"play"}}}"#;

async fn start_relay(capacity: usize) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(slideshow_relay::serve(listener, capacity, cancel.clone()));
    (addr, cancel)
}

async fn client(addr: &str) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, LinesCodec::new())
}

async fn next_line(c: &mut Client) -> Option<String> {
    match timeout(Duration::from_millis(500), c.next()).await {
        Ok(Some(Ok(line))) => Some(line),
        _ => None,
    }
}

/// Connections register asynchronously; give the accept loop a moment.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_to_other_clients_only() {
    let (addr, cancel) = start_relay(16).await;
    let mut a = client(&addr).await;
    let mut b = client(&addr).await;
    let mut c = client(&addr).await;
    settle().await;

    a.send(PLAY).await.unwrap();
    assert_eq!(next_line(&mut b).await.as_deref(), Some(PLAY));
    assert_eq!(next_line(&mut c).await.as_deref(), Some(PLAY));
    assert_eq!(next_line(&mut a).await, None, "sender must not get its own line back");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_lines_are_dropped() {
    let (addr, cancel) = start_relay(16).await;
    let mut a = client(&addr).await;
    let mut b = client(&addr).await;
    settle().await;

    a.send("{not json").await.unwrap();
    a.send(r#"{"event":"slideAction"}"#).await.unwrap();
    a.send(PLAY).await.unwrap();
    assert_eq!(next_line(&mut b).await.as_deref(), Some(PLAY));
    assert_eq!(next_line(&mut b).await, None);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiners_get_no_replay() {
    let (addr, cancel) = start_relay(16).await;
    let mut a = client(&addr).await;
    settle().await;
    a.send(PLAY).await.unwrap();
    settle().await;

    let mut late = client(&addr).await;
    assert_eq!(next_line(&mut late).await, None);
    cancel.cancel();
}
