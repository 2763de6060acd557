//! One WebSocket link to a Roon core.
//!
//! [`MooLink`] is the cloneable request side; [`LinkPump`] owns the socket and
//! must be driven for the link to make progress. Replies are matched to
//! requests by `Request-Id`. Dropping the pump (or the socket closing) fails
//! every outstanding request with `Disconnected`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::moo::{MooMessage, MooVerb};
use super::{MooError, MooResult};
use crate::protocol_constants::ROON_PING_SERVICE;

#[derive(Default)]
struct LinkShared {
    pending: DashMap<u64, oneshot::Sender<MooMessage>>,
    subscriptions: DashMap<u64, mpsc::UnboundedSender<MooMessage>>,
    next_id: AtomicU64,
}

impl LinkShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Routes a response to whoever waits for its id. Returns false if
    /// nobody does.
    fn deliver(&self, message: MooMessage) -> bool {
        let id = message.request_id;
        if let Some((_, waiter)) = self.pending.remove(&id) {
            let _ = waiter.send(message);
            return true;
        }

        let finished = message.verb == MooVerb::Complete;
        let delivered = match self.subscriptions.get(&id) {
            Some(sub) => sub.send(message).is_ok(),
            None => return false,
        };
        if finished || !delivered {
            self.subscriptions.remove(&id);
        }
        true
    }

    fn clear(&self) {
        self.pending.clear();
        self.subscriptions.clear();
    }
}

/// Request handle for a connected core.
#[derive(Clone)]
pub(super) struct MooLink {
    outgoing: mpsc::UnboundedSender<MooMessage>,
    shared: Arc<LinkShared>,
    timeout: Duration,
}

impl MooLink {
    /// Sends a request and waits (bounded) for its final reply.
    ///
    /// # Errors
    /// `Timeout`, `Disconnected`, or `Request` for a failure status.
    pub(super) async fn request(&self, name: &str, body: Option<Value>) -> MooResult<MooMessage> {
        let (id, reply) = self.send(name, body)?;
        match tokio::time::timeout(self.timeout, reply).await {
            Ok(reply) => check(name, reply.map_err(|_| MooError::Disconnected)?),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(MooError::Timeout)
            }
        }
    }

    /// Like [`request`](Self::request) but without a deadline. Registration
    /// blocks until the extension is approved in Roon.
    pub(super) async fn request_untimed(
        &self,
        name: &str,
        body: Option<Value>,
    ) -> MooResult<MooMessage> {
        let (_, reply) = self.send(name, body)?;
        check(name, reply.await.map_err(|_| MooError::Disconnected)?)
    }

    /// Opens a subscription; every response for it lands on the returned
    /// channel until the core completes it or the link drops.
    pub(super) fn subscribe(
        &self,
        name: &str,
        body: Option<Value>,
    ) -> MooResult<mpsc::UnboundedReceiver<MooMessage>> {
        let id = self.shared.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscriptions.insert(id, tx);
        if self
            .outgoing
            .send(MooMessage::request(id, name, body))
            .is_err()
        {
            self.shared.subscriptions.remove(&id);
            return Err(MooError::Disconnected);
        }
        Ok(rx)
    }

    fn send(
        &self,
        name: &str,
        body: Option<Value>,
    ) -> MooResult<(u64, oneshot::Receiver<MooMessage>)> {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        if self
            .outgoing
            .send(MooMessage::request(id, name, body))
            .is_err()
        {
            self.shared.pending.remove(&id);
            return Err(MooError::Disconnected);
        }
        Ok((id, rx))
    }
}

fn check(name: &str, reply: MooMessage) -> MooResult<MooMessage> {
    if reply.is_error() {
        let detail = reply
            .body
            .as_ref()
            .and_then(|b| b.get("error").or_else(|| b.get("message")))
            .and_then(Value::as_str)
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        return Err(MooError::Request(format!("{} -> {}{}", name, reply.name, detail)));
    }
    Ok(reply)
}

/// Socket owner. Runs until the core closes the socket or every
/// [`MooLink`] is dropped.
pub(super) struct LinkPump<S> {
    ws: WebSocketStream<S>,
    outgoing: mpsc::UnboundedReceiver<MooMessage>,
    shared: Arc<LinkShared>,
}

/// Wraps an established socket.
pub(super) fn open<S>(ws: WebSocketStream<S>, timeout: Duration) -> (MooLink, LinkPump<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(LinkShared::default());
    (
        MooLink {
            outgoing: tx,
            shared: Arc::clone(&shared),
            timeout,
        },
        LinkPump {
            ws,
            outgoing: rx,
            shared,
        },
    )
}

/// Dials `url` and wraps the socket.
///
/// # Errors
/// `Connect` if the handshake fails or does not finish within `timeout`.
pub(super) async fn connect(
    url: &str,
    timeout: Duration,
) -> MooResult<(MooLink, LinkPump<MaybeTlsStream<tokio::net::TcpStream>>)> {
    let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| MooError::Connect(format!("{}: handshake timed out", url)))?
        .map_err(|e| MooError::Connect(format!("{}: {}", url, e)))?;
    Ok(open(ws, timeout))
}

impl<S> LinkPump<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Pumps frames both ways. Always ends in `Disconnected`.
    pub(super) async fn run(self) -> MooError {
        let Self {
            mut ws,
            mut outgoing,
            shared,
        } = self;

        let reason = loop {
            tokio::select! {
                out = outgoing.recv() => match out {
                    Some(message) => {
                        log::trace!("[Roon] -> {} {}", message.verb, message.name);
                        if let Err(e) = ws.send(Message::binary(message.encode())).await {
                            break format!("send failed: {}", e);
                        }
                    }
                    None => break "link released".to_string(),
                },
                incoming = ws.next() => {
                    let frame = match incoming {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec().into(),
                        Some(Ok(Message::Close(_))) | None => break "closed by core".to_string(),
                        Some(Err(e)) => break e.to_string(),
                        Some(Ok(_)) => continue,
                    };
                    let Some(reply) = handle_frame(&shared, &frame) else {
                        continue;
                    };
                    if let Err(e) = ws.send(Message::binary(reply.encode())).await {
                        break format!("send failed: {}", e);
                    }
                }
            }
        };

        log::debug!("[Roon] Link down: {}", reason);
        shared.clear();
        let _ = ws.close(None).await;
        MooError::Disconnected
    }
}

/// Dispatches one inbound frame. Returns the reply owed to a core request.
fn handle_frame(shared: &LinkShared, frame: &[u8]) -> Option<MooMessage> {
    let message = match MooMessage::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[Roon] Dropping undecodable frame: {}", e);
            return None;
        }
    };

    if message.verb == MooVerb::Request {
        let service = message.name.split('/').next().unwrap_or_default();
        if service == ROON_PING_SERVICE {
            return Some(MooMessage::complete(message.request_id, "Success", None));
        }
        log::debug!("[Roon] Refusing core request {}", message.name);
        return Some(MooMessage::complete(
            message.request_id,
            "InvalidRequest",
            Some(json!({ "error": format!("unknown request: {}", message.name) })),
        ));
    }

    let id = message.request_id;
    if !shared.deliver(message) {
        log::debug!("[Roon] Reply for unknown request {}", id);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_answered() {
        let shared = LinkShared::default();
        let frame = b"MOO/1 REQUEST com.roonlabs.ping:1/ping\nRequest-Id: 9\n\n";
        let reply = handle_frame(&shared, frame).unwrap();
        assert_eq!(reply.verb, MooVerb::Complete);
        assert_eq!(reply.name, "Success");
        assert_eq!(reply.request_id, 9);
    }

    #[test]
    fn unknown_core_requests_are_refused() {
        let shared = LinkShared::default();
        let frame = b"MOO/1 REQUEST com.roonlabs.settings:1/get_settings\nRequest-Id: 3\n\n";
        let reply = handle_frame(&shared, frame).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn responses_route_by_request_id() {
        let shared = LinkShared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.insert(4, tx);

        let frame = b"MOO/1 COMPLETE Success\nRequest-Id: 4\n\n";
        assert!(handle_frame(&shared, frame).is_none());
        assert_eq!(rx.try_recv().unwrap().request_id, 4);
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn subscription_stays_open_until_complete() {
        let shared = LinkShared::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.subscriptions.insert(2, tx);

        handle_frame(&shared, b"MOO/1 CONTINUE Subscribed\nRequest-Id: 2\n\n");
        handle_frame(&shared, b"MOO/1 CONTINUE Changed\nRequest-Id: 2\n\n");
        assert_eq!(shared.subscriptions.len(), 1);

        handle_frame(&shared, b"MOO/1 COMPLETE Unsubscribed\nRequest-Id: 2\n\n");
        assert!(shared.subscriptions.is_empty());

        assert_eq!(rx.try_recv().unwrap().name, "Subscribed");
        assert_eq!(rx.try_recv().unwrap().name, "Changed");
        assert_eq!(rx.try_recv().unwrap().name, "Unsubscribed");
    }

    #[test]
    fn failure_status_becomes_request_error() {
        let reply = MooMessage::complete(1, "InvalidRequest", Some(json!({"error": "no zone"})));
        match check("com.roonlabs.transport:2/control", reply) {
            Err(MooError::Request(msg)) => assert!(msg.contains("no zone")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dead_link_fails_fast() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let link = MooLink {
            outgoing: tx,
            shared: Arc::new(LinkShared::default()),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            link.request("com.roonlabs.registry:1/info", None).await,
            Err(MooError::Disconnected)
        ));
        assert!(link.shared.pending.is_empty());
    }
}
