// src/transport.rs
// WebSocket adapter to the local nym client

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::wire::{InboundFrame, OutboundFrame};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Connect attempts before a never-connected startup gives up.
const STARTUP_RETRY_BUDGET: u32 = 10;

enum ConnectionEnd {
    Shutdown,
    Dropped,
}

/// Pure conduit between the nym client websocket and the router channels.
/// It never parses `message` and never inspects `senderTag`; its only
/// protocol knowledge is the selfAddress handshake.
pub struct MixnetTransport {
    url: String,
    address_file: PathBuf,
}

impl MixnetTransport {
    pub fn new(url: impl Into<String>, address_file: impl Into<PathBuf>) -> Self {
        MixnetTransport {
            url: url.into(),
            address_file: address_file.into(),
        }
    }

    /// Connect and pump frames until shutdown. Reconnects with bounded
    /// backoff after a drop; a connection that never came up within the
    /// startup budget is a fatal error.
    pub async fn run(
        &self,
        inbound: mpsc::Sender<(String, String)>,
        mut outbound: mpsc::Receiver<OutboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;
        let mut ever_connected = false;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let stream = match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    attempts += 1;
                    if !ever_connected && attempts >= STARTUP_RETRY_BUDGET {
                        return Err(format!(
                            "cannot reach nym client at {} after {} attempts: {}",
                            self.url, attempts, e
                        ));
                    }
                    warn!(
                        "transport: connect to {} failed ({}), retrying in {:?}",
                        self.url, e, backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            ever_connected = true;
            attempts = 0;
            backoff = INITIAL_BACKOFF;

            match self
                .drive_connection(stream, &inbound, &mut outbound, &mut shutdown)
                .await
            {
                ConnectionEnd::Shutdown => return Ok(()),
                ConnectionEnd::Dropped => {
                    warn!("transport: connection dropped, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn drive_connection(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        inbound: &mpsc::Sender<(String, String)>,
        outbound: &mut mpsc::Receiver<OutboundFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionEnd {
        let (mut write, mut read) = stream.split();

        // Handshake: ask the client who we are on the mixnet.
        let request = match serde_json::to_string(&OutboundFrame::SelfAddress) {
            Ok(request) => request,
            Err(e) => {
                error!("transport: selfAddress serialization failed: {}", e);
                return ConnectionEnd::Dropped;
            }
        };
        if let Err(e) = write.send(Message::text(request)).await {
            warn!("transport: handshake send failed: {}", e);
            return ConnectionEnd::Dropped;
        }

        let address = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<InboundFrame>(text.as_str()) {
                        Ok(InboundFrame::SelfAddress { address }) => break address,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("transport: undecodable frame during handshake: {}", e);
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("transport: handshake read failed: {}", e);
                    return ConnectionEnd::Dropped;
                }
            }
        };
        info!("transport: connected, mix address is {}", address);
        self.persist_address(&address);

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.dispatch_inbound(text.as_str(), inbound).await {
                            return ConnectionEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("transport: read failed: {}", e);
                        return ConnectionEnd::Dropped;
                    }
                },
                maybe = outbound.recv() => match maybe {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("transport: frame serialization failed: {}", e);
                                continue;
                            }
                        };
                        // At-most-once: a reply lost to a dying socket stays
                        // lost.
                        if let Err(e) = write.send(Message::text(text)).await {
                            warn!("transport: write failed: {}", e);
                            return ConnectionEnd::Dropped;
                        }
                    }
                    None => return ConnectionEnd::Shutdown,
                },
                _ = shutdown.changed() => return ConnectionEnd::Shutdown,
            }
        }
    }

    /// Forward a received frame to the router. Returns false when the
    /// router side is gone.
    async fn dispatch_inbound(&self, text: &str, inbound: &mpsc::Sender<(String, String)>) -> bool {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Received { message, sender_tag }) => {
                inbound.send((message, sender_tag)).await.is_ok()
            }
            Ok(InboundFrame::SelfAddress { address }) => {
                self.persist_address(&address);
                true
            }
            Ok(InboundFrame::Error { message }) => {
                warn!("transport: nym client error frame: {}", message);
                true
            }
            Err(e) => {
                error!("transport: dropping undecodable frame: {}", e);
                true
            }
        }
    }

    /// Export the mix address for out-of-band discovery. Failure to write
    /// is logged and ignored; the service can run without the file.
    fn persist_address(&self, address: &str) {
        if let Some(parent) = self.address_file.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("transport: cannot create {}: {}", parent.display(), e);
                return;
            }
        }
        match std::fs::write(&self.address_file, address) {
            Ok(()) => info!("transport: mix address saved to {}", self.address_file.display()),
            Err(e) => error!(
                "transport: failed to write {}: {}",
                self.address_file.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Loopback stand-in for the nym client: answers the selfAddress
    /// handshake, delivers one received frame, then echoes back whatever
    /// reply it gets on a channel for inspection.
    async fn fake_nym_client(
        listener: TcpListener,
        seen_replies: mpsc::Sender<String>,
    ) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

        // Expect the handshake request.
        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(frame.to_text().unwrap(), r#"{"type":"selfAddress"}"#);
        ws.send(Message::text(
            r#"{"type":"selfAddress","address":"client.addr@gateway"}"#,
        ))
        .await
        .unwrap();

        // One inbound message for the router.
        ws.send(Message::text(
            r#"{"type":"received","message":"{\"action\":\"query\",\"username\":\"alice\"}","senderTag":"tag-7"}"#,
        ))
        .await
        .unwrap();

        // Capture the reply the transport writes back.
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let _ = seen_replies.send(text.to_string()).await;
        }
    }

    #[tokio::test]
    async fn handshake_pump_and_reply_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        tokio::spawn(fake_nym_client(listener, seen_tx));

        let dir = std::env::temp_dir()
            .join(format!("nym-directory-transport-{:016x}", rand::random::<u64>()));
        let address_file = dir.join("nym_address.txt");
        let transport =
            MixnetTransport::new(format!("ws://127.0.0.1:{}", port), address_file.clone());

        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(async move {
            transport.run(inbound_tx, outbound_rx, shutdown_rx).await
        });

        // The received frame reaches the router side intact.
        let (message, sender_tag) = inbound_rx.recv().await.unwrap();
        assert_eq!(sender_tag, "tag-7");
        assert!(message.contains("\"action\":\"query\""));

        // The address was exported for discovery.
        let exported = std::fs::read_to_string(&address_file).unwrap();
        assert_eq!(exported, "client.addr@gateway");

        // A reply frame goes out on the wire as JSON.
        outbound_tx
            .send(OutboundFrame::Reply {
                message: "enveloped".into(),
                sender_tag: "tag-7".into(),
            })
            .await
            .unwrap();
        let written = seen_rx.recv().await.unwrap();
        assert_eq!(
            written,
            r#"{"type":"reply","message":"enveloped","senderTag":"tag-7"}"#
        );

        shutdown_tx.send(true).unwrap();
        pump.await.unwrap().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn connect_retry_loop_honors_shutdown() {
        // Nothing listens on this port; exhausting the startup budget takes
        // minutes of backoff, so assert the cheaper property: a shutdown
        // request interrupts the retry loop cleanly.
        let transport = MixnetTransport::new(
            "ws://127.0.0.1:1".to_string(),
            std::env::temp_dir().join("unused_address.txt"),
        );
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (_outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(async move {
            transport.run(inbound_tx, outbound_rx, shutdown_rx).await
        });
        // Let the first connect fail, then request shutdown.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        assert!(pump.await.unwrap().is_ok());
    }
}
