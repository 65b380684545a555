//! Client-facing WebSocket signaling server
//!
//! Each accepted connection is one [`ClientId`]. Text frames carry request
//! envelopes; every request gets exactly one response envelope with the same
//! `requestId`. Frames that cannot be parsed are answered with an
//! `invalid_request` error when a `requestId` can be salvaged and dropped
//! otherwise.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::signaling::protocol::{Envelope, RelayError};

use super::{ClientId, Coordinator};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Accept signaling clients until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let client = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            client,
                            coordinator.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!("[signaling] accept failed: {}", e),
                }
            }
            _ = shutdown.cancelled() => {
                info!("[signaling] listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    client: ClientId,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("[signaling] handshake with {} failed: {}", peer, e);
            return;
        }
    };
    debug!("[signaling] client {} connected from {}", client, peer);

    let (mut sink, mut frames) = ws.split();

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("[signaling] client {} read error: {}", client, e);
                break;
            }
        };

        let Some(response) = respond(&coordinator, client, &text) else {
            continue;
        };
        let body = match serde_json::to_string(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!("[signaling] failed to encode response: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(body)).await.is_err() {
            break;
        }
    }

    coordinator.client_closed(client);
    debug!("[signaling] client {} disconnected", client);
}

/// Produce the response envelope for one text frame, if any.
pub(crate) fn respond(coordinator: &Coordinator, client: ClientId, text: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(text) {
        Ok(Envelope::Request {
            request_id,
            method,
            params,
        }) => {
            let response = match coordinator.dispatch(client, &method, params) {
                Ok(data) => Envelope::ok(request_id, data),
                Err(e) => {
                    debug!("[signaling] {} failed for client {}: {}", method, client, e);
                    Envelope::err(request_id, e)
                }
            };
            Some(response)
        }
        // Clients never send responses to the coordinator
        Ok(Envelope::Response { request_id, .. }) => Some(Envelope::err(
            request_id,
            RelayError::invalid_request("Expected a request"),
        )),
        Err(e) => {
            let request_id = Envelope::salvage_request_id(text)?;
            Some(Envelope::err(
                request_id,
                RelayError::invalid_request(format!("Malformed request: {}", e)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::signaling::protocol::RelayErrorCode;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default()).0
    }

    fn error_code(envelope: Envelope) -> (String, RelayErrorCode) {
        match envelope {
            Envelope::Response {
                request_id,
                error: Some(e),
                ..
            } => (request_id, e.code),
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let c = coordinator();
        assert!(respond(&c, 1, "garbage").is_none());
        assert!(respond(&c, 1, r#"{"type":"request"}"#).is_none());

        let (id, code) = error_code(respond(&c, 1, r#"{"requestId":"r9","type":"nope"}"#).unwrap());
        assert_eq!(id, "r9");
        assert_eq!(code, RelayErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let c = coordinator();
        let frame = r#"{"type":"request","requestId":"r1","method":"reboot","params":{}}"#;
        let (id, code) = error_code(respond(&c, 1, frame).unwrap());
        assert_eq!(id, "r1");
        assert_eq!(code, RelayErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn test_response_echoes_request_id() {
        let c = coordinator();
        let frame = r#"{"type":"request","requestId":"abc","method":"poll","params":{"sessionId":"x"}}"#;
        match respond(&c, 1, frame).unwrap() {
            Envelope::Response {
                request_id, data, ..
            } => {
                assert_eq!(request_id, "abc");
                assert_eq!(data.unwrap()["success"], false);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }
}
