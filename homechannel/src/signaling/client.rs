//! WebSocket signaling client
//!
//! ```text
//! ┌──────────────┐   request frames    ┌──────────────┐
//! │  Connection  │ ──────────────────▸ │ Coordinator  │
//! │  (client)    │ ◂────────────────── │  (ws server) │
//! └──────────────┘   response frames   └──────────────┘
//! ```
//!
//! - Requests are matched to responses by `requestId`
//! - Responses with an unknown `requestId` are ignored
//! - When the channel closes, every pending request fails with `Disconnected`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::Envelope;
use super::{SignalingChannel, SignalingConnector, SignalingError};

type PendingMap =
    Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, SignalingError>>>>>;

/// Client end of a signaling WebSocket.
pub struct WsSignalingChannel {
    write_tx: mpsc::Sender<String>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl WsSignalingChannel {
    /// Connect to `url`, giving up after `timeout`.
    pub async fn open(url: &str, timeout: Duration) -> Result<Self, SignalingError> {
        let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(SignalingError::Open(e.to_string())),
            Err(_) => return Err(SignalingError::OpenTimeout(timeout)),
        };
        debug!("[signaling] connected to {}", url);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);

        let (mut sink, mut stream) = ws.split();
        let pending_r = pending.clone();
        let alive_r = alive.clone();
        let shutdown_r = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(line) = write_rx.recv() => {
                        if sink.send(Message::Text(line)).await.is_err() {
                            warn!("[signaling] write failed, channel closed");
                            break;
                        }
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => deliver(&pending_r, &text),
                            Some(Ok(Message::Close(_))) | None => {
                                info!("[signaling] coordinator closed the channel");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                debug!("[signaling] read error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_r.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            alive_r.store(false, Ordering::Release);
            fail_pending(&pending_r);
            debug!("[signaling] IO task ended");
        });

        Ok(Self {
            write_tx,
            pending,
            alive,
            shutdown,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Route one inbound frame to its waiter.
fn deliver(pending: &PendingMap, text: &str) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(Envelope::Response {
            request_id,
            data,
            error,
        }) => {
            let Some(tx) = pending.lock().remove(&request_id) else {
                debug!("[signaling] response for unknown requestId {}", request_id);
                return;
            };
            let result = match error {
                Some(e) => Err(SignalingError::Remote(e)),
                None => Ok(data.unwrap_or(serde_json::Value::Null)),
            };
            let _ = tx.send(result);
        }
        Ok(Envelope::Request { method, .. }) => {
            debug!("[signaling] ignoring unsolicited request {}", method);
        }
        Err(e) => debug!("[signaling] ignoring malformed frame: {}", e),
    }
}

fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(SignalingError::Disconnected));
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SignalingError> {
        if !self.is_alive() {
            return Err(SignalingError::Disconnected);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&Envelope::request(&request_id, method, params))
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        // The IO task may have drained the map just before the insert
        if !self.is_alive() || self.write_tx.send(frame).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(SignalingError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(SignalingError::Timeout(timeout))
            }
        }
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("[signaling] closing channel");
        }
        self.shutdown.cancel();
        fail_pending(&self.pending);
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens [`WsSignalingChannel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsSignalingConnector;

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn open(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn SignalingChannel>, SignalingError> {
        let channel = WsSignalingChannel::open(url, timeout).await?;
        Ok(Box::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{RelayError, RelayErrorCode};
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Answers `echo` with its params, `fail` with an error, and never answers
    /// `hang`. Every reply is preceded by a stray response.
    async fn fake_coordinator() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let Ok(Envelope::Request {
                            request_id,
                            method,
                            params,
                        }) = serde_json::from_str::<Envelope>(&text)
                        else {
                            continue;
                        };
                        let stray = Envelope::ok("someone-else", json!({}));
                        let _ = ws
                            .send(Message::Text(serde_json::to_string(&stray).unwrap()))
                            .await;
                        let reply = match method.as_str() {
                            "echo" => Envelope::ok(request_id, params),
                            "fail" => Envelope::err(request_id, RelayError::offline()),
                            _ => continue,
                        };
                        let _ = ws
                            .send(Message::Text(serde_json::to_string(&reply).unwrap()))
                            .await;
                    }
                });
            }
        });
        format!("ws://{}/", addr)
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_request_response() {
        let url = fake_coordinator().await;
        let channel = WsSignalingChannel::open(&url, T).await.unwrap();
        let value = channel.request("echo", json!({"n": 1}), T).await.unwrap();
        assert_eq!(value, json!({"n": 1}));

        match channel.request("fail", json!({}), T).await {
            Err(SignalingError::Remote(e)) => assert_eq!(e.code, RelayErrorCode::Offline),
            other => panic!("Expected remote error, got {:?}", other),
        }
        channel.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate() {
        let url = fake_coordinator().await;
        let channel = Arc::new(WsSignalingChannel::open(&url, T).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..10 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                let v = channel.request("echo", json!({"i": i}), T).await.unwrap();
                assert_eq!(v["i"], i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_once() {
        let url = fake_coordinator().await;
        let channel = Arc::new(WsSignalingChannel::open(&url, T).await.unwrap());
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request("hang", json!({}), T).await })
        };
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.close().await;
        channel.close().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SignalingError::Disconnected)
        ));
        assert!(matches!(
            channel.request("echo", json!({}), T).await,
            Err(SignalingError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_up() {
        let url = fake_coordinator().await;
        let channel = WsSignalingChannel::open(&url, T).await.unwrap();
        let result = channel
            .request("hang", json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SignalingError::Timeout(_))));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsSignalingChannel::open(&format!("ws://{}/", addr), T).await;
        assert!(matches!(result, Err(SignalingError::Open(_))));
    }
}
