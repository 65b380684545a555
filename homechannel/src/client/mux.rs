//! Channel Multiplexer
//!
//! One established transport carries:
//! - the reserved `control` channel, opened lazily, at most one live instance
//! - one channel per named application, opened by name
//!
//! Closing the multiplexer closes every channel, rejects every pending
//! request with `Disconnected` exactly once, and releases the presentation
//! surfaces attached to applications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::apps::{
    AppInfo, AppRequest, AppResponse, ControlRequest, ControlResponse, APPS_LIST,
    CONTROL_CHANNEL_LABEL,
};
use crate::error::ErrorKind;
use crate::rtc::{DataChannel, PeerTransport, TransportError};

/// Multiplexer errors
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    #[error("Disconnected")]
    Disconnected,

    #[error("'{0}' is reserved for the control channel")]
    ReservedLabel(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel open failed: {0}")]
    ChannelOpen(TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Application error: {0}")]
    App(String),
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disconnected | Self::Timeout(_) | Self::ChannelOpen(_) => ErrorKind::Transport,
            Self::ReservedLabel(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::App(_) => ErrorKind::Resource,
        }
    }
}

/// Timeouts for channel opens and requests
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    pub channel_open_timeout: Duration,
    pub request_timeout: Duration,
}

/// A sandboxed surface created alongside an application channel.
pub trait PresentationSurface: Send + Sync {
    /// Free the surface. Called once, when the multiplexer closes.
    fn release(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// Request correlation
// ═══════════════════════════════════════════════════════════════════════════

type Waiter<T> = oneshot::Sender<Result<T, MuxError>>;

/// `requestId -> waiter`; each waiter is resolved at most once.
///
/// Once drained by [`fail_all`](Self::fail_all) no new waiter is accepted.
struct PendingRequests<T> {
    waiters: Mutex<Option<HashMap<String, Waiter<T>>>>,
}

impl<T> PendingRequests<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(Some(HashMap::new())),
        })
    }

    fn insert(&self, request_id: String) -> Option<oneshot::Receiver<Result<T, MuxError>>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().as_mut()?.insert(request_id, tx);
        Some(rx)
    }

    fn resolve(&self, request_id: &str, value: T) -> bool {
        let waiter = self
            .waiters
            .lock()
            .as_mut()
            .and_then(|w| w.remove(request_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    fn forget(&self, request_id: &str) {
        if let Some(waiters) = self.waiters.lock().as_mut() {
            waiters.remove(request_id);
        }
    }

    fn fail_all(&self) -> usize {
        let drained = self.waiters.lock().take().unwrap_or_default();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(MuxError::Disconnected));
        }
        count
    }

    fn len(&self) -> usize {
        self.waiters.lock().as_ref().map_or(0, HashMap::len)
    }
}

/// Send `message` and wait for the reply correlated by `request_id`.
async fn round_trip<T>(
    pending: &PendingRequests<T>,
    outgoing: &mpsc::Sender<String>,
    request_id: String,
    message: &impl Serialize,
    timeout: Duration,
) -> Result<T, MuxError> {
    let body = serde_json::to_string(message).map_err(|e| MuxError::Protocol(e.to_string()))?;
    let rx = pending
        .insert(request_id.clone())
        .ok_or(MuxError::Disconnected)?;
    if outgoing.send(body).await.is_err() {
        pending.forget(&request_id);
        return Err(MuxError::Disconnected);
    }
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(MuxError::Disconnected),
        Err(_) => {
            pending.forget(&request_id);
            Err(MuxError::Timeout(timeout))
        }
    }
}

/// Read replies off a channel and hand them to their waiters.
///
/// When the channel ends (remote close or multiplexer shutdown) every waiter
/// still pending is rejected.
fn spawn_reader<T, F>(
    label: String,
    mut incoming: mpsc::Receiver<String>,
    pending: Arc<PendingRequests<T>>,
    shutdown: CancellationToken,
    request_id_of: F,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(&T) -> &str + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = incoming.recv() => {
                    let Some(raw) = message else { break };
                    match serde_json::from_str::<T>(&raw) {
                        Ok(reply) => {
                            let request_id = request_id_of(&reply).to_string();
                            if !pending.resolve(&request_id, reply) {
                                debug!("[mux] {}: dropping reply for unknown requestId {}", label, request_id);
                            }
                        }
                        Err(e) => debug!("[mux] {}: dropping malformed reply: {}", label, e),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        let failed = pending.fail_all();
        debug!("[mux] {} reader ended, {} pending rejected", label, failed);
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Application channels
// ═══════════════════════════════════════════════════════════════════════════

/// Client end of one application channel
#[derive(Clone)]
pub struct AppChannel {
    name: String,
    outgoing: mpsc::Sender<String>,
    pending: Arc<PendingRequests<AppResponse>>,
    request_timeout: Duration,
}

impl AppChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke `operation` on the application and wait for its result.
    pub async fn request(
        &self,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, MuxError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = AppRequest {
            request_id: request_id.clone(),
            operation: operation.to_string(),
            params,
        };
        let response = round_trip(
            &self.pending,
            &self.outgoing,
            request_id,
            &request,
            self.request_timeout,
        )
        .await?;
        if response.success {
            Ok(response.result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(MuxError::App(
                response.error.unwrap_or_else(|| "Request failed".to_string()),
            ))
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Multiplexer
// ═══════════════════════════════════════════════════════════════════════════

type ControlPending = PendingRequests<ControlResponse>;

struct ControlLink {
    outgoing: mpsc::Sender<String>,
    pending: Arc<ControlPending>,
    shutdown: CancellationToken,
}

/// Channels over one established transport
pub struct ChannelMultiplexer {
    transport: Arc<dyn PeerTransport>,
    config: MuxConfig,
    control: Mutex<Option<ControlLink>>,
    /// Serializes control channel opens
    control_open: tokio::sync::Mutex<()>,
    surfaces: Mutex<HashMap<String, Box<dyn PresentationSurface>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ChannelMultiplexer {
    pub fn new(transport: Arc<dyn PeerTransport>, config: MuxConfig) -> Self {
        Self {
            transport,
            config,
            control: Mutex::new(None),
            control_open: tokio::sync::Mutex::new(()),
            surfaces: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn live_control(&self) -> Option<(mpsc::Sender<String>, Arc<ControlPending>)> {
        self.control
            .lock()
            .as_ref()
            .filter(|link| !link.shutdown.is_cancelled() && !link.outgoing.is_closed())
            .map(|link| (link.outgoing.clone(), link.pending.clone()))
    }

    async fn open_raw(&self, label: &str) -> Result<DataChannel, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Disconnected);
        }
        let timeout = self.config.channel_open_timeout;
        match tokio::time::timeout(timeout, self.transport.open_channel(label)).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(MuxError::ChannelOpen(e)),
            Err(_) => Err(MuxError::Timeout(timeout)),
        }
    }

    /// Open the control channel if no live instance exists.
    pub async fn control_channel(&self) -> Result<(), MuxError> {
        if self.live_control().is_some() {
            return Ok(());
        }
        let _guard = self.control_open.lock().await;
        if self.live_control().is_some() {
            return Ok(());
        }

        let channel = self.open_raw(CONTROL_CHANNEL_LABEL).await?;
        let (label, outgoing, incoming) = channel.into_parts();
        let shutdown = self.shutdown.child_token();
        let pending = PendingRequests::new();
        spawn_reader(
            label,
            incoming,
            pending.clone(),
            shutdown.clone(),
            |r: &ControlResponse| r.request_id.as_str(),
        );

        let previous = self.control.lock().replace(ControlLink {
            outgoing,
            pending,
            shutdown,
        });
        if let Some(stale) = previous {
            stale.shutdown.cancel();
        }
        info!("[mux] control channel open");
        Ok(())
    }

    /// Ask the agent which applications it exposes.
    pub async fn list_apps(&self) -> Result<Vec<AppInfo>, MuxError> {
        self.control_channel().await?;
        let (outgoing, pending) = self.live_control().ok_or(MuxError::Disconnected)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = ControlRequest {
            kind: APPS_LIST.to_string(),
            request_id: request_id.clone(),
        };
        let response = round_trip(
            &pending,
            &outgoing,
            request_id,
            &request,
            self.config.request_timeout,
        )
        .await?;

        if let Some(error) = response.error {
            return Err(MuxError::Protocol(error));
        }
        response
            .apps
            .ok_or_else(|| MuxError::Protocol("apps:list response without apps".into()))
    }

    /// Open the dedicated channel of application `name`.
    pub async fn open_app_channel(&self, name: &str) -> Result<AppChannel, MuxError> {
        if name == CONTROL_CHANNEL_LABEL {
            return Err(MuxError::ReservedLabel(name.to_string()));
        }
        let channel = self.open_raw(name).await?;
        let (label, outgoing, incoming) = channel.into_parts();
        let pending = PendingRequests::new();
        spawn_reader(
            label.clone(),
            incoming,
            pending.clone(),
            self.shutdown.child_token(),
            |r: &AppResponse| r.request_id.as_str(),
        );
        debug!("[mux] app channel open: {}", label);
        Ok(AppChannel {
            name: label,
            outgoing,
            pending,
            request_timeout: self.config.request_timeout,
        })
    }

    /// Attach a presentation surface to `app`, replacing (and releasing) any
    /// earlier one.
    pub fn attach_surface(
        &self,
        app: &str,
        surface: Box<dyn PresentationSurface>,
    ) -> Result<(), MuxError> {
        if self.is_closed() {
            surface.release();
            return Err(MuxError::Disconnected);
        }
        if let Some(old) = self.surfaces.lock().insert(app.to_string(), surface) {
            old.release();
        }
        Ok(())
    }

    pub fn pending_control_requests(&self) -> usize {
        self.control
            .lock()
            .as_ref()
            .map_or(0, |link| link.pending.len())
    }

    /// Close all channels and the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let control = self.control.lock().take();
        let rejected = control.map_or(0, |link| link.pending.fail_all());

        let surfaces: Vec<_> = self.surfaces.lock().drain().collect();
        for (_, surface) in &surfaces {
            surface.release();
        }

        self.transport.close().await;
        info!(
            "[mux] closed ({} control requests rejected, {} surfaces released)",
            rejected,
            surfaces.len()
        );
    }
}

impl std::fmt::Debug for ChannelMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMultiplexer")
            .field("config", &self.config)
            .field("surfaces", &self.surfaces.lock().len())
            .field("pending_control_requests", &self.pending_control_requests())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
