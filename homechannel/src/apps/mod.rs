//! Applications over the peer transport
//!
//! ```text
//!  DataChannel "control"  ──► ChannelRouter::route_control ──► apps:list
//!  DataChannel "<app>"    ──► ChannelRouter::route_app ──► AppHandler::handle_message
//!                                                             └─ OperationTable
//! ```
//!
//! Wire formats (JSON text messages):
//! - control: `{type, requestId}` → `{type: "<type>:response", requestId, ...}`
//! - app: `{requestId, operation, params}` → `{requestId, success, result|error}`

pub mod router;
pub mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use router::ChannelRouter;
pub use table::{OperationFn, OperationResult, OperationTable, TableHandler};

/// Label of the reserved control channel. Never usable as an app name.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Control request listing the available applications.
pub const APPS_LIST: &str = "apps:list";

/// Type of the reply to a control request of type `kind`.
pub fn response_type(kind: &str) -> String {
    format!("{}:response", kind)
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════

/// Request on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
}

/// Response on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<AppInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of `apps:list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    /// Presentation-only apps have no message handler
    #[serde(default)]
    pub has_handler: bool,
}

/// Request on an application channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub request_id: String,
    pub operation: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response on an application channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppResponse {
    pub fn ok(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Server-side application contract
#[async_trait]
pub trait AppHandler: Send + Sync {
    async fn handle_message(&self, request: AppRequest) -> AppResponse;
}

/// Registration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("'{0}' is reserved for the control channel")]
    ReservedName(String),

    #[error("Application name must not be empty")]
    EmptyName,

    #[error("Application already registered: {0}")]
    Duplicate(String),
}

#[derive(Clone)]
enum AppEntry {
    Service(Arc<dyn AppHandler>),
    Presentation,
}

/// Named applications an agent exposes
#[derive(Default)]
pub struct AppRegistry {
    apps: RwLock<BTreeMap<String, AppEntry>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: &str, entry: AppEntry) -> Result<(), AppError> {
        if name.is_empty() {
            return Err(AppError::EmptyName);
        }
        if name == CONTROL_CHANNEL_LABEL {
            return Err(AppError::ReservedName(name.to_string()));
        }
        let mut apps = self.apps.write();
        if apps.contains_key(name) {
            return Err(AppError::Duplicate(name.to_string()));
        }
        apps.insert(name.to_string(), entry);
        Ok(())
    }

    /// Register an application with a message handler.
    pub fn register(&self, name: &str, handler: Arc<dyn AppHandler>) -> Result<(), AppError> {
        self.insert(name, AppEntry::Service(handler))
    }

    /// Register an application that only has a presentation surface.
    pub fn register_presentation(&self, name: &str) -> Result<(), AppError> {
        self.insert(name, AppEntry::Presentation)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.apps.read().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<AppInfo> {
        self.apps
            .read()
            .iter()
            .map(|(name, entry)| AppInfo {
                name: name.clone(),
                has_handler: matches!(entry, AppEntry::Service(_)),
            })
            .collect()
    }

    /// `None` for unknown apps, `Some(None)` for presentation-only apps.
    fn handler(&self, name: &str) -> Option<Option<Arc<dyn AppHandler>>> {
        self.apps.read().get(name).map(|entry| match entry {
            AppEntry::Service(h) => Some(h.clone()),
            AppEntry::Presentation => None,
        })
    }
}
