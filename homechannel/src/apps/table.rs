//! Allow-listed operation dispatch
//!
//! An application exposes exactly the operations put in its table at
//! startup; anything else is answered with an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::debug;

use super::{AppHandler, AppRequest, AppResponse};

/// Operation outcome: a JSON result or a short public error message.
pub type OperationResult = Result<serde_json::Value, String>;

/// Handler for one operation over shared state `S`.
pub type OperationFn<S> = fn(Arc<S>, serde_json::Value) -> BoxFuture<'static, OperationResult>;

/// `operation name -> handler`, fixed after construction
pub struct OperationTable<S> {
    operations: HashMap<&'static str, OperationFn<S>>,
}

impl<S> Default for OperationTable<S> {
    fn default() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }
}

impl<S: Send + Sync + 'static> OperationTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, name: &'static str, operation: OperationFn<S>) -> Self {
        self.operations.insert(name, operation);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.operations.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run `request.operation` against `state`.
    pub async fn dispatch(&self, state: Arc<S>, request: AppRequest) -> AppResponse {
        let Some(operation) = self.operations.get(request.operation.as_str()) else {
            debug!("[apps] rejected unknown operation {}", request.operation);
            return AppResponse::err(
                request.request_id,
                format!("Unknown operation: {}", request.operation),
            );
        };
        match operation(state, request.params).await {
            Ok(result) => AppResponse::ok(request.request_id, result),
            Err(message) => AppResponse::err(request.request_id, message),
        }
    }
}

/// An [`AppHandler`] backed by an [`OperationTable`].
pub struct TableHandler<S> {
    state: Arc<S>,
    table: OperationTable<S>,
}

impl<S: Send + Sync + 'static> TableHandler<S> {
    pub fn new(state: Arc<S>, table: OperationTable<S>) -> Self {
        Self { state, table }
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> AppHandler for TableHandler<S> {
    async fn handle_message(&self, request: AppRequest) -> AppResponse {
        self.table.dispatch(self.state.clone(), request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicU64,
    }

    fn bump(state: Arc<Counter>, params: serde_json::Value) -> BoxFuture<'static, OperationResult> {
        Box::pin(async move {
            let by = params["by"].as_u64().ok_or("Missing 'by'")?;
            let now = state.hits.fetch_add(by, Ordering::SeqCst) + by;
            Ok::<_, String>(json!({ "hits": now }))
        })
    }

    fn request(operation: &str, params: serde_json::Value) -> AppRequest {
        AppRequest {
            request_id: "r1".into(),
            operation: operation.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_dispatch_known_operation() {
        let handler = TableHandler::new(
            Arc::new(Counter::default()),
            OperationTable::new().with("bump", bump),
        );
        let response = handler.handle_message(request("bump", json!({"by": 2}))).await;
        assert!(response.success);
        assert_eq!(response.result, Some(json!({"hits": 2})));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let handler = TableHandler::new(
            Arc::new(Counter::default()),
            OperationTable::new().with("bump", bump),
        );
        // Method-like names that are not in the table are never reachable
        let response = handler.handle_message(request("drop", json!({}))).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Unknown operation: drop"));
    }

    #[tokio::test]
    async fn test_operation_error_is_reported() {
        let table = OperationTable::new().with("bump", bump);
        assert_eq!(table.names(), vec!["bump"]);
        let response = table
            .dispatch(Arc::new(Counter::default()), request("bump", json!({})))
            .await;
        assert_eq!(response.error.as_deref(), Some("Missing 'by'"));
    }
}
