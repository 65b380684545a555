//! Server-side channel routing
//!
//! Every message gets a structured reply when its `requestId` can be read.
//! Unknown apps, presentation-only apps and unknown control types are
//! answered with an error; the channel itself stays open.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    response_type, AppRegistry, AppRequest, AppResponse, ControlRequest, ControlResponse,
    APPS_LIST, CONTROL_CHANNEL_LABEL,
};
use crate::rtc::DataChannel;

fn salvage_request_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("requestId")?.as_str().map(str::to_string)
}

fn encode<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

/// Routes channel messages to the control handler or to applications.
pub struct ChannelRouter {
    registry: Arc<AppRegistry>,
}

impl ChannelRouter {
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// Answer one control-channel message.
    pub fn route_control(&self, raw: &str) -> Option<String> {
        let request: ControlRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                let Some(request_id) = salvage_request_id(raw) else {
                    debug!("[router] dropping malformed control message: {}", e);
                    return None;
                };
                // A readable requestId with a string type always parses
                return encode(&ControlResponse {
                    kind: response_type("error"),
                    request_id,
                    apps: None,
                    error: Some(format!("Malformed control message: {}", e)),
                });
            }
        };

        let mut response = ControlResponse {
            kind: response_type(&request.kind),
            request_id: request.request_id,
            apps: None,
            error: None,
        };
        if request.kind == APPS_LIST {
            response.apps = Some(self.registry.list());
        } else {
            response.error = Some(format!("Unknown control message: {}", request.kind));
        }
        encode(&response)
    }

    /// Answer one message on the channel of application `app`.
    pub async fn route_app(&self, app: &str, raw: &str) -> Option<String> {
        let request: AppRequest = match serde_json::from_str(raw) {
            Ok(r) => r,
            Err(e) => {
                let request_id = salvage_request_id(raw)?;
                return encode(&AppResponse::err(
                    request_id,
                    format!("Malformed request: {}", e),
                ));
            }
        };

        let response = match self.registry.handler(app) {
            None => AppResponse::err(request.request_id, format!("Unknown application: {}", app)),
            Some(None) => AppResponse::err(
                request.request_id,
                format!("Application '{}' has no message handler", app),
            ),
            Some(Some(handler)) => {
                let request_id = request.request_id.clone();
                let mut response = handler.handle_message(request).await;
                // Handlers cannot redirect replies to another waiter
                response.request_id = request_id;
                response
            }
        };
        encode(&response)
    }

    /// Route one message by channel label.
    pub async fn route(&self, label: &str, raw: &str) -> Option<String> {
        if label == CONTROL_CHANNEL_LABEL {
            self.route_control(raw)
        } else {
            self.route_app(label, raw).await
        }
    }

    /// Serve a channel until the remote side closes it.
    ///
    /// Requests on one channel are handled concurrently; replies are matched
    /// by `requestId`, not by order.
    pub fn serve_channel(self: &Arc<Self>, channel: DataChannel) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let (label, outgoing, mut incoming) = channel.into_parts();
            info!("[router] channel opened: {}", label);
            while let Some(raw) = incoming.recv().await {
                let router = router.clone();
                let outgoing = outgoing.clone();
                let label = label.clone();
                tokio::spawn(async move {
                    if let Some(reply) = router.route(&label, &raw).await {
                        let _ = outgoing.send(reply).await;
                    }
                });
            }
            info!("[router] channel closed: {}", label);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{AppHandler, AppInfo};
    use async_trait::async_trait;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl AppHandler for Upper {
        async fn handle_message(&self, request: AppRequest) -> AppResponse {
            let text = request.params["text"].as_str().unwrap_or_default().to_uppercase();
            AppResponse::ok("spoofed", json!(text))
        }
    }

    fn router() -> Arc<ChannelRouter> {
        let registry = AppRegistry::new();
        registry.register("upper", Arc::new(Upper)).unwrap();
        registry.register_presentation("viewer").unwrap();
        Arc::new(ChannelRouter::new(Arc::new(registry)))
    }

    fn parse(reply: Option<String>) -> serde_json::Value {
        serde_json::from_str(&reply.unwrap()).unwrap()
    }

    #[test]
    fn test_apps_list() {
        let reply = router().route_control(r#"{"type":"apps:list","requestId":"c1"}"#);
        let response: ControlResponse = serde_json::from_str(&reply.unwrap()).unwrap();
        assert_eq!(response.kind, "apps:list:response");
        assert_eq!(response.request_id, "c1");
        assert_eq!(
            response.apps.unwrap(),
            vec![
                AppInfo {
                    name: "upper".into(),
                    has_handler: true
                },
                AppInfo {
                    name: "viewer".into(),
                    has_handler: false
                },
            ]
        );
    }

    #[test]
    fn test_unknown_control_type() {
        let value = parse(router().route_control(r#"{"type":"apps:launch","requestId":"c2"}"#));
        assert_eq!(value["type"], "apps:launch:response");
        assert!(value["error"].as_str().unwrap().contains("apps:launch"));
        assert!(router().route_control("{}").is_none());
    }

    #[test]
    fn test_malformed_control_with_request_id_is_answered() {
        // requestId present, type of the wrong shape
        let value = parse(router().route_control(r#"{"type":7,"requestId":"c3"}"#));
        assert_eq!(value["type"], "error:response");
        assert_eq!(value["requestId"], "c3");
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("Malformed control message"));

        let value = parse(router().route_control(r#"{"requestId":"c4"}"#));
        assert_eq!(value["type"], "error:response");
        assert_eq!(value["requestId"], "c4");

        // No readable requestId: nothing to reply to
        assert!(router().route_control(r#"{"type":"apps:list"}"#).is_none());
        assert!(router().route_control("not json").is_none());
    }

    #[tokio::test]
    async fn test_app_request_keeps_request_id() {
        let raw = r#"{"requestId":"a1","operation":"shout","params":{"text":"hi"}}"#;
        let value = parse(router().route_app("upper", raw).await);
        assert_eq!(value, json!({"requestId": "a1", "success": true, "result": "HI"}));
    }

    #[tokio::test]
    async fn test_unknown_and_presentation_apps() {
        let raw = r#"{"requestId":"a2","operation":"x"}"#;
        let value = parse(router().route_app("nope", raw).await);
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Unknown application: nope");

        let value = parse(router().route_app("viewer", raw).await);
        assert_eq!(value["requestId"], "a2");
        assert_eq!(value["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_app_request() {
        let value = parse(router().route_app("upper", r#"{"requestId":"a3"}"#).await);
        assert_eq!(value["requestId"], "a3");
        assert_eq!(value["success"], false);
        assert!(router().route_app("upper", "garbage").await.is_none());
    }

    #[tokio::test]
    async fn test_serve_channel() {
        let (mut client, server) = DataChannel::pair("upper");
        let handle = router().serve_channel(server);

        client
            .send(r#"{"requestId":"s1","operation":"shout","params":{"text":"abc"}}"#.into())
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&client.recv().await.unwrap()).unwrap();
        assert_eq!(value["result"], "ABC");

        drop(client);
        handle.await.unwrap();
    }
}
