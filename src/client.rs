use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{HomeAssistantConfig, TransportSettings};
use crate::entity::{EntityState, parse_states};
use crate::error::{ClientError, TransportError};
use crate::transport::WsSession;

// =============================================================================
// Collaborator Contract
// =============================================================================

/// The slice of Home Assistant the resolver and executors depend on.
#[async_trait]
pub trait HomeAssistantApi: Send + Sync {
    /// Complete state snapshot.
    async fn get_states(&self) -> Result<Vec<EntityState>, ClientError>;

    /// `Ok(None)` when the entity does not exist.
    async fn get_entity_state(&self, entity_id: &str) -> Result<Option<EntityState>, ClientError>;

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<Value, ClientError>;

    async fn get_script_config(&self, object_id: &str) -> Result<Value, ClientError>;

    async fn render_template(&self, template: &str) -> Result<Value, ClientError>;
}

// =============================================================================
// Home Assistant Client
// =============================================================================

pub struct HomeAssistantClient {
    config: HomeAssistantConfig,
    transport: TransportSettings,
    http_client: Client,
    session: Mutex<Option<Arc<WsSession>>>,
}

impl HomeAssistantClient {
    pub fn new(config: HomeAssistantConfig, transport: TransportSettings) -> Self {
        let http_client = Client::builder()
            .timeout(transport.command_timeout())
            .build()
            .unwrap_or_default();
        Self {
            config,
            transport,
            http_client,
            session: Mutex::new(None),
        }
    }

    /// The live session, connecting a fresh one if the previous reader stopped.
    pub async fn session(&self) -> Result<Arc<WsSession>, TransportError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            tracing::warn!("WebSocket session closed, reconnecting");
        }

        let session = WsSession::connect(&self.config, &self.transport).await?;
        tracing::debug!(ha_version = ?session.ha_version(), "WebSocket session ready");
        *current = Some(session.clone());
        Ok(session)
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.url, endpoint.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.config.token))
    }

    pub async fn rest_get(&self, endpoint: &str) -> Result<Value, ClientError> {
        let request = self.authorized(self.http_client.get(self.endpoint_url(endpoint)));
        self.send(endpoint, request).await
    }

    pub async fn rest_post(&self, endpoint: &str, body: &Value) -> Result<Value, ClientError> {
        let request = self.authorized(self.http_client.post(self.endpoint_url(endpoint)).json(body));
        self.send(endpoint, request).await
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Value, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                ClientError::Connect(self.config.url.clone())
            } else if e.is_timeout() {
                ClientError::Timeout(self.config.url.clone())
            } else {
                ClientError::Http {
                    status: 0,
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            tracing::debug!(%endpoint, status = status.as_u16(), "Home Assistant request failed");

            return Err(match status {
                StatusCode::NOT_FOUND => ClientError::NotFound(endpoint.to_string()),
                StatusCode::UNAUTHORIZED => ClientError::Http {
                    status: 401,
                    endpoint: endpoint.to_string(),
                    message: "Authentication failed. Check that the access token is valid and has not expired.".into(),
                },
                StatusCode::FORBIDDEN => ClientError::Http {
                    status: 403,
                    endpoint: endpoint.to_string(),
                    message: "Access forbidden. The access token may not have sufficient permissions.".into(),
                },
                _ => ClientError::Http {
                    status: status.as_u16(),
                    endpoint: endpoint.to_string(),
                    message: error_text,
                },
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl HomeAssistantApi for HomeAssistantClient {
    async fn get_states(&self) -> Result<Vec<EntityState>, ClientError> {
        let states = self.rest_get("api/states").await?;
        Ok(parse_states(&states))
    }

    async fn get_entity_state(&self, entity_id: &str) -> Result<Option<EntityState>, ClientError> {
        match self.rest_get(&format!("api/states/{}", entity_id)).await {
            Ok(value) => Ok(EntityState::from_json(&value)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<Value, ClientError> {
        tracing::info!(%domain, %service, "calling service");
        self.rest_post(&format!("api/services/{}/{}", domain, service), &data)
            .await
    }

    async fn get_script_config(&self, object_id: &str) -> Result<Value, ClientError> {
        self.rest_get(&format!("api/config/script/config/{}", object_id))
            .await
    }

    async fn render_template(&self, template: &str) -> Result<Value, ClientError> {
        let session = self.session().await?;
        Ok(session.render_template(template).await?)
    }
}
