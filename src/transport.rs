//! Authenticated WebSocket session with request/response correlation.
//!
//! Outbound commands get a session-unique increasing id and a pending slot
//! registered before the frame is written. A single reader task retires slots
//! as results arrive, in any order. Event frames with no waiting slot fan out
//! to handlers registered for their `event_type`.
//!
//! A session owns its write gate, pending table and id counter. None of them
//! outlive the connection: once the reader stops, the session is closed for
//! good and [`crate::client::HomeAssistantClient`] connects a fresh one.
//!
//! [`WsSession::subscribe_events`] and [`WsSession::add_event_handler`] are
//! the subscriber surface of the session. The gateway itself only consumes
//! events through `render_template`, which waits on its own id.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{HomeAssistantConfig, TransportSettings};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<Value, TransportError>>;

/// Callback for subscribed events. Errors are logged, never propagated.
pub type EventHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Shared Session State
// =============================================================================

#[derive(Default)]
struct SessionShared {
    pending: Mutex<HashMap<u64, Responder>>,
    /// Second-phase waiters for requests answered by an ack and a later event.
    event_waiters: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    closed: AtomicBool,
}

impl SessionShared {
    fn dispatch(&self, message: Value) {
        let id = message.get("id").and_then(Value::as_u64);
        let message_type = message.get("type").and_then(Value::as_str).unwrap_or_default();

        if message_type == "event" {
            if let Some(waiter) = id.and_then(|id| lock(&self.event_waiters).remove(&id)) {
                let event = message.get("event").cloned().unwrap_or(Value::Null);
                let _ = waiter.send(event);
                return;
            }
            self.fan_out(&message);
            return;
        }

        let Some(id) = id else {
            tracing::debug!(%message_type, "ignoring uncorrelated message");
            return;
        };
        match lock(&self.pending).remove(&id) {
            Some(responder) => {
                let _ = responder.send(parse_result(message));
            }
            None => tracing::debug!(id, %message_type, "no pending request for response"),
        }
    }

    fn fan_out(&self, message: &Value) {
        let event = message.get("event").cloned().unwrap_or(Value::Null);
        let Some(event_type) = event.get("event_type").and_then(Value::as_str) else {
            tracing::debug!("event without event_type dropped");
            return;
        };

        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!(%event_type, %error, "event handler failed"),
                Err(_) => tracing::error!(%event_type, "event handler panicked"),
            }
        }
    }

    /// Register the waiters for `id`. Fails if the session closed before or
    /// while they were being inserted, so no slot outlives `close_all`.
    fn register(
        &self,
        id: u64,
        responder: Responder,
        event_waiter: Option<oneshot::Sender<Value>>,
    ) -> Result<(), TransportError> {
        lock(&self.pending).insert(id, responder);
        if let Some(waiter) = event_waiter {
            lock(&self.event_waiters).insert(id, waiter);
        }
        if self.closed.load(Ordering::SeqCst) {
            self.remove_slot(id);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn remove_slot(&self, id: u64) {
        lock(&self.pending).remove(&id);
        lock(&self.event_waiters).remove(&id);
    }

    fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, responder) in lock(&self.pending).drain() {
            let _ = responder.send(Err(TransportError::Closed));
        }
        // Dropping the senders wakes second-phase waiters with a closed error
        lock(&self.event_waiters).clear();
    }
}

fn parse_result(message: Value) -> Result<Value, TransportError> {
    if message.get("type").and_then(Value::as_str) == Some("pong") {
        return Ok(message);
    }
    if message.get("success") == Some(&json!(true)) {
        return Ok(message.get("result").cloned().unwrap_or(Value::Null));
    }

    let error = message.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let text = error
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(Value::as_str)
        .unwrap_or("Unknown error");
    Err(TransportError::Remote {
        code: code.to_string(),
        message: text.to_string(),
    })
}

/// Removes a request's slots however its caller stops waiting.
struct SlotGuard<'a> {
    shared: &'a SessionShared,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove_slot(self.id);
    }
}

// =============================================================================
// Session
// =============================================================================

pub struct WsSession {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    shared: Arc<SessionShared>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    settings: TransportSettings,
    ha_version: Option<String>,
}

impl WsSession {
    pub async fn connect(
        config: &HomeAssistantConfig,
        settings: &TransportSettings,
    ) -> Result<Arc<Self>, TransportError> {
        let ws_url = config.websocket_url()?;
        let (ws_stream, _) = tokio::time::timeout(settings.auth_timeout(), connect_async(&ws_url))
            .await
            .map_err(|_| TransportError::Connect(format!("timed out connecting to {}", ws_url)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut writer, mut reader) = ws_stream.split();
        let ha_version = authenticate(&mut writer, &mut reader, config, settings).await?;
        tracing::info!(url = %ws_url, ha_version = ?ha_version, "WebSocket session authenticated");

        let shared = Arc::new(SessionShared::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(run_reader(reader, shared.clone(), shutdown.clone()));

        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            shared,
            next_id: AtomicU64::new(1),
            shutdown,
            settings: settings.clone(),
            ha_version,
        }))
    }

    pub fn ha_version(&self) -> Option<&str> {
        self.ha_version.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len() + lock(&self.shared.event_waiters).len()
    }

    #[allow(dead_code)]
    pub fn add_event_handler(&self, event_type: &str, handler: EventHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Send a command with the default command timeout.
    pub async fn command(&self, payload: Value) -> Result<Value, TransportError> {
        self.command_with_timeout(payload, self.settings.command_timeout())
            .await
    }

    pub async fn command_with_timeout(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (responder, response) = oneshot::channel();
        let id = self.submit(payload, responder, None).await?;
        let _guard = SlotGuard {
            shared: &self.shared,
            id,
        };

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                tracing::warn!(id, ?timeout, "command timed out");
                Err(TransportError::Timeout { id, after: timeout })
            }
        }
    }

    #[allow(dead_code)]
    pub async fn subscribe_events(&self, event_type: &str) -> Result<u64, TransportError> {
        let (responder, response) = oneshot::channel();
        let payload = json!({"type": "subscribe_events", "event_type": event_type});
        let id = self.submit(payload, responder, None).await?;
        let _guard = SlotGuard {
            shared: &self.shared,
            id,
        };
        let timeout = self.settings.command_timeout();
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result.map(|_| id),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout { id, after: timeout }),
        }
    }

    /// Evaluate a Jinja template.
    ///
    /// Home Assistant acks `render_template` with a result frame and delivers
    /// the rendered value in a later event frame under the same id, so two
    /// waiters are registered and both are cleaned up on every exit path.
    pub async fn render_template(&self, template: &str) -> Result<Value, TransportError> {
        let timeout = self.settings.template_timeout();
        let (ack_responder, ack) = oneshot::channel();
        let (event_responder, event) = oneshot::channel();
        let payload = json!({
            "type": "render_template",
            "template": template,
            "report_errors": true,
        });
        let id = self
            .submit(payload, ack_responder, Some(event_responder))
            .await?;
        let guard = SlotGuard {
            shared: &self.shared,
            id,
        };

        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(result)) => {
                result?;
            }
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                // A late ack would still leave a listener behind
                drop(guard);
                self.unsubscribe(id).await;
                return Err(TransportError::Timeout { id, after: timeout });
            }
        }

        let event = match tokio::time::timeout(timeout, event).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                drop(guard);
                self.unsubscribe(id).await;
                return Err(TransportError::Timeout { id, after: timeout });
            }
        };
        drop(guard);
        self.unsubscribe(id).await;

        if let Some(message) = event.get("error").and_then(Value::as_str) {
            return Err(TransportError::Remote {
                code: "template_error".into(),
                message: message.to_string(),
            });
        }
        Ok(event.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Best-effort removal of a server-side listener.
    async fn unsubscribe(&self, subscription: u64) {
        if self.is_closed() {
            return;
        }
        let payload = json!({"type": "unsubscribe_events", "subscription": subscription});
        if let Err(error) = self.command(payload).await {
            tracing::warn!(id = subscription, %error, "failed to unsubscribe template listener");
        }
    }

    /// Assign an id and write the frame while holding the send gate. Waiting
    /// for the response happens outside the gate.
    async fn submit(
        &self,
        mut payload: Value,
        responder: Responder,
        event_waiter: Option<oneshot::Sender<Value>>,
    ) -> Result<u64, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let Some(object) = payload.as_object_mut() else {
            return Err(TransportError::Send {
                id,
                message: "command must be a JSON object".into(),
            });
        };
        object.insert("id".into(), json!(id));

        self.shared.register(id, responder, event_waiter)?;

        if let Err(e) = writer.send(Message::Text(payload.to_string().into())).await {
            self.shared.remove_slot(id);
            return Err(TransportError::Send {
                id,
                message: e.to_string(),
            });
        }
        Ok(id)
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn authenticate(
    writer: &mut SplitSink<WsStream, Message>,
    reader: &mut SplitStream<WsStream>,
    config: &HomeAssistantConfig,
    settings: &TransportSettings,
) -> Result<Option<String>, TransportError> {
    let challenge = next_json(reader, settings.auth_timeout(), "auth_required").await?;
    if challenge.get("type").and_then(Value::as_str) != Some("auth_required") {
        return Err(TransportError::Handshake(challenge.to_string()));
    }

    let auth_msg = json!({
        "type": "auth",
        "access_token": config.token
    });
    writer
        .send(Message::Text(auth_msg.to_string().into()))
        .await
        .map_err(|e| TransportError::Connect(format!("failed to send auth: {}", e)))?;

    let response = next_json(reader, settings.auth_timeout(), "auth_ok").await?;
    match response.get("type").and_then(Value::as_str) {
        Some("auth_ok") => Ok(response
            .get("ha_version")
            .and_then(Value::as_str)
            .map(str::to_string)),
        Some("auth_invalid") => Err(TransportError::AuthRejected(
            response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("invalid access token")
                .to_string(),
        )),
        _ => Err(TransportError::Handshake(response.to_string())),
    }
}

async fn next_json(
    reader: &mut SplitStream<WsStream>,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<Value, TransportError> {
    let read = async {
        while let Some(msg) = reader.next().await {
            let msg = msg.map_err(|e| TransportError::Connect(e.to_string()))?;
            if let Message::Text(text) = msg {
                return serde_json::from_str::<Value>(&text)
                    .map_err(|e| TransportError::Handshake(e.to_string()));
            }
        }
        Err(TransportError::Closed)
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| TransportError::AuthTimeout(timeout, waiting_for))?
}

async fn run_reader(
    mut reader: SplitStream<WsStream>,
    shared: Arc<SessionShared>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(message) => shared.dispatch(message),
                    Err(error) => tracing::warn!(%error, "dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Some(Err(error)) => {
                    tracing::error!(%error, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    shared.close_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerStream = WebSocketStream<TcpStream>;

    async fn spawn_server<F, Fut>(handler: F) -> HomeAssistantConfig
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        HomeAssistantConfig::new(format!("http://{}", addr), "secret".into())
    }

    async fn send(ws: &mut ServerStream, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut ServerStream) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn handshake(ws: &mut ServerStream) {
        send(ws, json!({"type": "auth_required", "ha_version": "2025.6.0"})).await;
        let auth = recv(ws).await;
        if auth["access_token"] == "secret" {
            send(ws, json!({"type": "auth_ok", "ha_version": "2025.6.0"})).await;
        } else {
            send(ws, json!({"type": "auth_invalid", "message": "Invalid access token"})).await;
        }
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            auth_timeout_secs: 2,
            command_timeout_secs: 2,
            template_timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let mut config = spawn_server(|mut ws| async move { handshake(&mut ws).await }).await;
        config.token = "wrong".into();
        let result = WsSession::connect(&config, &settings()).await;
        assert!(matches!(result, Err(TransportError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn silent_server_times_out_handshake() {
        let config = spawn_server(|ws| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        })
        .await;
        let settings = TransportSettings {
            auth_timeout_secs: 1,
            ..settings()
        };
        let result = WsSession::connect(&config, &settings).await;
        assert!(matches!(result, Err(TransportError::AuthTimeout(_, "auth_required"))));
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_out_of_order() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let first = recv(&mut ws).await;
            let second = recv(&mut ws).await;
            for request in [second, first] {
                send(
                    &mut ws,
                    json!({
                        "id": request["id"],
                        "type": "result",
                        "success": true,
                        "result": {"echo": request["type"]}
                    }),
                )
                .await;
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        assert_eq!(session.ha_version(), Some("2025.6.0"));
        let (a, b) = tokio::join!(
            session.command(json!({"type": "get_config"})),
            session.command(json!({"type": "get_services"})),
        );
        assert_eq!(a.unwrap()["echo"], "get_config");
        assert_eq!(b.unwrap()["echo"], "get_services");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_cleans_up_only_its_own_slot() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let _ignored = recv(&mut ws).await;
            let answered = recv(&mut ws).await;
            send(
                &mut ws,
                json!({"id": answered["id"], "type": "result", "success": true, "result": 1}),
            )
            .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        let timed_out = session
            .command_with_timeout(json!({"type": "slow"}), Duration::from_millis(200))
            .await;
        assert!(matches!(timed_out, Err(TransportError::Timeout { id: 1, .. })));
        assert_eq!(session.pending_count(), 0);

        let answered = session.command(json!({"type": "fast"})).await.unwrap();
        assert_eq!(answered, json!(1));
    }

    #[tokio::test]
    async fn remote_errors_surface_code_and_message() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let request = recv(&mut ws).await;
            send(
                &mut ws,
                json!({
                    "id": request["id"],
                    "type": "result",
                    "success": false,
                    "error": {"code": "not_found", "message": "Entity not found"}
                }),
            )
            .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        match session.command(json!({"type": "x"})).await {
            Err(TransportError::Remote { code, message }) => {
                assert_eq!(code, "not_found");
                assert_eq!(message, "Entity not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_fan_out_past_failing_handlers() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let subscribe = recv(&mut ws).await;
            let id = subscribe["id"].clone();
            send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null})).await;
            for _ in 0..2 {
                send(
                    &mut ws,
                    json!({
                        "id": id,
                        "type": "event",
                        "event": {"event_type": "state_changed", "data": {"entity_id": "light.a"}}
                    }),
                )
                .await;
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        session.add_event_handler(
            "state_changed",
            Arc::new(|_event: &Value| -> anyhow::Result<()> {
                anyhow::bail!("handler exploded")
            }),
        );
        session.add_event_handler(
            "state_changed",
            Arc::new(|_event: &Value| -> anyhow::Result<()> { panic!("boom") }),
        );
        let counter = seen.clone();
        session.add_event_handler(
            "state_changed",
            Arc::new(move |event: &Value| -> anyhow::Result<()> {
                assert_eq!(event["data"]["entity_id"], "light.a");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        session.subscribe_events("state_changed").await.unwrap();
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn render_template_waits_for_ack_and_event() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let request = recv(&mut ws).await;
            assert_eq!(request["type"], "render_template");
            let id = request["id"].clone();
            send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null})).await;
            send(
                &mut ws,
                json!({"id": id, "type": "event", "event": {"result": "21.5", "listeners": {}}}),
            )
            .await;
            let unsubscribe = recv(&mut ws).await;
            assert_eq!(unsubscribe["type"], "unsubscribe_events");
            assert_eq!(unsubscribe["subscription"], id);
            send(
                &mut ws,
                json!({"id": unsubscribe["id"], "type": "result", "success": true, "result": null}),
            )
            .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        let rendered = session
            .render_template("{{ states('sensor.temp') }}")
            .await
            .unwrap();
        assert_eq!(rendered, json!("21.5"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn render_template_error_cleans_both_waiters() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let request = recv(&mut ws).await;
            send(
                &mut ws,
                json!({
                    "id": request["id"],
                    "type": "result",
                    "success": false,
                    "error": {"code": "template_error", "message": "bad template"}
                }),
            )
            .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        let result = session.render_template("{{ broken").await;
        assert!(matches!(result, Err(TransportError::Remote { .. })));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn render_template_timeout_unsubscribes_listener() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let request = recv(&mut ws).await;
            let id = request["id"].clone();
            send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null})).await;
            let unsubscribe = recv(&mut ws).await;
            send(
                &mut ws,
                json!({"id": unsubscribe["id"], "type": "result", "success": true, "result": null}),
            )
            .await;
            let _ = seen_tx.send((id, unsubscribe));
            while ws.next().await.is_some() {}
        })
        .await;

        let settings = TransportSettings {
            template_timeout_secs: 1,
            ..settings()
        };
        let session = WsSession::connect(&config, &settings).await.unwrap();
        let result = session.render_template("{{ now() }}").await;
        assert!(matches!(result, Err(TransportError::Timeout { id: 1, .. })));
        assert_eq!(session.pending_count(), 0);

        let (id, unsubscribe) = seen_rx.await.unwrap();
        assert_eq!(unsubscribe["type"], "unsubscribe_events");
        assert_eq!(unsubscribe["subscription"], id);
    }

    #[test]
    fn registering_after_close_leaves_no_slot() {
        let shared = SessionShared::default();
        shared.close_all();

        let (responder, mut response) = oneshot::channel();
        let (waiter, _event) = oneshot::channel();
        let result = shared.register(7, responder, Some(waiter));

        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(lock(&shared.pending).is_empty());
        assert!(lock(&shared.event_waiters).is_empty());
        // The responder was dropped with its slot, so nobody waits on it
        assert!(response.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_close_fails_pending_requests() {
        let config = spawn_server(|mut ws| async move {
            handshake(&mut ws).await;
            let _request = recv(&mut ws).await;
            ws.close(None).await.unwrap();
        })
        .await;

        let session = WsSession::connect(&config, &settings()).await.unwrap();
        let result = session.command(json!({"type": "get_states"})).await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(session.is_closed());
        assert!(matches!(
            session.command(json!({"type": "get_states"})).await,
            Err(TransportError::Closed)
        ));
    }
}
