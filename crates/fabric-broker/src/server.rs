// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2026 Comms Fabric Contributors. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! The [`Broker`] itself: connection table, topic fanout, the WebSocket
//! accept loop, and the wiring seam that lets `fabric-engine` attach as an
//! in-process "local publisher" connection instead of a real socket hop.
//!
//! Each accepted socket splits into a read half and a write half on two
//! tasks: one drains the inbound stream and dispatches it, the other drains
//! an outbound mailbox and writes frames, so a slow reader never blocks a
//! fanout to other connections.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use fabric_common::{BrokerConfig, Envelope, MessageTypeRegistry};
use fabric_tools::ToolMessageRouter;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, OnceCell};

use crate::{
    connection::ConnectionHandle,
    dispatch::{self, connection_closed_status},
    physics::PhysicsRegistry,
};

/// The broker core. Always held behind an `Arc` because every connection
/// task, the liveness sweeper, and the tool router's publish callback all
/// need a handle back into it.
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub registry: Arc<MessageTypeRegistry>,
    pub physics: PhysicsRegistry,
    connections: dashmap::DashMap<String, Arc<ConnectionHandle>>,
    active_streams: std::sync::RwLock<Arc<Map<String, Value>>>,
    tool_router: OnceCell<Arc<ToolMessageRouter>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, registry: Arc<MessageTypeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            physics: PhysicsRegistry::new(),
            connections: dashmap::DashMap::new(),
            active_streams: std::sync::RwLock::new(Arc::new(Map::new())),
            tool_router: OnceCell::new(),
        })
    }

    /// Installs the Tool Message Router. Must happen before `serve()` is
    /// called; constructed after the broker itself since the manager's
    /// publish callback needs a handle back into the broker's fanout.
    pub fn attach_tool_router(&self, router: Arc<ToolMessageRouter>) {
        if self.tool_router.set(router).is_err() {
            log::warn!("tool router already attached, ignoring second attach");
        }
    }

    pub(crate) fn tool_router(&self) -> &Arc<ToolMessageRouter> {
        self.tool_router
            .get()
            .expect("tool router must be attached before the broker serves traffic")
    }

    pub(crate) fn connection(&self, id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn reply(&self, connection_id: &str, envelope: &Envelope) {
        if let Some(conn) = self.connection(connection_id) {
            conn.send(envelope);
        }
    }

    /// Fans `envelope` out to every connection subscribed to `topic`,
    /// at-most-once per subscriber, in the order this is called.
    pub fn fanout(&self, topic: &str, envelope: &Envelope) {
        for entry in self.connections.iter() {
            if entry.value().is_subscribed(topic) {
                entry.value().send(envelope);
            }
        }
    }

    pub(crate) fn active_streams_snapshot(&self) -> Map<String, Value> {
        (*self.active_streams.read().unwrap()).clone()
    }

    /// Copy-on-write merge of an incoming `negotiation` envelope's `data`
    /// into the cached active-streams table.
    pub(crate) fn merge_active_streams(&self, incoming: Map<String, Value>) {
        let mut next = (*self.active_streams.read().unwrap()).clone();
        for (key, value) in incoming {
            next.insert(key, value);
        }
        *self.active_streams.write().unwrap() = Arc::new(next);
    }

    /// Injects a physics-simulation-derived synthetic stream entry into the
    /// cached active-streams table so `query active_streams` consumers see
    /// it uniformly alongside module-sourced streams.
    pub(crate) fn inject_physics_stream(&self, synthetic_key: &str, data: Map<String, Value>) {
        let mut next = (*self.active_streams.read().unwrap()).clone();
        next.insert(synthetic_key.to_string(), Value::Object(data));
        *self.active_streams.write().unwrap() = Arc::new(next);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends a normal-close frame to every live connection, for use on
    /// process shutdown. Does not remove entries from the connection table;
    /// the caller is about to exit anyway.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.connections.iter() {
            entry.value().close(code, reason.to_string());
        }
    }

    /// `/status` payload.
    pub fn status(&self) -> Value {
        serde_json::json!({
            "status": "running",
            "version": fabric_common::version(),
            "connections": self.connection_count(),
            "physics_simulations": self.physics.all().len(),
            "tool_support": true,
            "supported_message_types": self.registry.list_types(None, true),
            "timestamp": fabric_common::now_stamp(),
        })
    }

    /// Attaches the Engine as an in-process pseudo-connection: envelopes the
    /// broker fans out to `broadcast` (such as forwarded `control`/
    /// `config_update` messages) arrive on `to_engine`; envelopes the Engine
    /// sends back (its `negotiation` snapshots, `control_response`,
    /// `config_response`) are run back through the broker's own dispatch
    /// table as if they had arrived over a socket. Returns the sender the
    /// Engine should treat as its outbound `to_broker` channel.
    pub fn attach_local_engine(
        self: &Arc<Self>,
        connection_id: &str,
        to_engine: mpsc::UnboundedSender<Envelope>,
    ) -> mpsc::UnboundedSender<Envelope> {
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<WsMessage>();
        let handle = Arc::new(ConnectionHandle::new(connection_id, ws_tx));
        self.connections.insert(connection_id.to_string(), Arc::clone(&handle));

        tokio::spawn(async move {
            while let Some(message) = ws_rx.recv().await {
                if let WsMessage::Text(text) = message {
                    match Envelope::from_json_str(&text) {
                        Ok(env) => {
                            if to_engine.send(env).is_err() {
                                break;
                            }
                        }
                        Err(err) => log::error!("local publisher produced invalid envelope: {err}"),
                    }
                }
            }
        });

        let (from_engine_tx, mut from_engine_rx) = mpsc::unbounded_channel::<Envelope>();
        let broker = Arc::clone(self);
        let id = connection_id.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = from_engine_rx.recv().await {
                match envelope.to_json_string() {
                    Ok(raw) => dispatch::dispatch_incoming(&broker, &id, &raw).await,
                    Err(err) => log::error!("failed to serialize engine envelope: {err}"),
                }
            }
        });

        from_engine_tx
    }

    fn register_connection(self: &Arc<Self>, id: String, sender: mpsc::UnboundedSender<WsMessage>) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(id.clone(), sender));
        self.connections.insert(id, Arc::clone(&handle));
        handle
    }

    fn remove_connection(&self, id: &str) {
        self.connections.remove(id);
    }

    /// Binds `config.listen_addr` and serves HTTP + WebSocket traffic until
    /// the process is asked to shut down.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("broker listening on {addr}");
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener, returning its local address
    /// before entering the accept loop. Lets tests bind an ephemeral port
    /// (`listen_addr = "127.0.0.1:0"`) and discover what port was chosen.
    pub async fn serve_on(self: Arc<Self>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/", get(banner))
            .route("/status", get(status_handler))
            .fallback(get(ws_upgrade_handler))
            .with_state(self);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn banner() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "comms-fabric-broker",
        "version": fabric_common::version(),
    }))
}

async fn status_handler(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    Json(broker.status())
}

async fn ws_upgrade_handler(State(broker): State<Arc<Broker>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(broker, socket))
}

async fn handle_socket(broker: Arc<Broker>, socket: WebSocket) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

    let handle = broker.register_connection(connection_id.clone(), outbound_tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    send_welcome(&broker, &handle);
    handle.record_ping_sent();
    handle.send(
        &Envelope::new("ping")
            .with_field("timestamp", Value::from(now_epoch_secs()))
            .with_field("target", Value::from("client"))
            .with_field("status", Value::from("active")),
    );

    let idle_timeout = Duration::from_millis(broker.config.idle_timeout_ms);
    let liveness = tokio::spawn(liveness_loop(Arc::clone(&broker), connection_id.clone()));

    loop {
        match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                dispatch::dispatch_incoming(&broker, &connection_id, &text).await;
            }
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => {
                log::warn!("websocket error on {connection_id}: {err}");
                break;
            }
            Err(_elapsed) => {
                log::info!("connection {connection_id} idle timeout, closing");
                break;
            }
        }
    }

    handle.mark_closed();
    liveness.abort();
    writer.abort();
    broker.remove_connection(&connection_id);
}

fn send_welcome(broker: &Broker, handle: &ConnectionHandle) {
    let welcome = Envelope::new("system_info").with_field(
        "data",
        serde_json::json!({
            "version": fabric_common::version(),
            "features": {
                "tool_execution": true,
                "physics_simulation": true,
            },
            "supported_message_types": broker.registry.list_types(None, true),
        }),
    );
    handle.send(&welcome);
}

async fn liveness_loop(broker: Arc<Broker>, connection_id: String) {
    let interval = Duration::from_millis(broker.config.ping_interval_ms.max(1));
    let grace = interval * broker.config.stale_grace_multiplier;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(conn) = broker.connection(&connection_id) else {
            return;
        };
        if connection_closed_status(conn.status()) {
            return;
        }
        let since_pong = conn
            .last_pong_recv()
            .map(|t| chrono::Utc::now().signed_duration_since(t))
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        if since_pong > grace * 2 {
            log::warn!("connection {connection_id} exceeded double grace, closing");
            conn.mark_closed();
            return;
        } else if since_pong > grace {
            conn.mark_stale();
        }
        conn.record_ping_sent();
        conn.send(
            &Envelope::new("ping")
                .with_field("timestamp", Value::from(now_epoch_secs()))
                .with_field("target", Value::from("client"))
                .with_field("status", Value::from("active")),
        );
    }
}

fn now_epoch_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}
