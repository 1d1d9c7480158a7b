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

//! The broker's message handling table, one arm per
//! incoming `type`. Grounded on `stream_handlerv4.0.py`'s
//! `handle_message_async` dispatch and its per-type handlers.

use std::sync::Arc;

use fabric_common::{ConnectionStatus, Envelope, FabricError, FabricErrorCode};
use fabric_tools::ToolRouteResult;
use serde_json::{Map, Value};

use crate::{connection::normalize_timestamp, server::Broker};

/// Parses and routes one inbound frame from `connection_id`. Errors while
/// parsing are reported to the sender only; everything else either replies
/// to the sender, fans out on a topic, or both.
pub async fn dispatch_incoming(broker: &Arc<Broker>, connection_id: &str, raw: &str) {
    let envelope = match Envelope::from_json_str(raw) {
        Ok(env) => env,
        Err(err) => {
            log::error!("invalid JSON from {connection_id}: {err}");
            broker.reply(
                connection_id,
                &Envelope::error_response(FabricError {
                    code: "INVALID_JSON".to_string(),
                    message: "message is not valid JSON".to_string(),
                }),
            );
            return;
        }
    };

    match envelope.msg_type.as_str() {
        "ping" => handle_ping(broker, connection_id, &envelope),
        "pong" => handle_pong(broker, connection_id, &envelope),
        "query" => handle_query(broker, connection_id, &envelope),
        "negotiation" => handle_negotiation(broker, &envelope),
        "control" | "config_update" => handle_forwarded_control(broker, connection_id, &envelope),
        "physics_simulation" => handle_physics(broker, connection_id, &envelope),
        "tool_call" | "tool_result" => handle_tool_message(broker, connection_id, &envelope),
        _ => handle_default(broker, connection_id, &envelope),
    }
}

fn handle_ping(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    let target = envelope.field("target").and_then(Value::as_str).unwrap_or("sh");
    if target == "sh" {
        let timestamp = envelope.field("timestamp").cloned().unwrap_or(Value::Null);
        if let Some(conn) = broker.connection(connection_id) {
            conn.record_ping_sent();
        }
        let response = Envelope::new("pong")
            .with_field("timestamp", timestamp)
            .with_field("target", Value::from(target))
            .with_field("server_time", Value::from(now_epoch_secs()))
            .with_field("status", Value::from("active"));
        broker.reply(connection_id, &response);
    } else {
        broker.fanout("broadcast", envelope);
    }
}

fn handle_pong(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    let target = envelope.field("target").and_then(Value::as_str).unwrap_or("sh");
    if target == "sh" {
        let timestamp = envelope.field("timestamp").and_then(Value::as_f64);
        if let Some(conn) = broker.connection(connection_id) {
            conn.record_pong(timestamp.map(normalize_timestamp));
        }
    } else {
        broker.fanout("broadcast", envelope);
    }
}

fn handle_query(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    let query_type = envelope.field("query_type").and_then(Value::as_str).unwrap_or("");
    match query_type {
        "active_streams" => {
            let data = broker.active_streams_snapshot();
            let response = Envelope::new("active_streams").with_field("data", Value::Object(data));
            broker.reply(connection_id, &response);
        }
        "connection_info" => {
            if let Some(conn) = broker.connection(connection_id) {
                let snapshot = conn.snapshot();
                let response = Envelope::new("connection_info")
                    .with_field("data", serde_json::to_value(snapshot).unwrap_or(Value::Null))
                    .with_field("status", Value::from("active"));
                broker.reply(connection_id, &response);
            }
        }
        "physics_simulations" => {
            let data = broker.physics.all();
            let response = Envelope::new("physics_simulations").with_field("data", Value::Object(data));
            broker.reply(connection_id, &response);
        }
        "physics_simulation" => {
            let simulation_id = envelope.field("simulation_id").and_then(Value::as_str).unwrap_or("");
            match broker.physics.get(simulation_id) {
                Some(record) => {
                    let response = Envelope::new("physics_simulation")
                        .with_field("data", serde_json::to_value(record).unwrap_or(Value::Null));
                    broker.reply(connection_id, &response);
                }
                None => {
                    broker.reply(
                        connection_id,
                        &Envelope::error_response(FabricErrorCode::SimulationNotFound(simulation_id.to_string()).into()),
                    );
                }
            }
        }
        _ => broker.fanout("broadcast", envelope),
    }
}

fn handle_negotiation(broker: &Arc<Broker>, envelope: &Envelope) {
    if let Some(Value::Object(incoming)) = envelope.field("data") {
        broker.merge_active_streams(incoming.clone());
    }
    broker.fanout("broadcast", envelope);
}

fn handle_forwarded_control(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    broker.fanout("broadcast", envelope);
    let response_type = if envelope.msg_type == "control" {
        "control_response"
    } else {
        "config_response"
    };
    let response = Envelope::new(response_type).with_field("status", Value::from("forwarded"));
    broker.reply(connection_id, &response);
}

fn handle_physics(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    let action = envelope.field("action").and_then(Value::as_str).unwrap_or("");
    let simulation_id = envelope.field("simulation_id").and_then(Value::as_str).unwrap_or("").to_string();

    match action {
        "register" => {
            let config = envelope.field("config").cloned().unwrap_or(Value::Object(Map::new()));
            broker.physics.register(&simulation_id, config);
            let response = Envelope::new("physics_simulation")
                .with_field("action", Value::from("registered"))
                .with_field("simulation_id", Value::from(simulation_id.clone()))
                .with_field("status", Value::from("success"));
            broker.reply(connection_id, &response);

            let broadcast = Envelope::new("physics_simulation")
                .with_field("action", Value::from("registered"))
                .with_field("simulation_id", Value::from(simulation_id));
            broker.fanout("physics", &broadcast);
        }
        "register_stream" | "update" => {
            let stream_id = envelope.field("stream_id").and_then(Value::as_str).unwrap_or("").to_string();
            let data_field = if action == "register_stream" { "stream_data" } else { "data" };
            let data = match envelope.field(data_field) {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            if stream_id.is_empty() || data.is_empty() {
                return;
            }

            let synthetic_key = if action == "register_stream" {
                broker.physics.register_stream(&simulation_id, &stream_id, data.clone())
            } else {
                broker.physics.update_stream(&simulation_id, &stream_id, data.clone())
            };

            let Some(synthetic_key) = synthetic_key else {
                broker.reply(
                    connection_id,
                    &Envelope::error_response(FabricErrorCode::SimulationNotFound(simulation_id).into()),
                );
                return;
            };

            let physics_broadcast = Envelope::new("physics_simulation")
                .with_field("action", Value::from(if action == "register_stream" { "stream_registered" } else { "updated" }))
                .with_field("simulation_id", Value::from(simulation_id.clone()))
                .with_field("stream_id", Value::from(stream_id.clone()))
                .with_field("data", Value::Object(data.clone()));
            broker.fanout("physics", &physics_broadcast);

            broker.inject_physics_stream(&synthetic_key, data);

            if action == "register_stream" {
                let response = Envelope::new("physics_simulation")
                    .with_field("action", Value::from("stream_registered"))
                    .with_field("simulation_id", Value::from(simulation_id))
                    .with_field("stream_id", Value::from(stream_id))
                    .with_field("status", Value::from("success"));
                broker.reply(connection_id, &response);
            }
        }
        "status" | "control" | "remove" => {
            if action == "remove" {
                broker.physics.remove(&simulation_id);
            }
            broker.fanout("physics", envelope);
        }
        _ => broker.fanout("physics", envelope),
    }
}

fn handle_tool_message(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    match broker.tool_router().handle(envelope) {
        ToolRouteResult::Handled | ToolRouteResult::NotToolMessage => {}
        ToolRouteResult::ValidationFailed(err) => {
            broker.reply(connection_id, &Envelope::error_response(err));
        }
    }
}

fn handle_default(broker: &Arc<Broker>, connection_id: &str, envelope: &Envelope) {
    if broker.registry.is_registered(&envelope.msg_type) {
        if broker.registry.is_deprecated(&envelope.msg_type) {
            let replacement = broker.registry.get_replacement_type(&envelope.msg_type);
            let mut message = format!("message type '{}' is deprecated", envelope.msg_type);
            if let Some(replacement) = replacement {
                message.push_str(&format!(", use '{replacement}' instead"));
            }
            broker.reply(
                connection_id,
                &Envelope::warning_response(FabricError {
                    code: "DEPRECATED_MESSAGE_TYPE".to_string(),
                    message,
                }),
            );
        }
        broker.fanout("broadcast", envelope);
        return;
    }

    log::warn!("unrecognized message type '{}' from {connection_id}", envelope.msg_type);
    broker.fanout("broadcast", envelope);
}

fn now_epoch_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

pub(crate) fn connection_closed_status(status: ConnectionStatus) -> bool {
    status == ConnectionStatus::Closed
}
