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

//! End-to-end coverage of the broker over a real socket: binds an ephemeral
//! port, drives the accept loop with a `tokio-tungstenite` client, and
//! exercises the welcome/ping/negotiation/query handshake from
//! `stream_handlerv4.0.py`'s `ConnectionManager.handle_connection` that
//! `server.rs`/`dispatch.rs` have no in-crate unit coverage for.

use std::sync::Arc;

use fabric_common::{BrokerConfig, Envelope, MessageTypeRegistry};
use fabric_broker::Broker;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as TMessage;

async fn spawn_broker() -> (Arc<Broker>, String) {
    let config = BrokerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..BrokerConfig::default()
    };
    let registry = Arc::new(MessageTypeRegistry::new());
    let broker = Broker::new(config, registry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let serving = Arc::clone(&broker);
    tokio::spawn(async move {
        let _ = serving.serve_on(listener).await;
    });

    (broker, format!("ws://{addr}"))
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("ws error") {
            TMessage::Text(text) => return serde_json::from_str(&text).expect("valid json frame"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn connect_receives_welcome_then_initial_ping() {
    let (_broker, url) = spawn_broker().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "system_info");

    let ping = next_json(&mut ws).await;
    assert_eq!(ping["type"], "ping");
    assert_eq!(ping["target"], "client");
}

#[tokio::test]
async fn pong_reply_is_recorded_and_query_sees_live_connection() {
    let (_broker, url) = spawn_broker().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");

    let _welcome = next_json(&mut ws).await;
    let _ping = next_json(&mut ws).await;

    let pong = Envelope::new("pong")
        .with_field("target", Value::from("sh"))
        .with_field("timestamp", Value::from(0.0));
    ws.send(TMessage::Text(pong.to_json_string().unwrap().into())).await.unwrap();

    let query = Envelope::new("query").with_field("query_type", Value::from("connection_info"));
    ws.send(TMessage::Text(query.to_json_string().unwrap().into())).await.unwrap();

    let response = next_json(&mut ws).await;
    assert_eq!(response["type"], "connection_info");
    assert_eq!(response["status"], "active");
}

#[tokio::test]
async fn negotiation_merges_into_active_streams_then_visible_to_query() {
    let (_broker, url) = spawn_broker().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");
    let _welcome = next_json(&mut ws).await;
    let _ping = next_json(&mut ws).await;

    let negotiation = Envelope::new("negotiation").with_field(
        "data",
        serde_json::json!({"temperature": {"value": 21.5, "datatype": "float"}}),
    );
    ws.send(TMessage::Text(negotiation.to_json_string().unwrap().into())).await.unwrap();

    // Negotiation fans out on "broadcast"; this connection auto-subscribes
    // to it, so the echo confirms the merge happened before the reply.
    let echoed = next_json(&mut ws).await;
    assert_eq!(echoed["type"], "negotiation");

    let query = Envelope::new("query").with_field("query_type", Value::from("active_streams"));
    ws.send(TMessage::Text(query.to_json_string().unwrap().into())).await.unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["type"], "active_streams");
    assert_eq!(response["data"]["temperature"]["value"], 21.5);
}
