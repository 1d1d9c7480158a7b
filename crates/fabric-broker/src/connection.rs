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

//! Per-connection state: subscriptions, liveness tracking, and the outbound
//! channel a connection's writer task drains.
//!
//! The connection manager equivalent of `stream_handlerv4.0.py`'s
//! `ConnectionManager`: one [`ConnectionHandle`] per accepted socket, held in
//! the broker's `DashMap` rather than a single-threaded `dict`.

use std::{
    collections::HashSet,
    sync::RwLock,
};

use axum::extract::ws::{CloseFrame, Message as WsMessage};
use chrono::{DateTime, Utc};
use fabric_common::{Connection, ConnectionStatus, Envelope};
use tokio::sync::mpsc;

/// A connection's outbound mailbox plus the liveness/subscription state the
/// broker's dispatch table reads and writes.
pub struct ConnectionHandle {
    pub id: String,
    sender: mpsc::UnboundedSender<WsMessage>,
    subscriptions: RwLock<HashSet<String>>,
    last_ping_sent: RwLock<Option<DateTime<Utc>>>,
    last_pong_recv: RwLock<Option<DateTime<Utc>>>,
    latency_ms: RwLock<f64>,
    status: RwLock<ConnectionStatus>,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<String>, sender: mpsc::UnboundedSender<WsMessage>) -> Self {
        let model = Connection::new(id.into());
        Self {
            id: model.id,
            sender,
            subscriptions: RwLock::new(model.subscriptions),
            last_ping_sent: RwLock::new(None),
            last_pong_recv: RwLock::new(Some(Utc::now())),
            latency_ms: RwLock::new(0.0),
            status: RwLock::new(ConnectionStatus::Connected),
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().unwrap().contains(topic)
    }

    pub fn subscribe(&self, topic: impl Into<String>) {
        self.subscriptions.write().unwrap().insert(topic.into());
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions.write().unwrap().remove(topic);
    }

    /// Queues an envelope for delivery; silently drops if the writer task
    /// has already exited (the connection is in the process of closing).
    pub fn send(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.to_json_string() {
            let _ = self.sender.send(WsMessage::Text(text.into()));
        }
    }

    pub fn record_ping_sent(&self) {
        *self.last_ping_sent.write().unwrap() = Some(Utc::now());
    }

    /// Records a pong and derives round-trip latency from the echoed
    /// timestamp, accepting both second- and millisecond-precision values
    /// (magnitudes above `1e12` are treated as milliseconds, matching the
    /// original handler's unit-detection heuristic).
    pub fn record_pong(&self, echoed_timestamp: Option<f64>) {
        let now = Utc::now();
        *self.last_pong_recv.write().unwrap() = Some(now);
        *self.status.write().unwrap() = ConnectionStatus::Connected;

        if let Some(raw) = echoed_timestamp {
            let seconds = normalize_timestamp(raw);
            let now_secs = now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0;
            let rtt_ms = ((now_secs - seconds) * 1000.0).max(0.0);
            *self.latency_ms.write().unwrap() = rtt_ms;
        }
    }

    /// Sends a WebSocket close frame and marks the connection closed.
    /// Silently drops if the writer task has already exited.
    pub fn close(&self, code: u16, reason: impl Into<std::borrow::Cow<'static, str>>) {
        let _ = self.sender.send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
        self.mark_closed();
    }

    pub fn mark_stale(&self) {
        *self.status.write().unwrap() = ConnectionStatus::Stale;
    }

    pub fn mark_closed(&self) {
        *self.status.write().unwrap() = ConnectionStatus::Closed;
    }

    pub fn last_pong_recv(&self) -> Option<DateTime<Utc>> {
        *self.last_pong_recv.read().unwrap()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap()
    }

    /// A serializable snapshot for `connection_info` query replies and the
    /// `/status` HTTP endpoint.
    pub fn snapshot(&self) -> Connection {
        Connection {
            id: self.id.clone(),
            subscriptions: self.subscriptions.read().unwrap().clone(),
            last_ping_sent: *self.last_ping_sent.read().unwrap(),
            last_pong_recv: *self.last_pong_recv.read().unwrap(),
            latency_ms: *self.latency_ms.read().unwrap(),
            status: *self.status.read().unwrap(),
        }
    }
}

/// `1e12` is past the year-2286 boundary for second-precision Unix time, so
/// any timestamp larger than that is assumed to be in milliseconds.
pub fn normalize_timestamp(raw: f64) -> f64 {
    if raw > 1e12 { raw / 1000.0 } else { raw }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1_790_000_000.0, 1_790_000_000.0)]
    #[case(1_790_000_000_000.0, 1_790_000_000.0)]
    fn normalizes_both_second_and_millisecond_timestamps(#[case] raw: f64, #[case] expected: f64) {
        assert!((normalize_timestamp(raw) - expected).abs() < 1e-6);
    }

    #[test]
    fn new_connection_inherits_default_subscriptions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("c1", tx);
        assert!(handle.is_subscribed("broadcast"));
        assert!(handle.is_subscribed("physics"));
        assert!(handle.is_subscribed("tools"));
    }

    #[test]
    fn unsubscribe_removes_topic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("c1", tx);
        handle.unsubscribe("physics");
        assert!(!handle.is_subscribed("physics"));
    }

    #[test]
    fn close_sends_close_frame_and_marks_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("c1", tx);
        handle.close(1000, "server shutting down");

        assert_eq!(handle.status(), ConnectionStatus::Closed);
        match rx.try_recv().unwrap() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason, "server shutting down");
            }
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}
