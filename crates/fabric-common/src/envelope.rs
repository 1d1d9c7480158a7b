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

//! The message envelope common to every frame on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::FabricError, now_stamp};

/// Every JSON frame exchanged over the broker carries at least `type` and
/// `msg-sent-timestamp`; everything else is type-specific and round-trips
/// through `extra` unchanged (round-trip law R1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "msg-sent-timestamp")]
    pub msg_sent_timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Every other top-level field, preserved verbatim so that round-tripping
    /// an unknown or forward-looking message type never drops data.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Builds an envelope with `msg-sent-timestamp` set to now.
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            msg_sent_timestamp: now_stamp(),
            source: None,
            correlation_id: None,
            workflow_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Builds the `{ type: "error", error: {code, message}, msg-sent-timestamp }`
    /// shape sent back to an originating connection (§7).
    pub fn error_response(error: FabricError) -> Self {
        Self::new("error").with_field("error", serde_json::to_value(error).unwrap())
    }

    /// Builds the `{ type: "warning", warning: {code, message}, ... }` shape
    /// used when accepting a deprecated message type (§7, §4.3).
    pub fn warning_response(warning: FabricError) -> Self {
        Self::new("warning").with_field("warning", serde_json::to_value(warning).unwrap())
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn round_trips_unknown_fields() {
        let raw = r#"{"type":"ping","msg-sent-timestamp":"2026-01-01 00:00:00","timestamp":123.0,"target":"sh"}"#;
        let env = Envelope::from_json_str(raw).unwrap();
        assert_eq!(env.msg_type, "ping");
        assert_eq!(env.field("target").unwrap(), "sh");

        let back = env.to_json_string().unwrap();
        let reparsed = Envelope::from_json_str(&back).unwrap();
        assert_eq!(env, reparsed);
    }

    #[rstest]
    #[case("control")]
    #[case("config_update")]
    #[case("tool_call")]
    fn new_sets_type_and_timestamp(#[case] msg_type: &str) {
        let env = Envelope::new(msg_type);
        assert_eq!(env.msg_type, msg_type);
        assert!(!env.msg_sent_timestamp.is_empty());
    }

    #[test]
    fn error_response_shape() {
        let error = FabricError {
            code: "TOOL_NOT_FOUND".into(),
            message: "no executor".into(),
        };
        let env = Envelope::error_response(error);
        assert_eq!(env.msg_type, "error");
        assert_eq!(env.field("error").unwrap()["code"], "TOOL_NOT_FOUND");
    }
}
