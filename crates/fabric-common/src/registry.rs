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

//! The Message Schema & Type Registry (C1).
//!
//! Grounded directly on `message_registry.py`'s `MessageTypeRegistry`: the
//! MVP type table, deprecation/replacement tracking, and middleware chain
//! contract are carried over field-for-field.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{envelope::Envelope, error::FabricErrorCode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageCategory {
    ToolExecution,
    Cognitive,
    System,
    Legacy,
}

/// Metadata about a registered message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTypeInfo {
    pub message_type: String,
    pub category: MessageCategory,
    pub description: String,
    pub schema_version: String,
    #[serde(default)]
    pub priority: MessagePriority,
    pub requires_response: bool,
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub deprecated: bool,
    pub replacement_type: Option<String>,
}

impl MessageTypeInfo {
    fn new(
        message_type: &str,
        category: MessageCategory,
        description: &str,
        requires_response: bool,
        timeout_seconds: Option<f64>,
    ) -> Self {
        Self {
            message_type: message_type.to_string(),
            category,
            description: description.to_string(),
            schema_version: "1.0".to_string(),
            priority: MessagePriority::default(),
            requires_response,
            timeout_seconds,
            deprecated: false,
            replacement_type: None,
        }
    }

    fn deprecated_by(mut self, replacement: &str) -> Self {
        self.deprecated = true;
        self.replacement_type = Some(replacement.to_string());
        self
    }
}

/// A middleware invoked as a chain wrapping each dispatched message; it may
/// short-circuit by not invoking `next`.
pub trait Middleware: Send + Sync {
    fn handle(&self, message: &Envelope, next: &mut dyn FnMut(&Envelope));
}

impl<F> Middleware for F
where
    F: Fn(&Envelope, &mut dyn FnMut(&Envelope)) + Send + Sync,
{
    fn handle(&self, message: &Envelope, next: &mut dyn FnMut(&Envelope)) {
        self(message, next)
    }
}

/// Registry for managing message types, their metadata, and middleware.
///
/// Schema validation for `tool_call`/`tool_result` bodies is compiled once
/// at construction via `jsonschema`, since this dependency graph otherwise
/// carries no JSON Schema crate.
pub struct MessageTypeRegistry {
    types: HashMap<String, MessageTypeInfo>,
    middleware: Vec<Arc<dyn Middleware>>,
    tool_call_schema: jsonschema::Validator,
    tool_result_schema: jsonschema::Validator,
}

impl std::fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .field("middleware_count", &self.middleware.len())
            .finish()
    }
}

fn tool_call_schema_doc() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["type", "source", "tool_name", "parameters", "execution_id", "msg-sent-timestamp"],
        "properties": {
            "type": { "const": "tool_call" },
            "source": { "type": "string" },
            "tool_name": { "type": "string" },
            "parameters": { "type": "object" },
            "execution_id": { "type": "string" },
            "msg-sent-timestamp": { "type": "string" },
            "context": {
                "type": "object",
                "properties": {
                    "timeout": { "type": "number" },
                    "retry_count": { "type": "integer" }
                }
            },
            "security": { "type": "object" }
        }
    })
}

fn tool_result_schema_doc() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["type", "execution_id", "tool_name", "status", "source", "msg-sent-timestamp"],
        "properties": {
            "type": { "const": "tool_result" },
            "execution_id": { "type": "string" },
            "tool_name": { "type": "string" },
            "status": { "enum": ["success", "error", "timeout", "cancelled", "partial"] },
            "source": { "type": "string" },
            "msg-sent-timestamp": { "type": "string" },
            "result": {},
            "error": {
                "type": "object",
                "required": ["code", "message"],
                "properties": {
                    "code": { "type": "string" },
                    "message": { "type": "string" }
                }
            }
        }
    })
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTypeRegistry {
    /// Builds a registry pre-populated with the MVP type table of
    /// Matching `message_registry.py`'s
    /// `_initialize_core_types`.
    pub fn new() -> Self {
        let tool_call_schema = jsonschema::validator_for(&tool_call_schema_doc())
            .expect("tool_call schema literal is valid JSON Schema");
        let tool_result_schema = jsonschema::validator_for(&tool_result_schema_doc())
            .expect("tool_result schema literal is valid JSON Schema");

        let mut registry = Self {
            types: HashMap::new(),
            middleware: Vec::new(),
            tool_call_schema,
            tool_result_schema,
        };
        registry.initialize_core_types();
        registry
    }

    fn initialize_core_types(&mut self) {
        self.register_type(MessageTypeInfo::new(
            "tool_call",
            MessageCategory::ToolExecution,
            "Request to execute a tool with specified parameters",
            true,
            Some(300.0),
        ));
        self.register_type(MessageTypeInfo::new(
            "tool_result",
            MessageCategory::ToolExecution,
            "Result of tool execution with status and output",
            false,
            None,
        ));
        self.register_type(MessageTypeInfo::new(
            "ally_intent",
            MessageCategory::Cognitive,
            "Cognitive intent extracted from user input",
            true,
            Some(30.0),
        ));
        self.register_type(MessageTypeInfo::new(
            "ally_memory",
            MessageCategory::Cognitive,
            "Memory storage and retrieval operations",
            true,
            Some(10.0),
        ));
        self.register_type(MessageTypeInfo::new(
            "ally_query",
            MessageCategory::Cognitive,
            "System queries for status and information",
            true,
            Some(5.0),
        ));
        self.register_type(MessageTypeInfo::new(
            "ally_status",
            MessageCategory::Cognitive,
            "System status and health information",
            false,
            None,
        ));
        self.register_type(MessageTypeInfo::new(
            "negotiation",
            MessageCategory::Legacy,
            "Periodic snapshot of all modules and their streams",
            false,
            None,
        ));
        self.register_type(
            MessageTypeInfo::new(
                "query",
                MessageCategory::Legacy,
                "Legacy query message",
                true,
                None,
            )
            .deprecated_by("ally_query"),
        );
    }

    /// Registers a new message type. Returns `false` (and logs a warning) if
    /// the type already exists, matching the original's idempotency guard.
    pub fn register_type(&mut self, info: MessageTypeInfo) -> bool {
        if self.types.contains_key(&info.message_type) {
            log::warn!("message type '{}' already registered", info.message_type);
            return false;
        }
        log::info!("registered message type: {}", info.message_type);
        self.types.insert(info.message_type.clone(), info);
        true
    }

    pub fn unregister_type(&mut self, message_type: &str) -> bool {
        if self.types.remove(message_type).is_some() {
            log::info!("unregistered message type: {message_type}");
            true
        } else {
            log::warn!("message type '{message_type}' not found");
            false
        }
    }

    pub fn get_type_info(&self, message_type: &str) -> Option<&MessageTypeInfo> {
        self.types.get(message_type)
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.types.contains_key(message_type)
    }

    pub fn is_deprecated(&self, message_type: &str) -> bool {
        self.types.get(message_type).is_some_and(|t| t.deprecated)
    }

    pub fn get_replacement_type(&self, message_type: &str) -> Option<&str> {
        self.types
            .get(message_type)
            .filter(|t| t.deprecated)
            .and_then(|t| t.replacement_type.as_deref())
    }

    pub fn list_types(&self, category: Option<MessageCategory>, include_deprecated: bool) -> Vec<String> {
        let mut types: Vec<String> = self
            .types
            .values()
            .filter(|info| category.is_none_or(|c| info.category == c))
            .filter(|info| include_deprecated || !info.deprecated)
            .map(|info| info.message_type.clone())
            .collect();
        types.sort();
        types
    }

    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
        log::info!("registered message middleware");
    }

    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    /// Validates that an envelope's `type` is registered; logs (and the
    /// caller may additionally surface) a deprecation warning when it is.
    pub fn validate_message_type(&self, envelope: &Envelope) -> Result<(), FabricErrorCode> {
        if !self.is_registered(&envelope.msg_type) {
            return Err(FabricErrorCode::UnknownMessageType(envelope.msg_type.clone()));
        }
        if self.is_deprecated(&envelope.msg_type) {
            let replacement = self.get_replacement_type(&envelope.msg_type);
            match replacement {
                Some(r) => log::warn!(
                    "message type '{}' is deprecated, use '{r}' instead",
                    envelope.msg_type
                ),
                None => log::warn!("message type '{}' is deprecated", envelope.msg_type),
            }
        }
        Ok(())
    }

    /// Validates a `tool_call` envelope's body against its JSON Schema
    ///
    pub fn validate_tool_call(&self, envelope: &Envelope) -> Result<(), FabricErrorCode> {
        self.validate_against(&self.tool_call_schema, envelope)
    }

    /// Validates a `tool_result` envelope's body against its JSON Schema.
    pub fn validate_tool_result(&self, envelope: &Envelope) -> Result<(), FabricErrorCode> {
        self.validate_against(&self.tool_result_schema, envelope)
    }

    fn validate_against(
        &self,
        validator: &jsonschema::Validator,
        envelope: &Envelope,
    ) -> Result<(), FabricErrorCode> {
        let value = serde_json::to_value(envelope)
            .map_err(|e| FabricErrorCode::ValidationFailed(e.to_string()))?;
        validator
            .validate(&value)
            .map_err(|e| FabricErrorCode::ValidationFailed(e.to_string()))
    }

    /// Point-in-time statistics, mirroring `get_statistics()` in the
    /// original registry; surfaced on the broker's `/status` endpoint.
    pub fn statistics(&self) -> RegistryStatistics {
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut deprecated_count = 0;
        for info in self.types.values() {
            *by_category.entry(info.category.to_string()).or_default() += 1;
            if info.deprecated {
                deprecated_count += 1;
            }
        }
        RegistryStatistics {
            total_types: self.types.len(),
            middleware_count: self.middleware.len(),
            by_category,
            deprecated_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total_types: usize,
    pub middleware_count: usize,
    pub by_category: HashMap<String, usize>,
    pub deprecated_count: usize,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn bootstraps_mvp_type_table() {
        let registry = MessageTypeRegistry::new();
        assert!(registry.is_registered("tool_call"));
        assert!(registry.is_registered("tool_result"));
        assert!(registry.is_registered("ally_query"));
        assert!(registry.is_registered("negotiation"));
        assert!(registry.is_registered("query"));
    }

    #[test]
    fn query_type_is_deprecated_in_favor_of_ally_query() {
        let registry = MessageTypeRegistry::new();
        assert!(registry.is_deprecated("query"));
        assert_eq!(registry.get_replacement_type("query"), Some("ally_query"));
        assert!(!registry.is_deprecated("tool_call"));
    }

    #[rstest]
    #[case("tool_call", true)]
    #[case("made_up_type", false)]
    fn is_registered_cases(#[case] msg_type: &str, #[case] expected: bool) {
        let registry = MessageTypeRegistry::new();
        assert_eq!(registry.is_registered(msg_type), expected);
    }

    #[test]
    fn unknown_type_fails_validation() {
        let registry = MessageTypeRegistry::new();
        let env = Envelope::new("not_a_real_type");
        let err = registry.validate_message_type(&env).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MESSAGE_TYPE");
    }

    #[test]
    fn valid_tool_call_passes_schema() {
        let registry = MessageTypeRegistry::new();
        let env = Envelope::new("tool_call")
            .with_source("ui")
            .with_field("tool_name", "echo".into())
            .with_field("execution_id", "e1".into())
            .with_field("parameters", serde_json::json!({"x": 7}));
        assert!(registry.validate_tool_call(&env).is_ok());
    }

    #[test]
    fn tool_call_missing_required_field_fails_schema() {
        let registry = MessageTypeRegistry::new();
        let env = Envelope::new("tool_call").with_source("ui");
        assert!(registry.validate_tool_call(&env).is_err());
    }

    #[test]
    fn list_types_excludes_deprecated_on_request() {
        let registry = MessageTypeRegistry::new();
        let all = registry.list_types(None, true);
        let non_deprecated = registry.list_types(None, false);
        assert!(all.contains(&"query".to_string()));
        assert!(!non_deprecated.contains(&"query".to_string()));
    }
}
