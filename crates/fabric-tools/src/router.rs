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

//! The Tool Message Router (C7), a thin adapter between
//! the broker's message table and the [`ToolExecutionManager`].
//!
//! Grounded on `ToolMessageRouter.route_message` in `tool_message_handlers.py`:
//! `tool_call`/`tool_result` are schema-validated and handed to the manager;
//! every other type is left to the broker's own default routing.

use std::sync::Arc;

use fabric_common::{Envelope, FabricError, MessageTypeRegistry};

use crate::manager::ToolExecutionManager;

/// Outcome of offering an envelope to the router.
pub enum ToolRouteResult {
    /// Not a tool message; the broker should apply its own default handling.
    NotToolMessage,
    /// Accepted and handed to the [`ToolExecutionManager`]; no further
    /// action needed (the eventual result, if any, is fanned out
    /// independently through the manager's publish callback).
    Handled,
    /// Failed schema validation; the broker should reply to the originating
    /// connection only, without fanning out.
    ValidationFailed(FabricError),
}

pub struct ToolMessageRouter {
    registry: Arc<MessageTypeRegistry>,
    manager: Arc<ToolExecutionManager>,
}

impl ToolMessageRouter {
    pub fn new(registry: Arc<MessageTypeRegistry>, manager: Arc<ToolExecutionManager>) -> Self {
        Self { registry, manager }
    }

    pub fn handle(&self, envelope: &Envelope) -> ToolRouteResult {
        match envelope.msg_type.as_str() {
            "tool_call" => match self.registry.validate_tool_call(envelope) {
                Ok(()) => {
                    self.manager.handle_tool_call(envelope);
                    ToolRouteResult::Handled
                }
                Err(code) => ToolRouteResult::ValidationFailed(code.into()),
            },
            "tool_result" => match self.registry.validate_tool_result(envelope) {
                Ok(()) => {
                    self.manager.handle_tool_result(envelope);
                    ToolRouteResult::Handled
                }
                Err(code) => ToolRouteResult::ValidationFailed(code.into()),
            },
            _ => ToolRouteResult::NotToolMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use fabric_common::ToolManagerConfig;
    use serde_json::json;

    use super::*;
    use crate::manager::PublishFn;

    fn router() -> ToolMessageRouter {
        let registry = StdArc::new(MessageTypeRegistry::new());
        let publish: PublishFn = StdArc::new(|_env| {});
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);
        ToolMessageRouter::new(registry, manager)
    }

    #[test]
    fn non_tool_message_falls_through_to_default_routing() {
        let router = router();
        let env = Envelope::new("ping");
        assert!(matches!(router.handle(&env), ToolRouteResult::NotToolMessage));
    }

    #[test]
    fn malformed_tool_call_fails_validation_without_touching_manager() {
        let router = router();
        let env = Envelope::new("tool_call").with_source("ui");
        match router.handle(&env) {
            ToolRouteResult::ValidationFailed(err) => assert_eq!(err.code, "VALIDATION_FAILED"),
            _ => panic!("expected validation failure"),
        }
    }

    #[test]
    fn well_formed_tool_call_is_handled() {
        let router = router();
        let env = Envelope::new("tool_call")
            .with_source("ui")
            .with_field("execution_id", json!("e1"))
            .with_field("tool_name", json!("echo"))
            .with_field("parameters", json!({}));
        assert!(matches!(router.handle(&env), ToolRouteResult::Handled));
    }
}
