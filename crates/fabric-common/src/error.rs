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

//! The small set of coded, wire-visible error conditions.
//!
//! Everything else in this workspace propagates as `anyhow::Result`; this
//! enum exists only where a `code` string must cross the wire inside an
//! `error` or `warning` envelope body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A coded error surfaced to a connected client inside a `tool_result`,
/// `error`, or `warning` envelope.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FabricErrorCode {
    #[error("no executor registered for tool: {0}")]
    ToolNotFound(String),

    #[error("execution id already exists: {0}")]
    DuplicateExecution(String),

    #[error("tool execution timed out")]
    Timeout,

    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("error handling tool_call: {0}")]
    HandlerError(String),

    #[error("simulation not found: {0}")]
    SimulationNotFound(String),

    #[error("message validation failed: {0}")]
    ValidationFailed(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),
}

impl FabricErrorCode {
    /// The short uppercase code used as `error.code` on the wire, matching
    /// the original Python implementation's string constants.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::DuplicateExecution(_) => "DUPLICATE_EXECUTION",
            Self::Timeout => "TIMEOUT",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::Cancelled(_) => "CANCELLED",
            Self::HandlerError(_) => "HANDLER_ERROR",
            Self::SimulationNotFound(_) => "SIMULATION_NOT_FOUND",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::UnknownMessageType(_) => "UNKNOWN_MESSAGE_TYPE",
            Self::ModuleNotFound(_) => "MODULE_NOT_FOUND",
        }
    }
}

/// Wire shape of an `error` or `error`/`warning` field: `{ code, message }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FabricError {
    pub code: String,
    pub message: String,
}

impl From<FabricErrorCode> for FabricError {
    fn from(err: FabricErrorCode) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_match_wire_contract() {
        assert_eq!(
            FabricErrorCode::ToolNotFound("echo".into()).code(),
            "TOOL_NOT_FOUND"
        );
        assert_eq!(FabricErrorCode::Timeout.code(), "TIMEOUT");
        assert_eq!(
            FabricErrorCode::Cancelled("shutdown".into()).code(),
            "CANCELLED"
        );
    }

    #[test]
    fn converts_into_wire_error() {
        let err: FabricError = FabricErrorCode::DuplicateExecution("e1".into()).into();
        assert_eq!(err.code, "DUPLICATE_EXECUTION");
        assert!(err.message.contains("e1"));
    }
}
