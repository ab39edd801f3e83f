//! Items representing conversation messages, function specs, and model output
//!
//! This module defines the core data structures exchanged with the model.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
///
/// Histories are append-only: the executor never rewrites prior turns, it
/// returns an extended copy with the new user and assistant turns appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Specification of a function the model must answer through.
///
/// `parameters` is a JSON Schema object describing the argument payload.
/// With `required` set, the model is forced to respond via this function
/// and a free-text reply is a contract violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub required: bool,
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required: true,
        }
    }

    /// Derive the parameter schema from a typed argument struct.
    pub fn of<T: JsonSchema>(name: impl Into<String>, description: impl Into<String>) -> Self {
        let schema = schemars::schema_for!(T);
        let parameters =
            serde_json::to_value(schema.schema).unwrap_or_else(|_| Value::Object(Default::default()));
        Self::new(name, description, parameters)
    }

    /// Permit a free-text reply instead of the function call.
    pub fn allow_text(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Output of one model call: free text, or the argument payload of a
/// forced function call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ModelOutput {
    Text(String),
    Structured(Value),
}

impl ModelOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ModelOutput::Text(s) => Some(s),
            ModelOutput::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            ModelOutput::Text(_) => None,
            ModelOutput::Structured(v) => Some(v),
        }
    }
}

/// Provider-reported metadata for one completed call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub system_fingerprint: Option<String>,
    pub model: String,
    pub created: i64,
}

/// One model invocation.
///
/// The outgoing message sequence is always system message (if present),
/// then `history` in order, then the new `user` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system: Option<String>,
    pub history: Vec<Message>,
    pub user: String,
    pub function: Option<FunctionSpec>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            history: Vec::new(),
            user: user.into(),
            function: None,
            temperature: None,
            max_completion_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_function(mut self, function: FunctionSpec) -> Self {
        self.function = Some(function);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Result of one model invocation.
///
/// `history` is the request history extended with the new user turn and
/// the assistant turn, so callers can continue the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub output: ModelOutput,
    pub history: Vec<Message>,
    pub usage: crate::usage::Usage,
    pub latency: std::time::Duration,
    pub info: ProviderInfo,
}
