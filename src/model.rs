//! Chat backend abstraction over the provider wire protocol
//!
//! Wraps async-openai behind a narrow [`ChatBackend`] trait so the
//! executor and the reflection loop can be driven by a scripted backend
//! in tests.

use async_openai::types::{
    ChatCompletionNamedToolChoice, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionToolArgs, ChatCompletionToolChoiceOption,
    ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionName, FunctionObjectArgs,
};
use async_trait::async_trait;
use tracing::debug;

use crate::client::ClientManager;
use crate::error::{LlmError, Result};
use crate::items::{Message, ModelRequest, ProviderInfo, Role};
use crate::usage::Usage;

/// A function call as reported by the provider, arguments still unparsed
#[derive(Debug, Clone)]
pub struct RawToolCall {
    pub name: String,
    pub arguments: String,
}

/// One completion as it comes off the wire
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: Option<String>,
    pub tool_call: Option<RawToolCall>,
    pub usage: Usage,
    pub info: ProviderInfo,
}

impl RawCompletion {
    /// Free-text completion, for scripted backends
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_call: None,
            usage: Usage::new(10, 5),
            info: ProviderInfo::default(),
        }
    }

    /// Forced-function completion, for scripted backends
    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            content: None,
            tool_call: Some(RawToolCall {
                name: name.into(),
                arguments: arguments.into(),
            }),
            usage: Usage::new(10, 5),
            info: ProviderInfo::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Trait for chat completion backends
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue one completion call for the request
    async fn complete(&self, request: &ModelRequest) -> Result<RawCompletion>;
}

/// Backend for OpenAI-compatible providers, resolving clients per family
pub struct OpenAiBackend {
    manager: std::sync::Mutex<ClientManager>,
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self::with_manager(ClientManager::new())
    }

    pub fn with_manager(manager: ClientManager) -> Self {
        Self {
            manager: std::sync::Mutex::new(manager),
        }
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage> {
    let converted = match msg.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(msg.content.clone())
            .build()?
            .into(),
    };
    Ok(converted)
}

fn build_wire_request(
    request: &ModelRequest,
) -> Result<async_openai::types::CreateChatCompletionRequest> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
    if let Some(system) = &request.system {
        messages.push(convert_message(&Message::system(system.clone()))?);
    }
    for msg in &request.history {
        messages.push(convert_message(msg)?);
    }
    messages.push(convert_message(&Message::user(request.user.clone()))?);

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder.model(&request.model).messages(messages);

    if let Some(spec) = &request.function {
        let function = FunctionObjectArgs::default()
            .name(&spec.name)
            .description(&spec.description)
            .parameters(spec.parameters.clone())
            .build()?;
        let tool = ChatCompletionToolArgs::default()
            .r#type(ChatCompletionToolType::Function)
            .function(function)
            .build()?;
        builder.tools(vec![tool]);

        let choice = if spec.required {
            ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
                r#type: ChatCompletionToolType::Function,
                function: FunctionName {
                    name: spec.name.clone(),
                },
            })
        } else {
            ChatCompletionToolChoiceOption::Auto
        };
        builder.tool_choice(choice);
    }

    if let Some(temperature) = request.temperature {
        builder.temperature(temperature);
    }
    if let Some(max) = request.max_completion_tokens {
        builder.max_completion_tokens(max);
    }

    Ok(builder.build()?)
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, request: &ModelRequest) -> Result<RawCompletion> {
        let client = {
            let mut manager = self.manager.lock().unwrap_or_else(|e| e.into_inner());
            manager.resolve(&request.model)?.clone()
        };

        let wire_request = build_wire_request(request)?;
        debug!(model = %request.model, forced = request.function.is_some(), "issuing completion");

        let response = client.chat().create(wire_request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse("completion contained no choices"))?;

        let tool_call = choice.message.tool_calls.and_then(|mut calls| {
            if calls.is_empty() {
                None
            } else {
                let call = calls.remove(0);
                Some(RawToolCall {
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
            }
        });

        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_else(Usage::empty);

        Ok(RawCompletion {
            content: choice.message.content,
            tool_call,
            usage,
            info: ProviderInfo {
                system_fingerprint: response.system_fingerprint,
                model: response.model,
                created: response.created as i64,
            },
        })
    }
}

/// Scripted backend for tests: pops pre-programmed results in order.
///
/// When the script runs dry it yields a default text completion, the way
/// a fixed test provider would.
pub struct ScriptedBackend {
    script: std::sync::Mutex<std::collections::VecDeque<Result<RawCompletion>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<RawCompletion>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into_iter().collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of `complete` calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, _request: &ModelRequest) -> Result<RawCompletion> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script
            .pop_front()
            .unwrap_or_else(|| Ok(RawCompletion::text("ok")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::FunctionSpec;

    #[test]
    fn test_wire_request_message_order() {
        let request = ModelRequest::new("gpt-4o", "revise it")
            .with_system("You are an academic writer")
            .with_history(vec![
                Message::user("draft the abstract"),
                Message::assistant("```latex\nx\n```"),
            ]);

        let wire = build_wire_request(&request).unwrap();
        assert_eq!(wire.messages.len(), 4);
        assert!(matches!(
            wire.messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            wire.messages[1],
            ChatCompletionRequestMessage::User(_)
        ));
        assert!(matches!(
            wire.messages[2],
            ChatCompletionRequestMessage::Assistant(_)
        ));
        assert!(matches!(
            wire.messages[3],
            ChatCompletionRequestMessage::User(_)
        ));
    }

    #[test]
    fn test_wire_request_forces_named_function() {
        let spec = FunctionSpec::new(
            "submit_revision",
            "Submit the revised artifact",
            serde_json::json!({"type": "object"}),
        );
        let request = ModelRequest::new("gpt-4o", "go").with_function(spec);

        let wire = build_wire_request(&request).unwrap();
        let tools = wire.tools.as_ref().expect("tools attached");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "submit_revision");
        match wire.tool_choice.as_ref().expect("tool choice set") {
            ChatCompletionToolChoiceOption::Named(named) => {
                assert_eq!(named.function.name, "submit_revision");
            }
            other => panic!("expected named tool choice, got {other:?}"),
        }
    }

    #[test]
    fn test_wire_request_optional_function_stays_auto() {
        let spec = FunctionSpec::new(
            "submit_revision",
            "Submit the revised artifact",
            serde_json::json!({"type": "object"}),
        )
        .allow_text();
        let request = ModelRequest::new("gpt-4o", "go").with_function(spec);

        let wire = build_wire_request(&request).unwrap();
        assert!(matches!(
            wire.tool_choice,
            Some(ChatCompletionToolChoiceOption::Auto)
        ));
    }

    #[tokio::test]
    async fn test_scripted_backend_pops_in_order() {
        let backend = ScriptedBackend::new(vec![
            Ok(RawCompletion::text("first")),
            Ok(RawCompletion::text("second")),
        ]);
        let request = ModelRequest::new("gpt-4o", "hi");

        let first = backend.complete(&request).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("first"));
        let second = backend.complete(&request).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("second"));
        // Dry script falls back to a default completion.
        let third = backend.complete(&request).await.unwrap();
        assert_eq!(third.content.as_deref(), Some("ok"));
        assert_eq!(backend.calls(), 3);
    }
}
