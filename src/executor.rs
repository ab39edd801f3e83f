//! Request execution: one model call, retried, parsed, and accounted
//!
//! [`Executor::query`] builds the outgoing message sequence, drives the
//! call through the retry engine, enforces the forced-function contract,
//! and reports every call that reached the provider to the usage ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_openai::error::OpenAIError;
use jsonschema::Draft;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{LlmError, Result};
use crate::items::{FunctionSpec, Message, ModelOutput, ModelRequest, ModelResponse};
use crate::model::{ChatBackend, OpenAiBackend, RawCompletion};
use crate::retry::{retry_async, ErrorClassifier, OpenAiClassifier, RetryPolicy};
use crate::usage::{CallRecord, Usage, UsageLedger};

/// Executes model requests against a backend
pub struct Executor<B: ChatBackend> {
    backend: B,
    ledger: Arc<UsageLedger>,
    retry: RetryConfig,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Executor<OpenAiBackend> {
    /// Executor over the OpenAI-compatible backend with default retry
    pub fn openai(ledger: Arc<UsageLedger>) -> Self {
        Self::new(OpenAiBackend::new(), ledger)
    }
}

impl<B: ChatBackend> Executor<B> {
    pub fn new(backend: B, ledger: Arc<UsageLedger>) -> Self {
        Self {
            backend,
            ledger,
            retry: RetryConfig::default(),
            classifier: Arc::new(OpenAiClassifier),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Swap the failure classifier, keeping the retry engine provider-agnostic
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Issue one model call.
    ///
    /// Transient failures are retried per the configured policy. The
    /// returned history is the request history plus the new user turn and
    /// the assistant turn.
    pub async fn query(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let mut policy = RetryPolicy::new(self.retry.clone());
        let (raw, latency) = retry_async(
            || self.attempt_once(request),
            &mut policy,
            self.classifier.as_ref(),
        )
        .await?;

        let output = parse_output(request.function.as_ref(), &raw)?;

        let mut history = request.history.clone();
        history.push(Message::user(request.user.clone()));
        history.push(Message::assistant(assistant_turn_content(&output)));

        debug!(
            model = %request.model,
            prompt_tokens = raw.usage.prompt_tokens,
            completion_tokens = raw.usage.completion_tokens,
            latency_ms = latency.as_millis() as u64,
            "completion parsed"
        );

        Ok(ModelResponse {
            output,
            history,
            usage: raw.usage,
            latency,
            info: raw.info,
        })
    }

    /// One attempt: time the call and record it if it reached the provider.
    async fn attempt_once(&self, request: &ModelRequest) -> Result<(RawCompletion, Duration)> {
        let start = Instant::now();
        match self.backend.complete(request).await {
            Ok(raw) => {
                let latency = start.elapsed();
                self.ledger.record(CallRecord::new(
                    &request.model,
                    raw.usage.clone(),
                    latency,
                    true,
                ));
                Ok((raw, latency))
            }
            Err(error) => {
                if reached_provider(&error) {
                    self.ledger.record(CallRecord::new(
                        &request.model,
                        Usage::empty(),
                        start.elapsed(),
                        false,
                    ));
                }
                Err(error)
            }
        }
    }
}

/// Whether a failed call still reached the provider. Calls that never got
/// there (connect failures, request-build errors) are not accounted.
fn reached_provider(error: &LlmError) -> bool {
    matches!(
        error,
        LlmError::Provider(OpenAIError::ApiError(_))
            | LlmError::Provider(OpenAIError::JSONDeserialize(_))
    )
}

fn assistant_turn_content(output: &ModelOutput) -> String {
    match output {
        ModelOutput::Text(text) => text.clone(),
        ModelOutput::Structured(value) => value.to_string(),
    }
}

fn parse_output(spec: Option<&FunctionSpec>, raw: &RawCompletion) -> Result<ModelOutput> {
    let Some(spec) = spec else {
        let content = raw
            .content
            .clone()
            .ok_or_else(|| LlmError::parse("completion had no text content"))?;
        return Ok(ModelOutput::Text(content));
    };

    let Some(call) = &raw.tool_call else {
        if !spec.required {
            let content = raw
                .content
                .clone()
                .ok_or_else(|| LlmError::parse("completion had neither text nor a function call"))?;
            return Ok(ModelOutput::Text(content));
        }
        return Err(LlmError::SchemaMismatch {
            expected: spec.name.clone(),
            actual: "(no function call)".to_string(),
        });
    };

    if call.name != spec.name {
        return Err(LlmError::SchemaMismatch {
            expected: spec.name.clone(),
            actual: call.name.clone(),
        });
    }

    let payload: serde_json::Value = serde_json::from_str(&call.arguments)
        .map_err(|e| LlmError::parse(format!("malformed function arguments: {e}")))?;

    validate_against_schema(&payload, &spec.parameters)?;

    Ok(ModelOutput::Structured(payload))
}

/// Validate a payload against the function's parameter schema (draft 2020-12)
fn validate_against_schema(payload: &serde_json::Value, schema: &serde_json::Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|e| LlmError::parse(format!("invalid parameter schema: {e}")))?;

    let messages: Vec<String> = compiled
        .iter_errors(payload)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(LlmError::parse(format!(
            "function arguments failed schema validation: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedBackend;
    use async_openai::error::ApiError;

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn rate_limit() -> LlmError {
        LlmError::Provider(OpenAIError::ApiError(ApiError {
            message: "Rate limit reached for requests".to_string(),
            r#type: Some("requests".to_string()),
            param: None,
            code: None,
        }))
    }

    fn executor(script: Vec<Result<RawCompletion>>, max_attempts: usize) -> Executor<ScriptedBackend> {
        Executor::new(ScriptedBackend::new(script), Arc::new(UsageLedger::new()))
            .with_retry(fast_retry(max_attempts))
    }

    fn object_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "artifact": { "type": ["string", "null"] },
                "done": { "type": "boolean" }
            },
            "required": ["done"]
        })
    }

    #[tokio::test]
    async fn test_query_returns_text_and_extends_history() {
        let exec = executor(vec![Ok(RawCompletion::text("the reply"))], 3);
        let request = ModelRequest::new("gpt-4o", "the prompt")
            .with_system("sys")
            .with_history(vec![Message::user("a"), Message::assistant("b")]);

        let response = exec.query(&request).await.unwrap();
        assert_eq!(response.output.as_text(), Some("the reply"));
        // input history + user turn + assistant turn
        assert_eq!(response.history.len(), request.history.len() + 2);
        assert_eq!(response.history[2], Message::user("the prompt"));
        assert_eq!(response.history[3], Message::assistant("the reply"));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let exec = executor(
            vec![
                Err(rate_limit()),
                Err(rate_limit()),
                Ok(RawCompletion::text("made it")),
            ],
            5,
        );
        let request = ModelRequest::new("gpt-4o", "go");

        let response = exec.query(&request).await.unwrap();
        assert_eq!(response.output.as_text(), Some("made it"));
        assert_eq!(exec.backend().calls(), 3);
        // Every attempt reached the provider, so all three are accounted.
        assert_eq!(exec.ledger().snapshot().calls, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_transient_failure() {
        let exec = executor(
            vec![Err(rate_limit()), Err(rate_limit()), Err(rate_limit())],
            3,
        );
        let request = ModelRequest::new("gpt-4o", "go");

        let err = exec.query(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::Provider(OpenAIError::ApiError(_))));
        assert_eq!(exec.backend().calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let exec = executor(
            vec![Err(LlmError::configuration("unknown model id"))],
            5,
        );
        let request = ModelRequest::new("gpt-4o", "go");

        let err = exec.query(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::Configuration { .. }));
        assert_eq!(exec.backend().calls(), 1);
        // Never reached the provider, so nothing is accounted.
        assert_eq!(exec.ledger().snapshot().calls, 0);
    }

    #[tokio::test]
    async fn test_forced_function_wrong_name_is_schema_mismatch() {
        let exec = executor(
            vec![Ok(RawCompletion::tool_call(
                "lookup_weather",
                r#"{"done": true}"#,
            ))],
            3,
        );
        let request = ModelRequest::new("gpt-4o", "go").with_function(FunctionSpec::new(
            "submit_revision",
            "submit",
            object_schema(),
        ));

        let err = exec.query(&request).await.unwrap_err();
        match err {
            LlmError::SchemaMismatch { expected, actual } => {
                assert_eq!(expected, "submit_revision");
                assert_eq!(actual, "lookup_weather");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forced_function_missing_call_is_schema_mismatch() {
        let exec = executor(vec![Ok(RawCompletion::text("just prose"))], 3);
        let request = ModelRequest::new("gpt-4o", "go").with_function(FunctionSpec::new(
            "submit_revision",
            "submit",
            object_schema(),
        ));

        let err = exec.query(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_parse_error() {
        let exec = executor(
            vec![Ok(RawCompletion::tool_call("submit_revision", "{not json"))],
            3,
        );
        let request = ModelRequest::new("gpt-4o", "go").with_function(FunctionSpec::new(
            "submit_revision",
            "submit",
            object_schema(),
        ));

        let err = exec.query(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
    }

    #[tokio::test]
    async fn test_arguments_violating_schema_are_parse_error() {
        let exec = executor(
            vec![Ok(RawCompletion::tool_call(
                "submit_revision",
                r#"{"artifact": "x"}"#,
            ))],
            3,
        );
        let request = ModelRequest::new("gpt-4o", "go").with_function(FunctionSpec::new(
            "submit_revision",
            "submit",
            object_schema(),
        ));

        let err = exec.query(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
        assert!(err.to_string().contains("schema validation"));
    }

    #[tokio::test]
    async fn test_forced_function_success_returns_structured_payload() {
        let exec = executor(
            vec![Ok(RawCompletion::tool_call(
                "submit_revision",
                r#"{"artifact": "new text", "done": false}"#,
            )
            .with_usage(Usage::new(120, 40)))],
            3,
        );
        let request = ModelRequest::new("gpt-4o", "go").with_function(FunctionSpec::new(
            "submit_revision",
            "submit",
            object_schema(),
        ));

        let response = exec.query(&request).await.unwrap();
        let payload = response.output.as_structured().unwrap();
        assert_eq!(payload["artifact"], "new text");
        assert_eq!(payload["done"], false);
        assert_eq!(response.usage, Usage::new(120, 40));
        assert_eq!(response.history.len(), 2);
        // Assistant turn holds the raw argument payload for continuations.
        assert!(response.history[1].content.contains("new text"));
    }

    #[tokio::test]
    async fn test_optional_function_allows_text_fallback() {
        let exec = executor(vec![Ok(RawCompletion::text("prose instead"))], 3);
        let request = ModelRequest::new("gpt-4o", "go").with_function(
            FunctionSpec::new("submit_revision", "submit", object_schema()).allow_text(),
        );

        let response = exec.query(&request).await.unwrap();
        assert_eq!(response.output.as_text(), Some("prose instead"));
    }
}
