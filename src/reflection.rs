//! Bounded critique-and-revise refinement
//!
//! [`ReflectionLoop`] drives a session: generate a first artifact, run it
//! through a validator, then up to `max_iterations` critique rounds where
//! the model sees the validator's diagnostic and either revises the
//! artifact or declares itself finished.
//!
//! Two reply contracts are supported. The fenced contract reads the
//! artifact out of a ```marker code fence and terminates on a sentinel
//! phrase. The structured contract forces a function call whose payload
//! carries the artifact and a `done` flag, so termination never depends on
//! string matching.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ReflectionConfig;
use crate::error::{LlmError, Result};
use crate::executor::Executor;
use crate::items::{FunctionSpec, Message, ModelOutput, ModelRequest};
use crate::model::ChatBackend;
use crate::validate::{ArtifactValidator, Diagnostic};

/// First ```marker fenced block in the text, without the fence lines
pub fn extract_fenced(text: &str, marker: &str) -> Option<String> {
    let escaped = regex::escape(marker);
    // DOTALL so the body may span lines; non-greedy up to the closing fence
    let pattern = Regex::new(&format!(r"(?s)```{escaped}\s*\n(.*?)```")).ok()?;
    pattern
        .captures(text)
        .map(|caps| caps[1].trim_end().to_string())
}

/// Whether the reply contains the termination phrase
pub fn contains_sentinel(text: &str, sentinel: &str) -> bool {
    text.contains(sentinel)
}

/// Typed reply payload for the structured contract
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReflectionReply {
    /// Full revised artifact, or null when no revision is offered
    pub artifact: Option<String>,
    /// Set when the model considers the artifact final
    pub done: bool,
}

/// A reply reduced to what the loop needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub artifact: Option<String>,
    pub done: bool,
}

/// How the model is asked to reply, and how replies are read back
#[derive(Debug, Clone)]
pub enum ReplyContract {
    /// Artifact in a ```marker fence, termination via sentinel phrase
    Fenced { marker: String, sentinel: String },
    /// Forced function call carrying `{artifact, done}`
    Structured,
}

impl ReplyContract {
    pub fn from_config(config: &ReflectionConfig) -> Self {
        if config.structured {
            ReplyContract::Structured
        } else {
            ReplyContract::Fenced {
                marker: config.marker.clone(),
                sentinel: config.sentinel.clone(),
            }
        }
    }

    /// Function forced onto loop queries, when the contract uses one
    pub fn function_spec(&self) -> Option<FunctionSpec> {
        match self {
            ReplyContract::Fenced { .. } => None,
            ReplyContract::Structured => Some(FunctionSpec::of::<ReflectionReply>(
                "submit_revision",
                "Submit the full revised artifact, or mark the current artifact final.",
            )),
        }
    }

    pub fn read(&self, output: &ModelOutput) -> Result<ParsedReply> {
        match (self, output) {
            (ReplyContract::Fenced { marker, sentinel }, ModelOutput::Text(text)) => {
                Ok(ParsedReply {
                    artifact: extract_fenced(text, marker),
                    done: contains_sentinel(text, sentinel),
                })
            }
            (ReplyContract::Structured, ModelOutput::Structured(value)) => {
                let reply: ReflectionReply = serde_json::from_value(value.clone())
                    .map_err(|e| LlmError::parse(format!("malformed reflection reply: {e}")))?;
                Ok(ParsedReply {
                    artifact: reply.artifact,
                    done: reply.done,
                })
            }
            (ReplyContract::Fenced { .. }, ModelOutput::Structured(_)) => Err(LlmError::parse(
                "expected a text reply but got a function call",
            )),
            (ReplyContract::Structured, ModelOutput::Text(_)) => Err(LlmError::parse(
                "expected a function call but got free text",
            )),
        }
    }

    fn reply_instructions(&self) -> String {
        match self {
            ReplyContract::Fenced { marker, sentinel } => format!(
                "Return the complete revised version inside a single ```{marker} fenced \
                 block. If no further changes are needed, include the exact phrase \
                 \"{sentinel}\" and do not repeat the previous version."
            ),
            ReplyContract::Structured => "Call submit_revision with the complete revised \
                 artifact, or with done set to true and no artifact if nothing should change."
                .to_string(),
        }
    }
}

/// Live state of one refinement session.
///
/// `iteration` counts completed critique rounds and never exceeds
/// `max_iterations`; `last_diagnostic` always describes the current
/// `artifact`, because revisions are validated as they arrive.
#[derive(Debug)]
pub struct ReflectionSession {
    pub artifact: String,
    pub iteration: usize,
    pub max_iterations: usize,
    pub history: Vec<Message>,
    pub terminal: bool,
    pub last_diagnostic: Diagnostic,
}

impl ReflectionSession {
    fn new(
        artifact: String,
        history: Vec<Message>,
        max_iterations: usize,
        diagnostic: Diagnostic,
    ) -> Self {
        Self {
            artifact,
            iteration: 0,
            max_iterations,
            history,
            terminal: false,
            last_diagnostic: diagnostic,
        }
    }

    fn rounds_remaining(&self) -> bool {
        !self.terminal && self.iteration < self.max_iterations
    }

    fn into_outcome(self, error: Option<LlmError>) -> SessionOutcome {
        SessionOutcome {
            success: self.last_diagnostic.ran && self.last_diagnostic.success,
            artifact: Some(self.artifact),
            diagnostic: self.last_diagnostic,
            iterations: self.iteration,
            history: self.history,
            error,
        }
    }
}

/// Final state of one refinement session. Always returned, even when the
/// session died mid-way; `error` then says why and `artifact` holds the
/// best version reached.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The last validation run passed
    pub success: bool,
    pub artifact: Option<String>,
    pub diagnostic: Diagnostic,
    /// Critique rounds actually executed
    pub iterations: usize,
    pub history: Vec<Message>,
    pub error: Option<LlmError>,
}

/// Bounded generate/validate/critique/revise loop over one executor and
/// one validator
pub struct ReflectionLoop<'a, B: ChatBackend, V: ArtifactValidator> {
    executor: &'a Executor<B>,
    validator: &'a V,
    config: ReflectionConfig,
}

impl<'a, B: ChatBackend, V: ArtifactValidator> ReflectionLoop<'a, B, V> {
    pub fn new(executor: &'a Executor<B>, validator: &'a V, config: ReflectionConfig) -> Self {
        Self {
            executor,
            validator,
            config,
        }
    }

    /// Run one session: seed prompt in, refined artifact out.
    pub async fn run(&self, system: &str, seed: &str, model: &str) -> SessionOutcome {
        let contract = ReplyContract::from_config(&self.config);

        // Initial generation
        let request = self.request(model, system, Vec::new(), seed.to_string(), &contract);
        let response = match self.executor.query(&request).await {
            Ok(response) => response,
            Err(error) => return Self::aborted(None, Diagnostic::empty(), 0, Vec::new(), error),
        };
        let history = response.history;

        let artifact = match contract.read(&response.output) {
            Ok(reply) => match reply.artifact {
                Some(artifact) => artifact,
                None => {
                    let error = LlmError::ArtifactExtraction {
                        message: "initial generation contained no artifact".to_string(),
                    };
                    return Self::aborted(None, Diagnostic::empty(), 0, history, error);
                }
            },
            Err(error) => return Self::aborted(None, Diagnostic::empty(), 0, history, error),
        };

        let diagnostic = self.validator.validate(&artifact).await;
        info!(
            ran = diagnostic.ran,
            success = diagnostic.success,
            "initial artifact validated"
        );

        let mut session =
            ReflectionSession::new(artifact, history, self.config.max_iterations, diagnostic);
        let mut error = None;
        // Whether the most recent phase ended in a validation run. Cleared
        // by a round that keeps the previous artifact, so exhausting the
        // bound still ends on a validation pass.
        let mut last_round_validated = true;

        while session.rounds_remaining() {
            let prompt = self.critique_prompt(&session.last_diagnostic, &contract);
            let request = self.request(model, system, session.history.clone(), prompt, &contract);

            let response = match self.executor.query(&request).await {
                Ok(response) => response,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            session.history = response.history;
            session.iteration += 1;

            let reply = match contract.read(&response.output) {
                Ok(reply) => reply,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };

            // Any returned artifact counts as a revision, byte-identical
            // ones included, and gets validated in its own right. A reply
            // without one keeps the current artifact and the session runs
            // on toward the bound.
            let revised = match reply.artifact {
                Some(new_artifact) => {
                    session.artifact = new_artifact;
                    session.last_diagnostic = self.validator.validate(&session.artifact).await;
                    true
                }
                None => false,
            };
            last_round_validated = revised;
            debug!(
                iteration = session.iteration,
                revised,
                done = reply.done,
                "critique round"
            );

            if reply.done {
                session.terminal = true;
            }
        }

        // Reaching the bound ends with one final validation pass, unless
        // the last round already validated the artifact as it stands.
        if error.is_none() && !session.terminal && !last_round_validated {
            session.last_diagnostic = self.validator.validate(&session.artifact).await;
        }

        session.into_outcome(error)
    }

    fn request(
        &self,
        model: &str,
        system: &str,
        history: Vec<Message>,
        user: String,
        contract: &ReplyContract,
    ) -> ModelRequest {
        let mut request = ModelRequest::new(model, user)
            .with_system(system)
            .with_history(history);
        if let Some(spec) = contract.function_spec() {
            request = request.with_function(spec);
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    fn critique_prompt(&self, diagnostic: &Diagnostic, contract: &ReplyContract) -> String {
        format!(
            "Criticize your previous answer and improve it.\n\n{}\n\n{}",
            diagnostic.describe(),
            contract.reply_instructions()
        )
    }

    fn aborted(
        artifact: Option<String>,
        diagnostic: Diagnostic,
        iterations: usize,
        history: Vec<Message>,
        error: LlmError,
    ) -> SessionOutcome {
        SessionOutcome {
            success: false,
            artifact,
            diagnostic,
            iterations,
            history,
            error: Some(error),
        }
    }
}
