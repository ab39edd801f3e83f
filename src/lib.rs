//! Provider-agnostic LLM invocation with bounded self-refinement.
//!
//! The crate has two layers. The invocation layer turns a [`ModelRequest`]
//! into a [`ModelResponse`]: clients are created lazily per provider
//! family ([`client::ClientManager`]), transient provider failures are
//! retried with jittered exponential backoff ([`retry`]), forced function
//! calls are checked against their JSON Schema ([`executor`]), and every
//! call that reached a provider lands in a [`UsageLedger`].
//!
//! The refinement layer ([`reflection`]) runs a bounded
//! generate/validate/critique/revise loop on top of an [`Executor`] and an
//! [`ArtifactValidator`], producing a [`SessionOutcome`] that reports
//! success from the validator's last run rather than the model's say-so.
//!
//! ```no_run
//! use refine_llm::{Executor, NoopValidator, ReflectionConfig, ReflectionLoop, UsageLedger};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let executor = Executor::openai(Arc::new(UsageLedger::new()));
//! let looped = ReflectionLoop::new(&executor, &NoopValidator, ReflectionConfig::default());
//! let outcome = looped
//!     .run("You are an academic writer.", "Draft an abstract.", "gpt-4o")
//!     .await;
//! println!("{} rounds, success={}", outcome.iterations, outcome.success);
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod items;
pub mod model;
pub mod reflection;
pub mod retry;
pub mod usage;
pub mod validate;

pub use client::{ClientManager, ProviderFamily};
pub use config::{ReflectionConfig, RetryConfig, Settings, ValidatorConfig};
pub use error::{LlmError, Result};
pub use executor::Executor;
pub use items::{
    FunctionSpec, Message, ModelOutput, ModelRequest, ModelResponse, ProviderInfo, Role,
};
pub use model::{ChatBackend, OpenAiBackend, RawCompletion, RawToolCall, ScriptedBackend};
pub use reflection::{
    ParsedReply, ReflectionLoop, ReflectionReply, ReflectionSession, ReplyContract, SessionOutcome,
};
pub use retry::{retry_async, ErrorClass, ErrorClassifier, OpenAiClassifier, RetryPolicy};
pub use usage::{CallRecord, Usage, UsageLedger, UsageSnapshot};
pub use validate::{ArtifactValidator, CommandValidator, Diagnostic, NoopValidator};
