//! Artifact validation via external tooling
//!
//! A validator checks a candidate artifact and reports a [`Diagnostic`].
//! Validation is best-effort by design: a validator that cannot run (tool
//! missing, timeout) degrades to an empty diagnostic instead of failing
//! the surrounding refinement loop.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ValidatorConfig;

/// Outcome of one validation run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    /// Whether the validator actually executed
    pub ran: bool,
    /// Whether the artifact passed
    pub success: bool,
    /// Captured tool output, truncated to the configured limit
    pub output: String,
}

impl Diagnostic {
    /// Diagnostic for a validator that could not run
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            ran: true,
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            ran: true,
            success: false,
            output: output.into(),
        }
    }

    /// Render the diagnostic for inclusion in a critique prompt
    pub fn describe(&self) -> String {
        if !self.ran {
            return "Validation did not run.".to_string();
        }
        let verdict = if self.success { "passed" } else { "failed" };
        if self.output.is_empty() {
            format!("Validation {verdict}.")
        } else {
            format!("Validation {verdict}. Tool output:\n{}", self.output)
        }
    }
}

/// Checks a candidate artifact
#[async_trait]
pub trait ArtifactValidator: Send + Sync {
    async fn validate(&self, artifact: &str) -> Diagnostic;
}

/// Validator that does nothing. Refinement then relies on the model's own
/// judgement alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

#[async_trait]
impl ArtifactValidator for NoopValidator {
    async fn validate(&self, _artifact: &str) -> Diagnostic {
        Diagnostic::empty()
    }
}

/// Validator that writes the artifact to a file and runs a command over it.
///
/// The command is run `passes` times (some tools need a second pass to
/// converge, pdflatex being the canonical case); the diagnostic reflects
/// the final pass.
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    artifact_filename: String,
    timeout: Duration,
    passes: usize,
    output_limit: usize,
}

impl CommandValidator {
    pub fn new(
        program: impl Into<String>,
        workdir: impl Into<PathBuf>,
        artifact_filename: impl Into<String>,
    ) -> Self {
        let config = ValidatorConfig::default();
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            artifact_filename: artifact_filename.into(),
            timeout: config.timeout,
            passes: config.passes,
            output_limit: config.output_limit,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: &ValidatorConfig) -> Self {
        self.timeout = config.timeout;
        self.passes = config.passes;
        self.output_limit = config.output_limit;
        self
    }

    /// One command invocation. Returns (success, combined output), or None
    /// when the tool could not be run at all.
    async fn run_once(&self) -> Option<(bool, String)> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&self.artifact_filename)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, error = %e, "validator command failed to start");
                return None;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                if !output.stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                Some((output.status.success(), combined))
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "validator command failed");
                None
            }
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped
                warn!(program = %self.program, timeout = ?self.timeout, "validator command timed out");
                None
            }
        }
    }
}

#[async_trait]
impl ArtifactValidator for CommandValidator {
    async fn validate(&self, artifact: &str) -> Diagnostic {
        let path = self.workdir.join(&self.artifact_filename);
        if let Err(e) = tokio::fs::write(&path, artifact).await {
            warn!(path = %path.display(), error = %e, "failed to write artifact for validation");
            return Diagnostic::empty();
        }

        let mut last = None;
        for _ in 0..self.passes.max(1) {
            match self.run_once().await {
                Some(result) => last = Some(result),
                None => return Diagnostic::empty(),
            }
        }

        match last {
            Some((success, output)) => {
                let output = truncate_output(&output, self.output_limit);
                if success {
                    Diagnostic::passed(output)
                } else {
                    Diagnostic::failed(output)
                }
            }
            None => Diagnostic::empty(),
        }
    }
}

/// Truncate to at most `limit` bytes without splitting a character
fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_describe_variants() {
        assert_eq!(Diagnostic::empty().describe(), "Validation did not run.");
        assert_eq!(Diagnostic::passed("").describe(), "Validation passed.");
        assert_eq!(
            Diagnostic::failed("missing brace").describe(),
            "Validation failed. Tool output:\nmissing brace"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let output = "ab\u{00e9}cd";
        // Byte 3 falls inside the two-byte é.
        let truncated = truncate_output(output, 3);
        assert!(truncated.starts_with("ab"));
        assert!(truncated.ends_with("[output truncated]"));

        assert_eq!(truncate_output("short", 64), "short");
    }

    #[tokio::test]
    async fn test_noop_validator_reports_not_run() {
        let diag = NoopValidator.validate("anything").await;
        assert!(!diag.ran);
        assert!(!diag.success);
    }

    #[tokio::test]
    async fn test_command_validator_success() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new("true", dir.path(), "artifact.tex");
        let diag = validator.validate("\\documentclass{article}").await;
        assert!(diag.ran);
        assert!(diag.success);
        // The artifact made it to disk before the command ran.
        let written = std::fs::read_to_string(dir.path().join("artifact.tex")).unwrap();
        assert_eq!(written, "\\documentclass{article}");
    }

    #[tokio::test]
    async fn test_command_validator_failure_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new("sh", dir.path(), "artifact.tex")
            .with_args(["-c", "echo bad syntax >&2; false; #"]);
        let diag = validator.validate("broken").await;
        assert!(diag.ran);
        assert!(!diag.success);
        assert!(diag.output.contains("bad syntax"));
    }

    #[tokio::test]
    async fn test_missing_tool_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let validator =
            CommandValidator::new("definitely-not-a-real-binary-1b3f", dir.path(), "a.tex");
        let diag = validator.validate("x").await;
        assert_eq!(diag, Diagnostic::empty());
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = ValidatorConfig {
            timeout: Duration::from_millis(50),
            passes: 1,
            output_limit: 1024,
        };
        let validator = CommandValidator::new("sleep", dir.path(), "5")
            .with_config(&config);
        let diag = validator.validate("x").await;
        assert_eq!(diag, Diagnostic::empty());
    }

    #[tokio::test]
    async fn test_multiple_passes_reach_final_pass() {
        let dir = tempfile::tempdir().unwrap();
        // The marker file exists only after the first pass, so pass two
        // succeeds where pass one fails; the final pass wins.
        let config = ValidatorConfig {
            passes: 2,
            ..ValidatorConfig::default()
        };
        let validator = CommandValidator::new("sh", dir.path(), "artifact.tex")
            .with_args(["-c", "test -f marker && echo pass || { touch marker; false; }; #"])
            .with_config(&config);
        let diag = validator.validate("x").await;
        assert!(diag.ran);
        assert!(diag.success);
        assert!(diag.output.contains("pass"));
    }
}
