//! Shell-command execution collaborator.
//!
//! Runs each attempt as `{shell} -c "{command}"`, where the command is
//! rendered from a template:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{id}` | test id |
//! | `{file}` | spec file |
//! | `{title}` | test title |
//! | `{attempt}` | attempt index |
//! | `{shard}` | shard index |
//!
//! Placeholders are substituted in a single pass, so braces inside a value
//! are never expanded. Substituted values are shell-quoted. Fixture handles are exported as
//! `SHARDLINE_FIXTURE_<NAME>` environment variables.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Passed |
//! | 77 | Skipped (the automake convention) |
//! | other | Failed |
//!
//! # Example Configuration
//!
//! ```toml
//! [executor]
//! type = "command"
//! command = "npx playwright test {file} -g {title}"
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::{Captures, Regex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use super::{ExecutionContext, ExecutionOutcome, TestExecutor};
use crate::config::CommandExecutorConfig;
use crate::fixture::FixtureSet;

/// Exit code a command uses to report that it skipped itself.
pub const SKIP_EXIT_CODE: i32 = 77;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(id|file|title|attempt|shard)\}").expect("placeholder pattern is valid")
});

/// A line of output from a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Collected output of a finished shell command.
#[derive(Debug, Clone, Default)]
pub(crate) struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    /// Stdout and stderr interleaved in arrival order.
    pub transcript: Vec<String>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs `command` through `shell -c` and collects its output.
///
/// The child is killed if the returned future is dropped, which is how
/// attempt timeouts stop a running test.
pub(crate) async fn run_shell(
    shell: &str,
    command: &str,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) -> Result<ShellOutput> {
    let mut process = tokio::process::Command::new(shell);
    process.arg("-c").arg(command);
    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }
    for (key, value) in env {
        process.env(key, value);
    }
    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);

    let mut child = process
        .spawn()
        .with_context(|| format!("Failed to spawn `{}`", command))?;

    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;

    let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
        .map(|line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()));
    let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
        .map(|line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()));
    let mut combined = stream::select(stdout_stream, stderr_stream);

    let mut output = ShellOutput::default();
    while let Some(line) = combined.next().await {
        match line {
            OutputLine::Stdout(line) => {
                output.transcript.push(line.clone());
                output.stdout.push(line);
            }
            OutputLine::Stderr(line) => output.transcript.push(line),
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for `{}`", command))?;
    output.exit_code = status.code();
    Ok(output)
}

/// Environment variable name under which a fixture handle is exported.
///
/// ```
/// use shardline::executor::command::fixture_env_var;
///
/// assert_eq!(fixture_env_var("logged-in page"), "SHARDLINE_FIXTURE_LOGGED_IN_PAGE");
/// ```
pub fn fixture_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("SHARDLINE_FIXTURE_{}", suffix)
}

/// Exports every string-valued fixture of `fixtures` as an env var.
pub(crate) fn fixture_env(fixtures: &FixtureSet) -> Vec<(String, String)> {
    fixtures
        .names()
        .filter_map(|name| {
            fixtures
                .get_as::<String>(name)
                .map(|handle| (fixture_env_var(name), handle.as_ref().clone()))
        })
        .collect()
}

/// Executes each attempt as a shell command.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &CommandExecutorConfig) -> Self {
        Self::new(config.clone())
    }

    /// Renders the command for one attempt.
    ///
    /// A case-level `command` overrides the configured template.
    pub fn render(&self, ctx: &ExecutionContext<'_>) -> String {
        let template = ctx.case.command.as_deref().unwrap_or(&self.config.command);
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                let value = match &caps[1] {
                    "id" => ctx.case.id.clone(),
                    "file" => ctx.case.file.clone(),
                    "title" => ctx.case.title.clone(),
                    "attempt" => ctx.attempt.to_string(),
                    _ => ctx.shard.to_string(),
                };
                shell_words::quote(&value).into_owned()
            })
            .into_owned()
    }
}

#[async_trait]
impl TestExecutor for CommandExecutor {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<ExecutionOutcome> {
        let command = self.render(&ctx);
        debug!("[{}#{}] running: {}", ctx.case.id, ctx.attempt, command);

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("SHARDLINE_TEST_ID".into(), ctx.case.id.clone()));
        env.push(("SHARDLINE_ATTEMPT".into(), ctx.attempt.to_string()));
        env.push(("SHARDLINE_SHARD".into(), ctx.shard.to_string()));
        env.extend(fixture_env(ctx.fixtures));

        let output = run_shell(
            &self.config.shell,
            &command,
            self.config.working_dir.as_deref(),
            &env,
        )
        .await?;

        let outcome = match output.exit_code {
            Some(0) => ExecutionOutcome::passed(),
            Some(SKIP_EXIT_CODE) => ExecutionOutcome::skipped(
                output
                    .stdout
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "skipped by command".to_string()),
            ),
            Some(code) => ExecutionOutcome::failed(format!("command exited with code {}", code)),
            None => ExecutionOutcome::failed("command terminated by signal"),
        };

        if output.transcript.is_empty() {
            Ok(outcome)
        } else {
            let mut log = output.transcript.join("\n");
            log.push('\n');
            Ok(outcome.with_diagnostic("output.log", log))
        }
    }
}
