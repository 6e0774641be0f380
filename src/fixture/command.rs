//! Shell-command fixture provider.
//!
//! This is how external resources such as an authenticated session are
//! plugged in without writing Rust: `setup` prints an opaque handle (a
//! storage-state file path, a token, a URL) on stdout, and `teardown`
//! receives it back through `{handle}`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::debug;

use super::{
    FixtureDescriptor, FixtureGraph, FixtureGraphError, FixtureProvider, FixtureSet, FixtureValue,
};
use crate::config::FixtureConfig;
use crate::executor::command::{fixture_env, run_shell};

/// Runs setup/teardown shell commands for one fixture.
#[derive(Debug, Clone)]
pub struct CommandFixtureProvider {
    name: String,
    setup: String,
    teardown: Option<String>,
    shell: String,
    working_dir: Option<PathBuf>,
}

impl CommandFixtureProvider {
    pub fn new(name: impl Into<String>, setup: impl Into<String>, teardown: Option<String>) -> Self {
        Self {
            name: name.into(),
            setup: setup.into(),
            teardown,
            shell: crate::config::schema::default_shell(),
            working_dir: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

#[async_trait]
impl FixtureProvider for CommandFixtureProvider {
    async fn setup(&self, dependencies: &FixtureSet) -> anyhow::Result<FixtureValue> {
        let env = fixture_env(dependencies);
        let output = run_shell(&self.shell, &self.setup, self.working_dir.as_deref(), &env)
            .await
            .with_context(|| format!("setup command of `{}`", self.name))?;
        if !output.success() {
            bail!(
                "setup command of `{}` exited with {:?}: {}",
                self.name,
                output.exit_code,
                output.transcript.join("\n")
            );
        }
        let handle = output.stdout.join("\n").trim().to_string();
        debug!("Fixture `{}` produced handle {:?}", self.name, handle);
        Ok(Arc::new(handle))
    }

    async fn teardown(&self, value: FixtureValue) -> anyhow::Result<()> {
        let Some(template) = &self.teardown else {
            return Ok(());
        };
        let handle = value
            .downcast::<String>()
            .map_err(|_| anyhow::anyhow!("fixture `{}` holds a non-string handle", self.name))?;
        let command = template.replace("{handle}", &shell_words::quote(&handle));
        let output = run_shell(&self.shell, &command, self.working_dir.as_deref(), &[])
            .await
            .with_context(|| format!("teardown command of `{}`", self.name))?;
        if !output.success() {
            bail!(
                "teardown command of `{}` exited with {:?}",
                self.name,
                output.exit_code
            );
        }
        Ok(())
    }
}

/// Builds a validated fixture graph from `[[fixtures]]` configuration.
///
/// Commands run with the given shell and working directory, normally the
/// executor's.
pub fn graph_from_config(
    fixtures: &[FixtureConfig],
    shell: &str,
    working_dir: Option<PathBuf>,
) -> Result<FixtureGraph, FixtureGraphError> {
    fixtures
        .iter()
        .fold(FixtureGraph::builder(), |builder, fixture| {
            let descriptor = fixture.depends_on.iter().fold(
                FixtureDescriptor::new(&fixture.name, fixture.scope),
                |d, dep| d.depends_on(dep),
            );
            let provider = CommandFixtureProvider::new(
                &fixture.name,
                &fixture.setup,
                fixture.teardown.clone(),
            )
            .with_shell(shell)
            .with_working_dir(working_dir.clone());
            builder.register(descriptor, provider)
        })
        .build()
}
