//! Running external commands, and keeping an audit trail of what we ran.
//!
//! Every pipeline run owns exactly one [`CommandLog`], which is passed by
//! `&mut` through each stage and saved alongside the results when the run
//! ends. Nothing here is global, so concurrent pipelines keep separate trails.

use std::{ffi::OsStr, process::Output, time::Instant};

use schemars::JsonSchema;
use tokio::process::Command;

use crate::prelude::*;

/// One external command that we ran.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CommandRecord {
    /// The program we ran.
    pub command: String,

    /// Arguments passed to the program.
    pub arguments: Vec<String>,

    /// Standard output followed by standard error.
    pub output: String,

    /// Wall-clock duration in seconds, formatted with three decimals.
    pub duration: String,
}

/// The audit trail for a single pipeline run.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct CommandLog {
    /// Commands in the order they were run.
    pub commands: Vec<CommandRecord>,
}

impl CommandLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program` with `args`, record it, and return its combined output.
    ///
    /// The command is recorded whether or not it succeeds, including when it
    /// could not be started at all. A nonzero exit status is an error which
    /// carries the command's output.
    pub async fn run<I, S>(&mut self, program: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let arguments = args
            .into_iter()
            .map(|arg| arg.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        let start = Instant::now();
        let result = Command::new(program).args(&arguments).output().await;
        let duration = format!("{:.3}", start.elapsed().as_secs_f64());

        let output = match &result {
            Ok(output) => combined_output(output),
            Err(err) => format!("failed to start {}: {}", program, err),
        };
        info!(
            "command: [{}]  arguments: [{}]  duration: [{}]",
            program,
            arguments.join(" "),
            duration
        );
        debug!(command_name = program, output = %output, "Output from command");

        self.commands.push(CommandRecord {
            command: program.to_owned(),
            arguments,
            output: output.clone(),
            duration,
        });

        let result = result.with_context(|| format!("cannot run {}", program))?;
        check_for_command_failure(program, &result.status, &output)?;
        Ok(output)
    }

    /// Serialize the log as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize command log")
    }

    /// Write the log to `path` as JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_json()?)
            .await
            .with_context(|| format!("failed to write command log {:?}", path))
    }
}

/// Standard output followed by standard error, decoded lossily.
fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

/// Report a command failure, including the command's output.
fn check_for_command_failure(
    command_name: &str,
    status: &std::process::ExitStatus,
    output: &str,
) -> Result<()> {
    if status.success() {
        Ok(())
    } else if let Some(exit_code) = status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and output:\n{}",
            command_name,
            exit_code,
            output,
        ))
    } else {
        Err(anyhow!("{} failed with output:\n{}", command_name, output))
    }
}
