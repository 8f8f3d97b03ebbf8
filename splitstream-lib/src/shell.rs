use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command exited with failure status")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// log errors and warnings or suppress them
#[derive(Clone, Copy, Debug)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command, capturing stdout and stderr.
    /// A non-empty stderr on a successful exit is logged as a warning.
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        self.run_stdout(logs).await.map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        match (output.stderr.is_empty(), output.status) {
            (true, status) if status.success() => Ok(stdout.trim().to_string()),
            (false, status) if status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::warn!(cmd = ?self, %stderr, "Non empty stderr on successful command");
                }
                Ok(stdout.trim().to_string())
            }
            (_, status) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(cmd = ?self, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
                }
                Err(Error::CommandFailed)
            }
        }
    }
}
