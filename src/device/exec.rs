//! External Tool Execution
//!
//! Namespace and volume management is delegated to `ndctl` and the LVM
//! tools. All invocations go through [`CommandRunner`] so that allocators can
//! be exercised against scripted tool output.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Runs an external program and returns its standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs programs on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Executing: {}", command_line);

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command_line.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Command {
                command: command_line,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        debug!("{}: {}", program, stdout.trim());
        Ok(stdout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner for allocator tests

    use super::*;
    use parking_lot::Mutex;

    /// Replies with canned output for command lines starting with a prefix
    /// and records every invocation
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<Vec<(String, Result<String>)>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reply with `output` for command lines starting with `prefix`
        pub fn on(self, prefix: &str, output: &str) -> Self {
            self.replies
                .lock()
                .push((prefix.to_string(), Ok(output.to_string())));
            self
        }

        /// Fail command lines starting with `prefix`
        pub fn fail(self, prefix: &str, reason: &str) -> Self {
            self.replies.lock().push((
                prefix.to_string(),
                Err(Error::Command {
                    command: prefix.to_string(),
                    reason: reason.to_string(),
                }),
            ));
            self
        }

        pub fn called(&self, prefix: &str) -> bool {
            self.calls.lock().iter().any(|c| c.starts_with(prefix))
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            let command_line = format!("{} {}", program, args.join(" "));
            self.calls.lock().push(command_line.clone());

            let replies = self.replies.lock();
            let reply = replies
                .iter()
                .filter(|(prefix, _)| command_line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            match reply {
                Some((_, Ok(output))) => Ok(output.clone()),
                Some((_, Err(e))) => Err(Error::Command {
                    command: command_line,
                    reason: e.to_string(),
                }),
                None => Err(Error::Command {
                    command: command_line,
                    reason: "not scripted".into(),
                }),
            }
        }
    }
}
