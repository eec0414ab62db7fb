//! Runs an external program as the producer.
//!
//! Each stdout line is one emission (see [`parse_line`](super::parse_line)).
//! The task is passed through the environment and through any `{task}`,
//! `{job_id}` or `{max_turns}` placeholders in the argument list.

use super::{EventGenerator, GeneratorFactory, TaskRequest, parse_line};
use crate::error::GeneratorError;
use crate::events::Emission;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Bytes of stderr kept for the failure message.
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone)]
pub struct CommandFactory {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandFactory {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
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

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn render_arg(arg: &str, request: &TaskRequest) -> String {
        arg.replace("{task}", &request.task)
            .replace("{job_id}", request.job_id.as_str())
            .replace("{max_turns}", &request.max_turns.to_string())
    }
}

#[async_trait]
impl GeneratorFactory for CommandFactory {
    async fn start(
        &self,
        request: &TaskRequest,
    ) -> Result<Box<dyn EventGenerator>, GeneratorError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(|a| Self::render_arg(a, request)))
            .envs(&self.env)
            .env("BGRUN_TASK", &request.task)
            .env("BGRUN_JOB_ID", request.job_id.as_str())
            .env("BGRUN_MAX_TURNS", request.max_turns.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| GeneratorError::Start(format!("{}: {}", self.program, e)))?;
        debug!("spawned producer '{}' for job {}", self.program, request.job_id);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GeneratorError::Start("producer stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    warn!("failed to read producer stderr: {}", e);
                }
                let start = buf.len().saturating_sub(STDERR_TAIL);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        Ok(Box::new(CommandGenerator {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr_task,
            done: false,
        }))
    }
}

pub struct CommandGenerator {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<String>>,
    done: bool,
}

impl CommandGenerator {
    async fn finish(&mut self) -> Option<Result<Emission, GeneratorError>> {
        self.done = true;
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return Some(Err(e.into())),
        };
        if status.success() {
            return None;
        }
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(Err(GeneratorError::Exited {
            code: status.code(),
            stderr,
        }))
    }
}

#[async_trait]
impl EventGenerator for CommandGenerator {
    async fn next_emission(&mut self) -> Option<Result<Emission, GeneratorError>> {
        if self.done {
            return None;
        }
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(Ok(parse_line(&line))),
            Ok(None) => self.finish().await,
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }

    async fn close(&mut self) -> Result<(), GeneratorError> {
        self.done = true;
        if self.child.try_wait()?.is_none() {
            debug!("stopping producer process early");
            self.child.start_kill()?;
            self.child.wait().await?;
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn request(task: &str) -> TaskRequest {
        TaskRequest {
            job_id: JobId::from("job-1"),
            task: task.to_string(),
            max_turns: 3,
        }
    }

    async fn drain(generator: &mut Box<dyn EventGenerator>) -> Vec<Result<Emission, GeneratorError>> {
        let mut out = Vec::new();
        while let Some(item) = generator.next_emission().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn stdout_lines_become_emissions() {
        let factory = CommandFactory::new("sh").with_args([
            "-c",
            "echo 'PlanningAgent: plan for {task}'; echo ''; echo \"turns=$BGRUN_MAX_TURNS\"",
        ]);
        let mut generator = factory.start(&request("sales")).await.unwrap();
        let items = drain(&mut generator).await;

        let emissions: Vec<Emission> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(emissions.len(), 3);
        assert_eq!(emissions[0], Emission::text("PlanningAgent", "plan for sales"));
        assert!(emissions[1].content.is_empty());
        assert_eq!(emissions[2], Emission::text("", "turns=3"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure_with_stderr() {
        let factory =
            CommandFactory::new("sh").with_args(["-c", "echo first; echo broken >&2; exit 3"]);
        let mut generator = factory.start(&request("t")).await.unwrap();
        let items = drain(&mut generator).await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        match &items[1] {
            Err(GeneratorError::Exited { code, stderr }) => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let factory = CommandFactory::new("/definitely/not/a/program");
        let err = factory.start(&request("t")).await.err().unwrap();
        assert!(matches!(err, GeneratorError::Start(_)));
    }

    #[tokio::test]
    async fn close_kills_a_running_producer() {
        let factory =
            CommandFactory::new("sh").with_args(["-c", "echo ready; sleep 30; echo never"]);
        let mut generator = factory.start(&request("t")).await.unwrap();
        assert!(generator.next_emission().await.unwrap().is_ok());

        tokio::time::timeout(std::time::Duration::from_secs(5), generator.close())
            .await
            .expect("close should not wait for the sleep")
            .unwrap();
        assert!(generator.next_emission().await.is_none());
    }
}
