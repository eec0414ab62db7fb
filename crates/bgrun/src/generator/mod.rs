//! The opaque producer side: anything that yields emissions asynchronously.
//!
//! The adapter only needs [`EventGenerator`]; hosts plug in a
//! [`GeneratorFactory`] that builds one per submitted task.

pub mod command;
pub mod replay;

pub use command::CommandFactory;
pub use replay::ReplayFactory;

use crate::error::GeneratorError;
use crate::events::{Emission, Payload};
use crate::job::JobId;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

/// What a generator is asked to work on.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub job_id: JobId,
    /// Task text as handed to the producer (may carry a timestamp preamble).
    pub task: String,
    pub max_turns: u32,
}

/// An asynchronous sequence of emissions.
///
/// `None` signals natural completion. An `Err` is terminal for the job.
#[async_trait]
pub trait EventGenerator: Send {
    async fn next_emission(&mut self) -> Option<Result<Emission, GeneratorError>>;

    /// Told to stop early or after natural completion; release resources.
    async fn close(&mut self) -> Result<(), GeneratorError> {
        Ok(())
    }
}

/// Builds a fresh generator for each submitted job.
#[async_trait]
pub trait GeneratorFactory: Send + Sync {
    async fn start(&self, request: &TaskRequest)
    -> Result<Box<dyn EventGenerator>, GeneratorError>;
}

/// Factory backed by a closure.
pub struct FnFactory<F>(F);

/// Wrap a closure as a [`GeneratorFactory`].
pub fn from_fn<F>(f: F) -> FnFactory<F>
where
    F: Fn(&TaskRequest) -> Result<Box<dyn EventGenerator>, GeneratorError> + Send + Sync,
{
    FnFactory(f)
}

#[async_trait]
impl<F> GeneratorFactory for FnFactory<F>
where
    F: Fn(&TaskRequest) -> Result<Box<dyn EventGenerator>, GeneratorError> + Send + Sync,
{
    async fn start(
        &self,
        request: &TaskRequest,
    ) -> Result<Box<dyn EventGenerator>, GeneratorError> {
        (self.0)(request)
    }
}

/// Adapts any `Stream` of emissions.
pub struct StreamGenerator {
    inner: BoxStream<'static, Result<Emission, GeneratorError>>,
}

impl StreamGenerator {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Emission, GeneratorError>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }
}

#[async_trait]
impl EventGenerator for StreamGenerator {
    async fn next_emission(&mut self) -> Option<Result<Emission, GeneratorError>> {
        self.inner.next().await
    }
}

/// Sending half of [`channel`]. Dropping every sender ends the run normally.
#[derive(Clone)]
pub struct EmissionSender {
    tx: mpsc::Sender<Result<Emission, GeneratorError>>,
}

impl EmissionSender {
    /// Returns false once the generator side has been closed.
    pub async fn send(&self, emission: Emission) -> bool {
        self.tx.send(Ok(emission)).await.is_ok()
    }

    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.tx
            .send(Err(GeneratorError::Failed(message.into())))
            .await
            .is_ok()
    }

    /// Resolves once the generator has been closed or dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Generator fed from an mpsc channel.
pub struct ChannelGenerator {
    rx: mpsc::Receiver<Result<Emission, GeneratorError>>,
}

#[async_trait]
impl EventGenerator for ChannelGenerator {
    async fn next_emission(&mut self) -> Option<Result<Emission, GeneratorError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), GeneratorError> {
        self.rx.close();
        Ok(())
    }
}

/// A generator driven by the caller through an [`EmissionSender`].
pub fn channel(buffer: usize) -> (EmissionSender, ChannelGenerator) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EmissionSender { tx }, ChannelGenerator { rx })
}

/// Parse one line of producer output.
///
/// Accepts a JSON object `{"source": .., "content": ..}` (string content is
/// text, anything else is structured), `Source: text` where `Source` is a
/// single token, or bare text attributed to no source.
pub(crate) fn parse_line(line: &str) -> Emission {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim_start().starts_with('{')
        && let Ok(Value::Object(mut map)) = serde_json::from_str::<Value>(trimmed)
        && map.contains_key("content")
    {
        let source = match map.remove("source") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let content = match map.remove("content") {
            Some(Value::String(s)) => Payload::Text(s),
            Some(other) => Payload::Structured(other),
            None => Payload::Text(String::new()),
        };
        return Emission { source, content };
    }

    if let Some((prefix, rest)) = trimmed.split_once(": ")
        && !prefix.is_empty()
        && !prefix.chars().any(char::is_whitespace)
    {
        return Emission::text(prefix, rest);
    }

    Emission::text("", trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    #[test]
    fn parses_json_lines() {
        let e = parse_line(r#"{"source":"WebSearchAgent","content":"3 results"}"#);
        assert_eq!(e, Emission::text("WebSearchAgent", "3 results"));

        let e = parse_line(r#"{"source":"DataAnalystAgent","content":{"rows":12}}"#);
        assert_eq!(e.content, Payload::Structured(json!({"rows": 12})));
    }

    #[test]
    fn parses_prefixed_and_bare_lines() {
        assert_eq!(
            parse_line("PlanningAgent: 1. WebSearchAgent : find data"),
            Emission::text("PlanningAgent", "1. WebSearchAgent : find data")
        );
        assert_eq!(
            parse_line("just some output: with colon"),
            Emission::text("", "just some output: with colon")
        );
        assert_eq!(parse_line(""), Emission::text("", ""));
    }

    #[test]
    fn json_without_content_is_text() {
        let e = parse_line(r#"{"source":"x"}"#);
        assert_eq!(e.source, "");
        assert_eq!(e.content, Payload::Text(r#"{"source":"x"}"#.to_string()));
    }

    #[tokio::test]
    async fn stream_generator_yields_then_ends() {
        let mut generator = StreamGenerator::new(stream::iter(vec![
            Ok(Emission::text("a", "1")),
            Ok(Emission::text("b", "2")),
        ]));
        assert_eq!(
            generator.next_emission().await.unwrap().unwrap(),
            Emission::text("a", "1")
        );
        assert!(generator.next_emission().await.unwrap().is_ok());
        assert!(generator.next_emission().await.is_none());
    }

    #[tokio::test]
    async fn channel_generator_ends_when_senders_drop() {
        let (tx, mut generator) = channel(4);
        assert!(tx.send(Emission::text("a", "1")).await);
        drop(tx);
        assert!(generator.next_emission().await.unwrap().is_ok());
        assert!(generator.next_emission().await.is_none());
    }

    #[tokio::test]
    async fn closing_channel_generator_rejects_sends() {
        let (tx, mut generator) = channel(4);
        generator.close().await.unwrap();
        assert!(!tx.send(Emission::text("a", "late")).await);
    }
}
