//! Replays a recorded transcript (one emission per line) with a fixed delay.

use super::{EventGenerator, GeneratorFactory, TaskRequest, parse_line};
use crate::error::GeneratorError;
use crate::events::Emission;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReplayFactory {
    pub path: PathBuf,
    pub delay: Duration,
}

impl ReplayFactory {
    pub fn new(path: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            path: path.into(),
            delay,
        }
    }
}

#[async_trait]
impl GeneratorFactory for ReplayFactory {
    async fn start(
        &self,
        _request: &TaskRequest,
    ) -> Result<Box<dyn EventGenerator>, GeneratorError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GeneratorError::Start(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let pending = content.lines().map(parse_line).collect();
        Ok(Box::new(ReplayGenerator {
            pending,
            delay: self.delay,
            first: true,
        }))
    }
}

pub struct ReplayGenerator {
    pending: VecDeque<Emission>,
    delay: Duration,
    first: bool,
}

#[async_trait]
impl EventGenerator for ReplayGenerator {
    async fn next_emission(&mut self) -> Option<Result<Emission, GeneratorError>> {
        if self.pending.is_empty() {
            return None;
        }
        if !self.first && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.first = false;
        self.pending.pop_front().map(Ok)
    }

    async fn close(&mut self) -> Result<(), GeneratorError> {
        self.pending.clear();
        Ok(())
    }
}
