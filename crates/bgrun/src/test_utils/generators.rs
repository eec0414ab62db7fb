//! Scripted generators.

use crate::error::GeneratorError;
use crate::events::Emission;
use crate::generator::{EventGenerator, StreamGenerator};
use futures_util::stream;

/// A generator that yields `emissions` and then completes.
pub fn scripted(emissions: Vec<Emission>) -> Box<dyn EventGenerator> {
    Box::new(StreamGenerator::new(stream::iter(
        emissions.into_iter().map(Ok::<_, GeneratorError>),
    )))
}

/// Text emissions from a single source.
pub fn texts(source: &str, payloads: &[&str]) -> Vec<Emission> {
    payloads
        .iter()
        .map(|p| Emission::text(source, *p))
        .collect()
}
