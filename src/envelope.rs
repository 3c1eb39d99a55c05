//! Response envelopes and the normalizer that feeds them into the engine.
//!
//! Request clients report every call as an envelope carrying either a
//! payload or an application error. The engine only understands
//! `Result`-shaped settlements, so every fetch passes through
//! [`normalize`] before anything is cached.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one request-client call.
///
/// `Ok` payloads may themselves be "empty looking" values (`None`, `0`,
/// `""`); they are still successful results and get cached as such.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope<T, E> {
    Ok(T),
    Err(E),
}

impl<T, E> Envelope<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Envelope::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Envelope::Err(_))
    }

    /// Convert into a plain `Result`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Envelope::Ok(data) => Ok(data),
            Envelope::Err(error) => Err(error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Envelope<T, E> {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(data) => Envelope::Ok(data),
            Err(error) => Envelope::Err(error),
        }
    }
}

/// Wire form `{ "data": ..., "error": ... }` as sent by JSON APIs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope<T, E> {
    pub data: Option<T>,
    pub error: Option<E>,
}

impl<T, E> RawEnvelope<T, E> {
    /// Tag the pair. A present `error` always wins, whatever `data` holds;
    /// an absent `error` yields `data` as-is, including `None`.
    pub fn into_envelope(self) -> Envelope<Option<T>, E> {
        match self.error {
            Some(error) => Envelope::Err(error),
            None => Envelope::Ok(self.data),
        }
    }
}

impl<T, E> From<RawEnvelope<T, E>> for Envelope<Option<T>, E> {
    fn from(raw: RawEnvelope<T, E>) -> Self {
        raw.into_envelope()
    }
}

/// Failure surfaced through `QueryState::error` / `MutationState::error`.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchError<E> {
    /// The request client answered with an application-level error.
    Api(E),
    /// The request future failed before producing an envelope.
    Transport(Error),
}

impl<E> FetchError<E> {
    /// The application error, if this is one.
    pub fn api(&self) -> Option<&E> {
        match self {
            FetchError::Api(e) => Some(e),
            FetchError::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

impl<E: fmt::Display> fmt::Display for FetchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Api(e) => write!(f, "API error: {}", e),
            FetchError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for FetchError<E> {}

impl<E> From<Error> for FetchError<E> {
    fn from(e: Error) -> Self {
        FetchError::Transport(e)
    }
}

/// Unwrap an envelope into the engine's error channel.
///
/// Transport errors pass through untouched; envelope errors become
/// [`FetchError::Api`]. Only the unwrapped payload ever reaches the cache.
pub fn normalize<T, E>(response: Result<Envelope<T, E>, Error>) -> Result<T, FetchError<E>> {
    match response {
        Ok(Envelope::Ok(data)) => Ok(data),
        Ok(Envelope::Err(error)) => Err(FetchError::Api(error)),
        Err(e) => Err(FetchError::Transport(e)),
    }
}
