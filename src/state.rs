//! Query and mutation lifecycle states.
//!
//! # Query lifecycle
//!
//! ```text
//! status:       Pending ──► Success ◄──► Error
//! fetch_status: Idle ◄──► Fetching
//! ```
//!
//! `status` describes the data; `fetch_status` describes whether a request
//! is in flight. A `Success` query can be `Fetching` at the same time
//! (background refetch, stale data still served).
//!
//! # Mutation lifecycle
//!
//! ```text
//! Idle ──mutate──► Pending ──► Success | Error
//!                     ▲               │
//!                     └─────mutate────┘
//! ```

use crate::envelope::FetchError;

/// Data status of a cached query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// No successful settlement yet.
    #[default]
    Pending,
    Success,
    Error,
}

/// Network activity of a cached query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStatus::Idle => write!(f, "idle"),
            FetchStatus::Fetching => write!(f, "fetching"),
        }
    }
}

/// Snapshot of one cache entry, typed for the observer that read it.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T, E> {
    pub data: Option<T>,
    pub error: Option<FetchError<E>>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Failed attempts of the current or last fetch.
    pub failure_count: u32,
    /// Set by invalidation until the next successful fetch.
    pub is_invalidated: bool,
}

impl<T, E> Default for QueryState<T, E> {
    fn default() -> Self {
        QueryState {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            failure_count: 0,
            is_invalidated: false,
        }
    }
}

impl<T, E> QueryState<T, E> {
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// First load in flight: nothing cached yet and a request running.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }
}

/// Status of a mutation handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationStatus::Idle => write!(f, "idle"),
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::Success => write!(f, "success"),
            MutationStatus::Error => write!(f, "error"),
        }
    }
}

/// State of the latest call made through a mutation handle.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationState<B, T, E> {
    pub data: Option<T>,
    pub error: Option<FetchError<E>>,
    pub status: MutationStatus,
    /// Body of the latest call.
    pub variables: Option<B>,
    pub failure_count: u32,
}

impl<B, T, E> Default for MutationState<B, T, E> {
    fn default() -> Self {
        MutationState {
            data: None,
            error: None,
            status: MutationStatus::Idle,
            variables: None,
            failure_count: 0,
        }
    }
}

impl<B, T, E> MutationState<B, T, E> {
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(QueryStatus::Success.to_string(), "success");
        assert_eq!(FetchStatus::Fetching.to_string(), "fetching");
        assert_eq!(MutationStatus::Idle.to_string(), "idle");
    }

    #[test]
    fn test_query_state_flags() {
        let mut state: QueryState<u32, ()> = QueryState::default();
        assert!(state.is_pending());
        assert!(!state.is_loading());

        state.fetch_status = FetchStatus::Fetching;
        assert!(state.is_loading());

        state.status = QueryStatus::Success;
        state.data = Some(1);
        assert!(state.is_fetching());
        assert!(!state.is_loading());
    }

    #[test]
    fn test_mutation_state_default_is_idle() {
        let state: MutationState<(), u32, ()> = MutationState::default();
        assert!(state.is_idle());
        assert!(state.data.is_none());
    }
}
