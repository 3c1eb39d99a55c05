//! # query-kit
//!
//! Typed read/write adapters over an in-process cache-and-refetch engine,
//! for request clients that answer every call with a `{ data, error }`
//! envelope.
//!
//! ## Features
//!
//! - **Envelope normalization:** application errors go to the error channel,
//!   only unwrapped payloads are cached
//! - **Keyed reads:** [`use_api_query`] observers share one entry and one
//!   in-flight request per [`CacheKey`]
//! - **Stale-while-revalidate:** cached data stays visible during refetches
//! - **Tracked writes:** [`use_api_mutation`] with lifecycle callbacks and
//!   last-call-wins state
//! - **Cache utilities:** invalidate, set, get and prefetch through [`Api`]
//! - **No globals:** every [`QueryClient`] is an isolated engine, made
//!   ambient per future with [`QueryClient::provide`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use query_kit::{cache_key, use_api, Envelope, QueryClient, RawEnvelope};
//! use serde::Deserialize;
//!
//! #[derive(Clone, Debug, Deserialize)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! #[derive(Clone, Debug, Deserialize)]
//! struct ApiError {
//!     message: String,
//! }
//!
//! // 1. Request function from your RPC client
//! async fn get_user(id: u32) -> query_kit::request::Response<Option<User>, ApiError> {
//!     let body = http_get(&format!("/users/{id}")).await?;
//!     let raw: RawEnvelope<User, ApiError> = serde_json::from_str(&body)?;
//!     Ok(raw.into_envelope())
//! }
//!
//! // 2. Provide a client and read through the cache
//! let client = QueryClient::new();
//! client
//!     .provide(async {
//!         let api = use_api()?;
//!         let mut user = api.query(cache_key!["user", 1], || get_user(1))?;
//!         let state = user.settled().await;
//!
//!         // 3. Write, then refresh everything under ["user"]
//!         let rename = api.mutation(|name: String| update_user(1, name));
//!         rename.mutate_async("Ada".to_string()).await?;
//!         api.invalidate(cache_key!["user"])?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

#[macro_use]
extern crate log;

pub mod api;
pub mod client;
pub mod envelope;
pub mod error;
pub mod key;
pub mod mutation;
pub mod observability;
pub mod options;
pub mod query;
pub mod request;
pub mod state;

// Re-exports for convenience
pub use api::{use_api, Api};
pub use client::{QueryCache, QueryClient};
pub use envelope::{normalize, Envelope, FetchError, RawEnvelope};
pub use error::{Error, Result};
pub use key::{CacheKey, KeyPart};
pub use mutation::{use_api_mutation, use_api_mutation_with, Mutation, MutationContext};
pub use options::{ClientConfig, MutationOptions, QueryOptions, RetryPolicy};
pub use query::{use_api_query, use_api_query_with, Query};
pub use request::{RequestOptions, Response};
pub use state::{FetchStatus, MutationState, MutationStatus, QueryState, QueryStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
