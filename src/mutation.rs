//! Write adapter: a triggerable request with tracked state.
//!
//! Mutations are not cached by key. Each [`Mutation`] handle owns one
//! [`MutationState`] describing its latest call.
//!
//! # Overlapping calls
//!
//! Calls are never queued, merged or cancelled; every call runs its request
//! to completion. Each call takes the next generation number and only the
//! newest generation may move `MutationState`, so a slow older call cannot
//! overwrite the result of a newer one. Callbacks still fire once for every
//! settlement, superseded or not, with that call's own body.

use crate::client::QueryClient;
use crate::envelope::{normalize, FetchError};
use crate::error::Error;
use crate::options::{MutationOptions, RetryPolicy};
use crate::request::{RequestOptions, Response};
use crate::state::{MutationState, MutationStatus};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Passed to mutation callbacks.
#[derive(Clone, Debug)]
pub struct MutationContext {
    /// Client the mutation was created on, e.g. for invalidating reads.
    pub client: QueryClient,
    /// Generation of the call being reported.
    pub generation: u64,
}

type MutationFn<B, T, E> = dyn Fn(B) -> BoxFuture<'static, Response<T, E>> + Send + Sync;

struct Shared<B, T, E> {
    client: QueryClient,
    mutation_fn: Arc<MutationFn<B, T, E>>,
    options: MutationOptions<B, T, E>,
    retry: RetryPolicy,
    slot: Mutex<Slot<B, T, E>>,
    notify: watch::Sender<u64>,
}

/// State of the newest call, guarded together with its generation so
/// the comparison and the write happen under one lock.
struct Slot<B, T, E> {
    generation: u64,
    state: MutationState<B, T, E>,
}

/// Handle returned by [`use_api_mutation`]. Clones share state.
pub struct Mutation<B, T, E> {
    shared: Arc<Shared<B, T, E>>,
}

impl<B, T, E> Clone for Mutation<B, T, E> {
    fn clone(&self) -> Self {
        Mutation {
            shared: self.shared.clone(),
        }
    }
}

/// Create a mutation handle around `mutation_fn`.
pub fn use_api_mutation<B, T, E, F, Fut>(client: &QueryClient, mutation_fn: F) -> Mutation<B, T, E>
where
    F: Fn(B) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<T, E>> + Send + 'static,
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    let mutation_fn: Arc<MutationFn<B, T, E>> = Arc::new(move |body| mutation_fn(body).boxed());
    Mutation::new(client, mutation_fn, MutationOptions::default())
}

/// [`use_api_mutation`] with callbacks and request options.
///
/// `mutation_fn` receives the body and a clone of `request_options`.
pub fn use_api_mutation_with<B, T, E, F, Fut>(
    client: &QueryClient,
    mutation_fn: F,
    options: MutationOptions<B, T, E>,
    request_options: RequestOptions,
) -> Mutation<B, T, E>
where
    F: Fn(B, RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<T, E>> + Send + 'static,
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    let mutation_fn: Arc<MutationFn<B, T, E>> =
        Arc::new(move |body| mutation_fn(body, request_options.clone()).boxed());
    Mutation::new(client, mutation_fn, options)
}

impl<B, T, E> Mutation<B, T, E>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn new(
        client: &QueryClient,
        mutation_fn: Arc<MutationFn<B, T, E>>,
        options: MutationOptions<B, T, E>,
    ) -> Self {
        let (notify, _) = watch::channel(0);
        let retry = options.retry_policy(client.config());
        Mutation {
            shared: Arc::new(Shared {
                client: client.clone(),
                mutation_fn,
                options,
                retry,
                slot: Mutex::new(Slot {
                    generation: 0,
                    state: MutationState::default(),
                }),
                notify,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<B, T, E>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.shared
            .notify
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Apply `f` to the state if `generation` is still the newest call.
    fn update_if_latest(
        &self,
        generation: u64,
        f: impl FnOnce(&mut MutationState<B, T, E>),
    ) -> bool {
        let updated = {
            let mut slot = self.lock();
            if slot.generation == generation {
                f(&mut slot.state);
                true
            } else {
                false
            }
        };
        if updated {
            self.notify();
        }
        updated
    }

    /// Start a new generation with `state` and return its number.
    fn replace(&self, state: MutationState<B, T, E>) -> u64 {
        let generation = {
            let mut slot = self.lock();
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = state;
            slot.generation
        };
        self.notify();
        generation
    }

    /// Fire the mutation without waiting. Failures land in [`state`](Self::state).
    ///
    /// State is `Pending` by the time this returns.
    pub fn mutate(&self, body: B) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let generation = self.begin(&body);
                let this = self.clone();
                runtime.spawn(async move {
                    // Outcome is recorded in the handle's state.
                    let _ = this.run(body, generation).await;
                });
            }
            Err(_) => {
                warn!("✗ mutate called outside a tokio runtime");
                self.replace(MutationState {
                    error: Some(FetchError::Transport(Error::NoRuntime)),
                    status: MutationStatus::Error,
                    variables: Some(body),
                    ..MutationState::default()
                });
            }
        }
    }

    /// Run the mutation and return its normalized result.
    ///
    /// # Errors
    /// Returns the envelope error as `FetchError::Api`, or
    /// `FetchError::Transport` when the request future itself failed.
    pub async fn mutate_async(&self, body: B) -> std::result::Result<T, FetchError<E>> {
        let generation = self.begin(&body);
        self.run(body, generation).await
    }

    fn begin(&self, body: &B) -> u64 {
        let generation = self.replace(MutationState {
            status: MutationStatus::Pending,
            variables: Some(body.clone()),
            ..MutationState::default()
        });
        debug!("» Mutation #{} started", generation);
        generation
    }

    async fn run(&self, body: B, generation: u64) -> std::result::Result<T, FetchError<E>> {
        let outcome = self.execute(&body, generation).await;

        let current = self.update_if_latest(generation, |state| match &outcome {
            Ok(data) => {
                state.data = Some(data.clone());
                state.error = None;
                state.status = MutationStatus::Success;
            }
            Err(e) => {
                state.data = None;
                state.error = Some(e.clone());
                state.status = MutationStatus::Error;
            }
        });
        if !current {
            debug!("Mutation #{} superseded, state left to newer call", generation);
        }

        let ctx = MutationContext {
            client: self.shared.client.clone(),
            generation,
        };
        match &outcome {
            Ok(data) => {
                debug!("✓ Mutation #{} succeeded", generation);
                if let Some(cb) = &self.shared.options.on_success {
                    cb(data, &body, &ctx);
                }
            }
            Err(e) => {
                warn!("✗ Mutation #{} failed: {:?}", generation, e);
                if let Some(cb) = &self.shared.options.on_error {
                    cb(e, &body, &ctx);
                }
            }
        }
        if let Some(cb) = &self.shared.options.on_settled {
            cb(outcome.as_ref().ok(), outcome.as_ref().err(), &body, &ctx);
        }

        outcome
    }

    async fn execute(&self, body: &B, generation: u64) -> std::result::Result<T, FetchError<E>> {
        let retry = self.shared.retry;
        let mut attempts = 0;
        let max_attempts = retry.retries + 1;

        loop {
            attempts += 1;
            let fut = (self.shared.mutation_fn)(body.clone());
            let response = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(response) => response,
                Err(_) => Err(Error::TaskFailed("mutation future panicked".to_string())),
            };
            match normalize(response) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    self.update_if_latest(generation, |state| state.failure_count += 1);
                    if attempts >= max_attempts {
                        return Err(e);
                    }
                    let delay = retry.delay(attempts - 1);
                    debug!(
                        "Mutation #{} failed (attempt {}/{}), retrying in {:?}",
                        generation, attempts, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Snapshot of the latest call's state.
    pub fn state(&self) -> MutationState<B, T, E> {
        self.lock().state.clone()
    }

    pub fn data(&self) -> Option<T> {
        self.lock().state.data.clone()
    }

    pub fn error(&self) -> Option<FetchError<E>> {
        self.lock().state.error.clone()
    }

    pub fn status(&self) -> MutationStatus {
        self.lock().state.status
    }

    pub fn is_idle(&self) -> bool {
        self.status() == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status() == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status() == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == MutationStatus::Error
    }

    /// Return to `Idle`. Calls still running no longer update state.
    pub fn reset(&self) {
        self.replace(MutationState::default());
    }

    /// Wait until the latest call is no longer pending.
    pub async fn settled(&self) -> MutationState<B, T, E> {
        let mut changes = self.shared.notify.subscribe();
        loop {
            let _ = changes.borrow_and_update();
            let state = self.state();
            if state.status != MutationStatus::Pending {
                return state;
            }
            if changes.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl<B, T, E> fmt::Debug for Mutation<B, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field(
                "generation",
                &self
                    .shared
                    .slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .generation,
            )
            .finish()
    }
}
