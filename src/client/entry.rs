//! Per-key cache entry: type-erased value, lifecycle metadata, in-flight fetch.

use crate::envelope::{normalize, FetchError};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::options::RetryPolicy;
use crate::request::Response;
use crate::state::{FetchStatus, QueryState, QueryStatus};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Failed attempt: the typed `FetchError<E>` plus a printable form for logs.
#[derive(Clone)]
pub(crate) struct Failure {
    pub error: AnyValue,
    pub message: String,
}

impl Failure {
    /// Failure raised by the engine itself, without the caller's error type.
    pub fn engine(e: Error) -> Self {
        Failure {
            message: e.to_string(),
            error: Arc::new(e),
        }
    }
}

pub(crate) type Attempt = std::result::Result<AnyValue, Failure>;
pub(crate) type ErasedFetch = Arc<dyn Fn() -> BoxFuture<'static, Attempt> + Send + Sync>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Attempt>>;

/// Wrap a typed request function into the engine's erased form.
///
/// The response is normalized here, so only unwrapped payloads are stored.
pub(crate) fn erase<T, E, F, Fut>(f: F) -> ErasedFetch
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<T, E>> + Send + 'static,
    T: Send + Sync + 'static,
    E: fmt::Debug + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move || {
        let f = f.clone();
        async move {
            let response = match AssertUnwindSafe(f()).catch_unwind().await {
                Ok(response) => response,
                Err(_) => Err(Error::TaskFailed("request future panicked".to_string())),
            };
            match normalize(response) {
                Ok(data) => Ok(Arc::new(data) as AnyValue),
                Err(e) => {
                    let message = format!("{:?}", e);
                    Err(Failure {
                        error: Arc::new(e),
                        message,
                    })
                }
            }
        }
        .boxed()
    })
}

pub(crate) fn downcast_value<T: Clone + 'static>(key: &CacheKey, value: &AnyValue) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

pub(crate) fn downcast_error<E: Clone + 'static>(
    key: &CacheKey,
    error: &AnyValue,
) -> Result<FetchError<E>> {
    if let Some(e) = error.downcast_ref::<FetchError<E>>() {
        return Ok(e.clone());
    }
    if let Some(e) = error.downcast_ref::<Error>() {
        return Ok(FetchError::Transport(e.clone()));
    }
    Err(Error::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<FetchError<E>>(),
    })
}

/// Convert a settled attempt back into the caller's types.
pub(crate) fn typed_attempt<T: Clone + 'static, E: Clone + 'static>(
    key: &CacheKey,
    attempt: &Attempt,
) -> std::result::Result<T, FetchError<E>> {
    match attempt {
        Ok(value) => downcast_value::<T>(key, value).map_err(FetchError::Transport),
        Err(failure) => match downcast_error::<E>(key, &failure.error) {
            Ok(e) => Err(e),
            Err(mismatch) => Err(FetchError::Transport(mismatch)),
        },
    }
}

pub(crate) struct EntryInner {
    pub data: Option<AnyValue>,
    pub error: Option<AnyValue>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub failure_count: u32,
    pub invalidated: bool,
    /// Bumped by every invalidation; a fetch that started under an older
    /// epoch read data that is already known stale.
    pub invalidate_epoch: u64,
    pub updated_at: Option<Instant>,
    pub in_flight: Option<SharedFetch>,
    /// Request function of the most recently mounted observer or fetch.
    pub fetcher: Option<(ErasedFetch, RetryPolicy)>,
    pub observers: usize,
    /// Observers with `enabled = true`; only these get background refetches.
    pub active: usize,
    pub gc_time: Duration,
    pub gc_epoch: u64,
}

/// One cache entry. Shared between the store and every observer of its key.
pub(crate) struct QueryEntry {
    key: CacheKey,
    inner: Mutex<EntryInner>,
    notify: watch::Sender<u64>,
}

impl QueryEntry {
    pub fn new(key: CacheKey, gc_time: Duration) -> Self {
        let (notify, _) = watch::channel(0);
        QueryEntry {
            key,
            inner: Mutex::new(EntryInner {
                data: None,
                error: None,
                status: QueryStatus::Pending,
                fetch_status: FetchStatus::Idle,
                failure_count: 0,
                invalidated: false,
                invalidate_epoch: 0,
                updated_at: None,
                in_flight: None,
                fetcher: None,
                observers: 0,
                active: 0,
                gc_time,
                gc_epoch: 0,
            }),
            notify,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Wake every observer of this entry.
    pub fn notify(&self) {
        self.notify.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub fn snapshot<T: Clone + 'static, E: Clone + 'static>(&self) -> Result<QueryState<T, E>> {
        let inner = self.lock();
        let data = match &inner.data {
            Some(value) => Some(downcast_value::<T>(&self.key, value)?),
            None => None,
        };
        let error = match &inner.error {
            Some(error) => Some(downcast_error::<E>(&self.key, error)?),
            None => None,
        };
        Ok(QueryState {
            data,
            error,
            status: inner.status,
            fetch_status: inner.fetch_status,
            failure_count: inner.failure_count,
            is_invalidated: inner.invalidated,
        })
    }

    pub fn record_failure(&self) {
        self.lock().failure_count += 1;
        self.notify();
    }

    /// Store the outcome of a finished fetch and release the in-flight slot,
    /// unless the entry was invalidated after the fetch began. Returns
    /// `false` in that case and leaves the entry fetching.
    ///
    /// Errors keep previously cached data so observers continue to see it.
    pub fn settle_if_current(&self, attempt: &Attempt, epoch: u64) -> bool {
        {
            let mut inner = self.lock();
            if inner.invalidate_epoch != epoch {
                return false;
            }
            match attempt {
                Ok(value) => {
                    inner.data = Some(value.clone());
                    inner.error = None;
                    inner.status = QueryStatus::Success;
                    inner.failure_count = 0;
                    inner.invalidated = false;
                    inner.updated_at = Some(Instant::now());
                }
                Err(failure) => {
                    inner.error = Some(failure.error.clone());
                    inner.status = QueryStatus::Error;
                }
            }
            inner.fetch_status = FetchStatus::Idle;
            inner.in_flight = None;
        }
        self.notify();
        true
    }

    /// Mark the entry stale and supersede any fetch already running.
    pub fn invalidate(&self) {
        {
            let mut inner = self.lock();
            inner.invalidated = true;
            inner.invalidate_epoch = inner.invalidate_epoch.wrapping_add(1);
        }
        self.notify();
    }

    /// Forget cached data and errors while observers keep the entry alive.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.data = None;
            inner.error = None;
            inner.status = QueryStatus::Pending;
            inner.failure_count = 0;
            inner.invalidated = false;
            inner.invalidate_epoch = inner.invalidate_epoch.wrapping_add(1);
            inner.updated_at = None;
        }
        self.notify();
    }

    /// Overwrite the cached value without touching the network.
    pub fn put(&self, value: AnyValue) {
        {
            let mut inner = self.lock();
            inner.data = Some(value);
            inner.error = None;
            inner.status = QueryStatus::Success;
            inner.invalidated = false;
            inner.updated_at = Some(Instant::now());
        }
        self.notify();
    }
}

impl EntryInner {
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.invalidated || self.data.is_none() {
            return true;
        }
        self.updated_at
            .map_or(true, |at| at.elapsed() >= stale_time)
    }
}
