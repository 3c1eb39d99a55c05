//! Request-client boundary.
//!
//! The crate never performs network calls. A request function is any
//! closure returning a future of [`Response`]; headers and query
//! parameters travel in [`RequestOptions`] untouched.

use crate::envelope::Envelope;
use crate::error::Error;
use std::collections::BTreeMap;

/// What a request function resolves to.
///
/// `Err` is reserved for transport failures; application errors belong
/// in `Ok(Envelope::Err(..))`.
pub type Response<T, E> = std::result::Result<Envelope<T, E>, Error>;

/// Passthrough options handed to request functions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options_builders() {
        let opts = RequestOptions::new()
            .with_header("authorization", "Bearer a")
            .with_query("page", "1")
            .with_query("page", "2");

        assert_eq!(opts.headers["authorization"], "Bearer a");
        assert_eq!(opts.query.len(), 1);
        assert_eq!(opts.query["page"], "2");
    }
}
