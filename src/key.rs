//! Cache key management utilities.
//!
//! A [`CacheKey`] is an ordered sequence of primitive parts. Two keys are the
//! same cache entry exactly when they have the same parts in the same order
//! with the same types: `["user", 1]` and `["user", "1"]` are distinct.

use std::fmt;
use std::hash::{Hash, Hasher};

/// One positional component of a [`CacheKey`].
#[derive(Clone, Debug)]
pub enum KeyPart {
    Null,
    Bool(bool),
    /// Every integer width maps here by value, so `1u64` and `1i32` name
    /// the same part. `u128` is not accepted.
    Int(i128),
    /// Compared by bit pattern, so `NaN == NaN` and `0.0 != -0.0`.
    Float(f64),
    Str(String),
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyPart::Null, KeyPart::Null) => true,
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a == b,
            (KeyPart::Int(a), KeyPart::Int(b)) => a == b,
            (KeyPart::Float(a), KeyPart::Float(b)) => a.to_bits() == b.to_bits(),
            (KeyPart::Str(a), KeyPart::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyPart {}

impl Hash for KeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            KeyPart::Null => {}
            KeyPart::Bool(b) => b.hash(state),
            KeyPart::Int(i) => i.hash(state),
            KeyPart::Float(f) => f.to_bits().hash(state),
            KeyPart::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Float(x) => write!(f, "{:?}", x),
            KeyPart::Str(s) => write!(f, "{:?}", s),
        }
    }
}

macro_rules! impl_int_part {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KeyPart {
                fn from(v: $t) -> Self {
                    KeyPart::Int(i128::from(v))
                }
            }
        )*
    };
}

impl_int_part!(i8, i16, i32, i64, i128, u8, u16, u32, u64);

// Pointer-sized integers are at most 64 bits wide.
impl From<isize> for KeyPart {
    fn from(v: isize) -> Self {
        KeyPart::Int(v as i128)
    }
}

impl From<usize> for KeyPart {
    fn from(v: usize) -> Self {
        KeyPart::Int(v as i128)
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

impl From<f64> for KeyPart {
    fn from(v: f64) -> Self {
        KeyPart::Float(v)
    }
}

impl From<f32> for KeyPart {
    fn from(v: f32) -> Self {
        KeyPart::Float(f64::from(v))
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Str(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Str(v)
    }
}

impl From<&String> for KeyPart {
    fn from(v: &String) -> Self {
        KeyPart::Str(v.clone())
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyPart::Null, Into::into)
    }
}

/// Ordered, structurally compared identity of one cached read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CacheKey {
    parts: Vec<KeyPart>,
}

impl CacheKey {
    /// Create an empty key. An empty key is a prefix of every key.
    pub fn new() -> Self {
        CacheKey { parts: Vec::new() }
    }

    /// Append a part and return the extended key.
    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether `prefix` matches the leading parts of this key.
    ///
    /// Used by invalidation: `["todos"]` matches `["todos", 1]`.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.parts.starts_with(&prefix.parts)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<KeyPart>> for CacheKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        CacheKey { parts }
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for CacheKey {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        CacheKey {
            parts: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        CacheKey::new().push(v)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(v: &CacheKey) -> Self {
        v.clone()
    }
}

/// Build a [`CacheKey`] from heterogeneous parts.
///
/// ```
/// use query_kit::cache_key;
///
/// let key = cache_key!["user", 1];
/// assert_eq!(key.to_string(), "[\"user\",1]");
/// assert_ne!(key, cache_key!["user", "1"]);
/// ```
#[macro_export]
macro_rules! cache_key {
    () => {
        $crate::key::CacheKey::new()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::key::CacheKey::new()$(.push($part))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_equality_is_type_sensitive() {
        assert_ne!(cache_key!["user", 1], cache_key!["user", "1"]);
        assert_ne!(cache_key![1], cache_key![1.0]);
        assert_ne!(cache_key![true], cache_key![1]);
        assert_eq!(cache_key!["user", 1], cache_key!["user", 1u8]);
    }

    #[test]
    fn test_key_order_matters() {
        assert_ne!(cache_key!["a", "b"], cache_key!["b", "a"]);
    }

    #[test]
    fn test_key_hash_distinguishes_types() {
        let mut set = HashSet::new();
        set.insert(cache_key!["user", 1]);
        set.insert(cache_key!["user", "1"]);
        set.insert(cache_key!["user", 1]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_key_prefix() {
        let key = cache_key!["todos", 7, "comments"];
        assert!(key.starts_with(&cache_key!["todos"]));
        assert!(key.starts_with(&cache_key!["todos", 7]));
        assert!(key.starts_with(&CacheKey::new()));
        assert!(!key.starts_with(&cache_key!["todos", "7"]));
    }

    #[test]
    fn test_key_display() {
        let key = cache_key!["user", 1, None::<i32>, false];
        assert_eq!(key.to_string(), "[\"user\",1,null,false]");
    }

    #[test]
    fn test_float_parts_compare_by_bits() {
        assert_eq!(cache_key![f64::NAN], cache_key![f64::NAN]);
        assert_ne!(cache_key![0.0], cache_key![-0.0]);
    }

    #[test]
    fn test_wide_integers_compare_by_value() {
        let id: u64 = 42;
        let index: usize = 42;
        assert_eq!(cache_key!["user", id], cache_key!["user", 42]);
        assert_eq!(cache_key!["user", index], cache_key!["user", 42i64]);

        let big = cache_key![u64::MAX];
        assert_eq!(big.to_string(), "[18446744073709551615]");
        assert_ne!(big, cache_key!["18446744073709551615"]);
        assert_ne!(big, cache_key![-1]);
    }

    #[test]
    fn test_f32_parts_widen_to_f64() {
        assert_eq!(cache_key![1.5f32], cache_key![1.5f64]);
    }
}
