use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Core trait for state store implementations.
///
/// A state store holds two kinds of values under string keys: plain string
/// values with an optional time-to-live, and string sets. Accessing one kind
/// through the other's operations fails with `WrongType`.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a plain value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a plain value, replacing whatever the key held before.
    ///
    /// With `ttl` set, the key expires that long after the write.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Removes a key of either kind. Returns true if a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists live keys matching a glob pattern (`*` and `?` wildcards).
    ///
    /// Keys are returned in lexical order.
    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>>;

    /// Adds a member to the set stored at `key`, creating the set if needed.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<()>;

    /// Returns the members of the set stored at `key`, in lexical order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Removes a member from the set stored at `key`.
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<()>;

    /// Drops expired plain values, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

// Lets callers pick a backend at runtime behind `Arc<dyn StateStore>`.
#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key).await
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        (**self).keys_by_pattern(pattern).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<()> {
        (**self).add_to_set(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        (**self).set_members(key).await
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<()> {
        (**self).remove_from_set(key, member).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        (**self).purge_expired().await
    }
}

/// Extension trait providing JSON convenience methods for state stores.
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Reads a plain value and deserializes it from JSON.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Serializes a value to JSON and writes it.
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Matches a key against a glob pattern.
///
/// `*` matches any run of characters (including none), `?` matches exactly
/// one character. Every other character matches itself.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    let mut last_star: Option<usize> = None;
    let mut star_match = 0;

    while k < key.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            last_star = Some(p);
            star_match = k;
            p += 1;
        } else if let Some(star) = last_star {
            // Let the last star swallow one more character and retry.
            p = star + 1;
            star_match += 1;
            k = star_match;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Translates a glob pattern into a SQL `LIKE` pattern using `\` as escape.
pub fn pattern_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            _ => like.push(c),
        }
    }
    like
}
