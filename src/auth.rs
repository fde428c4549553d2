//! Agent authentication.
//!
//! Registration carries an `authToken`; whether it is acceptable is decided by
//! a [`TokenValidator`] chosen at startup. With `[auth] token` set, agents must
//! present exactly that token. Otherwise any token of at least
//! `min_token_length` characters is accepted.

use std::sync::Arc;

use crate::config::AuthConfig;

/// Predicate deciding whether a registration token is acceptable.
pub trait TokenValidator: Send + Sync {
    fn is_valid(&self, token: &str) -> bool;
}

impl<F> TokenValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, token: &str) -> bool {
        self(token)
    }
}

/// Accepts exactly one pre-shared token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenValidator for StaticToken {
    fn is_valid(&self, token: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), token.as_bytes())
    }
}

/// Accepts any token of at least `min` characters.
pub struct MinLengthToken {
    min: usize,
}

impl MinLengthToken {
    pub fn new(min: usize) -> Self {
        Self { min }
    }
}

impl TokenValidator for MinLengthToken {
    fn is_valid(&self, token: &str) -> bool {
        token.chars().count() >= self.min
    }
}

/// Build the validator described by `[auth]`. An empty static token counts
/// as unset.
pub fn validator_from_config(config: &AuthConfig) -> Arc<dyn TokenValidator> {
    match config.token.as_deref() {
        Some(token) if !token.is_empty() => Arc::new(StaticToken::new(token)),
        _ => Arc::new(MinLengthToken::new(config.min_token_length)),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
