//! Strict path multiplexer.
//!
//! Registrations that equal or prefix-overlap an existing pattern are refused
//! so that a misconfigured path can never bypass tenant enforcement at
//! runtime; the mistake surfaces as a startup error instead. `p` and `p/` are
//! served identically, and paths below a registered pattern fall into it
//! (there is never a deeper registration, by construction).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("pattern {0:?} was already registered")]
    AlreadyRegistered(String),
    #[error("pattern {existing:?} is registered, cannot register path {new:?} that shares it")]
    Overlap { existing: String, new: String },
    #[error("pattern {0:?} would match all paths")]
    MatchesAll(String),
}

#[derive(Debug)]
pub struct StrictMux<H> {
    routes: Vec<(String, H)>,
}

impl<H> Default for StrictMux<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> StrictMux<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern`. Trailing slashes are stripped, so `p` and `p/` are
    /// the same registration.
    pub fn handle(&mut self, pattern: &str, handler: H) -> Result<(), MuxError> {
        let sanitized = pattern.trim_end_matches('/');
        if sanitized.is_empty() {
            return Err(MuxError::MatchesAll(pattern.to_string()));
        }

        for (existing, _) in &self.routes {
            if existing == sanitized {
                return Err(MuxError::AlreadyRegistered(sanitized.to_string()));
            }
            // Overlap is checked on `pattern + "/"` so that "/api/v1/rules"
            // does not collide with "/api/v1/rulesfoo".
            let new_slash = format!("{}/", sanitized);
            let existing_slash = format!("{}/", existing);
            if new_slash.starts_with(&existing_slash) || existing_slash.starts_with(&new_slash) {
                return Err(MuxError::Overlap {
                    existing: existing.clone(),
                    new: sanitized.to_string(),
                });
            }
        }

        self.routes.push((sanitized.to_string(), handler));
        Ok(())
    }

    /// Look up the handler for a request path: exact match after trailing-`/`
    /// normalization, falling back to the longest registered prefix.
    pub fn lookup(&self, path: &str) -> Option<(&str, &H)> {
        let normalized = path.trim_end_matches('/');

        if let Some((pattern, handler)) = self.routes.iter().find(|(p, _)| p == normalized) {
            return Some((pattern.as_str(), handler));
        }

        self.routes
            .iter()
            .filter(|(p, _)| normalized.starts_with(&format!("{}/", p)))
            .max_by_key(|(p, _)| p.len())
            .map(|(p, h)| (p.as_str(), h))
    }

}
