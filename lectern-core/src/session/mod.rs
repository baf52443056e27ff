mod catalog;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub use catalog::{CatalogEntry, CatalogSessionProvider, LectureCatalog};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session expired while resolving {lecture_id}")]
    Expired { lecture_id: String },
    #[error("lecture {lecture_id} not found")]
    NotFound { lecture_id: String },
    #[error("session provider unavailable: {0}")]
    Unavailable(String),
}

/// Credentials carried on every download request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Session {
    pub user_agent: Option<String>,
    pub cookies: BTreeMap<String, String>,
}

impl Session {
    /// `Cookie` header value, or `None` when the jar is empty.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// A direct, time-limited media URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

impl ResolvedMedia {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn resolve(&self, lecture_id: &str) -> SessionResult<ResolvedMedia>;

    fn session(&self) -> &Session;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_joins_pairs_in_name_order() {
        let mut session = Session::default();
        assert_eq!(session.cookie_header(), None);
        session.cookies.insert("sid".into(), "abc".into());
        session.cookies.insert("csrftoken".into(), "xyz".into());
        assert_eq!(
            session.cookie_header().as_deref(),
            Some("csrftoken=xyz; sid=abc")
        );
    }
}
