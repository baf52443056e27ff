use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::{load_toml, SessionSection};
use crate::error::Result as ConfigResult;

use super::{ResolvedMedia, Session, SessionError, SessionProvider, SessionResult};

const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// Exported lecture list: one session plus `[[lectures]]` entries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LectureCatalog {
    pub session: Session,
    pub lectures: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LectureCatalog {
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        load_toml(path)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lectures.iter().map(|entry| entry.id.clone()).collect()
    }
}

pub struct CatalogSessionProvider {
    session: Session,
    entries: HashMap<String, CatalogEntry>,
    url_ttl: Duration,
}

impl CatalogSessionProvider {
    pub fn new(catalog: LectureCatalog, config: &SessionSection) -> Self {
        let ttl_seconds = config.url_ttl_seconds.min(MAX_TTL_SECONDS) as i64;
        let entries = catalog
            .lectures
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        Self {
            session: catalog.session,
            entries,
            url_ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P, config: &SessionSection) -> ConfigResult<Self> {
        Ok(Self::new(LectureCatalog::load(path)?, config))
    }
}

#[async_trait]
impl SessionProvider for CatalogSessionProvider {
    async fn resolve(&self, lecture_id: &str) -> SessionResult<ResolvedMedia> {
        let entry = self
            .entries
            .get(lecture_id)
            .ok_or_else(|| SessionError::NotFound {
                lecture_id: lecture_id.to_string(),
            })?;
        let now = Utc::now();
        let expires_at = entry.expires_at.unwrap_or_else(|| {
            now.checked_add_signed(self.url_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        if expires_at <= now {
            return Err(SessionError::Expired {
                lecture_id: lecture_id.to_string(),
            });
        }
        debug!(lecture_id, %expires_at, "resolved lecture from catalog");
        Ok(ResolvedMedia {
            download_url: entry.url.clone(),
            expires_at,
        })
    }

    fn session(&self) -> &Session {
        &self.session
    }
}
