//! App health probing.
//!
//! A probe is one HTTP GET against the app's registered URL with a short
//! timeout. Verdicts are cached per app behind coalesced cells so a burst
//! of callers costs one probe, and every fresh verdict is recorded on the
//! app row. A failed probe is a verdict, never an error: unhealthy apps
//! are reported, not propagated.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::CoalescedMap;
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct AppHealth {
    pub app_uuid: Uuid,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    cache: CoalescedMap<Uuid, AppHealth>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>, probe_timeout: Duration, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            store,
            client,
            cache: CoalescedMap::new(Some(ttl)),
        })
    }

    /// Returns the app's current health verdict, probing at most once per
    /// TTL window no matter how many callers ask.
    pub async fn check(&self, app_uuid: Uuid) -> Result<AppHealth> {
        let cell = self.cache.cell(&app_uuid);
        cell.get_or_refresh(|| self.probe(app_uuid)).await
    }

    /// Probes every registered app and returns the verdicts. Individual
    /// failures never abort the sweep.
    pub async fn check_all(&self) -> Result<Vec<AppHealth>> {
        let apps = self.store.list_apps()?;
        let mut verdicts = Vec::with_capacity(apps.len());
        for app in apps {
            verdicts.push(self.check(app.uuid).await?);
        }
        Ok(verdicts)
    }

    /// Drops the cached verdict so the next check probes again.
    pub fn forget(&self, app_uuid: Uuid) {
        self.cache.invalidate(&app_uuid);
    }

    async fn probe(&self, app_uuid: Uuid) -> Result<AppHealth> {
        let app = self.store.get_app(app_uuid)?.ok_or(Error::NotFound)?;

        // The internal app has no URL to probe; it is this process.
        let healthy = if app.url.is_empty() {
            true
        } else {
            match self.client.get(&app.url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::debug!(app = app.name, "health probe failed: {e}");
                    false
                }
            }
        };

        let checked_at = Utc::now();
        self.store.update_app_health(app_uuid, healthy, checked_at)?;
        Ok(AppHealth {
            app_uuid,
            healthy,
            checked_at,
        })
    }
}
