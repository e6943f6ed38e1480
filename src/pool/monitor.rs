use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, HttpClient};
use crate::config::Config;
use crate::tokens::now_secs;
use crate::upstream::UpstreamClient;

/// Per-credential quota snapshot, keyed by the credential's quota key
/// (project id once known, refresh token before that).
#[derive(Debug, Clone, Default)]
pub struct QuotaEntry {
    /// Remaining fraction of the daily allotment per model.
    pub models: HashMap<String, f64>,
    pub last_check: Option<u64>,
    pub last_used: Option<u64>,
}

/// Periodic quota sweeper.
///
/// Every 30 minutes it polls fetchAvailableModels for each enabled
/// credential, refreshes the quota cache, and flips models in and out of the
/// credential's disabled set around the 5% threshold.
pub struct QuotaMonitor {
    store: Arc<CredentialStore>,
    http: Arc<HttpClient>,
    upstream: Arc<UpstreamClient>,
    cache: RwLock<HashMap<String, QuotaEntry>>,
    is_checking: AtomicBool,
    low_threshold: f64,
    sweep_interval: Duration,
    recent_use_secs: u64,
    recheck_secs: u64,
}

impl QuotaMonitor {
    pub fn new(
        store: Arc<CredentialStore>,
        http: Arc<HttpClient>,
        upstream: Arc<UpstreamClient>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            http,
            upstream,
            cache: RwLock::new(HashMap::new()),
            is_checking: AtomicBool::new(false),
            low_threshold: config.pool.quota_low_threshold,
            sweep_interval: Duration::from_secs(config.pool.quota_sweep_interval_secs),
            recent_use_secs: config.pool.recent_use_secs,
            recheck_secs: config.pool.recheck_secs,
        })
    }

    /// Start the sweep loop; the first tick fires immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.sweep_interval);
            loop {
                ticker.tick().await;
                monitor.tick().await;
            }
        })
    }

    /// One sweep; overlapping ticks are skipped.
    pub async fn tick(&self) {
        if self.is_checking.swap(true, Ordering::SeqCst) {
            warn!("Previous quota sweep still running, skipping this tick");
            return;
        }
        self.sweep().await;
        self.is_checking.store(false, Ordering::SeqCst);
    }

    async fn sweep(&self) {
        let credentials = self.store.snapshot().await;
        debug!(count = credentials.len(), "Quota sweep started");
        let now = now_secs();

        for credential in credentials {
            let key = credential.quota_key().to_string();

            // One-time migration once the project id appears
            if credential.project_id.is_some() {
                self.migrate_entry(&credential.refresh_token, &key);
            }

            let entry = self.cache.read().get(&key).cloned();
            if should_skip(entry.as_ref(), now, self.recent_use_secs, self.recheck_secs) {
                debug!(key = %key, "Credential idle and recently checked, skipping");
                continue;
            }

            let access_token = if credential.is_expired() {
                match self.store.refresh(&self.http, &credential.refresh_token).await {
                    Ok(token) => token,
                    Err(error) => {
                        warn!(key = %key, error = %error, "Token refresh failed during sweep");
                        continue;
                    }
                }
            } else {
                match &credential.access_token {
                    Some(token) => token.clone(),
                    None => continue,
                }
            };

            let fractions = match self
                .upstream
                .fetch_model_quotas(&access_token, credential.project_id.as_deref())
                .await
            {
                Ok(fractions) => fractions,
                Err(error) => {
                    warn!(key = %key, error = %error, "Quota fetch failed");
                    continue;
                }
            };

            {
                let mut cache = self.cache.write();
                let entry = cache.entry(key.clone()).or_default();
                entry.models = fractions.clone();
                entry.last_check = Some(now_secs());
            }

            let (to_disable, to_enable) =
                classify_models(&fractions, &credential.disabled_models, self.low_threshold);

            for model in to_disable {
                info!(
                    key = %key,
                    model = %model,
                    remaining = fractions.get(&model).copied().unwrap_or(0.0),
                    "Quota low, disabling model"
                );
                if let Err(error) = self
                    .store
                    .set_model_disabled(&credential.refresh_token, &model, true)
                    .await
                {
                    warn!(error = %error, "Failed to persist disabled model");
                }
            }

            for model in to_enable {
                info!(
                    key = %key,
                    model = %model,
                    remaining = fractions.get(&model).copied().unwrap_or(1.0),
                    "Quota recovered, re-enabling model"
                );
                if let Err(error) = self
                    .store
                    .set_model_disabled(&credential.refresh_token, &model, false)
                    .await
                {
                    warn!(error = %error, "Failed to persist re-enabled model");
                }
            }
        }

        debug!("Quota sweep finished");
    }

    /// Note a successful selection for the skip rule.
    pub fn mark_used(&self, quota_key: &str) {
        let mut cache = self.cache.write();
        cache.entry(quota_key.to_string()).or_default().last_used = Some(now_secs());
    }

    /// Live remaining fractions for a credential, if any sweep has run.
    pub fn quota_snapshot(&self, quota_key: &str) -> Option<HashMap<String, f64>> {
        self.cache
            .read()
            .get(quota_key)
            .map(|entry| entry.models.clone())
    }

    fn migrate_entry(&self, old_key: &str, new_key: &str) {
        if old_key == new_key {
            return;
        }
        let mut cache = self.cache.write();
        if let Some(entry) = cache.remove(old_key) {
            debug!(from = %old_key, to = %new_key, "Migrating quota cache entry to project key");
            cache.entry(new_key.to_string()).or_insert(entry);
        }
    }
}

/// Skip iff the credential was idle for the recent-use window AND was
/// checked inside the recheck window. Idle credentials still get polled at
/// least once per recheck window.
fn should_skip(
    entry: Option<&QuotaEntry>,
    now: u64,
    recent_use_secs: u64,
    recheck_secs: u64,
) -> bool {
    let Some(entry) = entry else { return false };

    let recently_used = entry
        .last_used
        .is_some_and(|used| now.saturating_sub(used) < recent_use_secs);
    let recently_checked = entry
        .last_check
        .is_some_and(|checked| now.saturating_sub(checked) < recheck_secs);

    !recently_used && recently_checked
}

/// Split a quota report into models to disable (remaining at or below the
/// threshold) and models to re-enable (recovered above it). A model never
/// appears in both within one sweep.
fn classify_models(
    fractions: &HashMap<String, f64>,
    disabled: &HashSet<String>,
    threshold: f64,
) -> (Vec<String>, Vec<String>) {
    let mut to_disable = Vec::new();
    let mut to_enable = Vec::new();

    for (model, &remaining) in fractions {
        if remaining <= threshold {
            if !disabled.contains(model) {
                to_disable.push(model.clone());
            }
        } else if disabled.contains(model) {
            to_enable.push(model.clone());
        }
    }

    to_disable.sort();
    to_enable.sort();
    (to_disable, to_enable)
}
