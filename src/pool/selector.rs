use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::auth::{Credential, CredentialStore, HttpClient};
use crate::config::Config;
use crate::error::{ApiError, Error, Result};
use crate::tokens::UsageLedger;
use crate::upstream::discover::{discover_project, random_project_id};

use super::cooldown::CooldownRegistry;

/// Everything a request handler needs from a selected credential.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub refresh_token: String,
    pub project_id: String,
    pub access_token: String,
    pub session_id: String,
}

type UsedCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Round-robin credential picker.
///
/// Consults the store (disabled models, token expiry), the cooldown
/// registry, and the usage ledger; dead credentials are disabled in place
/// and skipped. The used-callback is installed after construction so the
/// monitor can be built with the pool already in hand.
pub struct CredentialSelector {
    store: Arc<CredentialStore>,
    cooldowns: Arc<CooldownRegistry>,
    ledger: Arc<UsageLedger>,
    http: Arc<HttpClient>,
    hourly_limit: usize,
    fetch_project_id: bool,
    current_index: AtomicUsize,
    on_used: RwLock<Option<UsedCallback>>,
}

impl CredentialSelector {
    pub fn new(
        store: Arc<CredentialStore>,
        cooldowns: Arc<CooldownRegistry>,
        ledger: Arc<UsageLedger>,
        http: Arc<HttpClient>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            cooldowns,
            ledger,
            http,
            hourly_limit: config.pool.hourly_limit,
            fetch_project_id: config.pool.fetch_project_id,
            current_index: AtomicUsize::new(0),
            on_used: RwLock::new(None),
        }
    }

    pub fn set_on_used(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_used.write() = Some(Box::new(callback));
    }

    /// Pick the next usable credential for `model`, or fail with
    /// PoolExhausted after one full round.
    pub async fn select(&self, model: Option<&str>) -> Result<SelectedCredential> {
        let attempts = self.store.len().await;
        if attempts == 0 {
            return Err(Error::Api(ApiError::PoolExhausted));
        }

        for _ in 0..attempts {
            let index = self.current_index.fetch_add(1, Ordering::Relaxed);
            let pool = self.store.snapshot().await;
            if pool.is_empty() {
                break;
            }
            let credential = pool[index % pool.len()].clone();

            if let Some(model) = model
                && credential.disabled_models.contains(model)
            {
                debug!(model = %model, "Model disabled for credential, advancing");
                continue;
            }

            let access_token = if credential.is_expired() {
                match self.store.refresh(&self.http, &credential.refresh_token).await {
                    Ok(token) => token,
                    Err(error) if error.is_auth_dead() => {
                        warn!(error = %error, "Credential dead on refresh, disabling");
                        self.store.disable(&credential.refresh_token).await?;
                        continue;
                    }
                    Err(error) => {
                        warn!(error = %error, "Token refresh failed, advancing");
                        continue;
                    }
                }
            } else {
                match credential.access_token.clone() {
                    Some(token) => token,
                    None => continue,
                }
            };

            let project_id = match credential.project_id.clone() {
                Some(project_id) => project_id,
                None => match self.resolve_project_id(&credential, &access_token).await {
                    Ok(project_id) => project_id,
                    Err(error) if error.is_auth_dead() => {
                        warn!(error = %error, "Credential ineligible, disabling");
                        self.store.disable(&credential.refresh_token).await?;
                        continue;
                    }
                    Err(error) => {
                        warn!(error = %error, "Project discovery failed, advancing");
                        continue;
                    }
                },
            };

            if let Some(model) = model
                && self.cooldowns.is_on(&project_id, model)
            {
                debug!(project = %project_id, model = %model, "Pair on cooldown, advancing");
                continue;
            }

            if self.ledger.recent_count(&project_id) >= self.hourly_limit {
                debug!(
                    project = %project_id,
                    limit = self.hourly_limit,
                    "Hourly usage cap reached, advancing"
                );
                continue;
            }

            self.ledger.record(&project_id);
            if let Some(callback) = self.on_used.read().as_ref() {
                callback(&project_id);
            }

            return Ok(SelectedCredential {
                refresh_token: credential.refresh_token,
                project_id,
                access_token,
                session_id: credential.session_id,
            });
        }

        Err(Error::Api(ApiError::PoolExhausted))
    }

    /// Direct lookup for callers continuing a session on a known project.
    pub async fn by_project_id(&self, project_id: &str) -> Option<Credential> {
        self.store.by_project_id(project_id).await
    }

    /// Mark a credential dead after a hard upstream rejection mid-request.
    pub async fn disable(&self, refresh_token: &str) -> Result<()> {
        self.store.disable(refresh_token).await
    }

    async fn resolve_project_id(
        &self,
        credential: &Credential,
        access_token: &str,
    ) -> Result<String> {
        let project_id = if self.fetch_project_id {
            discover_project(&self.http, access_token).await?
        } else {
            random_project_id()
        };
        self.store
            .set_project_id(&credential.refresh_token, &project_id)
            .await?;
        Ok(project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::cooldown::CooldownReason;
    use crate::tokens::now_secs;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "agrelay-selector-{}-{}.json",
            name,
            uuid::Uuid::new_v4()
        ))
    }

    /// A store whose credentials all hold fresh tokens and project ids, so
    /// selection never needs the network.
    fn ready_store(path: &PathBuf, projects: &[&str]) -> Arc<CredentialStore> {
        let far_future = now_secs() + 86400;
        let entries: Vec<serde_json::Value> = projects
            .iter()
            .enumerate()
            .map(|(i, project)| {
                serde_json::json!({
                    "refresh_token": format!("rt-{i}"),
                    "access_token": format!("at-{i}"),
                    "expires_in": 86400,
                    "timestamp": far_future - 86400,
                    "projectId": project
                })
            })
            .collect();
        std::fs::write(path, serde_json::to_string(&entries).unwrap()).unwrap();
        Arc::new(CredentialStore::load(path).unwrap())
    }

    fn selector_for(
        store: Arc<CredentialStore>,
        cooldowns: Arc<CooldownRegistry>,
        hourly_limit: usize,
    ) -> CredentialSelector {
        let mut config = Config::from_env();
        config.pool.hourly_limit = hourly_limit;
        CredentialSelector::new(
            store,
            cooldowns,
            Arc::new(UsageLedger::new()),
            Arc::new(HttpClient::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let cred_path = temp_path("empty-creds");
        let cool_path = temp_path("empty-cool");
        let store = Arc::new(CredentialStore::load(&cred_path).unwrap());
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        let selector = selector_for(store, cooldowns.clone(), 20);
        let error = selector.select(Some("gemini-3-flash")).await.unwrap_err();
        assert!(matches!(error, Error::Api(ApiError::PoolExhausted)));

        cooldowns.shutdown();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let cred_path = temp_path("fair-creds");
        let cool_path = temp_path("fair-cool");
        let store = ready_store(&cred_path, &["proj-a", "proj-b", "proj-c"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        let selector = selector_for(store, cooldowns.clone(), 1000);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let selected = selector.select(Some("gemini-3-flash")).await.unwrap();
            *counts.entry(selected.project_id).or_default() += 1;
        }

        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert_eq!(counts.len(), 3);
        assert!(max - min <= 1, "unfair selection counts: {counts:?}");

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn hourly_cap_skips_to_next_credential() {
        let cred_path = temp_path("cap-creds");
        let cool_path = temp_path("cap-cool");
        let store = ready_store(&cred_path, &["proj-a", "proj-b"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        let selector = selector_for(store, cooldowns.clone(), 2);

        // Exhaust proj-a's hourly budget
        selector.ledger.record("proj-a");
        selector.ledger.record("proj-a");

        let first = selector.select(Some("gemini-3-flash")).await.unwrap();
        let second = selector.select(Some("gemini-3-flash")).await.unwrap();
        assert_eq!(first.project_id, "proj-b");
        assert_eq!(second.project_id, "proj-b");

        // Now proj-b is capped too: pool exhausted
        let error = selector.select(Some("gemini-3-flash")).await.unwrap_err();
        assert!(matches!(error, Error::Api(ApiError::PoolExhausted)));

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn cooldown_respected_until_reset() {
        let cred_path = temp_path("cd-creds");
        let cool_path = temp_path("cd-cool");
        let store = ready_store(&cred_path, &["proj-a", "proj-b"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        cooldowns.put(
            "proj-a",
            "gemini-2.5-pro",
            now_secs() + 60,
            CooldownReason::ResourceExhausted,
            None,
        );

        let selector = selector_for(store, cooldowns.clone(), 1000);

        for _ in 0..6 {
            let selected = selector.select(Some("gemini-2.5-pro")).await.unwrap();
            assert_eq!(selected.project_id, "proj-b");
        }

        // The cooldown is per-model: other models still reach proj-a
        let projects: Vec<String> = {
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(selector.select(Some("gemini-3-flash")).await.unwrap().project_id);
            }
            seen
        };
        assert!(projects.iter().any(|p| p == "proj-a"));

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn disabled_model_skips_credential() {
        let cred_path = temp_path("dis-creds");
        let cool_path = temp_path("dis-cool");
        let store = ready_store(&cred_path, &["proj-a", "proj-b"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        store
            .set_model_disabled("rt-0", "gemini-3-flash", true)
            .await
            .unwrap();

        let selector = selector_for(store, cooldowns.clone(), 1000);
        for _ in 0..4 {
            let selected = selector.select(Some("gemini-3-flash")).await.unwrap();
            assert_eq!(selected.project_id, "proj-b");
        }

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn selection_without_model_ignores_model_gates() {
        let cred_path = temp_path("nomodel-creds");
        let cool_path = temp_path("nomodel-cool");
        let store = ready_store(&cred_path, &["proj-a"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        store
            .set_model_disabled("rt-0", "gemini-3-flash", true)
            .await
            .unwrap();

        let selector = selector_for(store, cooldowns.clone(), 1000);
        let selected = selector.select(None).await.unwrap();
        assert_eq!(selected.project_id, "proj-a");
        assert!(!selected.session_id.is_empty());

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn used_callback_fires_on_selection() {
        let cred_path = temp_path("used-creds");
        let cool_path = temp_path("used-cool");
        let store = ready_store(&cred_path, &["proj-a"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        let selector = selector_for(store, cooldowns.clone(), 1000);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        selector.set_on_used(move |project| sink.lock().push(project.to_string()));

        selector.select(Some("gemini-3-flash")).await.unwrap();
        assert_eq!(seen.lock().as_slice(), ["proj-a".to_string()]);

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }

    #[tokio::test]
    async fn by_project_id_lookup() {
        let cred_path = temp_path("lookup-creds");
        let cool_path = temp_path("lookup-cool");
        let store = ready_store(&cred_path, &["proj-a", "proj-b"]);
        let cooldowns = CooldownRegistry::load(&cool_path).unwrap();

        let selector = selector_for(store, cooldowns.clone(), 1000);
        let credential = selector.by_project_id("proj-b").await.unwrap();
        assert_eq!(credential.refresh_token, "rt-1");
        assert!(selector.by_project_id("proj-z").await.is_none());

        cooldowns.shutdown();
        std::fs::remove_file(&cred_path).ok();
        std::fs::remove_file(&cool_path).ok();
    }
}
