use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthError, Error, Result};
use crate::tokens::now_secs;

use super::HttpClient;
use super::token::refresh_access_token;

/// Access tokens are treated as expired this many seconds early.
const EXPIRY_SLACK_SECS: u64 = 300;

/// One upstream identity: a refresh token plus its derived state.
#[derive(Debug, Clone)]
pub struct Credential {
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<u64>,
    pub project_id: Option<String>,
    pub enabled: bool,
    pub disabled_models: HashSet<String>,
    /// Ephemeral per process start; never persisted.
    pub session_id: String,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now_secs() + EXPIRY_SLACK_SECS >= expires_at,
            _ => true,
        }
    }

    /// Stable key for quota bookkeeping: project id once fetched, refresh
    /// token before that.
    pub fn quota_key(&self) -> &str {
        self.project_id.as_deref().unwrap_or(&self.refresh_token)
    }
}

/// Persisted form of a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
    #[serde(default, rename = "projectId", skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(default, rename = "enable", skip_serializing_if = "Option::is_none")]
    enable: Option<bool>,
    #[serde(
        default,
        rename = "disabledModels",
        skip_serializing_if = "Option::is_none"
    )]
    disabled_models: Option<Vec<String>>,
}

impl StoredCredential {
    fn expires_at(&self) -> Option<u64> {
        match (self.timestamp, self.expires_in) {
            (Some(timestamp), Some(expires_in)) => Some(timestamp + expires_in),
            _ => None,
        }
    }
}

/// The credential pool, loaded from a JSON array on disk.
///
/// Persistence is merge-style: the on-disk array is re-read before every
/// write so entries added by an administrator are not clobbered, and
/// disabled credentials stay in the file even after they leave memory.
pub struct CredentialStore {
    path: PathBuf,
    inner: RwLock<Vec<Credential>>,
}

impl CredentialStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stored = read_stored(&path)?;

        let credentials: Vec<Credential> = stored
            .into_iter()
            .filter(|s| s.enable != Some(false))
            .map(|s| Credential {
                expires_at: s.expires_at(),
                refresh_token: s.refresh_token,
                access_token: s.access_token,
                project_id: s.project_id,
                enabled: true,
                disabled_models: s.disabled_models.unwrap_or_default().into_iter().collect(),
                session_id: Uuid::new_v4().to_string(),
            })
            .collect();

        info!(
            count = credentials.len(),
            path = %path.display(),
            "Loaded credentials"
        );

        Ok(Self {
            path,
            inner: RwLock::new(credentials),
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Credential> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, refresh_token: &str) -> Option<Credential> {
        self.inner
            .read()
            .await
            .iter()
            .find(|c| c.refresh_token == refresh_token)
            .cloned()
    }

    pub async fn by_project_id(&self, project_id: &str) -> Option<Credential> {
        self.inner
            .read()
            .await
            .iter()
            .find(|c| c.project_id.as_deref() == Some(project_id))
            .cloned()
    }

    /// Refresh the access token for a credential and persist the result.
    ///
    /// A 400/403 from the OAuth endpoint propagates as an auth-dead error;
    /// the caller is expected to `disable` the credential.
    pub async fn refresh(&self, http: &HttpClient, refresh_token: &str) -> Result<String> {
        let (access_token, expires_in) = refresh_access_token(http, refresh_token).await?;

        {
            let mut pool = self.inner.write().await;
            let Some(credential) = pool.iter_mut().find(|c| c.refresh_token == refresh_token)
            else {
                return Err(Error::Auth(AuthError::RefreshTransient(
                    "credential no longer in pool".into(),
                )));
            };
            credential.access_token = Some(access_token.clone());
            credential.expires_at = Some(now_secs() + expires_in);
        }

        self.persist().await?;
        Ok(access_token)
    }

    /// Record a discovered project id and persist it.
    pub async fn set_project_id(&self, refresh_token: &str, project_id: &str) -> Result<()> {
        {
            let mut pool = self.inner.write().await;
            if let Some(credential) = pool.iter_mut().find(|c| c.refresh_token == refresh_token) {
                credential.project_id = Some(project_id.to_string());
            }
        }
        self.persist().await
    }

    /// Flip a model in or out of the disabled set. Returns whether the set
    /// changed; persists only on change.
    pub async fn set_model_disabled(
        &self,
        refresh_token: &str,
        model: &str,
        disabled: bool,
    ) -> Result<bool> {
        let changed = {
            let mut pool = self.inner.write().await;
            match pool.iter_mut().find(|c| c.refresh_token == refresh_token) {
                Some(credential) => {
                    if disabled {
                        credential.disabled_models.insert(model.to_string())
                    } else {
                        credential.disabled_models.remove(model)
                    }
                }
                None => false,
            }
        };
        if changed {
            self.persist().await?;
        }
        Ok(changed)
    }

    /// Administratively kill a credential: persist `enable=false`, then drop
    /// it from the in-memory pool.
    pub async fn disable(&self, refresh_token: &str) -> Result<()> {
        {
            let mut pool = self.inner.write().await;
            if let Some(credential) = pool.iter_mut().find(|c| c.refresh_token == refresh_token) {
                credential.enabled = false;
                warn!(
                    project = ?credential.project_id,
                    "Disabling credential"
                );
            }
        }
        self.persist().await?;
        self.inner.write().await.retain(|c| c.enabled);
        Ok(())
    }

    /// Merge the in-memory state into the on-disk array and write atomically.
    pub async fn persist(&self) -> Result<()> {
        let pool = self.inner.read().await;
        let mut stored = read_stored(&self.path).unwrap_or_default();

        for credential in pool.iter() {
            let record = to_stored(credential);
            match stored
                .iter_mut()
                .find(|s| s.refresh_token == credential.refresh_token)
            {
                Some(existing) => *existing = record,
                None => stored.push(record),
            }
        }
        drop(pool);

        write_stored_atomic(&self.path, &stored)
    }
}

fn to_stored(credential: &Credential) -> StoredCredential {
    // expires_at splits back into (timestamp, expires_in) with the grant
    // anchored at persist time
    let (timestamp, expires_in) = match credential.expires_at {
        Some(expires_at) => {
            let now = now_secs().min(expires_at);
            (Some(now), Some(expires_at - now))
        }
        None => (None, None),
    };

    StoredCredential {
        refresh_token: credential.refresh_token.clone(),
        access_token: credential.access_token.clone(),
        expires_in,
        timestamp,
        project_id: credential.project_id.clone(),
        enable: Some(credential.enabled),
        disabled_models: if credential.disabled_models.is_empty() {
            None
        } else {
            let mut models: Vec<String> = credential.disabled_models.iter().cloned().collect();
            models.sort();
            Some(models)
        },
    }
}

fn read_stored(path: &Path) -> Result<Vec<StoredCredential>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_stored_atomic(path: &Path, stored: &[StoredCredential]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(stored)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("agrelay-test-{}-{}.json", name, Uuid::new_v4()))
    }

    fn write_file(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn load_filters_disabled_and_assigns_sessions() {
        let path = temp_path("load");
        write_file(
            &path,
            r#"[
                {"refresh_token": "rt-a", "projectId": "proj-a"},
                {"refresh_token": "rt-b", "enable": false},
                {"refresh_token": "rt-c", "disabledModels": ["gemini-3-flash"]}
            ]"#,
        );

        let store = CredentialStore::load(&path).unwrap();
        let pool = store.snapshot().await;
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|c| !c.session_id.is_empty()));
        assert_ne!(pool[0].session_id, pool[1].session_id);

        let c = store.get("rt-c").await.unwrap();
        assert!(c.disabled_models.contains("gemini-3-flash"));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let store = CredentialStore::load(temp_path("missing")).unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn expiry_honors_slack() {
        let path = temp_path("expiry");
        let now = now_secs();
        write_file(
            &path,
            &format!(
                r#"[{{"refresh_token": "rt", "access_token": "at", "expires_in": 3600, "timestamp": {now}}}]"#
            ),
        );

        let store = CredentialStore::load(&path).unwrap();
        let credential = store.get("rt").await.unwrap();
        assert!(!credential.is_expired());

        // A token within the slack window counts as expired
        let mut soon = credential.clone();
        soon.expires_at = Some(now_secs() + EXPIRY_SLACK_SECS - 10);
        assert!(soon.is_expired());

        // No token at all is always expired
        let mut none = credential;
        none.access_token = None;
        assert!(none.is_expired());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn persist_merges_with_admin_added_entries() {
        let path = temp_path("merge");
        write_file(&path, r#"[{"refresh_token": "rt-a"}]"#);

        let store = CredentialStore::load(&path).unwrap();
        store.set_project_id("rt-a", "proj-a").await.unwrap();

        // An administrator appends a credential out of band
        let mut on_disk: Vec<StoredCredential> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        on_disk.push(StoredCredential {
            refresh_token: "rt-new".into(),
            access_token: None,
            expires_in: None,
            timestamp: None,
            project_id: None,
            enable: None,
            disabled_models: None,
        });
        write_file(&path, &serde_json::to_string(&on_disk).unwrap());

        // The next persist keeps the admin's entry
        store.persist().await.unwrap();
        let merged: Vec<StoredCredential> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|s| s.refresh_token == "rt-new"));
        assert!(
            merged
                .iter()
                .any(|s| s.project_id.as_deref() == Some("proj-a"))
        );

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn disable_persists_and_removes_from_memory() {
        let path = temp_path("disable");
        write_file(
            &path,
            r#"[{"refresh_token": "rt-a"}, {"refresh_token": "rt-b"}]"#,
        );

        let store = CredentialStore::load(&path).unwrap();
        store.disable("rt-a").await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.get("rt-a").await.is_none());

        // The file still carries the dead credential, marked enable=false
        let on_disk: Vec<StoredCredential> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let dead = on_disk
            .iter()
            .find(|s| s.refresh_token == "rt-a")
            .expect("disabled credential stays on disk");
        assert_eq!(dead.enable, Some(false));

        // A reload no longer sees it
        let reloaded = CredentialStore::load(&path).unwrap();
        assert_eq!(reloaded.len().await, 1);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn disabled_models_round_trip() {
        let path = temp_path("models");
        write_file(&path, r#"[{"refresh_token": "rt-a"}]"#);

        let store = CredentialStore::load(&path).unwrap();
        assert!(
            store
                .set_model_disabled("rt-a", "gemini-3-flash", true)
                .await
                .unwrap()
        );
        // Re-disabling is a no-op
        assert!(
            !store
                .set_model_disabled("rt-a", "gemini-3-flash", true)
                .await
                .unwrap()
        );

        let reloaded = CredentialStore::load(&path).unwrap();
        let credential = reloaded.get("rt-a").await.unwrap();
        assert!(credential.disabled_models.contains("gemini-3-flash"));

        assert!(
            reloaded
                .set_model_disabled("rt-a", "gemini-3-flash", false)
                .await
                .unwrap()
        );
        let credential = reloaded.get("rt-a").await.unwrap();
        assert!(credential.disabled_models.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn session_id_never_persisted() {
        let credential = Credential {
            refresh_token: "rt".into(),
            access_token: None,
            expires_at: None,
            project_id: None,
            enabled: true,
            disabled_models: HashSet::new(),
            session_id: "ephemeral".into(),
        };
        let stored = to_stored(&credential);
        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("ephemeral"));
        assert!(!json.contains("session"));
    }

    #[test]
    fn quota_key_prefers_project_id() {
        let mut credential = Credential {
            refresh_token: "rt".into(),
            access_token: None,
            expires_at: None,
            project_id: None,
            enabled: true,
            disabled_models: HashSet::new(),
            session_id: "s".into(),
        };
        assert_eq!(credential.quota_key(), "rt");
        credential.project_id = Some("proj".into());
        assert_eq!(credential.quota_key(), "proj");
    }
}
