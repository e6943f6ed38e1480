use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::model_group;
use crate::tokens::now_secs;

/// Why a (project, model) pair was put on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownReason {
    #[serde(rename = "RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    #[serde(rename = "OTHER")]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRecord {
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub model: String,
    #[serde(rename = "resetTimestamp")]
    pub reset_at: u64,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    pub reason: CooldownReason,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownFile {
    cooldowns: Vec<CooldownRecord>,
}

/// Group averages at or below this remaining fraction mean the shared pool
/// is truly exhausted, so the cooldown fans out across the group.
const GROUP_EXHAUSTION_THRESHOLD: f64 = 0.01;

/// Time-bounded prohibitions of (project, model) selection.
///
/// Every mutation rewrites the JSON document; expired records are evicted
/// lazily on read and proactively by per-record timers.
pub struct CooldownRegistry {
    path: PathBuf,
    records: RwLock<HashMap<String, CooldownRecord>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Handle the expiry timers use to reach back into the registry without
    /// keeping it alive.
    weak_self: RwLock<Weak<CooldownRegistry>>,
}

fn key_for(project_id: &str, model: &str) -> String {
    format!("{project_id}:{model}")
}

impl CooldownRegistry {
    /// Load persisted cooldowns, dropping the already-expired ones with a
    /// single compacting write.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let now = now_secs();

        let mut records = HashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if !content.trim().is_empty() {
                let file: CooldownFile = serde_json::from_str(&content)?;
                let total = file.cooldowns.len();
                for record in file.cooldowns {
                    if record.reset_at > now {
                        records.insert(key_for(&record.project_id, &record.model), record);
                    }
                }
                info!(
                    live = records.len(),
                    expired = total - records.len(),
                    "Loaded cooldowns"
                );
            }
        }

        let registry = Arc::new(Self {
            path,
            records: RwLock::new(records),
            timers: Mutex::new(HashMap::new()),
            weak_self: RwLock::new(Weak::new()),
        });
        *registry.weak_self.write() = Arc::downgrade(&registry);

        registry.persist()?;
        let live: Vec<(String, u64)> = registry
            .records
            .read()
            .iter()
            .map(|(key, record)| (key.clone(), record.reset_at))
            .collect();
        for (key, reset_at) in live {
            registry.schedule_expiry(key, reset_at);
        }

        Ok(registry)
    }

    /// Install a cooldown.
    ///
    /// When the model belongs to a group and a live quota snapshot is
    /// available, a group average above 1% remaining means the rejection was
    /// a transient rate limit: only this pair cools. At or below 1% the
    /// whole shared pool is exhausted and every group member cools with the
    /// same deadline.
    pub fn put(
        &self,
        project_id: &str,
        model: &str,
        reset_at: u64,
        reason: CooldownReason,
        quota_snapshot: Option<&HashMap<String, f64>>,
    ) {
        let targets: Vec<String> = match (quota_snapshot, model_group(model)) {
            (Some(snapshot), Some(group)) => {
                let average = group
                    .models
                    .iter()
                    .map(|m| snapshot.get(*m).copied().unwrap_or(0.0))
                    .sum::<f64>()
                    / group.models.len() as f64;

                if average > GROUP_EXHAUSTION_THRESHOLD {
                    vec![model.to_string()]
                } else {
                    info!(
                        group = group.name,
                        average = average,
                        "Group quota exhausted, cooling the whole group"
                    );
                    group.models.iter().map(|m| m.to_string()).collect()
                }
            }
            _ => vec![model.to_string()],
        };

        let now = now_secs();
        {
            let mut records = self.records.write();
            for target in &targets {
                records.insert(
                    key_for(project_id, target),
                    CooldownRecord {
                        project_id: project_id.to_string(),
                        model: target.clone(),
                        reset_at,
                        created_at: now,
                        reason,
                    },
                );
            }
        }

        if let Err(error) = self.persist() {
            warn!(error = %error, "Failed to persist cooldowns");
        }

        for target in &targets {
            info!(
                project = %project_id,
                model = %target,
                reset_in_secs = reset_at.saturating_sub(now),
                reason = ?reason,
                "Cooldown installed"
            );
            self.schedule_expiry(key_for(project_id, target), reset_at);
        }
    }

    /// Whether the pair is currently forbidden. Expired records found here
    /// are evicted on the spot.
    pub fn is_on(&self, project_id: &str, model: &str) -> bool {
        let key = key_for(project_id, model);
        let expired = {
            let records = self.records.read();
            match records.get(&key) {
                Some(record) if record.reset_at > now_secs() => return true,
                Some(_) => true,
                None => return false,
            }
        };

        if expired {
            self.records.write().remove(&key);
            self.timers.lock().remove(&key);
            if let Err(error) = self.persist() {
                warn!(error = %error, "Failed to persist cooldowns");
            }
        }
        false
    }

    pub fn list(&self) -> Vec<CooldownRecord> {
        let now = now_secs();
        let mut live: Vec<CooldownRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.reset_at > now)
            .cloned()
            .collect();
        live.sort_by(|a, b| (&a.project_id, &a.model).cmp(&(&b.project_id, &b.model)));
        live
    }

    pub fn list_for_project(&self, project_id: &str) -> Vec<CooldownRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.project_id == project_id)
            .collect()
    }

    pub fn remove(&self, project_id: &str, model: &str) -> bool {
        let key = key_for(project_id, model);
        let removed = self.records.write().remove(&key).is_some();
        if removed {
            if let Some(timer) = self.timers.lock().remove(&key) {
                timer.abort();
            }
            if let Err(error) = self.persist() {
                warn!(error = %error, "Failed to persist cooldowns");
            }
        }
        removed
    }

    pub fn clear_all(&self) {
        self.records.write().clear();
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
        if let Err(error) = self.persist() {
            warn!(error = %error, "Failed to persist cooldowns");
        }
        info!("All cooldowns cleared");
    }

    /// Abort pending expiry timers so shutdown is not held up.
    pub fn shutdown(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }

    fn schedule_expiry(&self, key: String, reset_at: u64) {
        let registry = self.weak_self.read().clone();
        let delay = Duration::from_secs(reset_at.saturating_sub(now_secs()));
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = registry.records.write().remove(&task_key);
            registry.timers.lock().remove(&task_key);
            if let Some(record) = removed {
                info!(
                    project = %record.project_id,
                    model = %record.model,
                    "Cooldown expired, model re-enabled"
                );
                if let Err(error) = registry.persist() {
                    warn!(error = %error, "Failed to persist cooldowns");
                }
            }
        });

        if let Some(old) = self.timers.lock().insert(key, handle) {
            old.abort();
        }
    }

    fn persist(&self) -> Result<()> {
        let cooldowns: Vec<CooldownRecord> = self.records.read().values().cloned().collect();
        debug!(count = cooldowns.len(), "Persisting cooldowns");

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&CooldownFile { cooldowns })?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "agrelay-cooldowns-{}-{}.json",
            name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn put_and_is_on() {
        let path = temp_path("basic");
        let registry = CooldownRegistry::load(&path).unwrap();

        assert!(!registry.is_on("proj", "gemini-3-flash"));

        registry.put(
            "proj",
            "gemini-3-flash",
            now_secs() + 60,
            CooldownReason::ResourceExhausted,
            None,
        );
        assert!(registry.is_on("proj", "gemini-3-flash"));
        assert!(!registry.is_on("proj", "gemini-3-pro-high"));
        assert!(!registry.is_on("other-proj", "gemini-3-flash"));

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn group_fans_out_when_average_exhausted() {
        let path = temp_path("group");
        let registry = CooldownRegistry::load(&path).unwrap();

        // Live quota reports the shared pool at zero
        let snapshot: HashMap<String, f64> = HashMap::new();
        registry.put(
            "proj-a",
            "gemini-2.5-pro",
            now_secs() + 60,
            CooldownReason::ResourceExhausted,
            Some(&snapshot),
        );

        let group = model_group("gemini-2.5-pro").unwrap();
        assert_eq!(group.models.len(), 5);
        for model in group.models {
            assert!(
                registry.is_on("proj-a", model),
                "expected {model} to be cooling"
            );
        }
        assert_eq!(registry.list_for_project("proj-a").len(), 5);

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn group_spared_when_average_healthy() {
        let path = temp_path("healthy");
        let registry = CooldownRegistry::load(&path).unwrap();

        let mut snapshot = HashMap::new();
        for model in model_group("gemini-2.5-pro").unwrap().models {
            snapshot.insert(model.to_string(), 0.8);
        }
        snapshot.insert("gemini-2.5-pro".to_string(), 0.0);

        registry.put(
            "proj-a",
            "gemini-2.5-pro",
            now_secs() + 60,
            CooldownReason::ResourceExhausted,
            Some(&snapshot),
        );

        // Average 0.64 > 1%: a transient limit on one model only
        assert!(registry.is_on("proj-a", "gemini-2.5-pro"));
        assert!(!registry.is_on("proj-a", "gemini-2.5-flash"));
        assert_eq!(registry.list_for_project("proj-a").len(), 1);

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn ungrouped_model_cools_alone_even_with_snapshot() {
        let path = temp_path("ungrouped");
        let registry = CooldownRegistry::load(&path).unwrap();

        let snapshot: HashMap<String, f64> = HashMap::new();
        registry.put(
            "proj",
            "experimental-model",
            now_secs() + 60,
            CooldownReason::Other,
            Some(&snapshot),
        );
        assert_eq!(registry.list().len(), 1);

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn expired_records_evict_lazily() {
        let path = temp_path("lazy");
        let registry = CooldownRegistry::load(&path).unwrap();

        registry.put(
            "proj",
            "gemini-3-flash",
            now_secs().saturating_sub(10),
            CooldownReason::Other,
            None,
        );
        assert!(!registry.is_on("proj", "gemini-3-flash"));
        assert!(registry.list().is_empty());

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn persistence_round_trip_discards_expired() {
        let path = temp_path("roundtrip");
        {
            let registry = CooldownRegistry::load(&path).unwrap();
            registry.put(
                "proj",
                "gemini-3-flash",
                now_secs() + 3600,
                CooldownReason::ResourceExhausted,
                None,
            );
            registry.put(
                "proj",
                "claude-sonnet-4-5",
                now_secs().saturating_sub(5),
                CooldownReason::Other,
                None,
            );
            registry.shutdown();
        }

        let reloaded = CooldownRegistry::load(&path).unwrap();
        let live = reloaded.list();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].model, "gemini-3-flash");
        assert!(matches!(live[0].reason, CooldownReason::ResourceExhausted));

        reloaded.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn file_format_matches_contract() {
        let path = temp_path("format");
        let registry = CooldownRegistry::load(&path).unwrap();
        registry.put(
            "proj-x",
            "gemini-3-flash",
            now_secs() + 120,
            CooldownReason::ResourceExhausted,
            None,
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let record = &raw["cooldowns"][0];
        assert_eq!(record["projectId"], "proj-x");
        assert_eq!(record["model"], "gemini-3-flash");
        assert_eq!(record["reason"], "RESOURCE_EXHAUSTED");
        assert!(record["resetTimestamp"].is_u64());
        assert!(record["createdAt"].is_u64());

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_proactively_evicts() {
        let path = temp_path("timer");
        let registry = CooldownRegistry::load(&path).unwrap();

        registry.put(
            "proj",
            "gemini-3-flash",
            now_secs() + 30,
            CooldownReason::Other,
            None,
        );
        assert_eq!(registry.list().len(), 1);

        // Paused time: the expiry timer fires as soon as we advance past it
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert!(registry.records.read().is_empty());

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn remove_and_clear_all() {
        let path = temp_path("admin");
        let registry = CooldownRegistry::load(&path).unwrap();

        registry.put("p1", "m1", now_secs() + 60, CooldownReason::Other, None);
        registry.put("p2", "m2", now_secs() + 60, CooldownReason::Other, None);

        assert!(registry.remove("p1", "m1"));
        assert!(!registry.remove("p1", "m1"));
        assert_eq!(registry.list().len(), 1);

        registry.clear_all();
        assert!(registry.list().is_empty());

        registry.shutdown();
        std::fs::remove_file(&path).ok();
    }
}
