pub mod cooldown;
pub mod monitor;
pub mod selector;

pub use cooldown::{CooldownReason, CooldownRecord, CooldownRegistry};
pub use monitor::QuotaMonitor;
pub use selector::{CredentialSelector, SelectedCredential};
