//! Identity providers.
//!
//! An identity names the owner of a subscriber queue and tags relay traffic
//! with its origin. Machine identities survive restarts; instance identities
//! are fresh for every construction.

use std::fmt;

use uuid::Uuid;

/// Lifetime an identity is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityScope {
    /// Stable for the host across process restarts.
    Machine,
    /// Unique to one constructed instance.
    Instance,
}

impl fmt::Display for IdentityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Machine => f.write_str("machine"),
            Self::Instance => f.write_str("instance"),
        }
    }
}

/// Supplies the key used for subscriber naming and relay loop prevention.
pub trait IdentityProvider: Send + Sync {
    fn unique_id(&self) -> &str;
    fn scope(&self) -> IdentityScope;
}

/// Host name based identity.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    name: String,
}

impl MachineIdentity {
    /// Detect the host name.
    ///
    /// Resolution order: `override_name`, `HOSTNAME`, `COMPUTERNAME`,
    /// `/etc/hostname`, then `localhost`.
    pub fn detect(override_name: Option<&str>) -> Self {
        let name = override_name
            .map(str::to_string)
            .or_else(|| env_name("HOSTNAME"))
            .or_else(|| env_name("COMPUTERNAME"))
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string());
        Self { name }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn env_name(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl IdentityProvider for MachineIdentity {
    fn unique_id(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> IdentityScope {
        IdentityScope::Machine
    }
}

/// Random per-instance identity.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    id: String,
}

impl InstanceIdentity {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
        }
    }
}

impl Default for InstanceIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for InstanceIdentity {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn scope(&self) -> IdentityScope {
        IdentityScope::Instance
    }
}
