use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant + resource scoped lock name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub tenant_id: String,
    pub resource: String,
}

impl LockKey {
    pub fn new(tenant_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource: resource.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.tenant_id, self.resource)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.resource)
    }
}

/// Row held by the lock table while a lock is owned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
