//! Local account quota

use serde::{Deserialize, Serialize};

/// Storage quota of an account hosted on this node.
///
/// Only the quota counters and the message are managed here; everything
/// else about accounts belongs to the permission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,

    /// Maximum bytes of context content this account may hold
    pub max_disk_space: u64,

    /// Bytes currently held
    pub disk_space_used: u64,

    /// Message surfaced to the account owner
    #[serde(default)]
    pub message: String,

    pub enabled: bool,
}

impl Account {
    pub fn new(account_id: impl Into<String>, max_disk_space: u64) -> Self {
        Self {
            account_id: account_id.into(),
            max_disk_space,
            disk_space_used: 0,
            message: String::new(),
            enabled: true,
        }
    }

    pub fn available(&self) -> u64 {
        self.max_disk_space.saturating_sub(self.disk_space_used)
    }

    /// Bytes that must be freed before `size` more bytes fit.
    pub fn shortfall(&self, size: u64) -> u64 {
        self.disk_space_used
            .saturating_add(size)
            .saturating_sub(self.max_disk_space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortfall() {
        let mut a = Account::new("acct", 1000);
        a.disk_space_used = 900;
        assert_eq!(a.available(), 100);
        assert_eq!(a.shortfall(50), 0);
        assert_eq!(a.shortfall(300), 200);

        a.disk_space_used = 1200;
        assert_eq!(a.available(), 0);
        assert_eq!(a.shortfall(0), 200);
    }
}
