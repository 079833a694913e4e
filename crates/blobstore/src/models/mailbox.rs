//! Mailbox identity as seen by the blob layer

use serde::{Deserialize, Serialize};

/// Numeric mailbox identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub i32);

impl MailboxId {
    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for MailboxId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// The parts of a mailbox the store needs: its id for path layout, the
/// owning account for partitioning remote keys, and its schema group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub account_id: String,
    /// Mailbox group the dedup scan iterates by
    #[serde(default = "default_group")]
    pub group_id: i32,
}

fn default_group() -> i32 {
    1
}

impl Mailbox {
    pub fn new(id: i32, account_id: impl Into<String>) -> Self {
        Self {
            id: MailboxId(id),
            account_id: account_id.into(),
            group_id: default_group(),
        }
    }

    pub fn in_group(mut self, group_id: i32) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

/// A mail item's blob as recorded in item metadata
///
/// `locator` is whatever the store returned at stage time; for volume
/// stores it is the volume id in decimal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxBlobInfo {
    pub mailbox_id: MailboxId,
    pub item_id: i32,
    pub revision: i32,
    pub locator: String,
    pub digest: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_defaults_to_group_one() {
        let mbox = Mailbox::new(7, "acct-7");
        assert_eq!(mbox.group_id, 1);
        assert_eq!(mbox.account_id(), "acct-7");
        assert_eq!(mbox.in_group(3).group_id, 3);
    }

    #[test]
    fn test_mailbox_deserialize_without_group() {
        let mbox: Mailbox = serde_json::from_str(r#"{"id": 4, "account_id": "a"}"#).unwrap();
        assert_eq!(mbox.id, MailboxId(4));
        assert_eq!(mbox.group_id, 1);
    }
}
