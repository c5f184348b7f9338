use serde::{Deserialize, Serialize};
use std::fmt;

/// Compound identity stamped on documents as `createdBy` / `updatedBy` and
/// copied onto audit snapshots as the author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub caller_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_number: Option<i64>,
    #[serde(default)]
    pub display_name: String,
}

impl Actor {
    pub fn new(caller_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            human_number: None,
            display_name: display_name.into(),
        }
    }

    #[must_use]
    pub const fn with_human_number(mut self, number: i64) -> Self {
        self.human_number = Some(number);
        self
    }

    /// Identity used for writes performed by the ledger itself.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system", "tally")
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.human_number {
            Some(n) => write!(f, "{} (#{n}, {})", self.display_name, self.caller_id),
            None => write!(f, "{} ({})", self.display_name, self.caller_id),
        }
    }
}
