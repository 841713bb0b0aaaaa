use serde::{Deserialize, Serialize};
use std::fmt;

/// Periodic game-state resets coordinated by the world.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetKind {
    Daily,
    Weekly,
    Monthly,
}

impl ResetKind {
    pub const ALL: [ResetKind; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// Key of the server-info record holding the last reset time.
    pub fn storage_key(&self) -> &'static str {
        match self {
            Self::Daily => "DailyReset",
            Self::Weekly => "WeeklyReset",
            Self::Monthly => "MonthlyReset",
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}
