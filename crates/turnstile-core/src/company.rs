use serde::{Deserialize, Serialize};

/// Subscription state of a tenant account. Stored and transmitted as
/// upper-case strings; parsing is case-insensitive because historical
/// clients disagreed on casing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    Active,
    Inactive,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Inactive => write!(f, "INACTIVE"),
        }
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            other => Err(format!("unknown subscription state: {other}")),
        }
    }
}

/// Answer to a widget gate query. `active` is the canonical derived
/// standing; widgets must not render when it is false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub active: bool,
    pub tokens: i64,
}

impl GateStatus {
    /// The fail-closed answer: deny, report no credit.
    pub fn denied() -> Self {
        Self {
            active: false,
            tokens: 0,
        }
    }
}
