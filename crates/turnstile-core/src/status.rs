use crate::company::SubscriptionState;

/// Canonical account standing. The only place "active" is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Standing {
    Active,
    Inactive,
}

impl Standing {
    pub fn is_active(self) -> bool {
        matches!(self, Standing::Active)
    }
}

/// Derive the canonical standing from a company's current stored fields.
/// Pure and exhaustive: an account is usable only while its subscription
/// is ACTIVE and it has credit remaining. Callers must pass fields from a
/// fresh snapshot, never a separately stored flag.
pub fn derive(subscription: SubscriptionState, token_balance: i64) -> Standing {
    match (subscription, token_balance > 0) {
        (SubscriptionState::Active, true) => Standing::Active,
        (SubscriptionState::Active, false) => Standing::Inactive,
        (SubscriptionState::Inactive, _) => Standing::Inactive,
    }
}
