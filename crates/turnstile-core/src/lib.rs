pub mod company;
pub mod ids;
pub mod status;

pub use company::{GateStatus, SubscriptionState};
pub use status::{derive, Standing};
