pub mod directory;
pub mod error;
pub mod gate;
pub mod recharge;

pub use directory::{Directory, DirectoryPage};
pub use error::EngineError;
pub use gate::{GateConfig, GateService, SnapshotSource};
pub use recharge::{RechargeCoordinator, RechargeResult};
