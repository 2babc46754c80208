pub mod companies;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod transactions;

pub use companies::{CompanyRepo, CompanyRow};
pub use database::Database;
pub use error::StoreError;
pub use transactions::{ChangeSet, TransactionRepo, TransactionRow};
