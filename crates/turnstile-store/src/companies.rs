use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use turnstile_core::ids::CompanyId;
use turnstile_core::SubscriptionState;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A company snapshot as stored in the ledger. Read-only outside the
/// store; all mutation goes through `TransactionRepo::apply`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompanyRow {
    pub id: CompanyId,
    pub name: String,
    pub email: String,
    pub plan: String,
    pub token_balance: i64,
    pub max_tokens: i64,
    pub subscription: SubscriptionState,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

const SELECT_COLUMNS: &str = "id, name, email, plan, token_balance, max_tokens, \
                              subscription, version, created_at, updated_at";

#[derive(Clone)]
pub struct CompanyRepo {
    db: Database,
}

impl CompanyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a company. Onboarding boundary: starts with zero balance and
    /// an INACTIVE subscription.
    #[instrument(skip(self), fields(name, plan))]
    pub fn create(
        &self,
        name: &str,
        email: &str,
        plan: &str,
        max_tokens: i64,
    ) -> Result<CompanyRow, StoreError> {
        if max_tokens < 0 {
            return Err(StoreError::InvalidDelta(format!(
                "max_tokens must be non-negative, got {max_tokens}"
            )));
        }

        let id = CompanyId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO companies (id, name, email, plan, token_balance, max_tokens,
                                        subscription, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, 'INACTIVE', 0, ?6, ?6)",
                rusqlite::params![id.as_str(), name, email, plan, max_tokens, now],
            )?;

            Ok(CompanyRow {
                id,
                name: name.to_string(),
                email: email.to_string(),
                plan: plan.to_string(),
                token_balance: 0,
                max_tokens,
                subscription: SubscriptionState::Inactive,
                version: 0,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a company snapshot by ID.
    #[instrument(skip(self), fields(company_id = %id))]
    pub fn get(&self, id: &CompanyId) -> Result<CompanyRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM companies WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_company(row),
                None => Err(StoreError::NotFound(format!("company {id}"))),
            }
        })
    }

    /// Case-insensitive substring search over name, email, and id.
    /// No filter returns every company, newest first.
    #[instrument(skip(self))]
    pub fn search(&self, filter: Option<&str>) -> Result<Vec<CompanyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match filter.map(str::trim).filter(|f| !f.is_empty()) {
                Some(f) => {
                    let pattern = format!("%{}%", row_helpers::escape_like(&f.to_lowercase()));
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM companies
                         WHERE LOWER(name) LIKE ?1 ESCAPE '\\'
                            OR LOWER(email) LIKE ?1 ESCAPE '\\'
                            OR LOWER(id) LIKE ?1 ESCAPE '\\'
                         ORDER BY created_at DESC"
                    ))?;
                    let mut rows = stmt.query([pattern])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_company(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLUMNS} FROM companies ORDER BY created_at DESC"
                    ))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_company(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

pub(crate) fn row_to_company(row: &rusqlite::Row<'_>) -> Result<CompanyRow, StoreError> {
    let subscription_str: String = row_helpers::get(row, 6, "companies", "subscription")?;

    Ok(CompanyRow {
        id: CompanyId::from_raw(row_helpers::get::<String>(row, 0, "companies", "id")?),
        name: row_helpers::get(row, 1, "companies", "name")?,
        email: row_helpers::get(row, 2, "companies", "email")?,
        plan: row_helpers::get(row, 3, "companies", "plan")?,
        token_balance: row_helpers::get(row, 4, "companies", "token_balance")?,
        max_tokens: row_helpers::get(row, 5, "companies", "max_tokens")?,
        subscription: row_helpers::parse_enum(&subscription_str, "companies", "subscription")?,
        version: row_helpers::get(row, 7, "companies", "version")?,
        created_at: row_helpers::get(row, 8, "companies", "created_at")?,
        updated_at: row_helpers::get(row, 9, "companies", "updated_at")?,
    })
}
