use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use turnstile_core::ids::{CompanyId, TransactionId};
use turnstile_core::SubscriptionState;

use crate::companies::{row_to_company, CompanyRow};
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// An append-only ledger entry. Never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRow {
    pub id: TransactionId,
    pub company_id: CompanyId,
    pub idempotency_key: String,
    pub delta: i64,
    pub resulting_balance: i64,
    pub initiator: String,
    pub created_at: String,
}

/// The mutation a transaction applies. Administrative changes (suspension,
/// cap raise) ride on a zero-delta transaction so the version counter and
/// the transaction log stay in lockstep.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub delta: i64,
    pub set_subscription: Option<SubscriptionState>,
    pub set_max_tokens: Option<i64>,
}

impl ChangeSet {
    pub fn credit(delta: i64) -> Self {
        Self {
            delta,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct TransactionRepo {
    db: Database,
}

impl TransactionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomically apply a change to a company and append its ledger entry.
    ///
    /// Within one SQLite transaction: the current version must equal
    /// `expected_version` (else `Conflict`), the new balance must stay in
    /// `[0, max_tokens]` (else `InvalidDelta` / `QuotaExceeded`), then the
    /// company row is updated, the version bumped, and the transaction
    /// record inserted. No partial application is ever visible to readers.
    #[instrument(skip(self, change), fields(company_id = %company_id, delta = change.delta))]
    pub fn apply(
        &self,
        company_id: &CompanyId,
        change: &ChangeSet,
        idempotency_key: &str,
        expected_version: i64,
        initiator: &str,
    ) -> Result<(CompanyRow, TransactionRow), StoreError> {
        let txn_id = TransactionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let mut current = {
                let mut stmt = tx.prepare(
                    "SELECT id, name, email, plan, token_balance, max_tokens,
                            subscription, version, created_at, updated_at
                     FROM companies WHERE id = ?1",
                )?;
                let mut rows = stmt.query([company_id.as_str()])?;
                match rows.next()? {
                    Some(row) => row_to_company(row)?,
                    None => return Err(StoreError::NotFound(format!("company {company_id}"))),
                }
            };

            if current.version != expected_version {
                return Err(StoreError::Conflict {
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let max_tokens = change.set_max_tokens.unwrap_or(current.max_tokens);
            if max_tokens < 0 {
                return Err(StoreError::InvalidDelta(format!(
                    "max_tokens must be non-negative, got {max_tokens}"
                )));
            }

            let new_balance = current.token_balance.checked_add(change.delta).ok_or_else(|| {
                StoreError::InvalidDelta(format!(
                    "balance {} + delta {} overflows",
                    current.token_balance, change.delta
                ))
            })?;
            if new_balance < 0 {
                return Err(StoreError::InvalidDelta(format!(
                    "balance {} + delta {} would go negative",
                    current.token_balance, change.delta
                )));
            }
            if new_balance > max_tokens {
                return Err(StoreError::QuotaExceeded {
                    balance: current.token_balance,
                    delta: change.delta,
                    max_tokens,
                });
            }

            let subscription = change.set_subscription.unwrap_or(current.subscription);

            tx.execute(
                "UPDATE companies
                 SET token_balance = ?1, max_tokens = ?2, subscription = ?3,
                     version = version + 1, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    new_balance,
                    max_tokens,
                    subscription.to_string(),
                    now,
                    company_id.as_str(),
                ],
            )?;

            tx.execute(
                "INSERT INTO transactions (id, company_id, idempotency_key, delta,
                                           resulting_balance, initiator, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    txn_id.as_str(),
                    company_id.as_str(),
                    idempotency_key,
                    change.delta,
                    new_balance,
                    initiator,
                    now,
                ],
            )?;

            tx.commit()?;

            current.token_balance = new_balance;
            current.max_tokens = max_tokens;
            current.subscription = subscription;
            current.version = expected_version + 1;
            current.updated_at = now.clone();

            Ok((
                current,
                TransactionRow {
                    id: txn_id.clone(),
                    company_id: company_id.clone(),
                    idempotency_key: idempotency_key.to_string(),
                    delta: change.delta,
                    resulting_balance: new_balance,
                    initiator: initiator.to_string(),
                    created_at: now.clone(),
                },
            ))
        })
    }

    /// Look up a previously applied transaction by idempotency key.
    #[instrument(skip(self), fields(company_id = %company_id))]
    pub fn find_by_key(
        &self,
        company_id: &CompanyId,
        idempotency_key: &str,
    ) -> Result<Option<TransactionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, company_id, idempotency_key, delta, resulting_balance,
                        initiator, created_at
                 FROM transactions WHERE company_id = ?1 AND idempotency_key = ?2",
            )?;
            let mut rows = stmt.query([company_id.as_str(), idempotency_key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_transaction(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List a company's ledger entries in causal (insertion) order.
    #[instrument(skip(self), fields(company_id = %company_id))]
    pub fn list(&self, company_id: &CompanyId) -> Result<Vec<TransactionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, company_id, idempotency_key, delta, resulting_balance,
                        initiator, created_at
                 FROM transactions WHERE company_id = ?1 ORDER BY rowid ASC",
            )?;
            let mut rows = stmt.query([company_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_transaction(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> Result<TransactionRow, StoreError> {
    Ok(TransactionRow {
        id: TransactionId::from_raw(row_helpers::get::<String>(row, 0, "transactions", "id")?),
        company_id: CompanyId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "transactions",
            "company_id",
        )?),
        idempotency_key: row_helpers::get(row, 2, "transactions", "idempotency_key")?,
        delta: row_helpers::get(row, 3, "transactions", "delta")?,
        resulting_balance: row_helpers::get(row, 4, "transactions", "resulting_balance")?,
        initiator: row_helpers::get(row, 5, "transactions", "initiator")?,
        created_at: row_helpers::get(row, 6, "transactions", "created_at")?,
    })
}
