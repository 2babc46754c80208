use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use turnstile_core::ids::CompanyId;
use turnstile_core::SubscriptionState;
use turnstile_store::{ChangeSet, CompanyRepo, CompanyRow, StoreError, TransactionRepo};
use turnstile_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::gate::GateService;

/// How many times a commit is re-attempted with a fresh version before a
/// Conflict is surfaced to the caller.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Outcome of a recharge, echoed to the operator console.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargeResult {
    pub tokens: i64,
    pub max_tokens: i64,
    pub subscription: SubscriptionState,
}

/// The only writer of company state. Serializes mutations per company,
/// applies transactions exactly once per idempotency key, and invalidates
/// the gate cache before a call returns.
pub struct RechargeCoordinator {
    companies: CompanyRepo,
    transactions: TransactionRepo,
    gate: Arc<GateService>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RechargeCoordinator {
    pub fn new(
        companies: CompanyRepo,
        transactions: TransactionRepo,
        gate: Arc<GateService>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            companies,
            transactions,
            gate,
            locks: DashMap::new(),
            metrics,
        }
    }

    /// Credit `amount` tokens to a company.
    ///
    /// Retrying with the same idempotency key never double-applies: the
    /// replay returns the balance the original call produced. A 0→positive
    /// balance transition reinstates the subscription only when
    /// `reactivate` is requested; a plain top-up leaves a suspended
    /// subscription suspended.
    #[instrument(skip(self), fields(company_id = %company_id, amount))]
    pub async fn recharge(
        &self,
        company_id: &CompanyId,
        amount: i64,
        idempotency_key: &str,
        reactivate: bool,
        initiator: &str,
    ) -> Result<RechargeResult, EngineError> {
        if amount <= 0 {
            return Err(EngineError::Validation(format!(
                "amount must be a positive integer, got {amount}"
            )));
        }
        validate_key(idempotency_key)?;

        let lock = self.lock_for(company_id);
        let _guard = lock.lock().await;

        if let Some(prior) = self.transactions.find_by_key(company_id, idempotency_key)? {
            let current = self.companies.get(company_id)?;
            if let Some(m) = &self.metrics {
                m.counter_inc("recharge.replayed", &[], 1);
            }
            return Ok(RechargeResult {
                tokens: prior.resulting_balance,
                max_tokens: current.max_tokens,
                subscription: current.subscription,
            });
        }

        let snapshot = self
            .commit(company_id, idempotency_key, initiator, |current| ChangeSet {
                delta: amount,
                set_subscription: (reactivate && current.token_balance == 0)
                    .then_some(SubscriptionState::Active),
                set_max_tokens: None,
            })
            .await?;

        if let Some(m) = &self.metrics {
            m.counter_inc("recharge.total", &[], 1);
        }
        info!(company_id = %company_id, balance = snapshot.token_balance, "recharge applied");

        Ok(RechargeResult {
            tokens: snapshot.token_balance,
            max_tokens: snapshot.max_tokens,
            subscription: snapshot.subscription,
        })
    }

    /// Administrative subscription change (suspend or reinstate),
    /// recorded as a zero-delta transaction.
    #[instrument(skip(self), fields(company_id = %company_id, state = %state))]
    pub async fn set_subscription(
        &self,
        company_id: &CompanyId,
        state: SubscriptionState,
        idempotency_key: &str,
        initiator: &str,
    ) -> Result<CompanyRow, EngineError> {
        validate_key(idempotency_key)?;
        let lock = self.lock_for(company_id);
        let _guard = lock.lock().await;

        if self
            .transactions
            .find_by_key(company_id, idempotency_key)?
            .is_some()
        {
            return Ok(self.companies.get(company_id)?);
        }

        self.commit(company_id, idempotency_key, initiator, |_| ChangeSet {
            delta: 0,
            set_subscription: Some(state),
            set_max_tokens: None,
        })
        .await
    }

    /// Administrative cap change. Raising the cap is the prescribed
    /// remedy for QuotaExceeded recharges.
    #[instrument(skip(self), fields(company_id = %company_id, max_tokens))]
    pub async fn set_max_tokens(
        &self,
        company_id: &CompanyId,
        max_tokens: i64,
        idempotency_key: &str,
        initiator: &str,
    ) -> Result<CompanyRow, EngineError> {
        validate_key(idempotency_key)?;
        let lock = self.lock_for(company_id);
        let _guard = lock.lock().await;

        if self
            .transactions
            .find_by_key(company_id, idempotency_key)?
            .is_some()
        {
            return Ok(self.companies.get(company_id)?);
        }

        self.commit(company_id, idempotency_key, initiator, |_| ChangeSet {
            delta: 0,
            set_subscription: None,
            set_max_tokens: Some(max_tokens),
        })
        .await
    }

    /// Commit a change against the current version, retrying Conflicts
    /// with a fresh snapshot. Invalidates the gate cache after the store
    /// transaction commits so the operator's next gate query observes it.
    async fn commit(
        &self,
        company_id: &CompanyId,
        idempotency_key: &str,
        initiator: &str,
        make_change: impl Fn(&CompanyRow) -> ChangeSet,
    ) -> Result<CompanyRow, EngineError> {
        let mut attempt = 0;
        loop {
            let current = self.companies.get(company_id)?;
            let change = make_change(&current);

            match self.transactions.apply(
                company_id,
                &change,
                idempotency_key,
                current.version,
                initiator,
            ) {
                Ok((snapshot, _)) => {
                    self.gate.invalidate(company_id);
                    return Ok(snapshot);
                }
                Err(StoreError::Conflict { .. }) if attempt + 1 < MAX_COMMIT_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_for(&self, company_id: &CompanyId) -> Arc<Mutex<()>> {
        self.locks
            .entry(company_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_key(idempotency_key: &str) -> Result<(), EngineError> {
    if idempotency_key.trim().is_empty() {
        return Err(EngineError::Validation(
            "idempotency key must not be empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateConfig;
    use turnstile_store::Database;

    struct Fixture {
        coordinator: Arc<RechargeCoordinator>,
        gate: Arc<GateService>,
        companies: CompanyRepo,
        transactions: TransactionRepo,
        company: CompanyRow,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let companies = CompanyRepo::new(db.clone());
        let transactions = TransactionRepo::new(db);
        let gate = Arc::new(GateService::new(
            Arc::new(companies.clone()),
            GateConfig::default(),
            None,
        ));
        let company = companies.create("Acme", "ops@acme.io", "starter", 1000).unwrap();
        let coordinator = Arc::new(RechargeCoordinator::new(
            companies.clone(),
            transactions.clone(),
            gate.clone(),
            None,
        ));
        Fixture {
            coordinator,
            gate,
            companies,
            transactions,
            company,
        }
    }

    #[tokio::test]
    async fn recharge_credits_tokens() {
        let Fixture { coordinator, companies, company, .. } = setup();
        let result = coordinator
            .recharge(&company.id, 50, "k1", false, "op_alice")
            .await
            .unwrap();

        assert_eq!(result.tokens, 50);
        assert_eq!(result.max_tokens, 1000);
        assert_eq!(result.subscription, SubscriptionState::Inactive);
        assert_eq!(companies.get(&company.id).unwrap().token_balance, 50);
    }

    #[tokio::test]
    async fn non_positive_amount_rejected() {
        let Fixture { coordinator, company, .. } = setup();
        for amount in [0, -50] {
            let err = coordinator
                .recharge(&company.id, amount, "k1", false, "op_alice")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn empty_idempotency_key_rejected() {
        let Fixture { coordinator, company, .. } = setup();
        let err = coordinator
            .recharge(&company.id, 50, "  ", false, "op_alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_company_not_found() {
        let Fixture { coordinator, .. } = setup();
        let err = coordinator
            .recharge(&CompanyId::from_raw("co_ghost"), 50, "k1", false, "op_alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn repeated_key_applies_exactly_once() {
        let Fixture { coordinator, companies, company, .. } = setup();
        let first = coordinator
            .recharge(&company.id, 50, "k1", false, "op_alice")
            .await
            .unwrap();
        let second = coordinator
            .recharge(&company.id, 50, "k1", false, "op_alice")
            .await
            .unwrap();

        assert_eq!(first.tokens, 50);
        assert_eq!(second.tokens, 50);
        assert_eq!(companies.get(&company.id).unwrap().token_balance, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recharges_lose_no_update() {
        let Fixture { coordinator, companies, company, transactions, .. } = setup();

        let a = {
            let coordinator = coordinator.clone();
            let id = company.id.clone();
            tokio::spawn(async move { coordinator.recharge(&id, 50, "kA", false, "op_a").await })
        };
        let b = {
            let coordinator = coordinator.clone();
            let id = company.id.clone();
            tokio::spawn(async move { coordinator.recharge(&id, 100, "kB", false, "op_b").await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let fetched = companies.get(&company.id).unwrap();
        assert_eq!(fetched.token_balance, 150);
        assert_eq!(fetched.version, 2);
        assert_eq!(transactions.list(&company.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn over_cap_fails_and_leaves_balance() {
        let Fixture { coordinator, companies, company, .. } = setup();
        coordinator
            .set_max_tokens(&company.id, 100, "cap-1", "op_alice")
            .await
            .unwrap();
        coordinator
            .recharge(&company.id, 80, "k1", false, "op_alice")
            .await
            .unwrap();

        let err = coordinator
            .recharge(&company.id, 50, "k2", false, "op_alice")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::QuotaExceeded { balance: 80, delta: 50, max_tokens: 100 }
        ));
        assert_eq!(companies.get(&company.id).unwrap().token_balance, 80);
    }

    #[tokio::test]
    async fn plain_topup_does_not_reinstate_subscription() {
        let Fixture { coordinator, company, .. } = setup();
        let result = coordinator
            .recharge(&company.id, 50, "k1", false, "op_alice")
            .await
            .unwrap();
        assert_eq!(result.subscription, SubscriptionState::Inactive);
    }

    #[tokio::test]
    async fn reactivating_recharge_flips_subscription_atomically() {
        let Fixture { coordinator, companies, company, .. } = setup();
        let result = coordinator
            .recharge(&company.id, 50, "k1", true, "op_alice")
            .await
            .unwrap();
        assert_eq!(result.subscription, SubscriptionState::Active);

        let fetched = companies.get(&company.id).unwrap();
        assert_eq!(fetched.subscription, SubscriptionState::Active);
        // One transaction carried both the credit and the reinstatement.
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn reactivate_flag_only_applies_on_zero_transition() {
        let Fixture { coordinator, companies, company, .. } = setup();
        coordinator
            .recharge(&company.id, 50, "k1", false, "op_alice")
            .await
            .unwrap();
        coordinator
            .recharge(&company.id, 50, "k2", true, "op_alice")
            .await
            .unwrap();

        // Balance was already positive, so the flag is a no-op.
        let fetched = companies.get(&company.id).unwrap();
        assert_eq!(fetched.subscription, SubscriptionState::Inactive);
    }

    #[tokio::test]
    async fn read_your_writes_through_the_gate() {
        let Fixture { coordinator, gate, company, .. } = setup();

        // Widget polls before the operator acts: denied, and cached.
        assert!(!gate.check(&company.id).active);

        coordinator
            .recharge(&company.id, 50, "k1", true, "op_alice")
            .await
            .unwrap();

        // Invalidation happened before recharge returned.
        let status = gate.check(&company.id);
        assert!(status.active);
        assert_eq!(status.tokens, 50);
    }

    #[tokio::test]
    async fn suspend_denies_gate_and_is_logged() {
        let Fixture { coordinator, gate, transactions, company, .. } = setup();
        coordinator
            .recharge(&company.id, 50, "k1", true, "op_alice")
            .await
            .unwrap();
        assert!(gate.check(&company.id).active);

        coordinator
            .set_subscription(&company.id, SubscriptionState::Inactive, "suspend-1", "op_admin")
            .await
            .unwrap();
        assert!(!gate.check(&company.id).active);

        let log = transactions.list(&company.id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].delta, 0);
    }
}
