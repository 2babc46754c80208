use tracing::instrument;

use turnstile_core::derive;
use turnstile_store::{CompanyRepo, CompanyRow};

use crate::error::EngineError;

const DEFAULT_PER_PAGE: u32 = 50;
const MAX_PER_PAGE: u32 = 200;

/// One page of the operator console's company listing, with aggregate
/// counts over everything the filter matched.
#[derive(Clone, Debug)]
pub struct DirectoryPage {
    pub companies: Vec<CompanyRow>,
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Read-only listing/search/count surface for the operator console.
/// Never mutates the ledger; counts are recomputed from the canonical
/// derive formula at query time so they cannot drift from row statuses.
#[derive(Clone)]
pub struct Directory {
    companies: CompanyRepo,
}

impl Directory {
    pub fn new(companies: CompanyRepo) -> Self {
        Self { companies }
    }

    /// List companies matching an optional case-insensitive substring
    /// filter (name, email, or id). `page` is 1-based.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        filter: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> Result<DirectoryPage, EngineError> {
        let rows = self.companies.search(filter)?;

        let mut active = 0u64;
        for row in &rows {
            if derive(row.subscription, row.token_balance).is_active() {
                active += 1;
            }
        }
        let total = rows.len() as u64;
        let inactive = total - active;

        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE).max(1);
        let start = (page as usize - 1).saturating_mul(per_page as usize);
        let companies = rows
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();

        Ok(DirectoryPage {
            companies,
            total,
            active,
            inactive,
            page,
            per_page,
        })
    }

    pub fn default_per_page() -> u32 {
        DEFAULT_PER_PAGE
    }
}
