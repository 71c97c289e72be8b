//! Default compliance checklist seeding for new companies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::DatabaseError;

/// A per-company compliance check row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub company_id: i64,
    pub check_key: String,
    pub title: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A check every company starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplianceTemplate {
    pub key: &'static str,
    pub title: &'static str,
}

/// Status new checks are created with.
pub const INITIAL_STATUS: &str = "not_started";

/// Essential Eight baseline.
pub const DEFAULT_CHECKS: &[ComplianceTemplate] = &[
    ComplianceTemplate { key: "application_control", title: "Application control" },
    ComplianceTemplate { key: "patch_applications", title: "Patch applications" },
    ComplianceTemplate { key: "office_macros", title: "Configure Microsoft Office macro settings" },
    ComplianceTemplate { key: "user_application_hardening", title: "User application hardening" },
    ComplianceTemplate { key: "restrict_admin_privileges", title: "Restrict administrative privileges" },
    ComplianceTemplate { key: "patch_operating_systems", title: "Patch operating systems" },
    ComplianceTemplate { key: "multi_factor_authentication", title: "Multi-factor authentication" },
    ComplianceTemplate { key: "regular_backups", title: "Regular backups" },
];

/// Seed the default checklist for a company. Existing checks are left alone,
/// so repeated calls insert nothing.
pub async fn initialize_company_compliance(
    db: &dyn Database,
    company_id: i64,
    now: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    let inserted = db
        .insert_missing_compliance_checks(company_id, DEFAULT_CHECKS, now)
        .await?;
    tracing::info!(company_id, inserted, "Initialized company compliance checks");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    #[tokio::test]
    async fn test_initialization_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = initialize_company_compliance(&store, 7, now).await.unwrap();
        assert_eq!(first, DEFAULT_CHECKS.len() as u64);

        let second = initialize_company_compliance(&store, 7, now).await.unwrap();
        assert_eq!(second, 0);

        let checks = store.list_compliance_checks(7).await.unwrap();
        assert_eq!(checks.len(), DEFAULT_CHECKS.len());
        assert!(checks.iter().all(|c| c.status == INITIAL_STATUS));

        // Other companies are independent.
        assert_eq!(
            initialize_company_compliance(&store, 8, now).await.unwrap(),
            DEFAULT_CHECKS.len() as u64
        );
    }
}
