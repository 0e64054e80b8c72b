//! Reconciliation Audit Repository
//!
//! One row per reconciliation pass. The counters are columns for quick
//! queries; the full report is kept as JSON in `details`.

use super::models::ReconciliationAuditRecord;
use super::DbPool;
use crate::domain::services::portfolio_reconciliation::{
    ReconciliationAudit, ReconciliationError, ReconciliationReport,
};
use async_trait::async_trait;
use tracing::{debug, error};

/// SQLite implementation of the reconciliation audit trail
#[derive(Clone)]
pub struct SqliteReconciliationAudit {
    pool: DbPool,
}

impl SqliteReconciliationAudit {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recent report for an exchange
    pub async fn last_report(
        &self,
        exchange: &str,
    ) -> Result<Option<ReconciliationReport>, ReconciliationError> {
        let record = sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            WHERE exchange = ?1
            ORDER BY run_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(exchange)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get last reconciliation for {}: {}", exchange, e);
            ReconciliationError::Audit(format!("Database error: {}", e))
        })?;

        record.map(decode_report).transpose()
    }

    /// Newest first
    pub async fn history(
        &self,
        exchange: &str,
        limit: i64,
    ) -> Result<Vec<ReconciliationReport>, ReconciliationError> {
        let records = sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            WHERE exchange = ?1
            ORDER BY run_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(exchange)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get reconciliation history for {}: {}", exchange, e);
            ReconciliationError::Audit(format!("Database error: {}", e))
        })?;

        records.into_iter().map(decode_report).collect()
    }
}

fn decode_report(record: ReconciliationAuditRecord) -> Result<ReconciliationReport, ReconciliationError> {
    serde_json::from_str(&record.details).map_err(|e| {
        ReconciliationError::Audit(format!("Corrupt audit row {}: {}", record.id, e))
    })
}

#[async_trait]
impl ReconciliationAudit for SqliteReconciliationAudit {
    async fn save_report(&self, report: &ReconciliationReport) -> Result<(), ReconciliationError> {
        let details = serde_json::to_string(report)
            .map_err(|e| ReconciliationError::Audit(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (
                run_at, exchange, exchange_positions, checked, ghosts_closed,
                ghosts_in_grace, degraded_closes, failures, details
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(report.timestamp)
        .bind(&report.exchange)
        .bind(report.exchange_positions as i64)
        .bind(report.checked as i64)
        .bind(report.ghosts_closed.len() as i64)
        .bind(report.ghosts_in_grace.len() as i64)
        .bind(report.degraded_closes() as i64)
        .bind(report.failures.len() as i64)
        .bind(&details)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save reconciliation audit: {}", e);
            ReconciliationError::Audit(format!("Database error: {}", e))
        })?;

        debug!("Saved reconciliation audit for {}", report.exchange);
        Ok(())
    }
}
