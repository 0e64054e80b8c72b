//! Persistence Layer
//!
//! SQLite storage for the position ledger, via sqlx.
//!
//! # Database Schema
//!
//! ## positions
//! The open set. A row exists exactly while the position is open; closing
//! deletes it in the same transaction that writes the final history row.
//! Prices and quantities are canonical decimal strings, partial levels JSON.
//!
//! ## closed_trades
//! Immutable history, one row per closing event (partial exits included).
//! `(symbol, entry_price, opened_at_ms, close_reason)` is unique, which backs
//! the ledger's idempotency check.
//!
//! ## reconciliation_audit
//! One row per reconciliation pass.

pub mod models;
pub mod reconciliation_audit;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradekeeper.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradekeeper.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// In-memory database, mostly for tests
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            log_queries: false,
        }
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let url = std::env::var("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Initialize the database connection pool and run migrations
///
/// # Errors
/// Returns error if the connection or a migration fails
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    // Ensure data directory exists
    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !config.log_queries {
        options = options.disable_statement_logging();
    }

    // An in-memory database lives and dies with its single connection
    let pool = if config.is_in_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?
    };

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            status TEXT NOT NULL CHECK(status IN ('ACTIVE', 'SIMULATED')),
            entry_price TEXT NOT NULL,
            original_size TEXT NOT NULL,
            remaining_size TEXT NOT NULL,
            qty_step TEXT NOT NULL,
            leverage INTEGER NOT NULL,
            margin TEXT NOT NULL,
            risk_amount TEXT NOT NULL,
            stop_loss TEXT NOT NULL,
            take_profit TEXT,
            watermark TEXT NOT NULL,
            trailing_distance TEXT,
            partial_levels TEXT NOT NULL DEFAULT '[]',
            sl_order_id TEXT,
            tp_order_id TEXT,
            entry_order_id TEXT,
            opened_at_ms INTEGER NOT NULL,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS closed_trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            status TEXT NOT NULL CHECK(status IN ('ACTIVE', 'SIMULATED')),
            entry_price TEXT NOT NULL,
            close_price TEXT NOT NULL,
            quantity TEXT NOT NULL,
            original_size TEXT NOT NULL,
            leverage INTEGER NOT NULL,
            margin TEXT NOT NULL,
            risk_amount TEXT NOT NULL,
            stop_loss TEXT NOT NULL,
            take_profit TEXT,
            close_reason TEXT NOT NULL CHECK(close_reason IN (
                'STOP_LOSS', 'TAKE_PROFIT', 'PARTIAL_TP_1', 'PARTIAL_TP_2',
                'EXTERNAL_CLOSE', 'MANUAL'
            )),
            pnl_amount TEXT NOT NULL,
            pnl_percent TEXT NOT NULL,
            degraded INTEGER NOT NULL DEFAULT 0,
            opened_at_ms INTEGER NOT NULL,
            closed_at DATETIME NOT NULL,
            UNIQUE(symbol, entry_price, opened_at_ms, close_reason)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_at DATETIME NOT NULL,
            exchange TEXT NOT NULL,
            exchange_positions INTEGER NOT NULL,
            checked INTEGER NOT NULL,
            ghosts_closed INTEGER NOT NULL,
            ghosts_in_grace INTEGER NOT NULL,
            degraded_closes INTEGER NOT NULL,
            failures INTEGER NOT NULL,
            details TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_closed_trades_position ON closed_trades(position_id)",
        "CREATE INDEX IF NOT EXISTS idx_closed_trades_closed_at ON closed_trades(closed_at)",
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_run_at ON reconciliation_audit(run_at)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(e.to_string()))?;
    }

    info!("✓ Migrations completed");
    Ok(())
}
