//! Idempotent SQLite DDL applied at startup.
//!
//! The migration story is additive-only: tables and indexes are created if missing
//! and user data is never dropped. Derived tables that were retired are listed in
//! [`DROPPED_DERIVED_TABLES`] and removed explicitly.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS securities (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    currency TEXT NOT NULL DEFAULT 'EUR',
    geography TEXT,
    industry TEXT,
    market_id TEXT,
    min_lot INTEGER NOT NULL DEFAULT 1,
    active INTEGER NOT NULL DEFAULT 1,
    allow_buy INTEGER NOT NULL DEFAULT 1,
    allow_sell INTEGER NOT NULL DEFAULT 1,
    user_multiplier REAL NOT NULL DEFAULT 1.0,
    first_bought_at INTEGER,
    last_sold_at INTEGER
);

CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    quantity REAL NOT NULL DEFAULT 0,
    avg_cost REAL,
    current_price REAL,
    currency TEXT NOT NULL DEFAULT 'EUR',
    updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS prices (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL NOT NULL,
    volume REAL,
    PRIMARY KEY (symbol, date)
);
CREATE INDEX IF NOT EXISTS idx_prices_symbol_date ON prices(symbol, date);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_trade_id TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL NOT NULL,
    commission REAL NOT NULL DEFAULT 0,
    commission_currency TEXT NOT NULL DEFAULT 'EUR',
    executed_at INTEGER NOT NULL,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_broker_id ON trades(broker_trade_id);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_trades_executed_at ON trades(executed_at);
CREATE INDEX IF NOT EXISTS idx_trades_side ON trades(side);

CREATE TABLE IF NOT EXISTS cash_balances (
    currency TEXT PRIMARY KEY,
    amount REAL NOT NULL,
    updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS cash_flows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    date TEXT NOT NULL,
    type_id TEXT NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    comment TEXT,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_cash_flows_date ON cash_flows(date);
CREATE INDEX IF NOT EXISTS idx_cash_flows_type ON cash_flows(type_id);

CREATE TABLE IF NOT EXISTS dividends (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    amount_eur REAL NOT NULL,
    reinvested_eur REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (symbol, date)
);
CREATE INDEX IF NOT EXISTS idx_dividends_symbol ON dividends(symbol);
CREATE INDEX IF NOT EXISTS idx_dividends_date ON dividends(date);

CREATE TABLE IF NOT EXISTS allocation_targets (
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (type, name)
);

CREATE TABLE IF NOT EXISTS scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    score REAL NOT NULL,
    components TEXT,
    calculated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scores_symbol_calculated_at ON scores(symbol, calculated_at);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    date TEXT PRIMARY KEY,
    total_value_eur REAL NOT NULL,
    positions_value_eur REAL NOT NULL,
    cash_eur REAL NOT NULL,
    net_deposits_eur REAL NOT NULL,
    unrealized_pnl_eur REAL NOT NULL,
    positions TEXT
);

CREATE TABLE IF NOT EXISTS fx_rates_history (
    date TEXT NOT NULL,
    currency TEXT NOT NULL,
    rate_to_eur REAL NOT NULL,
    PRIMARY KEY (date, currency)
);

CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);

CREATE TABLE IF NOT EXISTS job_schedules (
    job_type TEXT PRIMARY KEY,
    interval_minutes INTEGER NOT NULL,
    interval_market_open_minutes INTEGER,
    market_timing INTEGER NOT NULL DEFAULT 3,
    description TEXT,
    category TEXT NOT NULL DEFAULT 'sync',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER,
    updated_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_job_schedules_category ON job_schedules(category, job_type);

CREATE TABLE IF NOT EXISTS job_runs (
    job_id TEXT PRIMARY KEY,
    last_run INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS job_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    executed_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_job_history_job_id ON job_history(job_id, executed_at DESC);
CREATE INDEX IF NOT EXISTS idx_job_history_job_type ON job_history(job_type, status, executed_at DESC);
"#;

/// Derived tables from earlier revisions that are dropped on startup if present.
pub const DROPPED_DERIVED_TABLES: &[&str] = &["correlations", "ml_feature_cache"];

/// Reference tables copied into a backtest simulation store. Everything else starts
/// empty so no live state can leak into a simulation.
pub const SIMULATION_REFERENCE_TABLES: &[&str] =
    &["settings", "securities", "prices", "allocation_targets"];
