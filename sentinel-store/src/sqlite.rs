use crate::{
    CacheStats, Store,
    cash::{CashFlowKind, CashFlowRecord, DividendRow},
    error::StoreError,
    job::{
        JobHistoryRecord, JobRunState, JobSchedule, JobScheduleUpdate, JobStatus, MarketTiming,
    },
    position::{Position, PositionUpdate},
    schema,
    score::ScoreRow,
    security::Security,
    snapshot::SnapshotRow,
    target::{AllocationTarget, TargetKind},
    trade::TradeRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sentinel_instrument::{Ccy, Side, Symbol, market::PriceBar};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use std::{collections::HashMap, path::Path, str::FromStr};
use tracing::info;

/// Live SQLite store. WAL journaling so long reads do not block short writes;
/// every write commits individually.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `path` and apply the schema.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        Self::connect_with(path, 5).await
    }

    /// Open with an explicit connection cap. The simulation store uses a single
    /// connection so its deferred-write transactions span every statement.
    pub async fn connect_with(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(schema::SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        for table in schema::DROPPED_DERIVED_TABLES {
            sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }

        info!("store schema applied");
        Ok(())
    }

    /// Raw statement passthrough, used by the simulation store for transaction control.
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn ts(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn map_security(row: &SqliteRow) -> Result<Security, StoreError> {
    Ok(Security {
        symbol: Symbol::new(row.try_get::<String, _>("symbol")?),
        name: row.try_get("name")?,
        currency: Ccy::new(row.try_get::<String, _>("currency")?),
        geography: row.try_get("geography")?,
        industry: row.try_get("industry")?,
        market_id: row.try_get("market_id")?,
        min_lot: row.try_get::<i64, _>("min_lot")?.max(1) as u32,
        active: row.try_get::<i64, _>("active")? != 0,
        allow_buy: row.try_get::<i64, _>("allow_buy")? != 0,
        allow_sell: row.try_get::<i64, _>("allow_sell")? != 0,
        user_multiplier: row.try_get("user_multiplier")?,
        first_bought_at: row
            .try_get::<Option<i64>, _>("first_bought_at")?
            .map(from_ts),
        last_sold_at: row.try_get::<Option<i64>, _>("last_sold_at")?.map(from_ts),
    })
}

fn map_position(row: &SqliteRow) -> Result<Position, StoreError> {
    Ok(Position {
        symbol: Symbol::new(row.try_get::<String, _>("symbol")?),
        quantity: row.try_get("quantity")?,
        avg_cost: row.try_get("avg_cost")?,
        current_price: row.try_get("current_price")?,
        currency: Ccy::new(row.try_get::<String, _>("currency")?),
        updated_at: row.try_get::<Option<i64>, _>("updated_at")?.map(from_ts),
    })
}

fn map_price(row: &SqliteRow) -> Result<PriceBar, StoreError> {
    let close: f64 = row.try_get("close")?;
    Ok(PriceBar {
        date: row.try_get("date")?,
        open: row.try_get::<Option<f64>, _>("open")?.unwrap_or(close),
        high: row.try_get::<Option<f64>, _>("high")?.unwrap_or(close),
        low: row.try_get::<Option<f64>, _>("low")?.unwrap_or(close),
        close,
        volume: row.try_get::<Option<f64>, _>("volume")?.unwrap_or(0.0),
    })
}

fn map_trade(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
    let side_raw: String = row.try_get("side")?;
    let side = match side_raw.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => return Err(StoreError::invalid_row("trades", format!("side {other}"))),
    };
    let raw: Option<String> = row.try_get("raw_data")?;
    Ok(TradeRecord {
        broker_trade_id: row.try_get("broker_trade_id")?,
        symbol: Symbol::new(row.try_get::<String, _>("symbol")?),
        side,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        commission: row.try_get("commission")?,
        commission_currency: Ccy::new(row.try_get::<String, _>("commission_currency")?),
        executed_at: from_ts(row.try_get("executed_at")?),
        raw: raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
    })
}

fn map_cash_flow(row: &SqliteRow) -> Result<CashFlowRecord, StoreError> {
    let kind_raw: String = row.try_get("type_id")?;
    let kind = CashFlowKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::invalid_row("cash_flows", format!("type {kind_raw}")))?;
    let raw: Option<String> = row.try_get("raw_data")?;
    Ok(CashFlowRecord {
        content_hash: row.try_get("content_hash")?,
        date: row.try_get("date")?,
        kind,
        amount: row.try_get("amount")?,
        currency: Ccy::new(row.try_get::<String, _>("currency")?),
        comment: row.try_get("comment")?,
        raw: raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or(serde_json::Value::Null),
    })
}

fn map_schedule(row: &SqliteRow) -> Result<JobSchedule, StoreError> {
    let timing_raw: i64 = row.try_get("market_timing")?;
    Ok(JobSchedule {
        job_type: row.try_get("job_type")?,
        interval_minutes: row.try_get::<i64, _>("interval_minutes")?.max(0) as u32,
        interval_market_open_minutes: row
            .try_get::<Option<i64>, _>("interval_market_open_minutes")?
            .map(|m| m.max(0) as u32),
        market_timing: MarketTiming::from_i64(timing_raw).ok_or_else(|| {
            StoreError::invalid_row("job_schedules", format!("market_timing {timing_raw}"))
        })?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
    })
}

fn map_history(row: &SqliteRow) -> Result<JobHistoryRecord, StoreError> {
    let status_raw: String = row.try_get("status")?;
    Ok(JobHistoryRecord {
        job_id: row.try_get("job_id")?,
        job_type: row.try_get("job_type")?,
        status: JobStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::invalid_row("job_history", format!("status {status_raw}"))
        })?,
        error: row.try_get("error")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
        executed_at: from_ts(row.try_get("executed_at")?),
        retry_count: row.try_get::<i64, _>("retry_count")?.max(0) as u32,
    })
}

fn map_snapshot(row: &SqliteRow) -> Result<SnapshotRow, StoreError> {
    let positions_raw: Option<String> = row.try_get("positions")?;
    Ok(SnapshotRow {
        date: row.try_get("date")?,
        total_value_eur: row.try_get("total_value_eur")?,
        positions_value_eur: row.try_get("positions_value_eur")?,
        cash_eur: row.try_get("cash_eur")?,
        net_deposits_eur: row.try_get("net_deposits_eur")?,
        unrealized_pnl_eur: row.try_get("unrealized_pnl_eur")?,
        positions: positions_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn security(&self, symbol: &Symbol) -> Result<Option<Security>, StoreError> {
        let row = sqlx::query("SELECT * FROM securities WHERE symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_security).transpose()
    }

    async fn securities(&self, active_only: bool) -> Result<Vec<Security>, StoreError> {
        let query = if active_only {
            "SELECT * FROM securities WHERE active = 1 ORDER BY symbol"
        } else {
            "SELECT * FROM securities ORDER BY symbol"
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter().map(map_security).collect()
    }

    async fn upsert_security(&self, security: &Security) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO securities
               (symbol, name, currency, geography, industry, market_id, min_lot,
                active, allow_buy, allow_sell, user_multiplier, first_bought_at, last_sold_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(symbol) DO UPDATE SET
                 name = excluded.name,
                 currency = excluded.currency,
                 geography = COALESCE(excluded.geography, securities.geography),
                 industry = COALESCE(excluded.industry, securities.industry),
                 market_id = COALESCE(excluded.market_id, securities.market_id),
                 min_lot = excluded.min_lot,
                 active = excluded.active,
                 allow_buy = excluded.allow_buy,
                 allow_sell = excluded.allow_sell,
                 user_multiplier = excluded.user_multiplier,
                 first_bought_at = COALESCE(excluded.first_bought_at, securities.first_bought_at),
                 last_sold_at = COALESCE(excluded.last_sold_at, securities.last_sold_at)"#,
        )
        .bind(security.symbol.as_str())
        .bind(&security.name)
        .bind(security.currency.as_str())
        .bind(&security.geography)
        .bind(&security.industry)
        .bind(&security.market_id)
        .bind(security.min_lot as i64)
        .bind(security.active as i64)
        .bind(security.allow_buy as i64)
        .bind(security.allow_sell as i64)
        .bind(security.user_multiplier)
        .bind(security.first_bought_at.map(ts))
        .bind(security.last_sold_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn position(&self, symbol: &Symbol) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT * FROM positions WHERE symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_position).transpose()
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query("SELECT * FROM positions WHERE quantity > 0 ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_position).collect()
    }

    async fn upsert_position(&self, update: &PositionUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO positions (symbol, quantity, avg_cost, current_price, currency, updated_at)
               VALUES (?, COALESCE(?, 0), ?, ?, COALESCE(?, 'EUR'), ?)
               ON CONFLICT(symbol) DO UPDATE SET
                 quantity = COALESCE(excluded.quantity, positions.quantity),
                 avg_cost = COALESCE(excluded.avg_cost, positions.avg_cost),
                 current_price = COALESCE(excluded.current_price, positions.current_price),
                 currency = COALESCE(excluded.currency, positions.currency),
                 updated_at = excluded.updated_at"#,
        )
        .bind(update.symbol.as_str())
        .bind(update.quantity)
        .bind(update.avg_cost)
        .bind(update.current_price)
        .bind(update.currency.as_ref().map(Ccy::as_str))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prices(
        &self,
        symbol: &Symbol,
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<PriceBar>, StoreError> {
        let mut query = String::from("SELECT * FROM prices WHERE symbol = ?");
        if end_date.is_some() {
            query.push_str(" AND date <= ?");
        }
        query.push_str(" ORDER BY date DESC");
        if days.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&query).bind(symbol.as_str());
        if let Some(end) = end_date {
            q = q.bind(end);
        }
        if let Some(days) = days {
            q = q.bind(days as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(map_price).collect()
    }

    async fn prices_bulk(
        &self,
        symbols: &[Symbol],
        days: Option<u32>,
        end_date: Option<NaiveDate>,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, StoreError> {
        let mut out = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let bars = self.prices(symbol, days, end_date).await?;
            out.insert(symbol.clone(), bars);
        }
        Ok(out)
    }

    async fn save_prices(&self, symbol: &Symbol, bars: &[PriceBar]) -> Result<(), StoreError> {
        for bar in bars {
            sqlx::query(
                r#"INSERT INTO prices (symbol, date, open, high, low, close, volume)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(symbol, date) DO UPDATE SET
                     open = excluded.open,
                     high = excluded.high,
                     low = excluded.low,
                     close = excluded.close,
                     volume = excluded.volume"#,
            )
            .bind(symbol.as_str())
            .bind(bar.date)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn record_trade(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO trades
               (broker_trade_id, symbol, side, quantity, price, commission,
                commission_currency, executed_at, raw_data)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&trade.broker_trade_id)
        .bind(trade.symbol.as_str())
        .bind(trade.side.to_string())
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.commission)
        .bind(trade.commission_currency.as_str())
        .bind(ts(trade.executed_at))
        .bind(serde_json::to_string(&trade.raw)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn trades(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<u32>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let mut query = String::from("SELECT * FROM trades");
        if symbol.is_some() {
            query.push_str(" WHERE symbol = ?");
        }
        query.push_str(" ORDER BY executed_at DESC");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&query);
        if let Some(symbol) = symbol {
            q = q.bind(symbol.as_str());
        }
        if let Some(limit) = limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(map_trade).collect()
    }

    async fn trades_chronological(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY executed_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_trade).collect()
    }

    async fn trades_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }

    async fn cash_balances(&self) -> Result<HashMap<Ccy, f64>, StoreError> {
        let rows = sqlx::query("SELECT currency, amount FROM cash_balances")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    Ccy::new(row.try_get::<String, _>("currency")?),
                    row.try_get::<f64, _>("amount")?,
                ))
            })
            .collect()
    }

    async fn set_cash_balance(&self, currency: &Ccy, amount: f64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cash_balances (currency, amount, updated_at) VALUES (?, ?, ?)",
        )
        .bind(currency.as_str())
        .bind(amount)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_cash_balances(
        &self,
        balances: &HashMap<Ccy, f64>,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cash_balances")
            .execute(&self.pool)
            .await?;
        for (currency, amount) in balances {
            self.set_cash_balance(currency, *amount).await?;
        }
        Ok(())
    }

    async fn record_cash_flow(&self, flow: &CashFlowRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO cash_flows
               (content_hash, date, type_id, amount, currency, comment, raw_data)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&flow.content_hash)
        .bind(flow.date)
        .bind(flow.kind.as_str())
        .bind(flow.amount)
        .bind(flow.currency.as_str())
        .bind(&flow.comment)
        .bind(serde_json::to_string(&flow.raw)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cash_flows(
        &self,
        kind: Option<CashFlowKind>,
        limit: Option<u32>,
    ) -> Result<Vec<CashFlowRecord>, StoreError> {
        let mut query = String::from("SELECT * FROM cash_flows");
        if kind.is_some() {
            query.push_str(" WHERE type_id = ?");
        }
        query.push_str(" ORDER BY date DESC, id DESC");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&query);
        if let Some(kind) = kind {
            q = q.bind(kind.as_str());
        }
        if let Some(limit) = limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(map_cash_flow).collect()
    }

    async fn upsert_dividend(&self, dividend: &DividendRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO dividends (symbol, date, amount_eur, reinvested_eur)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(symbol, date) DO UPDATE SET
                 amount_eur = excluded.amount_eur"#,
        )
        .bind(dividend.symbol.as_str())
        .bind(dividend.date)
        .bind(dividend.amount_eur)
        .bind(dividend.reinvested_eur)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn uninvested_dividends(&self) -> Result<HashMap<Symbol, f64>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT symbol, SUM(MAX(amount_eur - reinvested_eur, 0)) AS pool
               FROM dividends GROUP BY symbol HAVING pool > 0"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    Symbol::new(row.try_get::<String, _>("symbol")?),
                    row.try_get::<f64, _>("pool")?,
                ))
            })
            .collect()
    }

    async fn mark_dividends_reinvested(
        &self,
        symbol: &Symbol,
        amount_eur: f64,
    ) -> Result<(), StoreError> {
        let rows = sqlx::query(
            r#"SELECT date, amount_eur, reinvested_eur FROM dividends
               WHERE symbol = ? AND amount_eur > reinvested_eur ORDER BY date ASC"#,
        )
        .bind(symbol.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut remaining = amount_eur;
        for row in rows {
            if remaining <= 0.0 {
                break;
            }
            let date: NaiveDate = row.try_get("date")?;
            let available =
                row.try_get::<f64, _>("amount_eur")? - row.try_get::<f64, _>("reinvested_eur")?;
            let consumed = available.min(remaining);
            sqlx::query(
                "UPDATE dividends SET reinvested_eur = reinvested_eur + ? WHERE symbol = ? AND date = ?",
            )
            .bind(consumed)
            .bind(symbol.as_str())
            .bind(date)
            .execute(&self.pool)
            .await?;
            remaining -= consumed;
        }
        Ok(())
    }

    async fn allocation_targets(&self) -> Result<Vec<AllocationTarget>, StoreError> {
        let rows = sqlx::query("SELECT type, name, weight FROM allocation_targets")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let kind_raw: String = row.try_get("type")?;
                Ok(AllocationTarget {
                    kind: TargetKind::parse(&kind_raw).ok_or_else(|| {
                        StoreError::invalid_row("allocation_targets", format!("type {kind_raw}"))
                    })?,
                    name: row.try_get("name")?,
                    weight: row.try_get("weight")?,
                })
            })
            .collect()
    }

    async fn upsert_allocation_target(
        &self,
        target: &AllocationTarget,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO allocation_targets (type, name, weight) VALUES (?, ?, ?)",
        )
        .bind(target.kind.as_str())
        .bind(&target.name)
        .bind(target.weight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_score(&self, score: &ScoreRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scores (symbol, score, components, calculated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(score.symbol.as_str())
        .bind(score.score)
        .bind(serde_json::to_string(&score.components)?)
        .bind(ts(score.calculated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_scores(
        &self,
        symbols: &[Symbol],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<Symbol, f64>, StoreError> {
        let cutoff = as_of.map(ts).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"SELECT s.symbol AS symbol, s.score AS score
               FROM scores s
               JOIN (
                   SELECT symbol, MAX(calculated_at) AS latest
                   FROM scores WHERE calculated_at <= ?
                   GROUP BY symbol
               ) m ON s.symbol = m.symbol AND s.calculated_at = m.latest"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut all: HashMap<Symbol, f64> = HashMap::with_capacity(rows.len());
        for row in &rows {
            all.insert(
                Symbol::new(row.try_get::<String, _>("symbol")?),
                row.try_get("score")?,
            );
        }

        Ok(symbols
            .iter()
            .filter_map(|symbol| all.get(symbol).map(|score| (symbol.clone(), *score)))
            .collect())
    }

    async fn upsert_snapshot(&self, snapshot: &SnapshotRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO portfolio_snapshots
               (date, total_value_eur, positions_value_eur, cash_eur,
                net_deposits_eur, unrealized_pnl_eur, positions)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(snapshot.date)
        .bind(snapshot.total_value_eur)
        .bind(snapshot.positions_value_eur)
        .bind(snapshot.cash_eur)
        .bind(snapshot.net_deposits_eur)
        .bind(snapshot.unrealized_pnl_eur)
        .bind(serde_json::to_string(&snapshot.positions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<SnapshotRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM portfolio_snapshots ORDER BY date ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_snapshot).collect()
    }

    async fn fx_rate_for_date(
        &self,
        date: NaiveDate,
        currency: &Ccy,
    ) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            "SELECT rate_to_eur FROM fx_rates_history WHERE date = ? AND currency = ?",
        )
        .bind(date)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| Ok(row.try_get("rate_to_eur")?)).transpose()
    }

    async fn save_fx_rate(
        &self,
        date: NaiveDate,
        currency: &Ccy,
        rate_to_eur: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO fx_rates_history (date, currency, rate_to_eur) VALUES (?, ?, ?)",
        )
        .bind(date)
        .bind(currency.as_str())
        .bind(rate_to_eur)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value, expires_at FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: i64 = row.try_get("expires_at")?;
        if expires_at <= ts(Utc::now()) {
            sqlx::query("DELETE FROM cache WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    async fn cache_set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO cache (key, value, expires_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(ts(Utc::now()) + ttl_seconds)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cache_clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, SUM(expires_at <= ?) AS expired FROM cache",
        )
        .bind(ts(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            entries: row.try_get::<i64, _>("entries")?.max(0) as u64,
            expired: row
                .try_get::<Option<i64>, _>("expired")?
                .unwrap_or(0)
                .max(0) as u64,
        })
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(row.try_get("value")?)).transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job_schedules(&self) -> Result<Vec<JobSchedule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM job_schedules ORDER BY category, job_type")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    async fn job_schedule(&self, job_type: &str) -> Result<Option<JobSchedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM job_schedules WHERE job_type = ?")
            .bind(job_type)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule).transpose()
    }

    async fn upsert_job_schedule(&self, update: &JobScheduleUpdate) -> Result<(), StoreError> {
        let now = ts(Utc::now());
        sqlx::query(
            r#"INSERT INTO job_schedules
               (job_type, interval_minutes, interval_market_open_minutes, market_timing,
                description, category, enabled, created_at, updated_at)
               VALUES (?, COALESCE(?, 60), ?, COALESCE(?, 3), ?, COALESCE(?, 'sync'), COALESCE(?, 1), ?, ?)
               ON CONFLICT(job_type) DO UPDATE SET
                 interval_minutes = COALESCE(excluded.interval_minutes, job_schedules.interval_minutes),
                 interval_market_open_minutes = COALESCE(excluded.interval_market_open_minutes, job_schedules.interval_market_open_minutes),
                 market_timing = COALESCE(excluded.market_timing, job_schedules.market_timing),
                 description = COALESCE(excluded.description, job_schedules.description),
                 category = COALESCE(excluded.category, job_schedules.category),
                 enabled = COALESCE(excluded.enabled, job_schedules.enabled),
                 updated_at = excluded.updated_at"#,
        )
        .bind(&update.job_type)
        .bind(update.interval_minutes.map(|m| m as i64))
        .bind(update.interval_market_open_minutes.map(|m| m as i64))
        .bind(update.market_timing.map(|t| t.as_i64()))
        .bind(&update.description)
        .bind(&update.category)
        .bind(update.enabled.map(|e| e as i64))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_run_state(&self, job_id: &str) -> Result<JobRunState, StoreError> {
        let row = sqlx::query(
            "SELECT last_run, consecutive_failures FROM job_runs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(JobRunState::default());
        };
        let last_run: i64 = row.try_get("last_run")?;
        Ok(JobRunState {
            last_run: (last_run > 0).then(|| from_ts(last_run)),
            consecutive_failures: row.try_get::<i64, _>("consecutive_failures")?.max(0) as u32,
        })
    }

    async fn set_job_run_state(
        &self,
        job_id: &str,
        state: JobRunState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO job_runs (job_id, last_run, consecutive_failures) VALUES (?, ?, ?)",
        )
        .bind(job_id)
        .bind(state.last_run.map(ts).unwrap_or(0))
        .bind(state.consecutive_failures as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job_history(&self, record: &JobHistoryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO job_history
               (job_id, job_type, status, error, duration_ms, executed_at, retry_count)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.job_id)
        .bind(&record.job_type)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.duration_ms as i64)
        .bind(ts(record.executed_at))
        .bind(record.retry_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_history(
        &self,
        prefix: &str,
        limit: Option<u32>,
    ) -> Result<Vec<JobHistoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM job_history
               WHERE job_id = ? OR job_id LIKE ? || ':%'
               ORDER BY executed_at DESC LIMIT ?"#,
        )
        .bind(prefix)
        .bind(prefix)
        .bind(limit.unwrap_or(100) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_history).collect()
    }
}
