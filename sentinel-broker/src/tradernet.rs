use crate::{
    Broker, TradingMode,
    error::BrokerError,
    types::{
        BrokerCashFlow, BrokerPortfolio, BrokerPosition, BrokerTrade, OrderId, Quote,
        SecurityInfo,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sentinel_instrument::{Ccy, Side, Symbol, market::PriceBar};
use serde_json::{Value, json};
use sha2::Sha256;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

const BASE_URL: &str = "https://tradernet.com/api/";
const QUOTE_CACHE_TTL: Duration = Duration::from_secs(300);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Live Tradernet client.
///
/// Public market-data commands go through the unauthenticated query endpoint; account
/// and order commands are signed with HMAC-SHA256 over the request document.
#[derive(Debug)]
pub struct Tradernet {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    mode: RwLock<TradingMode>,
    quote_cache: RwLock<HashMap<String, (Instant, HashMap<Symbol, Quote>)>>,
}

impl Tradernet {
    pub fn new(api_key: Option<String>, api_secret: Option<String>) -> Self {
        Self::with_base_url(BASE_URL, api_key, api_secret)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Self {
        let credentials = match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
                Some(Credentials {
                    api_key,
                    api_secret,
                })
            }
            _ => None,
        };

        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credentials,
            mode: RwLock::new(TradingMode::Research),
            quote_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn connected(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn set_mode(&self, mode: TradingMode) {
        *self.mode.write() = mode;
    }

    pub fn mode(&self) -> TradingMode {
        *self.mode.read()
    }

    async fn public_get(
        &self,
        cmd: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BrokerError> {
        let query = json!({ "cmd": cmd, "params": params }).to_string();
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("q", query.as_str())])
            .timeout(timeout)
            .send()
            .await?;
        let data: Value = response.json().await?;
        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(BrokerError::Api(error.to_string()));
        }
        Ok(data)
    }

    async fn signed_post(
        &self,
        cmd: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BrokerError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(BrokerError::NotConfigured)?;

        let body = json!({
            "cmd": cmd,
            "params": params,
            "nonce": Utc::now().timestamp_millis(),
        })
        .to_string();

        let mut mac = HmacSha256::new_from_slice(credentials.api_secret.as_bytes())
            .map_err(|e| BrokerError::Parse(e.to_string()))?;
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let response = self
            .http
            .post(&self.base_url)
            .header("X-NtApi-PubKey", &credentials.api_key)
            .header("X-NtApi-Sig", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await?;
        let data: Value = response.json().await?;
        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(BrokerError::Api(error.to_string()));
        }
        Ok(data)
    }

    fn quote_cache_key(symbols: &[Symbol]) -> String {
        let mut sorted: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();
        sorted.sort_unstable();
        sorted.join(",")
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Extract the quotes list from either response format the API uses.
fn parse_quotes_response(response: &Value) -> Vec<Value> {
    if let Some(quotes) = response.get("quotes").and_then(Value::as_array) {
        return quotes.clone();
    }
    response
        .pointer("/result/q")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn map_quote_fields(raw: &Value) -> Option<Quote> {
    let symbol = raw.get("c").and_then(Value::as_str)?;
    let price = raw.get("ltp").and_then(as_f64)?;
    Some(Quote {
        symbol: Symbol::new(symbol),
        price,
        bid: raw.get("bbp").and_then(as_f64),
        ask: raw.get("bap").and_then(as_f64),
        change: raw.get("chg").and_then(as_f64),
        change_pct: raw.get("pcp").and_then(as_f64),
    })
}

/// Parse the `getHloc` payload: per-symbol `hloc` candles of [high, low, open, close],
/// `xSeries` unix timestamps and optional `vl` volumes.
fn parse_hloc(data: &Value, symbols: &[Symbol]) -> HashMap<Symbol, Vec<PriceBar>> {
    let mut out = HashMap::new();
    let (Some(hloc), Some(x_series)) = (data.get("hloc"), data.get("xSeries")) else {
        return out;
    };

    for symbol in symbols {
        let (Some(candles), Some(timestamps)) = (
            hloc.get(symbol.as_str()).and_then(Value::as_array),
            x_series.get(symbol.as_str()).and_then(Value::as_array),
        ) else {
            continue;
        };
        let volumes = data
            .pointer(&format!("/vl/{}", symbol.as_str()))
            .and_then(Value::as_array);

        let mut bars = Vec::with_capacity(candles.len());
        for (index, (candle, ts)) in candles.iter().zip(timestamps).enumerate() {
            let (Some(candle), Some(ts)) = (candle.as_array(), ts.as_i64()) else {
                continue;
            };
            if candle.len() < 4 {
                continue;
            }
            let Some(date) = DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive()) else {
                continue;
            };
            let (Some(high), Some(low), Some(open), Some(close)) = (
                as_f64(&candle[0]),
                as_f64(&candle[1]),
                as_f64(&candle[2]),
                as_f64(&candle[3]),
            ) else {
                continue;
            };
            let volume = volumes
                .and_then(|v| v.get(index))
                .and_then(as_f64)
                .unwrap_or(0.0);
            bars.push(PriceBar {
                date,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        if !bars.is_empty() {
            out.insert(symbol.clone(), bars);
        }
    }
    out
}

fn parse_portfolio(response: &Value) -> BrokerPortfolio {
    let mut portfolio = BrokerPortfolio::default();

    if let Some(positions) = response.pointer("/result/ps/pos").and_then(Value::as_array) {
        for pos in positions {
            let Some(symbol) = pos.get("i").and_then(Value::as_str) else {
                continue;
            };
            portfolio.positions.push(BrokerPosition {
                symbol: Symbol::new(symbol),
                quantity: pos.get("q").and_then(as_f64).unwrap_or(0.0),
                avg_cost: pos.get("bal_price_a").and_then(as_f64),
                current_price: pos.get("mkt_price").and_then(as_f64),
                currency: pos
                    .get("curr")
                    .and_then(Value::as_str)
                    .map(Ccy::new)
                    .unwrap_or(Ccy::EUR),
                name: pos.get("name").and_then(Value::as_str).map(String::from),
            });
        }
    }

    if let Some(accounts) = response.pointer("/result/ps/acc").and_then(Value::as_array) {
        for acc in accounts {
            let currency = acc
                .get("curr")
                .and_then(Value::as_str)
                .map(Ccy::new)
                .unwrap_or(Ccy::EUR);
            let amount = acc.get("s").and_then(as_f64).unwrap_or(0.0);
            portfolio.cash.insert(currency, amount);
        }
    }

    portfolio
}

fn parse_trade_row(raw: &Value) -> Option<BrokerTrade> {
    let trade_id = match raw.get("trade_id").or_else(|| raw.get("id"))? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let symbol = raw.get("instr_nm").and_then(Value::as_str)?;
    let side_code: i64 = raw.get("type").and_then(as_f64)? as i64;
    let side = Side::from_broker_code(side_code)?;
    let executed_at = raw
        .get("date")
        .and_then(Value::as_str)
        .and_then(parse_broker_datetime)?;

    Some(BrokerTrade {
        trade_id,
        symbol: Symbol::new(symbol),
        side,
        quantity: raw.get("q").and_then(as_f64)?.abs(),
        price: raw.get("p").and_then(as_f64)?,
        commission: raw.get("commission").and_then(as_f64).unwrap_or(0.0),
        commission_currency: raw
            .get("commission_currency")
            .and_then(Value::as_str)
            .map(Ccy::new)
            .unwrap_or(Ccy::EUR),
        executed_at,
        raw: raw.clone(),
    })
}

fn parse_broker_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn parse_cash_flow_row(raw: &Value) -> Option<BrokerCashFlow> {
    let date_raw = raw.get("date").and_then(Value::as_str)?;
    let date = NaiveDate::parse_from_str(&date_raw[..date_raw.len().min(10)], "%Y-%m-%d").ok()?;
    let type_id = raw.get("type_id").and_then(Value::as_str)?.to_string();
    let amount = raw.get("sum").or_else(|| raw.get("amount")).and_then(as_f64)?;

    Some(BrokerCashFlow {
        date,
        type_id,
        amount,
        currency: raw
            .get("curr")
            .or_else(|| raw.get("currency"))
            .and_then(Value::as_str)
            .map(Ccy::new)
            .unwrap_or(Ccy::EUR),
        comment: raw
            .get("comment")
            .and_then(Value::as_str)
            .map(String::from),
        raw: raw.clone(),
    })
}

#[async_trait]
impl Broker for Tradernet {
    async fn get_quote(&self, symbol: &Symbol) -> Result<Option<Quote>, BrokerError> {
        let quotes = self.get_quotes(std::slice::from_ref(symbol)).await?;
        Ok(quotes.get(symbol).cloned())
    }

    async fn get_quotes(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, Quote>, BrokerError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let cache_key = Self::quote_cache_key(symbols);
        if let Some((cached_at, quotes)) = self.quote_cache.read().get(&cache_key) {
            if cached_at.elapsed() < QUOTE_CACHE_TTL {
                debug!(symbols = symbols.len(), "quote cache hit");
                return Ok(quotes.clone());
            }
        }

        let tickers: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();
        let response = self
            .public_get("getQuotesJson", json!({ "tickers": tickers }), Duration::from_secs(10))
            .await?;

        let mut result = HashMap::new();
        for raw in parse_quotes_response(&response) {
            if let Some(quote) = map_quote_fields(&raw) {
                result.insert(quote.symbol.clone(), quote);
            }
        }

        self.quote_cache
            .write()
            .insert(cache_key, (Instant::now(), result.clone()));
        Ok(result)
    }

    async fn get_historical_prices_bulk(
        &self,
        symbols: &[Symbol],
        years: u32,
    ) -> Result<HashMap<Symbol, Vec<PriceBar>>, BrokerError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let end = Utc::now();
        let start = end - chrono::Duration::days(i64::from(years) * 365);
        let ids: Vec<&str> = symbols.iter().map(Symbol::as_str).collect();

        let params = json!({
            "id": ids.join(","),
            "count": -1,
            "timeframe": 1440,
            "date_from": start.format("%d.%m.%Y 00:00").to_string(),
            "date_to": end.format("%d.%m.%Y 23:59").to_string(),
            "intervalMode": "ClosedRay",
        });

        let data = self
            .public_get("getHloc", params, Duration::from_secs(60))
            .await?;
        Ok(parse_hloc(&data, symbols))
    }

    async fn get_portfolio(&self) -> Result<BrokerPortfolio, BrokerError> {
        let response = self
            .signed_post("getPositionJson", json!({}), Duration::from_secs(15))
            .await?;
        Ok(parse_portfolio(&response))
    }

    async fn buy(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        if symbol.is_asian_market() && price.is_none() {
            return Err(BrokerError::Api(format!(
                "limit price required for Asian-market symbol {symbol}"
            )));
        }

        if !self.mode().is_live() {
            debug!(%symbol, quantity, ?price, "research mode: would buy");
            return Ok(Some(OrderId(format!("RESEARCH-BUY-{symbol}-{quantity}"))));
        }

        let mut params = json!({
            "instr_name": symbol.as_str(),
            "action_id": 1,
            "order_type_id": if price.is_some() { 2 } else { 1 },
            "qty": quantity,
        });
        if let Some(price) = price {
            params["limit_price"] = json!(price);
        }

        let response = self
            .signed_post("putTradeOrder", params, Duration::from_secs(30))
            .await?;
        Ok(response
            .get("order_id")
            .map(|id| OrderId(id.to_string().trim_matches('"').to_string())))
    }

    async fn sell(
        &self,
        symbol: &Symbol,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Option<OrderId>, BrokerError> {
        if symbol.is_asian_market() && price.is_none() {
            return Err(BrokerError::Api(format!(
                "limit price required for Asian-market symbol {symbol}"
            )));
        }

        if !self.mode().is_live() {
            debug!(%symbol, quantity, ?price, "research mode: would sell");
            return Ok(Some(OrderId(format!("RESEARCH-SELL-{symbol}-{quantity}"))));
        }

        let mut params = json!({
            "instr_name": symbol.as_str(),
            "action_id": 3,
            "order_type_id": if price.is_some() { 2 } else { 1 },
            "qty": quantity,
        });
        if let Some(price) = price {
            params["limit_price"] = json!(price);
        }

        let response = self
            .signed_post("putTradeOrder", params, Duration::from_secs(30))
            .await?;
        Ok(response
            .get("order_id")
            .map(|id| OrderId(id.to_string().trim_matches('"').to_string())))
    }

    async fn get_trades_history(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BrokerTrade>, BrokerError> {
        let response = self
            .signed_post(
                "getTradesHistory",
                json!({
                    "beginDate": start.to_string(),
                    "endDate": end.to_string(),
                    "limit": 1000,
                }),
                Duration::from_secs(30),
            )
            .await?;

        let rows = response
            .pointer("/trades/trade")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut trades = Vec::with_capacity(rows.len());
        for raw in &rows {
            match parse_trade_row(raw) {
                Some(trade) => trades.push(trade),
                None => warn!(?raw, "skipping unparseable trade row"),
            }
        }
        Ok(trades)
    }

    async fn get_cash_flows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BrokerCashFlow>, BrokerError> {
        let response = self
            .signed_post(
                "getBrokerReport",
                json!({
                    "date_start": start.to_string(),
                    "date_end": end.to_string(),
                    "data_block_type": "in_outs",
                }),
                Duration::from_secs(30),
            )
            .await?;

        let rows = response
            .pointer("/report/detailed")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows.iter().filter_map(parse_cash_flow_row).collect())
    }

    async fn get_corporate_actions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, BrokerError> {
        let response = self
            .signed_post(
                "getBrokerReport",
                json!({
                    "date_start": start.to_string(),
                    "date_end": end.to_string(),
                    "data_block_type": "corporate_actions",
                }),
                Duration::from_secs(30),
            )
            .await?;

        Ok(response
            .pointer("/report/detailed")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_security_info(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<SecurityInfo>, BrokerError> {
        let response = self
            .public_get(
                "getSecurityInfo",
                json!({ "ticker": symbol.as_str(), "sup": true }),
                Duration::from_secs(10),
            )
            .await?;

        let name = response
            .get("short_name")
            .or_else(|| response.get("name"))
            .and_then(Value::as_str);
        let Some(name) = name else { return Ok(None) };

        Ok(Some(SecurityInfo {
            symbol: symbol.clone(),
            name: name.to_string(),
            currency: response
                .get("currency")
                .or_else(|| response.get("curr"))
                .and_then(Value::as_str)
                .map(Ccy::new)
                .unwrap_or(Ccy::EUR),
            market_id: response
                .pointer("/mrkt/mkt_id")
                .map(|id| id.to_string().trim_matches('"').to_string()),
            min_lot: response
                .get("lot")
                .and_then(as_f64)
                .map(|lot| lot.max(1.0) as u32)
                .unwrap_or(1),
        }))
    }

    async fn is_market_open(&self, market_id: &str) -> Result<bool, BrokerError> {
        let response = self
            .public_get(
                "getMarketStatus",
                json!({ "market": market_id }),
                Duration::from_secs(10),
            )
            .await?;

        let markets = response
            .pointer("/result/markets/m")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for market in &markets {
            let matches_id = market
                .get("n2")
                .and_then(Value::as_str)
                .is_some_and(|n2| n2 == market_id)
                || market
                    .get("mkt_id")
                    .map(|id| id.to_string().trim_matches('"') == market_id)
                    .unwrap_or(false);
            if matches_id {
                return Ok(market.get("s").and_then(Value::as_str) == Some("OPEN"));
            }
        }
        Ok(false)
    }

    async fn get_available_securities(&self) -> Result<Vec<Symbol>, BrokerError> {
        let response = self
            .public_get(
                "getTopSecurities",
                json!({
                    "type": "stocks",
                    "exchange": "europe",
                    "gainers": 0,
                    "limit": 100,
                }),
                Duration::from_secs(60),
            )
            .await?;

        let tickers = response
            .get("tickers")
            .or_else(|| response.get("securities"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(tickers
            .iter()
            .filter_map(|t| {
                t.as_str()
                    .map(Symbol::new)
                    .or_else(|| t.get("t").and_then(Value::as_str).map(Symbol::new))
            })
            .collect())
    }

    async fn eur_cross_rates(
        &self,
        currencies: &[Ccy],
        date: Option<NaiveDate>,
    ) -> Result<HashMap<Ccy, f64>, BrokerError> {
        let codes: Vec<&str> = currencies.iter().map(Ccy::as_str).collect();
        let mut params = json!({
            "base_currency": "EUR",
            "currencies": codes,
        });
        if let Some(date) = date {
            params["date"] = json!(date.to_string());
        }

        let response = self
            .public_get("getCrossRatesForDate", params, Duration::from_secs(10))
            .await?;

        let Some(rates) = response.get("rates").and_then(Value::as_object) else {
            error!("cross rates response missing rates object");
            return Ok(HashMap::new());
        };

        Ok(rates
            .iter()
            .filter_map(|(currency, rate)| {
                as_f64(rate)
                    .filter(|rate| *rate > 0.0)
                    .map(|rate| (Ccy::new(currency.as_str()), rate))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_quote_fields() {
        let raw = json!({
            "c": "AAPL.US",
            "ltp": 182.5,
            "bbp": 182.4,
            "bap": 182.6,
            "chg": 1.2,
            "pcp": 0.66,
        });
        let quote = map_quote_fields(&raw).unwrap();
        assert_eq!(quote.symbol, Symbol::new("AAPL.US"));
        assert_eq!(quote.price, 182.5);
        assert_eq!(quote.bid, Some(182.4));
        assert_eq!(quote.change_pct, Some(0.66));
    }

    #[test]
    fn test_map_quote_fields_missing_price_is_none() {
        assert!(map_quote_fields(&json!({ "c": "AAPL.US" })).is_none());
    }

    #[test]
    fn test_parse_quotes_response_both_formats() {
        let direct = json!({ "quotes": [{ "c": "A" }] });
        let nested = json!({ "result": { "q": [{ "c": "A" }, { "c": "B" }] } });
        assert_eq!(parse_quotes_response(&direct).len(), 1);
        assert_eq!(parse_quotes_response(&nested).len(), 2);
    }

    #[test]
    fn test_parse_hloc() {
        // Candles are [high, low, open, close].
        let data = json!({
            "hloc": { "AAPL.US": [[187.0, 183.0, 184.0, 186.0], [188.0, 185.0, 186.0, 187.5]] },
            "xSeries": { "AAPL.US": [1704153600, 1704240000] },
            "vl": { "AAPL.US": [1000.0] },
        });
        let bars = parse_hloc(&data, &[Symbol::new("AAPL.US")]);
        let bars = &bars[&Symbol::new("AAPL.US")];
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].high, 187.0);
        assert_eq!(bars[0].low, 183.0);
        assert_eq!(bars[0].open, 184.0);
        assert_eq!(bars[0].close, 186.0);
        assert_eq!(bars[0].volume, 1000.0);
        assert_eq!(bars[1].volume, 0.0);
    }

    #[test]
    fn test_parse_trade_row() {
        let raw = json!({
            "trade_id": 991,
            "instr_nm": "AAPL.US",
            "type": "2",
            "q": 10,
            "p": 182.5,
            "commission": 2.0,
            "commission_currency": "USD",
            "date": "2024-05-13 15:30:00",
        });
        let trade = parse_trade_row(&raw).unwrap();
        assert_eq!(trade.trade_id, "991");
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.quantity, 10.0);
        assert_eq!(trade.commission_currency, Ccy::new("USD"));
    }

    #[test]
    fn test_parse_cash_flow_row() {
        let raw = json!({
            "date": "2024-05-13",
            "type_id": "dividend",
            "sum": 12.5,
            "curr": "USD",
            "comment": "AAPL.US dividend",
        });
        let flow = parse_cash_flow_row(&raw).unwrap();
        assert_eq!(flow.type_id, "dividend");
        assert_eq!(flow.amount, 12.5);
        assert_eq!(flow.currency, Ccy::new("USD"));
    }

    #[tokio::test]
    async fn test_research_mode_buy_short_circuits() {
        let broker = Tradernet::new(None, None);
        let order = broker
            .buy(&Symbol::new("AAPL.US"), 4.0, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.0, "RESEARCH-BUY-AAPL.US-4");
    }

    #[tokio::test]
    async fn test_asian_market_requires_price() {
        let broker = Tradernet::new(None, None);
        let result = broker.buy(&Symbol::new("0700.AS"), 100.0, None).await;
        assert!(result.is_err());
        assert!(
            broker
                .sell(&Symbol::new("0700.AS"), 100.0, Some(310.0))
                .await
                .is_ok()
        );
    }
}
