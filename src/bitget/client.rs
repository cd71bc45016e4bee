//! Bitget REST client
//!
//! Every call goes through the same pipeline: circuit breaker check, request
//! pacing, signed request, retry with exponential backoff on transient
//! failures. Order placement carries a `clientOid` generated once per logical
//! order, so a retried POST cannot create a second order.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::{request_path, sign_request};
use super::types::*;
use crate::common::{backoff_delay, CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use crate::config::ExchangeConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::exchange::{AdapterFactory, ExchangeAdapter};
use crate::types::{
    Balance, Direction, ExchangeCredentials, OpenOrder, OrderHandle, RemotePosition, Side, Symbol,
    UserId,
};

const POSITIONS_PATH: &str = "/api/v2/mix/position/all-position";
const PLAN_PENDING_PATH: &str = "/api/v2/mix/order/orders-plan-pending";
const PLACE_TPSL_PATH: &str = "/api/v2/mix/order/place-tpsl-order";
const CANCEL_PLAN_PATH: &str = "/api/v2/mix/order/cancel-plan-order";
const PLACE_ORDER_PATH: &str = "/api/v2/mix/order/place-order";
const ACCOUNTS_PATH: &str = "/api/v2/mix/account/accounts";
const TICKER_PATH: &str = "/api/v2/mix/market/ticker";

static CLIENT_OID_SEQ: AtomicU64 = AtomicU64::new(0);

fn client_oid(tag: &str) -> String {
    let seq = CLIENT_OID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("ts{}{}{}", tag, Utc::now().timestamp_millis(), seq)
}

fn decimal_str(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub product_type: String,
    pub margin_coin: String,
    pub hedge_mode: bool,
    pub max_retries: u32,
    pub timeout: Duration,
    pub retry_base_delay: Duration,
    pub rate_limit: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ExchangeConfig::default())
    }
}

impl From<&ExchangeConfig> for ClientConfig {
    fn from(cfg: &ExchangeConfig) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            product_type: cfg.product_type.clone(),
            margin_coin: cfg.margin_coin.clone(),
            hedge_mode: cfg.hedge_mode,
            max_retries: cfg.max_retries,
            timeout: cfg.timeout(),
            retry_base_delay: Duration::from_millis(500),
            rate_limit: cfg.rate_limit,
            circuit_breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(cfg.circuit_breaker_threshold),
        }
    }
}

impl ClientConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Bitget USDT-M futures client for one user
pub struct BitgetClient {
    credentials: ExchangeCredentials,
    http: Client,
    config: ClientConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

impl BitgetClient {
    pub fn new(credentials: ExchangeCredentials, config: ClientConfig) -> AdapterResult<Self> {
        if !credentials.is_valid() {
            return Err(AdapterError::Auth("missing API key or secret".into()));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AdapterError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            breaker: CircuitBreaker::new("bitget", config.circuit_breaker.clone()),
            limiter: RateLimiter::per_second(config.rate_limit),
            credentials,
            http,
            config,
        })
    }

    /// Runs `operation` behind the breaker and pacer, retrying transient errors
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> AdapterResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = AdapterResult<T>>,
    {
        self.breaker.check()?;

        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        attempt,
                        Duration::from_secs(8),
                    );
                    warn!(
                        "Request failed (attempt {}/{}): {}; retrying in {}ms",
                        attempt,
                        self.config.max_retries + 1,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.breaker.record_failure();
                    } else {
                        // The exchange answered; it is reachable
                        self.breaker.record_success();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One signed request; unwraps the `{code, msg, data}` envelope
    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> AdapterResult<Option<T>> {
        let path = request_path(path, query);
        let body = body.map(Value::to_string).unwrap_or_default();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign_request(
            &self.credentials.api_secret,
            &timestamp,
            method.as_str(),
            &path,
            &body,
        )?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.config.base_url, path))
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("locale", "en-US")
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AdapterError::Auth(format!("{status}: {text}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimited);
        }
        if status.is_server_error() {
            return Err(AdapterError::Transport(format!("{status}: {text}")));
        }

        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| {
            AdapterError::Decode(format!("{e} in response ({status}): {text}"))
        })?;
        if envelope.code != SUCCESS_CODE {
            return Err(AdapterError::Exchange {
                code: envelope.code,
                message: envelope.msg,
            });
        }
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> AdapterResult<Option<T>> {
        self.execute_with_retry(|| self.send_signed(Method::GET, path, query, None))
            .await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> AdapterResult<Option<T>> {
        self.execute_with_retry(|| self.send_signed(Method::POST, path, &[], Some(body)))
            .await
    }

    fn product_query(&self) -> (&'static str, String) {
        ("productType", self.config.product_type.clone())
    }

    fn hold_side(direction: Direction) -> &'static str {
        match direction {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// Places a TP/SL plan; exchange rejections become `Ok(None)`
    async fn place_plan(
        &self,
        symbol: &Symbol,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
        plan_type: &str,
        tag: &str,
    ) -> AdapterResult<Option<OrderHandle>> {
        let body = json!({
            "marginCoin": self.config.margin_coin,
            "productType": self.config.product_type,
            "symbol": symbol.as_str(),
            "planType": plan_type,
            "triggerPrice": decimal_str(price),
            "triggerType": "mark_price",
            "executePrice": "0",
            "holdSide": Self::hold_side(direction),
            "size": decimal_str(amount),
            "clientOid": client_oid(tag),
        });

        match self.post::<OrderAck>(PLACE_TPSL_PATH, &body).await {
            Ok(Some(OrderAck {
                order_id: Some(id), ..
            })) => Ok(Some(OrderHandle { id })),
            Ok(_) => Ok(None),
            Err(AdapterError::Exchange { code, message }) => {
                warn!(symbol = %symbol, "{} order rejected: {} {}", plan_type, code, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BitgetClient {
    async fn fetch_positions(&self) -> AdapterResult<Vec<RemotePosition>> {
        let query = [
            self.product_query(),
            ("marginCoin", self.config.margin_coin.clone()),
        ];
        let rows: Vec<WirePosition> = self.get(POSITIONS_PATH, &query).await?.unwrap_or_default();
        Ok(rows.into_iter().filter_map(WirePosition::into_remote).collect())
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> AdapterResult<Vec<OpenOrder>> {
        let query = [
            self.product_query(),
            ("planType", "profit_loss".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let list: Option<PlanOrderList> = self.get(PLAN_PENDING_PATH, &query).await?;
        Ok(list
            .and_then(|l| l.entrusted_list)
            .unwrap_or_default()
            .into_iter()
            .filter_map(WirePlanOrder::into_open_order)
            .collect())
    }

    async fn place_take_profit(
        &self,
        symbol: &Symbol,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
        tag: &str,
    ) -> AdapterResult<Option<OrderHandle>> {
        self.place_plan(symbol, direction, amount, price, "profit_plan", tag)
            .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &Symbol,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
    ) -> AdapterResult<Option<OrderHandle>> {
        self.place_plan(symbol, direction, amount, price, "loss_plan", "sl")
            .await
    }

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> AdapterResult<bool> {
        let body = json!({
            "symbol": symbol.as_str(),
            "productType": self.config.product_type,
            "marginCoin": self.config.margin_coin,
            "orderIdList": [{ "orderId": order_id }],
        });
        match self.post::<CancelResult>(CANCEL_PLAN_PATH, &body).await {
            Ok(Some(result)) => Ok(!result.success_list.is_empty() && result.failure_list.is_empty()),
            Ok(None) => Ok(false),
            Err(AdapterError::Exchange { code, message }) => {
                debug!(symbol = %symbol, "cancel {} rejected: {} {}", order_id, code, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        amount: Decimal,
    ) -> AdapterResult<Option<OrderHandle>> {
        let mut body = json!({
            "symbol": symbol.as_str(),
            "productType": self.config.product_type,
            "marginMode": "crossed",
            "marginCoin": self.config.margin_coin,
            "size": decimal_str(amount),
            "orderType": "market",
            "clientOid": client_oid("mk"),
        });
        if self.config.hedge_mode {
            // Hedge mode closes with the side of the position being closed
            let position_side = match side {
                Side::Sell => Side::Buy,
                Side::Buy => Side::Sell,
            };
            body["side"] = json!(position_side.as_str());
            body["tradeSide"] = json!("close");
        } else {
            body["side"] = json!(side.as_str());
            body["reduceOnly"] = json!("YES");
        }

        match self.post::<OrderAck>(PLACE_ORDER_PATH, &body).await {
            Ok(Some(OrderAck {
                order_id: Some(id), ..
            })) => Ok(Some(OrderHandle { id })),
            Ok(_) => Ok(None),
            Err(AdapterError::Exchange { code, message }) => {
                warn!(symbol = %symbol, "market {} rejected: {} {}", side, code, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_balance(&self) -> AdapterResult<Balance> {
        let accounts: Vec<WireAccount> = self
            .get(ACCOUNTS_PATH, &[self.product_query()])
            .await?
            .unwrap_or_default();
        Ok(accounts
            .iter()
            .find(|a| a.margin_coin.eq_ignore_ascii_case(&self.config.margin_coin))
            .map(WireAccount::to_balance)
            .unwrap_or_default())
    }

    async fn fetch_ticker_price(&self, symbol: &Symbol) -> AdapterResult<Decimal> {
        let query = [("symbol", symbol.to_string()), self.product_query()];
        let tickers: Vec<WireTicker> = self.get(TICKER_PATH, &query).await?.unwrap_or_default();
        tickers
            .first()
            .and_then(|t| t.last_pr.or(t.mark_price))
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| AdapterError::Decode(format!("no price in ticker for {symbol}")))
    }
}

/// Builds a [`BitgetClient`] per user
pub struct BitgetFactory {
    config: ClientConfig,
}

impl BitgetFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl AdapterFactory for BitgetFactory {
    fn connect(
        &self,
        user_id: UserId,
        credentials: &ExchangeCredentials,
    ) -> AdapterResult<Arc<dyn ExchangeAdapter>> {
        debug!(user = user_id, "Connecting Bitget client");
        let client = BitgetClient::new(credentials.clone(), self.config.clone())?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_credentials() {
        let creds = ExchangeCredentials {
            api_key: String::new(),
            api_secret: "s".into(),
            passphrase: String::new(),
        };
        assert!(matches!(
            BitgetClient::new(creds, ClientConfig::default()),
            Err(AdapterError::Auth(_))
        ));
    }

    #[test]
    fn test_client_oids_are_unique() {
        let a = client_oid("tp1");
        let b = client_oid("tp1");
        assert_ne!(a, b);
        assert!(a.starts_with("tstp1"));
    }

    #[test]
    fn test_config_from_exchange_section() {
        let mut section = ExchangeConfig::default();
        section.base_url = "https://example.test/".into();
        section.max_retries = 5;
        let cfg = ClientConfig::from(&section);
        assert_eq!(cfg.base_url, "https://example.test");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.circuit_breaker.failure_threshold, section.circuit_breaker_threshold);
    }
}
