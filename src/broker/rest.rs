use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::types::{
    AccountBalance, DailyBar, Holding, MarketType, OrderRequest, OrderResult, PriceSnapshot,
    RankedStock,
};

use super::{BrokerError, BrokerGateway, ChartPeriod};

const KIS_REAL_API: &str = "https://openapi.koreainvestment.com:9443";
const KIS_SANDBOX_API: &str = "https://openapivts.koreainvestment.com:29443";

const REST_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

const OVERALL_RPS: u32 = 20;
const PER_ENDPOINT_RPS: u32 = 2;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type EndpointLimiter = RateLimiter<&'static str, DefaultKeyedStateStore<&'static str>, DefaultClock>;

#[derive(Debug, Clone)]
pub struct KisCredentials {
    pub app_key: String,
    pub app_secret: String,
    /// 8-digit account number.
    pub account_no: String,
    /// Account product code, usually "01".
    pub account_product: String,
    /// HTS login id, required for the execution-notice subscription.
    pub hts_id: String,
    pub sandbox: bool,
}

#[derive(Debug, Clone)]
struct AuthToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl AuthToken {
    fn is_valid(&self) -> bool {
        // One-minute safety margin against clock skew.
        Utc::now() + ChronoDuration::seconds(60) < self.expires_at
    }
}

/// KIS OpenAPI REST client: bearer-token auth with a refresh mutex, overall
/// and per-endpoint rate limiting, and bounded retry with exponential
/// backoff for transient failures.
pub struct KisClient {
    http: Client,
    base_url: String,
    credentials: KisCredentials,
    token: RwLock<Option<AuthToken>>,
    refresh_lock: Mutex<()>,
    overall_limiter: DirectLimiter,
    endpoint_limiter: EndpointLimiter,
}

impl KisClient {
    pub fn new(credentials: KisCredentials) -> Self {
        let base_url = if credentials.sandbox {
            KIS_SANDBOX_API.to_string()
        } else {
            KIS_REAL_API.to_string()
        };
        Self {
            http: Client::builder()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url,
            credentials,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            overall_limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(OVERALL_RPS).unwrap(),
            )),
            endpoint_limiter: RateLimiter::keyed(Quota::per_second(
                NonZeroU32::new(PER_ENDPOINT_RPS).unwrap(),
            )),
        }
    }

    async fn access_token(&self) -> Result<String, BrokerError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_valid() {
                return Ok(token.access_token.clone());
            }
        }
        self.refresh_token().await
    }

    /// Idempotent refresh: the mutex serializes refreshers and the
    /// double-check lets late arrivals reuse the fresh token.
    async fn refresh_token(&self) -> Result<String, BrokerError> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_valid() {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!("{}/oauth2/tokenP", self.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.credentials.app_key,
            "appsecret": self.credentials.app_secret,
        });
        let reply: Value = self.http.post(&url).json(&body).send().await?.json().await?;

        let access_token = reply
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Auth(format!("token reply missing access_token: {}", reply)))?
            .to_string();
        let expires_in = reply.get("expires_in").and_then(Value::as_i64).unwrap_or(86_400);

        *self.token.write().await = Some(AuthToken {
            access_token: access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        });
        info!("KIS access token refreshed (expires in {}s)", expires_in);
        Ok(access_token)
    }

    /// Realtime-stream approval key, fetched once at session start.
    pub async fn websocket_approval_key(&self) -> Result<String, BrokerError> {
        let url = format!("{}/oauth2/Approval", self.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.credentials.app_key,
            "secretkey": self.credentials.app_secret,
        });
        let reply: Value = self.http.post(&url).json(&body).send().await?.json().await?;
        reply
            .get("approval_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Auth(format!("approval reply missing key: {}", reply)))
    }

    pub fn hts_id(&self) -> &str {
        &self.credentials.hts_id
    }

    pub fn sandbox(&self) -> bool {
        self.credentials.sandbox
    }

    async fn throttle(&self, endpoint: &'static str) {
        self.overall_limiter.until_ready().await;
        self.endpoint_limiter.until_key_ready(&endpoint).await;
    }

    /// One GET with auth headers; auth expiry refreshes the token once and
    /// retries, transient failures back off exponentially up to 5 attempts.
    async fn get_json(
        &self,
        endpoint: &'static str,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> Result<Value, BrokerError> {
        self.request_with_retry(endpoint, || self.get_once(path, tr_id, params)).await
    }

    async fn post_json(
        &self,
        endpoint: &'static str,
        path: &str,
        tr_id: &str,
        body: Value,
    ) -> Result<Value, BrokerError> {
        self.request_with_retry(endpoint, || self.post_once(path, tr_id, body.clone())).await
    }

    async fn request_with_retry<F, Fut>(
        &self,
        endpoint: &'static str,
        attempt: F,
    ) -> Result<Value, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Value, BrokerError>>,
    {
        let mut backoff = RETRY_BASE;
        let mut refreshed = false;
        for tries in 1..=MAX_ATTEMPTS {
            self.throttle(endpoint).await;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() && !refreshed => {
                    warn!("auth expired on {}, refreshing token once", endpoint);
                    self.refresh_token().await?;
                    refreshed = true;
                }
                Err(e) if e.is_transient() && tries < MAX_ATTEMPTS => {
                    debug!("transient failure on {} (attempt {}): {}", endpoint, tries, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
                Err(e) => return Err(e),
            }
        }
        Err(BrokerError::Network(format!("{} exhausted retries", endpoint)))
    }

    async fn get_once(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, String)],
    ) -> Result<Value, BrokerError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .header("authorization", format!("Bearer {}", token))
            .header("appkey", &self.credentials.app_key)
            .header("appsecret", &self.credentials.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .send()
            .await?;
        Self::check_reply(response.json().await?)
    }

    async fn post_once(&self, path: &str, tr_id: &str, body: Value) -> Result<Value, BrokerError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .header("authorization", format!("Bearer {}", token))
            .header("appkey", &self.credentials.app_key)
            .header("appsecret", &self.credentials.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .send()
            .await?;
        Self::check_reply(response.json().await?)
    }

    fn check_reply(value: Value) -> Result<Value, BrokerError> {
        let rt_cd = field_str(&value, "rt_cd");
        if rt_cd == "0" || rt_cd.is_empty() {
            return Ok(value);
        }
        let msg_cd = field_str(&value, "msg_cd");
        let msg = field_str(&value, "msg1");
        if msg_cd.starts_with("EGW00123") || msg.contains("token") {
            return Err(BrokerError::Auth(msg));
        }
        Err(BrokerError::Gateway { code: msg_cd, message: msg })
    }

    fn order_tr_id(&self, buy: bool) -> &'static str {
        match (buy, self.credentials.sandbox) {
            (true, false) => "TTTC0802U",
            (false, false) => "TTTC0801U",
            (true, true) => "VTTC0802U",
            (false, true) => "VTTC0801U",
        }
    }

    async fn submit_order(
        &self,
        code: &str,
        quantity: u32,
        price: Decimal,
        buy: bool,
    ) -> Result<OrderResult, BrokerError> {
        let body = json!({
            "CANO": self.credentials.account_no,
            "ACNT_PRDT_CD": self.credentials.account_product,
            "PDNO": code,
            "ORD_DVSN": "00",
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": price.round_dp(0).to_string(),
        });
        let reply = self
            .post_json("order-cash", "/uapi/domestic-stock/v1/trading/order-cash", self.order_tr_id(buy), body)
            .await;

        match reply {
            Ok(value) => {
                let order_no = value
                    .get("output")
                    .map(|o| field_str(o, "ODNO"))
                    .unwrap_or_default();
                if order_no.is_empty() {
                    Ok(OrderResult::rejected(field_str(&value, "msg1")))
                } else {
                    Ok(OrderResult::accepted(order_no))
                }
            }
            // Logical rejections come back as a normal result so callers can
            // revert state instead of retrying.
            Err(BrokerError::Gateway { code, message }) => {
                Ok(OrderResult::rejected(format!("{} {}", code, message)))
            }
            Err(e) => Err(e),
        }
    }

    fn parse_ranked(rows: Option<&Value>, code_key: &str) -> Vec<RankedStock> {
        let Some(Value::Array(rows)) = rows else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                let code = field_str(row, code_key);
                if code.is_empty() {
                    return None;
                }
                Some(RankedStock {
                    stock_code: code,
                    stock_name: field_str(row, "hts_kor_isnm"),
                    current_price: field_decimal(row, "stck_prpr"),
                    day_change_pct: field_f64(row, "prdy_ctrt"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl BrokerGateway for KisClient {
    async fn current_price(&self, code: &str) -> Result<PriceSnapshot, BrokerError> {
        let params = vec![
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", code.to_string()),
        ];
        let reply = self
            .get_json(
                "inquire-price",
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &params,
            )
            .await?;
        let output = reply
            .get("output")
            .ok_or_else(|| BrokerError::Parse("inquire-price missing output".into()))?;

        Ok(PriceSnapshot {
            stock_code: code.to_string(),
            stock_name: field_str(output, "hts_kor_isnm"),
            current_price: field_decimal(output, "stck_prpr"),
            open: field_decimal(output, "stck_oprc"),
            high: field_decimal(output, "stck_hgpr"),
            low: field_decimal(output, "stck_lwpr"),
            prev_close: field_decimal(output, "stck_sdpr"),
            accumulated_volume: field_u64(output, "acml_vol"),
            average_volume: field_u64(output, "avrg_vol"),
            day_change_pct: field_f64(output, "prdy_ctrt"),
        })
    }

    async fn daily_chart(
        &self,
        code: &str,
        period: ChartPeriod,
        adjusted: bool,
    ) -> Result<Vec<DailyBar>, BrokerError> {
        let today = Utc::now().format("%Y%m%d").to_string();
        let from = (Utc::now() - ChronoDuration::days(120)).format("%Y%m%d").to_string();
        let params = vec![
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", code.to_string()),
            ("FID_INPUT_DATE_1", from),
            ("FID_INPUT_DATE_2", today),
            ("FID_PERIOD_DIV_CODE", period.code().to_string()),
            ("FID_ORG_ADJ_PRC", if adjusted { "1" } else { "0" }.to_string()),
        ];
        let reply = self
            .get_json(
                "daily-chart",
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                "FHKST03010100",
                &params,
            )
            .await?;

        let Some(Value::Array(rows)) = reply.get("output2") else {
            return Ok(Vec::new());
        };
        let bars = rows
            .iter()
            .filter_map(|row| {
                let date = NaiveDate::parse_from_str(&field_str(row, "stck_bsop_date"), "%Y%m%d").ok()?;
                let close = field_decimal(row, "stck_clpr");
                if close <= Decimal::ZERO {
                    return None;
                }
                Some(DailyBar {
                    date,
                    open: field_decimal(row, "stck_oprc"),
                    high: field_decimal(row, "stck_hgpr"),
                    low: field_decimal(row, "stck_lwpr"),
                    close,
                    volume: field_u64(row, "acml_vol"),
                })
            })
            .collect();
        Ok(bars)
    }

    async fn fluctuation_rank(
        &self,
        market: MarketType,
        min_rate: f64,
    ) -> Result<Vec<RankedStock>, BrokerError> {
        let params = vec![
            ("fid_cond_mrkt_div_code", market.division_code().to_string()),
            ("fid_cond_scr_div_code", "20170".to_string()),
            ("fid_input_iscd", "0000".to_string()),
            ("fid_rank_sort_cls_code", "0".to_string()),
            ("fid_input_cnt_1", "0".to_string()),
            ("fid_prc_cls_code", "0".to_string()),
            ("fid_input_price_1", String::new()),
            ("fid_input_price_2", String::new()),
            ("fid_vol_cnt", String::new()),
            ("fid_trgt_cls_code", "0".to_string()),
            ("fid_trgt_exls_cls_code", "0".to_string()),
            ("fid_div_cls_code", "0".to_string()),
            ("fid_rsfl_rate1", format!("{:.1}", min_rate)),
            ("fid_rsfl_rate2", String::new()),
        ];
        let reply = self
            .get_json(
                "ranking-fluctuation",
                "/uapi/domestic-stock/v1/ranking/fluctuation",
                "FHPST01700000",
                &params,
            )
            .await?;
        Ok(Self::parse_ranked(reply.get("output"), "stck_shrn_iscd"))
    }

    async fn volume_rank(&self, market: MarketType) -> Result<Vec<RankedStock>, BrokerError> {
        let params = vec![
            ("FID_COND_MRKT_DIV_CODE", market.division_code().to_string()),
            ("FID_COND_SCR_DIV_CODE", "20171".to_string()),
            ("FID_INPUT_ISCD", "0000".to_string()),
            ("FID_DIV_CLS_CODE", "0".to_string()),
            ("FID_BLNG_CLS_CODE", "0".to_string()),
            ("FID_TRGT_CLS_CODE", "111111111".to_string()),
            ("FID_TRGT_EXLS_CLS_CODE", "000000".to_string()),
            ("FID_INPUT_PRICE_1", String::new()),
            ("FID_INPUT_PRICE_2", String::new()),
            ("FID_VOL_CNT", "10000".to_string()),
            ("FID_INPUT_DATE_1", String::new()),
        ];
        let reply = self
            .get_json(
                "volume-rank",
                "/uapi/domestic-stock/v1/quotations/volume-rank",
                "FHPST01710000",
                &params,
            )
            .await?;
        Ok(Self::parse_ranked(reply.get("output"), "mksc_shrn_iscd"))
    }

    async fn disparity_rank(
        &self,
        market: MarketType,
        window: u16,
    ) -> Result<Vec<RankedStock>, BrokerError> {
        let params = vec![
            ("fid_cond_mrkt_div_code", market.division_code().to_string()),
            ("fid_cond_scr_div_code", "20178".to_string()),
            ("fid_input_iscd", "0000".to_string()),
            ("fid_rank_sort_cls_code", "0".to_string()),
            ("fid_hour_cls_code", window.to_string()),
            ("fid_div_cls_code", "0".to_string()),
            ("fid_input_price_1", String::new()),
            ("fid_input_price_2", String::new()),
            ("fid_vol_cnt", String::new()),
        ];
        let reply = self
            .get_json(
                "ranking-disparity",
                "/uapi/domestic-stock/v1/ranking/disparity",
                "FHPST01780000",
                &params,
            )
            .await?;
        Ok(Self::parse_ranked(reply.get("output"), "stck_shrn_iscd"))
    }

    async fn balance(&self) -> Result<AccountBalance, BrokerError> {
        let tr_id = if self.credentials.sandbox { "VTTC8434R" } else { "TTTC8434R" };
        let params = vec![
            ("CANO", self.credentials.account_no.clone()),
            ("ACNT_PRDT_CD", self.credentials.account_product.clone()),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let reply = self
            .get_json(
                "inquire-balance",
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                tr_id,
                &params,
            )
            .await?;

        let holdings = match reply.get("output1") {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(|row| {
                    let quantity = field_u64(row, "hldg_qty") as u32;
                    if quantity == 0 {
                        return None;
                    }
                    Some(Holding {
                        stock_code: field_str(row, "pdno"),
                        stock_name: field_str(row, "prdt_name"),
                        quantity,
                        average_price: field_decimal(row, "pchs_avg_pric"),
                        current_price: field_decimal(row, "prpr"),
                        profit_loss_rate: field_f64(row, "evlu_pfls_rt"),
                    })
                })
                .collect(),
            _ => Vec::new(),
        };

        let summary = match reply.get("output2") {
            Some(Value::Array(rows)) => rows.first().cloned().unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        Ok(AccountBalance {
            available_amount: field_decimal(&summary, "dnca_tot_amt"),
            cash_balance: field_decimal(&summary, "prvs_rcdl_excc_amt"),
            total_value: field_decimal(&summary, "tot_evlu_amt"),
            holdings,
        })
    }

    async fn order_buy(&self, order: &OrderRequest) -> Result<OrderResult, BrokerError> {
        self.submit_order(&order.stock_code, order.quantity, order.price, true).await
    }

    async fn order_sell(&self, order: &OrderRequest) -> Result<OrderResult, BrokerError> {
        self.submit_order(&order.stock_code, order.quantity, order.price, false).await
    }
}

// KIS replies carry every number as a string; these adapters default instead
// of failing when a field is absent or blank.

fn field_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn field_decimal(value: &Value, key: &str) -> Decimal {
    let raw = field_str(value, key);
    Decimal::from_str(&raw).unwrap_or(Decimal::ZERO)
}

fn field_u64(value: &Value, key: &str) -> u64 {
    let raw = field_str(value, key);
    raw.parse().unwrap_or(0)
}

fn field_f64(value: &Value, key: &str) -> f64 {
    let raw = field_str(value, key);
    raw.parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerant_field_adapters_default_on_missing() {
        let row = json!({"stck_prpr": "70100", "prdy_ctrt": "1.25", "blank": ""});
        assert_eq!(field_decimal(&row, "stck_prpr"), Decimal::from(70_100));
        assert_eq!(field_f64(&row, "prdy_ctrt"), 1.25);
        assert_eq!(field_decimal(&row, "missing"), Decimal::ZERO);
        assert_eq!(field_u64(&row, "blank"), 0);
        assert_eq!(field_str(&row, "missing"), "");
    }

    #[test]
    fn gateway_rejection_is_classified() {
        let reply = json!({"rt_cd": "1", "msg_cd": "APBK0400", "msg1": "주문 가능한 수량을 초과"});
        match KisClient::check_reply(reply) {
            Err(BrokerError::Gateway { code, .. }) => assert_eq!(code, "APBK0400"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn token_errors_are_auth() {
        let reply = json!({"rt_cd": "1", "msg_cd": "EGW00123", "msg1": "token expired"});
        assert!(matches!(KisClient::check_reply(reply), Err(BrokerError::Auth(_))));
    }

    #[test]
    fn ranked_rows_skip_blank_codes() {
        let rows = json!([
            {"stck_shrn_iscd": "005930", "hts_kor_isnm": "삼성전자", "stck_prpr": "70100", "prdy_ctrt": "2.1"},
            {"stck_shrn_iscd": "", "stck_prpr": "100"}
        ]);
        let parsed = KisClient::parse_ranked(Some(&rows), "stck_shrn_iscd");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].stock_code, "005930");
    }
}
