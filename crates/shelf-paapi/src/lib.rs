//! Request signing + rate-limited HTTP client for the product-search API.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

type HmacSha256 = Hmac<Sha256>;

pub const CRATE_NAME: &str = "shelf-paapi";

pub const DEFAULT_HOST: &str = "webservices.amazon.fr";
pub const DEFAULT_MARKETPLACE: &str = "www.amazon.fr";
pub const SEARCH_ITEMS_PATH: &str = "/paapi5/searchitems";
pub const SERVICE_NAME: &str = "ProductAdvertisingAPI";
pub const SEARCH_ITEMS_TARGET: &str = "com.amazon.paapi5.v1.ProductAdvertisingAPIv1.SearchItems";

const CONTENT_ENCODING: &str = "amz-1.0";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Item fields requested on every search.
pub const SEARCH_RESOURCES: [&str; 5] = [
    "ItemInfo.Title",
    "Images.Primary.Large",
    "ItemInfo.Features",
    "Offers.Listings.Price",
    "BrowseNodeInfo.BrowseNodes.SalesRank",
];

#[derive(Debug, Error)]
pub enum PaapiError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("serializing search request: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Key pair, region and associate tag used to call the API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub partner_tag: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("partner_tag", &self.partner_tag)
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, PaapiError> {
        Ok(Self {
            access_key: required_env("AWS_ACCESS_KEY")?,
            secret_key: required_env("AWS_SECRET_KEY")?,
            region: required_env("AWS_REGION")?,
            partner_tag: required_env("AWS_ASSOCIATE_TAG")?,
        })
    }
}

fn required_env(key: &str) -> Result<String, PaapiError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(PaapiError::Configuration(format!("{key} is not set"))),
    }
}

/// SearchItems payload, serialized with the API's PascalCase field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchRequest {
    pub keywords: String,
    pub resources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    pub availability: String,
    pub partner_tag: String,
    pub partner_type: String,
    pub marketplace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_page: Option<u32>,
}

impl SearchRequest {
    pub fn new(
        keywords: impl Into<String>,
        partner_tag: impl Into<String>,
        marketplace: impl Into<String>,
    ) -> Self {
        Self {
            keywords: keywords.into(),
            resources: SEARCH_RESOURCES.iter().map(|r| r.to_string()).collect(),
            item_count: None,
            availability: "Available".to_string(),
            partner_tag: partner_tag.into(),
            partner_type: "Associates".to_string(),
            marketplace: marketplace.into(),
            max_price: None,
            min_price: None,
            item_page: None,
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.item_page = Some(page);
        self
    }

    /// Price bounds are expressed in the marketplace's lowest currency unit.
    pub fn price_range(mut self, min: u32, max: u32) -> Self {
        self.min_price = Some(min);
        self.max_price = Some(max);
        self
    }

    pub fn item_count(mut self, count: u32) -> Self {
        self.item_count = Some(count);
        self
    }

    pub fn to_payload(&self) -> Result<String, PaapiError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Request body plus the headers that authenticate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    pub url: String,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub amz_date: String,
    pub credential_scope: String,
    pub payload_sha256: String,
    pub signature: String,
}

/// AWS Signature Version 4 signer bound to one API operation.
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
    host: String,
    path: String,
    method: String,
    target: String,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("service", &self.service)
            .field("host", &self.host)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Signer for `POST /paapi5/searchitems` on `host`.
    pub fn search_items(credentials: &Credentials, host: &str) -> Result<Self, PaapiError> {
        for (name, value) in [
            ("access key", &credentials.access_key),
            ("secret key", &credentials.secret_key),
            ("region", &credentials.region),
        ] {
            if value.trim().is_empty() {
                return Err(PaapiError::Configuration(format!("{name} is empty")));
            }
        }
        if host.trim().is_empty() {
            return Err(PaapiError::Configuration("host is empty".to_string()));
        }

        Ok(Self {
            access_key: credentials.access_key.clone(),
            secret_key: credentials.secret_key.clone(),
            region: credentials.region.clone(),
            service: SERVICE_NAME.to_string(),
            host: host.trim().to_string(),
            path: SEARCH_ITEMS_PATH.to_string(),
            method: "POST".to_string(),
            target: SEARCH_ITEMS_TARGET.to_string(),
        })
    }

    pub fn sign(&self, payload: &str, at: DateTime<Utc>) -> SignedRequest {
        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = at.format("%Y%m%d").to_string();
        let payload_sha256 = sha256_hex(payload.as_bytes());

        let mut headers = BTreeMap::new();
        headers.insert("content-encoding".to_string(), CONTENT_ENCODING.to_string());
        headers.insert("content-type".to_string(), CONTENT_TYPE.to_string());
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-target".to_string(), self.target.clone());

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect::<String>();
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            self.method, self.path, canonical_headers, signed_headers, payload_sha256
        );

        let credential_scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "{SIGNING_ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date_stamp),
            string_to_sign.as_bytes(),
        ));

        headers.insert(
            "authorization".to_string(),
            format!(
                "{SIGNING_ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
        );

        SignedRequest {
            method: self.method.clone(),
            url: format!("https://{}{}", self.host, self.path),
            body: payload.to_string(),
            headers,
            amz_date,
            credential_scope,
            payload_sha256,
            signature,
        }
    }

    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Time source for spacing and backoff; swapped for [`ManualClock`] in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when advanced or slept on. Sleeps return immediately.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
    state: StdMutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            origin_utc,
            state: StdMutex::new(ManualClockState::default()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.lock_state().elapsed += duration;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock_state().sleeps.clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.lock_state().sleeps.iter().sum()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManualClockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.lock_state().elapsed
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = self.lock_state().elapsed;
        self.origin_utc
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.lock_state();
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}

/// Minimum spacing between the starts of two outbound calls.
#[derive(Debug)]
pub struct CallSpacing {
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallSpacing {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Sleeps out the remainder of the spacing window, then claims the slot.
    pub async fn wait_turn(&self, clock: &dyn Clock) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let since = clock.now().saturating_duration_since(previous);
            if since < self.min_spacing {
                clock.sleep(self.min_spacing - since).await;
            }
        }
        *last_call = Some(clock.now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff with jitter, shared by every job that calls the API.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub honor_retry_after: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
            honor_retry_after: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed 1-based `attempt`, before jitter.
    pub fn delay_after_attempt(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        match retry_after {
            Some(hint) if self.honor_retry_after => delay.max(hint),
            _ => delay,
        }
    }

    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    pub fn has_attempts_left(&self, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Longest `Retry-After` hint honored; larger values are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// `Retry-After` in delay-seconds form, capped at [`MAX_RETRY_AFTER`];
/// HTTP-date values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub disposition: RetryDisposition,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &SignedRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);

        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &SignedRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Decoded response body, or the definitive "no data" once retries are spent.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// `Null` when the API answered with an empty body.
    Data(JsonValue),
    NoData,
}

impl ApiResponse {
    pub fn is_no_data(&self) -> bool {
        matches!(self, ApiResponse::NoData)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub response: ApiResponse,
    pub attempts: usize,
}

#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("throttled (HTTP 429)")]
    Throttled { retry_after: Option<Duration> },
    #[error("server error (HTTP {status})")]
    TransientServer { status: u16 },
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Seam between sweeps and the network.
#[async_trait]
pub trait SearchItems: Send + Sync {
    async fn search_items(&self, request: &SearchRequest) -> ApiResponse;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub timeout: Duration,
    pub min_call_spacing: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            timeout: Duration::from_secs(30),
            min_call_spacing: Duration::from_millis(1600),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct PaapiClient {
    signer: RequestSigner,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    spacing: CallSpacing,
    backoff: BackoffPolicy,
}

impl fmt::Debug for PaapiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaapiClient")
            .field("signer", &self.signer)
            .field("spacing", &self.spacing)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl PaapiClient {
    pub fn new(credentials: &Credentials, config: ClientConfig) -> anyhow::Result<Self> {
        let signer = RequestSigner::search_items(credentials, &config.host)?;
        let transport = ReqwestTransport::new(config.timeout, config.user_agent.as_deref())?;
        Ok(Self::with_parts(
            signer,
            Arc::new(transport),
            Arc::new(SystemClock),
            config.min_call_spacing,
            config.backoff,
        ))
    }

    pub fn with_parts(
        signer: RequestSigner,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        min_call_spacing: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            signer,
            transport,
            clock,
            spacing: CallSpacing::new(min_call_spacing),
            backoff,
        }
    }

    /// One logical call: spaced, signed per attempt, retried per the backoff policy.
    pub async fn execute(&self, request: &SearchRequest) -> CallOutcome {
        let span = info_span!(
            "paapi_call",
            keywords = %request.keywords,
            page = ?request.item_page,
        );
        self.execute_with_retries(request).instrument(span).await
    }

    async fn execute_with_retries(&self, request: &SearchRequest) -> CallOutcome {
        let payload = match request.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "search request could not be serialized");
                return CallOutcome {
                    response: ApiResponse::NoData,
                    attempts: 0,
                };
            }
        };

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            self.spacing.wait_turn(self.clock.as_ref()).await;
            let signed = self.signer.sign(&payload, self.clock.utc_now());

            let failure = match self.transport.send(&signed).await {
                Ok(resp) if resp.status.is_success() || resp.status.is_redirection() => {
                    debug!(attempt, status = resp.status.as_u16(), bytes = resp.body.len(), "search call answered");
                    return CallOutcome {
                        response: decode_body(&resp.body),
                        attempts: attempt,
                    };
                }
                Ok(resp) => match classify_status(resp.status) {
                    RetryDisposition::Retryable if resp.status == StatusCode::TOO_MANY_REQUESTS => {
                        AttemptFailure::Throttled {
                            retry_after: parse_retry_after(resp.retry_after.as_deref()),
                        }
                    }
                    RetryDisposition::Retryable => AttemptFailure::TransientServer {
                        status: resp.status.as_u16(),
                    },
                    RetryDisposition::NonRetryable => {
                        warn!(attempt, status = resp.status.as_u16(), "search call rejected; not retrying");
                        return CallOutcome {
                            response: ApiResponse::NoData,
                            attempts: attempt,
                        };
                    }
                },
                Err(err) if err.disposition == RetryDisposition::Retryable => {
                    AttemptFailure::Transport(err.message)
                }
                Err(err) => {
                    warn!(attempt, error = %err, "search call failed; not retrying");
                    return CallOutcome {
                        response: ApiResponse::NoData,
                        attempts: attempt,
                    };
                }
            };

            if !self.backoff.has_attempts_left(attempt) {
                warn!(attempts = attempt, error = %failure, "search call exhausted retries; no data");
                return CallOutcome {
                    response: ApiResponse::NoData,
                    attempts: attempt,
                };
            }

            let retry_after = match &failure {
                AttemptFailure::Throttled { retry_after } => *retry_after,
                _ => None,
            };
            let delay = self.backoff.delay_after_attempt(attempt, retry_after) + self.backoff.jitter();
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "search call failed; backing off"
            );
            self.clock.sleep(delay).await;
        }
    }
}

#[async_trait]
impl SearchItems for PaapiClient {
    async fn search_items(&self, request: &SearchRequest) -> ApiResponse {
        self.execute(request).await.response
    }
}

fn decode_body(body: &[u8]) -> ApiResponse {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ApiResponse::Data(JsonValue::Null);
    }
    match serde_json::from_slice(body) {
        Ok(value) => ApiResponse::Data(value),
        Err(err) => {
            warn!(error = %err, "search response body is not json; treating as no data");
            ApiResponse::NoData
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    fn credentials() -> Credentials {
        Credentials {
            access_key: "access-key".into(),
            secret_key: "secret-key".into(),
            region: "eu-west-1".into(),
            partner_tag: "shelf-21".into(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().unwrap()
    }

    fn response(status: u16, body: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: StatusCode::from_u16(status).unwrap(),
            retry_after: None,
            body: body.as_bytes().to_vec(),
        })
    }

    struct ScriptedTransport {
        script: StdMutex<VecDeque<Result<TransportResponse, TransportError>>>,
        fallback: Result<TransportResponse, TransportError>,
        sent: StdMutex<Vec<SignedRequest>>,
    }

    impl ScriptedTransport {
        fn new(
            script: Vec<Result<TransportResponse, TransportError>>,
            fallback: Result<TransportResponse, TransportError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                fallback,
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &SignedRequest) -> Result<TransportResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn client(transport: Arc<ScriptedTransport>, clock: Arc<ManualClock>) -> PaapiClient {
        PaapiClient::with_parts(
            RequestSigner::search_items(&credentials(), DEFAULT_HOST).unwrap(),
            transport,
            clock,
            Duration::from_millis(1600),
            BackoffPolicy {
                max_jitter: Duration::ZERO,
                ..BackoffPolicy::default()
            },
        )
    }

    fn request() -> SearchRequest {
        SearchRequest::new("jouets", "shelf-21", DEFAULT_MARKETPLACE).page(1)
    }

    #[test]
    fn signer_matches_reference_signature() {
        let signer = RequestSigner::search_items(&credentials(), DEFAULT_HOST).unwrap();
        let signed = signer.sign(r#"{"Keywords":"jouets","ItemPage":1}"#, noon());

        assert_eq!(
            signed.payload_sha256,
            "c0a73817612097678b3b8e875bcae94e2bfca954361a4e32830ec80f25a1efe8"
        );
        assert_eq!(
            signed.credential_scope,
            "20261019/eu-west-1/ProductAdvertisingAPI/aws4_request"
        );
        assert_eq!(
            signed.signature,
            "11ad2cab8201d761a750edad1dbe9362dee308b58e9bf7ca11598f4e1975cf6e"
        );
        assert_eq!(
            signed.headers["authorization"],
            "AWS4-HMAC-SHA256 Credential=access-key/20261019/eu-west-1/ProductAdvertisingAPI/aws4_request, \
             SignedHeaders=content-encoding;content-type;host;x-amz-date;x-amz-target, \
             Signature=11ad2cab8201d761a750edad1dbe9362dee308b58e9bf7ca11598f4e1975cf6e"
        );
    }

    #[test]
    fn signatures_are_bound_to_the_signing_instant() {
        let signer = RequestSigner::search_items(&credentials(), DEFAULT_HOST).unwrap();
        let payload = request().to_payload().unwrap();
        let first = signer.sign(&payload, noon());
        let second = signer.sign(&payload, noon() + chrono::Duration::seconds(1));

        assert_ne!(first.signature, second.signature);
        assert_ne!(first.headers["authorization"], second.headers["authorization"]);
        assert_eq!(first.payload_sha256, second.payload_sha256);
    }

    #[test]
    fn signed_request_carries_operation_headers() {
        let signer = RequestSigner::search_items(&credentials(), DEFAULT_HOST).unwrap();
        let signed = signer.sign("{}", noon());

        assert_eq!(signed.url, "https://webservices.amazon.fr/paapi5/searchitems");
        assert_eq!(signed.headers["content-encoding"], "amz-1.0");
        assert_eq!(signed.headers["content-type"], "application/json; charset=utf-8");
        assert_eq!(signed.headers["host"], "webservices.amazon.fr");
        assert_eq!(signed.headers["x-amz-target"], SEARCH_ITEMS_TARGET);
        assert_eq!(signed.headers["x-amz-date"], "20261019T120000Z");
    }

    #[test]
    fn empty_credentials_are_a_configuration_error() {
        let mut creds = credentials();
        creds.secret_key = "  ".into();
        let err = RequestSigner::search_items(&creds, DEFAULT_HOST).unwrap_err();
        assert!(matches!(err, PaapiError::Configuration(_)));
    }

    #[test]
    fn search_payload_omits_unset_bounds() {
        let payload = SearchRequest::new("Gaming", "shelf-21", DEFAULT_MARKETPLACE)
            .page(2)
            .to_payload()
            .unwrap();
        let value: JsonValue = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["Keywords"], "Gaming");
        assert_eq!(value["ItemPage"], 2);
        assert_eq!(value["PartnerType"], "Associates");
        assert_eq!(value["Resources"].as_array().unwrap().len(), 5);
        assert!(value.get("MinPrice").is_none());
        assert!(value.get("ItemCount").is_none());

        let bracket = request().price_range(1, 2000);
        let value: JsonValue = serde_json::from_str(&bracket.to_payload().unwrap()).unwrap();
        assert_eq!(value["MinPrice"], 1);
        assert_eq!(value["MaxPrice"], 2000);
    }

    #[test]
    fn backoff_doubles_and_honors_retry_after() {
        let policy = BackoffPolicy::default();
        let secs = |n| Duration::from_secs(n);

        assert_eq!(policy.delay_after_attempt(1, None), secs(1));
        assert_eq!(policy.delay_after_attempt(2, None), secs(2));
        assert_eq!(policy.delay_after_attempt(5, None), secs(16));
        assert_eq!(policy.delay_after_attempt(1, Some(secs(10))), secs(10));
        assert_eq!(policy.delay_after_attempt(4, Some(secs(3))), secs(8));

        let ignoring = BackoffPolicy {
            honor_retry_after: false,
            ..policy
        };
        assert_eq!(ignoring.delay_after_attempt(1, Some(secs(10))), secs(1));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            assert!(policy.jitter() <= Duration::from_millis(500));
        }
    }

    #[test]
    fn retry_after_accepts_only_delay_seconds() {
        assert_eq!(parse_retry_after(Some(" 7 ")), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn retry_after_is_clamped() {
        assert_eq!(parse_retry_after(Some("60")), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after(Some("86400")), Some(MAX_RETRY_AFTER));
        assert_eq!(
            parse_retry_after(Some("18446744073709551615")),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn persistent_throttling_gives_up_after_six_attempts() {
        let transport = ScriptedTransport::new(vec![], response(429, ""));
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport.clone(), clock.clone()).execute(&request()).await;

        assert_eq!(outcome.response, ApiResponse::NoData);
        assert_eq!(outcome.attempts, 6);
        assert_eq!(transport.calls(), 6);
        assert!(clock.total_slept() >= Duration::from_millis(1600) * 5);
    }

    #[tokio::test]
    async fn server_error_then_success_returns_body_after_two_attempts() {
        let transport = ScriptedTransport::new(
            vec![response(503, ""), response(200, r#"{"SearchResult":{"Items":[]}}"#)],
            response(500, ""),
        );
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport.clone(), clock).execute(&request()).await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.response,
            ApiResponse::Data(serde_json::json!({"SearchResult": {"Items": []}}))
        );
    }

    #[tokio::test]
    async fn retry_after_header_stretches_the_backoff() {
        let throttled = Ok(TransportResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some("5".into()),
            body: Vec::new(),
        });
        let transport = ScriptedTransport::new(vec![throttled, response(200, "{}")], response(500, ""));
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport, clock.clone()).execute(&request()).await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn every_attempt_is_signed_afresh() {
        let transport = ScriptedTransport::new(vec![response(502, "")], response(200, "{}"));
        let clock = Arc::new(ManualClock::new(noon()));
        client(transport.clone(), clock).execute(&request()).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].signature, sent[1].signature);
    }

    #[tokio::test]
    async fn empty_body_is_a_valid_empty_answer() {
        let transport = ScriptedTransport::new(vec![response(200, "")], response(500, ""));
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport, clock).execute(&request()).await;

        assert_eq!(outcome.response, ApiResponse::Data(JsonValue::Null));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![response(400, "{}")], response(200, "{}"));
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport.clone(), clock).execute(&request()).await;

        assert!(outcome.response.is_no_data());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn transport_failures_use_the_same_backoff() {
        let timeout = Err(TransportError {
            message: "operation timed out".into(),
            disposition: RetryDisposition::Retryable,
        });
        let transport = ScriptedTransport::new(vec![timeout], response(200, "{}"));
        let clock = Arc::new(ManualClock::new(noon()));
        let outcome = client(transport, clock.clone()).execute(&request()).await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_millis(600)]);
    }

    #[tokio::test]
    async fn consecutive_calls_are_spaced() {
        let transport = ScriptedTransport::new(vec![], response(200, "{}"));
        let clock = Arc::new(ManualClock::new(noon()));
        let client = client(transport, clock.clone());

        client.execute(&request()).await;
        clock.advance(Duration::from_millis(400));
        client.execute(&request()).await;

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1200)]);
    }
}
