// ledger-gateway-rs/src/lib.rs
//
// Gateway to the permissioned ledger.
//
// One session is shared by every request handler; it is mutated only during
// (re)connect, which holds the session lock exclusively. Evaluate results go
// through a short-TTL single-flight cache namespaced to the channel. The
// chaincode-name compatibility fallback (primary once, alternate once) lives
// here so callers only deal in canonical names.

pub mod cache;
pub mod diagnostics;
pub mod events;
pub mod http;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use shared_types::config::{
    env_millis, env_opt_string, env_parse, env_path, env_secs, env_string, light_mode,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub use cache::EvaluateCache;
pub use events::{LedgerEvent, LedgerEventKind};
pub use http::HttpLedgerTransport;
pub use transport::{InProcessLedger, LedgerTransport, RawEvent};

/// Errors produced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("not connected to the ledger")]
    NotConnected,

    #[error("identity missing: {0}")]
    IdentityMissing(String),

    #[error("connection profile invalid: {0}")]
    ProfileInvalid(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("chaincode error: {0}")]
    ChaincodeError(String),

    #[error("chaincode function not found: {0}")]
    FunctionNotFound(String),

    #[error("ledger key not found: {0}")]
    NotFound(String),

    #[error("evaluate timed out")]
    EvaluateTimeout,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LedgerError::NotConnected | LedgerError::ChannelUnavailable(_)
        )
    }
}

impl From<LedgerError> for shared_types::CustodyError {
    fn from(e: LedgerError) -> Self {
        use shared_types::ErrorKind;
        let kind = match &e {
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::EvaluateTimeout | LedgerError::Timeout(_) => ErrorKind::Timeout,
            LedgerError::NotConnected | LedgerError::ChannelUnavailable(_) => {
                ErrorKind::DependencyUnavailable
            }
            _ => ErrorKind::LedgerError,
        };
        shared_types::CustodyError::with_source(kind, e.to_string(), e)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub channel: String,
    pub chaincode: String,
    pub gateway_url: String,
    pub profile_path: PathBuf,
    pub profile_fallback: Option<PathBuf>,
    pub wallet_path: PathBuf,
    pub user_id: String,
    pub msp_id: String,
    pub network_timeout: Duration,
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub probe_functions: Vec<String>,
    /// Skip preflight diagnostics and warming.
    pub light_mode: bool,
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self {
            channel: env_string("CHANNEL_NAME", "custody-channel"),
            chaincode: env_string("CHAINCODE_NAME", "medrecords"),
            gateway_url: env_string("LEDGER_GATEWAY_URL", "http://127.0.0.1:7059"),
            profile_path: env_path("CONNECTION_PROFILE_PATH", "config/connection-profile.json"),
            profile_fallback: env_opt_string("CONNECTION_PROFILE_FALLBACK_PATH").map(PathBuf::from),
            wallet_path: env_path("WALLET_PATH", "wallet"),
            user_id: env_string("USER_ID", "admin"),
            msp_id: env_string("MSP_ID", "Org1MSP"),
            network_timeout: env_secs("LEDGER_NETWORK_TIMEOUT", 30),
            cache_ttl: env_millis("LEDGER_CACHE_TTL_MS", 1000),
            max_retries: env_parse("LEDGER_MAX_RETRIES", 6u32),
            probe_functions: vec!["GetContractInfo".to_string(), "ListRecords".to_string()],
            light_mode: light_mode(),
        }
    }

    pub fn for_tests() -> Self {
        Self {
            channel: "test-channel".to_string(),
            chaincode: "medrecords".to_string(),
            gateway_url: "http://127.0.0.1:7059".to_string(),
            profile_path: PathBuf::from("config/connection-profile.json"),
            profile_fallback: None,
            wallet_path: PathBuf::from("wallet"),
            user_id: "admin".to_string(),
            msp_id: "Org1MSP".to_string(),
            network_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(1),
            max_retries: 3,
            probe_functions: vec!["GetContractInfo".to_string()],
            light_mode: true,
        }
    }
}

/// Snapshot returned by [`LedgerGateway::status`].
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub connected: bool,
    pub retries: u32,
    pub max_retries: u32,
    pub channel: String,
    pub chaincode: String,
}

#[derive(Debug)]
struct Session {
    connected: bool,
    retries: u32,
}

pub struct LedgerGateway {
    transport: Arc<dyn LedgerTransport>,
    config: LedgerConfig,
    cache: EvaluateCache,
    session: RwLock<Session>,
    event_pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LedgerGateway {
    /// Run diagnostics, open the session and probe chaincode liveness.
    pub async fn initialize(
        transport: Arc<dyn LedgerTransport>,
        config: LedgerConfig,
    ) -> Result<Arc<Self>, LedgerError> {
        if !config.light_mode {
            diagnostics::preflight(&config).await?;
        }
        let gateway = Arc::new(Self {
            transport,
            cache: EvaluateCache::new(config.cache_ttl),
            session: RwLock::new(Session {
                connected: false,
                retries: 0,
            }),
            event_pump: Mutex::new(None),
            config,
        });
        gateway.reconnect().await?;
        gateway.probe_liveness().await;
        info!(
            channel = %gateway.config.channel,
            chaincode = %gateway.config.chaincode,
            "ledger gateway initialized"
        );
        Ok(gateway)
    }

    /// Try the configured read-only probe functions until one answers.
    /// Unknown-function failures are expected on older chaincode and are
    /// not fatal.
    async fn probe_liveness(&self) {
        for function in &self.config.probe_functions {
            match self.call_evaluate(function, &[]).await {
                Ok(_) => {
                    debug!(function = %function, "chaincode liveness probe ok");
                    return;
                }
                Err(LedgerError::FunctionNotFound(_)) => continue,
                Err(e) => {
                    warn!(function = %function, error = %e, "liveness probe failed (non-fatal)");
                    return;
                }
            }
        }
        warn!("no liveness probe function answered (non-fatal)");
    }

    /// Reconnect with exponential backoff, holding the session lock
    /// exclusively for the duration.
    async fn reconnect(&self) -> Result<(), LedgerError> {
        let mut session = self.session.write().await;
        if session.connected {
            return Ok(());
        }
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build();
        for attempt in 0..self.config.max_retries {
            if self.transport.ping().await {
                session.connected = true;
                session.retries = attempt;
                if attempt > 0 {
                    info!(attempt, "ledger session re-established");
                }
                return Ok(());
            }
            session.retries = attempt + 1;
            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| Duration::from_secs(60));
            warn!(attempt, delay_ms = delay.as_millis() as u64, "ledger unreachable, backing off");
            tokio::time::sleep(delay).await;
        }
        Err(LedgerError::NotConnected)
    }

    async fn mark_disconnected(&self) {
        self.session.write().await.connected = false;
    }

    async fn ensure_session(&self) -> Result<(), LedgerError> {
        if self.session.read().await.connected {
            return Ok(());
        }
        self.reconnect().await
    }

    /// Submit a state-changing transaction. A stale session is
    /// re-established once before the error surfaces.
    pub async fn submit(&self, function: &str, args: &[String]) -> Result<String, LedgerError> {
        self.ensure_session().await?;
        match self.call_submit(function, args).await {
            Err(e) if e.is_connection_error() => {
                self.mark_disconnected().await;
                self.reconnect().await?;
                self.call_submit(function, args).await
            }
            other => other,
        }
    }

    /// Submit the canonical function, falling back to the documented
    /// alternate exactly once if the name is unknown to the chaincode.
    pub async fn submit_with_fallback(
        &self,
        primary: &str,
        alternate: &str,
        args: &[String],
    ) -> Result<String, LedgerError> {
        match self.submit(primary, args).await {
            Err(LedgerError::FunctionNotFound(_)) => {
                warn!(primary, alternate, "falling back to alternate chaincode function");
                self.submit(alternate, args).await
            }
            other => other,
        }
    }

    /// Cached read. Concurrent identical calls coalesce into one upstream
    /// round trip; results live for the configured TTL.
    pub async fn evaluate(&self, function: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        self.ensure_session().await?;
        let key = format!(
            "{}\u{1f}{}",
            self.config.channel,
            EvaluateCache::cache_key(function, args)
        );
        self.cache
            .get_or_fetch(key, || self.call_evaluate(function, args))
            .await
    }

    /// Cached read with the once-only alternate-name fallback.
    pub async fn evaluate_with_fallback(
        &self,
        primary: &str,
        alternate: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError> {
        match self.evaluate(primary, args).await {
            Err(LedgerError::FunctionNotFound(_)) => {
                warn!(primary, alternate, "falling back to alternate chaincode function");
                self.evaluate(alternate, args).await
            }
            other => other,
        }
    }

    async fn call_submit(&self, function: &str, args: &[String]) -> Result<String, LedgerError> {
        tokio::time::timeout(
            self.config.network_timeout,
            self.transport
                .submit(&self.config.channel, &self.config.chaincode, function, args),
        )
        .await
        .map_err(|_| LedgerError::Timeout(format!("submit {function} timed out")))?
    }

    async fn call_evaluate(&self, function: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        tokio::time::timeout(
            self.config.network_timeout,
            self.transport
                .evaluate(&self.config.channel, &self.config.chaincode, function, args),
        )
        .await
        .map_err(|_| LedgerError::EvaluateTimeout)?
    }

    /// Open the normalized event stream. Raw chaincode events are decoded,
    /// case-normalized and forwarded; unknown kinds are dropped with a
    /// warning inside the normalizer.
    pub async fn subscribe_events(&self) -> Result<mpsc::Receiver<LedgerEvent>, LedgerError> {
        let mut raw_rx = self
            .transport
            .open_event_stream(&self.config.channel, &self.config.chaincode)
            .await?;
        let (tx, rx) = mpsc::channel(256);
        let pump = tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                if let Some(event) = events::normalize(&raw) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });
        *self.event_pump.lock().await = Some(pump);
        Ok(rx)
    }

    /// Drop cached CheckAccess results touching a record or user. Called by
    /// the event fan-out so revocations take effect immediately.
    pub fn invalidate_access_cache(&self, fragment: &str) {
        self.cache.invalidate_containing(fragment);
    }

    pub async fn status(&self) -> GatewayStatus {
        let session = self.session.read().await;
        GatewayStatus {
            connected: session.connected,
            retries: session.retries,
            max_retries: self.config.max_retries,
            channel: self.config.channel.clone(),
            chaincode: self.config.chaincode.clone(),
        }
    }

    /// Close the session: stop the event pump, drop the cache, mark
    /// disconnected.
    pub async fn close(&self) {
        if let Some(pump) = self.event_pump.lock().await.take() {
            pump.abort();
        }
        self.cache.clear();
        self.mark_disconnected().await;
        info!("ledger gateway closed");
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn gateway_over(ledger: Arc<InProcessLedger>) -> Arc<LedgerGateway> {
        LedgerGateway::initialize(ledger, LedgerConfig::for_tests())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initialize_connects_and_reports_status() {
        let ledger = InProcessLedger::new();
        let gateway = gateway_over(Arc::clone(&ledger)).await;
        let status = gateway.status().await;
        assert!(status.connected);
        assert_eq!(status.max_retries, 3);
        // The liveness probe consumed one GetContractInfo round trip.
        assert_eq!(ledger.evaluate_count("GetContractInfo"), 1);
    }

    #[tokio::test]
    async fn fifty_concurrent_evaluates_one_round_trip() {
        let ledger = InProcessLedger::new();
        let gateway = gateway_over(Arc::clone(&ledger)).await;
        let baseline = ledger.evaluate_count("GetContractInfo");
        ledger.set_latency(Duration::from_millis(30)).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway.evaluate("GetContractInfo", &[]).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(ledger.evaluate_count("GetContractInfo") - baseline, 1);
    }

    #[tokio::test]
    async fn submit_fallback_is_tried_once() {
        let ledger = InProcessLedger::new();
        ledger.disable_function("CreateMedicalRecord");
        let gateway = gateway_over(Arc::clone(&ledger)).await;
        let payload = json!({"record_id": "r1", "creator_id": "d1"}).to_string();
        let tx = gateway
            .submit_with_fallback("CreateMedicalRecord", "CreateRecord", &[payload])
            .await
            .unwrap();
        assert!(tx.starts_with("tx-"));
        assert_eq!(ledger.submit_count("CreateRecord"), 1);
    }

    #[tokio::test]
    async fn events_flow_normalized() {
        let ledger = InProcessLedger::new();
        let gateway = gateway_over(Arc::clone(&ledger)).await;
        let mut events = gateway.subscribe_events().await.unwrap();

        gateway
            .submit(
                "CreateMedicalRecord",
                &[json!({"record_id": "r7", "patient_id": "p7", "creator_id": "d7"}).to_string()],
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, LedgerEventKind::RecordCreated);
        // The in-process ledger emits camelCase fields; normalization folds
        // them back to canonical names.
        assert_eq!(event.record_id.as_deref(), Some("r7"));
        assert_eq!(event.patient_id.as_deref(), Some("p7"));
        gateway.close().await;
    }

    #[tokio::test]
    async fn cache_invalidation_forces_refetch() {
        let ledger = InProcessLedger::new();
        let gateway = gateway_over(Arc::clone(&ledger)).await;
        gateway
            .submit(
                "CreateMedicalRecord",
                &[json!({"record_id": "r1", "creator_id": "d1"}).to_string()],
            )
            .await
            .unwrap();

        let args = vec!["r1".to_string(), "d1".to_string()];
        gateway.evaluate("CheckAccess", &args).await.unwrap();
        gateway.evaluate("CheckAccess", &args).await.unwrap();
        assert_eq!(ledger.evaluate_count("CheckAccess"), 1);

        gateway.invalidate_access_cache("r1");
        gateway.evaluate("CheckAccess", &args).await.unwrap();
        assert_eq!(ledger.evaluate_count("CheckAccess"), 2);
    }
}
