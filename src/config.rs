// Single configuration value assembled once at startup and passed to every
// constructor explicitly (Design Notes §9 — no ad-hoc environment reads
// scattered through the orchestrator).

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub production: bool,

    pub ledger_rpc_url: String,
    pub oracle_signing_key: Option<[u8; 32]>,
    pub ledger_poll_interval: Duration,
    pub ledger_cursor_path: String,
    pub ledger_rpc_timeout: Duration,

    pub gnss_endpoint: String,
    pub gnss_timeout: Duration,

    pub event_provider_urls: Vec<String>,
    pub event_provider_timeout: Duration,
    pub event_search_radius_km: f64,

    pub llm_endpoints: Vec<String>,
    pub llm_timeout: Duration,
    pub consensus_quorum_floor: usize,

    pub fulfiller_base_urls: Vec<(u8, String)>,
    pub fulfiller_dispatch_timeout: Duration,

    pub delivery_timeout: Duration,
    pub token_secret: [u8; 32],
    pub token_lifetime: Duration,
    pub webhook_shared_secret: String,
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        let oracle_signing_key = std::env::var("ORACLE_SIGNING_KEY").ok().and_then(|hex| {
            let bytes = hex_decode(&hex)?;
            <[u8; 32]>::try_from(bytes.as_slice()).ok()
        });

        let token_secret = std::env::var("TOKEN_SECRET")
            .ok()
            .and_then(|hex| hex_decode(&hex))
            .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
            .unwrap_or([0u8; 32]);

        let fulfiller_base_urls = env_csv("FULFILLER_BASE_URLS")
            .into_iter()
            .filter_map(|entry| {
                let (class, url) = entry.split_once('=')?;
                Some((class.trim().parse().ok()?, url.trim().to_string()))
            })
            .collect();

        Self {
            port: std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080),
            production: std::env::var("ENVIRONMENT").map(|v| v == "production").unwrap_or(false),

            ledger_rpc_url: std::env::var("LEDGER_RPC_URL")
                .unwrap_or_else(|_| "http://localhost:9090".into()),
            oracle_signing_key,
            ledger_poll_interval: env_duration_secs("LEDGER_POLL_INTERVAL_SECS", 10),
            ledger_cursor_path: std::env::var("LEDGER_CURSOR_PATH")
                .unwrap_or_else(|_| "ledger_cursor.txt".into()),
            ledger_rpc_timeout: env_duration_secs("LEDGER_RPC_TIMEOUT_SECS", 20),

            gnss_endpoint: std::env::var("GNSS_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:9091".into()),
            gnss_timeout: env_duration_secs("GNSS_TIMEOUT_SECS", 15),

            event_provider_urls: env_csv("EVENT_PROVIDER_URLS"),
            event_provider_timeout: env_duration_secs("EVENT_PROVIDER_TIMEOUT_SECS", 10),
            event_search_radius_km: std::env::var("EVENT_SEARCH_RADIUS_KM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100.0),

            llm_endpoints: env_csv("LLM_ENDPOINTS"),
            llm_timeout: env_duration_secs("LLM_TIMEOUT_SECS", 30),
            consensus_quorum_floor: std::env::var("CONSENSUS_QUORUM_FLOOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),

            fulfiller_base_urls,
            fulfiller_dispatch_timeout: env_duration_secs("FULFILLER_DISPATCH_TIMEOUT_SECS", 15),

            delivery_timeout: env_duration_secs("DELIVERY_TIMEOUT_SECS", 24 * 3600),
            token_secret,
            token_lifetime: env_duration_secs("TOKEN_LIFETIME_SECS", 24 * 3600),
            webhook_shared_secret: std::env::var("WEBHOOK_SHARED_SECRET").unwrap_or_default(),
        }
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    crate::digest::hex_decode(s)
}
