use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Bot API token for the messaging provider. Without it the service
    /// still serves reads, but sending and the scheduler are disabled.
    pub bot_token: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_due_batch_limit")]
    pub due_batch_limit: i64,

    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,

    #[serde(default = "default_sends_per_second")]
    pub sends_per_second: u32,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Cap on delivery attempts for a scheduled message. Unset preserves
    /// the retry-every-cycle behavior for messages where every recipient
    /// failed.
    pub max_attempts: Option<i64>,

    #[serde(default = "default_claim_stale_secs")]
    pub claim_stale_secs: i64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_due_batch_limit() -> i64 {
    10
}

fn default_send_batch_size() -> usize {
    10
}

fn default_sends_per_second() -> u32 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_claim_stale_secs() -> i64 {
    600
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("COURIER_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("courier.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bot_token: None,
            listen_addr: default_listen_addr(),
            poll_interval_secs: default_poll_interval_secs(),
            due_batch_limit: default_due_batch_limit(),
            send_batch_size: default_send_batch_size(),
            sends_per_second: default_sends_per_second(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_attempts: None,
            claim_stale_secs: default_claim_stale_secs(),
        }
    }
}
