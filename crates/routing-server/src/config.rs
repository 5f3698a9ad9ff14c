use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default upstream for OpenAI-compatible providers.
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// HTTP server for model registration, recommendation and routing.
#[derive(Debug, Clone, Parser)]
#[command(name = "routing-server", version, about)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, env = "ROUTING_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// JSON document holding the model registry.
    #[arg(long, env = "ROUTING_STORE_PATH", default_value = "models.json")]
    pub store_path: PathBuf,

    /// Optional TOML file with breaker, tracker, scoring and recommendation settings.
    #[arg(long, env = "ROUTING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Optional TOML template catalog; the built-in catalog is used otherwise.
    #[arg(long, env = "ROUTING_TEMPLATES")]
    pub templates: Option<PathBuf>,

    /// Snapshot-eviction and ledger-compaction period. Overrides the config file
    /// and `ROUTING_SWEEP_INTERVAL_SECS`.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Timeout for a single provider call made through `/route`.
    #[arg(long, env = "ROUTING_CALL_TIMEOUT_SECS", default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Provider names served by the OpenAI-compatible adapter.
    #[arg(
        long,
        env = "ROUTING_OPENAI_PROVIDERS",
        value_delimiter = ',',
        default_value = "openai"
    )]
    pub openai_providers: Vec<String>,

    /// Base URL used when a model has no `endpoint` of its own.
    #[arg(long, env = "ROUTING_OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,
}

impl ServerArgs {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}
