use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::dispatcher::DispatcherConfig;
use crate::retry::RetryPolicy;

/// Marketplace webhook delivery service
#[derive(Parser, Debug, Clone)]
#[command(name = "marketplace-webhooks")]
#[command(version)]
#[command(about = "Webhook subscriptions, fan-out and retrying delivery", long_about = None)]
pub struct Settings {
    /// Address the management API listens on
    #[arg(long, env = "WEBHOOKS_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Postgres connection string; in-memory storage when absent
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Delivery workers (defaults to available parallelism)
    #[arg(long, env = "WEBHOOKS_WORKERS")]
    pub workers: Option<usize>,

    /// Capacity of the ready queue in front of the workers
    #[arg(long, env = "WEBHOOKS_QUEUE_SIZE", default_value_t = 1024)]
    pub queue_size: usize,

    /// Longest the scheduler sleeps between scans, in milliseconds
    #[arg(long, env = "WEBHOOKS_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Backoff base: the delay after failed attempt N is base * 2^N
    #[arg(long, env = "WEBHOOKS_RETRY_BASE_SECS", default_value_t = 60)]
    pub retry_base_secs: u64,

    /// Upper bound on a single backoff delay
    #[arg(long, env = "WEBHOOKS_RETRY_MAX_SECS", default_value_t = 86_400)]
    pub retry_max_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Settings {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            worker_count: self.workers.unwrap_or(defaults.worker_count).max(1),
            queue_size: self.queue_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            retry: RetryPolicy::new(
                Duration::from_secs(self.retry_base_secs),
                Duration::from_secs(self.retry_max_secs),
            ),
            ..defaults
        }
    }
}
