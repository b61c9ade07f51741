use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Value},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SyncError;

/// Address tag used when a binding has no dedicated entry, and by the poll
/// controller.
pub const DEFAULT_TAG: &str = "default";

/// The remote API's rate limit does not allow mutations closer together.
pub const MIN_MUTATION_DELAY: Duration = Duration::from_millis(200);

pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full resync from swarm services on a fixed interval.
    Poll,
    /// Incremental updates from container start/kill events.
    Events,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mode: Mode,
    /// Seconds between poll cycles.
    pub poll_interval: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// TOML file holding the `[main]` address tag → load balancer table.
    pub elb_config: PathBuf,
    pub mutation_delay_ms: u64,
    /// Seconds to wait before re-subscribing to a dropped event stream.
    pub reconnect_delay: u64,
    /// Address tag → load balancer name.
    pub main: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Poll,
            poll_interval: 3,
            workers: 2,
            queue_capacity: 64,
            debug: false,
            region: None,
            elb_config: PathBuf::from("/var/lib/docker/swarm/config.toml"),
            mutation_delay_ms: 200,
            reconnect_delay: 2,
            main: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let base = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("elbsync.toml"))
            .merge(Env::prefixed("ELBSYNC_"))
            .merge(Env::raw().only(&["elb_config"]));

        let mapping_file: PathBuf = base
            .extract_inner("elb_config")
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let merged = base.merge(Toml::file(&mapping_file));
        check_address_tags(&merged)?;
        let config: Config = merged
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn mutation_delay(&self) -> Duration {
        Duration::from_millis(self.mutation_delay_ms).max(MIN_MUTATION_DELAY)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay).max(MIN_RECONNECT_DELAY)
    }

    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Load balancer targeted by the poll controller.
    pub fn default_load_balancer(&self) -> Result<&str, SyncError> {
        self.load_balancer_for(None)
    }

    /// Resolves a binding's host address to a load balancer name, falling
    /// back to the `default` tag.
    pub fn load_balancer_for(&self, host_ip: Option<&str>) -> Result<&str, SyncError> {
        host_ip
            .and_then(|ip| self.main.get(ip))
            .or_else(|| self.main.get(DEFAULT_TAG))
            .map(String::as_str)
            .ok_or_else(|| SyncError::UnknownLoadBalancer(host_ip.unwrap_or(DEFAULT_TAG).into()))
    }
}

/// A bare `0.0.0.0 = "elb"` is a dotted key in TOML and becomes nested
/// tables, so address tags in `[main]` must be quoted.
fn check_address_tags(figment: &Figment) -> anyhow::Result<()> {
    let Ok(main) = figment.extract_inner::<Dict>("main") else {
        return Ok(());
    };
    if let Some((tag, _)) = main.iter().find(|(_, v)| matches!(v, Value::Dict(..))) {
        anyhow::bail!(
            "Failed to load configuration: [main] entry {:?} is a table; \
             address tag keys must be quoted, e.g. \"10.0.0.5\" = \"my-elb\"",
            tag
        );
    }
    Ok(())
}
