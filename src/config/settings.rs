use serde::Deserialize;

/// Top-level configuration for the daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub lookup: LookupSettings,
    pub log: LogSettings,
}

/// Address the client listener binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Queueing, delivery and flow-control limits for topics and channels.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Messages kept in memory per topic and per channel before spilling to disk.
    pub mem_queue_size: usize,
    /// Directory of the overflow store. `None` opens a temporary store.
    pub data_path: Option<String>,
    pub msg_timeout_ms: u64,
    pub max_msg_size: usize,
    pub max_ready_count: u64,
    pub max_requeue_delay_ms: u64,
    pub sweep_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

/// Discovery peers the daemon announces its topics and channels to.
#[derive(Debug, Deserialize, Clone)]
pub struct LookupSettings {
    pub addresses: Vec<String>,
    pub announce_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub lookup: Option<PartialLookupSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub mem_queue_size: Option<usize>,
    pub data_path: Option<String>,
    pub msg_timeout_ms: Option<u64>,
    pub max_msg_size: Option<usize>,
    pub max_ready_count: Option<u64>,
    pub max_requeue_delay_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLookupSettings {
    pub addresses: Option<Vec<String>>,
    pub announce_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialBrokerSettings {
    pub fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            mem_queue_size: self.mem_queue_size.unwrap_or(default.mem_queue_size),
            data_path: self.data_path.or(default.data_path),
            msg_timeout_ms: self.msg_timeout_ms.unwrap_or(default.msg_timeout_ms),
            max_msg_size: self.max_msg_size.unwrap_or(default.max_msg_size),
            max_ready_count: self.max_ready_count.unwrap_or(default.max_ready_count),
            max_requeue_delay_ms: self
                .max_requeue_delay_ms
                .unwrap_or(default.max_requeue_delay_ms),
            sweep_interval_ms: self.sweep_interval_ms.unwrap_or(default.sweep_interval_ms),
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(default.heartbeat_interval_ms),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 5150,
            },
            broker: BrokerSettings::default(),
            lookup: LookupSettings {
                addresses: Vec::new(),
                announce_interval_ms: 15_000,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            mem_queue_size: 10_000,
            data_path: None,
            msg_timeout_ms: 60_000,
            max_msg_size: 1024 * 1024,
            max_ready_count: 2500,
            max_requeue_delay_ms: 60 * 60 * 1000,
            sweep_interval_ms: 100,
            heartbeat_interval_ms: 30_000,
        }
    }
}
