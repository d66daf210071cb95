mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LogSettings, LookupSettings, ServerSettings, Settings};

/// Loads the configuration from `path` (or the optional `config/default`
/// file) and `MQD_`-prefixed environment variables, merged over defaults.
///
/// Nested keys use a double underscore: `MQD_BROKER__MEM_QUEUE_SIZE=100`.
pub fn load_config(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(p) => File::with_name(p).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix("MQD")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("lookup.addresses"),
    );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: match partial.broker {
            Some(b) => b.merge(default.broker),
            None => default.broker,
        },
        lookup: LookupSettings {
            addresses: partial
                .lookup
                .as_ref()
                .and_then(|l| l.addresses.clone())
                .unwrap_or(default.lookup.addresses),
            announce_interval_ms: partial
                .lookup
                .as_ref()
                .and_then(|l| l.announce_interval_ms)
                .unwrap_or(default.lookup.announce_interval_ms),
        },
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    })
}

#[cfg(test)]
mod tests;
