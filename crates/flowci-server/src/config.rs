//! Server configuration.
//!
//! Sources are layered in order: built-in defaults, an optional YAML file,
//! then environment variables such as `FLOWCI_DATABASE__URL` or
//! `FLOWCI_SCHEDULER__RETRY_DELAY`.

use ::config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use ::config::builder::DefaultState;
use flowci_db::DatabaseConfig;
use flowci_nats::NatsConfig;
use flowci_scheduler::SchedulerConfig;
use flowci_trace::TracingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENV_PREFIX: &str = "FLOWCI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub scheduler: SchedulerConfig,
    pub tracing: TracingConfig,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&Self::default())?))
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("nats.urls")
            .try_parsing(true)
    }

    /// Copy safe to print: the database password is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.database.url = mask_password(&self.database.url);
        copy
    }
}

fn mask_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let authority = &url[scheme_end + 3..];
    let Some(at) = authority.find('@') else {
        return url.to_string();
    };
    match authority[..at].find(':') {
        Some(colon) => format!(
            "{}{}:****{}",
            &url[..scheme_end + 3],
            &authority[..colon],
            &authority[at..]
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;

    fn from_yaml(yaml: &str) -> ServerConfig {
        ServerConfig::defaults()
            .unwrap()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_survive_layering() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.scheduler.job_queue, "flowci.jobs");
        assert_eq!(config.nats.urls, vec!["nats://localhost:4222"]);
        assert_eq!(config.database.max_connections, 20);
    }

    #[test]
    fn test_yaml_overrides_only_what_it_names() {
        let config = from_yaml(
            r#"
database:
  url: postgres://ci:secret@db:5432/ci
scheduler:
  retry_delay: 5
  agent_root: /agents
tracing:
  json: true
"#,
        );

        assert_eq!(config.database.url, "postgres://ci:secret@db:5432/ci");
        assert_eq!(config.scheduler.retry_delay, Duration::from_secs(5));
        assert_eq!(config.scheduler.agent_root, "/agents");
        assert_eq!(config.scheduler.lock_wait, Duration::from_secs(10));
        assert!(config.tracing.json);
        assert_eq!(config.nats.session_ttl_secs, 15);
    }

    #[test]
    fn test_environment_overrides() {
        let env = HashMap::from([
            ("FLOWCI_NATS__URLS".to_string(), "nats://a:4222,nats://b:4222".to_string()),
            ("FLOWCI_SCHEDULER__CONDITION_TIMEOUT".to_string(), "2".to_string()),
        ]);
        let config: ServerConfig = ServerConfig::defaults()
            .unwrap()
            .add_source(ServerConfig::environment().source(Some(env)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.nats.urls, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(config.scheduler.condition_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut config = ServerConfig::default();
        config.database.url = "postgres://ci:secret@db:5432/ci".to_string();
        assert_eq!(config.redacted().database.url, "postgres://ci:****@db:5432/ci");

        assert_eq!(mask_password("postgres://db/ci"), "postgres://db/ci");
        assert_eq!(mask_password("postgres://ci@db/ci"), "postgres://ci@db/ci");
    }
}
