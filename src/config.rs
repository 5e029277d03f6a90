use std::path::PathBuf;
use std::str::FromStr;

/// Server configuration loaded from `CARBOOK_*` environment variables.
///
/// | Env Var                     | Default    |
/// |-----------------------------|------------|
/// | `CARBOOK_BIND`              | `0.0.0.0`  |
/// | `CARBOOK_PORT`              | `5433`     |
/// | `CARBOOK_DATA_DIR`          | `./data`   |
/// | `CARBOOK_PASSWORD`          | `carbook`  |
/// | `CARBOOK_ADMINS`            | (none)     |
/// | `CARBOOK_MAX_CONNECTIONS`   | `256`      |
/// | `CARBOOK_COMPACT_THRESHOLD` | `1000`     |
/// | `CARBOOK_METRICS_PORT`      | (disabled) |
/// | `CARBOOK_TLS_CERT`          | (none)     |
/// | `CARBOOK_TLS_KEY`           | (none)     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login names treated as marketplace admins.
    pub admins: Vec<String>,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let admins = lookup("CARBOOK_ADMINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind: lookup("CARBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "CARBOOK_PORT", 5433)?,
            data_dir: lookup("CARBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("CARBOOK_PASSWORD").unwrap_or_else(|| "carbook".into()),
            admins,
            max_connections: parse_or(&lookup, "CARBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "CARBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "CARBOOK_METRICS_PORT")?,
            tls_cert: lookup("CARBOOK_TLS_CERT"),
            tls_key: lookup("CARBOOK_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carbook.wal")
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }))
        .transpose()
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert!(cfg.admins.is_empty());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/carbook.wal"));
    }

    #[test]
    fn overrides_and_admin_list() {
        let cfg = from_pairs(&[
            ("CARBOOK_PORT", "6000"),
            ("CARBOOK_ADMINS", "alice, bob,,"),
            ("CARBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert!(cfg.is_admin("alice"));
        assert!(cfg.is_admin("bob"));
        assert!(!cfg.is_admin(""));
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = from_pairs(&[("CARBOOK_PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("CARBOOK_PORT"));
    }
}
