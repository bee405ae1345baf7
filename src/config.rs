use std::io;
use std::path::PathBuf;

/// Server settings, read from `MEDSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "medslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys fall back to defaults;
    /// set-but-unparseable numeric keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            bind: lookup("MEDSLOT_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "MEDSLOT_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("MEDSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("MEDSLOT_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "MEDSLOT_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "MEDSLOT_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "MEDSLOT_METRICS_PORT")?,
            tls_cert: lookup("MEDSLOT_TLS_CERT"),
            tls_key: lookup("MEDSLOT_TLS_KEY"),
        };
        if config.max_connections == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "MEDSLOT_MAX_CONNECTIONS must be at least 1",
            ));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{key}: cannot parse {raw:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MEDSLOT_PORT", "6543"),
            ("MEDSLOT_BIND", "127.0.0.1"),
            ("MEDSLOT_DATA_DIR", "/var/lib/medslot"),
            ("MEDSLOT_COMPACT_THRESHOLD", "50"),
            ("MEDSLOT_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/medslot"));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("MEDSLOT_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("MEDSLOT_PORT"));
    }

    #[test]
    fn zero_connections_rejected() {
        let result = Config::from_lookup(lookup_from(&[("MEDSLOT_MAX_CONNECTIONS", "0")]));
        assert!(result.is_err());
    }
}
