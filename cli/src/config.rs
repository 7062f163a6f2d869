use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use lipc::ClientConfig;

use crate::cli::CommonArgs;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Namespace directory holding the endpoint sockets
    pub namespace: Option<PathBuf>,
    /// Per-call timeout in seconds, 0 waits forever
    pub timeout: Option<f64>,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &CommonArgs) -> Result<ClientConfig> {
    let mut builder = ClientConfig::builder();

    if let Some(dir) = cli.namespace.as_ref().or(file.namespace.as_ref()) {
        builder = builder.namespace_dir(dir);
    }

    if let Some(seconds) = cli.timeout.or(file.timeout) {
        builder = builder.timeout(parse_timeout(seconds)?);
    }

    Ok(builder.build())
}

fn parse_timeout(seconds: f64) -> Result<Option<Duration>> {
    if seconds == 0.0 {
        return Ok(None);
    }
    let timeout = Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("invalid timeout: {seconds}"))?;
    Ok(Some(timeout))
}

/// Parse a command-line value as JSON, keeping bare words as strings
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Collect `KEY=VALUE` pairs into keyword arguments
pub fn parse_kwargs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut kwargs = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("invalid keyword argument (expected KEY=VALUE): {}", pair);
        };
        if key.is_empty() {
            anyhow::bail!("invalid keyword argument (empty key): {}", pair);
        }
        kwargs.insert(key.to_string(), parse_value(value));
    }
    Ok(kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn common(namespace: Option<&str>, timeout: Option<f64>) -> CommonArgs {
        CommonArgs {
            namespace: namespace.map(PathBuf::from),
            timeout,
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = toml::from_str("namespace = \"/run/lipc\"\ntimeout = 5\n").unwrap();
        let config = merge_config(file, &common(Some("/srv/lipc"), None)).unwrap();
        assert_eq!(config.namespace().dir(), Path::new("/srv/lipc"));
        assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = merge_config(FileConfig::default(), &common(Some("/tmp"), Some(0.0))).unwrap();
        assert_eq!(config.timeout(), None);

        assert!(merge_config(FileConfig::default(), &common(None, Some(-1.0))).is_err());
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_value("3"), json!(3));
        assert_eq!(parse_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn test_parse_kwargs() {
        let kwargs = parse_kwargs(&["factor=3".to_string(), "label=x=y".to_string()]).unwrap();
        assert_eq!(kwargs.get("factor"), Some(&json!(3)));
        assert_eq!(kwargs.get("label"), Some(&json!("x=y")));

        assert!(parse_kwargs(&["novalue".to_string()]).is_err());
        assert!(parse_kwargs(&["=1".to_string()]).is_err());
    }
}
