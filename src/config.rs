//! Configuration management for the Halberd engine

use crate::browser::BrowserType;
use crate::error::{HalberdError, Result};
use crate::models::{BrowserAllocation, EngineConfig};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// File-based configuration, every section optional
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    proxy: Option<ProxySection>,
    cache: Option<CacheSection>,
    browsers: Option<BrowsersSection>,
    scan: Option<ScanSection>,
    payloads: Option<PayloadsSection>,
}

#[derive(Debug, Deserialize)]
struct ProxySection {
    port: Option<u16>,
    global_headers: Option<Vec<String>>,
    instance_headers: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CacheSection {
    enabled: Option<bool>,
    ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BrowsersSection {
    default: Option<String>,
    user_agent: Option<String>,
    acquire_timeout_ms: Option<u64>,
    /// Instances per browser type, e.g. `pools = { http = 4, chrome = 1 }`
    pools: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Deserialize)]
struct ScanSection {
    page_load_timeout_ms: Option<u64>,
    session_wait_ms: Option<u64>,
    plugins_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PayloadsSection {
    dir: Option<PathBuf>,
}

/// Loads configuration from a TOML file and merges it over the defaults
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(HalberdError::IoError)?;
    parse_config(&content)
}

/// Parses TOML configuration text and merges it over the defaults
pub fn parse_config(content: &str) -> Result<EngineConfig> {
    let file_config: FileConfig = toml::from_str(content)?;
    let mut config = EngineConfig::default();

    if let Some(proxy) = file_config.proxy {
        if let Some(port) = proxy.port {
            config.proxy_port = port;
        }
        if let Some(headers) = proxy.global_headers {
            config.global_headers = headers;
        }
        if let Some(block) = proxy.instance_headers {
            config.instance_headers = block;
        }
    }

    if let Some(cache) = file_config.cache {
        if let Some(enabled) = cache.enabled {
            config.cache_enabled = enabled;
        }
        if let Some(ttl) = cache.ttl_secs {
            config.cache_ttl_secs = ttl;
        }
    }

    if let Some(browsers) = file_config.browsers {
        if let Some(default) = browsers.default {
            config.default_browser = default.parse()?;
        }
        if let Some(ua) = browsers.user_agent {
            config.user_agent = ua;
        }
        if let Some(timeout) = browsers.acquire_timeout_ms {
            config.acquire_timeout_ms = timeout;
        }
        if let Some(pools) = browsers.pools {
            config.browsers = pools
                .into_iter()
                .map(|(name, count)| -> Result<BrowserAllocation> {
                    Ok(BrowserAllocation {
                        browser_type: name.parse()?,
                        count,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
    }

    if let Some(scan) = file_config.scan {
        if let Some(timeout) = scan.page_load_timeout_ms {
            config.page_load_timeout_ms = timeout;
        }
        if let Some(wait) = scan.session_wait_ms {
            config.session_wait_ms = wait;
        }
        if let Some(file) = scan.plugins_file {
            config.plugins_file = Some(file);
        }
    }

    if let Some(dir) = file_config.payloads.and_then(|p| p.dir) {
        config.payload_dir = dir;
    }

    if !config
        .browsers
        .iter()
        .any(|b| b.browser_type == config.default_browser && b.count > 0)
    {
        return Err(HalberdError::ConfigError(format!(
            "No browsers provisioned for the default browser type {}",
            config.default_browser
        )));
    }

    Ok(config)
}

/// Merges CLI arguments into an existing EngineConfig
#[allow(clippy::too_many_arguments)]
pub fn merge_cli_args(
    config: &mut EngineConfig,
    proxy_port: Option<u16>,
    browsers: Option<usize>,
    browser_type: Option<BrowserType>,
    payload_dir: Option<PathBuf>,
    plugins_file: Option<PathBuf>,
    headers: Option<Vec<String>>,
    no_cache: bool,
) {
    if let Some(port) = proxy_port {
        config.proxy_port = port;
    }
    if let Some(browser_type) = browser_type {
        config.default_browser = browser_type;
        if !config.browsers.iter().any(|b| b.browser_type == browser_type) {
            config.browsers.push(BrowserAllocation {
                browser_type,
                count: browsers.unwrap_or(1),
            });
        }
    }
    if let Some(count) = browsers {
        let default = config.default_browser;
        for allocation in config
            .browsers
            .iter_mut()
            .filter(|b| b.browser_type == default)
        {
            allocation.count = count;
        }
    }
    if let Some(dir) = payload_dir {
        config.payload_dir = dir;
    }
    if let Some(file) = plugins_file {
        config.plugins_file = Some(file);
    }
    if let Some(h) = headers {
        config.global_headers.extend(h);
    }
    if no_cache {
        config.cache_enabled = false;
    }
}

/// Parses a `name,true|false` plugin activation list into the enabled set.
///
/// Blank lines and `#` / `;` comments are ignored; malformed lines are
/// skipped with a warning.
pub fn parse_active_plugins(content: &str) -> HashSet<String> {
    let mut enabled = HashSet::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((name, flag)) = line.split_once(',') else {
            warn!("Ignoring malformed plugin line {}: '{line}'", number + 1);
            continue;
        };
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            warn!("Ignoring plugin line {} without a name", number + 1);
            continue;
        }
        match flag.trim().to_lowercase().as_str() {
            "true" => {
                enabled.insert(name);
            }
            "false" => {
                enabled.remove(&name);
            }
            other => warn!("Ignoring plugin '{name}' with flag '{other}'"),
        }
    }
    enabled
}

/// Reads a plugin activation list from disk
pub fn load_active_plugins(path: &Path) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_active_plugins(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config.proxy_port, EngineConfig::default().proxy_port);
        assert!(config.cache_active());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse_config(
            r#"
[proxy]
port = 9999
global_headers = ["X-Scan: 1"]
instance_headers = "X-A: 1\nX-B: 2"

[cache]
ttl_secs = 0

[browsers]
default = "chrome"
pools = { chrome = 2, http = 1 }

[scan]
session_wait_ms = 100

[payloads]
dir = "/tmp/payloads"
"#,
        )
        .unwrap();
        assert_eq!(config.proxy_port, 9999);
        assert_eq!(config.global_headers, vec!["X-Scan: 1"]);
        assert!(!config.cache_active());
        assert_eq!(config.default_browser, BrowserType::Chrome);
        assert_eq!(config.browsers.len(), 2);
        assert_eq!(config.session_wait_ms, 100);
        assert_eq!(config.payload_dir, PathBuf::from("/tmp/payloads"));
    }

    #[test]
    fn test_default_browser_must_be_provisioned() {
        let err = parse_config("[browsers]\ndefault = \"firefox\"\n").unwrap_err();
        assert!(matches!(err, HalberdError::ConfigError(_)));
        assert!(parse_config("[browsers]\npools = { lynx = 1 }\n").is_err());
    }

    #[test]
    fn test_parse_active_plugins() {
        let enabled = parse_active_plugins(
            "# plugins\nxss,true\nSQLI , TRUE\nheaders,false\n; off\nbroken line\ncookies,maybe\n\n",
        );
        assert_eq!(enabled.len(), 2);
        assert!(enabled.contains("xss"));
        assert!(enabled.contains("sqli"));
        assert!(!enabled.contains("headers"));
        assert!(!enabled.contains("cookies"));
    }

    #[test]
    fn test_later_line_wins() {
        let enabled = parse_active_plugins("xss,true\nxss,false\n");
        assert!(enabled.is_empty());
    }

    #[test]
    fn test_merge_cli_args() {
        let mut config = EngineConfig::default();
        merge_cli_args(
            &mut config,
            Some(0),
            Some(2),
            None,
            Some(PathBuf::from("p")),
            None,
            Some(vec!["X-Test: 1".to_string()]),
            true,
        );
        assert_eq!(config.proxy_port, 0);
        assert_eq!(config.browsers[0].count, 2);
        assert_eq!(config.payload_dir, PathBuf::from("p"));
        assert_eq!(config.global_headers.len(), 1);
        assert!(!config.cache_active());
    }

    #[test]
    fn test_load_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("halberd.toml");
        std::fs::write(&config_path, "[cache]\nenabled = false\n").unwrap();
        assert!(!load_config(&config_path).unwrap().cache_enabled);

        let plugins_path = dir.path().join("plugins.txt");
        std::fs::write(&plugins_path, "errors,true\n").unwrap();
        assert!(load_active_plugins(&plugins_path).unwrap().contains("errors"));
    }
}
