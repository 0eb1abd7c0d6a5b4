//! Configuration resolver
//!
//! Turns layered configuration sources into one immutable
//! [`RuntimeConfiguration`]. Precedence, highest first: explicit builder
//! overrides, `FLOWTEST_*` environment variables, a discovered (or
//! explicitly named) `flowtest.yaml`, built-in defaults. Values that still
//! look like unresolved template placeholders (`${...}`) are treated as
//! absent. Resolution fails fast — before any container or remote
//! connection is attempted — naming the files it considered.

use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Name of the discovered project configuration file.
const CONFIG_FILE_NAME: &str = "flowtest.yaml";

/// Environment-variable prefix; `FLOWTEST_ENGINE_IMAGE` maps to the
/// `engine-image` key.
const ENV_PREFIX: &str = "FLOWTEST_";

/// How many directory levels the file discovery walks up from its root.
const DISCOVERY_DEPTH: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeMode {
    /// The harness starts and owns the engine container.
    Managed,
    /// The harness attaches to an engine it does not control.
    Remote,
}

impl std::fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeMode::Managed => write!(f, "managed"),
            RuntimeMode::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthMethod {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

/// Immutable configuration record, created once per test run.
#[derive(Clone, Debug)]
pub struct RuntimeConfiguration {
    pub mode: RuntimeMode,
    pub engine_image: String,
    pub engine_version: String,
    /// Container-internal gateway port (managed mode).
    pub gateway_port: u16,
    /// Container-internal management/monitoring port (managed mode).
    pub management_port: u16,
    pub remote_gateway_address: Option<String>,
    /// Derived from the gateway address + management port when not given.
    pub remote_management_address: Option<String>,
    pub auth: AuthMethod,
    pub flush_on_start: bool,
    /// Bound for each readiness gate during managed startup.
    pub startup_timeout: Duration,
    /// Bound for the whole managed startup wait strategy.
    pub total_startup_timeout: Duration,
    /// Defaults threaded into every verification's poll settings.
    pub assertion_timeout: Duration,
    pub assertion_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {} does not exist", .path.display())]
    ExplicitFileMissing { path: PathBuf },

    #[error("failed to parse {}: {source}", .path.display())]
    Unparsable {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("remote mode requires a gateway address; configuration considered: {considered:?}")]
    MissingRemoteAddress { considered: Vec<PathBuf> },

    #[error("invalid value {value:?} for key {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Builder over the configuration layers.
#[derive(Default)]
pub struct ConfigResolver {
    explicit_file: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
    search_root: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of discovery. Resolution fails if it is
    /// missing — an explicitly named file is a hard requirement.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    /// Highest-precedence override for one key.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Start file discovery from this directory instead of the CWD.
    pub fn search_from(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_root = Some(dir.into());
        self
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<RuntimeConfiguration, ConfigError> {
        let env: BTreeMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        self.resolve_with_env(&env)
    }

    /// Resolve with an explicit environment map (tests inject one here).
    pub fn resolve_with_env(
        &self,
        env: &BTreeMap<String, String>,
    ) -> Result<RuntimeConfiguration, ConfigError> {
        let mut considered = Vec::new();
        let file_values = self.load_file_layer(&mut considered)?;

        let lookup = |key: &str| -> Option<String> {
            let layers = [
                self.overrides.get(key).cloned(),
                env.get(&env_key(key)).cloned(),
                file_values.get(key).cloned(),
            ];
            layers
                .into_iter()
                .flatten()
                .find(|value| !is_placeholder(value))
        };

        let mode = match lookup("mode").as_deref() {
            None | Some("managed") => RuntimeMode::Managed,
            Some("remote") => RuntimeMode::Remote,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "mode".into(),
                    value: other.into(),
                    reason: "expected \"managed\" or \"remote\"".into(),
                })
            }
        };

        let gateway_port = parse_port("gateway-port", lookup("gateway-port"), 8080)?;
        let management_port = parse_port("management-port", lookup("management-port"), 9600)?;

        let remote_gateway_address = lookup("remote-gateway-address");
        if mode == RuntimeMode::Remote && remote_gateway_address.is_none() {
            return Err(ConfigError::MissingRemoteAddress { considered });
        }
        let remote_management_address = lookup("remote-management-address").or_else(|| {
            remote_gateway_address
                .as_deref()
                .and_then(|gw| derive_management_address(gw, management_port))
        });

        let auth = match lookup("auth-method").as_deref() {
            None | Some("none") => AuthMethod::None,
            Some("basic") => AuthMethod::Basic {
                username: lookup("username").unwrap_or_default(),
                password: lookup("password").unwrap_or_default(),
            },
            Some("bearer") => AuthMethod::Bearer {
                token: lookup("token").unwrap_or_default(),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "auth-method".into(),
                    value: other.into(),
                    reason: "expected \"none\", \"basic\" or \"bearer\"".into(),
                })
            }
        };

        let config = RuntimeConfiguration {
            mode,
            engine_image: lookup("engine-image").unwrap_or_else(|| "process-engine".into()),
            engine_version: lookup("engine-version").unwrap_or_else(|| "latest".into()),
            gateway_port,
            management_port,
            remote_gateway_address,
            remote_management_address,
            auth,
            flush_on_start: parse_bool("flush-on-start", lookup("flush-on-start"))?,
            startup_timeout: parse_seconds("startup-timeout-seconds", lookup("startup-timeout-seconds"), 60)?,
            total_startup_timeout: parse_seconds(
                "total-startup-timeout-seconds",
                lookup("total-startup-timeout-seconds"),
                120,
            )?,
            assertion_timeout: parse_seconds("assertion-timeout-seconds", lookup("assertion-timeout-seconds"), 10)?,
            assertion_interval: Duration::from_millis(100),
        };
        info!(mode = %config.mode, image = %config.engine_image, "configuration resolved");
        Ok(config)
    }

    fn load_file_layer(
        &self,
        considered: &mut Vec<PathBuf>,
    ) -> Result<BTreeMap<String, String>, ConfigError> {
        let path = match &self.explicit_file {
            Some(path) => {
                considered.push(path.clone());
                if !path.exists() {
                    return Err(ConfigError::ExplicitFileMissing { path: path.clone() });
                }
                Some(path.clone())
            }
            None => self.discover(considered),
        };
        let Some(path) = path else {
            return Ok(BTreeMap::new());
        };
        let content = std::fs::read_to_string(&path).map_err(|_| ConfigError::ExplicitFileMissing {
            path: path.clone(),
        })?;
        let parsed: BTreeMap<String, YamlValue> = serde_yaml::from_str(&content)
            .map_err(|source| ConfigError::Unparsable {
                path: path.clone(),
                source,
            })?;
        Ok(parsed
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key, v)))
            .collect())
    }

    /// Walk up from the search root looking for the project file
    /// (`flowtest.yaml`), bounded to a handful of levels.
    fn discover(&self, considered: &mut Vec<PathBuf>) -> Option<PathBuf> {
        let root = self
            .search_root
            .clone()
            .or_else(|| std::env::current_dir().ok())?;
        let mut current = root.as_path();
        for _ in 0..DISCOVERY_DEPTH {
            let candidate = current.join(CONFIG_FILE_NAME);
            considered.push(candidate.clone());
            if candidate.exists() {
                return Some(candidate);
            }
            current = current.parent()?;
        }
        None
    }
}

fn env_key(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('-', "_").to_uppercase())
}

/// Unresolved template syntax (`${...}`) from a templated config file is
/// treated as if the key were never set.
fn is_placeholder(value: &str) -> bool {
    value.contains("${")
}

fn scalar_to_string(value: YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s),
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_port(key: &str, value: Option<String>, default: u16) -> Result<u16, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.into(),
            value: raw,
            reason: "expected a port number".into(),
        }),
    }
}

fn parse_bool(key: &str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref() {
        None => Ok(false),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: other.into(),
            reason: "expected \"true\" or \"false\"".into(),
        }),
    }
}

fn parse_seconds(key: &str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.into(),
                value: raw,
                reason: "expected a number of seconds".into(),
            }),
    }
}

/// Swap the port on a gateway address to point at the management API.
fn derive_management_address(gateway: &str, management_port: u16) -> Option<String> {
    let mut url = url::Url::parse(gateway).ok()?;
    url.set_port(Some(management_port)).ok()?;
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConfigResolver::new()
            .search_from(tmp.path())
            .resolve_with_env(&BTreeMap::new())
            .unwrap();
        assert_eq!(config.mode, RuntimeMode::Managed);
        assert_eq!(config.gateway_port, 8080);
        assert_eq!(config.startup_timeout, Duration::from_secs(60));
        assert!(!config.flush_on_start);
    }

    #[test]
    fn env_beats_file_beats_default() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            "engine-image: from-file\nengine-version: \"8.7\"\n",
        );
        let config = ConfigResolver::new()
            .search_from(tmp.path())
            .resolve_with_env(&env(&[("FLOWTEST_ENGINE_IMAGE", "from-env")]))
            .unwrap();
        assert_eq!(config.engine_image, "from-env");
        assert_eq!(config.engine_version, "8.7");
    }

    #[test]
    fn explicit_override_beats_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConfigResolver::new()
            .search_from(tmp.path())
            .set("engine-image", "from-code")
            .resolve_with_env(&env(&[("FLOWTEST_ENGINE_IMAGE", "from-env")]))
            .unwrap();
        assert_eq!(config.engine_image, "from-code");
    }

    #[test]
    fn placeholder_values_are_treated_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "engine-image: \"${ENGINE_IMAGE}\"\n");
        let config = ConfigResolver::new()
            .search_from(tmp.path())
            .resolve_with_env(&BTreeMap::new())
            .unwrap();
        assert_eq!(config.engine_image, "process-engine");
    }

    #[test]
    fn discovery_walks_up_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "engine-image: discovered\n");
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let config = ConfigResolver::new()
            .search_from(&nested)
            .resolve_with_env(&BTreeMap::new())
            .unwrap();
        assert_eq!(config.engine_image, "discovered");
    }

    #[test]
    fn missing_explicit_file_fails_fast() {
        let err = ConfigResolver::new()
            .with_file("/nonexistent/flowtest.yaml")
            .resolve_with_env(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ExplicitFileMissing { .. }));
    }

    #[test]
    fn unparsable_file_fails_fast_with_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), ": not yaml [\n");
        let err = ConfigResolver::new()
            .with_file(&path)
            .resolve_with_env(&BTreeMap::new())
            .unwrap_err();
        match err {
            ConfigError::Unparsable { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn remote_mode_without_gateway_address_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ConfigResolver::new()
            .search_from(tmp.path())
            .set("mode", "remote")
            .resolve_with_env(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRemoteAddress { .. }));
    }

    #[test]
    fn remote_management_address_is_derived_from_the_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConfigResolver::new()
            .search_from(tmp.path())
            .set("mode", "remote")
            .set("remote-gateway-address", "http://engine.test:8080/")
            .resolve_with_env(&BTreeMap::new())
            .unwrap();
        assert_eq!(
            config.remote_management_address.as_deref(),
            Some("http://engine.test:9600/")
        );
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ConfigResolver::new()
            .search_from(tmp.path())
            .set("mode", "hybrid")
            .resolve_with_env(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
