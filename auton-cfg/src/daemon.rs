//  DAEMON.rs
//    by Lut99
//
//  Created:
//    12 Nov 2024, 10:40:02
//  Last edited:
//    03 Mar 2025, 14:21:17
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the layout of the daemon's main configuration file, which
//!   declares the general daemon settings and the endpoint table.
//

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::credentials::{Credentials, CredentialsSpec};
use crate::errors::ResolveError;
use crate::info::{Info as _, YamlInfo};


/***** HELPER FUNCTIONS *****/
/// Provides the default bind address for the control API.
#[inline]
fn default_listen_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 8666)) }

/// Provides the default number of seconds to wait on the registry lock.
#[inline]
fn default_lock_timeout() -> u64 { 60 }

/// Provides the default for boolean endpoint switches that are on unless disabled.
#[inline]
fn default_true() -> bool { true }

/// Renders a scalar YAML value as the string the template vars carry.
fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads one of the `import_*` files as a YAML mapping.
///
/// # Arguments
/// - `what`: Which import this is (`"vars"`, `"config"` or `"users"`), for error reporting.
/// - `path`: The path of the file to read. Relative paths resolve against `config_dir`.
/// - `config_dir`: The directory of the daemon config file, if known.
///
/// # Errors
/// This function errors if the file could not be read, parsed or does not hold a mapping.
fn import_file(what: &'static str, path: &Path, config_dir: Option<&Path>) -> Result<serde_yaml::Mapping, ResolveError> {
    let path: PathBuf = match config_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.into(),
    };
    debug!("Importing {} file '{}'...", what, path.display());

    // Read it as a generic value first so we can assert it's a mapping
    let value: serde_yaml::Value = match YamlValue::from_path(&path) {
        Ok(value) => value.0,
        Err(err) => {
            return Err(ResolveError::ImportLoad { what, path, err });
        },
    };
    match value {
        serde_yaml::Value::Mapping(map) => Ok(map),
        _ => Err(ResolveError::ImportNotAMap { what, path }),
    }
}

/// Newtype so a bare [`serde_yaml::Value`] can travel through the [`Info`]-trait.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct YamlValue(serde_yaml::Value);
impl<'de> YamlInfo<'de> for YamlValue {}





/***** LIBRARY *****/
/// Defines the daemon's main configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// The `general` section with daemon-wide settings.
    pub general:   GeneralConfig,
    /// The `endpoints` section, mapping endpoint names to their definitions.
    pub endpoints: HashMap<String, EndpointConfig>,
}
impl<'de> YamlInfo<'de> for DaemonConfig {}



/// Defines the daemon-wide settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// The address on which the control API listens.
    #[serde(default = "default_listen_addr")]
    pub listen_addr:  SocketAddr,
    /// How many seconds a control handler may wait on the job registry lock before giving up.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
}
impl Default for GeneralConfig {
    #[inline]
    fn default() -> Self { Self { listen_addr: default_listen_addr(), lock_timeout: default_lock_timeout() } }
}



/// Defines a single endpoint in the daemon config.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// The name of the plugin backing this endpoint (`subproc` or `http`).
    pub plugin: String,

    /// Whether this endpoint exists at all.
    #[serde(default = "default_true")]
    pub enabled:   bool,
    /// Whether this endpoint's worker is spawned at daemon startup.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// A YAML file whose mapping is merged under the inline `vars`.
    #[serde(default)]
    pub import_vars:   Option<PathBuf>,
    /// A YAML file whose mapping is merged under the inline `config`.
    #[serde(default)]
    pub import_config: Option<PathBuf>,
    /// A YAML file whose mapping is merged under the inline `users`.
    #[serde(default)]
    pub import_users:  Option<PathBuf>,

    /// Extra template variables made available to this endpoint's jobs.
    #[serde(default)]
    pub vars:   serde_yaml::Mapping,
    /// The plugin-specific target configuration.
    #[serde(default)]
    pub config: serde_yaml::Mapping,
    /// The user allowlist. Absent or empty means any caller is accepted.
    #[serde(default)]
    pub users:  HashMap<String, bool>,

    /// Credentials for the target, inline or as a file reference.
    #[serde(default)]
    pub credentials: Option<CredentialsSpec>,
}
impl EndpointConfig {
    /// Resolves the `import_*` references of this endpoint into one flattened view.
    ///
    /// The imported mappings are applied first, then the inline sections override them.
    ///
    /// # Arguments
    /// - `config_dir`: The directory of the daemon config file, against which relative import paths resolve.
    ///
    /// # Errors
    /// This function errors if any referenced file could not be read or has the wrong shape.
    pub fn resolve(&self, config_dir: Option<&Path>) -> Result<ResolvedEndpoint, ResolveError> {
        // Vars: imported mapping first, inline on top, scalars coerced to strings
        let mut raw_vars: serde_yaml::Mapping = match &self.import_vars {
            Some(path) => import_file("vars", path, config_dir)?,
            None => serde_yaml::Mapping::new(),
        };
        for (key, value) in self.vars.clone() {
            raw_vars.insert(key, value);
        }
        let mut vars: HashMap<String, String> = HashMap::new();
        for (key, value) in &raw_vars {
            if let (Some(key), Some(value)) = (key.as_str(), scalar_to_string(value)) {
                vars.insert(key.into(), value);
            }
        }

        // Config: imported mapping first, inline on top
        let mut config: serde_yaml::Mapping = match &self.import_config {
            Some(path) => import_file("config", path, config_dir)?,
            None => serde_yaml::Mapping::new(),
        };
        for (key, value) in self.config.clone() {
            config.insert(key, value);
        }

        // Users: imported mapping first, inline on top
        let mut users: HashMap<String, bool> = HashMap::new();
        if let Some(path) = &self.import_users {
            for (key, value) in import_file("users", path, config_dir)? {
                if let (Some(key), Some(value)) = (key.as_str(), value.as_bool()) {
                    users.insert(key.into(), value);
                }
            }
        }
        users.extend(self.users.clone());

        // Credentials are always a lazy reference
        let credentials: Option<Credentials> = match &self.credentials {
            Some(spec) => match spec.resolve(config_dir) {
                Ok(creds) => Some(creds),
                Err(err) => {
                    let path: PathBuf = if let CredentialsSpec::Path(path) = spec { path.clone() } else { PathBuf::new() };
                    return Err(ResolveError::CredentialsLoad { path, err });
                },
            },
            None => None,
        };

        Ok(ResolvedEndpoint { vars, config, users, credentials })
    }
}



/// The flattened view of an endpoint's configuration after imports are applied.
#[derive(Clone, Debug)]
pub struct ResolvedEndpoint {
    /// Extra template variables for this endpoint's jobs.
    pub vars:   HashMap<String, String>,
    /// The plugin-specific target configuration.
    pub config: serde_yaml::Mapping,
    /// The user allowlist (empty means anyone).
    pub users:  HashMap<String, bool>,
    /// The target's credentials, if any.
    pub credentials: Option<Credentials>,
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::info::Info as _;


    #[test]
    fn test_daemon_config_parse() {
        let config: DaemonConfig = DaemonConfig::from_string(
            r#"
general:
  listen_addr: 127.0.0.1:9000
  lock_timeout: 5
endpoints:
  echo:
    plugin: subproc
    config:
      prog: /bin/echo
  proxy:
    plugin: http
    enabled: false
    users:
      alice: true
    config:
      url: http://localhost:8080/
"#,
        )
        .unwrap();

        assert_eq!(config.general.listen_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.general.lock_timeout, 5);
        assert_eq!(config.endpoints.len(), 2);

        let echo: &EndpointConfig = &config.endpoints["echo"];
        assert_eq!(echo.plugin, "subproc");
        assert!(echo.enabled);
        assert!(echo.autostart);

        let proxy: &EndpointConfig = &config.endpoints["proxy"];
        assert!(!proxy.enabled);
        assert_eq!(proxy.users.get("alice"), Some(&true));
    }

    #[test]
    fn test_endpoint_resolve_imports() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("vars.yml")).unwrap();
        writeln!(file, "region: eu\nretries: 3").unwrap();

        let config: DaemonConfig = DaemonConfig::from_string(
            r#"
general: {}
endpoints:
  echo:
    plugin: subproc
    import_vars: vars.yml
    vars:
      region: us
    config:
      prog: /bin/echo
"#,
        )
        .unwrap();

        let resolved: ResolvedEndpoint = config.endpoints["echo"].resolve(Some(dir.path())).unwrap();
        // Inline wins over the import; scalars are coerced
        assert_eq!(resolved.vars.get("region").map(String::as_str), Some("us"));
        assert_eq!(resolved.vars.get("retries").map(String::as_str), Some("3"));
        assert_eq!(resolved.config.get("prog").and_then(serde_yaml::Value::as_str), Some("/bin/echo"));
    }

    #[test]
    fn test_missing_import_fails() {
        let config: DaemonConfig = DaemonConfig::from_string(
            r#"
general: {}
endpoints:
  echo:
    plugin: subproc
    import_config: /nonexistent/config.yml
"#,
        )
        .unwrap();
        assert!(config.endpoints["echo"].resolve(None).is_err());
    }
}
