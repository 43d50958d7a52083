//! Configuration loader.
//!
//! A configuration source is a YAML file naming the persistent store and the
//! data directories. It is resolved from an explicit path, the `SECUMLCONF`
//! environment variable, or `secuml.yaml` in the working directory, in that
//! order. The resulting [`Configuration`] is immutable.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;

pub const CONF_ENV_VAR: &str = "SECUMLCONF";
pub const DEFAULT_CONF_FILE: &str = "secuml.yaml";

/// Where the persistent store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// File-backed store rooted at an existing directory.
    File(PathBuf),
    /// Process-local store, discarded at exit.
    Memory,
}

impl ConnectionDescriptor {
    fn resolve_against(self, base: Option<&Path>) -> Self {
        match (self, base) {
            (ConnectionDescriptor::File(path), Some(base)) if path.is_relative() => {
                ConnectionDescriptor::File(base.join(path))
            }
            (other, _) => other,
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").ok_or_else(|| {
            CoreError::Configuration(format!(
                "malformed db_uri '{s}': expected <scheme>://<location>"
            ))
        })?;
        match scheme {
            "file" if rest.is_empty() => Err(CoreError::Configuration(format!(
                "malformed db_uri '{s}': missing store directory"
            ))),
            "file" => Ok(ConnectionDescriptor::File(PathBuf::from(rest))),
            "memory" if rest.is_empty() => Ok(ConnectionDescriptor::Memory),
            "memory" => Err(CoreError::Configuration(format!(
                "malformed db_uri '{s}': memory stores take no location"
            ))),
            other => Err(CoreError::Configuration(format!(
                "unsupported db_uri scheme '{other}' (expected file or memory)"
            ))),
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDescriptor::File(path) => write!(f, "file://{}", path.display()),
            ConnectionDescriptor::Memory => write!(f, "memory://"),
        }
    }
}

/// Default experiment parameters, overridable from the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentDefaults {
    pub model: Option<String>,
    pub num_folds: Option<usize>,
    pub test_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfiguration {
    db_uri: String,
    input_data_dir: PathBuf,
    #[serde(default)]
    output_data_dir: Option<PathBuf>,
    #[serde(default)]
    defaults: ExperimentDefaults,
}

/// Immutable process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    source: Option<PathBuf>,
    db: ConnectionDescriptor,
    input_data_dir: PathBuf,
    output_data_dir: PathBuf,
    defaults: ExperimentDefaults,
}

impl Configuration {
    pub fn new(db: ConnectionDescriptor, input_data_dir: impl Into<PathBuf>) -> Self {
        let input_data_dir = input_data_dir.into();
        let output_data_dir = default_output_dir(&input_data_dir);
        Self {
            source: None,
            db,
            input_data_dir,
            output_data_dir,
            defaults: ExperimentDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: ExperimentDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load the configuration from `path`, or from the default source.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let source = resolve_source(path);
        let content = fs::read_to_string(&source).map_err(|e| {
            CoreError::Configuration(format!("cannot read {}: {e}", source.display()))
        })?;
        let base = source.parent().map(Path::to_path_buf);
        let mut conf = Self::from_yaml_str(&content, base.as_deref())?;
        debug!(source = %source.display(), db = %conf.db, "configuration loaded");
        conf.source = Some(source);
        Ok(conf)
    }

    /// Parse a YAML source. Relative paths are resolved against `base`.
    pub fn from_yaml_str(content: &str, base: Option<&Path>) -> Result<Self, CoreError> {
        let raw: RawConfiguration = serde_yaml::from_str(content)
            .map_err(|e| CoreError::Configuration(e.to_string()))?;
        let db = raw.db_uri.parse::<ConnectionDescriptor>()?.resolve_against(base);
        let resolve = |p: PathBuf| match base {
            Some(base) if p.is_relative() => base.join(p),
            _ => p,
        };
        let input_data_dir = resolve(raw.input_data_dir);
        let output_data_dir = match raw.output_data_dir {
            Some(dir) => resolve(dir),
            None => default_output_dir(&input_data_dir),
        };
        if let Some(folds) = raw.defaults.num_folds {
            if folds < 2 {
                return Err(CoreError::Configuration(format!(
                    "defaults.num_folds must be at least 2, got {folds}"
                )));
            }
        }
        if let Some(size) = raw.defaults.test_size {
            if !(size > 0.0 && size < 1.0) {
                return Err(CoreError::Configuration(format!(
                    "defaults.test_size must lie in (0, 1), got {size}"
                )));
            }
        }
        Ok(Self {
            source: None,
            db,
            input_data_dir,
            output_data_dir,
            defaults: raw.defaults,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn db(&self) -> &ConnectionDescriptor {
        &self.db
    }

    pub fn input_data_dir(&self) -> &Path {
        &self.input_data_dir
    }

    pub fn output_data_dir(&self) -> &Path {
        &self.output_data_dir
    }

    pub fn defaults(&self) -> &ExperimentDefaults {
        &self.defaults
    }
}

fn resolve_source(path: Option<&Path>) -> PathBuf {
    match path {
        Some(path) => path.to_path_buf(),
        None => std::env::var_os(CONF_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_FILE)),
    }
}

fn default_output_dir(input_data_dir: &Path) -> PathBuf {
    match input_data_dir.parent() {
        Some(parent) => parent.join("output"),
        None => PathBuf::from("output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_descriptors() {
        assert_eq!(
            "file:///var/lib/secuml".parse::<ConnectionDescriptor>().unwrap(),
            ConnectionDescriptor::File(PathBuf::from("/var/lib/secuml"))
        );
        assert_eq!(
            "memory://".parse::<ConnectionDescriptor>().unwrap(),
            ConnectionDescriptor::Memory
        );
        for bad in ["/var/lib/secuml", "file://", "mysql://localhost/secuml", "memory://x"] {
            assert!(
                matches!(bad.parse::<ConnectionDescriptor>(), Err(CoreError::Configuration(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_relative_paths_resolve_against_source_dir() {
        let conf = Configuration::from_yaml_str(
            "db_uri: file://db\ninput_data_dir: input\n",
            Some(Path::new("/etc/secuml")),
        )
        .unwrap();
        assert_eq!(
            conf.db(),
            &ConnectionDescriptor::File(PathBuf::from("/etc/secuml/db"))
        );
        assert_eq!(conf.input_data_dir(), Path::new("/etc/secuml/input"));
        assert_eq!(conf.output_data_dir(), Path::new("/etc/secuml/output"));
    }

    #[test]
    fn test_load_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf.yaml");
        fs::write(
            &path,
            "db_uri: memory://\ninput_data_dir: input\ndefaults:\n  model: centroid\n  num_folds: 3\n",
        )
        .unwrap();
        let first = Configuration::load(Some(&path)).unwrap();
        let second = Configuration::load(Some(&path)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.defaults().num_folds, Some(3));
        assert_eq!(first.source(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_source_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let err = Configuration::load(Some(&tmp.path().join("absent.yaml"))).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_unknown_keys_and_bad_defaults_are_rejected() {
        let unknown = Configuration::from_yaml_str(
            "db_uri: memory://\ninput_data_dir: in\ncolour: blue\n",
            None,
        );
        assert!(matches!(unknown, Err(CoreError::Configuration(_))));

        let folds = Configuration::from_yaml_str(
            "db_uri: memory://\ninput_data_dir: in\ndefaults:\n  num_folds: 1\n",
            None,
        );
        assert!(matches!(folds, Err(CoreError::Configuration(_))));
    }
}
