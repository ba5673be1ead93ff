//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Shared primitives and utilities for the core runtime."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, File, FileFormat};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

/// Reserved section carrying root-level options.
pub const ROOT_SECTION: &str = "printer";

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or reading the configuration store.
///
/// Every variant is a startup-time failure: callers propagate it to the top
/// level instead of recovering.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: config::ConfigError,
    },
    #[error("section '{0}' not found in configuration")]
    MissingSection(String),
    #[error("option '{option}' in section '{section}' must be specified")]
    MissingOption { section: String, option: String },
    #[error("unable to parse option '{option}' in section '{section}': {value:?} is not a valid {expected}")]
    InvalidValue {
        section: String,
        option: String,
        value: String,
        expected: &'static str,
    },
    #[error("option '{option}' in section '{section}' {reason}")]
    OutOfRange {
        section: String,
        option: String,
        reason: String,
    },
}

/// Immutable, ordered collection of configuration sections.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    sections: IndexMap<String, IndexMap<String, String>>,
    source: Option<PathBuf>,
}

impl ConfigStore {
    /// Load a sectioned key/value file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut store = Self::parse(&contents, &path.display().to_string())?;
        store.source = Some(path.to_path_buf());
        Ok(store)
    }

    /// Parse configuration text that did not come from a file.
    pub fn from_text(contents: &str) -> Result<Self> {
        Self::parse(contents, "<inline>")
    }

    fn parse(contents: &str, origin: &str) -> Result<Self> {
        let parse_err = |source| ConfigError::Parse {
            origin: origin.to_owned(),
            source,
        };
        let raw = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Ini))
            .build()
            .map_err(parse_err)?
            .try_deserialize::<IndexMap<String, Option<IndexMap<String, String>>>>()
            .map_err(parse_err)?;

        // Option names are case-insensitive. A section without options parses
        // as an empty value and is kept as an empty section.
        let sections = raw
            .into_iter()
            .map(|(name, options)| {
                let options = options
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key.to_lowercase(), value.trim().to_owned()))
                    .collect();
                (name, options)
            })
            .collect::<IndexMap<_, _>>();
        debug!(sections = sections.len(), origin, "configuration parsed");
        Ok(Self {
            sections,
            source: None,
        })
    }

    /// Path the store was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Section names in file order.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    fn raw(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|options| options.get(&option.to_lowercase()))
            .map(String::as_str)
    }

    /// Accessor scoped to `name`. The section does not have to exist; reads
    /// against an absent section behave like reads of absent keys.
    pub fn section(self: &Arc<Self>, name: &str) -> ConfigSection {
        ConfigSection {
            store: Arc::clone(self),
            name: name.to_owned(),
        }
    }
}

/// Inclusive and exclusive bounds applied by [`ConfigSection::get_float_bounded`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatBounds {
    min: Option<f64>,
    max: Option<f64>,
    above: Option<f64>,
}

impl FloatBounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(mut self, value: f64) -> Self {
        self.min = Some(value);
        self
    }

    pub fn max(mut self, value: f64) -> Self {
        self.max = Some(value);
        self
    }

    pub fn above(mut self, value: f64) -> Self {
        self.above = Some(value);
        self
    }

    fn violation(&self, value: f64) -> Option<String> {
        if let Some(min) = self.min.filter(|min| value < *min) {
            return Some(format!("must have minimum of {}", min));
        }
        if let Some(max) = self.max.filter(|max| value > *max) {
            return Some(format!("must have maximum of {}", max));
        }
        if let Some(above) = self.above.filter(|above| value <= *above) {
            return Some(format!("must be above {}", above));
        }
        None
    }
}

/// Read-only view over one section of a [`ConfigStore`].
#[derive(Clone)]
pub struct ConfigSection {
    store: Arc<ConfigStore>,
    name: String,
}

impl fmt::Debug for ConfigSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSection")
            .field("name", &self.name)
            .finish()
    }
}

impl ConfigSection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the scoped section is present in the store.
    pub fn exists(&self) -> bool {
        self.store.has_section(&self.name)
    }

    /// Accessor for another section of the same store.
    pub fn get_section(&self, name: &str) -> ConfigSection {
        self.store.section(name)
    }

    pub fn get_opt(&self, option: &str) -> Option<String> {
        self.store.raw(&self.name, option).map(str::to_owned)
    }

    /// Fetch a string option, falling back to `default` when absent.
    /// An absent option without a default is a [`ConfigError::MissingOption`].
    pub fn get(&self, option: &str, default: Option<&str>) -> Result<String> {
        match self.store.raw(&self.name, option) {
            Some(value) => Ok(value.to_owned()),
            None => default
                .map(str::to_owned)
                .ok_or_else(|| self.missing(option)),
        }
    }

    pub fn get_int(&self, option: &str, default: Option<i64>) -> Result<i64> {
        self.typed(option, default, "integer", |raw| raw.parse::<i64>().ok())
    }

    pub fn get_float(&self, option: &str, default: Option<f64>) -> Result<f64> {
        self.typed(option, default, "float", |raw| {
            raw.parse::<f64>().ok().filter(|value| value.is_finite())
        })
    }

    pub fn get_float_bounded(
        &self,
        option: &str,
        default: Option<f64>,
        bounds: FloatBounds,
    ) -> Result<f64> {
        let value = self.get_float(option, default)?;
        match bounds.violation(value) {
            Some(reason) => Err(ConfigError::OutOfRange {
                section: self.name.clone(),
                option: option.to_owned(),
                reason,
            }),
            None => Ok(value),
        }
    }

    pub fn get_bool(&self, option: &str, default: Option<bool>) -> Result<bool> {
        self.typed(option, default, "boolean", |raw| {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => Some(true),
                "0" | "no" | "false" | "off" => Some(false),
                _ => None,
            }
        })
    }

    /// Map an option onto one of a closed set of values.
    pub fn get_choice<T: Copy>(
        &self,
        option: &str,
        choices: &[(&str, T)],
        default: Option<&str>,
    ) -> Result<T> {
        let raw = self.get(option, default)?;
        choices
            .iter()
            .find(|(name, _)| *name == raw)
            .map(|(_, value)| *value)
            .ok_or_else(|| ConfigError::InvalidValue {
                section: self.name.clone(),
                option: option.to_owned(),
                value: raw,
                expected: "choice",
            })
    }

    fn typed<T>(
        &self,
        option: &str,
        default: Option<T>,
        expected: &'static str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<T> {
        let Some(raw) = self.store.raw(&self.name, option) else {
            return default.ok_or_else(|| self.missing(option));
        };
        parse(raw).ok_or_else(|| ConfigError::InvalidValue {
            section: self.name.clone(),
            option: option.to_owned(),
            value: raw.to_owned(),
            expected,
        })
    }

    fn missing(&self, option: &str) -> ConfigError {
        ConfigError::MissingOption {
            section: self.name.clone(),
            option: option.to_owned(),
        }
    }
}
