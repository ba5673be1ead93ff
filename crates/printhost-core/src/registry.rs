//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Registry of configured subsystems keyed by section name."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection, ConfigStore, ROOT_SECTION};
use tracing::{debug, info};

use crate::mcu::{DeviceConnection, DeviceError};
use crate::subsystem::{StatsError, Subsystem};
use crate::subsystems::{extruder, fan, heater, toolhead};

pub type Constructor = fn(&ConfigSection) -> Result<Box<dyn Subsystem>, ConfigError>;

/// Optional subsystem built when its section is present.
#[derive(Debug, Clone, Copy)]
pub struct SubsystemKind {
    pub section: &'static str,
    pub construct: Constructor,
}

pub const SUBSYSTEM_TABLE: &[SubsystemKind] = &[
    SubsystemKind {
        section: "fan",
        construct: fan::construct,
    },
    SubsystemKind {
        section: "extruder",
        construct: extruder::construct,
    },
    SubsystemKind {
        section: "heater_bed",
        construct: heater::construct,
    },
];

/// Name of the subsystem that is always present.
pub const TOOLHEAD: &str = "toolhead";

/// Sorted, grow-only mapping from subsystem name to instance.
#[derive(Default)]
pub struct SubsystemRegistry {
    entries: BTreeMap<String, Box<dyn Subsystem>>,
}

impl fmt::Debug for SubsystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl SubsystemRegistry {
    pub fn build(config: &Arc<ConfigStore>) -> Result<Self, ConfigError> {
        Self::build_with(config, SUBSYSTEM_TABLE)
    }

    /// Construct every table entry whose section exists, then the toolhead
    /// from the root section. Construction reads configuration only.
    pub fn build_with(
        config: &Arc<ConfigStore>,
        table: &[SubsystemKind],
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for kind in table {
            if !config.has_section(kind.section) {
                debug!(section = kind.section, "section absent; subsystem not configured");
                continue;
            }
            let instance = (kind.construct)(&config.section(kind.section))?;
            registry.insert(kind.section, instance);
        }
        let root = config.section(ROOT_SECTION);
        if !root.exists() {
            return Err(ConfigError::MissingSection(ROOT_SECTION.to_owned()));
        }
        registry.insert(TOOLHEAD, toolhead::construct(&root)?);
        info!(subsystems = ?registry.names().collect::<Vec<_>>(), "subsystems configured");
        Ok(registry)
    }

    fn insert(&mut self, name: &str, instance: Box<dyn Subsystem>) {
        // First registration wins; the registry never replaces or removes.
        self.entries.entry(name.to_owned()).or_insert(instance);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Give every subsystem, in ascending name order, its one chance to claim
    /// device resources.
    pub fn build_config(&mut self, device: &mut DeviceConnection) -> Result<(), DeviceError> {
        for (name, subsystem) in self.entries.iter_mut() {
            debug!(subsystem = %name, "building device configuration");
            let mut contribution = device.build_config_contribution(name)?;
            subsystem.build_config(&mut contribution)?;
        }
        Ok(())
    }

    /// Per-subsystem statistics in name order; a failure affects only its entry.
    pub fn stats(&self, eventtime: Instant) -> Vec<(&str, Result<String, StatsError>)> {
        self.entries
            .iter()
            .map(|(name, subsystem)| (name.as_str(), subsystem.stats(eventtime)))
            .collect()
    }
}
