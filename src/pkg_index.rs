//! Declarative package configs read from the package index.
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tarball::Compression;
use crate::{BinPkgId, SrcPkgId};

pub const PKG_CONFIG_SCHEMA_VERSION: u32 = 0;

/// A package config, discriminated by `pkg_type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "pkg_type", rename_all = "lowercase")]
pub enum PkgConfig {
    Custom(CustomPkgConfig),
    Cygwin(CygwinPkgConfig),
}

impl PkgConfig {
    pub fn name(&self) -> &str {
        match self {
            PkgConfig::Custom(config) => &config.name,
            PkgConfig::Cygwin(config) => &config.name,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            PkgConfig::Custom(config) => &config.version,
            PkgConfig::Cygwin(config) => &config.version,
        }
    }

    pub fn id(&self) -> SrcPkgId {
        SrcPkgId::new(self.name())
    }

    fn schema_version(&self) -> u32 {
        match self {
            PkgConfig::Custom(config) => config.schema_version,
            PkgConfig::Cygwin(config) => config.schema_version,
        }
    }

    /// The binary packages this source produces.
    pub fn binary_packages(&self) -> Vec<BinPkgId> {
        match self {
            PkgConfig::Custom(config) => config.binaries.keys().map(BinPkgId::new).collect(),
            // The cygwin integration pulls in upstream binary packages
            // directly, so there is exactly one binary per source.
            PkgConfig::Cygwin(config) => vec![BinPkgId::new(&config.name)],
        }
    }

    pub fn build_depends(&self) -> Vec<BinPkgId> {
        match self {
            PkgConfig::Custom(config) => {
                config.pkg.build_depends.iter().map(BinPkgId::new).collect()
            }
            PkgConfig::Cygwin(_) => Vec::new(),
        }
    }
}

/// A package built from a source tarball with declarative rules.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CustomPkgConfig {
    pub schema_version: u32,
    pub name: String,
    pub version: String,
    pub pkg: PkgSection,
    pub input: InputSection,
    pub rules: RulesSection,
    pub binaries: BTreeMap<String, BinarySection>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PkgSection {
    pub supported_platforms: Vec<String>,
    #[serde(default)]
    pub build_depends: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InputSection {
    pub sha256: String,
    pub source_version: String,
    #[serde(default)]
    pub tarball_root_dir: Option<String>,
    #[serde(default = "default_tarball_compression")]
    pub tarball_compression: Compression,
    #[serde(default)]
    pub image_type: Option<String>,
    #[serde(default)]
    pub patches: Vec<String>,
}

fn default_tarball_compression() -> Compression {
    Compression::Gz
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RulesSection {
    pub default: Vec<Rule>,
}

/// One build step: either a plain command line or a command with extra
/// settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Rule {
    Command(String),
    Detailed(DetailedRule),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetailedRule {
    /// Working directory relative to the build dir. A string, not a path,
    /// because it may refer to builtin variables.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub rule: RuleCommand,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RuleCommand {
    Line(String),
    Argv(Vec<String>),
}

impl Rule {
    pub fn argv(&self) -> Vec<String> {
        let command = match self {
            Rule::Command(line) => return line.split_whitespace().map(str::to_string).collect(),
            Rule::Detailed(detailed) => &detailed.rule,
        };
        match command {
            RuleCommand::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            RuleCommand::Argv(argv) => argv.clone(),
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        match self {
            Rule::Command(_) => None,
            Rule::Detailed(detailed) => detailed.cwd.as_deref(),
        }
    }

    pub fn env(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Rule::Command(_) => None,
            Rule::Detailed(detailed) => Some(&detailed.env),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BinarySection {
    #[serde(default)]
    pub depends: Vec<String>,
    /// Subdirectory of the package output dir holding this binary's files.
    #[serde(default)]
    pub output_dir: Option<String>,
}

/// A thin reference to an upstream Cygwin package; everything else comes
/// from the Cygwin release manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CygwinPkgConfig {
    pub schema_version: u32,
    pub name: String,
    pub version: String,
}

pub fn pkg_config_path(pi_path: &Utf8Path, name: &str, version: &str) -> Utf8PathBuf {
    pi_path.join("pkg").join(name).join(version).join("pkg.toml")
}

pub fn load_pkg_config(pi_path: &Utf8Path, name: &str, version: &str) -> Result<PkgConfig> {
    let path = pkg_config_path(pi_path, name, version);
    let data = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::MissingPkgConfig {
                name: name.to_string(),
                version: version.to_string(),
            }
        } else {
            Error::Io(e)
        }
    })?;

    let config: PkgConfig = toml::from_str(&data)?;
    if config.schema_version() != PKG_CONFIG_SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            what: path.to_string(),
            version: config.schema_version().to_string(),
        });
    }

    Ok(config)
}
