//! Reading the upstream Cygwin release manifest (`setup.ini` / `setup.xz`).
use std::collections::HashMap;
use std::io::Read;

use camino::Utf8Path;
use xz2::read::XzDecoder;

use crate::error::{Error, Result};
use crate::BinPkgId;

/// One `install:` line of a package section: a release of the package and
/// where its tarball lives on the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CygwinPkgVersion {
    pub version: String,
    pub install_path: String,
}

/// One `@ <name>` section of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CygwinPkg {
    pub requires: Vec<String>,
    pub versions: Vec<CygwinPkgVersion>,
}

/// Parsed view of the Cygwin setup manifest. The dependency resolver
/// answers `cygwin`-type packages from this.
#[derive(Debug, Clone, Default)]
pub struct CygwinRelease {
    packages: HashMap<String, CygwinPkg>,
}

impl CygwinRelease {
    /// Parse the manifest text. Sections start with `@ <name>` and end at a
    /// blank line; `version:` lines precede the `install:` line they
    /// describe.
    pub fn parse(content: &str) -> CygwinRelease {
        let mut packages = HashMap::new();
        let mut current: Option<(String, CygwinPkg)> = None;
        let mut pending_version: Option<String> = None;

        for line in content.lines() {
            if let Some(name) = line.strip_prefix("@ ") {
                if let Some((name, pkg)) = current.take() {
                    packages.insert(name, pkg);
                }
                current = Some((name.trim().to_string(), CygwinPkg::default()));
                pending_version = None;
                continue;
            }

            let Some((_, pkg)) = current.as_mut() else {
                continue;
            };

            if line.is_empty() {
                continue;
            }

            if let Some(version) = line.strip_prefix("version: ") {
                pending_version = Some(version.trim().to_string());
            } else if let Some(install) = line.strip_prefix("install: ") {
                let Some(version) = pending_version.take() else {
                    continue;
                };
                let Some(path) = install.split_whitespace().next() else {
                    continue;
                };
                pkg.versions.push(CygwinPkgVersion {
                    version,
                    install_path: path.to_string(),
                });
            } else if let Some(requires) = line.strip_prefix("requires: ") {
                pkg.requires = requires.split_whitespace().map(str::to_string).collect();
            } else if let Some(depends) = line.strip_prefix("depends2: ") {
                pkg.requires = depends
                    .split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect();
            }
        }

        if let Some((name, pkg)) = current.take() {
            packages.insert(name, pkg);
        }

        CygwinRelease { packages }
    }

    /// Read a manifest file, decompressing when it is the `setup.xz` form.
    pub fn load(path: &Utf8Path) -> Result<CygwinRelease> {
        let file = std::fs::File::open(path)?;
        let content = if path.extension() == Some("xz") {
            let mut decoded = String::new();
            XzDecoder::new(file).read_to_string(&mut decoded)?;
            decoded
        } else {
            std::io::read_to_string(file)?
        };
        Ok(CygwinRelease::parse(&content))
    }

    pub fn pkg(&self, name: &str) -> Option<&CygwinPkg> {
        self.packages.get(name)
    }

    /// Runtime depends of an upstream package, as binary-package ids.
    pub fn depends_of(&self, name: &str) -> Option<Vec<BinPkgId>> {
        self.packages
            .get(name)
            .map(|pkg| pkg.requires.iter().map(BinPkgId::new).collect())
    }

    /// Mirror path of the install tarball for a specific release.
    pub fn install_path(&self, name: &str, version: &str) -> Result<&str> {
        self.packages
            .get(name)
            .and_then(|pkg| pkg.versions.iter().find(|v| v.version == version))
            .map(|v| v.install_path.as_str())
            .ok_or_else(|| Error::CygwinPkgNotFound(BinPkgId::new(name), version.to_string()))
    }
}

/// Parse a mirror checksum file (`sha512.sum`): one `<digest> <file>` pair
/// per line.
pub fn parse_checksum_file(content: &str) -> HashMap<String, String> {
    let mut checksums = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(checksum), Some(file_name)) = (parts.next(), parts.next()) else {
            continue;
        };
        checksums.insert(file_name.to_string(), checksum.to_string());
    }
    checksums
}
