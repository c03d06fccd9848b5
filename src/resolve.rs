//! Dependency resolution from the package index.
//!
//! The resolver is pure: it reads package configs and produces data. The
//! change processor is the only writer of the snapshot graph.
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cygwin::CygwinRelease;
use crate::error::{Error, Result};
use crate::pkg_index::{self, PkgConfig};
use crate::{BinPkgId, SrcPkgId};

/// Dependencies of one source package at one version, expanded for the
/// layer it is resolved into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDependencies {
    /// Build-dependencies per source: the package itself, plus its
    /// `bootstrap:` twin when resolving for the bootstrap layer.
    pub build_depends: BTreeMap<SrcPkgId, Vec<BinPkgId>>,
    /// Runtime depends of each binary the source produces.
    pub depends: BTreeMap<BinPkgId, Vec<BinPkgId>>,
}

pub struct DependencyResolver {
    pi_path: Utf8PathBuf,
    cygwin_manifest: Utf8PathBuf,
}

impl DependencyResolver {
    pub fn new(pi_path: impl Into<Utf8PathBuf>, cygwin_manifest: impl Into<Utf8PathBuf>) -> Self {
        DependencyResolver {
            pi_path: pi_path.into(),
            cygwin_manifest: cygwin_manifest.into(),
        }
    }

    pub fn pi_path(&self) -> &Utf8Path {
        &self.pi_path
    }

    /// Build-deps of the source and runtime depends of each binary it
    /// produces. In bootstrap mode the result additionally covers the
    /// `bootstrap:` twin, which builds against `prev:` binaries.
    pub fn resolve(
        &self,
        name: &str,
        version: &str,
        bootstrap: bool,
    ) -> Result<PackageDependencies> {
        let config = pkg_index::load_pkg_config(&self.pi_path, name, version)?;
        let src = SrcPkgId::new(name);

        let mut deps = PackageDependencies::default();
        match &config {
            PkgConfig::Custom(custom) => {
                deps.build_depends.insert(src, config.build_depends());
                for (bin_name, section) in &custom.binaries {
                    deps.depends.insert(
                        BinPkgId::new(bin_name),
                        section.depends.iter().map(BinPkgId::new).collect(),
                    );
                }
            }
            PkgConfig::Cygwin(_) => {
                tracing::debug!("reading cygwin release manifest for {name}");
                let release = CygwinRelease::load(&self.cygwin_manifest)?;
                let depends = release
                    .depends_of(name)
                    .ok_or_else(|| Error::CygwinPkgNotFound(BinPkgId::new(name), version.into()))?;
                deps.build_depends.insert(src, Vec::new());
                deps.depends.insert(BinPkgId::new(name), depends);
            }
        }

        if bootstrap {
            deps = expand_bootstrap(deps);
        }
        Ok(deps)
    }
}

/// Expand resolved dependencies for the bootstrap layer: the package builds
/// against the `bootstrap:` results, and its synthetic twin builds against
/// the previous snapshot.
fn expand_bootstrap(base: PackageDependencies) -> PackageDependencies {
    let mut expanded = PackageDependencies::default();

    for (src, build_depends) in base.build_depends {
        expanded.build_depends.insert(
            src.to_bootstrap(),
            build_depends.iter().map(BinPkgId::to_prev).collect(),
        );
        expanded.build_depends.insert(
            src,
            build_depends.iter().map(BinPkgId::to_bootstrap).collect(),
        );
    }

    for (bin, depends) in base.depends {
        expanded.depends.insert(
            bin.to_bootstrap(),
            depends.iter().map(BinPkgId::to_bootstrap).collect(),
        );
        expanded.depends.insert(bin, depends);
    }

    expanded
}
