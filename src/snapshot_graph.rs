//! The in-memory snapshot: package maps plus the derived dependency graph.
use std::collections::{BTreeMap, HashSet, VecDeque};

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::graph::DepGraph;
use crate::resolve::{DependencyResolver, PackageDependencies};
use crate::snapshot::{
    self, Snapshot, SnapshotBinPkg, SnapshotChanges, SnapshotPkg, SnapshotSrcPkg,
};
use crate::store::StoreLayout;
use crate::tarball::Compression;
use crate::{BinPkgId, PkgId, SrcPkgId, PLACEHOLDER_SHA256};

/// A snapshot combined with its derived dependency graph.
///
/// The graph has three kinds of edges, all meaning "depends on":
/// - a binary package depends on the source package that builds it,
/// - a source package depends on its build-dependencies,
/// - a binary package depends on its runtime depends.
///
/// Bootstrap packages additionally carry a synthetic `bootstrap:` twin
/// whose build-deps point at `prev:` binaries; those targets stay edge
/// sinks, they are never map entries.
#[derive(Debug, Clone)]
pub struct SnapshotGraph {
    pub name: String,
    pub ancestor: Option<String>,
    pub changes: SnapshotChanges,
    pub bootstrap_changes: SnapshotChanges,
    graph: DepGraph<PkgId>,
    src_pkg_map: BTreeMap<SrcPkgId, SnapshotSrcPkg>,
    bin_pkg_map: BTreeMap<BinPkgId, SnapshotBinPkg>,
    bootstrap_src_pkg_map: BTreeMap<SrcPkgId, SnapshotSrcPkg>,
    bootstrap_bin_pkg_map: BTreeMap<BinPkgId, SnapshotBinPkg>,
}

impl SnapshotGraph {
    /// Rebuild the graph from a persisted snapshot record.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<SnapshotGraph> {
        let Snapshot {
            version: _,
            name,
            ancestor,
            pkgs,
            bootstrap_pkgs,
            changes,
            bootstrap_changes,
        } = snapshot;

        let mut this = SnapshotGraph {
            name,
            ancestor,
            changes,
            bootstrap_changes,
            graph: DepGraph::new(),
            src_pkg_map: BTreeMap::new(),
            bin_pkg_map: BTreeMap::new(),
            bootstrap_src_pkg_map: BTreeMap::new(),
            bootstrap_bin_pkg_map: BTreeMap::new(),
        };

        this.insert_layer(bootstrap_pkgs, true)?;
        this.insert_layer(pkgs, false)?;
        Ok(this)
    }

    pub fn load(store: &StoreLayout, name: &str) -> Result<SnapshotGraph> {
        SnapshotGraph::from_snapshot(snapshot::load_snapshot(store, name)?)
    }

    fn insert_layer(&mut self, pkgs: Vec<SnapshotPkg>, bootstrap: bool) -> Result<()> {
        // Nodes and maps first, then edges, so edge targets can be
        // validated against the complete layer.
        for pkg in pkgs {
            match pkg {
                SnapshotPkg::Src(src) => {
                    let id = src.id();
                    let (src_map, _) = self.layer_mut(bootstrap);
                    if src_map.insert(id.clone(), src).is_some() {
                        return Err(Error::CorruptedSnapshot(format!(
                            "duplicate source package {id}"
                        )));
                    }
                    self.graph.add_node(id.into());
                }
                SnapshotPkg::Bin(bin) => {
                    let id = bin.id();
                    let (_, bin_map) = self.layer_mut(bootstrap);
                    if bin_map.insert(id.clone(), bin).is_some() {
                        return Err(Error::CorruptedSnapshot(format!(
                            "duplicate binary package {id}"
                        )));
                    }
                    self.graph.add_node(id.into());
                }
            }
        }

        let (src_map, bin_map) = self.layer(bootstrap);

        let mut edges: Vec<(PkgId, PkgId)> = Vec::new();
        for (src, record) in src_map {
            // Binary packages depend on the source that builds them.
            for bin in record.binary_package_ids() {
                if !bin_map.contains_key(&bin) {
                    return Err(Error::CorruptedSnapshot(format!(
                        "binary package {bin} of {src} not found in snapshot"
                    )));
                }
                edges.push((bin.into(), src.clone().into()));
            }
            // Sources depend on their build-dependencies.
            for dep in record.build_depends_ids() {
                if !dep.is_prev() && !bin_map.contains_key(&dep) {
                    return Err(Error::CorruptedSnapshot(format!(
                        "binary package {dep} not found in snapshot, \
                         required by build-depends of {src}"
                    )));
                }
                edges.push((src.clone().into(), dep.into()));
            }
        }
        for (bin, record) in bin_map {
            // Binary packages depend on their runtime depends.
            for dep in record.depends_ids() {
                if !dep.is_prev() && !bin_map.contains_key(&dep) {
                    return Err(Error::CorruptedSnapshot(format!(
                        "binary package {dep} not found in snapshot, \
                         required by depends of {bin}"
                    )));
                }
                edges.push((bin.clone().into(), dep.into()));
            }
        }

        for (from, to) in edges {
            self.graph.add_edge(from, to);
        }
        Ok(())
    }

    fn layer(
        &self,
        bootstrap: bool,
    ) -> (
        &BTreeMap<SrcPkgId, SnapshotSrcPkg>,
        &BTreeMap<BinPkgId, SnapshotBinPkg>,
    ) {
        if bootstrap {
            (&self.bootstrap_src_pkg_map, &self.bootstrap_bin_pkg_map)
        } else {
            (&self.src_pkg_map, &self.bin_pkg_map)
        }
    }

    fn layer_mut(
        &mut self,
        bootstrap: bool,
    ) -> (
        &mut BTreeMap<SrcPkgId, SnapshotSrcPkg>,
        &mut BTreeMap<BinPkgId, SnapshotBinPkg>,
    ) {
        if bootstrap {
            (
                &mut self.bootstrap_src_pkg_map,
                &mut self.bootstrap_bin_pkg_map,
            )
        } else {
            (&mut self.src_pkg_map, &mut self.bin_pkg_map)
        }
    }

    pub fn graph(&self) -> &DepGraph<PkgId> {
        &self.graph
    }

    pub fn src_pkg_map(&self) -> &BTreeMap<SrcPkgId, SnapshotSrcPkg> {
        &self.src_pkg_map
    }

    pub fn bin_pkg_map(&self) -> &BTreeMap<BinPkgId, SnapshotBinPkg> {
        &self.bin_pkg_map
    }

    pub fn bootstrap_src_pkg_map(&self) -> &BTreeMap<SrcPkgId, SnapshotSrcPkg> {
        &self.bootstrap_src_pkg_map
    }

    pub fn bootstrap_bin_pkg_map(&self) -> &BTreeMap<BinPkgId, SnapshotBinPkg> {
        &self.bootstrap_bin_pkg_map
    }

    /// Look up a source package in either layer, bootstrap first (synthetic
    /// twins only exist there).
    pub fn src_pkg(&self, id: &SrcPkgId) -> Option<(&SnapshotSrcPkg, bool)> {
        self.bootstrap_src_pkg_map
            .get(id)
            .map(|record| (record, true))
            .or_else(|| self.src_pkg_map.get(id).map(|record| (record, false)))
    }

    pub fn bin_pkg(&self, id: &BinPkgId) -> Option<&SnapshotBinPkg> {
        self.bootstrap_bin_pkg_map
            .get(id)
            .or_else(|| self.bin_pkg_map.get(id))
    }

    /// Add a source package with an empty binary list. Its build-dep edges
    /// are created even when the targets do not exist yet; a later
    /// `add_bin_pkg` supplies them.
    pub fn add_src_pkg(
        &mut self,
        id: SrcPkgId,
        version: &str,
        build_depends: &[BinPkgId],
        bootstrap: bool,
    ) -> Result<()> {
        let (src_map, _) = self.layer_mut(bootstrap);
        if src_map.contains_key(&id) {
            return Err(Error::AlreadyPresent(id.into()));
        }
        src_map.insert(
            id.clone(),
            SnapshotSrcPkg {
                name: id.name().to_string(),
                version: version.to_string(),
                build_depends: build_depends.iter().map(|d| d.name().to_string()).collect(),
                binary_packages: Vec::new(),
            },
        );

        self.graph.add_node(id.clone().into());
        for dep in build_depends {
            self.graph.add_edge(id.clone().into(), dep.clone().into());
        }
        Ok(())
    }

    /// Add a binary package produced by `producing_src`. Broken edges into
    /// this binary (left by an earlier removal) are restored.
    pub fn add_bin_pkg(
        &mut self,
        id: BinPkgId,
        producing_src: &SrcPkgId,
        sha256: &str,
        depends: &[BinPkgId],
        bootstrap: bool,
    ) -> Result<()> {
        let (src_map, bin_map) = self.layer_mut(bootstrap);
        let Some(producer) = src_map.get_mut(producing_src) else {
            return Err(Error::CorruptedSnapshot(format!(
                "producing source {producing_src} of {id} not in snapshot"
            )));
        };
        if bin_map.contains_key(&id) {
            return Err(Error::AlreadyPresent(id.into()));
        }

        producer.binary_packages.push(id.name().to_string());
        bin_map.insert(
            id.clone(),
            SnapshotBinPkg {
                name: id.name().to_string(),
                sha256: sha256.to_string(),
                compression_method: Compression::Xz,
                depends: depends.iter().map(|d| d.name().to_string()).collect(),
            },
        );

        self.graph.add_node(id.clone().into());
        self.graph
            .add_edge(id.clone().into(), producing_src.clone().into());
        for dep in depends {
            self.graph.add_edge(id.clone().into(), dep.clone().into());
        }
        Ok(())
    }

    /// Add a resolved package: the source, its binaries, and (for the
    /// bootstrap layer) the synthetic twin pair. Binaries start with the
    /// placeholder sha until the scheduler commits real hashes.
    pub fn add_pkg(
        &mut self,
        name: &str,
        version: &str,
        deps: &PackageDependencies,
        bootstrap: bool,
    ) -> Result<()> {
        for (src, build_depends) in &deps.build_depends {
            self.add_src_pkg(src.clone(), version, build_depends, bootstrap)?;
        }
        for (bin, depends) in &deps.depends {
            let producer = if bin.is_bootstrap() {
                SrcPkgId::new(name).to_bootstrap()
            } else {
                SrcPkgId::new(name)
            };
            self.add_bin_pkg(bin.clone(), &producer, PLACEHOLDER_SHA256, depends, bootstrap)?;
        }
        Ok(())
    }

    /// Remove a source package and every binary it produces. Edges from
    /// dependents end up as broken edges; that is permissible intermediate
    /// state until the change bundle finishes.
    pub fn remove_pkg(&mut self, src: &SrcPkgId, bootstrap: bool) -> Result<()> {
        self.remove_single(src, bootstrap)?;
        if bootstrap && !src.is_bootstrap() {
            self.remove_single(&src.to_bootstrap(), bootstrap)?;
        }
        Ok(())
    }

    fn remove_single(&mut self, src: &SrcPkgId, bootstrap: bool) -> Result<()> {
        let record = {
            let (src_map, _) = self.layer_mut(bootstrap);
            src_map
                .remove(src)
                .ok_or_else(|| Error::UnresolvedDependencies(src.clone().into()))?
        };

        let bins: Vec<BinPkgId> = record.binary_package_ids().collect();
        {
            let (_, bin_map) = self.layer_mut(bootstrap);
            for bin in &bins {
                bin_map.remove(bin);
            }
        }

        for bin in bins {
            let node = PkgId::Bin(bin);
            for neighbor in self.graph.outgoing_edges(&node) {
                self.graph.remove_edge(&node, &neighbor);
            }
            // Incoming edges from dependents are recorded as broken.
            self.graph.remove_node(&node);
        }

        let node = PkgId::Src(src.clone());
        for neighbor in self.graph.outgoing_edges(&node) {
            self.graph.remove_edge(&node, &neighbor);
        }
        self.graph.remove_node(&node);
        Ok(())
    }

    /// True iff every build-dep of the source and every runtime dep of
    /// every binary it produces resolves in the layer's binary map.
    /// `prev:` references are satisfied by convention.
    pub fn validate_depends(&self, src: &SrcPkgId, bootstrap: bool) -> bool {
        let (src_map, bin_map) = self.layer(bootstrap);
        let Some(record) = src_map.get(src) else {
            return false;
        };
        let dep_ok = |dep: &BinPkgId| dep.is_prev() || bin_map.contains_key(dep);

        record.build_depends_ids().all(|dep| dep_ok(&dep))
            && record
                .binary_package_ids()
                .all(|bin| match bin_map.get(&bin) {
                    Some(bin_record) => bin_record.depends_ids().all(|dep| dep_ok(&dep)),
                    None => false,
                })
    }

    /// Apply a change bundle. The mutation order is the contract:
    /// removals (bootstrap, then normal), bootstrap additions, bootstrap
    /// updates, normal additions, normal updates. Validation runs once at
    /// the end, over everything the bundle touched.
    pub fn update_with_changes(
        &mut self,
        pkg_changes: &SnapshotChanges,
        bootstrap_changes: &SnapshotChanges,
        resolver: &DependencyResolver,
    ) -> Result<()> {
        for src in &bootstrap_changes.remove {
            self.remove_pkg(src, true)?;
        }
        for src in &pkg_changes.remove {
            self.remove_pkg(src, false)?;
        }

        let mut touched: Vec<(SrcPkgId, bool)> = Vec::new();
        let mut touch = |touched: &mut Vec<(SrcPkgId, bool)>, name: &str, bootstrap: bool| {
            let src = SrcPkgId::new(name);
            if bootstrap {
                touched.push((src.to_bootstrap(), true));
            }
            touched.push((src, bootstrap));
        };

        for add in &bootstrap_changes.add {
            let deps = resolver.resolve(&add.name, &add.version, true)?;
            self.add_pkg(&add.name, &add.version, &deps, true)?;
            touch(&mut touched, &add.name, true);
        }
        for update in &bootstrap_changes.update {
            self.remove_pkg(&SrcPkgId::new(&update.name), true)?;
            let deps = resolver.resolve(&update.name, &update.to, true)?;
            self.add_pkg(&update.name, &update.to, &deps, true)?;
            touch(&mut touched, &update.name, true);
        }
        for add in &pkg_changes.add {
            let deps = resolver.resolve(&add.name, &add.version, false)?;
            self.add_pkg(&add.name, &add.version, &deps, false)?;
            touch(&mut touched, &add.name, false);
        }
        for update in &pkg_changes.update {
            self.remove_pkg(&SrcPkgId::new(&update.name), false)?;
            let deps = resolver.resolve(&update.name, &update.to, false)?;
            self.add_pkg(&update.name, &update.to, &deps, false)?;
            touch(&mut touched, &update.name, false);
        }

        for (src, bootstrap) in &touched {
            if !self.validate_depends(src, *bootstrap) {
                return Err(Error::UnresolvedDependencies(src.clone().into()));
            }
        }
        if self.graph.is_broken() {
            let detail = self
                .graph
                .broken_edges()
                .map(|(from, to)| format!("{from} -> {to}"))
                .sorted()
                .join(", ");
            return Err(Error::BrokenGraph(detail));
        }

        // This graph now represents the given changes applied on top of the
        // snapshot it was loaded as.
        self.ancestor = Some(self.name.clone());
        self.changes = pkg_changes.clone();
        self.bootstrap_changes = bootstrap_changes.clone();
        Ok(())
    }

    /// Transitive runtime depends of a binary, following only
    /// binary-to-binary edges.
    pub fn runtime_depends_of(&self, bin: &BinPkgId) -> Vec<BinPkgId> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([bin.clone()]);

        while let Some(current) = queue.pop_front() {
            for neighbor in self.graph.neighbors(&PkgId::Bin(current)) {
                if let PkgId::Bin(dep) = neighbor {
                    if visited.insert(dep.clone()) {
                        result.push(dep.clone());
                        queue.push_back(dep);
                    }
                }
            }
        }

        result.sort();
        result
    }

    /// Every binary needed while building `src`: each direct build-dep plus
    /// its transitive runtime depends.
    pub fn build_depends_closure(&self, src: &SrcPkgId, bootstrap: bool) -> Vec<BinPkgId> {
        let (src_map, _) = self.layer(bootstrap);
        let Some(record) = src_map.get(src) else {
            return Vec::new();
        };

        let mut closure: Vec<BinPkgId> = Vec::new();
        let mut seen = HashSet::new();
        for dep in record.build_depends_ids() {
            if seen.insert(dep.clone()) {
                closure.push(dep.clone());
            }
            for transitive in self.runtime_depends_of(&dep) {
                if seen.insert(transitive.clone()) {
                    closure.push(transitive);
                }
            }
        }
        closure
    }

    /// Record the content hash of a built binary. The id must be known to
    /// at least one layer.
    pub fn commit_bin_sha(&mut self, bin: &BinPkgId, sha256: &str) -> Result<()> {
        let mut found = false;
        if let Some(record) = self.bootstrap_bin_pkg_map.get_mut(bin) {
            record.sha256 = sha256.to_string();
            found = true;
        }
        if let Some(record) = self.bin_pkg_map.get_mut(bin) {
            record.sha256 = sha256.to_string();
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(Error::UnresolvedDependencies(bin.clone().into()))
        }
    }

    pub fn binary_pkgs_are_complete(&self) -> bool {
        self.bin_pkg_map
            .values()
            .chain(self.bootstrap_bin_pkg_map.values())
            .all(SnapshotBinPkg::is_built)
    }

    /// The first package whose record differs (including absence) between
    /// this snapshot and `other`. Used for reproducibility assertions.
    pub fn compare_pkgs_with(&self, other: &SnapshotGraph) -> Option<PkgId> {
        fn first_diff<K, V>(a: &BTreeMap<K, V>, b: &BTreeMap<K, V>) -> Option<K>
        where
            K: Ord + Clone,
            V: PartialEq,
        {
            a.keys()
                .chain(b.keys())
                .find(|key| a.get(key) != b.get(key))
                .cloned()
        }

        if let Some(id) = first_diff(&self.src_pkg_map, &other.src_pkg_map) {
            return Some(id.into());
        }
        if let Some(id) = first_diff(&self.bin_pkg_map, &other.bin_pkg_map) {
            return Some(id.into());
        }
        if let Some(id) = first_diff(&self.bootstrap_src_pkg_map, &other.bootstrap_src_pkg_map) {
            return Some(id.into());
        }
        if let Some(id) = first_diff(&self.bootstrap_bin_pkg_map, &other.bootstrap_bin_pkg_map) {
            return Some(id.into());
        }
        None
    }

    /// The persistable record of this snapshot under the given name.
    pub fn to_snapshot(&self, name: impl Into<String>) -> Snapshot {
        let layer_pkgs = |src_map: &BTreeMap<SrcPkgId, SnapshotSrcPkg>,
                          bin_map: &BTreeMap<BinPkgId, SnapshotBinPkg>| {
            src_map
                .values()
                .cloned()
                .map(SnapshotPkg::Src)
                .chain(bin_map.values().cloned().map(SnapshotPkg::Bin))
                .collect()
        };

        Snapshot {
            version: snapshot::SCHEMA_VERSION,
            name: name.into(),
            ancestor: self.ancestor.clone(),
            pkgs: layer_pkgs(&self.src_pkg_map, &self.bin_pkg_map),
            bootstrap_pkgs: layer_pkgs(&self.bootstrap_src_pkg_map, &self.bootstrap_bin_pkg_map),
            changes: self.changes.clone(),
            bootstrap_changes: self.bootstrap_changes.clone(),
        }
    }

    /// Persist under a fresh timestamp name and return it. Fails if any
    /// binary still holds the placeholder sha.
    pub fn dump(&self, store: &StoreLayout) -> Result<String> {
        if !self.binary_pkgs_are_complete() {
            return Err(Error::BuildIncomplete);
        }
        let name = snapshot::timestamp_name()?;
        snapshot::write_snapshot(store, &self.to_snapshot(name.clone()))?;
        Ok(name)
    }
}
