use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use clap::Parser;
use colored::Colorize;
use url::Url;

use snapforge::builder::RulesBuilder;
use snapforge::changes::process_changes;
use snapforge::resolve::DependencyResolver;
use snapforge::snapshot::{ChangeAdd, SnapshotChanges};
use snapforge::snapshot_graph::SnapshotGraph;
use snapforge::store::StoreLayout;
use snapforge::stream::{self, StreamState};
use snapforge::{PkgId, SrcPkgId};

use crate::args::{Args, Command, SnapshotCommand, StreamCommand};

mod args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    snapforge::tracing::init(args.verbose);
    tracing::debug!("{args:?}");

    let store = StoreLayout::new(args.store.clone());
    store.ensure_dirs().context("Failed to create store directories")?;

    match args.command {
        Command::Snapshot { command } => match command {
            SnapshotCommand::Change {
                from,
                add,
                remove,
                update,
                bootstrap_add,
                pkg_index,
                parallel,
                source_url,
            } => {
                let pkg_changes = SnapshotChanges {
                    add,
                    remove: remove.into_iter().map(SrcPkgId::new).collect(),
                    update,
                };
                let bootstrap_changes = SnapshotChanges {
                    add: bootstrap_add,
                    remove: vec![],
                    update: vec![],
                };
                snapshot_change(
                    &store,
                    &from,
                    pkg_changes,
                    bootstrap_changes,
                    &pkg_index,
                    parallel,
                    source_url,
                )
                .await?;
            }
            SnapshotCommand::Reproduce {
                name,
                pkg_index,
                parallel,
            } => {
                snapshot_reproduce(&store, &name, &pkg_index, parallel).await?;
            }
        },
        Command::Stream { command } => match command {
            StreamCommand::Update {
                name,
                pkg_index,
                parallel,
            } => {
                stream_update(&store, &name, &pkg_index, parallel).await?;
            }
        },
    }
    Ok(())
}

fn make_builder(store: &StoreLayout, pkg_index: &Utf8Path, source_url: Option<Url>) -> RulesBuilder {
    let builder = RulesBuilder::new(store.clone(), pkg_index.to_owned());
    match source_url {
        Some(url) => builder.with_source_url(url.as_str().trim_end_matches('/')),
        None => builder,
    }
}

async fn snapshot_change(
    store: &StoreLayout,
    from: &str,
    pkg_changes: SnapshotChanges,
    bootstrap_changes: SnapshotChanges,
    pkg_index: &Utf8Path,
    parallel: usize,
    source_url: Option<Url>,
) -> Result<()> {
    let mut snapshot = SnapshotGraph::load(store, from)
        .with_context(|| format!("Failed to load snapshot {from}"))?;

    let builder = make_builder(store, pkg_index, source_url);
    let resolver = DependencyResolver::new(pkg_index, builder.cygwin_manifest());

    process_changes(
        &mut snapshot,
        &pkg_changes,
        &bootstrap_changes,
        &resolver,
        &builder,
        store,
        parallel,
    )
    .await?;

    let name = snapshot.dump(store)?;
    println!("Created snapshot {}", name.bold());
    Ok(())
}

async fn snapshot_reproduce(
    store: &StoreLayout,
    name: &str,
    pkg_index: &Utf8Path,
    parallel: usize,
) -> Result<()> {
    let mut snapshot = SnapshotGraph::load(store, "root")?;
    let target = SnapshotGraph::load(store, name)
        .with_context(|| format!("Failed to load snapshot {name}"))?;

    // Re-add everything the target contains. Synthetic twins are skipped;
    // the add path re-synthesizes them.
    let changes_for = |src_map: &std::collections::BTreeMap<
        SrcPkgId,
        snapforge::snapshot::SnapshotSrcPkg,
    >| SnapshotChanges {
        add: src_map
            .iter()
            .filter(|(id, _)| !id.is_bootstrap())
            .map(|(id, record)| ChangeAdd {
                name: id.name().to_string(),
                version: record.version.clone(),
            })
            .collect(),
        remove: vec![],
        update: vec![],
    };
    let pkg_changes = changes_for(target.src_pkg_map());
    let bootstrap_changes = changes_for(target.bootstrap_src_pkg_map());

    let builder = make_builder(store, pkg_index, None);
    let resolver = DependencyResolver::new(pkg_index, builder.cygwin_manifest());

    process_changes(
        &mut snapshot,
        &pkg_changes,
        &bootstrap_changes,
        &resolver,
        &builder,
        store,
        parallel,
    )
    .await?;

    match snapshot.compare_pkgs_with(&target) {
        None => {
            println!(
                "{}",
                format!("All packages in snapshot {name} are reproducible").green()
            );
            Ok(())
        }
        Some(different) => {
            println!(
                "{}",
                format!("{different} in snapshot {name} is not reproducible").red()
            );
            println!("Package data obtained from reproduction:");
            let reproduced = match &different {
                PkgId::Src(id) => snapshot
                    .src_pkg(id)
                    .map(|(record, _)| serde_json::to_string_pretty(record))
                    .transpose()?,
                PkgId::Bin(id) => snapshot
                    .bin_pkg(id)
                    .map(serde_json::to_string_pretty)
                    .transpose()?,
            };
            println!("{}", reproduced.unwrap_or_else(|| "<absent>".to_string()));
            bail!("snapshot {name} is not reproducible");
        }
    }
}

async fn stream_update(
    store: &StoreLayout,
    name: &str,
    pkg_index: &Utf8Path,
    parallel: usize,
) -> Result<()> {
    tracing::info!("loading stream state");
    let from = match stream::load_stream_state(store, name)? {
        Some(state) => state.latest_snapshot,
        None => {
            tracing::info!("stream {name} has no snapshot yet, starting from root");
            "root".to_string()
        }
    };

    tracing::info!("loading current snapshot");
    let mut snapshot = SnapshotGraph::load(store, &from)
        .with_context(|| format!("Failed to load snapshot {from}"))?;

    tracing::info!("loading stream config");
    let config = stream::load_stream_config(pkg_index, name)
        .with_context(|| format!("Failed to load stream config {name}"))?;

    tracing::info!("resolving snapshot changes from stream config");
    let (pkg_changes, bootstrap_changes) = stream::resolve_changes(&config, &snapshot);
    if pkg_changes.is_empty() && bootstrap_changes.is_empty() {
        println!("Stream {} is up to date with {}", name.bold(), from.bold());
        return Ok(());
    }

    let builder = make_builder(store, pkg_index, None);
    let resolver = DependencyResolver::new(pkg_index, builder.cygwin_manifest());

    tracing::info!("processing snapshot changes");
    process_changes(
        &mut snapshot,
        &pkg_changes,
        &bootstrap_changes,
        &resolver,
        &builder,
        store,
        parallel,
    )
    .await?;

    tracing::info!("committing updated snapshot");
    let new_name = snapshot.dump(store)?;
    stream::write_stream_state(
        store,
        name,
        &StreamState {
            latest_snapshot: new_name.clone(),
        },
    )?;

    println!("Updated stream {} to snapshot {}", name.bold(), new_name.bold());
    Ok(())
}
