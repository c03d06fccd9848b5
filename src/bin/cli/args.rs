use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use url::Url;

use snapforge::snapshot::{ChangeAdd, ChangeUpdate};

fn parse_versioned_pkg(value: &str) -> Result<ChangeAdd, String> {
    match value.split_once('=') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => Ok(ChangeAdd {
            name: name.to_string(),
            version: version.to_string(),
        }),
        _ => Err(format!(
            "\"{value}\" is not a valid package id. Pass <pkg name>=<pkg version>"
        )),
    }
}

fn parse_pkg_update(value: &str) -> Result<ChangeUpdate, String> {
    let err = || {
        format!("\"{value}\" is not a valid update. Pass <pkg name>=<from version>..<to version>")
    };
    let (name, versions) = value.split_once('=').ok_or_else(err)?;
    let (from, to) = versions.split_once("..").ok_or_else(err)?;
    if name.is_empty() || from.is_empty() || to.is_empty() {
        return Err(err());
    }
    Ok(ChangeUpdate {
        name: name.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    })
}

#[derive(Debug, Clone, Parser)]
#[command(name = "snapforge", author, about, version)]
pub struct Args {
    /// Be verbose. Specify twice to be more verbose
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Root of the snapforge store
    #[arg(long, env = "SNAPFORGE_STORE", default_value = ".snapforge", global = true)]
    pub store: Utf8PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Build and inspect snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    /// Keep stream snapshots in sync with their configs
    Stream {
        #[command(subcommand)]
        command: StreamCommand,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum SnapshotCommand {
    /// Apply changes to a snapshot, build everything affected, and commit
    /// the result as a new snapshot
    Change {
        /// Snapshot to start from. Use "root" for an empty snapshot
        #[arg(long)]
        from: String,

        /// Source package to add, as <name>=<version>. Repeatable
        #[arg(long = "add", value_parser = parse_versioned_pkg)]
        add: Vec<ChangeAdd>,

        /// Source package to remove. Repeatable
        #[arg(long = "remove")]
        remove: Vec<String>,

        /// Source package to update, as <name>=<from>..<to>. Repeatable
        #[arg(long = "update", value_parser = parse_pkg_update)]
        update: Vec<ChangeUpdate>,

        /// Bootstrap package to add, as <name>=<version>. Repeatable
        #[arg(long = "bootstrap-add", value_parser = parse_versioned_pkg)]
        bootstrap_add: Vec<ChangeAdd>,

        /// Path to the package index
        #[arg(long)]
        pkg_index: Utf8PathBuf,

        /// Number of parallel builds
        #[arg(long, default_value_t = 1)]
        parallel: usize,

        /// Base URL for source tarball downloads
        #[arg(long, env = "SNAPFORGE_SOURCE_URL")]
        source_url: Option<Url>,
    },
    /// Rebuild a snapshot from root and verify the result is identical
    Reproduce {
        /// Snapshot to reproduce
        name: String,

        /// Path to the package index
        #[arg(long)]
        pkg_index: Utf8PathBuf,

        /// Number of parallel builds
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum StreamCommand {
    /// Update the stream's snapshot based on the latest stream config
    Update {
        /// Stream name
        name: String,

        /// Path to the package index
        #[arg(long)]
        pkg_index: Utf8PathBuf,

        /// Number of parallel builds
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_pkg_parses() {
        let add = parse_versioned_pkg("make=4.4.1-2").unwrap();
        assert_eq!((add.name.as_str(), add.version.as_str()), ("make", "4.4.1-2"));
        assert!(parse_versioned_pkg("make").is_err());
        assert!(parse_versioned_pkg("=1.0").is_err());
    }

    #[test]
    fn pkg_update_parses() {
        let update = parse_pkg_update("make=4.4-1..4.5-1").unwrap();
        assert_eq!(update.from, "4.4-1");
        assert_eq!(update.to, "4.5-1");
        assert!(parse_pkg_update("make=4.4-1").is_err());
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from([
            "snapforge",
            "snapshot",
            "change",
            "--from",
            "root",
            "--add",
            "pkg3=1.0",
            "--pkg-index",
            "./pi",
            "--parallel",
            "4",
        ]);
        let Command::Snapshot {
            command:
                SnapshotCommand::Change {
                    from, add, parallel, ..
                },
        } = args.command
        else {
            panic!("expected snapshot change");
        };
        assert_eq!(from, "root");
        assert_eq!(add.len(), 1);
        assert_eq!(parallel, 4);
    }
}
