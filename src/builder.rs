//! Building a package by fetching its source and running its build rules.
use std::collections::BTreeMap;
use std::future::Future;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;

use crate::cygwin::{self, CygwinRelease};
use crate::error::{Error, Result};
use crate::interpolate::interpolate;
use crate::pkg_index::{self, CustomPkgConfig, CygwinPkgConfig, PkgConfig};
use crate::store::{self, StoreLayout};
use crate::tarball;
use crate::{hash, BinPkgId, SrcPkgId, BOOTSTRAP_PREFIX};

pub const DEFAULT_SOURCE_URL: &str = "https://pi.snapforge.dev/orig";
pub const DEFAULT_CYGWIN_URL: &str = "https://mirrors.kernel.org/sourceware/cygwin";

/// A dependency to install before building: the binary and its tarball in
/// the pkg store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepInstall {
    pub id: BinPkgId,
    pub tarball_name: String,
}

/// Everything the coordinator hands a builder for one source package. The
/// dep closure is resolved up front so builders never read the snapshot.
#[derive(Debug, Clone)]
pub struct ScheduledBuild {
    pub src: SrcPkgId,
    pub version: String,
    pub build_deps: Vec<DepInstall>,
    pub parallel: usize,
}

impl ScheduledBuild {
    /// Scratch directory name for this build. `:` is not portable in paths.
    fn scratch_name(&self) -> String {
        format!("{}-{}", self.src.name().replace(':', "_"), self.version)
    }
}

/// Turns one scheduled source package into binary output directories.
pub trait PackageBuilder {
    /// Build one source package, returning a map from produced binary name
    /// to the directory holding its files.
    fn build_pkg(
        &self,
        schedule: &ScheduledBuild,
    ) -> impl Future<Output = Result<BTreeMap<String, Utf8PathBuf>>> + Send;
}

/// The production builder: fetches and verifies the source tarball,
/// installs the dependency closure from the pkg store, and runs the
/// config's build rules on the host.
#[derive(Debug, Clone)]
pub struct RulesBuilder {
    store: StoreLayout,
    pi_path: Utf8PathBuf,
    source_base_url: String,
    cygwin_base_url: String,
    cygwin_manifest: Utf8PathBuf,
}

impl RulesBuilder {
    pub fn new(store: StoreLayout, pi_path: impl Into<Utf8PathBuf>) -> RulesBuilder {
        let cygwin_manifest = store.orig_dir().join("cygwin-setup.ini");
        RulesBuilder {
            store,
            pi_path: pi_path.into(),
            source_base_url: DEFAULT_SOURCE_URL.to_string(),
            cygwin_base_url: DEFAULT_CYGWIN_URL.to_string(),
            cygwin_manifest,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> RulesBuilder {
        self.source_base_url = url.into();
        self
    }

    pub fn with_cygwin_url(mut self, url: impl Into<String>) -> RulesBuilder {
        self.cygwin_base_url = url.into();
        self
    }

    pub fn with_cygwin_manifest(mut self, path: impl Into<Utf8PathBuf>) -> RulesBuilder {
        self.cygwin_manifest = path.into();
        self
    }

    pub fn cygwin_manifest(&self) -> &Utf8Path {
        &self.cygwin_manifest
    }

    async fn build_custom(
        &self,
        schedule: &ScheduledBuild,
        config: &CustomPkgConfig,
    ) -> Result<BTreeMap<String, Utf8PathBuf>> {
        let scratch = schedule.scratch_name();
        let build_dir = self.store.pkg_build_dir().join(&scratch);
        let output_root = self.store.pkg_output_dir().join(&scratch);
        let deps_dir = self.store.deps_dir().join(&scratch);
        for dir in [&build_dir, &output_root, &deps_dir] {
            store::clear_dir(dir)?;
        }

        // Fetch and verify the source tarball.
        let tarball_name = format!(
            "{}-{}.tar.{}",
            config.name, config.input.source_version, config.input.tarball_compression
        );
        let orig_file = self.store.orig_dir().join(&tarball_name);
        if !orig_file.exists() {
            std::fs::create_dir_all(self.store.orig_dir())?;
            fetch_url(
                &format!("{}/{tarball_name}", self.source_base_url.trim_end_matches('/')),
                &orig_file,
            )
            .await?;
        }

        tracing::info!("verifying {tarball_name}");
        let actual = {
            let orig_file = orig_file.clone();
            run_blocking(move || hash::sha256_file(&orig_file)).await?
        };
        if actual != config.input.sha256 {
            return Err(Error::HashMismatch {
                expected: config.input.sha256.clone(),
                actual,
            });
        }

        // Extract the source.
        tracing::info!("extracting {tarball_name}");
        {
            let orig_file = orig_file.clone();
            let build_dir = build_dir.clone();
            let root_dir = config.input.tarball_root_dir.clone();
            let compression = config.input.tarball_compression;
            run_blocking(move || match root_dir {
                Some(root) => tarball::extract_subdir(&orig_file, &root, &build_dir, compression),
                None => tarball::extract(&orig_file, &build_dir, compression),
            })
            .await?;
        }

        // Apply patches.
        let patch_dir = pkg_index::pkg_config_path(&self.pi_path, &config.name, &config.version)
            .with_file_name("patches");
        for patch_name in &config.input.patches {
            tracing::info!("applying {patch_name}");
            let patch_path = patch_dir.join(patch_name);
            if !patch_path.exists() {
                return Err(Error::BuildFailed {
                    src: schedule.src.clone(),
                    reason: format!("patch {patch_name} not found in {patch_dir}"),
                });
            }
            let status = Command::new("patch")
                .args(["-p0", "-d", build_dir.as_str(), "-i", patch_path.as_str()])
                .status()
                .await?;
            if !status.success() {
                return Err(Error::BuildFailed {
                    src: schedule.src.clone(),
                    reason: format!("failed to apply {patch_name}"),
                });
            }
        }

        // Install the dependency closure.
        tracing::info!("installing {} dependencies", schedule.build_deps.len());
        for dep in &schedule.build_deps {
            let store = self.store.clone();
            let tarball_name = dep.tarball_name.clone();
            let deps_dir = deps_dir.clone();
            run_blocking(move || store::install_pkg(&store, &tarball_name, &deps_dir)).await?;
        }

        // Run the build rules.
        let context = BTreeMap::from([
            ("build_dir".to_string(), build_dir.to_string()),
            ("output_dir".to_string(), output_root.to_string()),
            ("deps_dir".to_string(), deps_dir.to_string()),
            ("parallelism".to_string(), schedule.parallel.to_string()),
        ]);

        for rule in &config.rules.default {
            let argv: Vec<String> = rule
                .argv()
                .iter()
                .map(|token| interpolate(token, &context))
                .collect::<Result<_>>()?;
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let cwd = match rule.cwd() {
                Some(cwd) => build_dir.join(interpolate(cwd, &context)?),
                None => build_dir.clone(),
            };

            let mut cmd = Command::new(program);
            cmd.args(args).current_dir(&cwd);
            cmd.env("SOURCE_DATE_EPOCH", "0");
            if let Some(env) = rule.env() {
                for (key, value) in env {
                    cmd.env(interpolate(key, &context)?, interpolate(value, &context)?);
                }
            }
            prepend_deps_path(&mut cmd, &deps_dir)?;

            // Log build output to files next to the build.
            let stdout_log = build_dir.join("stdout.log");
            let stderr_log = build_dir.join("stderr.log");
            cmd.stdout(Stdio::from(open_log(&stdout_log)?));
            cmd.stderr(Stdio::from(open_log(&stderr_log)?));

            tracing::info!("running {argv:?} in {cwd}");
            let status = cmd.status().await?;
            if !status.success() {
                return Err(Error::BuildFailed {
                    src: schedule.src.clone(),
                    reason: format!("command {argv:?} exited with {status}"),
                });
            }
        }

        // Collect per-binary output directories.
        let twin = schedule.src.is_bootstrap();
        let mut outputs = BTreeMap::new();
        for (bin_name, section) in &config.binaries {
            let dir = match &section.output_dir {
                Some(sub) => output_root.join(interpolate(sub, &context)?),
                None => output_root.clone(),
            };
            let name = if twin {
                format!("{BOOTSTRAP_PREFIX}{bin_name}")
            } else {
                bin_name.clone()
            };
            outputs.insert(name, dir);
        }
        Ok(outputs)
    }

    /// A cygwin package is not built: its upstream install tarball is
    /// downloaded, checksum-verified, and extracted as the output.
    async fn build_cygwin(
        &self,
        schedule: &ScheduledBuild,
        config: &CygwinPkgConfig,
    ) -> Result<BTreeMap<String, Utf8PathBuf>> {
        if !self.cygwin_manifest.exists() {
            std::fs::create_dir_all(self.store.orig_dir())?;
            fetch_url(
                &format!("{}/x86_64/setup.ini", self.cygwin_base_url),
                &self.cygwin_manifest,
            )
            .await?;
        }
        let release = CygwinRelease::load(&self.cygwin_manifest)?;
        let install_path = release.install_path(&config.name, &config.version)?;

        let file_name = install_path.rsplit('/').next().unwrap_or(install_path);
        let orig_file = self.store.orig_dir().join(file_name);
        if !orig_file.exists() {
            std::fs::create_dir_all(self.store.orig_dir())?;
            fetch_url(&format!("{}/{install_path}", self.cygwin_base_url), &orig_file).await?;

            // The mirror publishes a sha512.sum next to each tarball.
            let checksum_url = match install_path.rsplit_once('/') {
                Some((dir, _)) => format!("{}/{dir}/sha512.sum", self.cygwin_base_url),
                None => format!("{}/sha512.sum", self.cygwin_base_url),
            };
            let checksums = cygwin::parse_checksum_file(
                &reqwest::get(&checksum_url).await?.error_for_status()?.text().await?,
            );
            let expected = checksums.get(file_name).cloned().unwrap_or_default();
            let actual = {
                let orig_file = orig_file.clone();
                run_blocking(move || hash::sha512_file(&orig_file)).await?
            };
            if actual != expected {
                return Err(Error::HashMismatch { expected, actual });
            }
        }

        let output = self.store.pkg_output_dir().join(schedule.scratch_name());
        store::clear_dir(&output)?;
        {
            let orig_file = orig_file.clone();
            let output = output.clone();
            let compression = match file_name.rsplit('.').next() {
                Some("gz") => tarball::Compression::Gz,
                _ => tarball::Compression::Xz,
            };
            run_blocking(move || tarball::extract(&orig_file, &output, compression)).await?;
        }

        let name = if schedule.src.is_bootstrap() {
            format!("{BOOTSTRAP_PREFIX}{}", config.name)
        } else {
            config.name.clone()
        };
        Ok(BTreeMap::from([(name, output)]))
    }
}

impl PackageBuilder for RulesBuilder {
    async fn build_pkg(
        &self,
        schedule: &ScheduledBuild,
    ) -> Result<BTreeMap<String, Utf8PathBuf>> {
        // Synthetic twins build from the base package's config.
        let base = schedule
            .src
            .strip_bootstrap()
            .unwrap_or_else(|| schedule.src.clone());
        let config = pkg_index::load_pkg_config(&self.pi_path, base.name(), &schedule.version)?;

        tracing::info!("building {} {}", schedule.src, schedule.version);
        match &config {
            PkgConfig::Custom(custom) => self.build_custom(schedule, custom).await,
            PkgConfig::Cygwin(cygwin) => self.build_cygwin(schedule, cygwin).await,
        }
    }
}

fn open_log(path: &Utf8Path) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Put the installed dependencies' bin dirs in front of PATH.
fn prepend_deps_path(cmd: &mut Command, deps_dir: &Utf8Path) -> Result<()> {
    let mut paths = vec![
        deps_dir.join("bin").into_std_path_buf(),
        deps_dir.join("usr/bin").into_std_path_buf(),
    ];
    if let Some(path) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&path));
    }
    let joined = std::env::join_paths(paths)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    cmd.env("PATH", joined);
    Ok(())
}

async fn fetch_url(url: &str, target: &Utf8Path) -> Result<()> {
    tracing::info!("fetching {url}");
    let response = reqwest::get(url).await?.error_for_status()?;
    let bytes = response.bytes().await?;
    tokio::fs::write(target, &bytes).await?;
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    /// An index with one `hello` package whose build copies a source file
    /// into the output dir. Everything is offline: the source tarball is
    /// pre-seeded into the orig cache.
    fn fixture(store: &StoreLayout, pi: &Utf8Path) -> String {
        let source_tree = store.root().join("seed/hello-1.0");
        std::fs::create_dir_all(&source_tree).unwrap();
        std::fs::write(source_tree.join("hello.c"), b"int main() {}\n").unwrap();

        std::fs::create_dir_all(store.orig_dir()).unwrap();
        let orig = store.orig_dir().join("hello-1.0.tar.xz");
        tarball::pack_dir_deterministic(&store.root().join("seed"), &orig).unwrap();
        let sha256 = hash::sha256_file(&orig).unwrap();

        let config_dir = pi.join("pkg/hello/1.0-1");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("pkg.toml"),
            format!(
                r#"
schema_version = 0
pkg_type = "custom"
name = "hello"
version = "1.0-1"

[pkg]
supported_platforms = ["linux-x86_64"]

[input]
sha256 = "{sha256}"
source_version = "1.0"
tarball_root_dir = "hello-1.0"
tarball_compression = "xz"

[rules]
default = [
    {{ rule = ["cp", "hello.c", "${{output_dir}}/hello.c"] }},
]

[binaries.hello-bin]
"#
            ),
        )
        .unwrap();
        sha256
    }

    #[tokio::test]
    async fn builds_a_custom_package_offline() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(utf8(dir.path()));
        let pi = store.root().join("pi");
        fixture(&store, &pi);

        let builder = RulesBuilder::new(store.clone(), pi);
        let schedule = ScheduledBuild {
            src: SrcPkgId::new("hello"),
            version: "1.0-1".into(),
            build_deps: vec![],
            parallel: 1,
        };

        let outputs = builder.build_pkg(&schedule).await.unwrap();
        let output_dir = &outputs["hello-bin"];
        assert_eq!(
            std::fs::read(output_dir.join("hello.c")).unwrap(),
            b"int main() {}\n"
        );
    }

    #[tokio::test]
    async fn corrupted_source_is_a_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(utf8(dir.path()));
        let pi = store.root().join("pi");
        fixture(&store, &pi);

        // Tamper with the cached source tarball.
        std::fs::write(store.orig_dir().join("hello-1.0.tar.xz"), b"garbage").unwrap();

        let builder = RulesBuilder::new(store.clone(), pi);
        let schedule = ScheduledBuild {
            src: SrcPkgId::new("hello"),
            version: "1.0-1".into(),
            build_deps: vec![],
            parallel: 1,
        };

        assert!(matches!(
            builder.build_pkg(&schedule).await,
            Err(Error::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn failing_rule_is_a_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(utf8(dir.path()));
        let pi = store.root().join("pi");
        fixture(&store, &pi);

        // Rewrite the rules to something that exits non-zero.
        let config_path = pi.join("pkg/hello/1.0-1/pkg.toml");
        let config = std::fs::read_to_string(&config_path)
            .unwrap()
            .replace(r#"["cp", "hello.c", "${output_dir}/hello.c"]"#, r#"["false"]"#);
        std::fs::write(&config_path, config).unwrap();

        let builder = RulesBuilder::new(store.clone(), pi);
        let schedule = ScheduledBuild {
            src: SrcPkgId::new("hello"),
            version: "1.0-1".into(),
            build_deps: vec![],
            parallel: 1,
        };

        assert!(matches!(
            builder.build_pkg(&schedule).await,
            Err(Error::BuildFailed { .. })
        ));
    }
}
