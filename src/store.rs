//! Store directory layout and the content-addressed pkg store.
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{Error, Result};
use crate::tarball::{self, Compression};
use crate::{hash, BinPkgId};

/// All on-disk state lives under a single root: durable data under
/// `share/`, scratch space under `local/`.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: Utf8PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> StoreLayout {
        StoreLayout { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn snapshot_dir(&self) -> Utf8PathBuf {
        self.root.join("share/snapshot")
    }

    /// The content-addressed pkg store.
    pub fn pkg_dir(&self) -> Utf8PathBuf {
        self.root.join("share/pkg")
    }

    pub fn stream_dir(&self) -> Utf8PathBuf {
        self.root.join("share/stream")
    }

    /// Cache of downloaded source tarballs and upstream manifests.
    pub fn orig_dir(&self) -> Utf8PathBuf {
        self.root.join("share/orig")
    }

    pub fn pkg_build_dir(&self) -> Utf8PathBuf {
        self.root.join("local/pkg_build")
    }

    pub fn pkg_output_dir(&self) -> Utf8PathBuf {
        self.root.join("local/pkg_output")
    }

    pub fn deps_dir(&self) -> Utf8PathBuf {
        self.root.join("local/deps")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.snapshot_dir(),
            self.pkg_dir(),
            self.stream_dir(),
            self.orig_dir(),
            self.pkg_build_dir(),
            self.pkg_output_dir(),
            self.deps_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Deterministically tar a build output, hash it, and publish it into the
/// pkg store as `<binary-name>-<sha256>.tar.xz`. A pre-existing target file
/// is assumed identical (it is content-keyed) and kept. Returns the sha256.
pub async fn publish_pkg_output(
    store: &StoreLayout,
    binary: &BinPkgId,
    output_dir: &Utf8Path,
) -> Result<String> {
    let store = store.clone();
    let binary = binary.clone();
    let output_dir = output_dir.to_owned();
    tokio::task::spawn_blocking(move || publish_blocking(&store, &binary, &output_dir))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn publish_blocking(store: &StoreLayout, binary: &BinPkgId, output_dir: &Utf8Path) -> Result<String> {
    std::fs::create_dir_all(store.pkg_dir())?;

    // Tar into a temp file in the store directory itself so the final
    // publish is a same-filesystem atomic rename.
    let temp = tempfile::Builder::new()
        .prefix(".publish-")
        .suffix(".tar.xz")
        .tempfile_in(store.pkg_dir())?;
    let temp_path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .map_err(|_| Error::Io(io::Error::other("non-UTF-8 temp path")))?;

    tarball::pack_dir_deterministic(output_dir, &temp_path)?;
    let sha256 = hash::sha256_file(&temp_path)?;

    let target = store
        .pkg_dir()
        .join(format!("{}-{sha256}.tar.xz", binary.name()));
    if target.exists() {
        tracing::info!("reusing {}", target.file_name().unwrap_or_default());
    } else {
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
    }

    Ok(sha256)
}

/// Extract a stored binary tarball into `target`.
pub fn install_pkg(store: &StoreLayout, tarball_name: &str, target: &Utf8Path) -> Result<()> {
    tarball::extract(
        &store.pkg_dir().join(tarball_name),
        target,
        Compression::Xz,
    )
}

/// Remove and recreate a directory, leaving it empty.
pub fn clear_dir(dir: &Utf8Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        );
        (dir, store)
    }

    #[test]
    fn layout_matches_store_conventions() {
        let store = StoreLayout::new("/data");
        assert_eq!(store.snapshot_dir(), "/data/share/snapshot");
        assert_eq!(store.pkg_dir(), "/data/share/pkg");
        assert_eq!(store.stream_dir(), "/data/share/stream");
        assert_eq!(store.pkg_build_dir(), "/data/local/pkg_build");
        assert_eq!(store.pkg_output_dir(), "/data/local/pkg_output");
        assert_eq!(store.deps_dir(), "/data/local/deps");
    }

    #[tokio::test]
    async fn publish_is_deduplicating_and_deterministic() {
        let (_dir, store) = temp_store();
        let output = store.pkg_output_dir().join("pkg3");
        std::fs::create_dir_all(output.join("bin")).unwrap();
        std::fs::write(output.join("bin/pkg3"), b"binary").unwrap();

        let binary = BinPkgId::new("pkg3-bin");
        let first = publish_pkg_output(&store, &binary, &output).await.unwrap();
        let second = publish_pkg_output(&store, &binary, &output).await.unwrap();
        assert_eq!(first, second);

        let entries: Vec<_> = std::fs::read_dir(store.pkg_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![format!("pkg3-bin-{first}.tar.xz")]);
    }

    #[tokio::test]
    async fn published_tarballs_install_back() {
        let (_dir, store) = temp_store();
        let output = store.pkg_output_dir().join("pkg3");
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(output.join("data"), b"payload").unwrap();

        let binary = BinPkgId::new("pkg3-bin");
        let sha256 = publish_pkg_output(&store, &binary, &output).await.unwrap();

        let target = store.deps_dir().join("unpack");
        install_pkg(&store, &format!("pkg3-bin-{sha256}.tar.xz"), &target).unwrap();
        assert_eq!(std::fs::read(target.join("data")).unwrap(), b"payload");
    }

    #[test]
    fn clear_dir_empties() {
        let (_dir, store) = temp_store();
        let dir = store.pkg_build_dir().join("pkg1");
        std::fs::create_dir_all(dir.join("junk")).unwrap();
        clear_dir(&dir).unwrap();
        assert!(dir.exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}
