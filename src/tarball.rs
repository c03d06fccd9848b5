//! Tarball packing and extraction with reproducible output.
use std::fs::File;
use std::io::{self, Read};

use camino::Utf8Path;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::Result;

/// Fixed xz preset. Part of the reproducibility contract: changing it
/// changes every content hash in the store.
const XZ_LEVEL: u32 = 6;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    Gz,
    Xz,
}

/// Pack the recursive contents of `dir` into an xz-compressed tarball at
/// `dest`. Entries are relative to `dir` itself (leading `./`), walked in
/// sorted order, with mtime zeroed and ownership normalized to root, so
/// bit-identical input directories produce bit-identical tarballs.
pub fn pack_dir_deterministic(dir: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let file = File::create(dest)?;
    let encoder = XzEncoder::new(file, XZ_LEVEL);
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    builder.append_dir(".", dir.as_std_path())?;

    for entry in WalkDir::new(dir.as_std_path())
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(dir.as_std_path())
            .expect("walked path is below its root");
        let name = std::path::Path::new(".").join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            builder.append_link(&mut header, &name, target)?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

fn open_archive(
    tar_path: &Utf8Path,
    compression: Compression,
) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(tar_path)?;
    let reader: Box<dyn Read> = match compression {
        Compression::Gz => Box::new(GzDecoder::new(file)),
        Compression::Xz => Box::new(XzDecoder::new(file)),
    };
    Ok(tar::Archive::new(reader))
}

/// Extract a tarball into `dest`, making extracted entries writable so
/// later build steps can modify or delete them.
pub fn extract(tar_path: &Utf8Path, dest: &Utf8Path, compression: Compression) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = open_archive(tar_path, compression)?;
    archive.unpack(dest)?;
    make_writable(dest)?;
    Ok(())
}

/// Extract only the contents of `root_dir` inside the tarball, stripping
/// the prefix. Used for source tarballs that wrap everything in a
/// `name-version/` directory.
pub fn extract_subdir(
    tar_path: &Utf8Path,
    root_dir: &str,
    dest: &Utf8Path,
    compression: Compression,
) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = open_archive(tar_path, compression)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        // Normalize away leading `./` components so `root_dir` matches
        // however the tarball spells its paths.
        let path: std::path::PathBuf = entry
            .path()?
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .collect();
        let Ok(relative) = path.strip_prefix(root_dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.as_std_path().join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }

    make_writable(dest)?;
    Ok(())
}

fn make_writable(dir: &Utf8Path) -> Result<()> {
    for entry in WalkDir::new(dir.as_std_path()) {
        let entry = entry.map_err(io::Error::from)?;
        let metadata = entry.metadata().map_err(io::Error::from)?;
        let mut permissions = metadata.permissions();
        if permissions.readonly() && !entry.file_type().is_symlink() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            std::fs::set_permissions(entry.path(), permissions)?;
        }
    }
    Ok(())
}
