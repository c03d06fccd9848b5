use std::io;

use camino::Utf8Path;
use sha2::{Digest, Sha256, Sha512};

use crate::error::Result;

pub fn sha256_file(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha512_file(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha512::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
