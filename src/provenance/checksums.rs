use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::warn;

use crate::core::errors::{GridError, Result};

/// Key under which the running executable's digest is recorded
pub const EXECUTABLE_KEY: &str = "executable";

/// Every source file compiled into this crate, by path relative to the
/// package root.
const SOURCES: &[(&str, &str)] = &[
    ("src/lib.rs", include_str!("../lib.rs")),
    ("src/main.rs", include_str!("../main.rs")),
    ("src/runner.rs", include_str!("../runner.rs")),
    ("src/core/mod.rs", include_str!("../core/mod.rs")),
    ("src/core/config.rs", include_str!("../core/config.rs")),
    ("src/core/errors.rs", include_str!("../core/errors.rs")),
    ("src/sweep/mod.rs", include_str!("../sweep/mod.rs")),
    ("src/sweep/generator.rs", include_str!("../sweep/generator.rs")),
    ("src/sweep/kernel.rs", include_str!("../sweep/kernel.rs")),
    ("src/sweep/model.rs", include_str!("../sweep/model.rs")),
    ("src/storage/mod.rs", include_str!("../storage/mod.rs")),
    ("src/storage/lock.rs", include_str!("../storage/lock.rs")),
    ("src/storage/result_store.rs", include_str!("../storage/result_store.rs")),
    ("src/pool/mod.rs", include_str!("../pool/mod.rs")),
    ("src/pool/orchestrator.rs", include_str!("../pool/orchestrator.rs")),
    ("src/pool/state.rs", include_str!("../pool/state.rs")),
    ("src/provenance/mod.rs", include_str!("mod.rs")),
    ("src/provenance/checksums.rs", include_str!("checksums.rs")),
    ("src/provenance/recorder.rs", include_str!("recorder.rs")),
];

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_bytes(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Lowercase hex SHA-256 of a file's contents, streamed
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| GridError::io(format!("open {} for hashing", path.display()), e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| GridError::io(format!("hash {}", path.display()), e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Digests of the compiled-in sources plus the running executable.
///
/// A missing executable digest is logged and left out rather than failing
/// the run.
pub fn source_checksums() -> BTreeMap<String, String> {
    let mut checksums: BTreeMap<String, String> = SOURCES
        .iter()
        .map(|(path, contents)| (path.to_string(), sha256_bytes(contents)))
        .collect();

    match std::env::current_exe()
        .map_err(|e| GridError::io("locate executable", e))
        .and_then(|exe| sha256_file(&exe))
    {
        Ok(digest) => {
            checksums.insert(EXECUTABLE_KEY.to_string(), digest);
        }
        Err(e) => warn!(error = %e, "Could not checksum the running executable"),
    }
    checksums
}
