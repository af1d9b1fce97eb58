// ── State file ──
//
// Sessions and sales serialized as one JSON document. Writes go to a
// temp file in the same directory and are renamed over the old file, so
// a crash mid-write leaves the previous state intact.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{SaleRecord, Session};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StateFile {
    #[serde(default = "format_version")]
    pub version: u32,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub sales: Vec<SaleRecord>,
}

fn format_version() -> u32 {
    FORMAT_VERSION
}

impl StateFile {
    pub(crate) fn new(sessions: Vec<Session>, sales: Vec<SaleRecord>) -> Self {
        Self {
            version: FORMAT_VERSION,
            sessions,
            sales,
        }
    }
}

/// Read the state file, or an empty state if it doesn't exist yet.
pub(crate) fn load(path: &Path) -> Result<StateFile, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the state file.
pub(crate) fn save(path: &Path, state: &StateFile) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
