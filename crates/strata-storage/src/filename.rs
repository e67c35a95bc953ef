//! File naming within an engine directory.
//!
//! ```text
//! LOCK               advisory lock held while the engine is open
//! CURRENT            name of the live manifest
//! MANIFEST-000005    version edits
//! 000007.log         write-ahead log
//! 000009.sst         sorted table
//! 000010.dbtmp       scratch file, renamed into place
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_core::{Error, Result};

/// Role of a file in the engine directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log
    Log,
    /// Lock file
    Lock,
    /// Sorted table
    Table,
    /// Manifest
    Descriptor,
    /// Pointer to the live manifest
    Current,
    /// Temporary file
    Temp,
}

/// Path of write-ahead log `number`
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.log", number))
}

/// Path of sorted table `number`
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.sst", number))
}

/// Path of manifest `number`
pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{:06}", number))
}

/// Path of the CURRENT file
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

/// Path of the LOCK file
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// Path of temporary file `number`
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("{:06}.dbtmp", number))
}

/// Classify a bare file name. Unknown names yield `None`.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return parse_number(rest).map(|n| (FileType::Descriptor, n));
    }

    let (stem, ext) = name.split_once('.')?;
    let number = parse_number(stem)?;
    let file_type = match ext {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Point CURRENT at manifest `descriptor_number`.
///
/// Writes a temp file and renames it over CURRENT so readers never see a
/// partially written pointer.
pub fn set_current_file(dbname: &Path, descriptor_number: u64) -> Result<()> {
    let manifest = descriptor_file_name(dbname, descriptor_number);
    let contents = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidArgument("manifest name is not UTF-8".to_string()))?;

    let tmp = temp_file_name(dbname, descriptor_number);
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, current_file_name(dbname))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read the manifest name stored in CURRENT.
pub fn read_current_file(dbname: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dbname))?;
    let name = contents
        .strip_suffix('\n')
        .ok_or_else(|| Error::Corruption("CURRENT file does not end with newline".to_string()))?;
    if name.is_empty() || name.contains('/') {
        return Err(Error::Corruption(format!(
            "CURRENT file names an invalid manifest: {:?}",
            name
        )));
    }
    Ok(name.to_string())
}
