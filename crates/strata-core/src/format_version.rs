//! File format versions for Strata
//!
//! Version constants and magic numbers for every on-disk format, checked
//! when a file is opened so that a newer or foreign file is rejected
//! instead of misread.

/// Sorted-table format version
pub const TABLE_FORMAT_VERSION: u16 = 1;

/// Manifest record format version
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

/// Magic numbers for file validation
pub mod magic {
    /// Sorted table magic: "STBLSTRA"
    pub const TABLE: u64 = 0x5354_424C_5354_5241;

    /// Manifest magic: "STMF" (STrata ManiFest)
    pub const MANIFEST: u32 = 0x5354_4D46;
}

/// Version compatibility information
pub struct FormatVersion {
    /// Current version of this format
    pub current: u16,
    /// Minimum supported version for reading
    pub min_read: u16,
}

impl FormatVersion {
    /// Check if a version can be read
    pub fn can_read(&self, version: u16) -> bool {
        version >= self.min_read && version <= self.current
    }
}

/// Sorted-table format version info
pub fn table_version() -> FormatVersion {
    FormatVersion {
        current: TABLE_FORMAT_VERSION,
        min_read: 1,
    }
}

/// Manifest format version info
pub fn manifest_version() -> FormatVersion {
    FormatVersion {
        current: MANIFEST_FORMAT_VERSION,
        min_read: 1,
    }
}
