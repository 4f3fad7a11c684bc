use crate::clock::Timestamp;
use crate::error::Error;

/// Identifies a descriptor (table or database) cluster-wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorId(pub u64);

/// Databases are descriptors too; the id spaces are shared.
pub type DatabaseId = DescriptorId;

/// Monotonically increasing schema version, starting at 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorVersion(pub u64);

impl DescriptorVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl std::fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DescriptorVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// On-disk encoding generation of a descriptor. `V1` descriptors are
/// upgraded to `V2` in memory on read; the stored bytes are untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub id: u32,
    pub name: String,
}

/// A versioned table schema record.
///
/// Immutable once written at a given version; a schema change writes the
/// whole record back with `version + 1`. The lease machinery consults only
/// the header fields and treats the column list as payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDescriptor {
    pub id: DescriptorId,
    pub parent_id: DatabaseId,
    pub name: String,
    pub version: DescriptorVersion,
    pub modification_time: Timestamp,
    pub format_version: FormatVersion,
    pub dropped: bool,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn new(
        id: DescriptorId,
        parent_id: DatabaseId,
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            version: DescriptorVersion(1),
            modification_time: Timestamp::ZERO,
            format_version: FormatVersion::V2,
            dropped: false,
            columns,
        }
    }

    /// Lifts a legacy-format descriptor to the current format. In-memory
    /// only; the caller decides whether to persist the upgrade.
    pub fn maybe_upgrade_format_version(&mut self) {
        if self.format_version == FormatVersion::V1 {
            self.format_version = FormatVersion::V2;
        }
    }

    /// Structural integrity checks applied on every read and before every
    /// write.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id == DescriptorId(0) {
            return Err(Error::InvalidDescriptor("descriptor id is zero".into()));
        }
        if self.parent_id == DescriptorId(0) {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor {} has no parent database",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor {} has an empty name",
                self.id
            )));
        }
        if self.version < DescriptorVersion(1) {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor {} has version {}, expected >= 1",
                self.id, self.version
            )));
        }
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for col in &self.columns {
            if col.name.is_empty() {
                return Err(Error::InvalidDescriptor(format!(
                    "column {} of descriptor {} has an empty name",
                    col.id, self.id
                )));
            }
            if !seen_ids.insert(col.id) {
                return Err(Error::InvalidDescriptor(format!(
                    "duplicate column id {} in descriptor {}",
                    col.id, self.id
                )));
            }
            if !seen_names.insert(normalize_name(&col.name)) {
                return Err(Error::InvalidDescriptor(format!(
                    "duplicate column name {:?} in descriptor {}",
                    col.name, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Folds a table name for cache lookups and comparisons.
///
/// Applied identically at insert and lookup time; two names are the same
/// table name iff their folded forms are byte-equal.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn desc() -> TableDescriptor {
        TableDescriptor::new(
            DescriptorId(51),
            DescriptorId(50),
            "kv",
            vec![
                ColumnDescriptor {
                    id: 1,
                    name: "k".into(),
                },
                ColumnDescriptor {
                    id: 2,
                    name: "v".into(),
                },
            ],
        )
    }

    #[test]
    fn validate_accepts_well_formed() {
        desc().validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_columns() {
        let mut d = desc();
        d.columns[1].name = "K".into();
        assert_matches!(d.validate(), Err(Error::InvalidDescriptor(_)));

        let mut d = desc();
        d.columns[1].id = 1;
        assert_matches!(d.validate(), Err(Error::InvalidDescriptor(_)));
    }

    #[test]
    fn validate_rejects_zero_ids() {
        let mut d = desc();
        d.id = DescriptorId(0);
        assert_matches!(d.validate(), Err(Error::InvalidDescriptor(_)));

        let mut d = desc();
        d.parent_id = DescriptorId(0);
        assert_matches!(d.validate(), Err(Error::InvalidDescriptor(_)));
    }

    #[test]
    fn format_upgrade_is_idempotent() {
        let mut d = desc();
        d.format_version = FormatVersion::V1;
        d.maybe_upgrade_format_version();
        assert_eq!(d.format_version, FormatVersion::V2);
        d.maybe_upgrade_format_version();
        assert_eq!(d.format_version, FormatVersion::V2);
    }

    #[test]
    fn normalization_folds_case() {
        assert_eq!(normalize_name("Foo"), normalize_name("fOO"));
        assert_eq!(normalize_name("Ω"), normalize_name("ω"));
        assert_ne!(normalize_name("foo"), normalize_name("bar"));
    }
}
