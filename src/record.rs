//! Annotation records observed in the remote listing table.

use std::fmt;

/// `(structure id, chain)` pair that identifies one annotation record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    /// Structure (or predicted model) identifier.
    pub entity_id: String,
    /// Chain identifier within the structure.
    pub chain: String,
}

impl IdentityKey {
    /// Builds a key from its two components.
    pub fn new(entity_id: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            chain: chain.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.entity_id, self.chain)
    }
}

/// Origin class of a record, which selects the file endpoint and sequence source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Experimentally determined structure (PDB-style identifiers).
    Experimental,
    /// Predicted structure (AlphaFold models keyed by UniProt accession).
    Predicted,
}

impl SourceKind {
    /// Classifies the free-text source label shown in the listing.
    pub fn from_label(label: &str) -> Self {
        if label.to_ascii_lowercase().contains("alphafold") {
            SourceKind::Predicted
        } else {
            SourceKind::Experimental
        }
    }
}

/// One structural entity observed in the remote table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRecord {
    /// Source-assigned ordinal, display only.
    pub row_index: String,
    /// Structure identifier.
    pub entity_id: String,
    /// Chain identifier.
    pub chain: String,
    /// Free-text origin label.
    pub source: String,
    /// Region identifiers in display order, which is also probing order.
    pub region_values: Vec<String>,
    /// Unit-count annotations such as `6 units`; may be shorter than `region_values`.
    pub region_units: Vec<String>,
    /// UniProt cross reference.
    pub uniprot: Option<String>,
    /// Pfam cross references.
    pub pfam_ids: Vec<String>,
    /// Processing status reported by the source.
    pub status: String,
}

impl AnnotationRecord {
    /// Identity key used for deduplication.
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(self.entity_id.clone(), self.chain.clone())
    }

    /// Endpoint/sequence class derived from `source`.
    pub fn source_kind(&self) -> SourceKind {
        SourceKind::from_label(&self.source)
    }
}

/// Region identifiers that name a bare top-level class (`"3"`, `"4"`) are not downloadable.
pub fn is_top_level_class(region_id: &str) -> bool {
    let mut chars = region_id.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_digit())
}

/// Replaces the dots of a region identifier for use in file names (`3.3.1` -> `3_3_1`).
pub fn region_file_stem(region_id: &str) -> String {
    region_id.replace('.', "_")
}
