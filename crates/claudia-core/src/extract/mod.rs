//! Extractors
//!
//! Deterministic regex passes over conversation text. No network, no model
//! downloads; callable independently of the write path.

pub mod entities;
pub mod temporal;

pub use entities::{
    canonical_name, extract_all, extract_entities, extract_memories, ExtractedEntity,
    ExtractedMemory,
};
pub use temporal::{
    extract_deadline, extract_temporal_markers, markers_to_json, resolve_relative_date,
    MarkerType, TemporalMarker,
};
