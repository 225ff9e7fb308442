//! Data model of an exploration atlas.
//!
//! Everything here is plain serializable data: the records persisted under
//! the atlas root (node metadata, the index, task and test-idea records) and
//! the payloads exchanged with the browser, page-understanding and
//! trajectory-judgment collaborators.

pub mod parse;
pub mod types;
