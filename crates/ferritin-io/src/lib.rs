//! ferritin-io
//!
//! Readers that turn sequence files into ordered lists of protein sequences
//! ready to be sent to a model server.
//!
//! - FASTA (`.fasta`, `.fa`, `.faa`)
//! - CSV with a `sequence` column (`.csv`)
//! - plain text, one sequence per line (anything else)
//!
pub mod io;

pub use io::{read_sequences, SequenceFormat, SequenceRecord};
