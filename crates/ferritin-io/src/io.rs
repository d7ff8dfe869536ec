use anyhow::{bail, Result};
use std::path::Path;

pub mod csv;
pub mod fasta;
pub mod lines;

/// A single named protein sequence read from an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    pub sequence: String,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence: sequence.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFormat {
    Fasta,
    Csv,
    Lines,
}

impl SequenceFormat {
    /// Pick a format from the file extension. Unknown extensions are read line by line.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("fasta") | Some("fa") | Some("faa") => SequenceFormat::Fasta,
            Some("csv") => SequenceFormat::Csv,
            _ => SequenceFormat::Lines,
        }
    }
}

/// Read every sequence in `path`, in file order.
///
/// `max_sequences` truncates the list after reading; `None` keeps everything.
/// An input without a single sequence is an error.
pub fn read_sequences<P: AsRef<Path>>(
    path: P,
    max_sequences: Option<usize>,
) -> Result<Vec<SequenceRecord>> {
    let path = path.as_ref();
    let format = SequenceFormat::from_path(path);
    let mut records = match format {
        SequenceFormat::Fasta => fasta::read_fasta(path)?,
        SequenceFormat::Csv => csv::read_csv(path, csv::SEQUENCE_COLUMN)?,
        SequenceFormat::Lines => lines::read_lines(path)?,
    };
    if let Some(max) = max_sequences {
        records.truncate(max);
    }
    if records.is_empty() {
        bail!("no sequences found in {}", path.display());
    }
    tracing::debug!(
        path = %path.display(),
        ?format,
        count = records.len(),
        "read input sequences"
    );
    Ok(records)
}
