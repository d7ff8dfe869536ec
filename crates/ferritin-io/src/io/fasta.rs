//! FASTA input via `noodles-fasta`.
//!
//! Multi-line records are joined by the reader; the record id is the definition
//! name, i.e. the header up to the first whitespace.
use super::SequenceRecord;
use anyhow::{Context, Result};
use noodles_fasta as fasta;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read every record from an already opened FASTA stream.
pub fn parse_fasta<R: BufRead>(inner: R) -> Result<Vec<SequenceRecord>> {
    let mut reader = fasta::io::Reader::new(inner);
    reader
        .records()
        .enumerate()
        .map(|(i, result)| {
            let record = result.with_context(|| format!("malformed FASTA record {i}"))?;
            let id = String::from_utf8_lossy(record.name()).into_owned();
            let sequence = String::from_utf8_lossy(record.sequence().as_ref()).into_owned();
            Ok(SequenceRecord::new(id, sequence))
        })
        .collect()
}

pub fn read_fasta(path: &Path) -> Result<Vec<SequenceRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_fasta(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferritin_test_data::TestFile;

    #[test]
    fn test_basic_read() {
        let input = b">seq1 first\nACDE\nFG\n>seq2\nGGHH\n";
        let records = parse_fasta(&input[..]).unwrap();
        assert_eq!(
            records,
            vec![
                SequenceRecord::new("seq1", "ACDEFG"),
                SequenceRecord::new("seq2", "GGHH"),
            ]
        );
    }

    #[test]
    fn test_data_before_header() {
        let input = b"ACDE\n>seq1\nGG\n";
        assert!(parse_fasta(&input[..]).is_err());
    }

    #[test]
    fn test_read_fasta_file() {
        let (fasta, _tmp) = TestFile::sequences_fasta_01().create_temp().unwrap();
        let records = read_fasta(Path::new(&fasta)).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].id, "sp|P69905|HBA_HUMAN");
        assert_eq!(records[0].sequence.len(), 142);
        assert_eq!(records[1].id, "amplify_test");
        assert_eq!(records[3].sequence, "GGHH");
    }
}
