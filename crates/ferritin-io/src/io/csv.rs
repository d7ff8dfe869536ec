use super::SequenceRecord;
use anyhow::{anyhow, Result};
use polars::prelude::*;
use std::path::Path;

pub const SEQUENCE_COLUMN: &str = "sequence";
pub const ID_COLUMN: &str = "id";

/// Read sequences from the `column` of a CSV file with a header row.
///
/// Ids come from an `id` column when the file has one, otherwise from the row index.
/// Null cells in the sequence column are an error.
pub fn read_csv(path: &Path, column: &str) -> Result<Vec<SequenceRecord>> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let sequences = df
        .column(column)
        .map_err(|_| anyhow!("{} has no `{}` column", path.display(), column))?
        .str()?;
    let ids = match df.column(ID_COLUMN) {
        Ok(col) => Some(col.cast(&DataType::String)?),
        Err(_) => None,
    };
    let ids = match &ids {
        Some(col) => Some(col.str()?),
        None => None,
    };

    let mut records = Vec::with_capacity(sequences.len());
    for (row, sequence) in sequences.into_iter().enumerate() {
        let sequence =
            sequence.ok_or_else(|| anyhow!("empty `{}` cell on row {}", column, row + 1))?;
        let id = ids
            .and_then(|ids| ids.get(row))
            .map(str::to_string)
            .unwrap_or_else(|| format!("seq_{row}"));
        records.push(SequenceRecord::new(id, sequence.trim()));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferritin_test_data::TestFile;

    #[test]
    fn test_read_csv() {
        let (csv, _tmp) = TestFile::sequences_csv_01().create_temp().unwrap();
        let records = read_csv(Path::new(&csv), SEQUENCE_COLUMN).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0], SequenceRecord::new("seq_0", "ACDE"));
        assert_eq!(records[2].sequence, "KKLL");
    }

    #[test]
    fn test_missing_column() {
        let (csv, _tmp) = TestFile::sequences_csv_01().create_temp().unwrap();
        let err = read_csv(Path::new(&csv), "smiles").unwrap_err();
        assert!(err.to_string().contains("smiles"));
    }
}
