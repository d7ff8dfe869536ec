//! ferretin-test-data
//!
//! A module to provide test files embedded in the crate for use in testing.
//! Example sequence inputs and wire payloads are included in the crate distribution.
//!
//! The test files are represented as `TestFile` objects which package the raw binary data
//! and create temporary files for programs to operate on.
use std::fs;
use tempfile::{Builder, NamedTempFile};

#[derive(Debug)]
/// Test File
///
/// Example usage:
///
/// ```ignore
/// // returns (filepath, _tempfile_handle).
/// // _handle ensures the tempfile remains in scope
/// use ferritin_test_data::TestFile;
/// let (fasta_file, _temp) = TestFile::sequences_fasta_01().create_temp().unwrap();
/// let (request_file, _temp) = TestFile::embed_request_01().create_temp().unwrap();
///
/// ```
pub struct TestFile {
    filebinary: &'static [u8],
    suffix: &'static str,
}

impl TestFile {
    /// Four protein sequences in FASTA format. The first record is wrapped over two lines.
    pub fn sequences_fasta_01() -> Self {
        Self {
            filebinary: include_bytes!("../data/sequences/sequences_01.fasta"),
            suffix: "fasta",
        }
    }
    /// Four sequences in a CSV with `id,sequence` columns.
    pub fn sequences_csv_01() -> Self {
        Self {
            filebinary: include_bytes!("../data/sequences/sequences_01.csv"),
            suffix: "csv",
        }
    }
    /// One sequence per line, with a blank line in the middle.
    pub fn sequences_txt_01() -> Self {
        Self {
            filebinary: include_bytes!("../data/sequences/sequences_01.txt"),
            suffix: "txt",
        }
    }
    /// JSON wire payload for an `embed` request over ["ACDE", "GGHH"].
    pub fn embed_request_01() -> Self {
        Self {
            filebinary: include_bytes!("../data/requests/embed_01.json"),
            suffix: "json",
        }
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.filebinary
    }

    pub fn create_temp(&self) -> std::io::Result<(String, NamedTempFile)> {
        let temp = Builder::new()
            .suffix(&format!(".{}", self.suffix))
            .tempfile()?;

        fs::write(&temp, self.filebinary)?;
        let path = temp.path().to_string_lossy().into_owned();

        Ok((path, temp))
    }
}
