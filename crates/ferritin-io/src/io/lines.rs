use super::SequenceRecord;
use anyhow::Result;
use std::path::Path;

/// One sequence per line. Blank lines are skipped and `#` starts a comment line.
pub fn read_lines(path: &Path) -> Result<Vec<SequenceRecord>> {
    let bytes = std::fs::read(path)?;
    parse_lines(&bytes)
}

pub fn parse_lines(bytes: &[u8]) -> Result<Vec<SequenceRecord>> {
    let mut records = Vec::new();
    let mut start = 0;
    let ends = memchr::memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
    for end in ends {
        let line = std::str::from_utf8(&bytes[start..end])?.trim();
        start = end + 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = format!("seq_{}", records.len());
        records.push(SequenceRecord::new(id, line));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferritin_test_data::TestFile;

    #[test]
    fn test_parse_lines() {
        let records = parse_lines(b"ACDE\r\n\n# comment\nGGHH").unwrap();
        assert_eq!(
            records,
            vec![
                SequenceRecord::new("seq_0", "ACDE"),
                SequenceRecord::new("seq_1", "GGHH"),
            ]
        );
    }

    #[test]
    fn test_read_lines_file() {
        let (txt, _tmp) = TestFile::sequences_txt_01().create_temp().unwrap();
        let records = read_lines(Path::new(&txt)).unwrap();
        let seqs: Vec<_> = records.iter().map(|r| r.sequence.as_str()).collect();
        assert_eq!(seqs, vec!["ACDE", "GGHH", "KKLL"]);
    }
}
