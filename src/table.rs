//! Table block files.
//!
//! A block file holds one chain per line as 32 hex digits: the seed followed by the endpoint,
//! each in RFC 2289 display order (see `round::to_hex`). The chain calculator's
//! `<seed> <endpoint>` output and the `<seed>,<endpoint>` export form are accepted on ingest and
//! always written back out canonically.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{ChainError, Result};
use crate::round::{from_hex, to_hex};

/// Length of a canonical record, newline included.
pub const RECORD_LEN: usize = 33;

/// A table chain: `endpoint` is the seed after the table's fixed number of rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainEntry {
    pub seed: u64,
    pub endpoint: u64,
}

impl ChainEntry {
    pub fn new(seed: u64, endpoint: u64) -> Self {
        ChainEntry { seed, endpoint }
    }
}

/// What to do with a record that fails to parse during a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    Skip,
    Abort,
}

impl Default for MalformedPolicy {
    fn default() -> Self {
        MalformedPolicy::Abort
    }
}

impl std::str::FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(MalformedPolicy::Skip),
            "abort" => Ok(MalformedPolicy::Abort),
            other => Err(format!("unknown malformed-record policy '{}'", other)),
        }
    }
}

pub fn format_record(entry: &ChainEntry) -> String {
    let mut line = String::with_capacity(RECORD_LEN);
    line.push_str(&to_hex(entry.seed));
    line.push_str(&to_hex(entry.endpoint));
    line
}

/// Parses one record in any accepted form. `line` is only used for error reporting.
pub fn parse_record(text: &str, line: u64) -> Result<ChainEntry> {
    let text = text.trim();
    let (seed, endpoint) = match text.find(|c: char| c == ',' || c.is_ascii_whitespace()) {
        Some(split) => (text[..split].trim(), text[split + 1..].trim()),
        None if text.len() == 32 && text.is_char_boundary(16) => (&text[..16], &text[16..]),
        None => {
            return Err(ChainError::Parse {
                line,
                reason: format!("expected 32 hex digits, found {} characters", text.len()),
            })
        }
    };

    let field = |s: &str, name: &str| {
        from_hex(s).ok_or_else(|| ChainError::Parse {
            line,
            reason: format!("{} '{}' is not 16 hex digits", name, s),
        })
    };
    Ok(ChainEntry::new(field(seed, "seed")?, field(endpoint, "endpoint")?))
}

/// Single-writer, append-only block file.
///
/// Entries are buffered until `commit`, which makes everything written so far durable.
pub struct TableWriter {
    out: BufWriter<File>,
    written: u64,
}

impl TableWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(TableWriter {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// Opens an existing block file for appending after its last complete record.
    ///
    /// A trailing partial record left by an interrupted build is cut off first.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let complete = completed_entries(path)?;
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let keep = complete * RECORD_LEN as u64;
        if file.metadata()?.len() != keep {
            warn!(path = %path.display(), keep, "truncating partial trailing record");
            file.set_len(keep)?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(TableWriter {
            out: BufWriter::new(file),
            written: complete,
        })
    }

    pub fn write_entry(&mut self, entry: &ChainEntry) -> Result<()> {
        self.out.write_all(format_record(entry).as_bytes())?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }

    /// Number of records in the file, including those present before `append`.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Counts the complete canonical records of a block file.
///
/// Returns 0 when the file does not exist. A trailing run of hex digits is a record cut short by
/// an interrupted build and is not counted. Anything else that is not a canonical record is an
/// error, so only a file produced by `TableWriter` can be resumed.
pub fn completed_entries(path: impl AsRef<Path>) -> Result<u64> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut record = Vec::with_capacity(RECORD_LEN);
    let mut count = 0u64;
    loop {
        record.clear();
        (&mut reader).take(RECORD_LEN as u64).read_to_end(&mut record)?;
        if record.is_empty() {
            return Ok(count);
        }
        let line = count + 1;
        if record.len() < RECORD_LEN {
            if record.iter().all(u8::is_ascii_hexdigit) {
                return Ok(count);
            }
            return Err(ChainError::Parse {
                line,
                reason: "trailing data is not a partial canonical record".into(),
            });
        }
        let canonical = record[RECORD_LEN - 1] == b'\n'
            && record[..RECORD_LEN - 1].iter().all(u8::is_ascii_hexdigit);
        if !canonical {
            return Err(ChainError::Parse {
                line,
                reason: "not a canonical record, refusing to resume".into(),
            });
        }
        count += 1;
    }
}

/// Streams the records of a block file.
///
/// Blank lines are ignored. Each malformed record yields its own `ChainError::Parse` and the
/// iterator carries on with the next line.
pub struct TableReader<R> {
    reader: R,
    buf: Vec<u8>,
    line: u64,
}

impl TableReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening table block file");
        Ok(TableReader::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> TableReader<R> {
    pub fn new(reader: R) -> Self {
        TableReader {
            reader,
            buf: Vec::with_capacity(RECORD_LEN + 1),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for TableReader<R> {
    type Item = Result<ChainEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let text = match std::str::from_utf8(&self.buf) {
                Ok(text) => text,
                Err(e) => {
                    return Some(Err(ChainError::Parse {
                        line: self.line,
                        reason: format!("record is not valid UTF-8: {}", e),
                    }))
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            return Some(parse_record(text, self.line));
        }
    }
}

/// Applies `policy` to a stream of parsed records, handing every good entry to `sink`.
///
/// Returns the number of skipped records.
pub(crate) fn drain_records<I, S>(records: I, policy: MalformedPolicy, mut sink: S) -> Result<u64>
where
    I: IntoIterator<Item = Result<ChainEntry>>,
    S: FnMut(ChainEntry) -> Result<()>,
{
    let mut skipped = 0u64;
    for record in records {
        match record {
            Ok(entry) => sink(entry)?,
            Err(e @ ChainError::Parse { .. }) if policy == MalformedPolicy::Skip => {
                warn!(error = %e, "skipping malformed table record");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn all_record_forms_normalise_to_canonical() -> Result<()> {
        let canonical = "00000000000000001122334455667788";
        let entry = parse_record(canonical, 1)?;
        assert_eq!(entry.seed, 0);
        assert_eq!(entry.endpoint, 0x8877_6655_4433_2211);
        assert_eq!(format_record(&entry), canonical);

        let comma = parse_record("0000000000000000,1122334455667788\r\n", 2)?;
        let spaced = parse_record("0000000000000000 1122334455667788", 3)?;
        assert_eq!(comma, entry);
        assert_eq!(spaced, entry);
        Ok(())
    }

    #[test]
    fn malformed_records_report_their_line() {
        match parse_record("0011", 9) {
            Err(ChainError::Parse { line, .. }) => assert_eq!(line, 9),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(parse_record("000000000000000g1122334455667788", 1).is_err());
        assert!(parse_record("0000000000000000,11223344", 1).is_err());
    }

    #[test]
    fn reader_skips_blank_lines_and_continues_past_errors() {
        let text = "00000000000000000100000000000000\n\nnot a record\n0100000000000000,0200000000000000\n";
        let records: Vec<_> = TableReader::new(Cursor::new(text)).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].as_ref().ok(), Some(&ChainEntry::new(0, 1)));
        assert!(matches!(records[1], Err(ChainError::Parse { line: 3, .. })));
        assert_eq!(records[2].as_ref().ok(), Some(&ChainEntry::new(1, 2)));
    }

    #[test]
    fn drain_honours_policy() {
        let records = || {
            vec![
                Ok(ChainEntry::new(1, 2)),
                Err(ChainError::Parse {
                    line: 2,
                    reason: "bad".into(),
                }),
                Ok(ChainEntry::new(3, 4)),
            ]
        };

        let mut seen = Vec::new();
        let skipped = drain_records(records(), MalformedPolicy::Skip, |e| {
            seen.push(e);
            Ok(())
        })
        .unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(seen.len(), 2);

        let aborted = drain_records(records(), MalformedPolicy::Abort, |_| Ok(()));
        assert!(matches!(aborted, Err(ChainError::Parse { line: 2, .. })));
    }

    #[test]
    fn append_resumes_after_partial_record() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("blocks.txt");

        let mut writer = TableWriter::create(&path)?;
        writer.write_entry(&ChainEntry::new(1, 10))?;
        writer.write_entry(&ChainEntry::new(2, 20))?;
        writer.commit()?;
        drop(writer);

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"0300000000")?;
        drop(file);
        assert_eq!(completed_entries(&path)?, 2);

        let mut writer = TableWriter::append(&path)?;
        assert_eq!(writer.written(), 2);
        writer.write_entry(&ChainEntry::new(3, 30))?;
        writer.commit()?;

        let entries: Vec<ChainEntry> = TableReader::open(&path)?.collect::<Result<_>>()?;
        assert_eq!(
            entries,
            vec![
                ChainEntry::new(1, 10),
                ChainEntry::new(2, 20),
                ChainEntry::new(3, 30)
            ]
        );
        Ok(())
    }

    #[test]
    fn non_ascii_separator_is_a_parse_error() {
        let result = parse_record("0000000000000000\u{a0}1122334455667788", 4);
        assert!(matches!(result, Err(ChainError::Parse { line: 4, .. })));
        assert!(parse_record("\u{3000}0000000000000000", 1).is_err());
    }

    #[test]
    fn invalid_utf8_line_is_skippable() -> Result<()> {
        let mut text = b"00000000000000000100000000000000\n".to_vec();
        text.extend_from_slice(b"\xff\xfe garbage\n");
        text.extend_from_slice(b"0100000000000000,0200000000000000\n");

        let records: Vec<_> = TableReader::new(Cursor::new(text.clone())).collect();
        assert!(matches!(records[1], Err(ChainError::Parse { line: 2, .. })));

        let mut seen = Vec::new();
        let skipped = drain_records(TableReader::new(Cursor::new(text)), MalformedPolicy::Skip, |e| {
            seen.push(e);
            Ok(())
        })?;
        assert_eq!(skipped, 1);
        assert_eq!(seen, vec![ChainEntry::new(0, 1), ChainEntry::new(1, 2)]);
        Ok(())
    }

    #[test]
    fn non_canonical_file_is_not_resumable() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("blocks.txt");
        let text = "0000000000000000,0100000000000000\n0100000000000000,0200000000000000\n";
        std::fs::write(&path, text)?;

        assert!(matches!(completed_entries(&path), Err(ChainError::Parse { line: 1, .. })));
        assert!(TableWriter::append(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path)?, text);
        Ok(())
    }

    #[test]
    fn damaged_record_before_the_end_is_an_error() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("blocks.txt");
        let mut text = String::new();
        text.push_str("00000000000000000100000000000000\n");
        text.push_str("0100000000000000 200000000000000\n");
        text.push_str("02000000000000000300000000000000\n");
        std::fs::write(&path, &text)?;

        assert!(matches!(completed_entries(&path), Err(ChainError::Parse { line: 2, .. })));
        assert!(TableWriter::append(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path)?, text);
        Ok(())
    }

    #[test]
    fn missing_file_has_no_completed_entries() -> Result<()> {
        let tmp = tempdir()?;
        assert_eq!(completed_entries(tmp.path().join("absent"))?, 0);
        Ok(())
    }
}
