//! Persistent attendance ledger (CSV, header `Name,Timestamp`).
//!
//! A missing file is an empty ledger. A present file that does not parse is
//! never overwritten: every read error aborts the operation that needed it.

use crate::atomic;
use crate::policy::{DailyAttendanceIndex, SessionLedger};
use crate::types::{parse_timestamp, AttendanceRecord};
use chrono::NaiveDate;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: [&str; 2] = ["Name", "Timestamp"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance ledger {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("failed to read attendance ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write attendance ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result of merging a session ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge; the file was not touched.
    Unchanged,
    /// `added` rows appended; the file now holds `total` rows.
    Appended { added: usize, total: usize },
}

/// The durable attendance ledger at one path.
#[derive(Debug, Clone)]
pub struct AttendanceStore {
    path: PathBuf,
}

impl AttendanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every row. A missing or zero-length file yields no rows.
    pub fn read_all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.read_error(e)),
        };
        let len = file.metadata().map_err(|e| self.read_error(e))?.len();
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(file);

        let headers = reader.headers().map_err(|e| self.csv_error(e))?;
        if headers.iter().ne(HEADER.iter().copied()) {
            let found = headers.iter().collect::<Vec<_>>().join(",");
            return Err(self.corrupt(
                1,
                format!("expected header `Name,Timestamp`, got `{found}`"),
            ));
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| self.csv_error(e))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let name = record.get(0).unwrap_or_default();
            let ts = record.get(1).unwrap_or_default();

            if name.trim().is_empty() {
                return Err(self.corrupt(line, "empty name".to_string()));
            }
            let timestamp = parse_timestamp(ts)
                .map_err(|e| self.corrupt(line, format!("bad timestamp {ts:?}: {e}")))?;
            rows.push(AttendanceRecord::new(name, timestamp));
        }

        Ok(rows)
    }

    /// Snapshot the names already recorded on `today`.
    pub fn load_today_set(&self, today: NaiveDate) -> Result<DailyAttendanceIndex, StoreError> {
        let names = self
            .read_all()?
            .into_iter()
            .filter(|r| r.timestamp.date() == today)
            .map(|r| r.name)
            .collect();
        Ok(DailyAttendanceIndex::new(today, names))
    }

    /// Rows recorded on `date`, in file order.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.timestamp.date() == date)
            .collect())
    }

    /// Append the session's marks after the existing rows.
    ///
    /// An empty ledger is a no-op: the file is neither read nor written. The
    /// combined rows replace the file atomically; if the existing file cannot
    /// be parsed the merge aborts and the file is left as it was.
    pub fn merge(&self, ledger: &SessionLedger) -> Result<MergeOutcome, StoreError> {
        if ledger.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }

        let mut rows = self.read_all()?;
        let added = ledger.len();
        rows.extend(ledger.records().iter().cloned());
        self.write_all(&rows)?;

        tracing::info!(
            path = %self.path.display(),
            added,
            total = rows.len(),
            "merged session attendance"
        );

        Ok(MergeOutcome::Appended {
            added,
            total: rows.len(),
        })
    }

    /// Copy the ledger to `dest` with the same crash-safe replace.
    ///
    /// Returns the number of rows exported. The source is parsed first so a
    /// corrupt ledger is reported rather than copied.
    pub fn export(&self, dest: &Path) -> Result<usize, StoreError> {
        let rows = self.read_all()?;
        AttendanceStore::new(dest).write_all(&rows)?;
        Ok(rows.len())
    }

    fn write_all(&self, rows: &[AttendanceRecord]) -> Result<(), StoreError> {
        atomic::replace_file::<io::Error, _>(&self.path, |file| write_csv(file, rows))
            .map_err(|e| StoreError::Write {
                path: self.path.clone(),
                source: e,
            })
    }

    fn read_error(&self, source: io::Error) -> StoreError {
        StoreError::Read {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, line: u64, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            line,
            reason,
        }
    }

    fn csv_error(&self, err: csv::Error) -> StoreError {
        let line = err.position().map(|p| p.line()).unwrap_or(0);
        let reason = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(e) => self.read_error(e),
            _ => self.corrupt(line, reason),
        }
    }
}

fn write_csv(file: &mut File, rows: &[AttendanceRecord]) -> io::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(&mut *file);
    writer.write_record(HEADER)?;
    for row in rows {
        writer.write_record([row.name.as_str(), row.timestamp_string().as_str()])?;
    }
    writer.flush()?;
    drop(writer);
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_timestamp;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger(entries: &[(&str, &str)]) -> SessionLedger {
        let mut l = SessionLedger::new();
        for (name, ts) in entries {
            l.insert(name, parse_timestamp(ts).unwrap());
        }
        l
    }

    fn store_with(contents: &str) -> (tempfile::TempDir, AttendanceStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(&path, contents).unwrap();
        (dir, AttendanceStore::new(path))
    }

    #[test]
    fn test_missing_store_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::new(dir.path().join("attendance.csv"));
        assert!(store.read_all().unwrap().is_empty());
        assert!(store.load_today_set(date(2024, 1, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_load_today_set_filters_by_date() {
        let (_dir, store) = store_with("Name,Timestamp\nAlice,2024-01-01 08:00:00\n");

        let next_day = store.load_today_set(date(2024, 1, 2)).unwrap();
        assert!(next_day.is_empty());

        let same_day = store.load_today_set(date(2024, 1, 1)).unwrap();
        assert_eq!(same_day.len(), 1);
        assert!(same_day.contains("Alice"));
    }

    #[test]
    fn test_merge_empty_ledger_leaves_file_untouched() {
        let original = "Name,Timestamp\r\nAlice,2024-01-01 08:00:00\r\n";
        let (_dir, store) = store_with(original);

        let outcome = store.merge(&SessionLedger::new()).unwrap();

        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(std::fs::read(store.path()).unwrap(), original.as_bytes());
    }

    #[test]
    fn test_merge_empty_ledger_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::new(dir.path().join("attendance.csv"));
        store.merge(&SessionLedger::new()).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_merge_creates_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::new(dir.path().join("attendance.csv"));

        let outcome = store
            .merge(&ledger(&[
                ("Alice", "2024-01-01 09:00:00"),
                ("Bob", "2024-01-01 09:05:00"),
            ]))
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Appended { added: 2, total: 2 });
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "Name,Timestamp\nAlice,2024-01-01 09:00:00\nBob,2024-01-01 09:05:00\n"
        );
    }

    #[test]
    fn test_merge_appends_after_existing_rows() {
        let (_dir, store) = store_with("Name,Timestamp\nCarol,2023-12-31 17:00:00\n");

        store
            .merge(&ledger(&[("Alice", "2024-01-01 09:00:00")]))
            .unwrap();

        let names: Vec<String> = store.read_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Carol", "Alice"]);
    }

    #[test]
    fn test_merge_aborts_on_corrupt_store() {
        let corrupt = "Name,Timestamp\nAlice,yesterday-ish\n";
        let (_dir, store) = store_with(corrupt);

        let err = store
            .merge(&ledger(&[("Bob", "2024-01-01 09:00:00")]))
            .unwrap_err();

        assert!(err.is_corrupt(), "got {err}");
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), corrupt);
    }

    struct Unreadable;

    impl io::Read for Unreadable {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[test]
    fn test_csv_io_error_keeps_its_kind() {
        let store = AttendanceStore::new("attendance.csv");
        let mut reader = csv::Reader::from_reader(Unreadable);
        let err = reader.headers().unwrap_err();

        match store.csv_error(err) {
            StoreError::Read { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("expected a read error, got {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_merge_keeps_ledger_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store_with("Name,Timestamp
");
        std::fs::set_permissions(store.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        store
            .merge(&ledger(&[("Alice", "2024-01-01 09:00:00")]))
            .unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_wrong_header_is_corrupt() {
        let (_dir, store) = store_with("Who,When\nAlice,2024-01-01 08:00:00\n");
        assert!(store.read_all().unwrap_err().is_corrupt());
    }

    #[test]
    fn test_wrong_field_count_is_corrupt() {
        let (_dir, store) = store_with("Name,Timestamp\nAlice,2024-01-01 08:00:00,extra\n");
        let err = store.read_all().unwrap_err();
        assert!(err.is_corrupt(), "got {err}");
    }

    #[test]
    fn test_zero_length_store_reads_empty() {
        let (_dir, store) = store_with("");
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_names_with_commas_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::new(dir.path().join("attendance.csv"));
        store
            .merge(&ledger(&[("Doe, Jane", "2024-01-01 09:00:00")]))
            .unwrap();
        assert_eq!(store.read_all().unwrap()[0].name, "Doe, Jane");
    }

    #[test]
    fn test_sequential_merges_never_duplicate_a_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttendanceStore::new(dir.path().join("attendance.csv"));
        let day = date(2024, 1, 1);

        for ts in ["2024-01-01 09:00:00", "2024-01-01 13:00:00"] {
            let index = store.load_today_set(day).unwrap();
            let mut session = SessionLedger::new();
            for name in ["Alice", "Bob"] {
                if !index.contains(name) {
                    session.insert(name, parse_timestamp(ts).unwrap());
                }
            }
            store.merge(&session).unwrap();
        }

        assert_eq!(store.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_records_on_and_export() {
        let (dir, store) = store_with(
            "Name,Timestamp\nAlice,2024-01-01 08:00:00\nBob,2024-01-02 08:00:00\n",
        );
        let day_two = store.records_on(date(2024, 1, 2)).unwrap();
        assert_eq!(day_two.len(), 1);
        assert_eq!(day_two[0].name, "Bob");

        let dest = dir.path().join("out/export.csv");
        assert_eq!(store.export(&dest).unwrap(), 2);
        assert_eq!(AttendanceStore::new(dest).read_all().unwrap(), store.read_all().unwrap());
    }
}
