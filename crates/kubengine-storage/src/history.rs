use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use kubengine_core_domain::StepResult;
use tracing::{debug, warn};

use crate::lock::{FileLock, LockMode};
use crate::{io_context, StorageError};

const SEGMENT_PREFIX: &str = "history.";

#[derive(Debug, Clone)]
pub struct HistoryOptions {
    /// Seal the live journal once it reaches this size; 0 never seals.
    pub max_bytes: u64,
    /// Gzip sealed segments.
    pub compress: bool,
    /// Newest sealed segments to keep; 0 keeps all of them.
    pub max_archives: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            compress: true,
            max_archives: 10,
        }
    }
}

/// Append-only journal of every terminal step result, one JSON object per line.
///
/// The live file is `history.jsonl`. When it grows past `max_bytes` it is
/// sealed into `archive/history.<seq>.jsonl[.gz]`, where `seq` increases by
/// one per seal, and the oldest segments beyond `max_archives` are dropped.
pub struct ResultHistory {
    dir: PathBuf,
    options: HistoryOptions,
}

impl ResultHistory {
    pub const FILE_NAME: &'static str = "history.jsonl";

    pub fn new(dir: PathBuf) -> Self {
        Self::with_options(dir, HistoryOptions::default())
    }

    pub fn with_options(dir: PathBuf, options: HistoryOptions) -> Self {
        Self { dir, options }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    pub fn append(&self, result: &StepResult) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(result).map_err(|err| StorageError::SerializeError {
            message: format!("failed to serialize history entry: {err}"),
        })?;
        line.push(b'\n');

        let _guard = FileLock::acquire(
            &self.dir.join(format!(".{}.lock", Self::FILE_NAME)),
            LockMode::Exclusive,
        )?;
        let live = self.path();
        if self.live_is_full(&live)? {
            self.seal(&live)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&live)
            .map_err(io_context(format!("failed to open {}", live.display())))?;
        file.write_all(&line)
            .map_err(io_context(format!("failed to append to {}", live.display())))?;
        file.sync_data().ok();
        Ok(())
    }

    /// Entries from the live journal only; malformed lines are skipped.
    pub fn load(&self) -> Result<Vec<StepResult>, StorageError> {
        let live = self.path();
        let content = match fs::read_to_string(&live) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_context(format!("failed to read {}", live.display()))(err)),
        };
        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(index, line)| match serde_json::from_str::<StepResult>(line.trim()) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping malformed history entry");
                    None
                }
            })
            .collect())
    }

    /// Sealed segments, oldest first.
    pub fn segments(&self) -> Result<Vec<(u64, PathBuf)>, StorageError> {
        let dir = self.archive_dir();
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_context(format!("failed to list {}", dir.display()))(err)),
        };
        let mut segments: Vec<(u64, PathBuf)> = listing
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let seq = segment_seq(entry.file_name().to_str()?)?;
                Some((seq, entry.path()))
            })
            .collect();
        segments.sort();
        Ok(segments)
    }

    fn live_is_full(&self, live: &Path) -> Result<bool, StorageError> {
        if self.options.max_bytes == 0 {
            return Ok(false);
        }
        match fs::metadata(live) {
            Ok(meta) => Ok(meta.len() >= self.options.max_bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_context(format!("failed to stat {}", live.display()))(err)),
        }
    }

    fn seal(&self, live: &Path) -> Result<(), StorageError> {
        let dir = self.archive_dir();
        fs::create_dir_all(&dir)
            .map_err(io_context(format!("failed to create {}", dir.display())))?;
        let seq = self.segments()?.last().map_or(1, |(seq, _)| seq + 1);
        let target = dir.join(segment_name(seq, self.options.compress));
        if self.options.compress {
            gzip_segment(live, &target)?;
            fs::remove_file(live)
                .map_err(io_context(format!("failed to remove {}", live.display())))?;
        } else {
            fs::rename(live, &target)
                .map_err(io_context(format!("failed to move {}", live.display())))?;
        }
        debug!(segment = seq, path = %target.display(), "history journal sealed");
        self.drop_old_segments()
    }

    fn drop_old_segments(&self) -> Result<(), StorageError> {
        let keep = self.options.max_archives;
        if keep == 0 {
            return Ok(());
        }
        let segments = self.segments()?;
        let excess = segments.len().saturating_sub(keep);
        for (seq, path) in segments.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(segment = seq, error = %err, "failed to drop old history segment");
            }
        }
        Ok(())
    }
}

fn segment_name(seq: u64, compressed: bool) -> String {
    let suffix = if compressed { ".jsonl.gz" } else { ".jsonl" };
    format!("{SEGMENT_PREFIX}{seq:06}{suffix}")
}

fn segment_seq(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?;
    let digits = rest
        .strip_suffix(".jsonl.gz")
        .or_else(|| rest.strip_suffix(".jsonl"))?;
    digits.parse().ok()
}

fn gzip_segment(source: &Path, target: &Path) -> Result<(), StorageError> {
    let mut input =
        File::open(source).map_err(io_context(format!("failed to open {}", source.display())))?;
    let output =
        File::create(target).map_err(io_context(format!("failed to create {}", target.display())))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)
        .and_then(|_| encoder.finish())
        .map_err(io_context(format!("failed to compress into {}", target.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn failed(node: &str, step: &str) -> StepResult {
        let now = Utc::now();
        StepResult::running(node, step, 1, now).failed(now, "exit status 1".to_string(), Some(1))
    }

    fn sealing_history(dir: &TempDir, compress: bool, max_archives: usize) -> ResultHistory {
        ResultHistory::with_options(
            dir.path().to_path_buf(),
            HistoryOptions {
                max_bytes: 1,
                compress,
                max_archives,
            },
        )
    }

    #[test]
    fn appends_entries_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let history = ResultHistory::new(dir.path().to_path_buf());
        history.append(&failed("10.0.0.3", "join-worker")).expect("append");
        history.append(&failed("10.0.0.3", "join-worker")).expect("append");
        history.append(&failed("10.0.0.2", "install-cni")).expect("append");

        let entries = history.load().expect("load");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].node, "10.0.0.2");
        assert!(history.segments().expect("segments").is_empty());
    }

    #[test]
    fn full_journal_is_sealed_into_a_gzip_segment() {
        let dir = TempDir::new().expect("tempdir");
        let history = sealing_history(&dir, true, 10);
        history.append(&failed("10.0.0.1", "a")).expect("append");
        history.append(&failed("10.0.0.1", "b")).expect("append");

        let entries = history.load().expect("load");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].step, "b");

        let segments = history.segments().expect("segments");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, 1);
        assert!(segments[0].1.ends_with("history.000001.jsonl.gz"));

        let mut text = String::new();
        GzDecoder::new(File::open(&segments[0].1).expect("open"))
            .read_to_string(&mut text)
            .expect("gunzip");
        let sealed: StepResult = serde_json::from_str(text.trim()).expect("sealed entry");
        assert_eq!(sealed.step, "a");
    }

    #[test]
    fn keeps_only_the_newest_segments() {
        let dir = TempDir::new().expect("tempdir");
        let history = sealing_history(&dir, false, 2);
        for index in 0..5 {
            history
                .append(&failed("10.0.0.1", &format!("step-{index}")))
                .expect("append");
        }
        let seqs: Vec<u64> = history
            .segments()
            .expect("segments")
            .into_iter()
            .map(|(seq, _)| seq)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn segment_names_parse_back() {
        assert_eq!(segment_seq(&segment_name(7, true)), Some(7));
        assert_eq!(segment_seq(&segment_name(12, false)), Some(12));
        assert_eq!(segment_seq("history.jsonl"), None);
        assert_eq!(segment_seq("notes.txt"), None);
    }

    #[test]
    fn skips_malformed_lines() {
        let dir = TempDir::new().expect("tempdir");
        let history = ResultHistory::new(dir.path().to_path_buf());
        history.append(&failed("10.0.0.1", "a")).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(history.path())
            .expect("open");
        writeln!(file, "{{broken").expect("write");
        assert_eq!(history.load().expect("load").len(), 1);
    }
}
