//! Local file sink
//!
//! ```text
//! {data_dir}/marketdata/
//!   marketdata.json                    <- current, one JSON object per line
//!   marketdata.json.2024010110.zst     <- rotated at the 10:00-11:00 UTC boundary
//!   marketdata.json.2024010110.1.zst   <- size rotation within the same hour
//! ```
//!
//! Rotation happens on the first write of a new UTC hour or when the
//! current file would grow beyond `max_size_mb`. Archives older than
//! `max_age_days` (by the hour in their name) are deleted on rotation.
//! An archive that could not be compressed stays as plaintext
//! (`marketdata.json.2024010110`) and ages out the same way. Every
//! publish is flushed before it returns.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{MarketDataSink, SinkError, timed_encode};
use crate::config::LocalSinkConfig;
use crate::core_types::{Height, TimestampMs};
use crate::encoder::encode_json_line;
use crate::messages::{MarketDataMessage, MsgKind};
use crate::metrics::PublicationMetrics;

pub const MARKETDATA_SUBDIR: &str = "marketdata";
pub const MARKETDATA_FILE: &str = "marketdata.json";

const HOUR_FORMAT: &str = "%Y%m%d%H";
const ARCHIVE_SUFFIX: &str = ".zst";

fn hour_key(at: DateTime<Utc>) -> String {
    at.format(HOUR_FORMAT).to_string()
}

/// Hour stamp of an archive name, compressed or not; `None` for foreign files
fn archive_hour(file_name: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(MARKETDATA_FILE)?.strip_prefix('.')?;
    let rest = rest.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(rest);
    let stamp = rest.split('.').next()?;
    NaiveDateTime::parse_from_str(&format!("{}00", stamp), "%Y%m%d%H%M")
        .ok()
        .map(|t| t.and_utc())
}

// ============================================================
// ROTATING WRITER
// ============================================================

pub struct RotatingWriter {
    dir: PathBuf,
    file: BufWriter<File>,
    size: u64,
    max_size: u64,
    max_age: TimeDelta,
    hour: String,
    compress: fn(&Path) -> std::io::Result<()>,
}

impl RotatingWriter {
    pub fn open(
        dir: impl Into<PathBuf>,
        max_size: u64,
        max_age_days: u64,
        now: DateTime<Utc>,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(MARKETDATA_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let meta = file.metadata()?;
        // a file left by a previous run belongs to the hour it was last written
        let hour = match meta.modified() {
            Ok(modified) if meta.len() > 0 => hour_key(DateTime::<Utc>::from(modified)),
            _ => hour_key(now),
        };
        Ok(Self {
            dir,
            file: BufWriter::new(file),
            size: meta.len(),
            max_size,
            max_age: TimeDelta::days(max_age_days as i64),
            hour,
            compress,
        })
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(MARKETDATA_FILE)
    }

    pub fn write_line(&mut self, line: &str, now: DateTime<Utc>) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        let new_hour = hour_key(now) != self.hour;
        let oversized = self.size > 0 && self.size + len > self.max_size;
        if new_hour || oversized {
            self.rotate(now)?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.size += len;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }

    /// A failed compression keeps the plaintext archive; the new current
    /// file is already in place by then.
    fn rotate(&mut self, now: DateTime<Utc>) -> std::io::Result<()> {
        self.file.flush()?;
        let current = self.current_path();

        let archived = if self.size > 0 {
            let archived = self.archive_path();
            fs::rename(&current, &archived)?;
            Some((archived, self.size))
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&current)?;
        self.file = BufWriter::new(file);
        self.size = 0;
        self.hour = hour_key(now);

        if let Some((archived, bytes)) = archived {
            match (self.compress)(&archived) {
                Ok(()) => tracing::info!(path = %archived.display(), bytes, "Market data file rotated"),
                Err(e) => tracing::error!(path = %archived.display(), bytes, error = %e, "Failed to compress market data archive, kept uncompressed"),
            }
        }

        self.prune(now);
        Ok(())
    }

    /// First free `marketdata.json.{hour}[.k]` name
    fn archive_path(&self) -> PathBuf {
        let base = format!("{}.{}", MARKETDATA_FILE, self.hour);
        let mut candidate = base.clone();
        let mut k = 0;
        while self.dir.join(&candidate).exists()
            || self.dir.join(format!("{}{}", candidate, ARCHIVE_SUFFIX)).exists()
        {
            k += 1;
            candidate = format!("{}.{}", base, k);
        }
        self.dir.join(candidate)
    }

    fn prune(&self, now: DateTime<Utc>) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list market data dir");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(hour) = name.to_str().and_then(archive_hour) else {
                continue;
            };
            if now - hour > self.max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => tracing::info!(path = %entry.path().display(), "Expired market data archive removed"),
                    Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove market data archive"),
                }
            }
        }
    }
}

/// `path` -> `path.zst`, plaintext removed. A partial target is removed
/// on failure.
fn compress(path: &Path) -> std::io::Result<()> {
    let mut target = path.as_os_str().to_owned();
    target.push(ARCHIVE_SUFFIX);
    let encoded = File::open(path).and_then(|source| {
        let dest = File::create(&target)?;
        zstd::stream::copy_encode(source, dest, zstd::DEFAULT_COMPRESSION_LEVEL)
    });
    if let Err(e) = encoded {
        let _ = fs::remove_file(&target);
        return Err(e);
    }
    fs::remove_file(path)
}

// ============================================================
// SINK
// ============================================================

pub struct LocalSink {
    writer: Option<RotatingWriter>,
    metrics: Option<Arc<PublicationMetrics>>,
}

impl LocalSink {
    pub fn open(config: &LocalSinkConfig) -> Result<Self, SinkError> {
        let dir = Path::new(&config.data_dir).join(MARKETDATA_SUBDIR);
        let writer = RotatingWriter::open(
            &dir,
            config.max_size_mb.saturating_mul(1024 * 1024),
            config.max_age_days,
            Utc::now(),
        )
        .map_err(|e| SinkError::Setup(format!("open {}: {}", dir.display(), e)))?;
        tracing::info!(path = %writer.current_path().display(), "Local market data sink opened");
        Ok(Self {
            writer: Some(writer),
            metrics: None,
        })
    }
}

impl MarketDataSink for LocalSink {
    fn name(&self) -> &'static str {
        "local"
    }

    fn publish(
        &mut self,
        msg: &MarketDataMessage,
        kind: MsgKind,
        height: Height,
        timestamp: TimestampMs,
    ) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Stopped("local"))?;
        let line = timed_encode(self.metrics.as_deref(), kind, || {
            encode_json_line(msg, kind, height, timestamp)
        })?;
        writer.write_line(&line, Utc::now())?;
        writer.flush()?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.flush()
        {
            tracing::error!(error = %e, "Failed to flush market data file");
        }
    }

    fn attach_metrics(&mut self, metrics: Arc<PublicationMetrics>) {
        self.metrics = Some(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::BlockFee;
    use chrono::TimeZone;
    use std::io::Read;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn read_archive(path: &Path) -> String {
        let mut out = String::new();
        zstd::stream::Decoder::new(File::open(path).unwrap())
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = LocalSinkConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let path = dir.path().join(MARKETDATA_SUBDIR).join(MARKETDATA_FILE);
        let mut sink = LocalSink::open(&config).unwrap();
        for h in [7, 8] {
            let msg = MarketDataMessage::BlockFee(BlockFee::new(h, "BNB:1", vec!["v".to_string()]));
            sink.publish(&msg, MsgKind::BlockFee, h, 1000).unwrap();
            // on disk as soon as publish returns
            assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), (h - 6) as usize);
        }
        sink.stop();
        sink.stop();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["key"], "8_1000_BlockFee");
        assert_eq!(v["payload"]["validators"][0], "v");

        let msg = MarketDataMessage::BlockFee(BlockFee::default());
        assert!(matches!(
            sink.publish(&msg, MsgKind::BlockFee, 9, 0),
            Err(SinkError::Stopped("local"))
        ));
    }

    #[test]
    fn test_hourly_rotation_compresses_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RotatingWriter::open(dir.path(), 1 << 20, 7, at(10, 0)).unwrap();
        w.write_line("first", at(10, 15)).unwrap();
        w.write_line("second", at(10, 59)).unwrap();
        w.write_line("third", at(11, 5)).unwrap();
        w.flush().unwrap();

        let archive = dir.path().join("marketdata.json.2024010110.zst");
        assert!(archive.exists());
        assert!(!dir.path().join("marketdata.json.2024010110").exists());
        assert_eq!(read_archive(&archive), "first\nsecond\n");
        assert_eq!(fs::read_to_string(w.current_path()).unwrap(), "third\n");
    }

    #[test]
    fn test_size_rotation_within_an_hour() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RotatingWriter::open(dir.path(), 8, 7, at(10, 0)).unwrap();
        w.write_line("aaaaaa", at(10, 1)).unwrap();
        w.write_line("bbbbbb", at(10, 2)).unwrap();
        w.write_line("cccccc", at(10, 3)).unwrap();
        w.flush().unwrap();

        assert_eq!(
            read_archive(&dir.path().join("marketdata.json.2024010110.zst")),
            "aaaaaa\n"
        );
        assert_eq!(
            read_archive(&dir.path().join("marketdata.json.2024010110.1.zst")),
            "bbbbbb\n"
        );
        assert_eq!(fs::read_to_string(w.current_path()).unwrap(), "cccccc\n");
    }

    #[test]
    fn test_failed_compression_keeps_writer_usable() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = RotatingWriter::open(dir.path(), 1 << 20, 7, at(10, 0)).unwrap();
        w.write_line("first", at(10, 15)).unwrap();

        w.compress = |_| Err(std::io::Error::other("no space left"));
        w.write_line("second", at(11, 5)).unwrap();
        w.write_line("third", at(11, 10)).unwrap();
        w.flush().unwrap();

        let plain = dir.path().join("marketdata.json.2024010110");
        assert_eq!(fs::read_to_string(&plain).unwrap(), "first\n");
        assert_eq!(fs::read_to_string(w.current_path()).unwrap(), "second\nthird\n");

        w.compress = compress;
        w.write_line("fourth", at(12, 0)).unwrap();
        w.flush().unwrap();
        assert_eq!(
            read_archive(&dir.path().join("marketdata.json.2024010111.zst")),
            "second\nthird\n"
        );
        assert!(plain.exists());
        assert_eq!(fs::read_to_string(w.current_path()).unwrap(), "fourth\n");
    }

    #[test]
    fn test_rotation_prunes_old_archives() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("marketdata.json.2023120100.zst");
        let recent = dir.path().join("marketdata.json.2023123100.1.zst");
        let foreign = dir.path().join("notes.txt");
        for p in [&old, &recent, &foreign] {
            fs::write(p, b"x").unwrap();
        }

        let mut w = RotatingWriter::open(dir.path(), 1 << 20, 7, at(10, 0)).unwrap();
        w.write_line("line", at(10, 0)).unwrap();
        w.write_line("line", at(11, 0)).unwrap();

        assert!(!old.exists());
        assert!(recent.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_archive_hour_parsing() {
        assert_eq!(archive_hour("marketdata.json.2024010110.zst"), Some(at(10, 0)));
        assert_eq!(archive_hour("marketdata.json.2024010110.3.zst"), Some(at(10, 0)));
        assert_eq!(archive_hour("marketdata.json.2024010110"), Some(at(10, 0)));
        assert_eq!(archive_hour("marketdata.json"), None);
        assert_eq!(archive_hour("notes.txt"), None);
    }
}
