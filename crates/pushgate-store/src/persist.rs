//! Checkpoint persistence.
//!
//! A checkpoint is one file holding the whole snapshot:
//!
//! ```text
//! header   "PGCKPT\0\0"  u32 version
//! record*  u32 len (> 0) | len bytes of JSON {job, instance, name, timestamp, metric_family}
//! end      u32 0 | u64 record count | SHA-256 of header and records
//! ```
//!
//! Integers are little-endian. The explicit end marker, count and digest
//! make a partially written or damaged file fail loudly on restore
//! instead of decoding as a smaller snapshot. Records are written in
//! (job, instance, name) order.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use pushgate_core::{check_labels, MetricFamily, TimestampedMetricFamily};

use crate::error::{PersistError, PersistResult};
use crate::snapshot::Snapshot;

const MAGIC: &[u8; 8] = b"PGCKPT\0\0";
const FORMAT_VERSION: u32 = 1;
const END_MARKER: u32 = 0;
const DIGEST_LEN: usize = 32;

#[derive(Serialize)]
struct RecordRef<'a> {
    job: &'a str,
    instance: &'a str,
    name: &'a str,
    timestamp: SystemTime,
    metric_family: &'a MetricFamily,
}

#[derive(Deserialize)]
struct Record {
    job: String,
    instance: String,
    name: String,
    timestamp: SystemTime,
    metric_family: MetricFamily,
}

/// Encode a snapshot into checkpoint bytes.
pub fn encode_snapshot(snapshot: &Snapshot) -> PersistResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

    let mut count: u64 = 0;
    for (job, instance, name, tmf) in snapshot.sorted_entries() {
        let record = RecordRef {
            job,
            instance,
            name,
            timestamp: tmf.timestamp,
            metric_family: &tmf.metric_family,
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| PersistError::Encode(e.to_string()))?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            PersistError::Encode(format!("record {job}/{instance}/{name} exceeds 4 GiB"))
        })?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        count += 1;
    }

    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&END_MARKER.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    buf.extend_from_slice(&digest);
    Ok(buf)
}

/// Decode checkpoint bytes produced by [`encode_snapshot`].
pub fn decode_snapshot(bytes: &[u8]) -> PersistResult<Snapshot> {
    let mut reader = ByteReader::new(bytes);

    if reader.take(MAGIC.len())? != MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }

    let mut snapshot = Snapshot::new();
    let mut found: u64 = 0;
    let end_offset = loop {
        let offset = reader.pos;
        let len = reader.u32()?;
        if len == END_MARKER {
            break offset;
        }
        let payload = reader.take(len as usize)?;
        let record: Record = serde_json::from_slice(payload).map_err(|e| corrupt(offset, e))?;
        validate_record(&record).map_err(|reason| corrupt(offset, reason))?;

        let slot = format!("{}/{}/{}", record.job, record.instance, record.name);
        let tmf = TimestampedMetricFamily::new(record.timestamp, record.metric_family);
        if snapshot
            .insert(record.job, record.instance, record.name, tmf)
            .is_some()
        {
            return Err(corrupt(offset, format!("duplicate record for {slot}")));
        }
        found += 1;
    };

    let expected = reader.u64()?;
    let digest = reader.take(DIGEST_LEN)?;
    if Sha256::digest(&bytes[..end_offset]).as_slice() != digest {
        return Err(PersistError::ChecksumMismatch);
    }
    if expected != found {
        return Err(PersistError::CountMismatch { expected, found });
    }
    if reader.remaining() > 0 {
        return Err(corrupt(reader.pos, "trailing bytes after end marker"));
    }
    Ok(snapshot)
}

fn validate_record(record: &Record) -> Result<(), String> {
    record.metric_family.validate().map_err(|e| e.to_string())?;
    if record.metric_family.name() != record.name {
        return Err(format!(
            "record name {} holds family {}",
            record.name,
            record.metric_family.name()
        ));
    }
    let check = check_labels(&record.job, &record.instance, &record.metric_family);
    if check.rejected > 0 {
        return Err(format!(
            "{} metrics of {} inconsistent with job {:?} instance {:?}",
            check.rejected, record.name, record.job, record.instance
        ));
    }
    Ok(())
}

fn corrupt(offset: usize, reason: impl ToString) -> PersistError {
    PersistError::Corrupt {
        offset,
        reason: reason.to_string(),
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> PersistResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(PersistError::Truncated { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> PersistResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> PersistResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Summary of a written checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub families: usize,
    pub bytes: usize,
}

/// Reads and writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct Persistor {
    path: PathBuf,
}

impl Persistor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file a checkpoint is staged in before the rename.
    pub fn in_progress_path(&self) -> PathBuf {
        let mut staged = self.path.as_os_str().to_owned();
        staged.push(".in_progress");
        PathBuf::from(staged)
    }

    /// Encode and write the whole snapshot.
    pub fn checkpoint(&self, snapshot: &Snapshot) -> PersistResult<CheckpointStats> {
        let bytes = encode_snapshot(snapshot)?;
        self.write_encoded(&bytes)?;
        Ok(CheckpointStats {
            families: snapshot.len(),
            bytes: bytes.len(),
        })
    }

    /// Atomically replace the checkpoint with already-encoded bytes.
    ///
    /// The bytes are written and fsync'ed to `<file>.in_progress` first, so
    /// a crash leaves either the old or the new checkpoint in place.
    pub fn write_encoded(&self, bytes: &[u8]) -> PersistResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let staged = self.in_progress_path();
        {
            let mut file = File::create(&staged)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&staged, &self.path)?;

        let digest = &bytes[bytes.len().saturating_sub(DIGEST_LEN)..];
        debug!(path = ?self.path, bytes = bytes.len(), sha256 = %hex::encode(digest),
            "checkpoint written");
        Ok(())
    }

    /// Load the checkpoint. A missing or empty file yields an empty snapshot.
    pub fn restore(&self) -> PersistResult<Snapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = ?self.path, "no checkpoint found, starting empty");
                return Ok(Snapshot::new());
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            warn!(path = ?self.path, "checkpoint file is empty, starting empty");
            return Ok(Snapshot::new());
        }
        let snapshot = decode_snapshot(&bytes)?;
        info!(path = ?self.path, families = snapshot.len(), "checkpoint restored");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pushgate_core::{
        Bucket, Metric, MetricKind, MetricValue, Quantile, WriteRequest, INSTANCE_LABEL,
        JOB_LABEL,
    };

    fn labelled(value: MetricValue, job: &str, instance: &str) -> Metric {
        Metric::new(value)
            .with_label(JOB_LABEL, job)
            .with_label(INSTANCE_LABEL, instance)
    }

    fn sample_snapshot() -> Snapshot {
        let at = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let mut snap = Snapshot::new();

        let jobs_run = MetricFamily::new(
            "jobs_run",
            "Jobs run.",
            MetricKind::Counter,
            vec![labelled(MetricValue::Counter { value: 5.0 }, "batch", "")],
        )
        .unwrap();
        snap.apply(WriteRequest::push("batch", "", [jobs_run]).with_timestamp(at));

        let latency = MetricFamily::new(
            "latency_seconds",
            "Latency.",
            MetricKind::Histogram,
            vec![labelled(
                MetricValue::Histogram {
                    sample_count: 4,
                    sample_sum: 1.5,
                    buckets: vec![
                        Bucket {
                            upper_bound: 0.25,
                            cumulative_count: 1,
                        },
                        Bucket {
                            upper_bound: f64::INFINITY,
                            cumulative_count: 4,
                        },
                    ],
                },
                "web",
                "h1",
            )
            .with_timestamp_ms(1_700_000_000_000)],
        )
        .unwrap();
        let rpc = MetricFamily::new(
            "rpc_seconds",
            "RPC time.",
            MetricKind::Summary,
            vec![labelled(
                MetricValue::Summary {
                    sample_count: 10,
                    sample_sum: 2.0,
                    quantiles: vec![Quantile {
                        quantile: 0.99,
                        value: 0.4,
                    }],
                },
                "web",
                "h1",
            )],
        )
        .unwrap();
        snap.apply(WriteRequest::push("web", "h1", [latency, rpc]).with_timestamp(at));
        snap
    }

    #[test]
    fn checkpoint_then_restore_reproduces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = Persistor::new(dir.path().join("metrics.ckpt"));
        let snap = sample_snapshot();

        let stats = persistor.checkpoint(&snap).unwrap();
        assert_eq!(stats.families, 3);
        assert!(!persistor.in_progress_path().exists());

        let restored = persistor.restore().unwrap();
        assert_eq!(restored, snap);
    }

    #[test]
    fn empty_snapshot_roundtrips() {
        let bytes = encode_snapshot(&Snapshot::new()).unwrap();
        assert!(decode_snapshot(&bytes).unwrap().is_empty());
    }

    #[test]
    fn encoding_is_deterministic() {
        let snap = sample_snapshot();
        assert_eq!(
            encode_snapshot(&snap).unwrap(),
            encode_snapshot(&snap.clone()).unwrap()
        );
    }

    #[test]
    fn missing_file_restores_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = Persistor::new(dir.path().join("absent.ckpt"));
        assert!(persistor.restore().unwrap().is_empty());
    }

    #[test]
    fn zero_length_file_restores_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.ckpt");
        File::create(&path).unwrap();
        assert!(Persistor::new(path).restore().unwrap().is_empty());
    }

    #[test]
    fn every_truncation_is_detected() {
        let bytes = encode_snapshot(&sample_snapshot()).unwrap();
        for cut in 1..bytes.len() {
            let err = decode_snapshot(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(
                    err,
                    PersistError::Truncated { .. }
                        | PersistError::BadMagic
                        | PersistError::ChecksumMismatch
                ),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_snapshot(&sample_snapshot()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode_snapshot(&bytes), Err(PersistError::BadMagic)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = encode_snapshot(&Snapshot::new()).unwrap();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(PersistError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn altered_payload_fails_checksum() {
        let mut bytes = encode_snapshot(&sample_snapshot()).unwrap();
        let pos = bytes
            .windows(b"Jobs run.".len())
            .position(|w| w == b"Jobs run.")
            .unwrap();
        bytes[pos] = b'L';
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(PersistError::ChecksumMismatch)
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_snapshot(&sample_snapshot()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(PersistError::Corrupt { .. })
        ));
    }

    #[test]
    fn garbage_record_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"{{{");
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(PersistError::Corrupt { offset: 12, .. })
        ));
    }

    #[test]
    fn stale_in_progress_file_is_ignored_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = Persistor::new(dir.path().join("metrics.ckpt"));
        fs::write(persistor.in_progress_path(), b"half a checkpoint").unwrap();

        assert!(persistor.restore().unwrap().is_empty());
        persistor.checkpoint(&sample_snapshot()).unwrap();
        assert!(!persistor.in_progress_path().exists());
        assert_eq!(persistor.restore().unwrap().len(), 3);
    }

    #[test]
    fn checkpoint_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = Persistor::new(dir.path().join("nested/dir/metrics.ckpt"));
        persistor.checkpoint(&sample_snapshot()).unwrap();
        assert!(persistor.path().exists());
    }
}
