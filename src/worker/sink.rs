use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use rkyv::{
    ser::serializers::AllocSerializer, AlignedVec, Archive, Deserialize,
    Serialize,
};
use tracing::debug;

use crate::net::{
    error::Error,
    wire::{DetectorInfo, Hits, WIRE_VERSION},
};

/// Leading bytes of every run file.
pub const RUN_MAGIC: &[u8; 5] = b"PHRUN";

const ZSTD_LEVEL: i32 = 3;

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum DType {
    U32,
    F32,
}

/// A column of the per-event hit table.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
}

/// Columns written for every event, in storage order.
pub fn schema() -> Vec<Column> {
    [
        ("channel", DType::U32),
        ("time", DType::F32),
        ("wavelength", DType::F32),
        ("u", DType::F32),
        ("v", DType::F32),
        ("w", DType::F32),
        ("pol_x", DType::F32),
        ("pol_y", DType::F32),
        ("pol_z", DType::F32),
        ("flag", DType::U32),
    ]
    .into_iter()
    .map(|(name, dtype)| Column {
        name: name.into(),
        dtype,
    })
    .collect()
}

/// Buffered events, one entry per event in every column.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct EventBatch {
    pub event_id: Vec<u32>,
    pub channel: Vec<Vec<u32>>,
    pub time: Vec<Vec<f32>>,
    pub wavelength: Vec<Vec<f32>>,
    pub u: Vec<Vec<f32>>,
    pub v: Vec<Vec<f32>>,
    pub w: Vec<Vec<f32>>,
    pub pol_x: Vec<Vec<f32>>,
    pub pol_y: Vec<Vec<f32>>,
    pub pol_z: Vec<Vec<f32>>,
    pub flag: Vec<Vec<u32>>,
}

impl EventBatch {
    pub fn push(&mut self, event_id: u32, hits: Hits) {
        let Hits {
            channel,
            dir: [u, v, w],
            pol: [pol_x, pol_y, pol_z],
            wavelength,
            time,
            flags,
        } = hits;
        self.event_id.push(event_id);
        self.channel.push(channel);
        self.time.push(time);
        self.wavelength.push(wavelength);
        self.u.push(u);
        self.v.push(v);
        self.w.push(w);
        self.pol_x.push(pol_x);
        self.pol_y.push(pol_y);
        self.pol_z.push(pol_z);
        self.flag.push(flags);
    }

    pub fn len(&self) -> usize {
        self.event_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_id.is_empty()
    }

    pub fn clear(&mut self) {
        *self = EventBatch::default();
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RunHeader {
    pub wire_version: u8,
    pub created_at_micros: i64,
}

/// An open, append-only run output.
pub trait RunSink {
    fn write_detector_info(&mut self, info: &DetectorInfo) -> Result<(), Error>;
    fn declare_schema(&mut self, columns: &[Column]) -> Result<(), Error>;
    fn write_batch(&mut self, batch: &EventBatch) -> Result<(), Error>;
    /// Consumes the sink, so a run can only be closed once.
    fn close(self) -> Result<(), Error>;
}

/// Opens run outputs by name.
pub trait Storage {
    type Sink: RunSink;

    fn create(&mut self, name: &str) -> Result<Self::Sink, Error>;
}

/// Writes each run to `<dir>/<name>`.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }
}

impl Storage for FileStorage {
    type Sink = FileSink;

    fn create(&mut self, name: &str) -> Result<FileSink, Error> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(RUN_MAGIC)?;
        let mut sink = FileSink { path, out };
        sink.write_record(
            RecordTag::Header,
            &RunHeader {
                wire_version: WIRE_VERSION,
                created_at_micros: Utc::now().timestamp_micros(),
            },
        )?;
        debug!(path = %sink.path.display(), "opened run file");
        Ok(sink)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordTag {
    Header = 1,
    Detector = 2,
    Schema = 3,
    Batch = 4,
}

impl TryFrom<u8> for RecordTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordTag::Header),
            2 => Ok(RecordTag::Detector),
            3 => Ok(RecordTag::Schema),
            4 => Ok(RecordTag::Batch),
            other => {
                Err(Error::CorruptRun(format!("unknown record tag {}", other)))
            }
        }
    }
}

/// A run file: the magic, then records of `tag | len | zstd(archive)` with
/// `len` a u32 little-endian.
pub struct FileSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl FileSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record<T>(
        &mut self,
        tag: RecordTag,
        value: &T,
    ) -> Result<(), Error>
    where
        T: Serialize<AllocSerializer<1024>>,
    {
        let bytes = rkyv::to_bytes::<_, 1024>(value)
            .map_err(|e| Error::Archive(format!("{:?}", e)))?;
        let compressed = zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL)?;
        let len = u32::try_from(compressed.len())
            .map_err(|_| {
                Error::Archive(format!("{:?} record too large", tag))
            })?;
        self.out.write_all(&[tag as u8])?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&compressed)?;
        Ok(())
    }
}

impl RunSink for FileSink {
    fn write_detector_info(
        &mut self,
        info: &DetectorInfo,
    ) -> Result<(), Error> {
        self.write_record(RecordTag::Detector, info)
    }

    fn declare_schema(&mut self, columns: &[Column]) -> Result<(), Error> {
        self.write_record(RecordTag::Schema, &columns.to_vec())
    }

    fn write_batch(&mut self, batch: &EventBatch) -> Result<(), Error> {
        self.write_record(RecordTag::Batch, batch)?;
        // each batch is durable on its own
        self.out.flush()?;
        Ok(())
    }

    fn close(mut self) -> Result<(), Error> {
        self.out.flush()?;
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(path = %self.path.display(), "closed run file");
        Ok(())
    }
}

/// Everything recorded in a run file.
#[derive(Debug)]
pub struct RunContents {
    pub header: RunHeader,
    pub detector: DetectorInfo,
    pub schema: Vec<Column>,
    pub batches: Vec<EventBatch>,
}

pub fn read_run(path: &Path) -> Result<RunContents, Error> {
    let bytes = fs::read(path)?;
    let mut rest = bytes
        .strip_prefix(&RUN_MAGIC[..])
        .ok_or_else(|| Error::CorruptRun("missing magic".into()))?;

    let mut header = None;
    let mut detector = None;
    let mut schema = None;
    let mut batches = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 5 {
            return Err(Error::CorruptRun("truncated record header".into()));
        }
        let tag = RecordTag::try_from(rest[0])?;
        let len =
            u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let payload = rest
            .get(5..5 + len)
            .ok_or_else(|| {
                Error::CorruptRun(format!("truncated {:?} record", tag))
            })?;
        rest = &rest[5 + len..];

        let mut archive = AlignedVec::new();
        archive.extend_from_slice(&zstd::decode_all(payload)?);
        let corrupt = |e: &dyn std::fmt::Debug| {
            Error::CorruptRun(format!("{:?} record: {:?}", tag, e))
        };
        match tag {
            RecordTag::Header => {
                let value = rkyv::from_bytes::<RunHeader>(&archive);
                header = Some(value.map_err(|e| corrupt(&e))?);
            }
            RecordTag::Detector => {
                let value = rkyv::from_bytes::<DetectorInfo>(&archive);
                detector = Some(value.map_err(|e| corrupt(&e))?);
            }
            RecordTag::Schema => {
                let value = rkyv::from_bytes::<Vec<Column>>(&archive);
                schema = Some(value.map_err(|e| corrupt(&e))?);
            }
            RecordTag::Batch => {
                let value = rkyv::from_bytes::<EventBatch>(&archive);
                batches.push(value.map_err(|e| corrupt(&e))?);
            }
        }
    }

    let missing =
        |record: &str| Error::CorruptRun(format!("no {} record", record));
    Ok(RunContents {
        header: header.ok_or_else(|| missing("header"))?,
        detector: detector.ok_or_else(|| missing("detector"))?,
        schema: schema.ok_or_else(|| missing("schema"))?,
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(n: u32) -> Hits {
        let len = n as usize;
        Hits {
            channel: (0..n).collect(),
            dir: [vec![0.1; len], vec![0.2; len], vec![0.3; len]],
            pol: [vec![1.0; len], vec![0.0; len], vec![0.0; len]],
            wavelength: vec![450.0; len],
            time: (0..n).map(|t| t as f32).collect(),
            flags: vec![2; len],
        }
    }

    #[test]
    fn run_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("runs"));
        let mut sink = storage.create("run7.hits").unwrap();
        let path = sink.path().to_path_buf();

        let info = DetectorInfo {
            x: vec![1.0],
            y: vec![2.0],
            z: vec![3.0],
            channel_type: vec![1],
        };
        sink.write_detector_info(&info).unwrap();
        sink.declare_schema(&schema()).unwrap();

        let mut batch = EventBatch::default();
        batch.push(1, hits(3));
        batch.push(2, hits(0));
        sink.write_batch(&batch).unwrap();
        batch.clear();
        batch.push(3, hits(1));
        sink.write_batch(&batch).unwrap();
        sink.close().unwrap();

        let run = read_run(&path).unwrap();
        assert_eq!(run.header.wire_version, WIRE_VERSION);
        assert_eq!(run.detector, info);
        assert_eq!(run.schema.len(), 10);
        assert_eq!(run.schema[0].name, "channel");
        assert_eq!(run.batches.len(), 2);
        assert_eq!(run.batches[0].event_id, vec![1, 2]);
        assert_eq!(run.batches[0].channel[0], vec![0, 1, 2]);
        assert!(run.batches[0].u[1].is_empty());
        assert_eq!(run.batches[1].event_id, vec![3]);
    }

    #[test]
    fn missing_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus");
        fs::write(&path, b"not a run").unwrap();
        assert!(matches!(read_run(&path), Err(Error::CorruptRun(_))));
    }

    #[test]
    fn batch_columns_follow_hits() {
        let mut batch = EventBatch::default();
        batch.push(5, hits(2));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.w[0], vec![0.3, 0.3]);
        assert_eq!(batch.flag[0], vec![2, 2]);
        batch.clear();
        assert!(batch.is_empty());
    }
}
