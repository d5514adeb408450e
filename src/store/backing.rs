//! Backing files: append-only frames file, persisted bucket index, location and orientation sidecars

use crate::error::{AaremuError, Result};
use crate::store::{FrameRecord, FrameRef, GeoFix, OrientationSample, RecordingHeader, RingIndex};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FRAMES_MAGIC: &[u8; 8] = b"AAREMUF1";
const INDEX_MAGIC: &[u8; 8] = b"AAREMUI1";
const LOCATION_MAGIC: &[u8; 8] = b"AAREMUL1";
const ORIENTATION_MAGIC: &[u8; 8] = b"AAREMUO1";
const INDEX_VERSION: u16 = 1;

/// timestamp (i64) + bearing (f32) + length (u32)
const RECORD_HEADER_LEN: u64 = 16;
/// timestamp, latitude, longitude, altitude (8 bytes each) + accuracy (f32)
const LOCATION_ENTRY_LEN: usize = 36;
/// timestamp (i64) + bearing (f32)
const ORIENTATION_ENTRY_LEN: usize = 12;

/// File names making up one recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    dir: PathBuf,
    name: String,
}

impl RecordingPaths {
    /// Recording `name` inside `dir`
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// Derive paths from a base path such as `captures/office` or `captures/office.head`
    pub fn from_base<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let known = ["head", "frames", "index", "location", "orientation"];
        let stem = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if known.contains(&ext) => path.with_extension(""),
            _ => path.to_path_buf(),
        };
        let name = stem
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording".to_string());
        let dir = stem
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { dir, name }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> PathBuf {
        self.dir.join(format!("{}.frames", self.name))
    }

    pub fn index(&self) -> PathBuf {
        self.dir.join(format!("{}.index", self.name))
    }

    pub fn location(&self) -> PathBuf {
        self.dir.join(format!("{}.location", self.name))
    }

    pub fn orientation(&self) -> PathBuf {
        self.dir.join(format!("{}.orientation", self.name))
    }

    pub fn header(&self) -> PathBuf {
        self.dir.join(format!("{}.head", self.name))
    }

    /// Check that the header and frames file are present
    pub fn exists(&self) -> bool {
        self.header().is_file() && self.frames().is_file()
    }
}

impl std::fmt::Display for RecordingPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir.join(&self.name).display())
    }
}

/// Destination for records drained by the frame writer
pub trait RecordSink: Send {
    /// Append one frame payload, returning where it was stored
    fn append(&mut self, record: &FrameRecord) -> io::Result<FrameRef>;

    /// Append one pass-through location fix
    fn append_location(&mut self, fix: &GeoFix) -> io::Result<()>;

    /// Append one pass-through orientation reading
    fn append_orientation(&mut self, sample: &OrientationSample) -> io::Result<()>;

    /// Flush the index and header; called once at session end
    fn seal(&mut self, index: &RingIndex) -> io::Result<RecordingHeader>;
}

/// Writes a recording to disk
pub struct StoreWriter {
    paths: RecordingPaths,
    header: RecordingHeader,
    frames: File,
    end: u64,
    location: Option<BufWriter<File>>,
    orientation: Option<BufWriter<File>>,
}

impl StoreWriter {
    /// Create (or truncate) a recording and write its preliminary header
    pub fn create(paths: RecordingPaths, mut header: RecordingHeader) -> io::Result<Self> {
        fs::create_dir_all(paths.dir())?;

        header.name = paths.name().to_string();
        header.frame_count = 0;
        header.indexed_count = 0;
        header.location_count = 0;
        header.orientation_count = 0;
        header.sealed = false;

        let mut frames = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(paths.frames())?;
        frames.write_all(FRAMES_MAGIC)?;
        frames.flush()?;

        // Stale sidecars from a previous take would describe the wrong frames file
        for stale in [paths.index(), paths.location(), paths.orientation()] {
            if stale.exists() {
                fs::remove_file(&stale)?;
            }
        }

        header.save(paths.header())?;
        info!("Recording to {}", paths);

        Ok(Self {
            paths,
            header,
            frames,
            end: FRAMES_MAGIC.len() as u64,
            location: None,
            orientation: None,
        })
    }

    /// Get the recording paths
    pub fn paths(&self) -> &RecordingPaths {
        &self.paths
    }

}

/// Sidecar writer, created with its magic on first use
fn sidecar<'a>(
    slot: &'a mut Option<BufWriter<File>>,
    path: PathBuf,
    magic: &[u8; 8],
) -> io::Result<&'a mut BufWriter<File>> {
    let file = match slot.take() {
        Some(file) => file,
        None => {
            let mut file = BufWriter::new(File::create(path)?);
            file.write_all(magic)?;
            file
        }
    };
    Ok(slot.insert(file))
}

impl RecordSink for StoreWriter {
    fn append(&mut self, record: &FrameRecord) -> io::Result<FrameRef> {
        let length = u32::try_from(record.payload.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame payload exceeds 4 GiB"))?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + record.payload.len());
        buf.write_i64::<LittleEndian>(record.timestamp)?;
        buf.write_f32::<LittleEndian>(record.bearing)?;
        buf.write_u32::<LittleEndian>(length)?;
        buf.extend_from_slice(&record.payload);

        let start = self.end;
        if let Err(e) = self.frames.write_all(&buf).and_then(|_| self.frames.flush()) {
            // Roll back a partial record so the file stays scannable
            if let Err(rollback) = self
                .frames
                .set_len(start)
                .and_then(|_| self.frames.seek(SeekFrom::Start(start)))
            {
                warn!(
                    "Could not roll back partial record at offset {} in {}: {}",
                    start, self.paths, rollback
                );
            }
            return Err(e);
        }
        self.end = start + buf.len() as u64;

        if self.header.frame_count == 0 {
            self.header.first_timestamp = record.timestamp;
        }
        self.header.last_timestamp = record.timestamp;
        self.header.frame_count += 1;

        Ok(FrameRef {
            offset: start + RECORD_HEADER_LEN,
            length,
            timestamp: record.timestamp,
            bearing: record.bearing,
        })
    }

    fn append_location(&mut self, fix: &GeoFix) -> io::Result<()> {
        let file = sidecar(&mut self.location, self.paths.location(), LOCATION_MAGIC)?;
        file.write_i64::<LittleEndian>(fix.timestamp)?;
        file.write_f64::<LittleEndian>(fix.latitude)?;
        file.write_f64::<LittleEndian>(fix.longitude)?;
        file.write_f64::<LittleEndian>(fix.altitude)?;
        file.write_f32::<LittleEndian>(fix.accuracy)?;
        self.header.location_count += 1;
        Ok(())
    }

    fn append_orientation(&mut self, sample: &OrientationSample) -> io::Result<()> {
        let file = sidecar(&mut self.orientation, self.paths.orientation(), ORIENTATION_MAGIC)?;
        file.write_i64::<LittleEndian>(sample.timestamp)?;
        file.write_f32::<LittleEndian>(sample.bearing)?;
        self.header.orientation_count += 1;
        Ok(())
    }

    fn seal(&mut self, index: &RingIndex) -> io::Result<RecordingHeader> {
        self.frames.sync_data()?;

        for file in [&mut self.location, &mut self.orientation].into_iter().flatten() {
            file.flush()?;
        }

        write_index(&self.paths.index(), index)?;

        self.header.bucket_width = index.bucket_width();
        self.header.bucket_count = index.bucket_count() as u32;
        self.header.indexed_count = index.populated() as u64;
        self.header.sealed = true;
        self.header.save(self.paths.header())?;

        info!(
            "Sealed {}: {} frames written, {} of {} buckets populated",
            self.paths,
            self.header.frame_count,
            self.header.indexed_count,
            self.header.bucket_count
        );
        Ok(self.header.clone())
    }
}

/// Persist the bucket index (written to a temp file, then renamed into place)
fn write_index(path: &Path, index: &RingIndex) -> io::Result<()> {
    let entries = index.entries();
    let tmp = path.with_extension("index.tmp");

    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(INDEX_MAGIC)?;
        out.write_u16::<LittleEndian>(INDEX_VERSION)?;
        out.write_f32::<LittleEndian>(index.bucket_width())?;
        out.write_u32::<LittleEndian>(index.bucket_count() as u32)?;
        out.write_u32::<LittleEndian>(entries.len() as u32)?;
        for (bucket, frame) in &entries {
            out.write_u32::<LittleEndian>(*bucket as u32)?;
            out.write_u64::<LittleEndian>(frame.offset)?;
            out.write_u32::<LittleEndian>(frame.length)?;
            out.write_i64::<LittleEndian>(frame.timestamp)?;
            out.write_f32::<LittleEndian>(frame.bearing)?;
        }
        out.flush()?;
    }

    fs::rename(&tmp, path)
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.into())
}

/// Load a persisted index, validating every entry against the frames file length
fn read_index(path: &Path, frames_len: u64) -> io::Result<RingIndex> {
    let mut input = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != INDEX_MAGIC {
        return Err(invalid("bad index magic"));
    }
    let version = input.read_u16::<LittleEndian>()?;
    if version != INDEX_VERSION {
        return Err(invalid(format!("unsupported index version {}", version)));
    }

    let width = input.read_f32::<LittleEndian>()?;
    let count = input.read_u32::<LittleEndian>()? as usize;
    let populated = input.read_u32::<LittleEndian>()? as usize;

    let index = RingIndex::new(width).map_err(|e| invalid(e.to_string()))?;
    if index.bucket_count() != count || populated > count {
        return Err(invalid("index bucket count mismatch"));
    }

    for _ in 0..populated {
        let bucket = input.read_u32::<LittleEndian>()? as usize;
        let frame = FrameRef {
            offset: input.read_u64::<LittleEndian>()?,
            length: input.read_u32::<LittleEndian>()?,
            timestamp: input.read_i64::<LittleEndian>()?,
            bearing: input.read_f32::<LittleEndian>()?,
        };
        let end = frame.offset.checked_add(frame.length as u64);
        if bucket >= count || end.map_or(true, |end| end > frames_len) {
            return Err(invalid("index entry outside frames file"));
        }
        index.put_bucket(bucket, frame);
    }

    Ok(index)
}

/// Read a fixed-size entry sidecar; a missing file is empty and a partial last entry is dropped
fn read_sidecar<T, F, const N: usize>(path: &Path, magic: &[u8; 8], parse: F) -> io::Result<Vec<T>>
where
    F: Fn(&mut &[u8]) -> io::Result<T>,
{
    let mut input = match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = [0u8; 8];
    input.read_exact(&mut found)?;
    if &found != magic {
        return Err(invalid(format!("bad magic in {}", path.display())));
    }

    let mut entries = Vec::new();
    let mut entry = [0u8; N];
    loop {
        match input.read_exact(&mut entry) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        entries.push(parse(&mut &entry[..])?);
    }
    Ok(entries)
}

fn read_locations(path: &Path) -> io::Result<Vec<GeoFix>> {
    read_sidecar::<_, _, LOCATION_ENTRY_LEN>(path, LOCATION_MAGIC, |cur| {
        Ok(GeoFix {
            timestamp: cur.read_i64::<LittleEndian>()?,
            latitude: cur.read_f64::<LittleEndian>()?,
            longitude: cur.read_f64::<LittleEndian>()?,
            altitude: cur.read_f64::<LittleEndian>()?,
            accuracy: cur.read_f32::<LittleEndian>()?,
        })
    })
}

fn read_orientations(path: &Path) -> io::Result<Vec<OrientationSample>> {
    read_sidecar::<_, _, ORIENTATION_ENTRY_LEN>(path, ORIENTATION_MAGIC, |cur| {
        Ok(OrientationSample {
            timestamp: cur.read_i64::<LittleEndian>()?,
            bearing: cur.read_f32::<LittleEndian>()?,
        })
    })
}

/// Read the record header at `offset`, returning the frame and the next record offset
///
/// Returns `None` at end of file or when the trailing record is truncated.
fn read_record_header(file: &mut File, offset: u64, file_len: u64) -> io::Result<Option<(FrameRef, u64)>> {
    if offset + RECORD_HEADER_LEN > file_len {
        if offset < file_len {
            warn!("Ignoring truncated record header at offset {}", offset);
        }
        return Ok(None);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut raw = [0u8; RECORD_HEADER_LEN as usize];
    file.read_exact(&mut raw)?;
    let mut cur = &raw[..];
    let timestamp = cur.read_i64::<LittleEndian>()?;
    let bearing = cur.read_f32::<LittleEndian>()?;
    let length = cur.read_u32::<LittleEndian>()?;

    let payload_offset = offset + RECORD_HEADER_LEN;
    let next = payload_offset + length as u64;
    if next > file_len {
        warn!(
            "Ignoring truncated record at offset {} ({} of {} payload bytes)",
            offset,
            file_len - payload_offset,
            length
        );
        return Ok(None);
    }

    Ok(Some((
        FrameRef {
            offset: payload_offset,
            length,
            timestamp,
            bearing,
        },
        next,
    )))
}

/// Rebuild the bucket index by scanning the frames file (last write per bucket wins)
fn rebuild_index(file: &mut File, bucket_width: f32) -> Result<RingIndex> {
    let index = RingIndex::new(bucket_width)?;
    let file_len = file.metadata()?.len();

    let mut offset = FRAMES_MAGIC.len() as u64;
    let mut scanned = 0usize;
    while let Some((frame, next)) = read_record_header(file, offset, file_len)? {
        index.put(frame.bearing, frame);
        offset = next;
        scanned += 1;
    }

    debug!(
        "Rebuilt index from {} records, {} buckets populated",
        scanned,
        index.populated()
    );
    Ok(index)
}

/// One record read sequentially from the frames file
#[derive(Debug, Clone)]
pub struct ScannedFrame {
    pub frame: FrameRef,
    pub payload: Vec<u8>,
    /// Offset of the following record
    pub next_offset: u64,
}

/// Read-only access to a recording for playback
pub struct FrameReader {
    paths: RecordingPaths,
    header: RecordingHeader,
    index: Arc<RingIndex>,
    file: File,
    locations: Vec<GeoFix>,
    orientations: Vec<OrientationSample>,
}

impl FrameReader {
    /// Open a recording, loading its persisted index or rebuilding it
    pub fn open(paths: &RecordingPaths) -> Result<Self> {
        let (header, mut file) = Self::open_files(paths)?;
        let frames_len = file.metadata()?.len();

        let index = match read_index(&paths.index(), frames_len) {
            Ok(index) => index,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No index for {}, rebuilding from frames", paths);
                rebuild_index(&mut file, header.bucket_width)?
            }
            Err(e) => {
                warn!("Index for {} unusable ({}), rebuilding from frames", paths, e);
                rebuild_index(&mut file, header.bucket_width)?
            }
        };

        Self::finish_open(paths, header, Arc::new(index), file)
    }

    /// Open a recording that is still being written, sharing the writer's live index
    pub fn open_shared(paths: &RecordingPaths, index: Arc<RingIndex>) -> Result<Self> {
        let (header, file) = Self::open_files(paths)?;
        Self::finish_open(paths, header, index, file)
    }

    fn open_files(paths: &RecordingPaths) -> Result<(RecordingHeader, File)> {
        let header = match RecordingHeader::load(paths.header()) {
            Ok(h) => h,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(AaremuError::NotFound),
            Err(e) => {
                return Err(AaremuError::corrupt(
                    paths.header().to_string_lossy(),
                    e.to_string(),
                ))
            }
        };

        let mut file = match File::open(paths.frames()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(AaremuError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 8];
        if file.read_exact(&mut magic).is_err() || &magic != FRAMES_MAGIC {
            return Err(AaremuError::corrupt(
                paths.frames().to_string_lossy(),
                "not a frames file",
            ));
        }

        Ok((header, file))
    }

    fn finish_open(
        paths: &RecordingPaths,
        header: RecordingHeader,
        index: Arc<RingIndex>,
        file: File,
    ) -> Result<Self> {
        let locations = read_locations(&paths.location()).unwrap_or_else(|e| {
            warn!("Ignoring unreadable location file for {}: {}", paths, e);
            Vec::new()
        });
        let orientations = read_orientations(&paths.orientation()).unwrap_or_else(|e| {
            warn!("Ignoring unreadable orientation file for {}: {}", paths, e);
            Vec::new()
        });

        debug!(
            "Opened {}: {} buckets populated, {} location fixes, {} orientation samples",
            paths,
            index.populated(),
            locations.len(),
            orientations.len()
        );

        Ok(Self {
            paths: paths.clone(),
            header,
            index,
            file,
            locations,
            orientations,
        })
    }

    pub fn paths(&self) -> &RecordingPaths {
        &self.paths
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    /// Bucket index for bearing lookups
    pub fn index(&self) -> &Arc<RingIndex> {
        &self.index
    }

    /// Recorded location fixes, in recorded order
    pub fn locations(&self) -> &[GeoFix] {
        &self.locations
    }

    /// Recorded orientation samples, in recorded order
    pub fn orientations(&self) -> &[OrientationSample] {
        &self.orientations
    }

    /// Check if the recording holds no indexed frame
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Offset of the first record in the frames file
    pub fn first_offset(&self) -> u64 {
        FRAMES_MAGIC.len() as u64
    }

    /// Read one frame payload by random access
    pub fn read_payload(&mut self, frame: &FrameRef) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(frame.offset))?;
        let mut payload = vec![0u8; frame.length as usize];
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read the record at `offset` in recorded order; `None` at end of recording
    pub fn read_at(&mut self, offset: u64) -> io::Result<Option<ScannedFrame>> {
        let file_len = self.file.metadata()?.len();
        let Some((frame, next_offset)) = read_record_header(&mut self.file, offset, file_len)? else {
            return Ok(None);
        };
        let payload = self.read_payload(&frame)?;
        Ok(Some(ScannedFrame {
            frame,
            payload,
            next_offset,
        }))
    }

    /// Average time between recorded frames, if it can be determined
    pub fn mean_frame_interval(&self) -> Option<Duration> {
        let (first, last, count) = if self.header.frame_count >= 2 {
            (
                self.header.first_timestamp,
                self.header.last_timestamp,
                self.header.frame_count,
            )
        } else {
            let entries = self.index.entries();
            let first = entries.iter().map(|(_, f)| f.timestamp).min()?;
            let last = entries.iter().map(|(_, f)| f.timestamp).max()?;
            (first, last, entries.len() as u64)
        };

        if count < 2 || last <= first {
            return None;
        }
        let mean_ms = (last - first) as u64 / (count - 1);
        Some(Duration::from_millis(mean_ms.max(1)))
    }

    /// Size of the zeroed frame served in place of a gap
    pub fn placeholder_size(&self) -> usize {
        self.header.frame_size().unwrap_or_else(|| {
            self.index
                .entries()
                .first()
                .map(|(_, f)| f.length as usize)
                .unwrap_or(0)
        })
    }
}
