//! Append-only block files (`blkNNNNN.dat`) holding `[len u32 LE][block]` records.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

pub const BLOCK_FILE_PREFIX: &str = "blk";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
const RECORD_HEADER_LEN: u64 = 4;

/// Where a block record starts (its length prefix) and how long the block is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    MissingFile(u32),
    /// A record header runs past the end of the file.
    Truncated { file_id: u32, offset: u64 },
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::InvalidLocation => write!(f, "invalid block file location"),
            BlockFileError::LengthMismatch => write!(f, "block file length mismatch"),
            BlockFileError::MissingFile(file_id) => write!(f, "block file {file_id} not found"),
            BlockFileError::Truncated { file_id, offset } => {
                write!(f, "block file {file_id} truncated at offset {offset}")
            }
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

/// The full contents of one block file, shared by every batch reading it.
#[derive(Debug)]
pub struct BlockFileMap {
    file_id: u32,
    bytes: Vec<u8>,
}

impl BlockFileMap {
    pub fn new(file_id: u32, bytes: Vec<u8>) -> Self {
        Self { file_id, bytes }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Block bytes for `location`, after checking the stored length prefix.
    pub fn block(&self, location: FileLocation) -> Result<&[u8], BlockFileError> {
        if location.file_id != self.file_id || location.len == 0 {
            return Err(BlockFileError::InvalidLocation);
        }
        let start = usize::try_from(location.offset).map_err(|_| BlockFileError::InvalidLocation)?;
        let body = start
            .checked_add(RECORD_HEADER_LEN as usize)
            .ok_or(BlockFileError::InvalidLocation)?;
        let header = self
            .bytes
            .get(start..body)
            .ok_or(BlockFileError::InvalidLocation)?;
        let stored_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if stored_len != location.len {
            return Err(BlockFileError::LengthMismatch);
        }
        self.bytes
            .get(body..body + stored_len as usize)
            .ok_or(BlockFileError::InvalidLocation)
    }

    /// Locations of every record in file order.
    pub fn records(&self) -> Result<Vec<FileLocation>, BlockFileError> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        let total = self.bytes.len() as u64;
        while offset < total {
            if offset + RECORD_HEADER_LEN > total {
                return Err(BlockFileError::Truncated {
                    file_id: self.file_id,
                    offset,
                });
            }
            let start = offset as usize;
            let len = u32::from_le_bytes([
                self.bytes[start],
                self.bytes[start + 1],
                self.bytes[start + 2],
                self.bytes[start + 3],
            ]);
            if offset + RECORD_HEADER_LEN + u64::from(len) > total {
                return Err(BlockFileError::Truncated {
                    file_id: self.file_id,
                    offset,
                });
            }
            out.push(FileLocation {
                file_id: self.file_id,
                offset,
                len,
            });
            offset += RECORD_HEADER_LEN + u64::from(len);
        }
        Ok(out)
    }
}

/// Read access to numbered block files.
pub trait BlockSource: Send + Sync {
    fn file_count(&self) -> u32;
    fn map_file(&self, file_id: u32) -> Result<Arc<BlockFileMap>, BlockFileError>;
}

impl<T: BlockSource + ?Sized> BlockSource for Arc<T> {
    fn file_count(&self) -> u32 {
        self.as_ref().file_count()
    }

    fn map_file(&self, file_id: u32) -> Result<Arc<BlockFileMap>, BlockFileError> {
        self.as_ref().map_file(file_id)
    }
}

/// Block files in a directory. A mapping stays cached only while some batch
/// still holds it.
pub struct BlockFiles {
    dir: PathBuf,
    prefix: String,
    mapped: Mutex<HashMap<u32, Weak<BlockFileMap>>>,
}

impl BlockFiles {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BlockFileError> {
        Self::open_with_prefix(dir, BLOCK_FILE_PREFIX)
    }

    pub fn open_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(BlockFileError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("block directory {} not found", dir.display()),
            )));
        }
        Ok(Self {
            dir,
            prefix: prefix.into(),
            mapped: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        block_file_path(&self.dir, &self.prefix, file_id)
    }

    fn cached(&self, file_id: u32) -> Option<Arc<BlockFileMap>> {
        self.mapped
            .lock()
            .expect("block file cache lock")
            .get(&file_id)
            .and_then(Weak::upgrade)
    }
}

impl BlockSource for BlockFiles {
    fn file_count(&self) -> u32 {
        let mut file_id = 0u32;
        while self.file_path(file_id).exists() {
            file_id += 1;
        }
        file_id
    }

    fn map_file(&self, file_id: u32) -> Result<Arc<BlockFileMap>, BlockFileError> {
        if let Some(existing) = self.cached(file_id) {
            return Ok(existing);
        }
        // The cache lock is not held across the read.
        let path = self.file_path(file_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockFileError::MissingFile(file_id))
            }
            Err(err) => return Err(err.into()),
        };
        let map = Arc::new(BlockFileMap::new(file_id, bytes));

        let mut mapped = self.mapped.lock().expect("block file cache lock");
        if let Some(existing) = mapped.get(&file_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        mapped.retain(|_, weak| weak.strong_count() > 0);
        mapped.insert(file_id, Arc::downgrade(&map));
        Ok(map)
    }
}

/// Appends block records, rolling to a new file once `max_file_size` would be exceeded.
pub struct BlockFileWriter {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    state: Mutex<WriterState>,
}

#[derive(Debug)]
struct WriterState {
    current_file: u32,
    current_len: u64,
}

impl BlockFileWriter {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, BlockFileError> {
        Self::new_with_prefix(dir, BLOCK_FILE_PREFIX, max_file_size)
    }

    pub fn new_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(WriterState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, BlockFileError> {
        let len = u32::try_from(bytes.len()).map_err(|_| BlockFileError::InvalidLocation)?;
        let mut state = self.state.lock().expect("block file writer lock");
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = block_file_path(&self.dir, &self.prefix, state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    /// Starts a new file for the next append even if the current one has room.
    pub fn roll(&self) {
        let mut state = self.state.lock().expect("block file writer lock");
        if state.current_len > 0 {
            state.current_file += 1;
            state.current_len = 0;
        }
    }
}

fn block_file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{prefix}{file_id:05}.dat"))
}

fn locate_active_file(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<(u32, u64), BlockFileError> {
    let mut file_id = 0u32;
    let mut last_existing: Option<(u32, u64)> = None;
    loop {
        let path = block_file_path(dir, prefix, file_id);
        if !path.exists() {
            break;
        }
        let len = std::fs::metadata(&path)?.len();
        last_existing = Some((file_id, len));
        file_id += 1;
    }

    match last_existing {
        Some((last_id, len)) if len >= max_file_size => Ok((last_id + 1, 0)),
        Some((last_id, len)) => Ok((last_id, len)),
        None => Ok((0, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rolls_over_and_maps_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = BlockFileWriter::new(dir.path(), 64).expect("writer");
        let first = writer.append(&[1u8; 40]).expect("append");
        let second = writer.append(&[2u8; 40]).expect("append");
        assert_eq!(first.file_id, 0);
        assert_eq!(second.file_id, 1);
        assert_eq!(second.offset, 0);

        let files = BlockFiles::open(dir.path()).expect("open");
        assert_eq!(files.file_count(), 2);
        let map = files.map_file(1).expect("map");
        assert_eq!(map.block(second).expect("block"), &[2u8; 40][..]);
        assert_eq!(map.records().expect("records"), vec![second]);
        assert!(matches!(
            map.block(first),
            Err(BlockFileError::InvalidLocation)
        ));
    }

    #[test]
    fn mapping_is_shared_while_referenced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = BlockFileWriter::new(dir.path(), 1024).expect("writer");
        writer.append(&[7u8; 10]).expect("append");
        let files = BlockFiles::open(dir.path()).expect("open");
        let a = files.map_file(0).expect("map");
        let b = files.map_file(0).expect("map");
        assert!(Arc::ptr_eq(&a, &b));
        drop(a);
        drop(b);
        let c = files.map_file(0).expect("map");
        assert_eq!(c.len(), 14);
    }

    #[cfg(unix)]
    #[test]
    fn slow_read_does_not_block_other_files() {
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("blk00001.dat"), [4, 0, 0, 0, 1, 2, 3, 4]).expect("write");
        // A fifo read blocks until something writes to it.
        let fifo = dir.path().join("blk00000.dat");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .expect("mkfifo");
        assert!(status.success());

        let files = Arc::new(BlockFiles::open(dir.path()).expect("open"));
        let stalled = {
            let files = Arc::clone(&files);
            std::thread::spawn(move || files.map_file(0))
        };
        std::thread::sleep(Duration::from_millis(50));

        let (sender, receiver) = crossbeam_channel::bounded(1);
        {
            let files = Arc::clone(&files);
            std::thread::spawn(move || {
                let _ = sender.send(files.map_file(1).map(|map| map.len()));
            });
        }
        let len = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("file 1 mapped while file 0 is still loading")
            .expect("map");
        assert_eq!(len, 8);

        std::fs::write(&fifo, [1, 0, 0, 0, 9]).expect("feed fifo");
        let map = stalled.join().expect("join").expect("map");
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn length_prefix_must_match() {
        let map = BlockFileMap::new(0, vec![3, 0, 0, 0, 9, 9, 9]);
        let bad = FileLocation {
            file_id: 0,
            offset: 0,
            len: 2,
        };
        assert!(matches!(map.block(bad), Err(BlockFileError::LengthMismatch)));
        assert!(matches!(
            BlockFiles::open(tempfile::tempdir().expect("tempdir").path())
                .expect("open")
                .map_file(4),
            Err(BlockFileError::MissingFile(4))
        ));
    }

    #[test]
    fn writer_resumes_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let writer = BlockFileWriter::new(dir.path(), 1024).expect("writer");
            writer.append(&[1u8; 8]).expect("append");
        }
        let writer = BlockFileWriter::new(dir.path(), 1024).expect("writer");
        let location = writer.append(&[2u8; 8]).expect("append");
        assert_eq!(location.file_id, 0);
        assert_eq!(location.offset, 12);
    }
}
