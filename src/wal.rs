use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Frames larger than this are treated as corruption, not allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One mutation of profile storage. This is the log record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageOp {
    Set { key: String, value: String },
    Remove { key: String },
}

fn write_frame(out: &mut impl Write, op: &StorageOp) -> io::Result<()> {
    let body = bincode::serialize(op).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(body.len() as u32).to_le_bytes())?;
    out.write_all(&body)?;
    out.write_all(&crc32fast::hash(&body).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame body, or `None` at end of log or at the first damaged frame.
fn read_frame(input: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_full(input, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut body = vec![0u8; len];
    if !read_full(input, &mut body)? || !read_full(input, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&body) {
        return Ok(None);
    }
    Ok(Some(body))
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Append-only log behind [`crate::storage::FileStorage`].
///
/// Each frame is `[u32 len][bincode StorageOp][u32 crc32]`, little endian.
/// Anything after the first short or mismatched frame is ignored on replay,
/// which is what a crash in the middle of an append leaves behind.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one op and fsync before returning.
    pub fn append(&mut self, op: &StorageOp) -> io::Result<()> {
        self.append_buffered(op)?;
        self.flush_sync()
    }

    /// Buffer one op; durable only after [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, op: &StorageOp) -> io::Result<()> {
        write_frame(&mut self.out, op)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `live`. The new log is written beside the
    /// old one and renamed over it, so a crash leaves one of the two intact.
    pub fn compact(&mut self, live: &[StorageOp]) -> io::Result<()> {
        self.flush_sync()?;

        let staging = self.path.with_extension("kv.tmp");
        let mut out = BufWriter::new(File::create(&staging)?);
        for op in live {
            write_frame(&mut out, op)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&staging, &self.path)?;
        self.out = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact op in the log at `path`, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<StorageOp>> {
        let mut input = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ops = Vec::new();
        while let Some(body) = read_frame(&mut input)? {
            match bincode::deserialize::<StorageOp>(&body) {
                Ok(op) => ops.push(op),
                Err(_) => break,
            }
        }
        Ok(ops)
    }
}
