use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Larger length prefixes can only come from a corrupt tail.
const MAX_FRAME_LEN: usize = 16 << 20;

/// Why replay stopped before the end of the file.
#[derive(Debug, PartialEq, Eq)]
enum Tail {
    Clean,
    Truncated,
    BadChecksum,
    Undecodable,
}

/// Fill `buf` completely. `Ok(false)` on EOF, even mid-buffer.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next frame and its size on disk. `Err(tail)` inside `Ok` ends
/// the replay.
fn read_entry(reader: &mut impl Read) -> io::Result<Result<(Event, u64), Tail>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(Err(Tail::Clean));
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Err(Tail::Undecodable));
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(Err(Tail::Truncated));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Err(Tail::BadChecksum));
    }
    let event = bincode::deserialize::<Event>(&payload).map_err(|_| Tail::Undecodable);
    Ok(event.map(|e| (e, (len + 8) as u64)))
}

/// Append-only event log backing the engine.
///
/// A crash can leave a torn last frame; replay stops at the first frame that
/// is short, fails its checksum, or does not decode, and keeps everything
/// before it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production writes go through
    /// `append_buffered` + `flush_sync` so a batch shares one fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write a snapshot next to the log and fsync it. The live log is
    /// untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        tracing::info!("WAL compacted: {}", self.path.display());
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log, in append order. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay the log and cut any torn or corrupt tail off the file, so that
    /// later appends land directly after the last intact frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                "WAL {}: truncated {} trailing bytes",
                path.display(),
                len - valid_len
            );
        }
        Ok(events)
    }

    /// Intact events plus the byte length they cover.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        let tail = loop {
            match read_entry(&mut reader)? {
                Ok((event, frame_len)) => {
                    events.push(event);
                    valid_len += frame_len;
                }
                Err(tail) => break tail,
            }
        };
        if tail != Tail::Clean {
            tracing::warn!(
                "WAL {}: discarded tail after {} events ({tail:?})",
                path.display(),
                events.len()
            );
        }
        Ok((events, valid_len))
    }
}
