use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// `[u32 len][bincode Event][u32 crc32]`, little-endian.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(None)` on a clean end of file or a torn tail.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Next intact record, or `None` where the log stops being trustworthy.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if read_exact_or_eof(reader, &mut word)?.is_none() {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if read_exact_or_eof(reader, &mut payload)?.is_none() {
        return Ok(None);
    }
    if read_exact_or_eof(reader, &mut word)?.is_none() {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only write-ahead log of engine events.
///
/// A crash mid-write leaves at most one torn record at the tail; the length
/// prefix and checksum let replay drop it and everything after it.
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

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
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

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    /// Write `events` to a sibling snapshot file and fsync it. The live log
    /// is untouched until `install_snapshot`.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log, oldest first. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
