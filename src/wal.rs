use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const MAGIC: &[u8; 4] = b"AGWL";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;
/// Anything longer is a corrupt length prefix, not a real record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn header() -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(MAGIC);
    h[4..].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    h
}

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one record. `Ok(None)` means clean end of log, or a torn/corrupt tail.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of store mutations.
///
/// File layout: `AGWL` magic and a `u32` format version, then records of
/// `[u32: len][bincode: Event][u32: crc32]`. A truncated last record (crash)
/// is discarded on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, writing the header if the file is new.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if writer.get_ref().metadata()?.len() == 0 {
            writer.write_all(&header())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync`.
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

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a full snapshot of events to `<path>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&header())?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay every intact event. A missing file is an empty log; a file that
    /// does not start with the `AGWL` header is an error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut head = [0u8; HEADER_LEN];
        if !read_or_eof(&mut reader, &mut head)? {
            // Crashed while creating the file.
            return Ok(Vec::new());
        }
        if head[..4] != MAGIC[..] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not an agenda WAL", path.display()),
            ));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&head[4..]);
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported WAL format version {version}"),
            ));
        }

        let mut events = Vec::new();
        while let Some(event) = decode_event(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> Event {
        Event::ServiceUpserted(Service {
            name: name.into(),
            price: Money::from_cents(8000),
            duration_minutes: 60,
        })
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            service("Corte"),
            Event::AppointmentStatusChanged {
                id: Ulid::new(),
                status: AppointmentStatus::Cancelled,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_does_not_duplicate_header() {
        let path = tmp_path("reopen.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service("Corte")).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service("Escova")).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = service("Corte");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_foreign_file() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x02\x03\x04").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = service("Corte");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&service("Escova")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let snapshot = vec![service("Corte")];
        let later = service("Manicure");

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&service("Corte")).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| service(&format!("S{i}"))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
