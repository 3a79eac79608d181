use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 64 << 20;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn write_frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large to log"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// What reading one frame off the log produced.
enum Frame {
    /// An intact event and the number of bytes its frame took.
    Event(Event, u64),
    /// Clean end of file on a frame boundary.
    End,
    /// The file ends inside a frame (crash mid-write).
    Torn,
    Corrupt(String),
}

/// Fill `buf` completely. `Ok(false)` if the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    // A partial length prefix also reads as end of file here. Its bytes lie
    // past the last good frame, so recovery cuts them off.
    if !read_full(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Corrupt(format!("frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Corrupt("crc mismatch".into()));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, 8 + len as u64)),
        Err(e) => Ok(Frame::Corrupt(e.to_string())),
    }
}

/// Append-only log of committed scheduler events.
///
/// The first torn or corrupt frame ends replay; everything after it is
/// dropped, and `recover` cuts it off the file so new appends follow the
/// last good frame. Compaction writes a snapshot to `<log>.wal.tmp` and renames it
/// over the log.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn snapshot_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay the log at `path`, truncate anything after the last intact
    /// frame, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = meta.len() - valid_len,
                "truncated log to last intact entry"
            );
        }
        Ok((Self::open(path)?, events))
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `events` as the next snapshot of the log at `path` and fsync it.
    /// The live log is untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(snapshot_path(path))?);
        for event in events {
            write_frame(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Atomically replace the log with the snapshot and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(snapshot_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.appends_since_compact = 0;
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

    /// Every intact event in the log at `path`, oldest first. A missing file
    /// is an empty log.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

/// Intact events plus the byte length of the prefix that holds them.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let mut reader = match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    loop {
        match read_frame(&mut reader)? {
            Frame::Event(event, size) => {
                events.push(event);
                valid_len += size;
            }
            Frame::End => break,
            Frame::Torn => {
                tracing::warn!(
                    path = %path.display(),
                    recovered = events.len(),
                    "log ends mid-entry, discarding it"
                );
                break;
            }
            Frame::Corrupt(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    recovered = events.len(),
                    "corrupt log entry ({reason}), discarding tail"
                );
                break;
            }
        }
    }
    Ok((events, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Slot, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("carebook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn slot(specialist_id: Ulid, start: i64) -> Slot {
        Slot {
            id: Ulid::new(),
            specialist_id,
            span: Span::new(start, start + 1_800_000),
            occupied: false,
            note: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn created(specialist_id: Ulid, start: i64) -> Event {
        Event::SlotsCreated {
            specialist_id,
            slots: vec![slot(specialist_id, start)],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let first = created(sid, 0);
        let slot_id = match &first {
            Event::SlotsCreated { slots, .. } => slots[0].id,
            _ => unreachable!(),
        };
        let events = vec![
            first,
            Event::SlotOccupied {
                id: slot_id,
                specialist_id: sid,
                at: 5,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = created(Ulid::new(), 0);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Torn second entry: partial length prefix plus a couple of bytes.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let event = Event::SlotDeleted {
            id: Ulid::new(),
            specialist_id: Ulid::new(),
        };
        {
            let payload = bincode::serialize(&event).unwrap();
            let len = payload.len() as u32;
            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_absurd_length_prefix() {
        let path = tmp_path("absurd_len.wal");
        let _ = fs::remove_file(&path);

        let event = created(Ulid::new(), 0);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let first = created(sid, 0);
        let second = created(sid, 3_600_000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            wal.append(&second).unwrap();
        }

        let (_, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![first.clone(), second.clone()]);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        let _ = fs::remove_file(&path);

        let (wal, events) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        drop(wal);

        let event = created(Ulid::new(), 0);
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let (_, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact_then_append.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let keep = created(sid, 0);
        let after = created(sid, 3_600_000);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            // churn: create and delete the same slot over and over
            for i in 1..=10 {
                let e = created(sid, i * 7_200_000);
                let id = match &e {
                    Event::SlotsCreated { slots, .. } => slots[0].id,
                    _ => unreachable!(),
                };
                wal.append(&e).unwrap();
                wal.append(&Event::SlotDeleted {
                    id,
                    specialist_id: sid,
                })
                .unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);

            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let compacted = fs::metadata(&path).unwrap().len();
            assert!(compacted < before, "{compacted} < {before}");

            wal.append(&after).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![keep, after]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let sid = Ulid::new();
        let events: Vec<Event> = (0..5).map(|i| created(sid, i * 1_800_000)).collect();

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
