use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read the next frame. `Ok(None)` on clean EOF, a torn tail, a CRC mismatch
/// or an undecodable payload: everything after the first bad frame is dropped.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only log of store mutations.
///
/// Writers batch with `append_buffered` and commit with `flush_sync`; the
/// store's writer task owns the handle so appends are never interleaved.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
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

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
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

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write a snapshot to the side file and fsync it. Slow; run it without
    /// holding the writer.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact event on disk, in append order. A missing file is empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kst::{now_kst, BusinessDate};
    use crate::model::*;
    use crate::slot::TimeSlot;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn booking(start: u8, end: u8) -> Reservation {
        let now = now_kst();
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            device_id: Ulid::new(),
            device_type_id: Ulid::new(),
            device_pinned: true,
            date: BusinessDate::parse("2025-01-25").unwrap(),
            slot: TimeSlot::new(start, end).unwrap(),
            credit_option: CreditOption::Freeplay,
            status: ReservationStatus::Pending,
            actual_start: None,
            actual_end: None,
            total_amount: 20_000,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let r = booking(14, 16);
        let mut approved = r.clone();
        approved.status = ReservationStatus::Approved;
        approved.version = 2;
        let events = vec![
            Event::ReservationInserted(r),
            Event::ReservationUpdated(approved),
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
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let event = Event::ReservationInserted(booking(23, 26));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[42u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::ScheduleEventDeleted {
            id: Ulid::new(),
            date: BusinessDate::parse("2025-01-25").unwrap(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&good).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let mut r = booking(10, 12);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Event::ReservationInserted(r.clone())).unwrap();
            for v in 2..20 {
                r.version = v;
                wal.append(&Event::ReservationUpdated(r.clone())).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 19);
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::ReservationInserted(r.clone())];
        let tail = Event::ReservationInserted(booking(14, 16));
        {
            let mut wal = Wal::open(&path).unwrap();
            Wal::write_compact_file(wal.path(), &snapshot).unwrap();
            wal.swap_compact_file().unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&tail).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), tail]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_invisible_until_flushed() {
        let path = tmp_path("buffered.wal");
        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..3 {
            wal.append_buffered(&Event::ReservationInserted(booking(8, 9))).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 0);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 3);
        let _ = fs::remove_file(&path);
    }
}
