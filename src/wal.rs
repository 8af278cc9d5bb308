use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame overhead: u32 length prefix + u32 crc32 trailer.
const FRAME_OVERHEAD: u64 = 8;
/// Larger length prefixes can only come from garbage.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame, returning the event and its size on disk. `Ok(None)` means a
/// clean end, a torn frame, or a bad checksum: nothing after this point is trusted.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
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
    let size = FRAME_OVERHEAD + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, size)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// What survived on disk.
#[derive(Debug)]
pub struct Recovered {
    pub events: Vec<Event>,
    /// Byte offset just past the last intact frame.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Recovered {
    pub fn torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Append-only booking journal on disk.
///
/// Each entry is `[u32 len][bincode Event][u32 crc32]`. A crash mid-write leaves a
/// torn last frame; `open` cuts it off so new appends land after the last good entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Recover whatever is on disk, truncate any torn tail, and open for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let recovered = Self::recover(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovered.torn_tail() {
            tracing::warn!(
                path = %path.display(),
                kept = recovered.valid_len,
                dropped = recovered.file_len - recovered.valid_len,
                "journal has a torn tail, truncating"
            );
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: recovered.events.len() as u64,
        };
        Ok((wal, recovered.events))
    }

    /// Read every intact event from `path`. A missing file is an empty journal.
    pub fn recover(path: &Path) -> io::Result<Recovered> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Recovered {
                    events: Vec::new(),
                    valid_len: 0,
                    file_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((event, size)) = read_frame(&mut reader)? {
            valid_len += size;
            events.push(event);
        }
        Ok(Recovered {
            events,
            valid_len,
            file_len,
        })
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("compact.tmp")
    }

    /// Write a snapshot of events to a side file and fsync it.
    /// Slow; runs without blocking appends.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the journal and reopen it. Fast.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PricingRule, Property, Modifier, RuleKind, DaySet};
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn property_event(name: &str) -> Event {
        Event::PropertyCreated {
            property: Property {
                id: Ulid::new(),
                name: name.into(),
                check_in_time: None,
                check_out_time: None,
                whole_property_rate: Some(Decimal::new(45000, 2)),
            },
        }
    }

    fn rule_event() -> Event {
        Event::RuleAdded {
            rule: PricingRule {
                id: Ulid::new(),
                property_id: None,
                add_on_id: None,
                kind: RuleKind::Weekend(DaySet::WEEKEND),
                modifier: Modifier::Percentage(Decimal::from(25)),
                active: true,
            },
        }
    }

    fn append_all(path: &Path, events: &[Event]) {
        let (mut wal, _) = Wal::open(path).unwrap();
        for e in events {
            wal.append_buffered(e).unwrap();
        }
        wal.flush_sync().unwrap();
    }

    #[test]
    fn append_and_reopen() {
        let path = tmp_path("append_and_reopen.wal");
        let events = vec![property_event("corner-house"), rule_event()];
        append_all(&path, &events);

        let (wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(wal.appends_since_compact(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_journal() {
        let path = tmp_path("missing.wal");
        let recovered = Wal::recover(&path).unwrap();
        assert!(recovered.events.is_empty());
        assert!(!recovered.torn_tail());
    }

    #[test]
    fn torn_tail_is_truncated_and_appends_follow_good_data() {
        let path = tmp_path("torn_tail.wal");
        let first = property_event("first");
        append_all(&path, std::slice::from_ref(&first));
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert!(Wal::recover(&path).unwrap().torn_tail());

        // reopen truncates, then a new append must be readable
        let second = property_event("second");
        append_all(&path, std::slice::from_ref(&second));

        let recovered = Wal::recover(&path).unwrap();
        assert!(!recovered.torn_tail());
        assert_eq!(recovered.events, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_checksum_stops_recovery() {
        let path = tmp_path("bad_crc.wal");
        let good = property_event("good");
        append_all(&path, std::slice::from_ref(&good));
        {
            let payload = bincode::serialize(&rule_event()).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered.events, vec![good]);
        assert!(recovered.torn_tail());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_accepts_new_appends() {
        let path = tmp_path("compaction.wal");
        let keep = property_event("kept");
        let mut churn = vec![keep.clone()];
        for _ in 0..20 {
            churn.push(rule_event());
            churn.push(Event::RuleRemoved { id: Ulid::new() });
        }
        append_all(&path, &churn);
        let before = fs::metadata(&path).unwrap().len();

        let (mut wal, _) = Wal::open(&path).unwrap();
        Wal::write_compact_file(&path, std::slice::from_ref(&keep)).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after_event = rule_event();
        wal.append_buffered(&after_event).unwrap();
        wal.flush_sync().unwrap();
        drop(wal);

        assert!(fs::metadata(&path).unwrap().len() < before);
        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered.events, vec![keep, after_event]);
        let _ = fs::remove_file(&path);
    }
}
