// src/objects.rs
//
// Persistent object-name population. Names handed out for read or delete are
// guaranteed to be present in the store; deletion uses swap-with-last so the
// files never fragment.
//
// On-disk layout: fixed 18-byte records (name[16], shards u8, size u64
// big-endian) appended to segment files `<prefix>-<index>.bin`, each capped
// at 64 MiB. A JSON sidecar `<prefix>.json` records the highest segment
// index for recovery.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const RECORD_LEN: usize = 18;
pub const NAME_LEN: usize = 16;
/// Records per segment: the largest whole-record count within 64 MiB.
pub const SEGMENT_CAPACITY: usize = 3_728_270;

/// Returned by the borrow operations when no live name is available. The
/// driver counts the request as a skip rather than failing the test.
#[derive(Debug, Clone, Copy)]
pub struct EmptyPopulation;

impl std::fmt::Display for EmptyPopulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("object population is empty")
    }
}

impl std::error::Error for EmptyPopulation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    pub name: [u8; NAME_LEN],
    pub shards: u8,
    pub size: u64,
}

impl ObjectRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..NAME_LEN].copy_from_slice(&self.name);
        buf[NAME_LEN] = self.shards;
        buf[NAME_LEN + 1..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> ObjectRecord {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[..NAME_LEN]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[NAME_LEN + 1..]);
        ObjectRecord {
            name,
            shards: buf[NAME_LEN],
            size: u64::from_be_bytes(size),
        }
    }

    pub fn name_hex(&self) -> String {
        hex::encode(self.name)
    }
}

/// Generates a fresh 16-byte object name, rendered as 32 hex chars.
pub fn random_name() -> String {
    let mut name = [0u8; NAME_LEN];
    rand::rng().fill(&mut name);
    hex::encode(name)
}

fn parse_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let bytes = hex::decode(name)
        .with_context(|| format!("object name is not hex [{}]", name))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("object name must be {} bytes [{}]", NAME_LEN, name))
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    prefix: String,
    current_max: u32,
}

#[derive(Default)]
struct State {
    /// records mirrored per segment; only the final segment may be non-full
    segments: Vec<Vec<ObjectRecord>>,
    index: HashMap<[u8; NAME_LEN], (u32, u32)>,
    reading: HashMap<[u8; NAME_LEN], u32>,
    deleting: HashSet<[u8; NAME_LEN]>,
}

impl State {
    fn live(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    fn locate(&self, flat: u64) -> (u32, u32) {
        let mut remaining = flat;
        for (seg, records) in self.segments.iter().enumerate() {
            if remaining < records.len() as u64 {
                return (seg as u32, remaining as u32);
            }
            remaining -= records.len() as u64;
        }
        (0, 0)
    }
}

pub struct ObjectManager {
    dir: PathBuf,
    prefix: String,
    state: Mutex<State>,
}

impl ObjectManager {
    /// Loads the population from `dir`, truncating any torn trailing record.
    pub fn load(dir: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create object store dir {}", dir.display()))?;

        let sidecar_max = read_sidecar(&dir, prefix)?;
        let mut state = State::default();
        let mut seg = 0u32;
        loop {
            let path = segment_path(&dir, prefix, seg);
            if !path.exists() {
                match sidecar_max {
                    Some(max) if seg <= max => {
                        warn!("segment {} missing, sidecar recorded max {}", seg, max);
                        break;
                    }
                    _ => break,
                }
            }
            let records = load_segment(&path)?;
            for (slot, record) in records.iter().enumerate() {
                state.index.insert(record.name, (seg, slot as u32));
            }
            state.segments.push(records);
            seg += 1;
        }
        let total = state.live();
        info!(
            "object population loaded: {} objects in {} segment(s) under {}",
            total,
            state.segments.len(),
            dir.display()
        );
        Ok(ObjectManager {
            dir,
            prefix: prefix.to_string(),
            state: Mutex::new(state),
        })
    }

    /// Count of records currently in the population, borrowed or not.
    pub fn objects(&self) -> u64 {
        self.state.lock().expect("object manager lock poisoned").live()
    }

    /// Appends a write-completed object. Durable (flushed) before it becomes
    /// selectable.
    pub fn add(&self, name: &str, shards: u8, size: u64) -> Result<()> {
        let name = parse_name(name)?;
        let mut state = self.state.lock().expect("object manager lock poisoned");
        if state.index.contains_key(&name) {
            bail!("duplicate object name [{}]", hex::encode(name));
        }
        let seg = match state.segments.last() {
            Some(records) if records.len() < SEGMENT_CAPACITY => state.segments.len() - 1,
            _ => state.segments.len(),
        };
        let record = ObjectRecord { name, shards, size };
        let path = segment_path(&self.dir, &self.prefix, seg as u32);
        append_record(&path, &record)
            .with_context(|| format!("failed to append to segment {}", path.display()))?;

        // the disk write succeeded; only now grow the in-memory view
        if seg == state.segments.len() {
            state.segments.push(Vec::new());
        }
        let slot = state.segments[seg].len() as u32;
        state.segments[seg].push(record);
        state.index.insert(name, (seg as u32, slot));
        Ok(())
    }

    /// Borrows a name for a read-style request. Many readers may hold the
    /// same name; names in the deleting state are not handed out.
    pub fn get_name_for_read(&self) -> Result<String> {
        let mut state = self.state.lock().expect("object manager lock poisoned");
        let name = pick_live(&state)?;
        *state.reading.entry(name).or_insert(0) += 1;
        Ok(hex::encode(name))
    }

    /// Exclusively borrows a name for deletion. The name stops being handed
    /// out to new readers and other deleters until released.
    pub fn get_name_for_delete(&self) -> Result<String> {
        let mut state = self.state.lock().expect("object manager lock poisoned");
        let name = pick_live(&state)?;
        state.deleting.insert(name);
        Ok(hex::encode(name))
    }

    pub fn release_read(&self, name: &str) -> Result<()> {
        let name = parse_name(name)?;
        let mut state = self.state.lock().expect("object manager lock poisoned");
        match state.reading.get_mut(&name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.reading.remove(&name);
            }
            None => debug!("read release for unborrowed name [{}]", hex::encode(name)),
        }
        Ok(())
    }

    /// Returns a delete borrow. On a committed delete the record is removed
    /// by swapping with the final record of the final segment and truncating.
    pub fn release_delete(&self, name: &str, committed: bool) -> Result<()> {
        let name = parse_name(name)?;
        let mut state = self.state.lock().expect("object manager lock poisoned");
        if !state.deleting.remove(&name) {
            debug!("delete release for unborrowed name [{}]", hex::encode(name));
        }
        if !committed {
            return Ok(());
        }
        let (vseg, vslot) = match state.index.get(&name) {
            Some(pos) => *pos,
            None => {
                warn!("committed delete for unknown name [{}]", hex::encode(name));
                return Ok(());
            }
        };
        self.remove_record(&mut state, vseg, vslot)
    }

    fn remove_record(&self, state: &mut State, vseg: u32, vslot: u32) -> Result<()> {
        let last_seg = state.segments.len() - 1;
        let last_slot = state.segments[last_seg].len() - 1;
        let last = state.segments[last_seg][last_slot];
        let victim = state.segments[vseg as usize][vslot as usize];

        let is_last = vseg as usize == last_seg && vslot as usize == last_slot;
        if !is_last {
            let path = segment_path(&self.dir, &self.prefix, vseg);
            overwrite_record(&path, vslot as u64, &last)
                .with_context(|| format!("failed to overwrite slot in {}", path.display()))?;
        }
        let last_path = segment_path(&self.dir, &self.prefix, last_seg as u32);
        truncate_last(&last_path, last_slot as u64)
            .with_context(|| format!("failed to truncate {}", last_path.display()))?;

        // disk is consistent; now mirror in memory
        state.segments[last_seg].pop();
        state.index.remove(&victim.name);
        if !is_last {
            state.segments[vseg as usize][vslot as usize] = last;
            state.index.insert(last.name, (vseg, vslot));
        }
        if state.segments[last_seg].is_empty() && last_seg > 0 {
            state.segments.pop();
            if let Err(e) = std::fs::remove_file(&last_path) {
                warn!("failed to remove empty segment {}: {}", last_path.display(), e);
            }
        }
        Ok(())
    }

    /// Persists the sidecar. Called once at test shutdown.
    pub fn test_complete(&self) -> Result<()> {
        let state = self.state.lock().expect("object manager lock poisoned");
        let current_max = state.segments.len().saturating_sub(1) as u32;
        let sidecar = Sidecar {
            prefix: self.prefix.clone(),
            current_max,
        };
        let path = self.dir.join(format!("{}.json", self.prefix));
        let json = serde_json::to_string_pretty(&sidecar)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write sidecar {}", path.display()))?;
        info!("object population saved: {} objects", state.live());
        Ok(())
    }
}

fn pick_live(state: &State) -> Result<[u8; NAME_LEN], anyhow::Error> {
    let total = state.live();
    if total == 0 || state.deleting.len() as u64 >= total {
        return Err(anyhow::Error::new(EmptyPopulation));
    }
    let mut rng = rand::rng();
    for _ in 0..16 {
        let (seg, slot) = state.locate(rng.random_range(0..total));
        let name = state.segments[seg as usize][slot as usize].name;
        if !state.deleting.contains(&name) {
            return Ok(name);
        }
    }
    // dense deleting state: scan from a random offset
    let start = rng.random_range(0..total);
    for i in 0..total {
        let (seg, slot) = state.locate((start + i) % total);
        let name = state.segments[seg as usize][slot as usize].name;
        if !state.deleting.contains(&name) {
            return Ok(name);
        }
    }
    Err(anyhow::Error::new(EmptyPopulation))
}

fn segment_path(dir: &Path, prefix: &str, seg: u32) -> PathBuf {
    dir.join(format!("{}-{}.bin", prefix, seg))
}

fn read_sidecar(dir: &Path, prefix: &str) -> Result<Option<u32>> {
    let path = dir.join(format!("{}.json", prefix));
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read sidecar {}", path.display()))?;
    let sidecar: Sidecar = serde_json::from_str(&json)
        .with_context(|| format!("malformed sidecar {}", path.display()))?;
    Ok(Some(sidecar.current_max))
}

fn load_segment(path: &Path) -> Result<Vec<ObjectRecord>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata()?.len();
    let torn = len % RECORD_LEN as u64;
    let intact = len - torn;
    if torn != 0 {
        warn!(
            "segment {} has {} trailing bytes of a torn record, truncating",
            path.display(),
            torn
        );
        drop(file);
        let f = OpenOptions::new().write(true).open(path)?;
        f.set_len(intact)?;
        file = File::open(path)?;
    }
    let mut records = Vec::with_capacity((intact / RECORD_LEN as u64) as usize);
    let mut buf = [0u8; RECORD_LEN];
    for _ in 0..intact / RECORD_LEN as u64 {
        file.read_exact(&mut buf)?;
        records.push(ObjectRecord::decode(&buf));
    }
    Ok(records)
}

fn append_record(path: &Path, record: &ObjectRecord) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&record.encode())?;
    file.flush()?;
    Ok(())
}

fn overwrite_record(path: &Path, slot: u64, record: &ObjectRecord) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(slot * RECORD_LEN as u64))?;
    file.write_all(&record.encode())?;
    file.flush()?;
    Ok(())
}

fn truncate_last(path: &Path, remaining_records: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(remaining_records * RECORD_LEN as u64)?;
    Ok(())
}
