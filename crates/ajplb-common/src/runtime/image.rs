//! Fixed-layout runtime image.
//!
//! [`ImageStore`] keeps the shared records in one contiguous byte image
//! that can be written to a file and loaded again after a restart:
//!
//! ```text
//! offset 0    header (64 bytes): "AJPS", version u16, slots u16, slot size u16
//! offset 64   slot 0 (512 bytes)
//! offset 576  slot 1
//! ...
//! ```
//!
//! Each slot holds one record encoded with [`MessageBuffer`]: the header
//! tag names the record kind (0 marks a free slot) and the body carries
//! the fields in a fixed order. Slots are 64-byte aligned.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use super::shared::{BalancerRecord, MemberRecord, Record, SharedStore, StoreGuard, WorkerRecord};
use crate::protocol::error::{AjpError, Result};
use crate::protocol::message::MessageBuffer;
use crate::states::{Activation, LbMethod, LockMode, MemberState, WorkerState};

pub const IMAGE_MAGIC: &[u8; 4] = b"AJPS";
pub const IMAGE_VERSION: u16 = 1;
pub const IMAGE_ALIGN: usize = 64;
pub const IMAGE_HEADER_SIZE: usize = 64;
pub const MAX_RECORDS: usize = 64;
pub const SLOT_SIZE: usize = 512;

const KIND_WORKER: u16 = 1;
const KIND_MEMBER: u16 = 2;
const KIND_BALANCER: u16 = 3;

/// Total size of an image in bytes.
pub const fn image_size() -> usize {
    IMAGE_HEADER_SIZE + MAX_RECORDS * SLOT_SIZE
}

struct Image {
    bytes: Vec<u8>,
    index: HashMap<(u16, String), usize>,
}

impl Image {
    fn slot(&self, i: usize) -> &[u8] {
        let start = IMAGE_HEADER_SIZE + i * SLOT_SIZE;
        &self.bytes[start..start + SLOT_SIZE]
    }

    fn slot_mut(&mut self, i: usize) -> &mut [u8] {
        let start = IMAGE_HEADER_SIZE + i * SLOT_SIZE;
        &mut self.bytes[start..start + SLOT_SIZE]
    }

    fn sequence_at(&self, i: usize) -> u64 {
        match read_slot(self.slot(i)) {
            Ok(Some(Record::Worker(r))) => r.sequence,
            Ok(Some(Record::Member(r))) => r.sequence,
            Ok(Some(Record::Balancer(r))) => r.sequence,
            _ => 0,
        }
    }

    /// Writes `msg` into the slot for `key`, allocating one if needed.
    fn store(&mut self, key: (u16, String), msg: &MessageBuffer) -> Result<()> {
        let slot = match self.index.get(&key) {
            Some(slot) => *slot,
            None => {
                let slot = self.index.len();
                if slot >= MAX_RECORDS {
                    return Err(AjpError::Capacity {
                        required: slot + 1,
                        capacity: MAX_RECORDS,
                    });
                }
                self.index.insert(key, slot);
                slot
            }
        };
        let dst = self.slot_mut(slot);
        dst.fill(0);
        dst[..msg.len()].copy_from_slice(msg.as_bytes());
        Ok(())
    }
}

/// [`SharedStore`] backed by a fixed-layout byte image.
pub struct ImageStore {
    coarse: Mutex<()>,
    image: Mutex<Image>,
}

impl ImageStore {
    /// Creates an empty image.
    pub fn new() -> Self {
        let mut bytes = vec![0u8; image_size()];
        bytes[0..4].copy_from_slice(IMAGE_MAGIC);
        bytes[4..6].copy_from_slice(&IMAGE_VERSION.to_be_bytes());
        bytes[6..8].copy_from_slice(&(MAX_RECORDS as u16).to_be_bytes());
        bytes[8..10].copy_from_slice(&(SLOT_SIZE as u16).to_be_bytes());
        Self {
            coarse: Mutex::new(()),
            image: Mutex::new(Image {
                bytes,
                index: HashMap::new(),
            }),
        }
    }

    /// Adopts an existing image after validating its header and slots.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != image_size() {
            return Err(AjpError::Framing(format!(
                "runtime image is {} bytes, expected {}",
                bytes.len(),
                image_size()
            )));
        }
        if &bytes[0..4] != IMAGE_MAGIC {
            return Err(AjpError::Framing("runtime image has bad magic".into()));
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != IMAGE_VERSION {
            return Err(AjpError::Framing(format!(
                "runtime image version {} is not supported",
                version
            )));
        }
        let mut image = Image {
            bytes,
            index: HashMap::new(),
        };
        for slot in 0..MAX_RECORDS {
            match read_slot(image.slot(slot))? {
                Some(record) => {
                    image.index.insert(record_key(&record), slot);
                }
                None => break,
            }
        }
        Ok(Self {
            coarse: Mutex::new(()),
            image: Mutex::new(image),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes();
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.image().bytes.clone()
    }

    fn image(&self) -> MutexGuard<'_, Image> {
        self.image.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pull(&self, key: (u16, String)) -> Option<Record> {
        let image = self.image();
        let slot = *image.index.get(&key)?;
        match read_slot(image.slot(slot)) {
            Ok(record) => record,
            Err(e) => {
                warn!(kind = key.0, name = %key.1, error = %e, "corrupt runtime image slot");
                None
            }
        }
    }

    fn push(&self, key: (u16, String), incoming: u64, encode: impl Fn(&mut MessageBuffer, u64) -> Result<()>) -> u64 {
        let mut image = self.image();
        let stored = image.index.get(&key).map(|slot| image.sequence_at(*slot));
        let seq = stored.unwrap_or(0).max(incoming) + 1;
        let mut msg = MessageBuffer::new(SLOT_SIZE);
        let result = encode(&mut msg, seq).and_then(|_| {
            msg.seal(key.0);
            image.store(key.clone(), &msg)
        });
        match result {
            Ok(()) => seq,
            Err(e) => {
                warn!(kind = key.0, name = %key.1, error = %e, "runtime record not stored");
                incoming
            }
        }
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for ImageStore {
    fn lock(&self) -> StoreGuard<'_> {
        StoreGuard::acquire(&self.coarse)
    }

    fn pull_worker(&self, name: &str) -> Option<WorkerRecord> {
        match self.pull((KIND_WORKER, name.to_string()))? {
            Record::Worker(r) => Some(r),
            _ => None,
        }
    }

    fn push_worker(&self, record: &WorkerRecord) -> u64 {
        self.push((KIND_WORKER, record.name.clone()), record.sequence, |msg, seq| {
            encode_worker(msg, record, seq)
        })
    }

    fn pull_member(&self, balancer: &str, member: &str) -> Option<MemberRecord> {
        match self.pull((KIND_MEMBER, format!("{}/{}", balancer, member)))? {
            Record::Member(r) => Some(r),
            _ => None,
        }
    }

    fn push_member(&self, record: &MemberRecord) -> u64 {
        let key = (KIND_MEMBER, format!("{}/{}", record.balancer, record.name));
        self.push(key, record.sequence, |msg, seq| encode_member(msg, record, seq))
    }

    fn pull_balancer(&self, name: &str) -> Option<BalancerRecord> {
        match self.pull((KIND_BALANCER, name.to_string()))? {
            Record::Balancer(r) => Some(r),
            _ => None,
        }
    }

    fn push_balancer(&self, record: &BalancerRecord) -> u64 {
        self.push((KIND_BALANCER, record.name.clone()), record.sequence, |msg, seq| {
            encode_balancer(msg, record, seq)
        })
    }

    fn records(&self) -> Vec<Record> {
        let image = self.image();
        let mut slots: Vec<usize> = image.index.values().copied().collect();
        slots.sort_unstable();
        slots
            .into_iter()
            .filter_map(|slot| read_slot(image.slot(slot)).ok().flatten())
            .collect()
    }
}

fn record_key(record: &Record) -> (u16, String) {
    match record {
        Record::Worker(r) => (KIND_WORKER, r.name.clone()),
        Record::Member(r) => (KIND_MEMBER, format!("{}/{}", r.balancer, r.name)),
        Record::Balancer(r) => (KIND_BALANCER, r.name.clone()),
    }
}

fn append_u64(msg: &mut MessageBuffer, v: u64) -> Result<()> {
    msg.append_u32((v >> 32) as u32)?;
    msg.append_u32(v as u32)
}

fn read_u64(msg: &mut MessageBuffer) -> Result<u64> {
    let hi = msg.read_u32()? as u64;
    let lo = msg.read_u32()? as u64;
    Ok((hi << 32) | lo)
}

fn read_str(msg: &mut MessageBuffer) -> Result<String> {
    Ok(msg.read_string()?.unwrap_or_default())
}

fn encode_worker(msg: &mut MessageBuffer, r: &WorkerRecord, seq: u64) -> Result<()> {
    msg.append_str(&r.name)?;
    msg.append_str(&r.host)?;
    msg.append_u16(r.port)?;
    msg.append_u32(r.addr_sequence)?;
    msg.append_u8(r.state.code())?;
    msg.append_u32(r.busy)?;
    msg.append_u32(r.max_busy)?;
    append_u64(msg, r.error_time)?;
    append_u64(msg, r.readed)?;
    append_u64(msg, r.transferred)?;
    append_u64(msg, r.used)?;
    msg.append_u32(r.errors)?;
    msg.append_u32(r.client_errors)?;
    msg.append_u32(r.reply_timeouts)?;
    append_u64(msg, r.last_reset)?;
    append_u64(msg, r.last_maintain)?;
    append_u64(msg, seq)
}

fn decode_worker(msg: &mut MessageBuffer) -> Result<WorkerRecord> {
    Ok(WorkerRecord {
        name: read_str(msg)?,
        host: read_str(msg)?,
        port: msg.read_u16()?,
        addr_sequence: msg.read_u32()?,
        state: WorkerState::from_code(msg.read_u8()?).unwrap_or_default(),
        busy: msg.read_u32()?,
        max_busy: msg.read_u32()?,
        error_time: read_u64(msg)?,
        readed: read_u64(msg)?,
        transferred: read_u64(msg)?,
        used: read_u64(msg)?,
        errors: msg.read_u32()?,
        client_errors: msg.read_u32()?,
        reply_timeouts: msg.read_u32()?,
        last_reset: read_u64(msg)?,
        last_maintain: read_u64(msg)?,
        sequence: read_u64(msg)?,
    })
}

fn encode_member(msg: &mut MessageBuffer, r: &MemberRecord, seq: u64) -> Result<()> {
    msg.append_str(&r.balancer)?;
    msg.append_str(&r.name)?;
    msg.append_str(&r.route)?;
    msg.append_str(&r.domain)?;
    msg.append_str(&r.redirect)?;
    msg.append_u32(r.distance)?;
    msg.append_u8(r.activation.code())?;
    msg.append_u8(r.state.code())?;
    msg.append_u32(r.lb_factor)?;
    append_u64(msg, r.lb_mult)?;
    append_u64(msg, r.lb_value)?;
    msg.append_u32(r.busy)?;
    msg.append_u32(r.max_busy)?;
    append_u64(msg, r.error_time)?;
    append_u64(msg, r.elected)?;
    msg.append_u32(r.errors)?;
    append_u64(msg, seq)
}

fn decode_member(msg: &mut MessageBuffer) -> Result<MemberRecord> {
    Ok(MemberRecord {
        balancer: read_str(msg)?,
        name: read_str(msg)?,
        route: read_str(msg)?,
        domain: read_str(msg)?,
        redirect: read_str(msg)?,
        distance: msg.read_u32()?,
        activation: Activation::from_code(msg.read_u8()?).unwrap_or_default(),
        state: MemberState::from_code(msg.read_u8()?).unwrap_or_default(),
        lb_factor: msg.read_u32()?,
        lb_mult: read_u64(msg)?,
        lb_value: read_u64(msg)?,
        busy: msg.read_u32()?,
        max_busy: msg.read_u32()?,
        error_time: read_u64(msg)?,
        elected: read_u64(msg)?,
        errors: msg.read_u32()?,
        sequence: read_u64(msg)?,
    })
}

fn encode_balancer(msg: &mut MessageBuffer, r: &BalancerRecord, seq: u64) -> Result<()> {
    msg.append_str(&r.name)?;
    msg.append_u32(r.busy)?;
    msg.append_u32(r.max_busy)?;
    msg.append_u8(r.sticky_session as u8)?;
    msg.append_u8(r.sticky_session_force as u8)?;
    msg.append_u8(r.method.code())?;
    msg.append_u8(r.lock.code())?;
    msg.append_u32(r.retries)?;
    msg.append_u32(r.retry_interval_ms)?;
    msg.append_u32(r.recover_wait_time)?;
    msg.append_u32(r.error_escalation_time)?;
    msg.append_u32(r.max_reply_timeouts)?;
    append_u64(msg, r.last_reset)?;
    append_u64(msg, r.last_maintain)?;
    append_u64(msg, seq)
}

fn decode_balancer(msg: &mut MessageBuffer) -> Result<BalancerRecord> {
    Ok(BalancerRecord {
        name: read_str(msg)?,
        busy: msg.read_u32()?,
        max_busy: msg.read_u32()?,
        sticky_session: msg.read_u8()? != 0,
        sticky_session_force: msg.read_u8()? != 0,
        method: LbMethod::from_code(msg.read_u8()?).unwrap_or_default(),
        lock: LockMode::from_code(msg.read_u8()?).unwrap_or_default(),
        retries: msg.read_u32()?,
        retry_interval_ms: msg.read_u32()?,
        recover_wait_time: msg.read_u32()?,
        error_escalation_time: msg.read_u32()?,
        max_reply_timeouts: msg.read_u32()?,
        last_reset: read_u64(msg)?,
        last_maintain: read_u64(msg)?,
        sequence: read_u64(msg)?,
    })
}

fn read_slot(slot: &[u8]) -> Result<Option<Record>> {
    let mut msg = MessageBuffer::new(SLOT_SIZE);
    msg.header_mut().copy_from_slice(&slot[..4]);
    let kind = msg.header_tag();
    if kind == 0 {
        return Ok(None);
    }
    let len = msg.accept_header(kind)?;
    msg.body_mut().copy_from_slice(&slot[4..4 + len]);
    let record = match kind {
        KIND_WORKER => Record::Worker(decode_worker(&mut msg)?),
        KIND_MEMBER => Record::Member(decode_member(&mut msg)?),
        KIND_BALANCER => Record::Balancer(decode_balancer(&mut msg)?),
        other => {
            return Err(AjpError::Framing(format!("unknown record kind {}", other)));
        }
    };
    Ok(Some(record))
}
