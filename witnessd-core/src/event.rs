use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::topology::{DeltaSign, EditRegion};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event: truncated data")]
    Truncated,
    #[error("event: invalid delta sign {0}")]
    InvalidDeltaSign(u8),
    #[error("event: invalid path encoding")]
    InvalidPath,
}

/// One committed checkpoint of a tracked file. Events reference their
/// predecessor by hash value only; the chain is materialized by iterating
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub device_id: [u8; 16],
    pub timestamp_ns: i64,
    pub file_path: String,
    pub content_hash: [u8; 32],
    pub file_size: i64,
    pub size_delta: i32,
    pub context_msg: Option<String>,
    pub vdf_input: [u8; 32],
    pub vdf_output: [u8; 32],
    pub vdf_iterations: u64,
    pub regions_root: [u8; 32],
    pub regions: Vec<EditRegion>,
    pub previous_hash: [u8; 32],
    pub event_hash: [u8; 32],
}

impl Event {
    pub fn compute_hash(&self) -> [u8; 32] {
        crypto::compute_event_hash(
            &self.device_id,
            self.timestamp_ns,
            &self.file_path,
            &self.content_hash,
            self.file_size,
            self.size_delta,
            &self.vdf_input,
            &self.vdf_output,
            self.vdf_iterations,
            &self.regions_root,
            &self.previous_hash,
        )
    }

    /// Deterministic binary encoding. Doubles as the canonical form the
    /// store HMACs, so every persisted byte is covered.
    pub fn encode(&self) -> Vec<u8> {
        let path = self.file_path.as_bytes();
        let msg = self.context_msg.as_deref().unwrap_or("").as_bytes();

        let mut buf = Vec::with_capacity(16 + 8 + 4 + path.len() + 32 + 8 + 4 + 200);
        buf.extend_from_slice(&self.device_id);
        buf.extend_from_slice(&self.timestamp_ns.to_be_bytes());
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&self.content_hash);
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.size_delta.to_be_bytes());

        buf.push(u8::from(self.context_msg.is_some()));
        buf.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        buf.extend_from_slice(msg);

        buf.extend_from_slice(&self.vdf_input);
        buf.extend_from_slice(&self.vdf_output);
        buf.extend_from_slice(&self.vdf_iterations.to_be_bytes());

        buf.extend_from_slice(&self.regions_root);
        buf.extend_from_slice(&encode_regions(&self.regions));

        buf.extend_from_slice(&self.previous_hash);
        buf.extend_from_slice(&self.event_hash);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, EventError> {
        let mut r = Reader { data, at: 0 };

        let device_id: [u8; 16] = r.bytes(16)?.try_into().unwrap();
        let timestamp_ns = r.i64()?;
        let path_len = r.u32()? as usize;
        let file_path = String::from_utf8(r.bytes(path_len)?.to_vec())
            .map_err(|_| EventError::InvalidPath)?;
        let content_hash = r.hash()?;
        let file_size = r.i64()?;
        let size_delta = r.i32()?;

        let has_msg = r.u8()? != 0;
        let msg_len = r.u32()? as usize;
        let msg = String::from_utf8(r.bytes(msg_len)?.to_vec())
            .map_err(|_| EventError::InvalidPath)?;
        let context_msg = has_msg.then_some(msg);

        let vdf_input = r.hash()?;
        let vdf_output = r.hash()?;
        let vdf_iterations = r.u64()?;

        let regions_root = r.hash()?;
        let regions = decode_regions_reader(&mut r)?;

        let previous_hash = r.hash()?;
        let event_hash = r.hash()?;

        Ok(Self {
            device_id,
            timestamp_ns,
            file_path,
            content_hash,
            file_size,
            size_delta,
            context_msg,
            vdf_input,
            vdf_output,
            vdf_iterations,
            regions_root,
            regions,
            previous_hash,
            event_hash,
        })
    }
}

pub fn encode_regions(regions: &[EditRegion]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + regions.len() * 13);
    buf.extend_from_slice(&(regions.len() as u32).to_be_bytes());
    for region in regions {
        buf.extend_from_slice(&region.start_pct.to_bits().to_be_bytes());
        buf.extend_from_slice(&region.end_pct.to_bits().to_be_bytes());
        buf.push(region.delta_sign.as_byte());
        buf.extend_from_slice(&region.byte_count.to_be_bytes());
    }
    buf
}

pub fn decode_regions(data: &[u8]) -> Result<Vec<EditRegion>, EventError> {
    let mut r = Reader { data, at: 0 };
    decode_regions_reader(&mut r)
}

fn decode_regions_reader(r: &mut Reader) -> Result<Vec<EditRegion>, EventError> {
    let count = r.u32()? as usize;
    let mut regions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let start_pct = f32::from_bits(r.u32()?);
        let end_pct = f32::from_bits(r.u32()?);
        let sign_byte = r.u8()?;
        let delta_sign =
            DeltaSign::from_byte(sign_byte).ok_or(EventError::InvalidDeltaSign(sign_byte))?;
        let byte_count = r.i32()?;
        regions.push(EditRegion {
            start_pct,
            end_pct,
            delta_sign,
            byte_count,
        });
    }
    Ok(regions)
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], EventError> {
        if self.data.len() < self.at + len {
            return Err(EventError::Truncated);
        }
        let out = &self.data[self.at..self.at + len];
        self.at += len;
        Ok(out)
    }

    fn hash(&mut self) -> Result<[u8; 32], EventError> {
        Ok(self.bytes(32)?.try_into().unwrap())
    }

    fn u8(&mut self) -> Result<u8, EventError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EventError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, EventError> {
        Ok(i32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, EventError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, EventError> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}
