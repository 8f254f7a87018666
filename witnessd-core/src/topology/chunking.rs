//! Content-defined chunking for content pairs too large to diff
//! byte-exactly.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::topology::myers::DiffOp;

pub const TARGET_CHUNK_SIZE: usize = 4 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;
/// Boundary condition; with 12 mask bits the expected chunk size tracks
/// the 4 KiB target.
const BOUNDARY_MASK: u64 = 0xFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: i64,
    pub length: i64,
    pub hash: [u8; 32],
}

/// Per-byte gear table, derived once from a fixed domain string so chunk
/// boundaries are stable across runs and machines.
fn gear_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u64; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let digest = Sha256::digest(format!("witnessd-gear-{i}").as_bytes());
            *slot = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        }
        table
    })
}

/// Split `data` into content-defined chunks with contiguous coverage.
pub fn chunk_bytes(data: &[u8]) -> Vec<Chunk> {
    let gear = gear_table();
    let mut chunks = Vec::new();

    let mut start = 0usize;
    let mut hash = 0u64;

    for (i, &byte) in data.iter().enumerate() {
        hash = (hash << 1).wrapping_add(gear[byte as usize]);
        let len = i + 1 - start;

        if (len >= MIN_CHUNK_SIZE && hash & BOUNDARY_MASK == 0) || len >= MAX_CHUNK_SIZE {
            chunks.push(make_chunk(data, start, len));
            start = i + 1;
            hash = 0;
        }
    }

    if start < data.len() {
        chunks.push(make_chunk(data, start, data.len() - start));
    }

    chunks
}

fn make_chunk(data: &[u8], start: usize, len: usize) -> Chunk {
    Chunk {
        offset: start as i64,
        length: len as i64,
        hash: Sha256::digest(&data[start..start + len]).into(),
    }
}

/// Chunk-level diff: chunks present only in the previous content become
/// deletions at their offset; chunks present only in the current content
/// become insertions at their relative position in the previous
/// coordinate space.
pub fn diff(prev: &[u8], curr: &[u8]) -> Vec<DiffOp> {
    diff_chunks(&chunk_bytes(prev), prev.len(), curr)
}

/// Same as [`diff`] but against a pre-chunked previous version, so a
/// cached chunk list can stand in for content that is no longer held.
pub fn diff_chunks(prev_chunks: &[Chunk], prev_len: usize, curr: &[u8]) -> Vec<DiffOp> {
    let curr_chunks = chunk_bytes(curr);

    let mut prev_counts: HashMap<[u8; 32], usize> = HashMap::new();
    for chunk in prev_chunks {
        *prev_counts.entry(chunk.hash).or_default() += 1;
    }
    let mut curr_counts: HashMap<[u8; 32], usize> = HashMap::new();
    for chunk in &curr_chunks {
        *curr_counts.entry(chunk.hash).or_default() += 1;
    }

    let mut ops = Vec::new();

    for chunk in prev_chunks {
        let in_curr = curr_counts.get_mut(&chunk.hash);
        match in_curr {
            Some(count) if *count > 0 => *count -= 1,
            _ => ops.push(DiffOp::Delete {
                old_pos: chunk.offset as usize,
                new_pos: 0,
                len: chunk.length as usize,
            }),
        }
    }

    for chunk in &curr_chunks {
        let in_prev = prev_counts.get_mut(&chunk.hash);
        match in_prev {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                let old_pos = if curr.is_empty() {
                    0
                } else {
                    (chunk.offset as f64 / curr.len() as f64 * prev_len as f64) as usize
                };
                ops.push(DiffOp::Insert {
                    old_pos,
                    new_pos: chunk.offset as usize,
                    len: chunk.length as usize,
                });
            }
        }
    }

    ops
}
