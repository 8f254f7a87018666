pub mod chunking;
pub mod myers;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::topology::myers::DiffOp;

/// Pairs up to this combined size are diffed byte-exactly.
const MYERS_MAX_TOTAL: usize = 512 * 1024;
/// Pairs up to this combined size fall back to content-defined chunking.
const CHUNKING_MAX_TOTAL: usize = 20 * 1024 * 1024;
/// Same-sign regions closer than this are merged.
const COALESCE_GAP: f32 = 0.05;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub const ZERO_ROOT: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSign {
    Unchanged,
    Increase,
    Decrease,
}

impl DeltaSign {
    pub fn as_byte(&self) -> u8 {
        match self {
            DeltaSign::Unchanged => 0,
            DeltaSign::Increase => 1,
            DeltaSign::Decrease => 2,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeltaSign::Unchanged),
            1 => Some(DeltaSign::Increase),
            2 => Some(DeltaSign::Decrease),
            _ => None,
        }
    }
}

/// Where in the document an edit happened and how large it was. Positions
/// are fractions of the previous content length; no content bytes ever
/// cross this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRegion {
    pub start_pct: f32,
    pub end_pct: f32,
    pub delta_sign: DeltaSign,
    pub byte_count: i32,
}

/// Compute privacy-preserving edit regions between two content versions.
/// Deterministic for a given input pair; the strategy depends only on the
/// combined size.
pub fn extract_topology(prev: &[u8], curr: &[u8]) -> Vec<EditRegion> {
    if prev.is_empty() && curr.is_empty() {
        return Vec::new();
    }
    if prev.is_empty() {
        return vec![EditRegion {
            start_pct: 0.0,
            end_pct: 1.0,
            delta_sign: DeltaSign::Increase,
            byte_count: saturating_count(curr.len()),
        }];
    }
    if curr.is_empty() {
        return vec![EditRegion {
            start_pct: 0.0,
            end_pct: 1.0,
            delta_sign: DeltaSign::Decrease,
            byte_count: saturating_count(prev.len()),
        }];
    }

    let total = prev.len() + curr.len();
    let ops = if total <= MYERS_MAX_TOTAL {
        myers::diff(prev, curr)
    } else if total <= CHUNKING_MAX_TOTAL {
        chunking::diff(prev, curr)
    } else {
        return Vec::new();
    };

    let regions = ops_to_regions(&ops, prev.len());
    coalesce_regions(regions)
}

/// Variant of [`extract_topology`] where the previous version survives
/// only as a cached chunk list. Used when the shadow holds chunk digests
/// instead of raw bytes.
pub fn extract_topology_from_chunks(
    prev_chunks: &[chunking::Chunk],
    prev_len: usize,
    curr: &[u8],
) -> Vec<EditRegion> {
    if prev_len == 0 && curr.is_empty() {
        return Vec::new();
    }
    if prev_len == 0 {
        return vec![EditRegion {
            start_pct: 0.0,
            end_pct: 1.0,
            delta_sign: DeltaSign::Increase,
            byte_count: saturating_count(curr.len()),
        }];
    }
    if curr.is_empty() {
        return vec![EditRegion {
            start_pct: 0.0,
            end_pct: 1.0,
            delta_sign: DeltaSign::Decrease,
            byte_count: saturating_count(prev_len),
        }];
    }

    if prev_len + curr.len() > CHUNKING_MAX_TOTAL {
        return Vec::new();
    }

    let ops = chunking::diff_chunks(prev_chunks, prev_len, curr);
    coalesce_regions(ops_to_regions(&ops, prev_len))
}

fn saturating_count(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn pct(pos: usize, prev_len: usize) -> f32 {
    (pos as f64 / prev_len as f64).clamp(0.0, 1.0) as f32
}

fn ops_to_regions(ops: &[DiffOp], prev_len: usize) -> Vec<EditRegion> {
    let mut regions = Vec::new();
    let mut i = 0;

    while i < ops.len() {
        match ops[i] {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete { old_pos, len, .. } => {
                // A delete immediately followed by an insert at the same
                // position is a replacement.
                if let Some(DiffOp::Insert {
                    old_pos: ins_pos,
                    len: ins_len,
                    ..
                }) = ops.get(i + 1).copied()
                {
                    if ins_pos == old_pos + len {
                        regions.push(EditRegion {
                            start_pct: pct(old_pos, prev_len),
                            end_pct: pct(old_pos + len, prev_len),
                            delta_sign: DeltaSign::Unchanged,
                            byte_count: saturating_count(len + ins_len),
                        });
                        i += 2;
                        continue;
                    }
                }
                regions.push(EditRegion {
                    start_pct: pct(old_pos, prev_len),
                    end_pct: pct(old_pos + len, prev_len),
                    delta_sign: DeltaSign::Decrease,
                    byte_count: saturating_count(len),
                });
            }
            DiffOp::Insert { old_pos, len, .. } => {
                if let Some(DiffOp::Delete {
                    old_pos: del_pos,
                    len: del_len,
                    ..
                }) = ops.get(i + 1).copied()
                {
                    if del_pos == old_pos {
                        regions.push(EditRegion {
                            start_pct: pct(del_pos, prev_len),
                            end_pct: pct(del_pos + del_len, prev_len),
                            delta_sign: DeltaSign::Unchanged,
                            byte_count: saturating_count(len + del_len),
                        });
                        i += 2;
                        continue;
                    }
                }
                let at = pct(old_pos, prev_len);
                regions.push(EditRegion {
                    start_pct: at,
                    end_pct: at,
                    delta_sign: DeltaSign::Increase,
                    byte_count: saturating_count(len),
                });
            }
        }
        i += 1;
    }

    regions
}

fn coalesce_regions(mut regions: Vec<EditRegion>) -> Vec<EditRegion> {
    if regions.len() < 2 {
        return regions;
    }

    regions.sort_by(|a, b| {
        a.start_pct
            .partial_cmp(&b.start_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut merged: Vec<EditRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        if let Some(last) = merged.last_mut() {
            if last.delta_sign == region.delta_sign
                && region.start_pct - last.end_pct < COALESCE_GAP
            {
                last.end_pct = last.end_pct.max(region.end_pct);
                last.byte_count = last.byte_count.saturating_add(region.byte_count);
                continue;
            }
        }
        merged.push(region);
    }
    merged
}

/// Merkle root over per-region leaf hashes. Odd levels pad with the zero
/// hash; the empty region list is the zero root.
pub fn regions_root(regions: &[EditRegion]) -> [u8; 32] {
    if regions.is_empty() {
        return ZERO_ROOT;
    }

    let mut level: Vec<[u8; 32]> = regions.iter().map(leaf_hash).collect();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(ZERO_ROOT);
        }
        level = level
            .chunks(2)
            .map(|pair| node_hash(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}

fn leaf_hash(region: &EditRegion) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(region.start_pct.to_bits().to_be_bytes());
    hasher.update(region.end_pct.to_bits().to_be_bytes());
    hasher.update([region.delta_sign.as_byte()]);
    hasher.update(region.byte_count.to_be_bytes());
    hasher.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
