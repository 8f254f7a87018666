//! Byte-level Myers diff for small content pairs.

/// Beyond this edit distance the middle section is reported as a single
/// replacement. Keeps the O(ND) search bounded on pathological pairs.
const MAX_EDIT_DISTANCE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Equal {
        len: usize,
    },
    Insert {
        old_pos: usize,
        new_pos: usize,
        len: usize,
    },
    Delete {
        old_pos: usize,
        new_pos: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Equal,
    Insert,
    Delete,
}

/// Shortest edit script between `prev` and `curr`. Common prefix and
/// suffix are peeled off before the O(ND) search; consecutive same-type
/// operations are coalesced.
pub fn diff(prev: &[u8], curr: &[u8]) -> Vec<DiffOp> {
    let mut start = 0;
    while start < prev.len() && start < curr.len() && prev[start] == curr[start] {
        start += 1;
    }

    let mut end_prev = prev.len();
    let mut end_curr = curr.len();
    while end_prev > start && end_curr > start && prev[end_prev - 1] == curr[end_curr - 1] {
        end_prev -= 1;
        end_curr -= 1;
    }

    let mid_prev = &prev[start..end_prev];
    let mid_curr = &curr[start..end_curr];

    let mut ops = Vec::new();
    if start > 0 {
        ops.push(DiffOp::Equal { len: start });
    }

    if mid_prev.is_empty() && mid_curr.is_empty() {
        // Nothing changed between prefix and suffix.
    } else if mid_prev.is_empty() {
        ops.push(DiffOp::Insert {
            old_pos: start,
            new_pos: start,
            len: mid_curr.len(),
        });
    } else if mid_curr.is_empty() {
        ops.push(DiffOp::Delete {
            old_pos: start,
            new_pos: start,
            len: mid_prev.len(),
        });
    } else {
        match shortest_edit_steps(mid_prev, mid_curr) {
            Some(steps) => ops.extend(steps_to_ops(&steps, start)),
            None => {
                // Distance cap hit: report the whole middle as replaced.
                ops.push(DiffOp::Delete {
                    old_pos: start,
                    new_pos: start,
                    len: mid_prev.len(),
                });
                ops.push(DiffOp::Insert {
                    old_pos: end_prev,
                    new_pos: start,
                    len: mid_curr.len(),
                });
            }
        }
    }

    let suffix = prev.len() - end_prev;
    if suffix > 0 {
        ops.push(DiffOp::Equal { len: suffix });
    }

    coalesce(ops)
}

/// Greedy O(ND) forward search with a full trace for backtracking.
/// Returns per-byte steps in forward order, or None past the distance cap.
fn shortest_edit_steps(a: &[u8], b: &[u8]) -> Option<Vec<Step>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let bound = ((n + m) as usize).min(MAX_EDIT_DISTANCE) as isize;

    let width = (2 * bound + 1) as usize;
    let mut v = vec![0isize; width];
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut found = false;

    'search: for d in 0..=bound {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + bound) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;

            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }

            v[idx] = x;
            if x >= n && y >= m {
                found = true;
                break 'search;
            }
            k += 2;
        }
    }

    if !found {
        return None;
    }

    // Walk the trace backwards from (n, m) collecting steps in reverse.
    let mut steps = Vec::new();
    let mut x = n;
    let mut y = m;

    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let idx = (k + bound) as usize;

        let prev_k = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + bound) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            steps.push(Step::Equal);
            x -= 1;
            y -= 1;
        }

        if d > 0 {
            if x == prev_x {
                steps.push(Step::Insert);
            } else {
                steps.push(Step::Delete);
            }
        }

        x = prev_x;
        y = prev_y;
    }

    steps.reverse();
    Some(steps)
}

/// Run-length encode per-byte steps into positioned operations.
fn steps_to_ops(steps: &[Step], offset: usize) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let mut old_pos = offset;
    let mut new_pos = offset;

    let mut i = 0;
    while i < steps.len() {
        let step = steps[i];
        let mut len = 1;
        while i + len < steps.len() && steps[i + len] == step {
            len += 1;
        }

        match step {
            Step::Equal => {
                ops.push(DiffOp::Equal { len });
                old_pos += len;
                new_pos += len;
            }
            Step::Delete => {
                ops.push(DiffOp::Delete {
                    old_pos,
                    new_pos,
                    len,
                });
                old_pos += len;
            }
            Step::Insert => {
                ops.push(DiffOp::Insert {
                    old_pos,
                    new_pos,
                    len,
                });
                new_pos += len;
            }
        }

        i += len;
    }

    ops
}

/// Merge consecutive same-type operations: inserts at an equal old
/// position with adjacent new positions, deletes at adjacent old positions
/// with an equal new position, and plain equal runs.
pub fn coalesce(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let mut merged: Vec<DiffOp> = Vec::with_capacity(ops.len());

    for op in ops {
        if let Some(last) = merged.last_mut() {
            match (*last, op) {
                (DiffOp::Equal { len: a }, DiffOp::Equal { len: b }) => {
                    *last = DiffOp::Equal { len: a + b };
                    continue;
                }
                (
                    DiffOp::Insert {
                        old_pos,
                        new_pos,
                        len: a,
                    },
                    DiffOp::Insert {
                        old_pos: o2,
                        new_pos: n2,
                        len: b,
                    },
                ) if o2 == old_pos && n2 == new_pos + a => {
                    *last = DiffOp::Insert {
                        old_pos,
                        new_pos,
                        len: a + b,
                    };
                    continue;
                }
                (
                    DiffOp::Delete {
                        old_pos,
                        new_pos,
                        len: a,
                    },
                    DiffOp::Delete {
                        old_pos: o2,
                        new_pos: n2,
                        len: b,
                    },
                ) if o2 == old_pos + a && n2 == new_pos => {
                    *last = DiffOp::Delete {
                        old_pos,
                        new_pos,
                        len: a + b,
                    };
                    continue;
                }
                _ => {}
            }
        }
        merged.push(op);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(ops: &[DiffOp], prev: &[u8], curr: &[u8]) -> Vec<u8> {
        // Reconstruct `curr` from `prev` plus the script; validates
        // positions and lengths together.
        let mut out = Vec::new();
        let mut old = 0usize;
        for op in ops {
            match *op {
                DiffOp::Equal { len } => {
                    out.extend_from_slice(&prev[old..old + len]);
                    old += len;
                }
                DiffOp::Delete { old_pos, len, .. } => {
                    assert_eq!(old_pos, old);
                    old += len;
                }
                DiffOp::Insert { new_pos, len, .. } => {
                    out.extend_from_slice(&curr[new_pos..new_pos + len]);
                }
            }
        }
        assert_eq!(old, prev.len());
        out
    }

    #[test]
    fn test_identical_inputs() {
        let ops = diff(b"same", b"same");
        assert_eq!(ops, vec![DiffOp::Equal { len: 4 }]);
    }

    #[test]
    fn test_pure_insert() {
        let ops = diff(b"ac", b"abc");
        assert_eq!(apply(&ops, b"ac", b"abc"), b"abc");
    }

    #[test]
    fn test_pure_delete() {
        let ops = diff(b"abc", b"ac");
        assert_eq!(apply(&ops, b"abc", b"ac"), b"ac");
    }

    #[test]
    fn test_middle_insert_positions() {
        let ops = diff(b"Hello World", b"Hello Beautiful World");
        let inserts: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Insert { .. }))
            .collect();
        assert_eq!(inserts.len(), 1);
        match inserts[0] {
            DiffOp::Insert { old_pos, len, .. } => {
                assert_eq!(*len, 10);
                assert_eq!(*old_pos, 6);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_reconstruction_mixed_edits() {
        let prev = b"the quick brown fox jumps over the lazy dog";
        let curr = b"the slow brown cat jumps over a lazy dog";
        let ops = diff(prev, curr);
        assert_eq!(apply(&ops, prev, curr), curr);
    }

    #[test]
    fn test_disjoint_inputs() {
        let ops = diff(b"aaaa", b"bbbb");
        assert_eq!(apply(&ops, b"aaaa", b"bbbb"), b"bbbb");
    }

    #[test]
    fn test_empty_to_content() {
        let ops = diff(b"", b"xyz");
        assert_eq!(
            ops,
            vec![DiffOp::Insert {
                old_pos: 0,
                new_pos: 0,
                len: 3
            }]
        );
    }

    #[test]
    fn test_content_to_empty() {
        let ops = diff(b"xyz", b"");
        assert_eq!(
            ops,
            vec![DiffOp::Delete {
                old_pos: 0,
                new_pos: 0,
                len: 3
            }]
        );
    }

    #[test]
    fn test_determinism() {
        let prev = b"one two three four";
        let curr = b"one 2 three 4 five";
        assert_eq!(diff(prev, curr), diff(prev, curr));
    }

    #[test]
    fn test_coalesce_merges_adjacent_runs() {
        let ops = vec![
            DiffOp::Equal { len: 2 },
            DiffOp::Equal { len: 3 },
            DiffOp::Delete {
                old_pos: 5,
                new_pos: 5,
                len: 1,
            },
            DiffOp::Delete {
                old_pos: 6,
                new_pos: 5,
                len: 2,
            },
        ];
        assert_eq!(
            coalesce(ops),
            vec![
                DiffOp::Equal { len: 5 },
                DiffOp::Delete {
                    old_pos: 5,
                    new_pos: 5,
                    len: 3
                }
            ]
        );
    }

    #[test]
    fn test_distance_cap_falls_back_to_replacement() {
        // Two incompressible-by-diff blobs beyond the cap still produce a
        // valid, deterministic script.
        let prev: Vec<u8> = (0..8192u32).flat_map(|i| i.to_be_bytes()).collect();
        let curr: Vec<u8> = (0..8192u32)
            .flat_map(|i| (i.wrapping_mul(2654435761)).to_be_bytes())
            .collect();
        let ops = diff(&prev, &curr);
        assert_eq!(apply(&ops, &prev, &curr), curr);
    }
}
