//! Line-level diff and three-way merge. Matching is patience-style: unique
//! common lines anchor the alignment, recursing between anchors, which
//! keeps merges readable on the kind of edits humans make.

use crate::error::{GitGenericError, GitResult};
use rustc_hash::FxHashMap;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConflictStyle {
    Merge,
    Diff3,
    Zdiff3,
}

impl Default for ConflictStyle {
    fn default() -> Self {
        ConflictStyle::Merge
    }
}

impl FromStr for ConflictStyle {
    type Err = GitGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(ConflictStyle::Merge),
            "diff3" => Ok(ConflictStyle::Diff3),
            "zdiff3" => Ok(ConflictStyle::Zdiff3),
            _ => bail!("unknown conflict style `{}`", s),
        }
    }
}

/// Splits into lines keeping terminators, so concatenating the slices
/// reproduces the input exactly.
pub fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = vec![];
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            lines.push(&bytes[start..=i]);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        lines.push(&bytes[start..]);
    }
    lines
}

/// Monotonically increasing pairs of equal lines between `a` and `b`.
pub fn line_matches(a: &[&[u8]], b: &[&[u8]]) -> Vec<(usize, usize)> {
    let mut out = vec![];
    patience(a, b, 0, a.len(), 0, b.len(), &mut out);
    out
}

fn patience(
    a: &[&[u8]],
    b: &[&[u8]],
    mut a0: usize,
    mut a1: usize,
    mut b0: usize,
    mut b1: usize,
    out: &mut Vec<(usize, usize)>,
) {
    // common prefix
    while a0 < a1 && b0 < b1 && a[a0] == b[b0] {
        out.push((a0, b0));
        a0 += 1;
        b0 += 1;
    }
    // common suffix, recorded after the recursion to keep `out` ordered
    let mut suffix = vec![];
    while a1 > a0 && b1 > b0 && a[a1 - 1] == b[b1 - 1] {
        suffix.push((a1 - 1, b1 - 1));
        a1 -= 1;
        b1 -= 1;
    }

    if a0 < a1 && b0 < b1 {
        // lines occurring exactly once on both sides within the window
        let mut count_a: FxHashMap<&[u8], (usize, usize)> = Default::default();
        for (i, line) in a[a0..a1].iter().enumerate() {
            let slot = count_a.entry(line).or_insert((0, a0 + i));
            slot.0 += 1;
        }
        let mut pairs: Vec<(usize, usize)> = vec![];
        let mut count_b: FxHashMap<&[u8], (usize, usize)> = Default::default();
        for (i, line) in b[b0..b1].iter().enumerate() {
            let slot = count_b.entry(line).or_insert((0, b0 + i));
            slot.0 += 1;
        }
        for (line, &(ca, ia)) in &count_a {
            if ca == 1 {
                if let Some(&(cb, ib)) = count_b.get(line) {
                    if cb == 1 {
                        pairs.push((ia, ib));
                    }
                }
            }
        }
        pairs.sort_unstable();
        let anchors = longest_increasing_by_second(&pairs);

        if !anchors.is_empty() {
            let mut prev_a = a0;
            let mut prev_b = b0;
            for &(ia, ib) in &anchors {
                patience(a, b, prev_a, ia, prev_b, ib, out);
                out.push((ia, ib));
                prev_a = ia + 1;
                prev_b = ib + 1;
            }
            patience(a, b, prev_a, a1, prev_b, b1, out);
        }
        // no unique anchors: nothing alignable in the middle
    }

    suffix.reverse();
    out.extend(suffix);
}

/// Longest chain of pairs strictly increasing in the second component (the
/// first is already sorted).
fn longest_increasing_by_second(pairs: &[(usize, usize)]) -> Vec<(usize, usize)> {
    if pairs.is_empty() {
        return vec![];
    }
    // tails[k] = index into pairs of the smallest second-component ending a
    // chain of length k+1; parents rebuild the chain
    let mut tails: Vec<usize> = vec![];
    let mut parents: Vec<Option<usize>> = vec![None; pairs.len()];
    for (i, &(_, b)) in pairs.iter().enumerate() {
        let pos = tails.partition_point(|&j| pairs[j].1 < b);
        parents[i] = if pos > 0 { Some(tails[pos - 1]) } else { None };
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }
    let mut chain = vec![];
    let mut cur = tails.last().copied();
    while let Some(i) = cur {
        chain.push(pairs[i]);
        cur = parents[i];
    }
    chain.reverse();
    chain
}

#[derive(Debug, PartialEq)]
pub struct MergeResult {
    pub bytes: Vec<u8>,
    pub conflicts: usize,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0
    }
}

/// Three-way line merge of `(base, ours, theirs)`. If any two inputs are
/// equal the third wins without any line work. Conflicting regions emit the
/// standard marker block in the requested style.
pub fn merge_blobs(
    style: ConflictStyle,
    our_label: &str,
    their_label: &str,
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
) -> MergeResult {
    if ours == theirs {
        return MergeResult { bytes: ours.to_vec(), conflicts: 0 };
    }
    if base == ours {
        return MergeResult { bytes: theirs.to_vec(), conflicts: 0 };
    }
    if base == theirs {
        return MergeResult { bytes: ours.to_vec(), conflicts: 0 };
    }

    let a = split_lines(base);
    let o = split_lines(ours);
    let t = split_lines(theirs);
    let mo: FxHashMap<usize, usize> = line_matches(&a, &o).into_iter().collect();
    let mt: FxHashMap<usize, usize> = line_matches(&a, &t).into_iter().collect();

    let mut out: Vec<u8> = vec![];
    let mut conflicts = 0;

    // cursors into base/ours/theirs
    let (mut i, mut j, mut k) = (0, 0, 0);
    loop {
        // stable position: base line i matched in both sides at the cursors
        if i < a.len() && mo.get(&i).copied() == Some(j) && mt.get(&i).copied() == Some(k) {
            out.extend_from_slice(a[i]);
            i += 1;
            j += 1;
            k += 1;
            continue;
        }
        if i >= a.len() && j >= o.len() && k >= t.len() {
            break;
        }

        // unstable region: scan forward to the next base line stable in both
        let (next_i, next_j, next_k) = next_stable(&a, &o, &t, &mo, &mt, i, j, k);
        let ours_slice = &o[j..next_j];
        let theirs_slice = &t[k..next_k];
        let base_slice = &a[i..next_i];

        let ours_changed = !slices_equal(base_slice, ours_slice);
        let theirs_changed = !slices_equal(base_slice, theirs_slice);
        if !ours_changed {
            extend(&mut out, theirs_slice);
        } else if !theirs_changed || slices_equal(ours_slice, theirs_slice) {
            extend(&mut out, ours_slice);
        } else {
            conflicts += 1;
            emit_conflict(
                &mut out,
                style,
                our_label,
                their_label,
                base_slice,
                ours_slice,
                theirs_slice,
            );
        }
        i = next_i;
        j = next_j;
        k = next_k;
    }

    MergeResult { bytes: out, conflicts }
}

/// First base index `>= i` that is matched in ours and theirs, along with
/// the matched cursors on each side.
fn next_stable(
    a: &[&[u8]],
    o: &[&[u8]],
    t: &[&[u8]],
    mo: &FxHashMap<usize, usize>,
    mt: &FxHashMap<usize, usize>,
    i: usize,
    j: usize,
    k: usize,
) -> (usize, usize, usize) {
    let mut next = i;
    while next < a.len() {
        if let (Some(&oj), Some(&tk)) = (mo.get(&next), mt.get(&next)) {
            if oj >= j && tk >= k {
                return (next, oj, tk);
            }
        }
        next += 1;
    }
    (a.len(), o.len(), t.len())
}

fn slices_equal(a: &[&[u8]], b: &[&[u8]]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

fn extend(out: &mut Vec<u8>, lines: &[&[u8]]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

/// Appends `text` ensuring the output sits at a line start afterwards.
fn push_marker(out: &mut Vec<u8>, text: &str) {
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
}

fn emit_conflict(
    out: &mut Vec<u8>,
    style: ConflictStyle,
    our_label: &str,
    their_label: &str,
    base: &[&[u8]],
    ours: &[&[u8]],
    theirs: &[&[u8]],
) {
    let (ours, theirs, prefix, suffix) = match style {
        // zdiff3 hoists lines common to both sides out of the conflict
        ConflictStyle::Zdiff3 => {
            let mut common_prefix = 0;
            while common_prefix < ours.len()
                && common_prefix < theirs.len()
                && ours[common_prefix] == theirs[common_prefix]
            {
                common_prefix += 1;
            }
            let mut common_suffix = 0;
            while common_suffix < ours.len() - common_prefix
                && common_suffix < theirs.len() - common_prefix
                && ours[ours.len() - 1 - common_suffix] == theirs[theirs.len() - 1 - common_suffix]
            {
                common_suffix += 1;
            }
            (
                &ours[common_prefix..ours.len() - common_suffix],
                &theirs[common_prefix..theirs.len() - common_suffix],
                &ours[..common_prefix],
                &ours[ours.len() - common_suffix..],
            )
        }
        _ => (ours, theirs, &ours[..0], &ours[..0]),
    };

    extend(out, prefix);
    push_marker(out, &format!("<<<<<<< {}", our_label));
    extend(out, ours);
    if matches!(style, ConflictStyle::Diff3 | ConflictStyle::Zdiff3) {
        push_marker(out, "|||||||");
        extend(out, base);
    }
    push_marker(out, "=======");
    extend(out, theirs);
    push_marker(out, &format!(">>>>>>> {}", their_label));
    extend(out, suffix);
}

#[cfg(test)]
mod tests;
