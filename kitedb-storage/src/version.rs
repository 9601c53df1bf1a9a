//! Row-level MVCC versions for in-memory node groups.
//!
//! Timestamps share one u64 domain: commit timestamps occupy the low
//! half, active transaction ids the high half, so committedness is a
//! single compare. Version state lives only in memory; checkpoint
//! resolves it into the persisted row set and drops it.

use crate::error::{Error, Result};
use crate::serde::{
    expect_field_tag, field_tag_len, ser_field_tag, Deser, ForBitpackingDeser, ForBitpackingSer,
    Ser, Serde,
};
use crate::vector::{SelectionVector, VECTOR_CAPACITY};
use either::Either;
use std::mem;

pub const MIN_SNAPSHOT_TS: u64 = 1;
pub const MAX_SNAPSHOT_TS: u64 = 1 << 63;
pub const MIN_ACTIVE_TRX_ID: u64 = (1 << 63) + 1;
/// Commit timestamp at or below which every view sees the row.
pub const GLOBAL_VISIBLE_TS: u64 = 1;
/// Version owned by a rolled back transaction. Never visible.
pub const ABORTED_TS: u64 = u64::MAX;

const NO_VERSION: u64 = 0;

#[inline]
pub fn trx_is_committed(ts: u64) -> bool {
    ts < MIN_ACTIVE_TRX_ID
}

/// Transaction view row visibility is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct TrxView {
    /// Committed versions at or below this timestamp are visible.
    pub snapshot_ts: u64,
    /// Own transaction id, sees its uncommitted writes.
    pub trx_id: u64,
}

impl TrxView {
    #[inline]
    pub fn new(snapshot_ts: u64, trx_id: u64) -> Self {
        debug_assert!(snapshot_ts <= MAX_SNAPSHOT_TS);
        TrxView {
            snapshot_ts,
            trx_id,
        }
    }

    /// View of everything committed, for checkpoint and recovery.
    #[inline]
    pub fn committed(snapshot_ts: u64) -> Self {
        TrxView {
            snapshot_ts,
            trx_id: MIN_ACTIVE_TRX_ID,
        }
    }

    #[inline]
    pub fn sees(&self, version_ts: u64) -> bool {
        version_ts == self.trx_id
            || (trx_is_committed(version_ts) && version_ts <= self.snapshot_ts)
    }
}

/// Versions of one vector of rows.
///
/// The common case is a batch appended by a single transaction, which
/// stays a single timestamp. The first divergent write expands it to
/// per-row slots.
struct VectorVersionInfo {
    insertions: Either<u64, Box<[u64]>>,
    /// Zero means not deleted.
    deletions: Option<Box<[u64]>>,
}

impl VectorVersionInfo {
    fn new() -> Self {
        VectorVersionInfo {
            insertions: Either::Left(NO_VERSION),
            deletions: None,
        }
    }

    fn append_rows(&mut self, start: usize, end: usize, ts: u64) {
        match &mut self.insertions {
            Either::Left(cur) if *cur == ts => {}
            // whole-vector restart keeps the uniform representation.
            Either::Left(_) if start == 0 => self.insertions = Either::Left(ts),
            _ => self.insertion_slots_mut()[start..end].fill(ts),
        }
    }

    fn insertion_slots_mut(&mut self) -> &mut [u64] {
        if let Either::Left(ts) = self.insertions {
            self.insertions = Either::Right(vec![ts; VECTOR_CAPACITY].into_boxed_slice());
        }
        match &mut self.insertions {
            Either::Right(slots) => slots,
            Either::Left(_) => unreachable!(),
        }
    }

    fn deletion_slots_mut(&mut self) -> &mut [u64] {
        self.deletions
            .get_or_insert_with(|| vec![NO_VERSION; VECTOR_CAPACITY].into_boxed_slice())
    }

    fn delete_row(&mut self, row: usize, ts: u64) -> bool {
        let slot = &mut self.deletion_slots_mut()[row];
        if *slot != NO_VERSION {
            return false;
        }
        *slot = ts;
        true
    }

    #[inline]
    fn insertion_ts(&self, row: usize) -> u64 {
        match &self.insertions {
            Either::Left(ts) => *ts,
            Either::Right(slots) => slots[row],
        }
    }

    #[inline]
    fn is_inserted(&self, view: &TrxView, row: usize) -> bool {
        let ts = self.insertion_ts(row);
        ts == NO_VERSION || view.sees(ts)
    }

    #[inline]
    fn is_deleted(&self, view: &TrxView, row: usize) -> bool {
        match &self.deletions {
            None => false,
            Some(slots) => {
                let ts = slots[row];
                ts != NO_VERSION && view.sees(ts)
            }
        }
    }

    fn has_deletions(&self) -> bool {
        self.deletions
            .as_ref()
            .map_or(false, |slots| slots.iter().any(|&ts| ts != NO_VERSION))
    }
}

/// Per-group version state, one lazily allocated entry per vector of
/// rows. Rows with no entry are committed and visible to every view.
pub struct VersionInfo {
    vectors: Vec<Option<Box<VectorVersionInfo>>>,
}

impl VersionInfo {
    pub fn new() -> Self {
        VersionInfo {
            vectors: Vec::new(),
        }
    }

    fn vector_mut(&mut self, vector_idx: usize) -> &mut VectorVersionInfo {
        if vector_idx >= self.vectors.len() {
            self.vectors.resize_with(vector_idx + 1, || None);
        }
        self.vectors[vector_idx].get_or_insert_with(|| Box::new(VectorVersionInfo::new()))
    }

    fn for_each_vector_range<F>(&mut self, start_row: usize, num_rows: usize, mut f: F)
    where
        F: FnMut(&mut VectorVersionInfo, usize, usize),
    {
        let end = start_row + num_rows;
        let mut row = start_row;
        while row < end {
            let vector_idx = row / VECTOR_CAPACITY;
            let in_start = row % VECTOR_CAPACITY;
            let in_end = (end - vector_idx * VECTOR_CAPACITY).min(VECTOR_CAPACITY);
            f(self.vector_mut(vector_idx), in_start, in_end);
            row = (vector_idx + 1) * VECTOR_CAPACITY;
        }
    }

    /// Stamps freshly appended rows with the writing transaction.
    pub fn append(&mut self, start_row: usize, num_rows: usize, ts: u64) {
        self.for_each_vector_range(start_row, num_rows, |v, s, e| v.append_rows(s, e, ts));
    }

    /// Replaces the transaction id of appended rows with their commit
    /// timestamp.
    pub fn commit_append(&mut self, start_row: usize, num_rows: usize, commit_ts: u64) {
        debug_assert!(trx_is_committed(commit_ts));
        self.for_each_vector_range(start_row, num_rows, |v, s, e| v.append_rows(s, e, commit_ts));
    }

    /// Marks rolled back rows permanently invisible. The rows stay
    /// allocated; no view ever selects them.
    pub fn rollback_append(&mut self, start_row: usize, num_rows: usize) {
        self.for_each_vector_range(start_row, num_rows, |v, s, e| {
            v.append_rows(s, e, ABORTED_TS)
        });
    }

    /// Marks a row deleted by the given transaction. Returns false if
    /// some transaction already deleted it.
    pub fn delete(&mut self, row: usize, ts: u64) -> bool {
        self.vector_mut(row / VECTOR_CAPACITY)
            .delete_row(row % VECTOR_CAPACITY, ts)
    }

    pub fn commit_delete(&mut self, row: usize, commit_ts: u64) {
        debug_assert!(trx_is_committed(commit_ts));
        let v = self.vector_mut(row / VECTOR_CAPACITY);
        v.deletion_slots_mut()[row % VECTOR_CAPACITY] = commit_ts;
    }

    pub fn rollback_delete(&mut self, row: usize) {
        let v = self.vector_mut(row / VECTOR_CAPACITY);
        v.deletion_slots_mut()[row % VECTOR_CAPACITY] = NO_VERSION;
    }

    #[inline]
    fn vector(&self, vector_idx: usize) -> Option<&VectorVersionInfo> {
        match self.vectors.get(vector_idx) {
            Some(Some(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_inserted(&self, view: &TrxView, row: usize) -> bool {
        match self.vector(row / VECTOR_CAPACITY) {
            None => true,
            Some(v) => v.is_inserted(view, row % VECTOR_CAPACITY),
        }
    }

    pub fn is_deleted(&self, view: &TrxView, row: usize) -> bool {
        match self.vector(row / VECTOR_CAPACITY) {
            None => false,
            Some(v) => v.is_deleted(view, row % VECTOR_CAPACITY),
        }
    }

    #[inline]
    pub fn is_visible(&self, view: &TrxView, row: usize) -> bool {
        self.is_inserted(view, row) && !self.is_deleted(view, row)
    }

    /// Deselects rows of the batch [start_row, start_row+count) the
    /// view cannot see. Positions in sel are batch-relative.
    pub fn select_visible(
        &self,
        view: &TrxView,
        start_row: usize,
        count: usize,
        sel: &mut SelectionVector,
    ) {
        debug_assert!(sel.len() >= count);
        for k in 0..count {
            if !self.is_visible(view, start_row + k) {
                sel.deselect(k);
            }
        }
    }

    pub fn has_deletions(&self) -> bool {
        self.vectors
            .iter()
            .flatten()
            .any(|v| v.has_deletions())
    }

    /// Rows of the range invisible to the view because of deletion.
    pub fn num_deleted(&self, view: &TrxView, start_row: usize, count: usize) -> usize {
        (start_row..start_row + count)
            .filter(|row| self.is_deleted(view, *row))
            .count()
    }

    /// Whether any row is tracked at all.
    pub fn is_empty(&self) -> bool {
        self.vectors.iter().all(|v| v.is_none())
    }

    /// Whether every tracked version is resolved, committed or
    /// aborted. Only resolved state may be persisted.
    pub fn is_fully_committed(&self) -> bool {
        let resolved = |ts: u64| trx_is_committed(ts) || ts == ABORTED_TS;
        self.vectors.iter().flatten().all(|v| {
            let insertions_ok = match &v.insertions {
                Either::Left(ts) => resolved(*ts),
                Either::Right(slots) => slots.iter().all(|&ts| resolved(ts)),
            };
            insertions_ok
                && v.deletions
                    .as_ref()
                    .map_or(true, |slots| slots.iter().all(|&ts| resolved(ts)))
        })
    }

    pub fn in_mem_size(&self) -> usize {
        let mut size = 0;
        for v in self.vectors.iter().flatten() {
            if let Either::Right(slots) = &v.insertions {
                size += slots.len() * mem::size_of::<u64>();
            }
            if let Some(slots) = &v.deletions {
                size += slots.len() * mem::size_of::<u64>();
            }
        }
        size
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::new()
    }
}

fn slots_ser_len(slots: &[u64]) -> usize {
    mem::size_of::<u8>()
        + match ForBitpackingSer::new(slots) {
            Some(bp) => bp.ser_len(),
            None => slots.ser_len(),
        }
}

fn ser_slots<S: Serde + ?Sized>(out: &mut S, idx: usize, slots: &[u64]) -> usize {
    match ForBitpackingSer::new(slots) {
        Some(bp) => {
            let idx = out.ser_u8(idx, 1);
            bp.ser(out, idx)
        }
        None => {
            let idx = out.ser_u8(idx, 0);
            slots.ser(out, idx)
        }
    }
}

fn deser_slots<S: Serde + ?Sized>(input: &S, idx: usize) -> Result<(usize, Box<[u64]>)> {
    let (idx, packed) = input.deser_u8(idx)?;
    match packed {
        0 => {
            let (idx, slots) = Vec::<u64>::deser(input, idx)?;
            Ok((idx, slots.into_boxed_slice()))
        }
        1 => {
            let (idx, slots) = ForBitpackingDeser::<u64>::deser(input, idx)?;
            Ok((idx, slots.0.into_boxed_slice()))
        }
        _ => Err(Error::InvalidFormat),
    }
}

impl Ser<'_> for VectorVersionInfo {
    fn ser_len(&self) -> usize {
        let insertions = match &self.insertions {
            Either::Left(_) => mem::size_of::<u64>(),
            Either::Right(slots) => slots_ser_len(slots),
        };
        let deletions = match &self.deletions {
            None => 0,
            Some(slots) => slots_ser_len(slots),
        };
        field_tag_len("inst")
            + mem::size_of::<u8>()
            + insertions
            + field_tag_len("delt")
            + mem::size_of::<u8>()
            + deletions
    }

    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let mut idx = ser_field_tag(out, start_idx, "inst");
        match &self.insertions {
            Either::Left(ts) => {
                idx = out.ser_u8(idx, 0);
                idx = out.ser_u64(idx, *ts);
            }
            Either::Right(slots) => {
                idx = out.ser_u8(idx, 1);
                idx = ser_slots(out, idx, slots);
            }
        }
        idx = ser_field_tag(out, idx, "delt");
        match &self.deletions {
            None => idx = out.ser_u8(idx, 0),
            Some(slots) => {
                idx = out.ser_u8(idx, 1);
                idx = ser_slots(out, idx, slots);
            }
        }
        idx
    }
}

impl Deser for VectorVersionInfo {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, start_idx, "inst")?;
        let (idx, kind) = input.deser_u8(idx)?;
        let (idx, insertions) = match kind {
            0 => {
                let (idx, ts) = input.deser_u64(idx)?;
                (idx, Either::Left(ts))
            }
            1 => {
                let (idx, slots) = deser_slots(input, idx)?;
                (idx, Either::Right(slots))
            }
            _ => return Err(Error::InvalidFormat),
        };
        let idx = expect_field_tag(input, idx, "delt")?;
        let (idx, tag) = input.deser_u8(idx)?;
        let (idx, deletions) = match tag {
            0 => (idx, None),
            1 => {
                let (idx, slots) = deser_slots(input, idx)?;
                (idx, Some(slots))
            }
            _ => return Err(Error::InvalidFormat),
        };
        Ok((
            idx,
            VectorVersionInfo {
                insertions,
                deletions,
            },
        ))
    }
}

impl Ser<'_> for VersionInfo {
    fn ser_len(&self) -> usize {
        field_tag_len("vers") + self.vectors.as_slice().ser_len()
    }

    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let idx = ser_field_tag(out, start_idx, "vers");
        self.vectors.as_slice().ser(out, idx)
    }
}

impl Deser for VersionInfo {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let idx = expect_field_tag(input, start_idx, "vers")?;
        let (idx, vectors) = Vec::<Option<VectorVersionInfo>>::deser(input, idx)?;
        let vectors = vectors.into_iter().map(|v| v.map(Box::new)).collect();
        Ok((idx, VersionInfo { vectors }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRX_A: u64 = MIN_ACTIVE_TRX_ID + 5;
    const TRX_B: u64 = MIN_ACTIVE_TRX_ID + 9;

    #[test]
    fn test_uncommitted_insert_visible_to_owner_only() {
        let mut versions = VersionInfo::new();
        versions.append(0, 10, TRX_A);

        let owner = TrxView::new(20, TRX_A);
        let other = TrxView::new(MAX_SNAPSHOT_TS, TRX_B);
        assert!(versions.is_visible(&owner, 3));
        assert!(!versions.is_visible(&other, 3));

        versions.commit_append(0, 10, 30);
        assert!(versions.is_visible(&TrxView::new(30, TRX_B), 3));
        assert!(!versions.is_visible(&TrxView::new(29, TRX_B), 3));
    }

    #[test]
    fn test_untouched_rows_visible_to_all() {
        let versions = VersionInfo::new();
        let view = TrxView::new(MIN_SNAPSHOT_TS, TRX_B);
        assert!(versions.is_visible(&view, 0));
        assert!(versions.is_visible(&view, 100_000));
        assert!(!versions.has_deletions());
    }

    #[test]
    fn test_delete_and_commit() {
        let mut versions = VersionInfo::new();
        assert!(versions.delete(7, TRX_A));
        // only the deleter stops seeing the row before commit.
        assert!(!versions.is_visible(&TrxView::new(50, TRX_A), 7));
        assert!(versions.is_visible(&TrxView::new(50, TRX_B), 7));

        // a second delete of the same row fails.
        assert!(!versions.delete(7, TRX_B));

        versions.commit_delete(7, 60);
        assert!(versions.is_visible(&TrxView::new(59, TRX_B), 7));
        assert!(!versions.is_visible(&TrxView::new(60, TRX_B), 7));
        assert!(versions.has_deletions());
    }

    #[test]
    fn test_rollback_delete_restores_row() {
        let mut versions = VersionInfo::new();
        assert!(versions.delete(3, TRX_A));
        versions.rollback_delete(3);
        assert!(versions.is_visible(&TrxView::new(10, TRX_A), 3));
        assert!(versions.delete(3, TRX_B));
    }

    #[test]
    fn test_insert_then_delete_same_trx_invisible_to_all() {
        let mut versions = VersionInfo::new();
        versions.append(0, 4, TRX_A);
        assert!(versions.delete(2, TRX_A));

        // invisible to the writing transaction and to everyone else.
        assert!(!versions.is_visible(&TrxView::new(100, TRX_A), 2));
        assert!(!versions.is_visible(&TrxView::new(MAX_SNAPSHOT_TS, TRX_B), 2));
        assert!(versions.is_visible(&TrxView::new(100, TRX_A), 1));

        versions.commit_append(0, 4, 200);
        versions.commit_delete(2, 200);
        assert!(!versions.is_visible(&TrxView::new(300, TRX_B), 2));
        assert!(versions.is_visible(&TrxView::new(300, TRX_B), 3));
    }

    #[test]
    fn test_rollback_append_hides_rows() {
        let mut versions = VersionInfo::new();
        versions.append(0, 5, TRX_A);
        versions.rollback_append(0, 5);
        assert!(!versions.is_visible(&TrxView::new(MAX_SNAPSHOT_TS, TRX_A), 0));
        assert!(!versions.is_visible(&TrxView::new(MAX_SNAPSHOT_TS, TRX_B), 4));
    }

    #[test]
    fn test_uniform_append_stays_flat() {
        let mut versions = VersionInfo::new();
        versions.append(0, 100, TRX_A);
        versions.append(100, 200, TRX_A);
        let v = versions.vector(0).unwrap();
        assert!(matches!(&v.insertions, Either::Left(ts) if *ts == TRX_A));

        // a second writer expands to per-row slots.
        versions.append(300, 10, TRX_B);
        let v = versions.vector(0).unwrap();
        assert!(matches!(&v.insertions, Either::Right(_)));
        let view = TrxView::new(1, TRX_B);
        assert!(versions.is_visible(&view, 305));
        assert!(!versions.is_visible(&view, 50));
    }

    #[test]
    fn test_append_spans_vectors() {
        let mut versions = VersionInfo::new();
        versions.append(VECTOR_CAPACITY - 10, 20, TRX_A);
        versions.commit_append(VECTOR_CAPACITY - 10, 20, 40);
        let view = TrxView::new(40, TRX_B);
        assert!(versions.is_visible(&view, VECTOR_CAPACITY - 1));
        assert!(versions.is_visible(&view, VECTOR_CAPACITY + 9));
        assert!(versions.num_deleted(&view, 0, VECTOR_CAPACITY) == 0);

        let mut sel = SelectionVector::all(20);
        versions.select_visible(
            &TrxView::new(39, TRX_B),
            VECTOR_CAPACITY - 10,
            20,
            &mut sel,
        );
        assert_eq!(sel.num_selected(), 0);
    }

    #[test]
    fn test_version_serde_roundtrip() {
        let mut versions = VersionInfo::new();
        versions.append(0, 100, TRX_A);
        versions.commit_append(0, 100, 40);
        versions.append(VECTOR_CAPACITY, 10, TRX_B);
        versions.commit_append(VECTOR_CAPACITY, 10, 50);
        assert!(versions.delete(7, TRX_A));
        versions.commit_delete(7, 60);
        assert!(versions.is_fully_committed());

        let len = versions.ser_len();
        let mut buf = vec![0u8; len];
        let out = &mut buf[..];
        let idx = versions.ser(out, 0);
        assert_eq!(idx, len);
        let (idx, restored) = VersionInfo::deser(&buf[..], 0).unwrap();
        assert_eq!(idx, len);

        let view = TrxView::new(45, TRX_B);
        for row in [0, 7, 99, VECTOR_CAPACITY, VECTOR_CAPACITY + 9, 5 * VECTOR_CAPACITY] {
            assert_eq!(
                versions.is_visible(&view, row),
                restored.is_visible(&view, row)
            );
        }
        let late = TrxView::new(70, MIN_ACTIVE_TRX_ID + 77);
        assert!(!restored.is_visible(&late, 7));
        assert!(restored.is_visible(&late, 8));
    }
}
