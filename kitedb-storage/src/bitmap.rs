use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Extension trait that views a u64 slice as a bitmap.
/// The "bitmap_" prefix keeps the methods clear of slice inherent names.
pub trait Bitmap {
    /// Returns the bit at the given index.
    fn bitmap_get(&self, idx: usize) -> bool;

    /// Returns the 64-bit unit at the given unit index.
    fn bitmap_unit(&self, unit_idx: usize) -> u64;

    /// Returns the backing units.
    fn bitmap_units(&self) -> &[u64];

    /// Sets the bit at the given index, returns false if already set.
    fn bitmap_set(&mut self, idx: usize) -> bool;

    /// Clears the bit at the given index, returns false if already clear.
    fn bitmap_unset(&mut self, idx: usize) -> bool;

    /// Sets every bit in [start, end).
    fn bitmap_set_range(&mut self, start: usize, end: usize);

    /// Clears every bit in [start, end).
    fn bitmap_unset_range(&mut self, start: usize, end: usize);

    /// Counts set bits among the first len bits.
    fn bitmap_count_ones(&self, len: usize) -> usize;

    /// Returns the backing units mutably.
    fn bitmap_units_mut(&mut self) -> &mut [u64];

    /// Sets the first clear bit within the given unit range and
    /// returns its bit index.
    #[inline]
    fn bitmap_set_first(&mut self, unit_start: usize, unit_end: usize) -> Option<usize> {
        if unit_start >= unit_end {
            return None;
        }
        for (i, v) in self.bitmap_units_mut()[unit_start..unit_end]
            .iter_mut()
            .enumerate()
        {
            let bit = (*v).trailing_ones();
            if bit < 64 {
                *v |= 1 << bit;
                return Some((unit_start + i) * 64 + bit as usize);
            }
        }
        None
    }

    /// Iterates the first len bits as runs, collapsing consecutive
    /// equal bits into (value, count) items.
    #[inline]
    fn bitmap_range_iter(&self, len: usize) -> BitmapRangeIter<'_> {
        debug_assert!(len <= self.bitmap_units().len() * 64);
        let mut iter = BitmapRangeIter {
            u64s: &[],
            last_word_len: 0,
            word: 0,
            word_bits: 0,
            prev: false,
            n: 0,
        };
        if len != 0 {
            iter.u64s = &self.bitmap_units()[..len.div_ceil(64)];
            iter.last_word_len = if len & 63 == 0 { 64 } else { len & 63 };
            // Run state seeds from bit 0 so the first item carries the
            // right value.
            iter.prev = self.bitmap_unit(0) & 1 != 0;
        }
        iter
    }

    /// Iterates the indexes of set bits among the first len bits.
    #[inline]
    fn bitmap_true_index_iter(&self, len: usize) -> BitmapTrueIndexIter<'_> {
        BitmapTrueIndexIter {
            range_iter: self.bitmap_range_iter(len),
            start: 0,
            end: 0,
        }
    }
}

impl Bitmap for [u64] {
    #[inline]
    fn bitmap_get(&self, idx: usize) -> bool {
        self[idx / 64] >> (idx % 64) & 1 != 0
    }

    #[inline]
    fn bitmap_unit(&self, unit_idx: usize) -> u64 {
        self[unit_idx]
    }

    #[inline]
    fn bitmap_units(&self) -> &[u64] {
        self
    }

    #[inline]
    fn bitmap_set(&mut self, idx: usize) -> bool {
        let mask = 1u64 << (idx % 64);
        let unit = &mut self[idx / 64];
        if *unit & mask != 0 {
            return false;
        }
        *unit |= mask;
        true
    }

    #[inline]
    fn bitmap_unset(&mut self, idx: usize) -> bool {
        let mask = 1u64 << (idx % 64);
        let unit = &mut self[idx / 64];
        if *unit & mask == 0 {
            return false;
        }
        *unit &= !mask;
        true
    }

    #[inline]
    fn bitmap_set_range(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.len() * 64);
        if start == end {
            return;
        }
        let start_unit = start / 64;
        let end_unit = (end - 1) / 64;
        let head = !0u64 << (start % 64);
        let tail_bits = (end - 1) % 64 + 1;
        let tail = if tail_bits == 64 {
            !0u64
        } else {
            (1u64 << tail_bits) - 1
        };
        if start_unit == end_unit {
            self[start_unit] |= head & tail;
            return;
        }
        self[start_unit] |= head;
        for unit in &mut self[start_unit + 1..end_unit] {
            *unit = !0;
        }
        self[end_unit] |= tail;
    }

    #[inline]
    fn bitmap_unset_range(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.len() * 64);
        if start == end {
            return;
        }
        let start_unit = start / 64;
        let end_unit = (end - 1) / 64;
        let head = !0u64 << (start % 64);
        let tail_bits = (end - 1) % 64 + 1;
        let tail = if tail_bits == 64 {
            !0u64
        } else {
            (1u64 << tail_bits) - 1
        };
        if start_unit == end_unit {
            self[start_unit] &= !(head & tail);
            return;
        }
        self[start_unit] &= !head;
        for unit in &mut self[start_unit + 1..end_unit] {
            *unit = 0;
        }
        self[end_unit] &= !tail;
    }

    #[inline]
    fn bitmap_count_ones(&self, len: usize) -> usize {
        debug_assert!(len <= self.len() * 64);
        let full_units = len / 64;
        let mut count: usize = self[..full_units]
            .iter()
            .map(|u| u.count_ones() as usize)
            .sum();
        let rem = len % 64;
        if rem != 0 {
            count += (self[full_units] & ((1u64 << rem) - 1)).count_ones() as usize;
        }
        count
    }

    #[inline]
    fn bitmap_units_mut(&mut self) -> &mut [u64] {
        self
    }
}

/// Allocates a zeroed bitmap able to hold the given number of bits.
#[inline]
pub fn new_bitmap(bits: usize) -> Box<[u64]> {
    vec![0u64; bits.div_ceil(64)].into_boxed_slice()
}

#[derive(Debug, Clone)]
pub struct BitmapRangeIter<'a> {
    u64s: &'a [u64],      // words not yet loaded
    last_word_len: usize, // valid bits in the final word
    word: u64,            // word currently being scanned
    word_bits: usize,     // bits left in the current word
    prev: bool,           // value of the open run
    n: usize,             // length of the open run
}

impl BitmapRangeIter<'_> {
    /// Consumes the leading run of `value` bits from the current word
    /// and returns its length.
    #[inline]
    fn scan_run(&mut self, value: bool) -> usize {
        let run = if value {
            self.word.trailing_ones() as usize
        } else {
            self.word.trailing_zeros() as usize
        };
        let bits = self.word_bits.min(run);
        if bits == 64 {
            self.word = 0;
        } else {
            self.word >>= bits;
        }
        self.word_bits -= bits;
        bits
    }

    /// Extends the open run into the current word, flipping once if
    /// the word starts with the opposite value.
    #[inline]
    fn extend_run(&mut self) {
        self.n += self.scan_run(self.prev);
        if self.n == 0 {
            self.prev = !self.prev;
            self.n = self.scan_run(self.prev);
        }
    }
}

impl Iterator for BitmapRangeIter<'_> {
    type Item = (bool, usize);
    /// Yields one (value, run length) pair per call. Uniform words are
    /// absorbed whole; only mixed words drop to bit-level scanning.
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.word_bits == 0 {
            loop {
                match self.u64s.len() {
                    0 => {
                        if self.n == 0 {
                            return None;
                        }
                        // flush the final open run
                        let rg = (self.prev, self.n);
                        self.n = 0;
                        return Some(rg);
                    }
                    1 => {
                        // last word carries last_word_len valid bits
                        self.word = self.u64s[0];
                        self.word_bits = self.last_word_len;
                        self.u64s = &[];
                        self.extend_run();
                        break;
                    }
                    _ => {
                        self.word = self.u64s[0];
                        self.u64s = &self.u64s[1..];
                        if self.word == 0 || self.word == u64::MAX {
                            let value = self.word != 0;
                            if self.prev == value {
                                self.n += 64;
                                continue;
                            }
                            // uniform word of the opposite value closes
                            // the open run
                            let rg = (self.prev, self.n);
                            self.prev = value;
                            self.n = 64;
                            return Some(rg);
                        }
                        self.word_bits = 64;
                        self.extend_run();
                        break;
                    }
                }
            }
        }
        let ret = (self.prev, self.n);
        self.prev = !self.prev;
        self.n = self.scan_run(self.prev);
        Some(ret)
    }
}

pub struct BitmapTrueIndexIter<'a> {
    range_iter: BitmapRangeIter<'a>,
    start: usize,
    end: usize,
}

impl Iterator for BitmapTrueIndexIter<'_> {
    type Item = usize;
    #[inline]
    fn next(&mut self) -> Option<usize> {
        // start..end spans set-bit indexes not yet handed out
        while self.start == self.end {
            let (value, n) = self.range_iter.next()?;
            if value {
                self.end += n;
            } else {
                self.start += n;
                self.end += n;
            }
        }
        let idx = self.start;
        self.start += 1;
        Some(idx)
    }
}

#[derive(Clone)]
struct FreeBitmap {
    free_unit_idx: usize,
    len: usize,
    bitmap: Vec<u64>,
}

/// Bitmap-backed slot allocator.
///
/// Besides single-slot allocation it supports contiguous runs, which
/// the page stores use to place multi-page chunks, and it can grow
/// when the backing file grows.
pub struct AllocMap {
    inner: Mutex<FreeBitmap>,
    allocated: AtomicUsize,
}

impl AllocMap {
    /// Creates a map with len free slots.
    #[inline]
    pub fn new(len: usize) -> Self {
        AllocMap {
            inner: Mutex::new(FreeBitmap {
                free_unit_idx: 0,
                len,
                bitmap: vec![0u64; len.div_ceil(64)],
            }),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns the slot capacity.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots currently allocated.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Raises the slot capacity to new_len. Shrinking is not supported.
    #[inline]
    pub fn grow(&self, new_len: usize) {
        let mut g = self.inner.lock();
        if new_len <= g.len {
            return;
        }
        g.len = new_len;
        g.bitmap.resize(new_len.div_ceil(64), 0);
    }

    /// Allocates one slot and returns its index.
    #[inline]
    pub fn try_allocate(&self) -> Option<usize> {
        let mut g = self.inner.lock();
        // Deallocation walks free_unit_idx back to the lowest freed
        // unit, so no unit below it holds a free bit and the scan can
        // start there.
        let unit_start = g.free_unit_idx;
        let unit_end = g.len.div_ceil(64);
        let idx = g.bitmap.bitmap_set_first(unit_start, unit_end)?;
        if idx >= g.len {
            // set_first may land on padding past len in the last unit
            g.bitmap.bitmap_unset(idx);
            return None;
        }
        g.free_unit_idx = idx / 64;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    /// Allocates count consecutive slots and returns the start index.
    #[inline]
    pub fn try_allocate_run(&self, count: usize) -> Option<usize> {
        debug_assert!(count > 0);
        let mut g = self.inner.lock();
        let len = g.len;
        let mut start = None;
        let mut idx = 0usize;
        for (value, n) in g.bitmap.bitmap_range_iter(len) {
            if !value && n >= count {
                start = Some(idx);
                break;
            }
            idx += n;
        }
        let start = start?;
        g.bitmap.bitmap_set_range(start, start + count);
        self.allocated.fetch_add(count, Ordering::Relaxed);
        Some(start)
    }

    /// Releases the slot at idx, returns false if it was already free.
    #[inline]
    pub fn deallocate(&self, idx: usize) -> bool {
        let mut g = self.inner.lock();
        debug_assert!(idx < g.len);
        if !g.bitmap.bitmap_unset(idx) {
            return false;
        }
        g.free_unit_idx = g.free_unit_idx.min(idx / 64);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Releases count consecutive slots starting at start.
    #[inline]
    pub fn deallocate_run(&self, start: usize, count: usize) {
        if count == 0 {
            return;
        }
        let mut g = self.inner.lock();
        debug_assert!(start + count <= g.len);
        debug_assert!((start..start + count).all(|i| g.bitmap.bitmap_get(i)));
        g.bitmap.bitmap_unset_range(start, start + count);
        g.free_unit_idx = g.free_unit_idx.min(start / 64);
        self.allocated.fetch_sub(count, Ordering::Relaxed);
    }

    /// Claims count consecutive slots at a fixed position. Used to
    /// rebuild the map from persisted page ranges.
    #[inline]
    pub fn allocate_run_at(&self, start: usize, count: usize) -> bool {
        let mut g = self.inner.lock();
        if start + count > g.len {
            return false;
        }
        if (start..start + count).any(|i| g.bitmap.bitmap_get(i)) {
            return false;
        }
        g.bitmap.bitmap_set_range(start, start + count);
        self.allocated.fetch_add(count, Ordering::Relaxed);
        true
    }

    /// Returns whether the slot at idx is allocated.
    #[inline]
    pub fn is_allocated(&self, idx: usize) -> bool {
        self.inner.lock().bitmap.bitmap_get(idx)
    }

    /// Returns the allocated slot ranges in ascending order.
    #[inline]
    pub fn allocated_ranges(&self) -> Vec<Range<usize>> {
        let g = self.inner.lock();
        let mut res = Vec::new();
        let mut idx = 0usize;
        for (value, count) in g.bitmap.bitmap_range_iter(g.len) {
            if value {
                res.push(idx..idx + count);
            }
            idx += count;
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bitmap_basic_ops() {
        let mut bm = new_bitmap(128);
        assert_eq!(bm.len(), 2);
        assert!(!bm.bitmap_get(0));
        assert!(!bm.bitmap_get(127));

        assert!(bm.bitmap_set(0));
        assert!(bm.bitmap_set(63));
        assert!(bm.bitmap_set(64));
        assert!(bm.bitmap_set(127));
        assert!(!bm.bitmap_set(0)); // already set

        assert_eq!(bm.bitmap_unit(0), 1 | (1 << 63));
        assert_eq!(bm.bitmap_unit(1), 1 | (1 << 63));

        assert!(bm.bitmap_unset(63));
        assert!(!bm.bitmap_unset(63)); // already unset
        assert!(!bm.bitmap_get(63));
    }

    #[test]
    fn test_bitmap_set_range() {
        let mut bm = new_bitmap(192);
        bm.bitmap_set_range(10, 10); // empty range is no-op
        assert_eq!(bm.bitmap_count_ones(192), 0);

        bm.bitmap_set_range(3, 9); // within one unit
        assert_eq!(bm.bitmap_count_ones(192), 6);
        assert!(!bm.bitmap_get(2));
        assert!(bm.bitmap_get(3));
        assert!(bm.bitmap_get(8));
        assert!(!bm.bitmap_get(9));

        bm.bitmap_set_range(60, 130); // crosses two unit boundaries
        assert!(bm.bitmap_get(60));
        assert!(bm.bitmap_get(64));
        assert!(bm.bitmap_get(129));
        assert!(!bm.bitmap_get(130));
        assert_eq!(bm.bitmap_count_ones(192), 6 + 70);

        bm.bitmap_unset_range(0, 64);
        assert_eq!(bm.bitmap_count_ones(192), 66);
        bm.bitmap_unset_range(64, 192);
        assert_eq!(bm.bitmap_count_ones(192), 0);
    }

    #[test]
    fn test_bitmap_count_ones_partial() {
        let mut bm = new_bitmap(128);
        bm.bitmap_set_range(0, 100);
        assert_eq!(bm.bitmap_count_ones(50), 50);
        assert_eq!(bm.bitmap_count_ones(100), 100);
        assert_eq!(bm.bitmap_count_ones(128), 100);
    }

    #[test]
    fn test_bitmap_set_first() {
        let mut bm = new_bitmap(128);
        for i in 0..64 {
            bm.bitmap_set(i);
        }
        assert_eq!(bm.bitmap_set_first(0, 2), Some(64));
        assert!(bm.bitmap_get(64));
        for i in 64..128 {
            bm.bitmap_set(i);
        }
        assert_eq!(bm.bitmap_set_first(0, 2), None);
    }

    #[test]
    fn test_bitmap_range_iter() {
        let bm = new_bitmap(0);
        let mut iter = bm.bitmap_range_iter(0);
        assert_eq!(iter.next(), None);

        let mut bm = new_bitmap(64);
        bm.bitmap_set_range(0, 64);
        let mut iter = bm.bitmap_range_iter(64);
        assert_eq!(iter.next(), Some((true, 64)));
        assert_eq!(iter.next(), None);

        let mut bm = new_bitmap(192);
        bm.bitmap_set_range(0, 64);
        for i in (64..128).step_by(2) {
            bm.bitmap_set(i);
        }
        let mut iter = bm.bitmap_range_iter(192);
        assert_eq!(iter.next(), Some((true, 65)));
        for _ in 0..31 {
            assert_eq!(iter.next(), Some((false, 1)));
            assert_eq!(iter.next(), Some((true, 1)));
        }
        // closing bit of the second word plus the whole third word
        assert_eq!(iter.next(), Some((false, 65)));

        let mut bm = new_bitmap(100);
        bm.bitmap_set(0);
        bm.bitmap_set(99);
        let mut iter = bm.bitmap_range_iter(100);
        assert_eq!(iter.next(), Some((true, 1)));
        assert_eq!(iter.next(), Some((false, 98)));
        assert_eq!(iter.next(), Some((true, 1)));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_bitmap_true_index_iter() {
        let mut bm = new_bitmap(128);
        for i in (0..128).step_by(2) {
            bm.bitmap_set(i);
        }
        let iter = bm.bitmap_true_index_iter(128);
        assert_eq!(
            iter.collect::<Vec<_>>(),
            (0..128).step_by(2).collect::<Vec<_>>()
        );

        let mut bm = new_bitmap(100);
        bm.bitmap_set(0);
        bm.bitmap_set(99);
        let iter = bm.bitmap_true_index_iter(100);
        assert_eq!(iter.collect::<Vec<_>>(), vec![0, 99]);
    }

    #[test]
    fn test_alloc_map_ops() {
        let alloc_map = AllocMap::new(1024);
        for _ in 0..1000 {
            assert!(alloc_map.try_allocate().is_some());
        }
        assert!(!alloc_map.deallocate(1000));
        assert!(alloc_map.deallocate(500));
        for _ in 0..25 {
            assert!(alloc_map.try_allocate().is_some());
        }
        assert!(alloc_map.deallocate(500));
        assert!(alloc_map.try_allocate().is_some());
        assert_eq!(alloc_map.allocated(), 1024);
        assert!(alloc_map.try_allocate().is_none());
    }

    #[test]
    fn test_alloc_map_runs() {
        let alloc_map = AllocMap::new(256);
        let a = alloc_map.try_allocate_run(100).unwrap();
        assert_eq!(a, 0);
        let b = alloc_map.try_allocate_run(100).unwrap();
        assert_eq!(b, 100);
        // only 56 left, run of 60 does not fit.
        assert!(alloc_map.try_allocate_run(60).is_none());
        alloc_map.deallocate_run(a, 100);
        // freed head region fits again.
        let c = alloc_map.try_allocate_run(60).unwrap();
        assert_eq!(c, 0);
        assert_eq!(alloc_map.allocated(), 160);
        assert_eq!(alloc_map.allocated_ranges(), vec![0..60, 100..200]);
    }

    #[test]
    fn test_alloc_map_grow() {
        let alloc_map = AllocMap::new(64);
        assert!(alloc_map.try_allocate_run(64).is_some());
        assert!(alloc_map.try_allocate().is_none());
        alloc_map.grow(192);
        assert_eq!(alloc_map.len(), 192);
        let idx = alloc_map.try_allocate_run(128).unwrap();
        assert_eq!(idx, 64);
    }

    #[test]
    fn test_alloc_map_rebuild() {
        let alloc_map = AllocMap::new(128);
        assert!(alloc_map.allocate_run_at(10, 20));
        assert!(!alloc_map.allocate_run_at(25, 10)); // overlaps
        assert!(!alloc_map.allocate_run_at(120, 10)); // beyond len
        assert!(alloc_map.allocate_run_at(30, 10));
        assert_eq!(alloc_map.allocated_ranges(), vec![10..40]);
    }

    #[test]
    fn test_alloc_map_concurrent() {
        let alloc_map = Arc::new(AllocMap::new(4096));
        let mut handles = vec![];
        for _ in 0..8 {
            let alloc_map = Arc::clone(&alloc_map);
            handles.push(thread::spawn(move || {
                let mut runs = vec![];
                for _ in 0..16 {
                    let start = alloc_map.try_allocate_run(8).unwrap();
                    runs.push(start);
                }
                for start in runs {
                    alloc_map.deallocate_run(start, 8);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(alloc_map.allocated(), 0);
    }
}
