//! CSR adjacency on top of a node group, for rel tables.
//!
//! Rel rows live in the wrapped [`NodeGroup`] ordered by their bound
//! node. Two extra chunks per direction index them: the end offset of
//! every node's run and its length, so node i's rel rows occupy
//! `[end(i) - len(i), end(i))`. Zero-length runs keep deleted and
//! isolated nodes addressable without holes in the offsets.

use crate::chunk::{ColumnChunk, ResidencyState};
use crate::column::{CheckpointOptions, CheckpointOutcome, Column};
use crate::error::{Error, Result};
use crate::group::{read_blob, write_blob, NodeGroup, NodeGroupFlags};
use crate::page::{PageStore, PAGE_SIZE};
use crate::serde::{expect_field_tag, field_tag_len, ser_field_tag, Deser, Ser, Serde};
use crate::version::TrxView;
use crate::vector::{SelectionVector, ValueVector};
use kitedb_datatype::LogicalType;
use std::mem;

/// Traversal direction of a rel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrDirection {
    Fwd,
    Bwd,
}

pub const CSR_DIRECTIONS: [CsrDirection; 2] = [CsrDirection::Fwd, CsrDirection::Bwd];

impl CsrDirection {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            CsrDirection::Fwd => 0,
            CsrDirection::Bwd => 1,
        }
    }
}

/// Offset and length index of one direction.
struct CsrAdjacency {
    offset_col: Column,
    length_col: Column,
    offset_chunk: ColumnChunk,
    length_chunk: ColumnChunk,
    dirty: bool,
}

impl CsrAdjacency {
    fn new(direction: CsrDirection) -> Self {
        let (offset_name, length_name) = match direction {
            CsrDirection::Fwd => ("csr.fwd.offset", "csr.fwd.length"),
            CsrDirection::Bwd => ("csr.bwd.offset", "csr.bwd.length"),
        };
        let offset_col = Column::new(offset_name, &LogicalType::UInt64, true);
        let length_col = Column::new(length_name, &LogicalType::UInt32, true);
        let offset_chunk = offset_col.new_chunk(0, false);
        let length_chunk = length_col.new_chunk(0, false);
        CsrAdjacency {
            offset_col,
            length_col,
            offset_chunk,
            length_chunk,
            dirty: false,
        }
    }

    /// Replaces the whole index from per-node run lengths.
    fn set(&mut self, lengths: &[u32]) -> Result<()> {
        let n = lengths.len();
        self.offset_chunk.resize_without_preserve(n);
        self.length_chunk.resize_without_preserve(n);
        let mut offsets = ValueVector::new(&LogicalType::UInt64);
        let mut lens = ValueVector::new(&LogicalType::UInt32);
        offsets.set_len(n);
        lens.set_len(n);
        let mut end = 0u64;
        for (i, len) in lengths.iter().enumerate() {
            end += *len as u64;
            offsets.set_u64(i, end);
            lens.set_u32(i, *len);
        }
        self.offset_chunk.append_all(&offsets)?;
        self.length_chunk.append_all(&lens)?;
        self.dirty = true;
        Ok(())
    }

    /// Start row and length of the node's run.
    fn range(&self, store: &dyn PageStore, node: usize) -> Result<(u64, u32)> {
        if node >= self.offset_chunk.num_values() {
            return Err(Error::IndexOutOfBound);
        }
        let mut out = ValueVector::new(&LogicalType::UInt64);
        out.set_len(1);
        self.offset_col
            .lookup(store, &self.offset_chunk, node, &mut out, 0)?;
        let end = out.get_u64(0);
        let mut out = ValueVector::new(&LogicalType::UInt32);
        out.set_len(1);
        self.length_col
            .lookup(store, &self.length_chunk, node, &mut out, 0)?;
        let len = out.get_u32(0);
        debug_assert!(end >= len as u64);
        Ok((end - len as u64, len))
    }

    fn checkpoint(&mut self, store: &dyn PageStore) -> Result<()> {
        checkpoint_chunk(store, &self.offset_col, &mut self.offset_chunk)?;
        checkpoint_chunk(store, &self.length_col, &mut self.length_chunk)?;
        self.dirty = false;
        Ok(())
    }

    fn evict(&mut self) {
        for chunk in [&mut self.offset_chunk, &mut self.length_chunk] {
            if chunk.residency() == ResidencyState::InMemory && chunk.metadata().is_some() {
                chunk.evict();
            }
        }
    }

    fn in_mem_size(&self) -> usize {
        self.offset_chunk.in_mem_size() + self.length_chunk.in_mem_size()
    }

    fn num_disk_pages(&self) -> u64 {
        self.offset_chunk.num_disk_pages() + self.length_chunk.num_disk_pages()
    }
}

/// Checkpoints a chunk held in place by its owner. Adjacency chunks
/// never split, so the outcome is always a single chunk.
fn checkpoint_chunk(store: &dyn PageStore, col: &Column, chunk: &mut ColumnChunk) -> Result<()> {
    let taken = mem::replace(chunk, col.new_chunk(0, false));
    let opts = CheckpointOptions {
        can_split: false,
        split_rows: usize::MAX,
    };
    match col.checkpoint(store, taken, &opts)? {
        CheckpointOutcome::InPlace(c) => *chunk = c,
        CheckpointOutcome::OutOfPlace(mut chunks) => {
            debug_assert_eq!(chunks.len(), 1);
            match chunks.pop() {
                Some(c) => *chunk = c,
                None => unreachable!(),
            }
        }
    }
    Ok(())
}

/// A rel table node group: property columns plus the CSR index of
/// both directions.
pub struct CsrNodeGroup {
    group: NodeGroup,
    directions: [CsrAdjacency; 2],
}

impl CsrNodeGroup {
    pub fn new(columns: Vec<Column>, chunk_capacity: usize) -> Self {
        let mut group = NodeGroup::new(columns, chunk_capacity);
        group.flags |= NodeGroupFlags::CSR;
        CsrNodeGroup {
            group,
            directions: [
                CsrAdjacency::new(CsrDirection::Fwd),
                CsrAdjacency::new(CsrDirection::Bwd),
            ],
        }
    }

    #[inline]
    pub fn group(&self) -> &NodeGroup {
        &self.group
    }

    #[inline]
    pub fn group_mut(&mut self) -> &mut NodeGroup {
        &mut self.group
    }

    /// Nodes indexed in the direction.
    #[inline]
    pub fn num_nodes(&self, direction: CsrDirection) -> usize {
        self.directions[direction.index()].offset_chunk.num_values()
    }

    /// Replaces the direction's index from per-node run lengths.
    pub fn set_adjacency(&mut self, direction: CsrDirection, lengths: &[u32]) -> Result<()> {
        self.directions[direction.index()].set(lengths)
    }

    /// Start row and length of the node's rel run.
    pub fn adjacency(
        &self,
        store: &dyn PageStore,
        direction: CsrDirection,
        node: usize,
    ) -> Result<(u64, u32)> {
        self.directions[direction.index()].range(store, node)
    }

    /// Scans the rel rows bound to the node, deselecting rows the
    /// view cannot see.
    pub fn scan_adjacent(
        &self,
        store: &dyn PageStore,
        view: &TrxView,
        direction: CsrDirection,
        node: usize,
        out: &mut [ValueVector],
        sel: &mut SelectionVector,
    ) -> Result<()> {
        let (start, len) = self.adjacency(store, direction, node)?;
        self.group
            .scan(store, view, start as usize, len as usize, out, sel)
    }

    pub fn checkpoint(&mut self, store: &dyn PageStore, opts: &CheckpointOptions) -> Result<()> {
        self.group.checkpoint(store, opts)?;
        for adj in &mut self.directions {
            if adj.dirty || adj.offset_chunk.metadata().is_none() {
                adj.checkpoint(store)?;
            }
        }
        Ok(())
    }

    /// Drops the buffers of every clean persisted chunk.
    pub fn evict(&mut self) {
        self.group.evict();
        for adj in &mut self.directions {
            if !adj.dirty {
                adj.evict();
            }
        }
    }

    pub fn for_each_chunk<F: FnMut(&str, &ColumnChunk)>(&self, mut f: F) {
        self.group.for_each_chunk(&mut f);
        for adj in &self.directions {
            f(adj.offset_col.name(), &adj.offset_chunk);
            f(adj.length_col.name(), &adj.length_chunk);
        }
    }

    pub fn estimated_memory_usage(&self) -> usize {
        self.group.estimated_memory_usage()
            + self
                .directions
                .iter()
                .map(|a| a.in_mem_size())
                .sum::<usize>()
    }

    pub fn size_on_disk(&self) -> u64 {
        let adjacency: u64 = self.directions.iter().map(|a| a.num_disk_pages()).sum();
        self.group.size_on_disk() + adjacency * PAGE_SIZE as u64
    }

    /// Frees every page owned by the group and its index.
    pub fn reclaim_storage(&mut self, store: &dyn PageStore) {
        self.group.reclaim_storage(store);
        for adj in &mut self.directions {
            let pairs = [
                (&adj.offset_col, &mut adj.offset_chunk),
                (&adj.length_col, &mut adj.length_chunk),
            ];
            for (col, chunk) in pairs {
                let mut runs = Vec::new();
                chunk.collect_page_runs(&mut runs);
                for (page_idx, num_pages) in runs {
                    store.free_pages(page_idx, num_pages as u64);
                }
                *chunk = col.new_chunk(0, false);
            }
        }
    }

    pub fn write_blob(&self) -> Vec<u8> {
        write_blob(self)
    }

    pub fn read_blob(bytes: &[u8]) -> Result<CsrNodeGroup> {
        read_blob(bytes)
    }
}

impl Ser<'_> for CsrNodeGroup {
    fn ser_len(&self) -> usize {
        let mut len = self.group.ser_len();
        for adj in &self.directions {
            len += field_tag_len("cdir");
            len += adj.offset_chunk.ser_len();
            len += adj.length_chunk.ser_len();
        }
        len
    }

    fn ser<S: Serde + ?Sized>(&self, out: &mut S, start_idx: usize) -> usize {
        let mut idx = self.group.ser(out, start_idx);
        for adj in &self.directions {
            idx = ser_field_tag(out, idx, "cdir");
            idx = adj.offset_chunk.ser(out, idx);
            idx = adj.length_chunk.ser(out, idx);
        }
        idx
    }
}

impl Deser for CsrNodeGroup {
    fn deser<S: Serde + ?Sized>(input: &S, start_idx: usize) -> Result<(usize, Self)> {
        let (mut idx, group) = NodeGroup::deser(input, start_idx)?;
        if !group.flags.contains(NodeGroupFlags::CSR) {
            return Err(Error::InvalidFormat);
        }
        let mut directions = Vec::with_capacity(CSR_DIRECTIONS.len());
        for direction in CSR_DIRECTIONS {
            let i = expect_field_tag(input, idx, "cdir")?;
            let (i, offset_chunk) = ColumnChunk::deser(input, i)?;
            let (i, length_chunk) = ColumnChunk::deser(input, i)?;
            if offset_chunk.logical_type() != &LogicalType::UInt64
                || length_chunk.logical_type() != &LogicalType::UInt32
            {
                return Err(Error::InvalidFormat);
            }
            let mut adj = CsrAdjacency::new(direction);
            adj.offset_chunk = offset_chunk;
            adj.length_chunk = length_chunk;
            directions.push(adj);
            idx = i;
        }
        let directions = match directions.try_into() {
            Ok(directions) => directions,
            Err(_) => unreachable!(),
        };
        Ok((idx, CsrNodeGroup { group, directions }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemPageStore;
    use crate::version::MIN_ACTIVE_TRX_ID;

    const TRX_A: u64 = MIN_ACTIVE_TRX_ID + 7;
    const TRX_B: u64 = MIN_ACTIVE_TRX_ID + 8;

    fn rel_columns() -> Vec<Column> {
        vec![Column::new("score", &LogicalType::Int64, true)]
    }

    fn rel_rows(values: &[i64]) -> Vec<ValueVector> {
        let mut scores = ValueVector::new(&LogicalType::Int64);
        scores.set_len(values.len());
        for (i, v) in values.iter().enumerate() {
            scores.set_i64(i, *v);
        }
        vec![scores]
    }

    /// Three nodes with runs of 2, 0 and 3 rel rows.
    fn sample_group() -> CsrNodeGroup {
        let mut csr = CsrNodeGroup::new(rel_columns(), 64);
        csr.group_mut()
            .append(TRX_A, &rel_rows(&[10, 11, 20, 21, 22]), 0, 5)
            .unwrap();
        csr.group_mut().commit_append(0, 5, 30);
        csr.set_adjacency(CsrDirection::Fwd, &[2, 0, 3]).unwrap();
        csr.set_adjacency(CsrDirection::Bwd, &[0, 5, 0]).unwrap();
        csr
    }

    fn scan_node(
        store: &MemPageStore,
        csr: &CsrNodeGroup,
        direction: CsrDirection,
        node: usize,
    ) -> (ValueVector, SelectionVector) {
        let mut out = vec![ValueVector::new(&LogicalType::Int64)];
        let mut sel = SelectionVector::all(0);
        csr.scan_adjacent(store, &TrxView::new(30, TRX_B), direction, node, &mut out, &mut sel)
            .unwrap();
        let scores = match out.pop() {
            Some(v) => v,
            None => unreachable!(),
        };
        (scores, sel)
    }

    #[test]
    fn test_adjacency_ranges() {
        let store = MemPageStore::new(1, 16);
        let csr = sample_group();
        assert_eq!(csr.num_nodes(CsrDirection::Fwd), 3);
        assert_eq!(csr.num_nodes(CsrDirection::Bwd), 3);
        assert_eq!(csr.adjacency(&store, CsrDirection::Fwd, 0).unwrap(), (0, 2));
        assert_eq!(csr.adjacency(&store, CsrDirection::Fwd, 1).unwrap(), (2, 0));
        assert_eq!(csr.adjacency(&store, CsrDirection::Fwd, 2).unwrap(), (2, 3));
        assert_eq!(csr.adjacency(&store, CsrDirection::Bwd, 1).unwrap(), (0, 5));
        assert!(matches!(
            csr.adjacency(&store, CsrDirection::Fwd, 3),
            Err(Error::IndexOutOfBound)
        ));

        let (scores, sel) = scan_node(&store, &csr, CsrDirection::Fwd, 2);
        assert_eq!(sel.num_selected(), 3);
        assert_eq!(scores.get_i64(0), 20);
        assert_eq!(scores.get_i64(2), 22);

        // an isolated node has an empty, still addressable run.
        let (_, sel) = scan_node(&store, &csr, CsrDirection::Fwd, 1);
        assert_eq!(sel.num_selected(), 0);
    }

    #[test]
    fn test_csr_checkpoint_and_disk_adjacency() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = MemPageStore::new(4, 32);
        let mut csr = sample_group();
        let opts = CheckpointOptions {
            can_split: false,
            split_rows: 2048,
        };
        csr.checkpoint(&store, &opts).unwrap();
        csr.evict();
        assert_eq!(csr.estimated_memory_usage(), 0);
        assert_eq!(
            store.allocated_pages(),
            csr.size_on_disk() / PAGE_SIZE as u64
        );

        // adjacency lookups and scans now run against the store.
        assert_eq!(csr.adjacency(&store, CsrDirection::Fwd, 2).unwrap(), (2, 3));
        let (scores, sel) = scan_node(&store, &csr, CsrDirection::Fwd, 0);
        assert_eq!(sel.num_selected(), 2);
        assert_eq!(scores.get_i64(1), 11);

        // growing the graph rewrites the index at the next checkpoint.
        csr.group_mut()
            .append(TRX_B, &rel_rows(&[30]), 0, 1)
            .unwrap();
        csr.group_mut().commit_append(5, 1, 40);
        csr.set_adjacency(CsrDirection::Fwd, &[2, 0, 3, 1]).unwrap();
        csr.set_adjacency(CsrDirection::Bwd, &[0, 5, 0, 1]).unwrap();
        csr.checkpoint(&store, &opts).unwrap();
        csr.evict();
        assert_eq!(csr.num_nodes(CsrDirection::Fwd), 4);
        assert_eq!(csr.adjacency(&store, CsrDirection::Fwd, 3).unwrap(), (5, 1));
        assert_eq!(
            store.allocated_pages(),
            csr.size_on_disk() / PAGE_SIZE as u64
        );
    }

    #[test]
    fn test_csr_blob_roundtrip() {
        let store = MemPageStore::new(4, 32);
        let mut csr = sample_group();
        let opts = CheckpointOptions {
            can_split: false,
            split_rows: 2048,
        };
        csr.checkpoint(&store, &opts).unwrap();

        let blob = csr.write_blob();
        let restored = CsrNodeGroup::read_blob(&blob).unwrap();
        assert_eq!(restored.group().num_rows(), 5);
        assert_eq!(restored.num_nodes(CsrDirection::Fwd), 3);
        assert_eq!(
            restored.adjacency(&store, CsrDirection::Fwd, 2).unwrap(),
            (2, 3)
        );
        let (scores, sel) = scan_node(&store, &restored, CsrDirection::Fwd, 2);
        assert_eq!(sel.num_selected(), 3);
        assert_eq!(scores.get_i64(1), 21);

        // a CSR blob is not a plain node group and vice versa.
        assert!(matches!(
            NodeGroup::read_blob(&blob),
            Err(Error::InvalidFormat)
        ));
        let mut plain = NodeGroup::new(rel_columns(), 64);
        plain
            .append(TRX_A, &rel_rows(&[1]), 0, 1)
            .unwrap();
        plain.commit_append(0, 1, 30);
        plain.checkpoint(&store, &opts).unwrap();
        assert!(matches!(
            CsrNodeGroup::read_blob(&plain.write_blob()),
            Err(Error::InvalidFormat)
        ));
    }
}
