//! Hash-consed blob dictionary backing string chunks.
//!
//! Entries are immutable once added. Identical byte strings intern to
//! the same id, so repeated values cost one blob entry plus one index
//! slot per referencing row.

use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::mem;

pub struct DictionaryChunk {
    /// Concatenated entry bytes.
    blob: Vec<u8>,
    /// End offset of each entry within the blob.
    offsets: Vec<u64>,
    /// Content hash to candidate entry ids.
    index: HashMap<u64, SmallVec<[u32; 2]>>,
}

impl DictionaryChunk {
    pub fn new() -> Self {
        DictionaryChunk {
            blob: Vec::new(),
            offsets: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuilds a dictionary from its persisted parts.
    pub fn from_parts(blob: Vec<u8>, offsets: Vec<u64>) -> Self {
        let mut index: HashMap<u64, SmallVec<[u32; 2]>> = HashMap::new();
        for id in 0..offsets.len() as u32 {
            let hash = content_hash(entry_slice(&blob, &offsets, id));
            index.entry(hash).or_default().push(id);
        }
        DictionaryChunk {
            blob,
            offsets,
            index,
        }
    }

    #[inline]
    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub fn blob_len(&self) -> usize {
        self.blob.len()
    }

    #[inline]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    #[inline]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    #[inline]
    pub fn entry(&self, id: u32) -> &[u8] {
        entry_slice(&self.blob, &self.offsets, id)
    }

    /// Interns a byte string, returning the id of an existing equal
    /// entry or of a freshly appended one.
    pub fn add(&mut self, bytes: &[u8]) -> u32 {
        let hash = content_hash(bytes);
        if let Some(candidates) = self.index.get(&hash) {
            for &id in candidates {
                if entry_slice(&self.blob, &self.offsets, id) == bytes {
                    return id;
                }
            }
        }
        let id = self.offsets.len() as u32;
        self.blob.extend_from_slice(bytes);
        self.offsets.push(self.blob.len() as u64);
        self.index.entry(hash).or_default().push(id);
        id
    }

    pub fn clear(&mut self) {
        self.blob.clear();
        self.offsets.clear();
        self.index.clear();
    }

    #[inline]
    pub fn in_mem_size(&self) -> usize {
        self.blob.len() + self.offsets.len() * mem::size_of::<u64>()
    }
}

#[inline]
fn entry_slice<'a>(blob: &'a [u8], offsets: &[u64], id: u32) -> &'a [u8] {
    let start = if id == 0 {
        0
    } else {
        offsets[id as usize - 1] as usize
    };
    &blob[start..offsets[id as usize] as usize]
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_interning() {
        let mut dict = DictionaryChunk::new();
        let a = dict.add(b"foo");
        let b = dict.add(b"bar");
        let c = dict.add(b"foo");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, a);
        assert_eq!(dict.num_entries(), 2);
        assert_eq!(dict.blob_len(), 6);
        assert_eq!(dict.entry(0), b"foo");
        assert_eq!(dict.entry(1), b"bar");
    }

    #[test]
    fn test_dictionary_empty_entry() {
        let mut dict = DictionaryChunk::new();
        let a = dict.add(b"");
        let b = dict.add(b"x");
        let c = dict.add(b"");
        assert_eq!(a, c);
        assert_eq!(dict.entry(a), b"");
        assert_eq!(dict.entry(b), b"x");
    }

    #[test]
    fn test_dictionary_from_parts() {
        let mut dict = DictionaryChunk::new();
        dict.add(b"north");
        dict.add(b"south");
        dict.add(b"east");
        let rebuilt = DictionaryChunk::from_parts(dict.blob().to_vec(), dict.offsets().to_vec());
        assert_eq!(rebuilt.num_entries(), 3);
        assert_eq!(rebuilt.entry(1), b"south");

        let mut rebuilt = rebuilt;
        assert_eq!(rebuilt.add(b"south"), 1);
        assert_eq!(rebuilt.add(b"west"), 3);
    }
}
