//! Hierarchical subsets inside an ordered store.
//!
//! A `(set, member)` pair is encoded as the concatenation of length-prefixed
//! segments: each segment is its big-endian u32 byte count followed by the
//! raw bytes. The length prefix is part of the key, so comparing against an
//! encoded set name prefix is unambiguous, and every record whose key begins
//! with that prefix belongs to exactly that set.

use std::io::Cursor;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use crate::codec::{Codec, Typed};
use crate::error::{CResult, Error};
use crate::storage::ordered::{OrderedEach, OrderedStore};
use crate::storage::store::Store;

/// Builds a composite key from length-prefixed segments. An empty segment is
/// legal; it encodes as a bare zero length word.
pub fn encode_key(segments: &[&[u8]]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(segments.iter().map(|s| 4 + s.len()).sum());
    for segment in segments {
        buf.put_u32(segment.len() as u32);
        buf.put_slice(segment);
    }
    buf.to_vec()
}

/// Splits the leading length-prefixed segment off a composite key, returning
/// the segment bytes and the remainder.
pub fn split_segment(key: &[u8]) -> CResult<(&[u8], &[u8])> {
    let mut cursor = Cursor::new(key);
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::Corrupt("composite key shorter than its length prefix".to_string()))?
        as usize;
    let rest = &key[4..];
    if rest.len() < len {
        return Err(Error::Corrupt(format!(
            "composite key segment of {len} bytes extends past the key"
        )));
    }
    Ok((&rest[..len], &rest[len..]))
}

/// The lexicographic successor of a prefix: the shortest byte string greater
/// than every key starting with it, formed by byte-incrementing. `None` when
/// every byte is 0xff, in which case nothing can follow.
pub fn successor(prefix: &[u8]) -> Option<Vec<u8>> {
    prefix.iter().rposition(|b| *b != 0xff).map(|i| {
        prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect()
    })
}

impl OrderedStore {
    /// Reads a member record inside a set.
    pub fn sub_get(&self, set: &[u8], member: &[u8]) -> CResult<Vec<u8>> {
        self.get(&encode_key(&[set, member]))
    }

    /// Writes a member record inside a set.
    pub fn sub_set(&self, set: &[u8], member: &[u8], value: &[u8]) -> CResult<()> {
        self.set(&encode_key(&[set, member]), value, true)
    }

    /// Deletes a member record inside a set.
    pub fn sub_del(&self, set: &[u8], member: &[u8]) -> CResult<()> {
        self.del(&encode_key(&[set, member]))
    }

    /// Counts the members of a set by scanning its prefix range.
    pub fn sub_count(&self, set: &[u8]) -> CResult<u64> {
        let mut count = 0;
        for row in self.sub_each(set)? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    /// A cursor over the members of one set, in member order. Positions at
    /// the encoded set prefix and stops at the first key outside it.
    pub fn sub_each(&self, set: &[u8]) -> CResult<SubEach<'_>> {
        let prefix = encode_key(&[set]);
        let mut cursor = self.each()?;
        cursor.jump(&prefix);
        Ok(SubEach { cursor, prefix })
    }

    /// A cursor over the distinct set names in the store. Reads one key per
    /// set and then jumps past the whole set by byte-incrementing its
    /// length-prefixed name, so N members across K sets cost K+1 cursor
    /// positionings.
    pub fn each_set(&self) -> CResult<SetNames<'_>> {
        Ok(SetNames { cursor: self.each()?, done: false })
    }
}

/// Cursor over `(member, value)` pairs of one set.
pub struct SubEach<'a> {
    cursor: OrderedEach<'a>,
    prefix: Vec<u8>,
}

impl<'a> Iterator for SubEach<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let member = {
            let key = self.cursor.peek_key()?;
            if !key.starts_with(&self.prefix) {
                return None;
            }
            split_segment(&key[self.prefix.len()..]).map(|(member, _)| member.to_vec())
        };
        let value = match self.cursor.next()? {
            Ok((_, value)) => value,
            Err(err) => return Some(Err(err)),
        };
        Some(member.map(|member| (member, value)))
    }
}

/// Cursor over distinct set names.
pub struct SetNames<'a> {
    cursor: OrderedEach<'a>,
    done: bool,
}

impl<'a> SetNames<'a> {
    /// How many cursor jumps this iteration has performed.
    pub fn jumps(&self) -> usize {
        self.cursor.jumps
    }
}

impl<'a> Iterator for SetNames<'a> {
    type Item = CResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (name, prefix) = {
            let key = self.cursor.peek_key()?;
            match split_segment(key) {
                Ok((name, _)) => (name.to_vec(), key[..4 + name.len()].to_vec()),
                Err(err) => {
                    // A malformed key would stall the cursor; end the
                    // iteration with the error.
                    self.done = true;
                    return Some(Err(err));
                }
            }
        };
        // Seek past every remaining key of this set in one jump.
        match successor(&prefix) {
            Some(next) => self.cursor.jump(&next),
            None => self.done = true,
        }
        Some(Ok(name))
    }
}

impl<C: Codec> Typed<OrderedStore, C> {
    /// Reads and decodes a member record inside a set.
    pub fn sub_get(&self, set: &[u8], member: &[u8]) -> CResult<C::Value> {
        self.codec().decode(&self.store().sub_get(set, member)?)
    }

    /// Encodes and writes a member record inside a set.
    pub fn sub_set(&self, set: &[u8], member: &[u8], value: &C::Value) -> CResult<()> {
        self.store().sub_set(set, member, &self.codec().to_bytes(value)?)
    }

    /// Deletes a member record inside a set.
    pub fn sub_del(&self, set: &[u8], member: &[u8]) -> CResult<()> {
        self.store().sub_del(set, member)
    }

    /// Counts the members of a set.
    pub fn sub_count(&self, set: &[u8]) -> CResult<u64> {
        self.store().sub_count(set)
    }

    /// A typed cursor over the members of one set. A member that fails to
    /// decode yields a `Corrupt` item; the cursor continues.
    pub fn sub_each(&self, set: &[u8]) -> CResult<TypedSubEach<'_, C>> {
        Ok(TypedSubEach { inner: self.store().sub_each(set)?, codec: self.codec() })
    }

    /// A cursor over the distinct set names in the store.
    pub fn each_set(&self) -> CResult<SetNames<'_>> {
        self.store().each_set()
    }
}

/// Typed cursor over `(member, value)` pairs of one set.
pub struct TypedSubEach<'a, C> {
    inner: SubEach<'a>,
    codec: &'a C,
}

impl<'a, C: Codec> Iterator for TypedSubEach<'a, C> {
    type Item = CResult<(Vec<u8>, C::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok((member, bytes)) => Some(self.codec.decode(&bytes).map(|value| (member, value))),
            Err(err) => Some(Err(err)),
        }
    }
}
