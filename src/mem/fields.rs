//! Key/value store over a backing [`ChunkBuffer`].
//!
//! Entries reference the storage by offset, never by pointer, so the
//! buffer may keep growing while the map exists. Rebuilding the map from
//! the same storage is idempotent.

use crate::mem::buffer::ChunkBuffer;

/// Headers allowed to appear more than once.
const MULTI_VALUED: &[&[u8]] = &[b"Set-Cookie"];

#[inline]
pub(crate) fn is_multi_valued(key: &[u8]) -> bool {
    MULTI_VALUED.iter().any(|k| k.eq_ignore_ascii_case(key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slice {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldEntry {
    pub key: Slice,
    /// `None` encodes a key with no separator; it reads as `b"true"`.
    pub value: Option<Slice>,
}

/// Ordered list of `(key, value)` slices into a storage buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FieldMap {
    entries: Vec<FieldEntry>,
}

impl FieldMap {
    /// Rebuilds the map from `storage`, treating `sep` as the key/value
    /// separator and `field_sep` as the record separator.
    ///
    /// `\r` never lands in a key or value and also terminates a record,
    /// so `"K: V\r\nK2: V2\r\n"` parsed with `(b':', b'\n')` yields one
    /// entry per header line. Leading spaces of keys and values are
    /// skipped. A record with no separator becomes a `true`-valued key.
    ///
    /// Returns the number of records found.
    pub(crate) fn fill(&mut self, storage: &ChunkBuffer, sep: u8, field_sep: u8) -> usize {
        self.entries.clear();
        let data = storage.as_slice();

        let mut key: Option<usize> = None;
        let mut key_len = 0usize;
        let mut value: Option<usize> = None;

        for (i, &b) in data.iter().enumerate() {
            if key.is_none() && b > 0x20 && b < 0x7f && b != sep && b != field_sep {
                key = Some(i);
            }
            if b == sep && key.is_some() && value.is_none() {
                key_len = i - key.unwrap();
                let mut at = i + 1;
                while data.get(at) == Some(&b' ') {
                    at += 1;
                }
                value = Some(at);
            } else if b == field_sep || b == b'\r' {
                self.push_record(key, key_len, value, i);
                key = None;
                key_len = 0;
                value = None;
            }
        }
        self.push_record(key, key_len, value, data.len());
        self.entries.len()
    }

    fn push_record(
        &mut self,
        key: Option<usize>,
        mut key_len: usize,
        value: Option<usize>,
        end: usize,
    ) {
        let Some(key) = key else { return };
        if key_len == 0 {
            key_len = end - key;
        }
        // a separator right before the record end gives an empty value,
        // which still counts as present
        let value = value.map(|at| Slice {
            offset: at,
            len: end.saturating_sub(at),
        });
        self.entries.push(FieldEntry {
            key: Slice {
                offset: key,
                len: key_len,
            },
            value,
        });
    }

    /// First value stored under `key`, case-insensitively.
    pub(crate) fn get<'a>(&self, storage: &'a ChunkBuffer, key: &[u8]) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|e| storage.slice(e.key.offset, e.key.len).eq_ignore_ascii_case(key))
            .map(|e| Self::value_bytes(storage, e))
    }

    pub(crate) fn contains_key(&self, storage: &ChunkBuffer, key: &[u8]) -> bool {
        self.get(storage, key).is_some()
    }

    pub(crate) fn iter<'a>(
        &'a self,
        storage: &'a ChunkBuffer,
    ) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.entries.iter().map(move |e| {
            (
                storage.slice(e.key.offset, e.key.len),
                Self::value_bytes(storage, e),
            )
        })
    }

    #[inline]
    fn value_bytes<'a>(storage: &'a ChunkBuffer, entry: &FieldEntry) -> &'a [u8] {
        match entry.value {
            Some(v) => storage.slice(v.offset, v.len),
            None => b"true",
        }
    }

    /// Re-emits the records with the requested separators, the inverse of
    /// [`fill`](Self::fill) for storage that was produced from a
    /// serialized map.
    pub(crate) fn serialize(
        &self,
        storage: &ChunkBuffer,
        sep: u8,
        field_sep: u8,
        out: &mut Vec<u8>,
    ) {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(field_sep);
            }
            out.extend_from_slice(storage.slice(entry.key.offset, entry.key.len));
            if let Some(v) = entry.value {
                out.push(sep);
                out.extend_from_slice(storage.slice(v.offset, v.len));
            }
        }
    }
}

#[cfg(test)]
mod fields_tests {
    use super::*;
    use crate::limits::DEFAULT_CHUNK_SIZE;

    fn storage(bytes: &[u8]) -> ChunkBuffer {
        let mut b = ChunkBuffer::unbounded("test", DEFAULT_CHUNK_SIZE);
        b.append(bytes).unwrap();
        b
    }

    #[test]
    fn fill_query_form() {
        #[rustfmt::skip]
        let cases: &[(&[u8], &[(&[u8], &[u8])])] = &[
            (b"a=1&b=2",        &[(b"a", b"1"), (b"b", b"2")]),
            (b"debug&name=x",   &[(b"debug", b"true"), (b"name", b"x")]),
            (b"k=",             &[(b"k", b"")]),
            (b"k=v=w",          &[(b"k", b"v=w")]),
            (b"",               &[]),
        ];

        for (input, expected) in cases {
            let s = storage(input);
            let mut map = FieldMap::default();
            let count = map.fill(&s, b'=', b'&');

            assert_eq!(count, expected.len(), "input {:?}", input);
            for (key, value) in *expected {
                assert_eq!(map.get(&s, key), Some(*value), "key {:?}", key);
            }
        }
    }

    #[test]
    fn fill_header_lines() {
        let s = storage(b"Host: example\r\nAccept: */*\r\nFlag\r\n");
        let mut map = FieldMap::default();
        assert_eq!(map.fill(&s, b':', b'\n'), 3);

        assert_eq!(map.get(&s, b"host"), Some(b"example" as &[u8]));
        assert_eq!(map.get(&s, b"ACCEPT"), Some(b"*/*" as &[u8]));
        assert_eq!(map.get(&s, b"flag"), Some(b"true" as &[u8]));
        assert_eq!(map.get(&s, b"missing"), None);
    }

    #[test]
    fn fill_is_idempotent() {
        let s = storage(b"a=1&b=2");
        let mut map = FieldMap::default();
        map.fill(&s, b'=', b'&');
        let first = map.clone();
        map.fill(&s, b'=', b'&');
        assert_eq!(first, map);
    }

    #[test]
    fn serialize_round_trips() {
        let cases: &[&[u8]] = &[b"a=1&b=2", b"k=v", b"single=", b"x=1&y=2&z=3"];

        for input in cases {
            let s = storage(input);
            let mut map = FieldMap::default();
            map.fill(&s, b'=', b'&');

            let mut out = Vec::new();
            map.serialize(&s, b'=', b'&', &mut out);
            assert_eq!(&out, input);
        }
    }

    #[test]
    fn duplicate_cookie_headers_all_kept() {
        let s = storage(b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n");
        let mut map = FieldMap::default();
        assert_eq!(map.fill(&s, b':', b'\n'), 2);
        let values = map
            .iter(&s)
            .filter(|(k, _)| k.eq_ignore_ascii_case(b"set-cookie"))
            .count();
        assert_eq!(values, 2);
        assert!(is_multi_valued(b"set-cookie"));
        assert!(!is_multi_valued(b"content-type"));
    }
}
