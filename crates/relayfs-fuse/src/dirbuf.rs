//! Directory listing buffer.
//!
//! Entries are packed in the kernel's `fuse_dirent` / `fuse_direntplus`
//! format. A buffer is created per readdir resolution and never shared.

use crate::attr::{CanonicalAttr, PlatformAttr};
use crate::error::{BridgeError, Result};
use crate::op::NAME_MAX;
use crate::wire::{
    dirent_len, direntplus_len, AttrLayout, Cursor, DirentHeader, EntryOut, WireAttr, DT_UNKNOWN,
    FUSE_UNKNOWN_INO,
};
use std::time::Duration;

const INITIAL_CAPACITY: usize = 512;

/// Record format of a directory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentLayout {
    /// `fuse_dirent` records, for readdir.
    Plain,
    /// `fuse_direntplus` records, for readdirplus.
    Plus,
}

/// Append-only packed directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirBuffer {
    layout: DirentLayout,
    attr_layout: AttrLayout,
    max_size: usize,
    entry_ttl: Duration,
    start: i64,
    count: usize,
    buf: Vec<u8>,
}

impl DirBuffer {
    pub fn new(layout: DirentLayout, max_size: usize, entry_ttl: Duration) -> Self {
        DirBuffer::with_attr_layout(layout, AttrLayout::native(), max_size, entry_ttl)
    }

    pub fn with_attr_layout(
        layout: DirentLayout,
        attr_layout: AttrLayout,
        max_size: usize,
        entry_ttl: Duration,
    ) -> Self {
        DirBuffer {
            layout,
            attr_layout,
            max_size,
            entry_ttl,
            start: 0,
            count: 0,
            buf: Vec::new(),
        }
    }

    /// Sets the directory offset of the first entry. The i-th appended
    /// entry (from zero) is reported at offset `start + i + 1`.
    pub fn start_at(mut self, offset: i64) -> Self {
        self.start = offset;
        self
    }

    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Clears the contents but keeps the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.count = 0;
    }

    /// Appends one entry. Returns `Ok(false)` when the entry does not fit in
    /// the remaining budget; the buffer is left unchanged in that case.
    pub fn append(&mut self, name: &[u8], attr: Option<&CanonicalAttr>) -> Result<bool> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(BridgeError::malformed(
                self.kind_name(),
                format!("entry name of {} bytes", name.len()),
            ));
        }
        if self.layout == DirentLayout::Plus && attr.is_none() {
            return Err(BridgeError::malformed(
                "readdirplus",
                "entry without attributes",
            ));
        }
        let needed = match self.layout {
            DirentLayout::Plain => dirent_len(name.len()),
            DirentLayout::Plus => direntplus_len(self.attr_layout, name.len()),
        };
        if self.buf.len() + needed > self.max_size {
            return Ok(false);
        }

        let wire = attr.map(WireAttr::from_canonical).transpose()?;
        let off = self.start.saturating_add(self.count as i64 + 1);
        let header = DirentHeader {
            ino: wire.map_or(FUSE_UNKNOWN_INO, |a| a.ino),
            off: off as u64,
            namelen: name.len() as u32,
            typ: attr.map_or(DT_UNKNOWN, CanonicalAttr::dirent_type),
        };

        self.grow(needed);
        if let (DirentLayout::Plus, Some(wire)) = (self.layout, wire) {
            let secs = self.entry_ttl.as_secs();
            let nsec = self.entry_ttl.subsec_nanos();
            EntryOut {
                nodeid: wire.ino,
                generation: 0,
                entry_valid: secs,
                attr_valid: secs,
                entry_valid_nsec: nsec,
                attr_valid_nsec: nsec,
                attr: wire,
            }
            .encode(self.attr_layout, &mut self.buf);
        }
        header.encode_with_name(name, &mut self.buf);
        self.count += 1;
        Ok(true)
    }

    fn grow(&mut self, needed: usize) {
        let want = self.buf.len() + needed;
        if want <= self.buf.capacity() {
            return;
        }
        let target = want.max(self.buf.capacity() * 2).max(INITIAL_CAPACITY);
        self.buf.reserve_exact(target - self.buf.len());
    }

    fn kind_name(&self) -> &'static str {
        match self.layout {
            DirentLayout::Plain => "readdir",
            DirentLayout::Plus => "readdirplus",
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.count
    }

    pub fn entries(&self) -> DirEntries<'_> {
        DirEntries {
            layout: self.layout,
            attr_layout: self.attr_layout,
            cur: Cursor::new(&self.buf),
        }
    }
}

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub ino: u64,
    pub offset: i64,
    pub typ: u32,
    pub name: &'a [u8],
    /// Present for the plus layout only.
    pub attr: Option<WireAttr>,
    pub generation: u64,
}

impl DirEntry<'_> {
    pub fn file_type(&self) -> fuser::FileType {
        crate::attr::file_type_from_mode(self.typ << 12).unwrap_or(fuser::FileType::RegularFile)
    }
}

pub struct DirEntries<'a> {
    layout: DirentLayout,
    attr_layout: AttrLayout,
    cur: Cursor<'a>,
}

impl<'a> DirEntries<'a> {
    fn decode_next(&mut self) -> Result<DirEntry<'a>> {
        let entry_out = match self.layout {
            DirentLayout::Plain => None,
            DirentLayout::Plus => Some(EntryOut::decode(self.attr_layout, &mut self.cur)?),
        };
        let (header, name) = DirentHeader::decode_with_name(&mut self.cur)?;
        Ok(DirEntry {
            ino: header.ino,
            offset: header.off as i64,
            typ: header.typ,
            name,
            attr: entry_out.map(|e| e.attr),
            generation: entry_out.map_or(0, |e| e.generation),
        })
    }
}

impl<'a> Iterator for DirEntries<'a> {
    type Item = Result<DirEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_empty() {
            return None;
        }
        let item = self.decode_next();
        if item.is_err() {
            // A broken record poisons the rest of the buffer.
            self.cur = Cursor::new(&[]);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{S_IFDIR, S_IFREG};

    fn attr(ino: u64, mode: u32) -> CanonicalAttr {
        CanonicalAttr {
            ino,
            mode,
            nlink: 1,
            ..CanonicalAttr::default()
        }
    }

    fn names(buf: &DirBuffer) -> Vec<Vec<u8>> {
        buf.entries()
            .map(|e| e.unwrap().name.to_vec())
            .collect()
    }

    #[test]
    fn test_plain_entries_decode_in_order() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 4096, Duration::from_secs(1));
        for name in ["a", "bb", "ccc"] {
            assert!(buf.append(name.as_bytes(), None).unwrap());
        }
        assert_eq!(names(&buf), vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
        assert_eq!(buf.len(), 3 * 32);
    }

    #[test]
    fn test_offsets_follow_start() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 4096, Duration::from_secs(1)).start_at(5);
        buf.append(b"x", None).unwrap();
        buf.append(b"y", None).unwrap();
        let offsets: Vec<i64> = buf.entries().map(|e| e.unwrap().offset).collect();
        assert_eq!(offsets, vec![6, 7]);
    }

    #[test]
    fn test_missing_attr_uses_unknown_ino_and_type() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 4096, Duration::from_secs(1));
        buf.append(b"x", None).unwrap();
        let entry = buf.entries().next().unwrap().unwrap();
        assert_eq!(entry.ino, FUSE_UNKNOWN_INO);
        assert_eq!(entry.typ, DT_UNKNOWN);
        assert_eq!(entry.file_type(), fuser::FileType::RegularFile);
    }

    #[test]
    fn test_attr_sets_ino_and_type() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 4096, Duration::from_secs(1));
        buf.append(b"sub", Some(&attr(12, S_IFDIR | 0o755))).unwrap();
        let entry = buf.entries().next().unwrap().unwrap();
        assert_eq!(entry.ino, 12);
        assert_eq!(entry.file_type(), fuser::FileType::Directory);
    }

    #[test]
    fn test_append_stops_at_budget() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 64, Duration::from_secs(1));
        assert!(buf.append(b"one", None).unwrap());
        assert!(buf.append(b"two", None).unwrap());
        assert!(!buf.append(b"three", None).unwrap());
        assert_eq!(buf.entry_count(), 2);
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_reset_clears_entries() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 4096, Duration::from_secs(1));
        buf.append(b"a", None).unwrap();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.entries().count(), 0);
        buf.append(b"b", None).unwrap();
        assert_eq!(buf.entries().next().unwrap().unwrap().offset, 1);
    }

    #[test]
    fn test_plus_layout_carries_attributes() {
        let mut buf = DirBuffer::with_attr_layout(
            DirentLayout::Plus,
            AttrLayout::Linux,
            4096,
            Duration::from_secs(1),
        );
        buf.append(b"file", Some(&attr(7, S_IFREG | 0o644))).unwrap();
        assert_eq!(buf.len(), 128 + 32);
        let entry = buf.entries().next().unwrap().unwrap();
        assert_eq!(entry.ino, 7);
        assert_eq!(entry.attr.unwrap().mode, S_IFREG | 0o644);
    }

    #[test]
    fn test_plus_layout_requires_attributes() {
        let mut buf = DirBuffer::new(DirentLayout::Plus, 4096, Duration::from_secs(1));
        let err = buf.append(b"file", None).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedReply { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_empty_and_oversized_names() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 1 << 20, Duration::from_secs(1));
        assert!(buf.append(b"", None).is_err());
        assert!(buf.append(&[b'n'; NAME_MAX + 1], None).is_err());
        assert!(buf.append(&[b'n'; NAME_MAX], None).unwrap());
    }

    #[test]
    fn test_growth_keeps_contents() {
        let mut buf = DirBuffer::new(DirentLayout::Plain, 1 << 20, Duration::from_secs(1));
        for i in 0..500 {
            let name = format!("entry-{}", i);
            assert!(buf.append(name.as_bytes(), None).unwrap());
        }
        assert_eq!(buf.entries().count(), 500);
        let last = buf.entries().last().unwrap().unwrap();
        assert_eq!(last.name, b"entry-499");
    }
}
