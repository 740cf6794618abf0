//! FUSE ABI record layouts.
//!
//! Only the records that the bridge itself serializes are described here:
//! `fuse_attr`, `fuse_entry_out` and the `fuse_dirent` header. They are the
//! building blocks of readdir and readdirplus buffers. All integers are
//! written in native byte order, matching what the kernel reads from
//! `/dev/fuse`.

use crate::error::{BridgeError, Result};
use bytes::{Buf, BufMut};

/// Inode number reported for directory entries whose inode is not known.
pub const FUSE_UNKNOWN_INO: u64 = 0xffff_ffff;

/// `d_type` value for an entry of unknown type.
pub const DT_UNKNOWN: u32 = 0;

/// Size of the fixed part of `fuse_dirent` (ino, off, namelen, type).
pub const DIRENT_HEADER_LEN: usize = 24;

/// Size of `fuse_entry_out` minus the embedded `fuse_attr`.
const ENTRY_OUT_HEADER_LEN: usize = 40;

/// Platform layout of `fuse_attr`.
///
/// Darwin inserts `crtime`, `crtimensec` and `flags` into the record, which
/// shifts every field after `ctime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrLayout {
    /// 88-byte record used by Linux and the BSDs.
    Linux,
    /// 104-byte record used by macFUSE.
    Darwin,
}

impl AttrLayout {
    /// Layout of the platform this crate was built for.
    pub const fn native() -> Self {
        if cfg!(target_os = "macos") {
            AttrLayout::Darwin
        } else {
            AttrLayout::Linux
        }
    }

    /// Encoded size of `fuse_attr`.
    pub const fn attr_len(self) -> usize {
        match self {
            AttrLayout::Linux => 88,
            AttrLayout::Darwin => 104,
        }
    }

    /// Encoded size of `fuse_entry_out`.
    pub const fn entry_out_len(self) -> usize {
        ENTRY_OUT_HEADER_LEN + self.attr_len()
    }
}

impl Default for AttrLayout {
    fn default() -> Self {
        AttrLayout::native()
    }
}

/// Rounds `len` up to the 8-byte record alignment used in directory buffers.
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Encoded length of a `fuse_dirent` carrying a name of `namelen` bytes.
pub const fn dirent_len(namelen: usize) -> usize {
    align8(DIRENT_HEADER_LEN + namelen)
}

/// Encoded length of a `fuse_direntplus` carrying a name of `namelen` bytes.
pub const fn direntplus_len(layout: AttrLayout, namelen: usize) -> usize {
    layout.entry_out_len() + dirent_len(namelen)
}

/// The `fuse_attr` record as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub crtimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub flags: u32,
    pub blksize: u32,
}

impl WireAttr {
    /// Appends the record to `out`. Darwin-only fields are skipped for the
    /// Linux layout.
    pub fn encode(&self, layout: AttrLayout, out: &mut Vec<u8>) {
        let darwin = layout == AttrLayout::Darwin;
        out.put_u64_ne(self.ino);
        out.put_u64_ne(self.size);
        out.put_u64_ne(self.blocks);
        out.put_i64_ne(self.atime);
        out.put_i64_ne(self.mtime);
        out.put_i64_ne(self.ctime);
        if darwin {
            out.put_i64_ne(self.crtime);
        }
        out.put_u32_ne(self.atimensec);
        out.put_u32_ne(self.mtimensec);
        out.put_u32_ne(self.ctimensec);
        if darwin {
            out.put_u32_ne(self.crtimensec);
        }
        out.put_u32_ne(self.mode);
        out.put_u32_ne(self.nlink);
        out.put_u32_ne(self.uid);
        out.put_u32_ne(self.gid);
        out.put_u32_ne(self.rdev);
        if darwin {
            out.put_u32_ne(self.flags);
        }
        out.put_u32_ne(self.blksize);
        out.put_u32_ne(0);
    }

    /// Reads a record previously written with [`WireAttr::encode`].
    pub fn decode(layout: AttrLayout, cur: &mut Cursor<'_>) -> Result<Self> {
        let darwin = layout == AttrLayout::Darwin;
        let mut attr = WireAttr {
            ino: cur.u64()?,
            size: cur.u64()?,
            blocks: cur.u64()?,
            atime: cur.i64()?,
            mtime: cur.i64()?,
            ctime: cur.i64()?,
            ..WireAttr::default()
        };
        if darwin {
            attr.crtime = cur.i64()?;
        }
        attr.atimensec = cur.u32()?;
        attr.mtimensec = cur.u32()?;
        attr.ctimensec = cur.u32()?;
        if darwin {
            attr.crtimensec = cur.u32()?;
        }
        attr.mode = cur.u32()?;
        attr.nlink = cur.u32()?;
        attr.uid = cur.u32()?;
        attr.gid = cur.u32()?;
        attr.rdev = cur.u32()?;
        if darwin {
            attr.flags = cur.u32()?;
        }
        attr.blksize = cur.u32()?;
        cur.skip(4)?;
        Ok(attr)
    }
}

/// The `fuse_entry_out` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: WireAttr,
}

impl EntryOut {
    pub fn encode(&self, layout: AttrLayout, out: &mut Vec<u8>) {
        out.put_u64_ne(self.nodeid);
        out.put_u64_ne(self.generation);
        out.put_u64_ne(self.entry_valid);
        out.put_u64_ne(self.attr_valid);
        out.put_u32_ne(self.entry_valid_nsec);
        out.put_u32_ne(self.attr_valid_nsec);
        self.attr.encode(layout, out);
    }

    pub fn decode(layout: AttrLayout, cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(EntryOut {
            nodeid: cur.u64()?,
            generation: cur.u64()?,
            entry_valid: cur.u64()?,
            attr_valid: cur.u64()?,
            entry_valid_nsec: cur.u32()?,
            attr_valid_nsec: cur.u32()?,
            attr: WireAttr::decode(layout, cur)?,
        })
    }
}

/// Fixed header of `fuse_dirent`; the name and its padding follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentHeader {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub typ: u32,
}

impl DirentHeader {
    /// Appends the header, `name` and zero padding up to 8-byte alignment.
    pub fn encode_with_name(&self, name: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.put_u64_ne(self.ino);
        out.put_u64_ne(self.off);
        out.put_u32_ne(self.namelen);
        out.put_u32_ne(self.typ);
        out.extend_from_slice(name);
        let padded = start + dirent_len(name.len());
        out.resize(padded, 0);
    }

    /// Reads a header and returns it with the name it describes. The cursor
    /// ends on the next record boundary.
    pub fn decode_with_name<'a>(cur: &mut Cursor<'a>) -> Result<(Self, &'a [u8])> {
        let header = DirentHeader {
            ino: cur.u64()?,
            off: cur.u64()?,
            namelen: cur.u32()?,
            typ: cur.u32()?,
        };
        let namelen = header.namelen as usize;
        let name = cur.bytes(namelen)?;
        cur.skip(dirent_len(namelen) - DIRENT_HEADER_LEN - namelen)?;
        Ok((header, name))
    }
}

/// Bounds-checked reader over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor {
            buf,
            total: buf.len(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(BridgeError::malformed(
                "dirent",
                format!(
                    "need {} bytes at offset {}, have {}",
                    n,
                    self.total - self.remaining(),
                    self.remaining()
                ),
            ));
        }
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_ne())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_ne())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_ne())
    }
}
