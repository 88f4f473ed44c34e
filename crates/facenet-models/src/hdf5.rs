//! Read-only access to HDF5 weight files written by Keras
//!
//! Covers the part of the format h5py produces for `save_weights`:
//! superblocks v0 to v3, object headers v1 and v2, groups stored as symbol
//! tables or compact link messages, and contiguous or compact floating point
//! datasets. Chunked (and therefore compressed) datasets and dense link
//! storage are reported as unsupported.

use facenet_types::{FacenetError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// File signature found at the start of the superblock.
pub const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

const MSG_NIL: u16 = 0x0000;
const MSG_DATASPACE: u16 = 0x0001;
const MSG_LINK_INFO: u16 = 0x0002;
const MSG_DATATYPE: u16 = 0x0003;
const MSG_LINK: u16 = 0x0006;
const MSG_LAYOUT: u16 = 0x0008;
const MSG_FILTER_PIPELINE: u16 = 0x000B;
const MSG_CONTINUATION: u16 = 0x0010;
const MSG_SYMBOL_TABLE: u16 = 0x0011;

const MAX_HEADER_BLOCKS: usize = 1024;
const MAX_BTREE_DEPTH: usize = 32;
const MAX_GROUP_DEPTH: usize = 16;

/// Whether `head` starts with the HDF5 signature.
pub fn is_hdf5(head: &[u8]) -> bool {
    head.len() >= SIGNATURE.len() && &head[..SIGNATURE.len()] == SIGNATURE
}

fn truncated(what: &str) -> FacenetError {
    FacenetError::invalid_format(format!("HDF5 file truncated while reading {}", what))
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    offset_size: usize,
    length_size: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| truncated("a byte"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(self.uint(2)? as u16)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(self.uint(4)? as u32)
    }

    fn uint(&mut self, width: usize) -> Result<u64> {
        if width > 8 {
            return Err(FacenetError::invalid_format(format!(
                "HDF5 integer field of {} bytes",
                width
            )));
        }
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    fn offset(&mut self) -> Result<u64> {
        self.uint(self.offset_size)
    }

    fn length(&mut self) -> Result<u64> {
        self.uint(self.length_size)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated("a field"))?;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| truncated("a field"))?;
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn expect(&mut self, signature: &[u8; 4], what: &str) -> Result<()> {
        if self.take(4)? != signature {
            return Err(FacenetError::invalid_format(format!(
                "Missing {} signature in HDF5 file",
                what
            )));
        }
        Ok(())
    }
}

/// A header message of an object
struct Message<'a> {
    kind: u16,
    body: &'a [u8],
}

/// Floating point element type of a dataset
#[derive(Debug, Clone, Copy)]
struct FloatType {
    size: usize,
    big_endian: bool,
}

enum Layout<'a> {
    Compact(&'a [u8]),
    Contiguous { address: u64, size: Option<u64> },
}

/// A dataset read into memory as `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Members of a group, by name.
#[derive(Debug, Clone, Default)]
pub struct Group {
    members: BTreeMap<String, u64>,
}

impl Group {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// An HDF5 file held in memory
pub struct Hdf5File {
    data: Vec<u8>,
    offset_size: usize,
    length_size: usize,
    base: u64,
    root: u64,
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hdf5File")
            .field("bytes", &self.data.len())
            .field("offset_size", &self.offset_size)
            .field("length_size", &self.length_size)
            .finish()
    }
}

impl Hdf5File {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| FacenetError::io(format!("Failed to read {}: {}", path.display(), e)))?;
        debug!("Parsing HDF5 file {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let start = superblock_position(&data)?;
        let mut r = Reader {
            buf: &data,
            pos: start + SIGNATURE.len(),
            offset_size: 8,
            length_size: 8,
        };

        let version = r.u8()?;
        let (offset_size, length_size, base, root) = match version {
            0 | 1 => {
                // free-space, root group entry and shared header versions, reserved
                r.skip(4)?;
                let offset_size = r.u8()? as usize;
                let length_size = r.u8()? as usize;
                // reserved, group K values, consistency flags
                r.skip(1 + 2 + 2 + 4)?;
                if version == 1 {
                    r.skip(4)?;
                }
                check_sizes(offset_size, length_size)?;
                r.offset_size = offset_size;
                r.length_size = length_size;
                let base = r.offset()?;
                let _free_space = r.offset()?;
                let _eof = r.offset()?;
                let _driver = r.offset()?;
                // root group symbol table entry: link name offset, then header
                let _name = r.offset()?;
                let root = r.offset()?;
                (offset_size, length_size, base, root)
            }
            2 | 3 => {
                let offset_size = r.u8()? as usize;
                let length_size = r.u8()? as usize;
                r.skip(1)?;
                check_sizes(offset_size, length_size)?;
                r.offset_size = offset_size;
                r.length_size = length_size;
                let base = r.offset()?;
                let _extension = r.offset()?;
                let _eof = r.offset()?;
                let root = r.offset()?;
                (offset_size, length_size, base, root)
            }
            v => {
                return Err(FacenetError::unsupported(format!(
                    "HDF5 superblock version {}",
                    v
                )))
            }
        };

        Ok(Self {
            data,
            offset_size,
            length_size,
            base,
            root,
        })
    }

    /// Members of the root group.
    pub fn root(&self) -> Result<Group> {
        self.read_group(self.root)
    }

    /// Child group `name` of `parent`, if present.
    pub fn group(&self, parent: &Group, name: &str) -> Result<Option<Group>> {
        match parent.members.get(name) {
            Some(&addr) => {
                let messages = self.messages(addr)?;
                if is_dataset(&messages) {
                    return Err(FacenetError::invalid_format(format!(
                        "HDF5 member {} is a dataset, not a group",
                        name
                    )));
                }
                self.group_from_messages(&messages).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Dataset `name` of `parent`, if present.
    pub fn dataset(&self, parent: &Group, name: &str) -> Result<Option<Dataset>> {
        match parent.members.get(name) {
            Some(&addr) => {
                let messages = self.messages(addr)?;
                if !is_dataset(&messages) {
                    return Err(FacenetError::invalid_format(format!(
                        "HDF5 member {} is a group, not a dataset",
                        name
                    )));
                }
                self.dataset_from_messages(&messages).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Every dataset below `group`, keyed by its `/`-separated path relative
    /// to it.
    pub fn datasets(&self, group: &Group) -> Result<BTreeMap<String, Dataset>> {
        let mut out = BTreeMap::new();
        self.collect(group, "", 0, &mut out)?;
        Ok(out)
    }

    fn collect(
        &self,
        group: &Group,
        prefix: &str,
        depth: usize,
        out: &mut BTreeMap<String, Dataset>,
    ) -> Result<()> {
        if depth > MAX_GROUP_DEPTH {
            return Err(FacenetError::invalid_format("HDF5 groups nested too deeply"));
        }
        for (name, &addr) in &group.members {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            let messages = self.messages(addr)?;
            if is_dataset(&messages) {
                out.insert(path, self.dataset_from_messages(&messages)?);
            } else {
                let child = self.group_from_messages(&messages)?;
                self.collect(&child, &path, depth + 1, out)?;
            }
        }
        Ok(())
    }

    fn reader(&self, pos: usize) -> Reader<'_> {
        Reader {
            buf: &self.data,
            pos,
            offset_size: self.offset_size,
            length_size: self.length_size,
        }
    }

    fn reader_over<'a>(&self, body: &'a [u8]) -> Reader<'a> {
        Reader {
            buf: body,
            pos: 0,
            offset_size: self.offset_size,
            length_size: self.length_size,
        }
    }

    fn undefined(&self, addr: u64) -> bool {
        if self.offset_size >= 8 {
            addr == u64::MAX
        } else {
            addr == (1u64 << (8 * self.offset_size)) - 1
        }
    }

    /// Absolute position of a file address.
    fn pos(&self, addr: u64) -> Result<usize> {
        let pos = self
            .base
            .checked_add(addr)
            .and_then(|p| usize::try_from(p).ok())
            .filter(|&p| p < self.data.len())
            .ok_or_else(|| {
                FacenetError::invalid_format(format!("HDF5 address {:#x} is out of bounds", addr))
            })?;
        Ok(pos)
    }

    fn messages(&self, addr: u64) -> Result<Vec<Message<'_>>> {
        let start = self.pos(addr)?;
        if self.data.get(start..start + 4) == Some(b"OHDR".as_slice()) {
            self.messages_v2(start)
        } else {
            self.messages_v1(start)
        }
    }

    fn messages_v1(&self, start: usize) -> Result<Vec<Message<'_>>> {
        let mut r = self.reader(start);
        let version = r.u8()?;
        if version != 1 {
            return Err(FacenetError::invalid_format(format!(
                "Unknown HDF5 object header version {}",
                version
            )));
        }
        // reserved, message count, reference count
        r.skip(1 + 2 + 4)?;
        let size = r.u32()? as usize;
        // header prefix is padded to 16 bytes
        r.skip(4)?;

        let mut blocks = vec![(r.pos, size)];
        let mut messages = Vec::new();
        let mut next = 0;
        while next < blocks.len() {
            if next >= MAX_HEADER_BLOCKS {
                return Err(FacenetError::invalid_format(
                    "HDF5 object header has too many continuation blocks",
                ));
            }
            let (block, len) = blocks[next];
            next += 1;

            let end = block + len;
            let mut r = self.reader(block);
            while r.pos + 8 <= end {
                let kind = r.u16()?;
                let len = r.u16()? as usize;
                r.skip(4)?;
                let body = r.take(len)?;
                self.push_message(kind, body, 0, &mut blocks, &mut messages)?;
            }
        }
        Ok(messages)
    }

    fn messages_v2(&self, start: usize) -> Result<Vec<Message<'_>>> {
        let mut r = self.reader(start + 4);
        let version = r.u8()?;
        if version != 2 {
            return Err(FacenetError::invalid_format(format!(
                "Unknown HDF5 object header version {}",
                version
            )));
        }
        let flags = r.u8()?;
        if flags & 0x20 != 0 {
            r.skip(16)?;
        }
        if flags & 0x10 != 0 {
            r.skip(4)?;
        }
        let size = r.uint(1 << (flags & 0x03))? as usize;
        let header_len = if flags & 0x04 != 0 { 6 } else { 4 };

        let mut blocks = vec![(r.pos, size)];
        let mut messages = Vec::new();
        let mut next = 0;
        while next < blocks.len() {
            if next >= MAX_HEADER_BLOCKS {
                return Err(FacenetError::invalid_format(
                    "HDF5 object header has too many continuation blocks",
                ));
            }
            let (block, len) = blocks[next];
            next += 1;

            let end = block + len;
            let mut r = self.reader(block);
            while r.pos + header_len <= end {
                let kind = u16::from(r.u8()?);
                let len = r.u16()? as usize;
                r.skip(header_len - 3)?;
                let body = r.take(len)?;
                self.push_message(kind, body, 8, &mut blocks, &mut messages)?;
            }
        }
        Ok(messages)
    }

    /// Queue continuation blocks and keep every other non-nil message.
    /// `framing` is the signature plus checksum size of a continuation block.
    fn push_message<'a>(
        &'a self,
        kind: u16,
        body: &'a [u8],
        framing: usize,
        blocks: &mut Vec<(usize, usize)>,
        messages: &mut Vec<Message<'a>>,
    ) -> Result<()> {
        match kind {
            MSG_NIL => {}
            MSG_CONTINUATION => {
                let mut c = self.reader_over(body);
                let addr = c.offset()?;
                let len = c.length()? as usize;
                let pos = self.pos(addr)?;
                if framing > 0 {
                    self.reader(pos).expect(b"OCHK", "continuation block")?;
                    let len = len.checked_sub(framing).ok_or_else(|| truncated("a header"))?;
                    blocks.push((pos + 4, len));
                } else {
                    blocks.push((pos, len));
                }
            }
            _ => messages.push(Message { kind, body }),
        }
        Ok(())
    }

    fn read_group(&self, addr: u64) -> Result<Group> {
        let messages = self.messages(addr)?;
        self.group_from_messages(&messages)
    }

    fn group_from_messages(&self, messages: &[Message<'_>]) -> Result<Group> {
        let mut members = BTreeMap::new();
        for m in messages {
            match m.kind {
                MSG_SYMBOL_TABLE => {
                    let mut r = self.reader_over(m.body);
                    let btree = r.offset()?;
                    let heap = r.offset()?;
                    let names = self.local_heap(heap)?;
                    self.walk_group_btree(btree, names, 0, &mut members)?;
                }
                MSG_LINK => {
                    if let Some((name, target)) = self.parse_link(m.body)? {
                        members.insert(name, target);
                    }
                }
                MSG_LINK_INFO => {
                    let mut r = self.reader_over(m.body);
                    r.skip(1)?;
                    let flags = r.u8()?;
                    if flags & 0x01 != 0 {
                        r.skip(8)?;
                    }
                    let heap = r.offset()?;
                    if !self.undefined(heap) {
                        return Err(FacenetError::unsupported(
                            "HDF5 groups with dense link storage",
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(Group { members })
    }

    fn local_heap(&self, addr: u64) -> Result<&[u8]> {
        let mut r = self.reader(self.pos(addr)?);
        r.expect(b"HEAP", "local heap")?;
        // version, reserved
        r.skip(4)?;
        let size = r.length()? as usize;
        let _free_list = r.length()?;
        let data = r.offset()?;
        let start = self.pos(data)?;
        self.data
            .get(start..start + size)
            .ok_or_else(|| truncated("a local heap"))
    }

    fn walk_group_btree(
        &self,
        addr: u64,
        names: &[u8],
        depth: usize,
        out: &mut BTreeMap<String, u64>,
    ) -> Result<()> {
        if depth > MAX_BTREE_DEPTH {
            return Err(FacenetError::invalid_format("HDF5 B-tree nested too deeply"));
        }
        let mut r = self.reader(self.pos(addr)?);
        r.expect(b"TREE", "B-tree node")?;
        let node_type = r.u8()?;
        if node_type != 0 {
            return Err(FacenetError::invalid_format(format!(
                "Expected a group B-tree node, found type {}",
                node_type
            )));
        }
        let level = r.u8()?;
        let entries = r.u16()? as usize;
        let _left = r.offset()?;
        let _right = r.offset()?;
        let _first_key = r.length()?;
        for _ in 0..entries {
            let child = r.offset()?;
            let _key = r.length()?;
            if level > 0 {
                self.walk_group_btree(child, names, depth + 1, out)?;
            } else {
                self.read_symbol_node(child, names, out)?;
            }
        }
        Ok(())
    }

    fn read_symbol_node(
        &self,
        addr: u64,
        names: &[u8],
        out: &mut BTreeMap<String, u64>,
    ) -> Result<()> {
        let mut r = self.reader(self.pos(addr)?);
        r.expect(b"SNOD", "symbol table node")?;
        // version, reserved
        r.skip(2)?;
        let count = r.u16()? as usize;
        for _ in 0..count {
            let name = r.offset()? as usize;
            let header = r.offset()?;
            // cache type, reserved, scratch pad
            r.skip(4 + 4 + 16)?;
            out.insert(heap_string(names, name)?, header);
        }
        Ok(())
    }

    fn parse_link(&self, body: &[u8]) -> Result<Option<(String, u64)>> {
        let mut r = self.reader_over(body);
        let version = r.u8()?;
        if version != 1 {
            return Err(FacenetError::invalid_format(format!(
                "Unknown HDF5 link message version {}",
                version
            )));
        }
        let flags = r.u8()?;
        let link_type = if flags & 0x08 != 0 { r.u8()? } else { 0 };
        if flags & 0x04 != 0 {
            r.skip(8)?;
        }
        if flags & 0x10 != 0 {
            r.skip(1)?;
        }
        let len = r.uint(1 << (flags & 0x03))? as usize;
        let name = String::from_utf8_lossy(r.take(len)?).into_owned();
        // soft and external links never hold weights
        if link_type != 0 {
            return Ok(None);
        }
        Ok(Some((name, r.offset()?)))
    }

    fn dataset_from_messages(&self, messages: &[Message<'_>]) -> Result<Dataset> {
        let mut shape = None;
        let mut dtype = None;
        let mut layout = None;
        for m in messages {
            match m.kind {
                MSG_DATASPACE => shape = Some(self.parse_dataspace(m.body)?),
                MSG_DATATYPE => dtype = Some(parse_datatype(m.body)?),
                MSG_LAYOUT => layout = Some(self.parse_layout(m.body)?),
                MSG_FILTER_PIPELINE => {
                    return Err(FacenetError::unsupported("Filtered HDF5 datasets"))
                }
                _ => {}
            }
        }
        let shape = shape.ok_or_else(|| FacenetError::invalid_format("Dataset without dataspace"))?;
        let dtype = dtype.ok_or_else(|| FacenetError::invalid_format("Dataset without datatype"))?;
        let layout = layout.ok_or_else(|| FacenetError::invalid_format("Dataset without layout"))?;

        let count: usize = shape.iter().product();
        let nbytes = count * dtype.size;
        let raw = match layout {
            Layout::Compact(bytes) => bytes,
            Layout::Contiguous { address, .. } if self.undefined(address) => {
                // never written: HDF5 reads back the default fill value
                return Ok(Dataset {
                    shape,
                    values: vec![0.0; count],
                });
            }
            Layout::Contiguous { address, size } => {
                if size.is_some_and(|s| s < nbytes as u64) {
                    return Err(FacenetError::invalid_format(format!(
                        "Dataset storage holds {:?} bytes, {} needed",
                        size, nbytes
                    )));
                }
                let start = self.pos(address)?;
                self.data
                    .get(start..start + nbytes)
                    .ok_or_else(|| truncated("dataset values"))?
            }
        };
        if raw.len() < nbytes {
            return Err(truncated("dataset values"));
        }

        Ok(Dataset {
            shape,
            values: decode_floats(&raw[..nbytes], dtype),
        })
    }

    fn parse_dataspace(&self, body: &[u8]) -> Result<Vec<usize>> {
        let mut r = self.reader_over(body);
        let version = r.u8()?;
        let rank = r.u8()? as usize;
        let _flags = r.u8()?;
        match version {
            1 => r.skip(5)?,
            2 => {
                // null dataspace
                if r.u8()? == 2 {
                    return Ok(vec![0]);
                }
            }
            v => {
                return Err(FacenetError::unsupported(format!(
                    "HDF5 dataspace version {}",
                    v
                )))
            }
        }
        (0..rank).map(|_| Ok(r.length()? as usize)).collect()
    }

    fn parse_layout<'a>(&self, body: &'a [u8]) -> Result<Layout<'a>> {
        let mut r = self.reader_over(body);
        let version = r.u8()?;
        match version {
            3 | 4 => match r.u8()? {
                0 => {
                    let size = r.u16()? as usize;
                    Ok(Layout::Compact(r.take(size)?))
                }
                1 => Ok(Layout::Contiguous {
                    address: r.offset()?,
                    size: Some(r.length()?),
                }),
                2 => Err(FacenetError::unsupported("Chunked HDF5 datasets")),
                class => Err(FacenetError::unsupported(format!(
                    "HDF5 layout class {}",
                    class
                ))),
            },
            1 | 2 => {
                let rank = r.u8()? as usize;
                let class = r.u8()?;
                r.skip(5)?;
                match class {
                    0 => {
                        r.skip(rank * 4)?;
                        let size = r.u32()? as usize;
                        Ok(Layout::Compact(r.take(size)?))
                    }
                    1 => Ok(Layout::Contiguous {
                        address: r.offset()?,
                        size: None,
                    }),
                    2 => Err(FacenetError::unsupported("Chunked HDF5 datasets")),
                    class => Err(FacenetError::unsupported(format!(
                        "HDF5 layout class {}",
                        class
                    ))),
                }
            }
            v => Err(FacenetError::unsupported(format!(
                "HDF5 layout version {}",
                v
            ))),
        }
    }
}

fn superblock_position(data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    loop {
        match data.get(pos..) {
            Some(rest) if is_hdf5(rest) => return Ok(pos),
            Some(rest) if !rest.is_empty() => {}
            _ => return Err(FacenetError::invalid_format("HDF5 signature not found")),
        }
        pos = if pos == 0 { 512 } else { pos * 2 };
    }
}

fn check_sizes(offset_size: usize, length_size: usize) -> Result<()> {
    for size in [offset_size, length_size] {
        if !matches!(size, 2 | 4 | 8) {
            return Err(FacenetError::invalid_format(format!(
                "Invalid HDF5 address width of {} bytes",
                size
            )));
        }
    }
    Ok(())
}

fn is_dataset(messages: &[Message<'_>]) -> bool {
    messages.iter().any(|m| m.kind == MSG_LAYOUT)
}

fn heap_string(heap: &[u8], offset: usize) -> Result<String> {
    let tail = heap
        .get(offset..)
        .ok_or_else(|| truncated("a link name"))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| truncated("a link name"))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn parse_datatype(body: &[u8]) -> Result<FloatType> {
    let mut r = Reader {
        buf: body,
        pos: 0,
        offset_size: 8,
        length_size: 8,
    };
    let class = r.u8()? & 0x0f;
    let bits = r.u8()?;
    r.skip(2)?;
    let size = r.u32()? as usize;
    match (class, size) {
        (1, 4) | (1, 8) => Ok(FloatType {
            size,
            big_endian: bits & 0x01 != 0,
        }),
        _ => Err(FacenetError::unsupported(format!(
            "HDF5 datatype class {} of {} bytes; only floating point weights can be loaded",
            class, size
        ))),
    }
}

fn decode_floats(raw: &[u8], dtype: FloatType) -> Vec<f32> {
    match (dtype.size, dtype.big_endian) {
        (4, false) => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        (4, true) => raw
            .chunks_exact(4)
            .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        (_, big_endian) => raw
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                let v = if big_endian {
                    f64::from_be_bytes(b)
                } else {
                    f64::from_le_bytes(b)
                };
                v as f32
            })
            .collect(),
    }
}
