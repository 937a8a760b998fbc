//! Hand-written protobuf decode/encode for the two wire formats a UnixFS DAG node is built from:
//! the outer dag-pb `PBNode` envelope and the inner unixfs `Data` message carried in its `Data`
//! field. `quick-protobuf`'s codegen output follows the same `MessageRead`/`MessageWrite` shape;
//! these are written by hand because the `.proto` sources are not vendored into this crate.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::fmt;

use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Result as PbResult, Writer, WriterBackend};

/// `MessageWrite::get_size` must return the exact length `write_message` will produce. Rather than
/// duplicating varint/length-delimited size arithmetic by hand for every field, serialize once into
/// a scratch buffer and measure it; these messages are small and this only runs when a caller
/// actually re-encodes a node; most paths here only ever decode.
fn measured_size(f: impl FnOnce(&mut Writer<&mut Vec<u8>>) -> PbResult<()>) -> usize {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf);
    f(&mut w).expect("measuring a message's own fields cannot fail");
    buf.len()
}

/// A single link of a dag-pb node: a child `Hash` (the CID bytes), an optional `Name` (present on
/// named directory/file entries, absent on raw chunk links), and a `Tsize` (cumulative size of the
/// subtree, used for seeking).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PBLink<'a> {
    pub Hash: Option<Cow<'a, [u8]>>,
    pub Name: Option<Cow<'a, str>>,
    pub Tsize: Option<u64>,
}

impl<'a> MessageRead<'a> for PBLink<'a> {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> PbResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.Hash = Some(Cow::Borrowed(r.read_bytes(bytes)?)),
                Ok(18) => msg.Name = Some(Cow::Borrowed(r.read_string(bytes)?)),
                Ok(24) => msg.Tsize = Some(r.read_uint64(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl<'a> MessageWrite for PBLink<'a> {
    fn get_size(&self) -> usize {
        measured_size(|w| self.write_message(w))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> PbResult<()> {
        if let Some(ref h) = self.Hash {
            w.write_with_tag(10, |w| w.write_bytes(h))?;
        }
        if let Some(ref n) = self.Name {
            w.write_with_tag(18, |w| w.write_string(n))?;
        }
        if let Some(t) = self.Tsize {
            w.write_with_tag(24, |w| w.write_uint64(t))?;
        }
        Ok(())
    }
}

/// `mtime` companion message: seconds since the unix epoch plus an optional fractional part, per
/// the unixfs `UnixTime` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnixTime {
    pub Seconds: i64,
    pub FractionalNanoseconds: Option<u32>,
}

impl<'a> MessageRead<'a> for UnixTime {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> PbResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.Seconds = r.read_int64(bytes)?,
                Ok(21) => msg.FractionalNanoseconds = Some(r.read_fixed32(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for UnixTime {
    fn get_size(&self) -> usize {
        measured_size(|w| self.write_message(w))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> PbResult<()> {
        w.write_with_tag(8, |w| w.write_int64(self.Seconds))?;
        if let Some(n) = self.FractionalNanoseconds {
            w.write_with_tag(21, |w| w.write_fixed32(n))?;
        }
        Ok(())
    }
}

/// Discriminant of the unixfs `Data.Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixFsType {
    Raw,
    Directory,
    File,
    Metadata,
    Symlink,
    HamtShard,
    Other(i32),
}

impl From<i32> for UnixFsType {
    fn from(v: i32) -> Self {
        match v {
            0 => UnixFsType::Raw,
            1 => UnixFsType::Directory,
            2 => UnixFsType::File,
            3 => UnixFsType::Metadata,
            4 => UnixFsType::Symlink,
            5 => UnixFsType::HamtShard,
            other => UnixFsType::Other(other),
        }
    }
}

impl From<UnixFsType> for i32 {
    fn from(v: UnixFsType) -> Self {
        match v {
            UnixFsType::Raw => 0,
            UnixFsType::Directory => 1,
            UnixFsType::File => 2,
            UnixFsType::Metadata => 3,
            UnixFsType::Symlink => 4,
            UnixFsType::HamtShard => 5,
            UnixFsType::Other(v) => v,
        }
    }
}

impl Default for UnixFsType {
    fn default() -> Self {
        UnixFsType::File
    }
}

/// The unixfs `Data` message: type tag, inline bytes, and the chunking metadata used to walk a
/// multi-block file tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnixFs<'a> {
    pub Type: UnixFsType,
    pub Data: Option<Cow<'a, [u8]>>,
    pub filesize: Option<u64>,
    pub blocksizes: Vec<u64>,
    pub hashType: Option<u64>,
    pub fanout: Option<u64>,
    pub mode: Option<u32>,
    pub mtime: Option<UnixTime>,
}

impl<'a> MessageRead<'a> for UnixFs<'a> {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> PbResult<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.Type = UnixFsType::from(r.read_int32(bytes)?),
                Ok(18) => msg.Data = Some(Cow::Borrowed(r.read_bytes(bytes)?)),
                Ok(24) => msg.filesize = Some(r.read_uint64(bytes)?),
                Ok(32) => msg.blocksizes.push(r.read_uint64(bytes)?),
                Ok(40) => msg.hashType = Some(r.read_uint64(bytes)?),
                Ok(48) => msg.fanout = Some(r.read_uint64(bytes)?),
                Ok(56) => msg.mode = Some(r.read_uint32(bytes)?),
                Ok(66) => {
                    let slice = r.read_bytes(bytes)?;
                    let mut sub = BytesReader::from_bytes(slice);
                    msg.mtime = Some(UnixTime::from_reader(&mut sub, slice)?);
                }
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl<'a> MessageWrite for UnixFs<'a> {
    fn get_size(&self) -> usize {
        measured_size(|w| self.write_message(w))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> PbResult<()> {
        w.write_with_tag(8, |w| w.write_int32(i32::from(self.Type)))?;
        if let Some(ref d) = self.Data {
            w.write_with_tag(18, |w| w.write_bytes(d))?;
        }
        if let Some(f) = self.filesize {
            w.write_with_tag(24, |w| w.write_uint64(f))?;
        }
        for b in &self.blocksizes {
            w.write_with_tag(32, |w| w.write_uint64(*b))?;
        }
        if let Some(h) = self.hashType {
            w.write_with_tag(40, |w| w.write_uint64(h))?;
        }
        if let Some(f) = self.fanout {
            w.write_with_tag(48, |w| w.write_uint64(f))?;
        }
        if let Some(m) = self.mode {
            w.write_with_tag(56, |w| w.write_uint32(m))?;
        }
        if let Some(ref t) = self.mtime {
            w.write_with_tag(66, |w| w.write_message(t))?;
        }
        Ok(())
    }
}

/// A dag-pb node with its `Data` field already reparsed into a [`UnixFs`] message, combining the
/// two protobuf layers the wire format separates. This is the shape every caller in this crate
/// wants: "the links, and the unixfs metadata/content for this node".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatUnixFs<'a> {
    pub links: Vec<PBLink<'a>>,
    pub data: UnixFs<'a>,
}

/// Errors which can occur while decoding a block as a dag-pb node wrapping a unixfs `Data`
/// message.
#[derive(Debug, thiserror::Error)]
pub enum UnixFsReadFailed {
    #[error("invalid dag-pb framing: {0}")]
    Node(#[source] quick_protobuf::Error),
    #[error("dag-pb node carried no Data field to decode as unixfs Data")]
    MissingData,
    #[error("invalid unixfs Data message: {0}")]
    Data(#[source] quick_protobuf::Error),
}

impl<'a> TryFrom<&'a [u8]> for FlatUnixFs<'a> {
    type Error = UnixFsReadFailed;

    fn try_from(block: &'a [u8]) -> Result<Self, Self::Error> {
        let mut r = BytesReader::from_bytes(block);
        let mut links = Vec::new();
        let mut data: Option<&'a [u8]> = None;

        while !r.is_eof() {
            match r.next_tag(block).map_err(UnixFsReadFailed::Node)? {
                10 => {
                    let bytes = r.read_bytes(block).map_err(UnixFsReadFailed::Node)?;
                    data = Some(bytes);
                }
                18 => {
                    let slice = r.read_bytes(block).map_err(UnixFsReadFailed::Node)?;
                    let mut sub = BytesReader::from_bytes(slice);
                    let link =
                        PBLink::from_reader(&mut sub, slice).map_err(UnixFsReadFailed::Node)?;
                    links.push(link);
                }
                t => {
                    r.read_unknown(block, t).map_err(UnixFsReadFailed::Node)?;
                }
            }
        }

        let data_bytes = data.ok_or(UnixFsReadFailed::MissingData)?;
        let mut dr = BytesReader::from_bytes(data_bytes);
        let parsed = UnixFs::from_reader(&mut dr, data_bytes).map_err(UnixFsReadFailed::Data)?;

        Ok(FlatUnixFs {
            links,
            data: parsed,
        })
    }
}

impl<'a> FlatUnixFs<'a> {
    /// Re-encodes this node as a dag-pb block: each link under tag 18, then the reparsed unixfs
    /// `Data` message re-serialized and written under tag 10. The inverse of `TryFrom<&[u8]>`.
    pub fn encode(&self) -> Vec<u8> {
        let mut data_buf = Vec::new();
        let mut data_writer = Writer::new(&mut data_buf);
        self.data
            .write_message(&mut data_writer)
            .expect("encoding a UnixFs Data message cannot fail");

        let mut buf = Vec::new();
        let mut writer = Writer::new(&mut buf);
        writer
            .write_with_tag(10, |w| w.write_bytes(&data_buf))
            .expect("encoding the Data field cannot fail");
        for link in &self.links {
            writer
                .write_with_tag(18, |w| w.write_message(link))
                .expect("encoding a link cannot fail");
        }
        buf
    }
}

impl fmt::Display for UnixFsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
