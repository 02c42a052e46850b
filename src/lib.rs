//! Streaming decoder for the hprof binary heap-dump format written by the
//! HotSpot VM.
//!
//! Bytes are pulled chunk by chunk from a [`ChunkSource`], so an arbitrarily
//! large dump can be decoded while only backing memory proportional to the
//! current buffer window. Decoded records are delivered in file order to a
//! caller-supplied [`HprofVisitor`]; callbacks the visitor does not opt into
//! are skipped without field-level parsing. [`slurp`] runs the bundled
//! aggregation visitor and returns per-class count/size summaries.

use getset::CopyGetters;
use nom::number::complete as number;
use std::cmp::Ordering;
use std::fmt::{Error, Formatter};
use std::{cmp, fmt};

pub mod buffer;
mod elements;
pub mod heap_dump;
pub mod record;
pub mod slurp;
mod visitor;

use elements::{take_array, take_u8};

pub use buffer::{ChunkSource, ReadBuffer, ReadChunks};
pub use elements::{Elements, FromBytes};
pub use visitor::{HprofVisitor, Interests};

/// An object identifier from the dump, widened to 64 bits regardless of the
/// declared identifier width.
#[derive(CopyGetters, Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Id {
    #[get_copy = "pub"]
    id: u64,
}

impl Id {
    /// The JVM writes 0 for absent references (no super class, no class
    /// loader, and so on).
    pub fn non_null(self) -> Option<Id> {
        if self.id == 0 {
            None
        } else {
            Some(self)
        }
    }

    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Id> {
        match id_size {
            IdSize::U8 => number::be_u8(input).map(|(rest, raw)| (rest, Id::from(raw as u64))),
            IdSize::U16 => number::be_u16(input).map(|(rest, raw)| (rest, Id::from(raw as u64))),
            IdSize::U32 => number::be_u32(input).map(|(rest, raw)| (rest, Id::from(raw as u64))),
            IdSize::U64 => number::be_u64(input).map(|(rest, raw)| (rest, Id::from(raw))),
        }
    }
}

impl FromBytes for Id {
    fn decode(bytes: &mut &[u8], id_size: IdSize) -> Option<Id> {
        let raw = match id_size {
            IdSize::U8 => take_u8(bytes)? as u64,
            IdSize::U16 => take_array(bytes).map(u16::from_be_bytes)? as u64,
            IdSize::U32 => take_array(bytes).map(u32::from_be_bytes)? as u64,
            IdSize::U64 => take_array(bytes).map(u64::from_be_bytes)?,
        };
        Some(Id::from(raw))
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id { id }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.id)
    }
}

impl fmt::UpperHex for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        fmt::UpperHex::fmt(&self.id, f)
    }
}

pub type Serial = u32;

/// Identifier width declared in the dump header.
///
/// Real HotSpot dumps use 4 or 8; the header contract allows 1 and 2 as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSize {
    U8,
    U16,
    U32,
    U64,
}

impl IdSize {
    pub fn from_raw(raw: u32) -> Result<IdSize, HprofError> {
        match raw {
            1 => Ok(IdSize::U8),
            2 => Ok(IdSize::U16),
            4 => Ok(IdSize::U32),
            8 => Ok(IdSize::U64),
            other => Err(HprofError::UnsupportedIdSize(other)),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            IdSize::U8 => 1,
            IdSize::U16 => 2,
            IdSize::U32 => 4,
            IdSize::U64 => 8,
        }
    }
}

// https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp

#[derive(CopyGetters, Copy, Clone)]
pub struct Header<'a> {
    label: &'a [u8],
    #[get_copy = "pub"]
    id_size: IdSize,
    /// Milliseconds since the epoch at which the dump was written.
    #[get_copy = "pub"]
    timestamp_millis: u64,
}

impl<'a> Header<'a> {
    pub(crate) fn new(label: &'a [u8], id_size: IdSize, timestamp_millis: u64) -> Header<'a> {
        Header {
            label,
            id_size,
            timestamp_millis,
        }
    }

    /// The format banner, e.g. `JAVA PROFILE 1.0.2`.
    pub fn label(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.label)
    }
}

impl<'a> fmt::Debug for Header<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Header")
            .field("label", &self.label())
            .field("timestamp_millis", &self.timestamp_millis())
            .field("id_size", &self.id_size())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordTag {
    Utf8,
    LoadClass,
    UnloadClass,
    StackFrame,
    StackTrace,
    AllocSites,
    HeapSummary,
    StartThread,
    EndThread,
    HeapDump,
    CpuSamples,
    ControlSettings,
    HeapDumpSegment,
    HeapDumpEnd,
}

impl RecordTag {
    /// All tags this crate understands. Tags outside this set still carry a
    /// well-formed frame and are routed through the raw escape hatch.
    pub fn iter() -> impl Iterator<Item = RecordTag> {
        const ALL: [RecordTag; 14] = [
            RecordTag::Utf8,
            RecordTag::LoadClass,
            RecordTag::UnloadClass,
            RecordTag::StackFrame,
            RecordTag::StackTrace,
            RecordTag::AllocSites,
            RecordTag::HeapSummary,
            RecordTag::StartThread,
            RecordTag::EndThread,
            RecordTag::HeapDump,
            RecordTag::CpuSamples,
            RecordTag::ControlSettings,
            RecordTag::HeapDumpSegment,
            RecordTag::HeapDumpEnd,
        ];
        ALL.iter().copied()
    }

    pub fn from_byte(byte: u8) -> Option<RecordTag> {
        match byte {
            0x01 => Some(RecordTag::Utf8),
            0x02 => Some(RecordTag::LoadClass),
            0x03 => Some(RecordTag::UnloadClass),
            0x04 => Some(RecordTag::StackFrame),
            0x05 => Some(RecordTag::StackTrace),
            0x06 => Some(RecordTag::AllocSites),
            0x07 => Some(RecordTag::HeapSummary),
            0x0A => Some(RecordTag::StartThread),
            0x0B => Some(RecordTag::EndThread),
            0x0C => Some(RecordTag::HeapDump),
            0x0D => Some(RecordTag::CpuSamples),
            0x0E => Some(RecordTag::ControlSettings),
            0x1C => Some(RecordTag::HeapDumpSegment),
            0x2C => Some(RecordTag::HeapDumpEnd),
            _ => None,
        }
    }

    pub fn tag_byte(&self) -> u8 {
        match self {
            RecordTag::Utf8 => 0x01,
            RecordTag::LoadClass => 0x02,
            RecordTag::UnloadClass => 0x03,
            RecordTag::StackFrame => 0x04,
            RecordTag::StackTrace => 0x05,
            RecordTag::AllocSites => 0x06,
            RecordTag::HeapSummary => 0x07,
            RecordTag::StartThread => 0x0A,
            RecordTag::EndThread => 0x0B,
            RecordTag::HeapDump => 0x0C,
            RecordTag::CpuSamples => 0x0D,
            RecordTag::ControlSettings => 0x0E,
            RecordTag::HeapDumpSegment => 0x1C,
            RecordTag::HeapDumpEnd => 0x2C,
        }
    }
}

impl PartialOrd for RecordTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl cmp::Ord for RecordTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag_byte().cmp(&other.tag_byte())
    }
}

/// Field / element type codes used in class dumps, alloc sites, and
/// primitive arrays.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JavaType {
    ArrayObject,
    NormalObject,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl JavaType {
    pub fn from_byte(byte: u8) -> Result<JavaType, HprofError> {
        match byte {
            1 => Ok(JavaType::ArrayObject),
            2 => Ok(JavaType::NormalObject),
            4 => Ok(JavaType::Boolean),
            5 => Ok(JavaType::Char),
            6 => Ok(JavaType::Float),
            7 => Ok(JavaType::Double),
            8 => Ok(JavaType::Byte),
            9 => Ok(JavaType::Short),
            10 => Ok(JavaType::Int),
            11 => Ok(JavaType::Long),
            other => Err(HprofError::UnsupportedType(other)),
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            JavaType::ArrayObject => 1,
            JavaType::NormalObject => 2,
            JavaType::Boolean => 4,
            JavaType::Char => 5,
            JavaType::Float => 6,
            JavaType::Double => 7,
            JavaType::Byte => 8,
            JavaType::Short => 9,
            JavaType::Int => 10,
            JavaType::Long => 11,
        }
    }

    /// Serialized width of one value of this type.
    pub fn byte_size(&self, id_size: IdSize) -> usize {
        match self {
            JavaType::ArrayObject | JavaType::NormalObject => id_size.size_in_bytes(),
            JavaType::Boolean | JavaType::Byte => 1,
            JavaType::Char | JavaType::Short => 2,
            JavaType::Float | JavaType::Int => 4,
            JavaType::Double | JavaType::Long => 8,
        }
    }
}

/// A single decoded field or constant-pool value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum JavaValue {
    Object(Id),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl JavaValue {
    pub(crate) fn parse(
        input: &[u8],
        java_type: JavaType,
        id_size: IdSize,
    ) -> nom::IResult<&[u8], JavaValue> {
        match java_type {
            JavaType::ArrayObject | JavaType::NormalObject => {
                Id::parse(input, id_size).map(|(i, id)| (i, JavaValue::Object(id)))
            }
            JavaType::Boolean => number::be_u8(input).map(|(i, b)| (i, JavaValue::Boolean(b != 0))),
            JavaType::Char => number::be_u16(input).map(|(i, c)| (i, JavaValue::Char(c))),
            JavaType::Float => number::be_f32(input).map(|(i, v)| (i, JavaValue::Float(v))),
            JavaType::Double => number::be_f64(input).map(|(i, v)| (i, JavaValue::Double(v))),
            JavaType::Byte => number::be_i8(input).map(|(i, v)| (i, JavaValue::Byte(v))),
            JavaType::Short => number::be_i16(input).map(|(i, v)| (i, JavaValue::Short(v))),
            JavaType::Int => number::be_i32(input).map(|(i, v)| (i, JavaValue::Int(v))),
            JavaType::Long => number::be_i64(input).map(|(i, v)| (i, JavaValue::Long(v))),
        }
    }
}

/// Decode options, bit-packed the way the dump's own flag words are.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DecodeFlags {
    bits: u32,
}

impl DecodeFlags {
    pub const NONE: DecodeFlags = DecodeFlags { bits: 0 };

    /// Decode the structural skeleton of heap object dumps but discard field
    /// and element payloads. Visitors still see ids, counts, and types.
    pub const SKIP_VALUES: DecodeFlags = DecodeFlags { bits: 1 << 0 };

    pub fn skip_values(&self) -> bool {
        self.bits & DecodeFlags::SKIP_VALUES.bits != 0
    }
}

impl std::ops::BitOr for DecodeFlags {
    type Output = DecodeFlags;

    fn bitor(self, rhs: DecodeFlags) -> DecodeFlags {
        DecodeFlags {
            bits: self.bits | rhs.bits,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HprofError {
    /// The source ran out of bytes. Normal termination at a record boundary;
    /// an error anywhere else.
    #[error("end of stream")]
    EndOfStream,
    /// The header declared an identifier width other than 1, 2, 4, or 8.
    #[error("unsupported identifier size {0}")]
    UnsupportedIdSize(u32),
    #[error("unsupported value type code {0:#04X}")]
    UnsupportedType(u8),
    /// Heap sub-record tags carry no length field, so an unknown tag cannot
    /// be skipped over.
    #[error("unsupported heap dump sub-record tag {0:#04X}")]
    UnsupportedHeapSubRecord(u8),
    /// Byte accounting inside a heap dump record did not match the record's
    /// declared length.
    #[error("heap dump sub-record lengths disagree with the record length")]
    BufferUnderflow,
    #[error("i/o error from chunk source")]
    Io(#[from] std::io::Error),
}

/// Iterator over identifiers packed back to back, e.g. stack trace frame ids
/// or object array elements.
pub type Ids<'a> = Elements<'a, Id>;

pub type ParseResult<'e, T> = Result<T, nom::Err<nom::error::Error<&'e [u8]>>>;

/// Decodes one hprof stream, delivering every record the visitor opted into.
///
/// `EndOfStream` exactly at a record boundary is normal termination; anywhere
/// else it propagates as an error.
pub fn read<S: ChunkSource, V: HprofVisitor>(
    source: S,
    visitor: &mut V,
    flags: DecodeFlags,
) -> Result<(), HprofError> {
    let mut buf = ReadBuffer::new(source);

    let label = buf.take(0)?;
    let id_size = IdSize::from_raw(buf.get_u32()?)?;
    let timestamp_millis = buf.get_u64()?;
    let header = Header::new(&label, id_size, timestamp_millis);
    log::debug!("hprof header: {:?}", header);
    visitor.header(&header)?;

    let interests = visitor.interests();
    record::decode_records(&mut buf, visitor, &interests, id_size, flags)?;
    visitor.end()?;
    Ok(())
}

/// Decodes the stream with the bundled aggregation visitor and returns one
/// entry per class / primitive array type. See [`slurp::Slurp`].
pub fn slurp<S: ChunkSource>(source: S) -> Result<Vec<slurp::Entry>, HprofError> {
    let mut visitor = slurp::Slurp::new();
    read(source, &mut visitor, DecodeFlags::SKIP_VALUES)?;
    Ok(visitor.into_entries())
}

#[cfg(test)]
pub(crate) mod test_stream {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Chunk source over pre-split byte chunks.
    pub(crate) struct Chunks {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Chunks {
        pub(crate) fn new(chunks: Vec<Vec<u8>>) -> Chunks {
            Chunks {
                chunks: chunks.into(),
            }
        }

        pub(crate) fn whole(bytes: Vec<u8>) -> Chunks {
            Chunks::new(vec![bytes])
        }

        /// Splits into fixed-size chunks to exercise window refills.
        pub(crate) fn split(bytes: &[u8], chunk_len: usize) -> Chunks {
            Chunks::new(bytes.chunks(chunk_len).map(|c| c.to_vec()).collect())
        }
    }

    impl ChunkSource for Chunks {
        fn pull(&mut self) -> io::Result<Option<Vec<u8>>> {
            Ok(self.chunks.pop_front())
        }
    }

    /// Big-endian byte builder for record bodies.
    pub(crate) struct Bytes {
        id_size: IdSize,
        buf: Vec<u8>,
    }

    impl Bytes {
        pub(crate) fn new(id_size: IdSize) -> Bytes {
            Bytes {
                id_size,
                buf: Vec::new(),
            }
        }

        pub(crate) fn u8(mut self, v: u8) -> Bytes {
            self.buf.push(v);
            self
        }

        pub(crate) fn u16(mut self, v: u16) -> Bytes {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub(crate) fn u32(mut self, v: u32) -> Bytes {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub(crate) fn i32(mut self, v: i32) -> Bytes {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub(crate) fn u64(mut self, v: u64) -> Bytes {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        pub(crate) fn id(mut self, v: u64) -> Bytes {
            match self.id_size {
                IdSize::U8 => self.buf.push(v as u8),
                IdSize::U16 => self.buf.extend_from_slice(&(v as u16).to_be_bytes()),
                IdSize::U32 => self.buf.extend_from_slice(&(v as u32).to_be_bytes()),
                IdSize::U64 => self.buf.extend_from_slice(&v.to_be_bytes()),
            }
            self
        }

        pub(crate) fn raw(mut self, bytes: &[u8]) -> Bytes {
            self.buf.extend_from_slice(bytes);
            self
        }

        pub(crate) fn take(self) -> Vec<u8> {
            self.buf
        }
    }

    pub(crate) const BANNER: &str = "JAVA PROFILE 1.0.2";

    /// Builds a whole stream: header followed by framed records.
    pub(crate) struct StreamBuilder {
        id_size: IdSize,
        bytes: Vec<u8>,
    }

    impl StreamBuilder {
        pub(crate) fn new(id_size: IdSize) -> StreamBuilder {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(BANNER.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(&(id_size.size_in_bytes() as u32).to_be_bytes());
            bytes.extend_from_slice(&0_u64.to_be_bytes());
            StreamBuilder { id_size, bytes }
        }

        pub(crate) fn body(&self) -> Bytes {
            Bytes::new(self.id_size)
        }

        pub(crate) fn record(mut self, tag: u8, ts_delta: u32, body: &[u8]) -> StreamBuilder {
            self.bytes.push(tag);
            self.bytes.extend_from_slice(&ts_delta.to_be_bytes());
            self.bytes
                .extend_from_slice(&(body.len() as u32).to_be_bytes());
            self.bytes.extend_from_slice(body);
            self
        }

        /// Same as `record` but with a deliberately wrong declared length.
        pub(crate) fn record_with_length(
            mut self,
            tag: u8,
            ts_delta: u32,
            declared: u32,
            body: &[u8],
        ) -> StreamBuilder {
            self.bytes.push(tag);
            self.bytes.extend_from_slice(&ts_delta.to_be_bytes());
            self.bytes.extend_from_slice(&declared.to_be_bytes());
            self.bytes.extend_from_slice(body);
            self
        }

        pub(crate) fn finish(self) -> Vec<u8> {
            self.bytes
        }

        pub(crate) fn into_source(self) -> Chunks {
            Chunks::whole(self.bytes)
        }
    }
}
