//! Top-level record decoding: the framed `(tag, ts delta, length)` loop and
//! one parsed struct per record tag.

use crate::buffer::{ChunkSource, ReadBuffer};
use crate::elements::{take_u32, take_u8, FromBytes};
use crate::{
    heap_dump, DecodeFlags, Elements, HprofError, HprofVisitor, Id, IdSize, Ids, Interests,
    ParseResult, RecordTag, Serial,
};
use getset::CopyGetters;
use nom::combinator::map;
use nom::number::complete as number;
use nom::sequence::tuple;
use std::fmt;

/// nom parser for one identifier at the declared width.
fn id<'a>(id_size: IdSize) -> impl Fn(&'a [u8]) -> nom::IResult<&'a [u8], Id> {
    move |input| Id::parse(input, id_size)
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Utf8<'a> {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    text: &'a [u8],
}

impl<'a> Utf8<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, Utf8<'a>> {
        // the name id is the only framing; the rest of the body is the string
        let (text, name_id) = id(id_size)(input)?;
        Ok(Utf8 { name_id, text })
    }

    /// Real dumps contain the odd Utf8 record whose bytes are not valid
    /// UTF-8, so this stays fallible.
    pub fn text_as_str(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.text)
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct LoadClass {
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_name_id: Id,
}

impl LoadClass {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<'_, LoadClass> {
        let (_, (class_serial, class_obj_id, stack_trace_serial, class_name_id)) =
            tuple((number::be_u32, id(id_size), number::be_u32, id(id_size)))(input)?;

        Ok(LoadClass {
            class_serial,
            class_obj_id,
            stack_trace_serial,
            class_name_id,
        })
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StackFrame {
    #[get_copy = "pub"]
    id: Id,
    #[get_copy = "pub"]
    method_name_id: Id,
    #[get_copy = "pub"]
    method_signature_id: Id,
    #[get_copy = "pub"]
    source_file_name_id: Id,
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    line_num: LineNum,
}

impl StackFrame {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<'_, StackFrame> {
        let (
            _,
            (frame_id, method_name_id, method_signature_id, source_file_name_id, class_serial, line_num),
        ) = tuple((
            id(id_size),
            id(id_size),
            id(id_size),
            id(id_size),
            number::be_u32,
            LineNum::parse,
        ))(input)?;

        Ok(StackFrame {
            id: frame_id,
            method_name_id,
            method_signature_id,
            source_file_name_id,
            class_serial,
            line_num,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineNum {
    Normal(u32),
    Unknown,
    CompiledMethod,
    NativeMethod,
}

impl LineNum {
    fn parse(input: &[u8]) -> nom::IResult<&[u8], Self> {
        map(number::be_i32, LineNum::from_raw)(input)
    }

    /// The VM writes -1/-2/-3 markers in place of a line; anything else
    /// non-positive is treated as unknown rather than rejected.
    fn from_raw(raw: i32) -> LineNum {
        match raw {
            n if n > 0 => LineNum::Normal(n as u32),
            -2 => LineNum::CompiledMethod,
            -3 => LineNum::NativeMethod,
            _ => LineNum::Unknown,
        }
    }
}

impl fmt::Display for LineNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineNum::Normal(n) => write!(f, "{}", n),
            LineNum::Unknown => write!(f, "Unknown"),
            LineNum::CompiledMethod => write!(f, "CompiledMethod"),
            LineNum::NativeMethod => write!(f, "NativeMethod"),
        }
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct StackTrace<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_serial: Serial,
    #[get_copy = "pub"]
    num_frame_ids: u32,
    frame_ids: &'a [u8],
}

impl<'a> StackTrace<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, StackTrace<'a>> {
        let (frame_ids, (stack_trace_serial, thread_serial, num_frame_ids)) =
            tuple((number::be_u32, number::be_u32, number::be_u32))(input)?;

        Ok(StackTrace {
            id_size,
            stack_trace_serial,
            thread_serial,
            num_frame_ids,
            frame_ids,
        })
    }

    pub fn frame_ids(&self) -> Ids<'a> {
        Ids::with_ids(self.frame_ids, self.num_frame_ids, self.id_size)
    }
}

/// Per-site allocation statistics the VM emits after a GC pass.
#[derive(CopyGetters, Copy, Clone)]
pub struct AllocSites<'a> {
    #[get_copy = "pub"]
    flags: AllocSitesFlags,
    #[get_copy = "pub"]
    cutoff_ratio: u32,
    #[get_copy = "pub"]
    total_live_bytes: u32,
    #[get_copy = "pub"]
    total_live_instances: u32,
    #[get_copy = "pub"]
    total_bytes_allocated: u64,
    #[get_copy = "pub"]
    total_instances_allocated: u64,
    #[get_copy = "pub"]
    num_sites: u32,
    sites: &'a [u8],
}

impl<'a> AllocSites<'a> {
    pub(crate) fn parse(input: &'a [u8]) -> ParseResult<'a, AllocSites<'a>> {
        let (
            sites,
            (
                bits,
                cutoff_ratio,
                total_live_bytes,
                total_live_instances,
                total_bytes_allocated,
                total_instances_allocated,
                num_sites,
            ),
        ) = tuple((
            number::be_u16,
            number::be_u32,
            number::be_u32,
            number::be_u32,
            number::be_u64,
            number::be_u64,
            number::be_u32,
        ))(input)?;

        Ok(AllocSites {
            flags: AllocSitesFlags { bits },
            cutoff_ratio,
            total_live_bytes,
            total_live_instances,
            total_bytes_allocated,
            total_instances_allocated,
            num_sites,
            sites,
        })
    }

    pub fn sites(&self) -> AllocSiteIter<'a> {
        AllocSiteIter::packed(self.sites, self.num_sites)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocSitesFlags {
    bits: u16,
}

impl AllocSitesFlags {
    pub fn mode(&self) -> AllocSitesFlagsMode {
        if self.bits & 0x0001 > 0 {
            AllocSitesFlagsMode::Incremental
        } else {
            AllocSitesFlagsMode::Complete
        }
    }

    pub fn sorting(&self) -> AllocSitesFlagsSorting {
        if self.bits & 0x0002 > 0 {
            AllocSitesFlagsSorting::Allocation
        } else {
            AllocSitesFlagsSorting::Live
        }
    }

    pub fn force_gc(&self) -> bool {
        self.bits & 0x0004 > 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocSitesFlagsMode {
    Incremental,
    Complete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocSitesFlagsSorting {
    Allocation,
    Live,
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct AllocSite {
    /// Raw object-or-array indicator byte as written by the VM.
    #[get_copy = "pub"]
    is_array: u8,
    /// Zero while the VM is still bootstrapping.
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    num_bytes_alive: u32,
    #[get_copy = "pub"]
    num_instances_alive: u32,
    #[get_copy = "pub"]
    num_bytes_allocated: u32,
    #[get_copy = "pub"]
    num_instances_allocated: u32,
}

impl FromBytes for AllocSite {
    fn decode(bytes: &mut &[u8], _id_size: IdSize) -> Option<AllocSite> {
        // fields decode in declaration order, which is wire order
        Some(AllocSite {
            is_array: take_u8(bytes)?,
            class_serial: take_u32(bytes)?,
            stack_trace_serial: take_u32(bytes)?,
            num_bytes_alive: take_u32(bytes)?,
            num_instances_alive: take_u32(bytes)?,
            num_bytes_allocated: take_u32(bytes)?,
            num_instances_allocated: take_u32(bytes)?,
        })
    }
}

pub type AllocSiteIter<'a> = Elements<'a, AllocSite>;

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StartThread {
    #[get_copy = "pub"]
    thread_serial: Serial,
    #[get_copy = "pub"]
    thread_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_name_id: Id,
    #[get_copy = "pub"]
    thread_group_name_id: Id,
    #[get_copy = "pub"]
    thread_group_parent_name_id: Id,
}

impl StartThread {
    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> ParseResult<'_, StartThread> {
        let (
            _,
            (
                thread_serial,
                thread_id,
                stack_trace_serial,
                thread_name_id,
                thread_group_name_id,
                thread_group_parent_name_id,
            ),
        ) = tuple((
            number::be_u32,
            id(id_size),
            number::be_u32,
            id(id_size),
            id(id_size),
            id(id_size),
        ))(input)?;

        Ok(StartThread {
            thread_serial,
            thread_id,
            stack_trace_serial,
            thread_name_id,
            thread_group_name_id,
            thread_group_parent_name_id,
        })
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct HeapSummary {
    #[get_copy = "pub"]
    total_live_bytes: u32,
    #[get_copy = "pub"]
    total_live_instances: u32,
    #[get_copy = "pub"]
    total_bytes_allocated: u64,
    #[get_copy = "pub"]
    total_instances_allocated: u64,
}

impl HeapSummary {
    pub(crate) fn parse(input: &[u8]) -> ParseResult<'_, HeapSummary> {
        let (
            _,
            (total_live_bytes, total_live_instances, total_bytes_allocated, total_instances_allocated),
        ) = tuple((number::be_u32, number::be_u32, number::be_u64, number::be_u64))(input)?;

        Ok(HeapSummary {
            total_live_bytes,
            total_live_instances,
            total_bytes_allocated,
            total_instances_allocated,
        })
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct CpuSamples<'a> {
    #[get_copy = "pub"]
    total_samples: u32,
    #[get_copy = "pub"]
    num_traces: u32,
    traces: &'a [u8],
}

impl<'a> CpuSamples<'a> {
    pub(crate) fn parse(input: &'a [u8]) -> ParseResult<'a, CpuSamples<'a>> {
        let (traces, (total_samples, num_traces)) =
            tuple((number::be_u32, number::be_u32))(input)?;

        Ok(CpuSamples {
            total_samples,
            num_traces,
            traces,
        })
    }

    pub fn traces(&self) -> CpuSampleIter<'a> {
        CpuSampleIter::packed(self.traces, self.num_traces)
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct CpuSample {
    #[get_copy = "pub"]
    num_samples: u32,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
}

impl FromBytes for CpuSample {
    fn decode(bytes: &mut &[u8], _id_size: IdSize) -> Option<CpuSample> {
        Some(CpuSample {
            num_samples: take_u32(bytes)?,
            stack_trace_serial: take_u32(bytes)?,
        })
    }
}

pub type CpuSampleIter<'a> = Elements<'a, CpuSample>;

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct ControlSettings {
    #[get_copy = "pub"]
    bits: u32,
    #[get_copy = "pub"]
    stack_trace_depth: u16,
}

impl ControlSettings {
    pub(crate) fn parse(input: &[u8]) -> ParseResult<'_, ControlSettings> {
        let (_, (bits, stack_trace_depth)) = tuple((number::be_u32, number::be_u16))(input)?;

        Ok(ControlSettings {
            bits,
            stack_trace_depth,
        })
    }
}

fn parse_serial(input: &[u8]) -> ParseResult<'_, Serial> {
    let (_input, serial) = number::be_u32(input)?;
    Ok(serial)
}

/// Structural failure inside a body whose bytes the frame promised.
fn parsed<T>(res: ParseResult<'_, T>) -> Result<T, HprofError> {
    res.map_err(|_| HprofError::BufferUnderflow)
}

/// Outer decode loop. `EndOfStream` before the first byte of a frame is the
/// normal terminator; inside a frame it propagates.
pub(crate) fn decode_records<S: ChunkSource, V: HprofVisitor + ?Sized>(
    buf: &mut ReadBuffer<S>,
    visitor: &mut V,
    interests: &Interests,
    id_size: IdSize,
    flags: DecodeFlags,
) -> Result<(), HprofError> {
    loop {
        let tag_byte = match buf.get_u8() {
            Ok(byte) => byte,
            Err(HprofError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        };
        let ts_delta = buf.get_u32()?;
        let length = buf.get_u32()?;
        log::trace!(
            "record tag {:#04X} at {}: {} byte body",
            tag_byte,
            buf.position(),
            length
        );

        if !visitor.record(tag_byte, ts_delta, length) {
            buf.skip(length as u64)?;
            continue;
        }

        match RecordTag::from_byte(tag_byte) {
            Some(tag @ (RecordTag::HeapDump | RecordTag::HeapDumpSegment))
                if interests.any_heap_dump() =>
            {
                if interests.heap_dump {
                    visitor.heap_dump_begin(tag, ts_delta, length)?;
                }
                heap_dump::decode_segment(buf, visitor, interests, id_size, flags, length)?;
            }
            Some(RecordTag::HeapDumpEnd) if interests.heap_dump => {
                buf.skip(length as u64)?;
                visitor.heap_dump_end(ts_delta)?;
            }
            Some(tag) if interests.wants_record(tag) => {
                let body = buf.get(length as usize)?;
                dispatch_body(tag, body, id_size, visitor)?;
            }
            _ => {
                if interests.raw {
                    let body = buf.get(length as usize)?;
                    visitor.raw(tag_byte, ts_delta, body)?;
                } else {
                    buf.skip(length as u64)?;
                }
            }
        }
    }
}

fn dispatch_body<V: HprofVisitor + ?Sized>(
    tag: RecordTag,
    body: &[u8],
    id_size: IdSize,
    visitor: &mut V,
) -> Result<(), HprofError> {
    match tag {
        RecordTag::Utf8 => {
            let utf8 = parsed(Utf8::parse(body, id_size))?;
            visitor.utf8(&utf8)
        }
        RecordTag::LoadClass => {
            let load_class = parsed(LoadClass::parse(body, id_size))?;
            visitor.load_class(&load_class)
        }
        RecordTag::UnloadClass => {
            let serial = parsed(parse_serial(body))?;
            visitor.unload_class(serial)
        }
        RecordTag::StackFrame => {
            let frame = parsed(StackFrame::parse(body, id_size))?;
            visitor.stack_frame(&frame)
        }
        RecordTag::StackTrace => {
            let trace = parsed(StackTrace::parse(body, id_size))?;
            visitor.stack_trace(&trace)
        }
        RecordTag::AllocSites => {
            let alloc_sites = parsed(AllocSites::parse(body))?;
            visitor.alloc_sites(&alloc_sites)
        }
        RecordTag::HeapSummary => {
            let summary = parsed(HeapSummary::parse(body))?;
            visitor.heap_summary(&summary)
        }
        RecordTag::StartThread => {
            let start_thread = parsed(StartThread::parse(body, id_size))?;
            visitor.start_thread(&start_thread)
        }
        RecordTag::EndThread => {
            let serial = parsed(parse_serial(body))?;
            visitor.end_thread(serial)
        }
        RecordTag::CpuSamples => {
            let samples = parsed(CpuSamples::parse(body))?;
            visitor.cpu_samples(&samples)
        }
        RecordTag::ControlSettings => {
            let settings = parsed(ControlSettings::parse(body))?;
            visitor.control_settings(&settings)
        }
        // heap dump records never reach the body dispatcher; their bodies
        // stream through the sub-record decoder
        RecordTag::HeapDump | RecordTag::HeapDumpSegment | RecordTag::HeapDumpEnd => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stream::{Bytes, StreamBuilder, BANNER};
    use crate::{read, DecodeFlags, Header};
    use itertools::Itertools;

    /// Records every callback as a compact event string.
    #[derive(Default)]
    pub(crate) struct EventLog {
        pub(crate) interests: Option<Interests>,
        pub(crate) events: Vec<String>,
    }

    impl EventLog {
        pub(crate) fn with_interests(interests: Interests) -> EventLog {
            EventLog {
                interests: Some(interests),
                events: Vec::new(),
            }
        }
    }

    impl HprofVisitor for EventLog {
        fn interests(&self) -> Interests {
            self.interests.unwrap_or_else(Interests::all)
        }

        fn header(&mut self, header: &Header<'_>) -> Result<(), HprofError> {
            self.events.push(format!(
                "header {} {} {}",
                header.label().unwrap(),
                header.id_size().size_in_bytes(),
                header.timestamp_millis()
            ));
            Ok(())
        }

        fn utf8(&mut self, utf8: &Utf8<'_>) -> Result<(), HprofError> {
            self.events.push(format!(
                "utf8 {} {}",
                utf8.name_id(),
                utf8.text_as_str().unwrap_or("(invalid)")
            ));
            Ok(())
        }

        fn load_class(&mut self, lc: &LoadClass) -> Result<(), HprofError> {
            self.events.push(format!(
                "load_class {} {} {}",
                lc.class_serial(),
                lc.class_obj_id(),
                lc.class_name_id()
            ));
            Ok(())
        }

        fn unload_class(&mut self, serial: Serial) -> Result<(), HprofError> {
            self.events.push(format!("unload_class {}", serial));
            Ok(())
        }

        fn stack_frame(&mut self, frame: &StackFrame) -> Result<(), HprofError> {
            self.events
                .push(format!("stack_frame {} {}", frame.id(), frame.line_num()));
            Ok(())
        }

        fn stack_trace(&mut self, trace: &StackTrace<'_>) -> Result<(), HprofError> {
            let ids = trace.frame_ids().map(|r| r.unwrap().id()).join(",");
            self.events
                .push(format!("stack_trace {} [{}]", trace.stack_trace_serial(), ids));
            Ok(())
        }

        fn end_thread(&mut self, serial: Serial) -> Result<(), HprofError> {
            self.events.push(format!("end_thread {}", serial));
            Ok(())
        }

        fn heap_dump_begin(
            &mut self,
            tag: RecordTag,
            _ts_delta: u32,
            length: u32,
        ) -> Result<(), HprofError> {
            self.events.push(format!("heap_dump {:?} {}", tag, length));
            Ok(())
        }

        fn heap_dump_end(&mut self, _ts_delta: u32) -> Result<(), HprofError> {
            self.events.push("heap_dump_end".to_string());
            Ok(())
        }

        fn raw(&mut self, tag: u8, _ts_delta: u32, body: &[u8]) -> Result<(), HprofError> {
            self.events
                .push(format!("raw {:#04X} {} bytes", tag, body.len()));
            Ok(())
        }

        fn end(&mut self) -> Result<(), HprofError> {
            self.events.push("end".to_string());
            Ok(())
        }
    }

    #[test]
    fn minimal_stream_header_only() {
        let source = StreamBuilder::new(IdSize::U64).into_source();
        let mut log = EventLog::default();

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        assert_eq!(
            vec![format!("header {} 8 0", BANNER), "end".to_string()],
            log.events
        );
    }

    #[test]
    fn utf8_record_round_trip() {
        let builder = StreamBuilder::new(IdSize::U64);
        let body = builder.body().id(1).raw(b"java/lang/Object").take();
        let source = builder.record(0x01, 0, &body).into_source();
        let mut log = EventLog::default();

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        assert_eq!("utf8 1 java/lang/Object", log.events[1]);
    }

    #[test]
    fn records_delivered_in_file_order() {
        let builder = StreamBuilder::new(IdSize::U64);
        let utf8 = builder.body().id(5).raw(b"LFoo;").take();
        let load = builder.body().u32(1).id(44).u32(0).id(5).take();
        let end_thread = builder.body().u32(9).take();
        let source = builder
            .record(0x01, 0, &utf8)
            .record(0x02, 0, &load)
            .record(0x0B, 0, &end_thread)
            .record(0x2C, 0, &[])
            .into_source();
        let mut log = EventLog::default();

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        assert_eq!(
            vec![
                format!("header {} 8 0", BANNER),
                "utf8 5 LFoo;".to_string(),
                "load_class 1 44 5".to_string(),
                "end_thread 9".to_string(),
                "heap_dump_end".to_string(),
                "end".to_string(),
            ],
            log.events
        );
    }

    #[test]
    fn unknown_tag_goes_to_raw_when_wanted() {
        let source = StreamBuilder::new(IdSize::U64)
            .record(0x77, 0, &[1, 2, 3])
            .into_source();
        let mut interests = Interests::none();
        interests.raw = true;
        let mut log = EventLog::with_interests(interests);

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        assert!(log.events.contains(&"raw 0x77 3 bytes".to_string()));
    }

    #[test]
    fn unknown_tag_skipped_without_raw_interest() {
        let builder = StreamBuilder::new(IdSize::U64);
        let end_thread = builder.body().u32(3).take();
        let source = builder
            .record(0x77, 0, &[1, 2, 3])
            .record(0x0B, 0, &end_thread)
            .into_source();
        let mut log = EventLog::default();

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        // the unknown record is silently skipped, the next one still parses
        assert_eq!("end_thread 3", log.events[1]);
    }

    #[test]
    fn uninterested_records_go_to_raw() {
        let builder = StreamBuilder::new(IdSize::U64);
        let utf8 = builder.body().id(1).raw(b"x").take();
        let source = builder.record(0x01, 0, &utf8).into_source();
        let mut interests = Interests::none();
        interests.raw = true;
        let mut log = EventLog::with_interests(interests);

        read(source, &mut log, DecodeFlags::NONE).unwrap();

        assert!(log.events.contains(&"raw 0x01 9 bytes".to_string()));
    }

    #[test]
    fn record_gate_skips_everything() {
        struct GateShut {
            saw_utf8: bool,
        }

        impl HprofVisitor for GateShut {
            fn record(&mut self, _tag: u8, _ts: u32, _length: u32) -> bool {
                false
            }

            fn utf8(&mut self, _utf8: &Utf8<'_>) -> Result<(), HprofError> {
                self.saw_utf8 = true;
                Ok(())
            }
        }

        let builder = StreamBuilder::new(IdSize::U64);
        let utf8 = builder.body().id(1).raw(b"x").take();
        let source = builder.record(0x01, 0, &utf8).into_source();
        let mut visitor = GateShut { saw_utf8: false };

        read(source, &mut visitor, DecodeFlags::NONE).unwrap();

        assert!(!visitor.saw_utf8);
    }

    #[test]
    fn no_interest_trajectory_matches_full_interest() {
        let builder = StreamBuilder::new(IdSize::U64);
        let utf8 = builder.body().id(1).raw(b"abc").take();
        let load = builder.body().u32(1).id(2).u32(0).id(1).take();
        let bytes = builder
            .record(0x01, 0, &utf8)
            .record(0x02, 0, &load)
            .finish();

        let mut all = EventLog::default();
        read(
            crate::test_stream::Chunks::whole(bytes.clone()),
            &mut all,
            DecodeFlags::NONE,
        )
        .unwrap();

        let mut none = EventLog::with_interests(Interests::none());
        read(
            crate::test_stream::Chunks::whole(bytes),
            &mut none,
            DecodeFlags::NONE,
        )
        .unwrap();

        // both decoders drained the whole stream
        assert_eq!("end", all.events.last().unwrap());
        assert_eq!("end", none.events.last().unwrap());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut bytes = StreamBuilder::new(IdSize::U64).finish();
        bytes.push(0x01); // tag with no frame behind it
        let source = crate::test_stream::Chunks::whole(bytes);
        let mut log = EventLog::default();

        match read(source, &mut log, DecodeFlags::NONE) {
            Err(HprofError::EndOfStream) => {}
            other => panic!("expected EndOfStream, got {:?}", other),
        }
        // end is never reported for a broken stream
        assert!(!log.events.iter().any(|e| e == "end"));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let source = StreamBuilder::new(IdSize::U64)
            .record_with_length(0x0B, 0, 4, &[0, 0]) // declares 4, carries 2
            .into_source();
        let mut log = EventLog::default();

        assert!(matches!(
            read(source, &mut log, DecodeFlags::NONE),
            Err(HprofError::EndOfStream)
        ));
    }

    #[test]
    fn visitor_error_propagates() {
        struct Failing;

        impl HprofVisitor for Failing {
            fn utf8(&mut self, _utf8: &Utf8<'_>) -> Result<(), HprofError> {
                Err(HprofError::BufferUnderflow)
            }
        }

        let builder = StreamBuilder::new(IdSize::U64);
        let utf8 = builder.body().id(1).raw(b"x").take();
        let source = builder.record(0x01, 0, &utf8).into_source();

        assert!(matches!(
            read(source, &mut Failing, DecodeFlags::NONE),
            Err(HprofError::BufferUnderflow)
        ));
    }

    #[test]
    fn stack_frame_line_nums() {
        let id_size = IdSize::U32;
        for (raw, expected) in [
            (17, LineNum::Normal(17)),
            (-1, LineNum::Unknown),
            (-2, LineNum::CompiledMethod),
            (-3, LineNum::NativeMethod),
            (0, LineNum::Unknown),
        ] {
            let body = Bytes::new(id_size)
                .id(1)
                .id(2)
                .id(3)
                .id(4)
                .u32(7)
                .i32(raw)
                .take();
            let frame = StackFrame::parse(&body, id_size).unwrap();
            assert_eq!(expected, frame.line_num());
            assert_eq!(7, frame.class_serial());
        }
    }

    #[test]
    fn stack_trace_frame_ids() {
        let body = Bytes::new(IdSize::U64)
            .u32(11)
            .u32(22)
            .u32(3)
            .id(100)
            .id(200)
            .id(300)
            .take();

        let trace = StackTrace::parse(&body, IdSize::U64).unwrap();
        assert_eq!(11, trace.stack_trace_serial());
        assert_eq!(22, trace.thread_serial());
        let ids = trace.frame_ids().map(|r| r.unwrap().id()).collect_vec();
        assert_eq!(vec![100, 200, 300], ids);
    }

    #[test]
    fn alloc_sites_iterates_fixed_width_sites() {
        let site = |serial: u32| {
            Bytes::new(IdSize::U64)
                .u8(0)
                .u32(serial)
                .u32(1)
                .u32(10)
                .u32(2)
                .u32(20)
                .u32(4)
                .take()
        };
        let body = Bytes::new(IdSize::U64)
            .u16(0x0003)
            .u32(0)
            .u32(1000)
            .u32(10)
            .u64(2000)
            .u64(20)
            .u32(2)
            .raw(&site(7))
            .raw(&site(8))
            .take();

        let alloc_sites = AllocSites::parse(&body).unwrap();
        assert_eq!(AllocSitesFlagsMode::Incremental, alloc_sites.flags().mode());
        assert_eq!(
            AllocSitesFlagsSorting::Allocation,
            alloc_sites.flags().sorting()
        );
        assert!(!alloc_sites.flags().force_gc());
        assert_eq!(2, alloc_sites.num_sites());

        let serials = alloc_sites
            .sites()
            .map(|r| r.unwrap().class_serial())
            .collect_vec();
        assert_eq!(vec![7, 8], serials);
    }

    #[test]
    fn cpu_samples_traces() {
        let body = Bytes::new(IdSize::U64)
            .u32(30)
            .u32(2)
            .u32(10)
            .u32(1)
            .u32(20)
            .u32(2)
            .take();

        let samples = CpuSamples::parse(&body).unwrap();
        assert_eq!(30, samples.total_samples());
        let pairs = samples
            .traces()
            .map(|r| {
                let s = r.unwrap();
                (s.num_samples(), s.stack_trace_serial())
            })
            .collect_vec();
        assert_eq!(vec![(10, 1), (20, 2)], pairs);
    }

    #[test]
    fn heap_summary_and_control_settings() {
        let body = Bytes::new(IdSize::U64).u32(1).u32(2).u64(3).u64(4).take();
        let summary = HeapSummary::parse(&body).unwrap();
        assert_eq!(1, summary.total_live_bytes());
        assert_eq!(4, summary.total_instances_allocated());

        let body = Bytes::new(IdSize::U64).u32(0x5).u16(16).take();
        let settings = ControlSettings::parse(&body).unwrap();
        assert_eq!(0x5, settings.bits());
        assert_eq!(16, settings.stack_trace_depth());
    }

    #[test]
    fn start_thread_fields() {
        let body = Bytes::new(IdSize::U64)
            .u32(1)
            .id(0xAA)
            .u32(2)
            .id(0xBB)
            .id(0xCC)
            .id(0xDD)
            .take();

        let start = StartThread::parse(&body, IdSize::U64).unwrap();
        assert_eq!(1, start.thread_serial());
        assert_eq!(0xAA, start.thread_id().id());
        assert_eq!(0xDD, start.thread_group_parent_name_id().id());
    }

    #[test]
    fn utf8_with_invalid_bytes_still_delivers() {
        let body = Bytes::new(IdSize::U64).id(9).raw(&[0xFF, 0xFE]).take();
        let utf8 = Utf8::parse(&body, IdSize::U64).unwrap();
        assert_eq!(9, utf8.name_id().id());
        assert!(utf8.text_as_str().is_err());
        assert_eq!(&[0xFF, 0xFE], utf8.text());
    }

    #[test]
    fn utf8_shorter_than_id_is_rejected() {
        let body = [0_u8; 4]; // id size 8 needs at least 8 bytes
        assert!(Utf8::parse(&body, IdSize::U64).is_err());
    }
}
