//! Visitor seam: per-record callbacks plus the up-front interest set that
//! lets the decoder skip whole records and sub-records without field parsing.

use crate::heap_dump::{ClassDump, GcRoot, InstanceDump, ObjectArray, PrimitiveArray};
use crate::record::{
    AllocSites, ControlSettings, CpuSamples, HeapSummary, LoadClass, StackFrame, StackTrace,
    StartThread, Utf8,
};
use crate::{Header, HprofError, RecordTag, Serial};

/// Which records and heap sub-records a visitor wants parsed. Computed once
/// at decode start; everything not asked for is skipped by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interests {
    pub utf8: bool,
    pub load_class: bool,
    pub unload_class: bool,
    pub stack_frame: bool,
    pub stack_trace: bool,
    pub alloc_sites: bool,
    pub heap_summary: bool,
    pub start_thread: bool,
    pub end_thread: bool,
    /// Heap dump framing: `heap_dump_begin` / `heap_dump_end` callbacks.
    pub heap_dump: bool,
    pub cpu_samples: bool,
    pub control_settings: bool,
    pub gc_roots: bool,
    pub gc_class_dump: bool,
    pub gc_instance_dump: bool,
    pub gc_obj_array_dump: bool,
    pub gc_prim_array_dump: bool,
    /// Deliver records nobody parses (including unknown tags) as raw bytes.
    pub raw: bool,
}

impl Interests {
    pub fn all() -> Interests {
        Interests {
            utf8: true,
            load_class: true,
            unload_class: true,
            stack_frame: true,
            stack_trace: true,
            alloc_sites: true,
            heap_summary: true,
            start_thread: true,
            end_thread: true,
            heap_dump: true,
            cpu_samples: true,
            control_settings: true,
            gc_roots: true,
            gc_class_dump: true,
            gc_instance_dump: true,
            gc_obj_array_dump: true,
            gc_prim_array_dump: true,
            raw: false,
        }
    }

    pub fn none() -> Interests {
        Interests {
            utf8: false,
            load_class: false,
            unload_class: false,
            stack_frame: false,
            stack_trace: false,
            alloc_sites: false,
            heap_summary: false,
            start_thread: false,
            end_thread: false,
            heap_dump: false,
            cpu_samples: false,
            control_settings: false,
            gc_roots: false,
            gc_class_dump: false,
            gc_instance_dump: false,
            gc_obj_array_dump: false,
            gc_prim_array_dump: false,
            raw: false,
        }
    }

    pub(crate) fn wants_record(&self, tag: RecordTag) -> bool {
        match tag {
            RecordTag::Utf8 => self.utf8,
            RecordTag::LoadClass => self.load_class,
            RecordTag::UnloadClass => self.unload_class,
            RecordTag::StackFrame => self.stack_frame,
            RecordTag::StackTrace => self.stack_trace,
            RecordTag::AllocSites => self.alloc_sites,
            RecordTag::HeapSummary => self.heap_summary,
            RecordTag::StartThread => self.start_thread,
            RecordTag::EndThread => self.end_thread,
            RecordTag::HeapDump | RecordTag::HeapDumpSegment | RecordTag::HeapDumpEnd => {
                self.heap_dump
            }
            RecordTag::CpuSamples => self.cpu_samples,
            RecordTag::ControlSettings => self.control_settings,
        }
    }

    /// Whether a heap dump body needs to be walked at all.
    pub(crate) fn any_heap_dump(&self) -> bool {
        self.heap_dump
            || self.gc_roots
            || self.gc_class_dump
            || self.gc_instance_dump
            || self.gc_obj_array_dump
            || self.gc_prim_array_dump
    }
}

/// Per-record callbacks, all optional.
///
/// Slices handed to callbacks alias the decoder's buffer window and are valid
/// only for the duration of the call; copy anything that must outlive it.
/// Returning an error aborts the decode and surfaces from [`crate::read`]
/// unchanged.
pub trait HprofVisitor {
    fn interests(&self) -> Interests {
        Interests::all()
    }

    fn header(&mut self, _header: &Header<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    /// Per-record gate, consulted before any body bytes are read. Returning
    /// false skips the record entirely. The tag arrives as the raw byte so
    /// unrecognized tags can be gated too.
    fn record(&mut self, _tag: u8, _ts_delta: u32, _length: u32) -> bool {
        true
    }

    fn utf8(&mut self, _utf8: &Utf8<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn load_class(&mut self, _load_class: &LoadClass) -> Result<(), HprofError> {
        Ok(())
    }

    fn unload_class(&mut self, _class_serial: Serial) -> Result<(), HprofError> {
        Ok(())
    }

    fn stack_frame(&mut self, _frame: &StackFrame) -> Result<(), HprofError> {
        Ok(())
    }

    fn stack_trace(&mut self, _trace: &StackTrace<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn alloc_sites(&mut self, _alloc_sites: &AllocSites<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn start_thread(&mut self, _start_thread: &StartThread) -> Result<(), HprofError> {
        Ok(())
    }

    fn end_thread(&mut self, _thread_serial: Serial) -> Result<(), HprofError> {
        Ok(())
    }

    fn heap_summary(&mut self, _summary: &HeapSummary) -> Result<(), HprofError> {
        Ok(())
    }

    fn cpu_samples(&mut self, _samples: &CpuSamples<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn control_settings(&mut self, _settings: &ControlSettings) -> Result<(), HprofError> {
        Ok(())
    }

    /// Start of a `HeapDump` or `HeapDumpSegment` record body.
    fn heap_dump_begin(
        &mut self,
        _tag: RecordTag,
        _ts_delta: u32,
        _length: u32,
    ) -> Result<(), HprofError> {
        Ok(())
    }

    fn gc_root(&mut self, _root: &GcRoot) -> Result<(), HprofError> {
        Ok(())
    }

    fn gc_class_dump(&mut self, _class: &ClassDump) -> Result<(), HprofError> {
        Ok(())
    }

    fn gc_instance_dump(&mut self, _instance: &InstanceDump<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn gc_obj_array_dump(&mut self, _array: &ObjectArray<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn gc_prim_array_dump(&mut self, _array: &PrimitiveArray<'_>) -> Result<(), HprofError> {
        Ok(())
    }

    fn heap_dump_end(&mut self, _ts_delta: u32) -> Result<(), HprofError> {
        Ok(())
    }

    /// Body bytes of a record nobody parses, delivered verbatim when
    /// [`Interests::raw`] is set.
    fn raw(&mut self, _tag: u8, _ts_delta: u32, _body: &[u8]) -> Result<(), HprofError> {
        Ok(())
    }

    /// Fires exactly once, after the last record of a well-formed stream.
    fn end(&mut self) -> Result<(), HprofError> {
        Ok(())
    }
}
