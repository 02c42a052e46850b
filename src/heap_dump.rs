//! Heap dump sub-record decoding.
//!
//! `HeapDump` / `HeapDumpSegment` bodies are a packed sequence of sub-records
//! with no per-item length fields; length is implied by the tag, the
//! identifier width, and inline counts. The decoder accounts for every byte
//! consumed and insists the total matches the record's declared length.

use crate::buffer::{ChunkSource, ReadBuffer};
use crate::{
    DecodeFlags, HprofError, HprofVisitor, Id, IdSize, Ids, Interests, JavaType, JavaValue, Serial,
};
use getset::CopyGetters;

mod primitive_array;

pub use primitive_array::{
    Booleans, Bytes, Chars, Doubles, Floats, Ints, Longs, PrimitiveArray, PrimitiveArrayType,
    Shorts,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SubRecordTag {
    RootUnknown,
    RootJniGlobal,
    RootJniLocal,
    RootJavaFrame,
    RootNativeStack,
    RootStickyClass,
    RootThreadBlock,
    RootMonitorUsed,
    RootThreadObject,
    ClassDump,
    InstanceDump,
    ObjectArrayDump,
    PrimitiveArrayDump,
}

impl SubRecordTag {
    pub fn from_byte(byte: u8) -> Option<SubRecordTag> {
        match byte {
            0xFF => Some(SubRecordTag::RootUnknown),
            0x01 => Some(SubRecordTag::RootJniGlobal),
            0x02 => Some(SubRecordTag::RootJniLocal),
            0x03 => Some(SubRecordTag::RootJavaFrame),
            0x04 => Some(SubRecordTag::RootNativeStack),
            0x05 => Some(SubRecordTag::RootStickyClass),
            0x06 => Some(SubRecordTag::RootThreadBlock),
            0x07 => Some(SubRecordTag::RootMonitorUsed),
            0x08 => Some(SubRecordTag::RootThreadObject),
            0x20 => Some(SubRecordTag::ClassDump),
            0x21 => Some(SubRecordTag::InstanceDump),
            0x22 => Some(SubRecordTag::ObjectArrayDump),
            0x23 => Some(SubRecordTag::PrimitiveArrayDump),
            _ => None,
        }
    }

    pub fn tag_byte(&self) -> u8 {
        match self {
            SubRecordTag::RootUnknown => 0xFF,
            SubRecordTag::RootJniGlobal => 0x01,
            SubRecordTag::RootJniLocal => 0x02,
            SubRecordTag::RootJavaFrame => 0x03,
            SubRecordTag::RootNativeStack => 0x04,
            SubRecordTag::RootStickyClass => 0x05,
            SubRecordTag::RootThreadBlock => 0x06,
            SubRecordTag::RootMonitorUsed => 0x07,
            SubRecordTag::RootThreadObject => 0x08,
            SubRecordTag::ClassDump => 0x20,
            SubRecordTag::InstanceDump => 0x21,
            SubRecordTag::ObjectArrayDump => 0x22,
            SubRecordTag::PrimitiveArrayDump => 0x23,
        }
    }

    /// Serialized body width (excluding the tag byte) for the constant-width
    /// GC root sub-records; `None` for the tags whose width depends on inline
    /// counts. Drives the no-interest skip fast path.
    pub fn constant_width(&self, id_size: IdSize) -> Option<u64> {
        let id = id_size.size_in_bytes() as u64;
        match self {
            SubRecordTag::RootUnknown
            | SubRecordTag::RootStickyClass
            | SubRecordTag::RootMonitorUsed => Some(id),
            SubRecordTag::RootJniGlobal => Some(2 * id),
            SubRecordTag::RootJniLocal
            | SubRecordTag::RootJavaFrame
            | SubRecordTag::RootThreadObject => Some(id + 8),
            SubRecordTag::RootNativeStack | SubRecordTag::RootThreadBlock => Some(id + 4),
            SubRecordTag::ClassDump
            | SubRecordTag::InstanceDump
            | SubRecordTag::ObjectArrayDump
            | SubRecordTag::PrimitiveArrayDump => None,
        }
    }
}

/// One GC root. Thread-object ids and frame indices use `None` where the VM
/// writes a null id / -1 (JNI-attached threads have no thread object yet).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GcRoot {
    Unknown {
        obj_id: Id,
    },
    JniGlobal {
        obj_id: Id,
        jni_global_ref_id: Id,
    },
    JniLocal {
        obj_id: Id,
        thread_serial: Serial,
        frame_index: Option<u32>,
    },
    JavaFrame {
        obj_id: Id,
        thread_serial: Serial,
        frame_index: Option<u32>,
    },
    NativeStack {
        obj_id: Id,
        thread_serial: Serial,
    },
    StickyClass {
        obj_id: Id,
    },
    ThreadBlock {
        obj_id: Id,
        thread_serial: Serial,
    },
    MonitorUsed {
        obj_id: Id,
    },
    ThreadObject {
        thread_obj_id: Option<Id>,
        thread_serial: Serial,
        stack_trace_serial: Serial,
    },
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct ConstantPoolEntry {
    #[get_copy = "pub"]
    index: u16,
    #[get_copy = "pub"]
    entry_type: JavaType,
    /// `None` when values are skipped via [`DecodeFlags::SKIP_VALUES`].
    #[get_copy = "pub"]
    value: Option<JavaValue>,
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StaticFieldEntry {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    field_type: JavaType,
    /// `None` when values are skipped via [`DecodeFlags::SKIP_VALUES`].
    #[get_copy = "pub"]
    value: Option<JavaValue>,
}

/// An instance field declaration: name and type, no value (values live in
/// instance dumps).
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct FieldDescriptor {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    field_type: JavaType,
}

#[derive(CopyGetters, Clone, Debug)]
pub struct ClassDump {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    super_class_obj_id: Option<Id>,
    #[get_copy = "pub"]
    class_loader_obj_id: Option<Id>,
    #[get_copy = "pub"]
    signers_obj_id: Option<Id>,
    #[get_copy = "pub"]
    protection_domain_obj_id: Option<Id>,
    /// Declared bytes per instance, excluding the object header.
    #[get_copy = "pub"]
    instance_size_bytes: u32,
    constant_pool: Vec<ConstantPoolEntry>,
    static_fields: Vec<StaticFieldEntry>,
    instance_field_descriptors: Vec<FieldDescriptor>,
}

impl ClassDump {
    pub fn constant_pool(&self) -> &[ConstantPoolEntry] {
        &self.constant_pool
    }

    pub fn static_fields(&self) -> &[StaticFieldEntry] {
        &self.static_fields
    }

    /// Just the instance fields declared by this class, not including
    /// superclasses.
    pub fn instance_field_descriptors(&self) -> &[FieldDescriptor] {
        &self.instance_field_descriptors
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct InstanceDump<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    /// Serialized field bytes per the wire, even when the payload itself was
    /// skipped.
    #[get_copy = "pub"]
    data_size: u32,
    /// Raw field bytes, opaque to this decoder. `None` when values are
    /// skipped via [`DecodeFlags::SKIP_VALUES`].
    #[get_copy = "pub"]
    fields: Option<&'a [u8]>,
}

#[derive(CopyGetters, Copy, Clone)]
pub struct ObjectArray<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    array_class_obj_id: Id,
    #[get_copy = "pub"]
    num_elements: u32,
    id_size: IdSize,
    elements: Option<&'a [u8]>,
}

impl<'a> ObjectArray<'a> {
    /// Element reference ids, in file order. Empty when values were skipped.
    pub fn element_ids(&self) -> Ids<'a> {
        match self.elements {
            Some(bytes) => Ids::with_ids(bytes, self.num_elements, self.id_size),
            None => Ids::with_ids(&[], 0, self.id_size),
        }
    }
}

/// Drains exactly `length` bytes of sub-records off the buffer, delivering
/// whatever the visitor asked for. Any disagreement between the declared
/// length and the sub-records actually present is `BufferUnderflow`.
pub(crate) fn decode_segment<S: ChunkSource, V: HprofVisitor + ?Sized>(
    buf: &mut ReadBuffer<S>,
    visitor: &mut V,
    interests: &Interests,
    id_size: IdSize,
    flags: DecodeFlags,
    length: u32,
) -> Result<(), HprofError> {
    let mut remaining = length as u64;
    let mut sub_records = 0_u64;

    while remaining > 0 {
        let start = buf.position();
        match decode_sub_record(buf, visitor, interests, id_size, flags) {
            Ok(()) => {}
            // the record frame promised these bytes; a short source mid
            // sub-record is an accounting violation, not a clean end
            Err(HprofError::EndOfStream) => return Err(HprofError::BufferUnderflow),
            Err(e) => return Err(e),
        }
        let taken = buf.position() - start;
        remaining = remaining
            .checked_sub(taken)
            .ok_or(HprofError::BufferUnderflow)?;
        sub_records += 1;
    }

    log::debug!(
        "heap dump segment: {} sub-records in {} bytes",
        sub_records,
        length
    );
    Ok(())
}

fn decode_sub_record<S: ChunkSource, V: HprofVisitor + ?Sized>(
    buf: &mut ReadBuffer<S>,
    visitor: &mut V,
    interests: &Interests,
    id_size: IdSize,
    flags: DecodeFlags,
) -> Result<(), HprofError> {
    let tag_byte = buf.get_u8()?;
    let tag = SubRecordTag::from_byte(tag_byte)
        .ok_or(HprofError::UnsupportedHeapSubRecord(tag_byte))?;

    // constant-width roots nobody wants: one skip, no field reads
    if !interests.gc_roots {
        if let Some(width) = tag.constant_width(id_size) {
            buf.skip(width)?;
            return Ok(());
        }
    }

    match tag {
        SubRecordTag::RootUnknown => {
            let obj_id = buf.read_id(id_size)?;
            visitor.gc_root(&GcRoot::Unknown { obj_id })
        }
        SubRecordTag::RootJniGlobal => {
            let obj_id = buf.read_id(id_size)?;
            let jni_global_ref_id = buf.read_id(id_size)?;
            visitor.gc_root(&GcRoot::JniGlobal {
                obj_id,
                jni_global_ref_id,
            })
        }
        SubRecordTag::RootJniLocal => {
            let obj_id = buf.read_id(id_size)?;
            let thread_serial = buf.get_u32()?;
            let frame_index = frame_index(buf.get_u32()?);
            visitor.gc_root(&GcRoot::JniLocal {
                obj_id,
                thread_serial,
                frame_index,
            })
        }
        SubRecordTag::RootJavaFrame => {
            let obj_id = buf.read_id(id_size)?;
            let thread_serial = buf.get_u32()?;
            let frame_index = frame_index(buf.get_u32()?);
            visitor.gc_root(&GcRoot::JavaFrame {
                obj_id,
                thread_serial,
                frame_index,
            })
        }
        SubRecordTag::RootNativeStack => {
            let obj_id = buf.read_id(id_size)?;
            let thread_serial = buf.get_u32()?;
            visitor.gc_root(&GcRoot::NativeStack {
                obj_id,
                thread_serial,
            })
        }
        SubRecordTag::RootStickyClass => {
            let obj_id = buf.read_id(id_size)?;
            visitor.gc_root(&GcRoot::StickyClass { obj_id })
        }
        SubRecordTag::RootThreadBlock => {
            let obj_id = buf.read_id(id_size)?;
            let thread_serial = buf.get_u32()?;
            visitor.gc_root(&GcRoot::ThreadBlock {
                obj_id,
                thread_serial,
            })
        }
        SubRecordTag::RootMonitorUsed => {
            let obj_id = buf.read_id(id_size)?;
            visitor.gc_root(&GcRoot::MonitorUsed { obj_id })
        }
        SubRecordTag::RootThreadObject => {
            let thread_obj_id = buf.read_id(id_size)?.non_null();
            let thread_serial = buf.get_u32()?;
            let stack_trace_serial = buf.get_u32()?;
            visitor.gc_root(&GcRoot::ThreadObject {
                thread_obj_id,
                thread_serial,
                stack_trace_serial,
            })
        }
        SubRecordTag::ClassDump => {
            // even an unwanted class dump has to be walked field by field;
            // its width is not knowable up front
            let wanted = interests.gc_class_dump;
            let class = read_class_dump(buf, id_size, flags.skip_values(), wanted)?;
            match class {
                Some(class) if wanted => visitor.gc_class_dump(&class),
                _ => Ok(()),
            }
        }
        SubRecordTag::InstanceDump => {
            let obj_id = buf.read_id(id_size)?;
            let stack_trace_serial = buf.get_u32()?;
            let class_obj_id = buf.read_id(id_size)?;
            let data_size = buf.get_u32()?;

            if !interests.gc_instance_dump {
                return buf.skip(data_size as u64);
            }

            let fields = if flags.skip_values() {
                buf.skip(data_size as u64)?;
                None
            } else {
                Some(buf.get(data_size as usize)?)
            };
            visitor.gc_instance_dump(&InstanceDump {
                obj_id,
                stack_trace_serial,
                class_obj_id,
                data_size,
                fields,
            })
        }
        SubRecordTag::ObjectArrayDump => {
            let obj_id = buf.read_id(id_size)?;
            let stack_trace_serial = buf.get_u32()?;
            let num_elements = buf.get_u32()?;
            let array_class_obj_id = buf.read_id(id_size)?;
            let byte_len = num_elements as u64 * id_size.size_in_bytes() as u64;

            if !interests.gc_obj_array_dump {
                return buf.skip(byte_len);
            }

            let elements = if flags.skip_values() {
                buf.skip(byte_len)?;
                None
            } else {
                Some(buf.get(byte_len as usize)?)
            };
            visitor.gc_obj_array_dump(&ObjectArray {
                obj_id,
                stack_trace_serial,
                array_class_obj_id,
                num_elements,
                id_size,
                elements,
            })
        }
        SubRecordTag::PrimitiveArrayDump => {
            let obj_id = buf.read_id(id_size)?;
            let stack_trace_serial = buf.get_u32()?;
            let num_elements = buf.get_u32()?;
            let primitive_type = PrimitiveArrayType::from_byte(buf.get_u8()?)?;
            let byte_len = num_elements as u64 * primitive_type.byte_size() as u64;

            if !interests.gc_prim_array_dump {
                return buf.skip(byte_len);
            }

            let contents = if flags.skip_values() {
                buf.skip(byte_len)?;
                None
            } else {
                Some(buf.get(byte_len as usize)?)
            };
            visitor.gc_prim_array_dump(&PrimitiveArray::new(
                obj_id,
                stack_trace_serial,
                primitive_type,
                num_elements,
                contents,
            ))
        }
    }
}

fn frame_index(raw: u32) -> Option<u32> {
    // the VM writes -1 for "no frame"
    if raw == u32::MAX {
        None
    } else {
        Some(raw)
    }
}

/// Walks a class dump body. `collect` controls whether the parsed structure
/// is materialized; the walk itself always happens because the body has no
/// length field.
fn read_class_dump<S: ChunkSource>(
    buf: &mut ReadBuffer<S>,
    id_size: IdSize,
    skip_values: bool,
    collect: bool,
) -> Result<Option<ClassDump>, HprofError> {
    let obj_id = buf.read_id(id_size)?;
    let stack_trace_serial = buf.get_u32()?;
    let super_class_obj_id = buf.read_id(id_size)?.non_null();
    let class_loader_obj_id = buf.read_id(id_size)?.non_null();
    let signers_obj_id = buf.read_id(id_size)?.non_null();
    let protection_domain_obj_id = buf.read_id(id_size)?.non_null();
    // two reserved ids, present on the wire but carrying nothing
    buf.skip(2 * id_size.size_in_bytes() as u64)?;
    let instance_size_bytes = buf.get_u32()?;

    let want_values = collect && !skip_values;

    let constant_pool_count = buf.get_u16()?;
    let mut constant_pool = Vec::new();
    for _ in 0..constant_pool_count {
        let index = buf.get_u16()?;
        let entry_type = JavaType::from_byte(buf.get_u8()?)?;
        let value = read_field_value(buf, entry_type, id_size, want_values)?;
        if collect {
            constant_pool.push(ConstantPoolEntry {
                index,
                entry_type,
                value,
            });
        }
    }

    let static_field_count = buf.get_u16()?;
    let mut static_fields = Vec::new();
    for _ in 0..static_field_count {
        let name_id = buf.read_id(id_size)?;
        let field_type = JavaType::from_byte(buf.get_u8()?)?;
        let value = read_field_value(buf, field_type, id_size, want_values)?;
        if collect {
            static_fields.push(StaticFieldEntry {
                name_id,
                field_type,
                value,
            });
        }
    }

    let instance_field_count = buf.get_u16()?;
    let mut instance_field_descriptors = Vec::new();
    for _ in 0..instance_field_count {
        let name_id = buf.read_id(id_size)?;
        let field_type = JavaType::from_byte(buf.get_u8()?)?;
        if collect {
            instance_field_descriptors.push(FieldDescriptor {
                name_id,
                field_type,
            });
        }
    }

    if !collect {
        return Ok(None);
    }

    Ok(Some(ClassDump {
        obj_id,
        stack_trace_serial,
        super_class_obj_id,
        class_loader_obj_id,
        signers_obj_id,
        protection_domain_obj_id,
        instance_size_bytes,
        constant_pool,
        static_fields,
        instance_field_descriptors,
    }))
}

/// Reads or skips one field value; the byte width is consumed either way.
fn read_field_value<S: ChunkSource>(
    buf: &mut ReadBuffer<S>,
    java_type: JavaType,
    id_size: IdSize,
    want_value: bool,
) -> Result<Option<JavaValue>, HprofError> {
    let width = java_type.byte_size(id_size);
    if !want_value {
        buf.skip(width as u64)?;
        return Ok(None);
    }

    let bytes = buf.get(width)?;
    let (_rest, value) =
        JavaValue::parse(bytes, java_type, id_size).map_err(|_| HprofError::BufferUnderflow)?;
    Ok(Some(value))
}
