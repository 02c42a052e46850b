//! Primitive array dumps: the array header plus a packed run of big-endian
//! elements, decoded lazily through [`Elements`].

use crate::elements::{take_array, take_u8, Elements, FromBytes};
use crate::{HprofError, Id, IdSize, Serial};
use getset::CopyGetters;

/// A primitive array dump. Element accessors return `Some` only for the
/// accessor matching the array's element type (e.g. for an int array,
/// `ints()` is `Some` and every other accessor is `None`), and only when
/// element payloads were decoded at all.
#[derive(CopyGetters, Copy, Clone)]
pub struct PrimitiveArray<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    primitive_type: PrimitiveArrayType,
    #[get_copy = "pub"]
    num_elements: u32,
    /// Raw big-endian element bytes; `None` when values are skipped via
    /// [`crate::DecodeFlags::SKIP_VALUES`].
    #[get_copy = "pub"]
    contents: Option<&'a [u8]>,
}

impl<'a> PrimitiveArray<'a> {
    pub(crate) fn new(
        obj_id: Id,
        stack_trace_serial: Serial,
        primitive_type: PrimitiveArrayType,
        num_elements: u32,
        contents: Option<&'a [u8]>,
    ) -> PrimitiveArray<'a> {
        PrimitiveArray {
            obj_id,
            stack_trace_serial,
            primitive_type,
            num_elements,
            contents,
        }
    }

    fn elements_as<T: FromBytes>(&self, want: PrimitiveArrayType) -> Option<Elements<'a, T>> {
        match self.contents {
            Some(contents) if self.primitive_type == want => {
                Some(Elements::packed(contents, self.num_elements))
            }
            _ => None,
        }
    }

    pub fn booleans(&self) -> Option<Booleans<'a>> {
        self.elements_as(PrimitiveArrayType::Boolean)
    }

    pub fn chars(&self) -> Option<Chars<'a>> {
        self.elements_as(PrimitiveArrayType::Char)
    }

    pub fn floats(&self) -> Option<Floats<'a>> {
        self.elements_as(PrimitiveArrayType::Float)
    }

    pub fn doubles(&self) -> Option<Doubles<'a>> {
        self.elements_as(PrimitiveArrayType::Double)
    }

    pub fn bytes(&self) -> Option<Bytes<'a>> {
        self.elements_as(PrimitiveArrayType::Byte)
    }

    pub fn shorts(&self) -> Option<Shorts<'a>> {
        self.elements_as(PrimitiveArrayType::Short)
    }

    pub fn ints(&self) -> Option<Ints<'a>> {
        self.elements_as(PrimitiveArrayType::Int)
    }

    pub fn longs(&self) -> Option<Longs<'a>> {
        self.elements_as(PrimitiveArrayType::Long)
    }
}

pub type Booleans<'a> = Elements<'a, bool>;
pub type Chars<'a> = Elements<'a, u16>;
pub type Floats<'a> = Elements<'a, f32>;
pub type Doubles<'a> = Elements<'a, f64>;
pub type Bytes<'a> = Elements<'a, i8>;
pub type Shorts<'a> = Elements<'a, i16>;
pub type Ints<'a> = Elements<'a, i32>;
pub type Longs<'a> = Elements<'a, i64>;

impl FromBytes for bool {
    fn decode(bytes: &mut &[u8], _id_size: IdSize) -> Option<bool> {
        take_u8(bytes).map(|byte| byte != 0)
    }
}

macro_rules! be_element {
    ($($ty:ty => $width:expr),* $(,)?) => {
        $(
            impl FromBytes for $ty {
                fn decode(bytes: &mut &[u8], _id_size: IdSize) -> Option<$ty> {
                    take_array::<$width>(bytes).map(<$ty>::from_be_bytes)
                }
            }
        )*
    };
}

be_element! {
    u16 => 2,
    f32 => 4,
    f64 => 8,
    i8 => 1,
    i16 => 2,
    i32 => 4,
    i64 => 8,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum PrimitiveArrayType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

/// Wire facts per element type: tag code, serialized width, java source
/// name, JNI descriptor letter.
struct TypeRow {
    element: PrimitiveArrayType,
    code: u8,
    width: u32,
    java_name: &'static str,
    jni: char,
}

// rows are declared in variant order; `row()` indexes by discriminant
static TYPE_TABLE: [TypeRow; 8] = [
    TypeRow {
        element: PrimitiveArrayType::Boolean,
        code: 0x04,
        width: 1,
        java_name: "boolean",
        jni: 'Z',
    },
    TypeRow {
        element: PrimitiveArrayType::Char,
        code: 0x05,
        width: 2,
        java_name: "char",
        jni: 'C',
    },
    TypeRow {
        element: PrimitiveArrayType::Float,
        code: 0x06,
        width: 4,
        java_name: "float",
        jni: 'F',
    },
    TypeRow {
        element: PrimitiveArrayType::Double,
        code: 0x07,
        width: 8,
        java_name: "double",
        jni: 'D',
    },
    TypeRow {
        element: PrimitiveArrayType::Byte,
        code: 0x08,
        width: 1,
        java_name: "byte",
        jni: 'B',
    },
    TypeRow {
        element: PrimitiveArrayType::Short,
        code: 0x09,
        width: 2,
        java_name: "short",
        jni: 'S',
    },
    TypeRow {
        element: PrimitiveArrayType::Int,
        code: 0x0A,
        width: 4,
        java_name: "int",
        jni: 'I',
    },
    TypeRow {
        element: PrimitiveArrayType::Long,
        code: 0x0B,
        width: 8,
        java_name: "long",
        jni: 'J',
    },
];

impl PrimitiveArrayType {
    fn row(&self) -> &'static TypeRow {
        &TYPE_TABLE[*self as usize]
    }

    pub fn from_byte(byte: u8) -> Result<PrimitiveArrayType, HprofError> {
        TYPE_TABLE
            .iter()
            .find(|row| row.code == byte)
            .map(|row| row.element)
            .ok_or(HprofError::UnsupportedType(byte))
    }

    pub fn type_code(&self) -> u8 {
        self.row().code
    }

    /// Serialized bytes per element.
    pub fn byte_size(&self) -> u32 {
        self.row().width
    }

    pub fn java_type_name(&self) -> &'static str {
        self.row().java_name
    }

    /// The JNI descriptor letter, as used in synthetic array class names
    /// like `[I`.
    pub fn jni_code(&self) -> char {
        self.row().jni
    }

    /// All eight element types.
    pub fn iter() -> impl Iterator<Item = PrimitiveArrayType> {
        TYPE_TABLE.iter().map(|row| row.element)
    }
}
