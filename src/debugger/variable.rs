//! Value model for the frame inspector.
//!
//! The target describes every readable slot with a closed set of type tags.
//! Primitive values travel by value, objects and arrays travel as opaque
//! reference tokens that stay valid only while the owning thread remains
//! suspended.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of a variable slot as declared by the target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
    strum_macros::FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum TypeTag {
    Bool = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    Char = 7,
    Object = 8,
    Array = 9,
}

/// Opaque handle of an object living in the target heap.
///
/// Valid only for the current suspension of the session, dereferencing it
/// after a resume is rejected by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: u64,
    pub class: String,
}

/// Opaque handle of an array living in the target heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayRef {
    pub id: u64,
    pub component: String,
    pub length: u32,
}

/// A value read from the target, tagged union over the protocol value kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Object(ObjectRef),
    Array(ArrayRef),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "'{v}'"),
            Value::Object(o) => write!(f, "{}@{}", o.class, o.id),
            Value::Array(a) => write!(f, "{}[{}]@{}", a.component, a.length, a.id),
        }
    }
}

/// One named local or argument slot visible in a stack frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub name: String,
    /// Declared type tag, may differ from the runtime kind of `value`
    /// (an object slot can hold `Null`).
    pub tag: TypeTag,
    pub value: Value,
}

impl fmt::Display for VariableBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} = {}", self.name, self.tag, self.value)
    }
}
