//! The value model surfaced to the CDP domain layer.
//!
//! Complex values never carry target-VM references outward; they carry a
//! [`RemoteObjectId`] that is only meaningful while the pause that produced
//! it is still active.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, JSON-serializable object handle. Unique within a pause
/// session; ids from a previous pause resolve to nothing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteObjectId(String);

impl RemoteObjectId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimpleValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueNode {
    Simple(SimpleValue),
    Object {
        class_name: String,
        id: RemoteObjectId,
    },
    Array {
        length: usize,
        id: RemoteObjectId,
    },
    Function {
        name: String,
        source: Option<String>,
        id: RemoteObjectId,
    },
    Date {
        string_value: String,
        id: RemoteObjectId,
    },
    RegExp {
        string_value: String,
        id: RemoteObjectId,
    },
    Error {
        data: ErrorValue,
        id: RemoteObjectId,
    },
    /// A value the target reported as absent (e.g. an optimized-out local).
    Empty,
}

impl ValueNode {
    pub const UNDEFINED: ValueNode = ValueNode::Simple(SimpleValue::Undefined);
    pub const NULL: ValueNode = ValueNode::Simple(SimpleValue::Null);

    pub fn object_id(&self) -> Option<&RemoteObjectId> {
        match self {
            ValueNode::Object { id, .. }
            | ValueNode::Array { id, .. }
            | ValueNode::Function { id, .. }
            | ValueNode::Date { id, .. }
            | ValueNode::RegExp { id, .. }
            | ValueNode::Error { id, .. } => Some(id),
            ValueNode::Simple(_) | ValueNode::Empty => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyDescriptorKind {
    Data,
    Accessor,
    Generic,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectPropertyDescriptor {
    pub kind: PropertyDescriptorKind,
    pub configurable: bool,
    pub enumerable: bool,
    pub writable: bool,
    pub is_own: bool,
    pub value: Option<ValueNode>,
    pub getter: Option<ValueNode>,
    pub setter: Option<ValueNode>,
}

impl ObjectPropertyDescriptor {
    pub fn data(value: ValueNode, writable: bool, is_own: bool) -> Self {
        Self {
            kind: PropertyDescriptorKind::Data,
            configurable: true,
            enumerable: true,
            writable,
            is_own,
            value: Some(value),
            getter: None,
            setter: None,
        }
    }

    pub fn accessor(getter: Option<ValueNode>, setter: Option<ValueNode>, is_own: bool) -> Self {
        debug_assert!(getter.is_some() || setter.is_some());
        Self {
            kind: PropertyDescriptorKind::Accessor,
            configurable: true,
            enumerable: true,
            writable: false,
            is_own,
            value: None,
            getter,
            setter,
        }
    }

    pub fn generic(is_own: bool) -> Self {
        Self {
            kind: PropertyDescriptorKind::Generic,
            configurable: true,
            enumerable: true,
            writable: false,
            is_own,
            value: None,
            getter: None,
            setter: None,
        }
    }

    /// The descriptor invariant: data properties carry a value, accessor
    /// properties carry at least one of getter/setter.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            PropertyDescriptorKind::Data => self.value.is_some(),
            PropertyDescriptorKind::Accessor => self.getter.is_some() || self.setter.is_some(),
            PropertyDescriptorKind::Generic => true,
        }
    }
}
