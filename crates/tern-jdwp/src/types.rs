use std::fmt;

use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

// Event kinds (JDWP `EventKind` constants).
pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_THREAD_START: u8 = 6;
pub const EVENT_KIND_THREAD_DEATH: u8 = 7;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_METHOD_ENTRY: u8 = 40;
pub const EVENT_KIND_METHOD_EXIT: u8 = 41;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

// Suspend policies for event requests.
pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

// Value tags (JDWP `Tag` constants).
pub const TAG_ARRAY: u8 = b'[';
pub const TAG_BYTE: u8 = b'B';
pub const TAG_CHAR: u8 = b'C';
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_FLOAT: u8 = b'F';
pub const TAG_DOUBLE: u8 = b'D';
pub const TAG_INT: u8 = b'I';
pub const TAG_LONG: u8 = b'J';
pub const TAG_SHORT: u8 = b'S';
pub const TAG_VOID: u8 = b'V';
pub const TAG_BOOLEAN: u8 = b'Z';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';
pub const TAG_CLASS_OBJECT: u8 = b'c';

// JDWP error codes the host cares about by name.
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_SLOT: u16 = 35;
pub const ERROR_ABSENT_INFORMATION: u16 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        // Most modern JVMs use 8 byte IDs.
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    /// Whether the variable is live at `code_index` per its scope range.
    pub fn visible_at(&self, code_index: u64) -> bool {
        self.code_index <= code_index && code_index < self.code_index + u64::from(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl FieldInfo {
    pub const MODIFIER_STATIC: u32 = 0x0008;

    pub fn is_static(&self) -> bool {
        self.mod_bits & Self::MODIFIER_STATIC != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub const NULL: JdwpValue = JdwpValue::Object { tag: TAG_OBJECT, id: 0 };

    pub fn tag(&self) -> u8 {
        match self {
            JdwpValue::Boolean(_) => TAG_BOOLEAN,
            JdwpValue::Byte(_) => TAG_BYTE,
            JdwpValue::Char(_) => TAG_CHAR,
            JdwpValue::Short(_) => TAG_SHORT,
            JdwpValue::Int(_) => TAG_INT,
            JdwpValue::Long(_) => TAG_LONG,
            JdwpValue::Float(_) => TAG_FLOAT,
            JdwpValue::Double(_) => TAG_DOUBLE,
            JdwpValue::Object { tag, .. } => *tag,
            JdwpValue::Void => TAG_VOID,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            JdwpValue::Object { id, .. } if *id != 0 => Some(*id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JdwpValue::Object { id: 0, .. })
    }
}

impl fmt::Display for JdwpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JdwpValue::Boolean(v) => write!(f, "{v}"),
            JdwpValue::Byte(v) => write!(f, "{v}"),
            JdwpValue::Char(v) => write!(f, "{v}"),
            JdwpValue::Short(v) => write!(f, "{v}"),
            JdwpValue::Int(v) => write!(f, "{v}"),
            JdwpValue::Long(v) => write!(f, "{v}"),
            JdwpValue::Float(v) => write!(f, "{v}"),
            JdwpValue::Double(v) => write!(f, "{v}"),
            JdwpValue::Object { id, tag } => write!(f, "{id:#x}:{tag}"),
            JdwpValue::Void => write!(f, "void"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JdwpEvent {
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
    /// Synthesized by the client when the transport closes without a VmDeath.
    VmDisconnected,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("VM returned error code {0}")]
    VmError(u16),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,
}

impl JdwpError {
    /// The JDWP error code carried by a `VmError`, if any.
    pub fn vm_error_code(&self) -> Option<u16> {
        match self {
            JdwpError::VmError(code) => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, JdwpError>;
