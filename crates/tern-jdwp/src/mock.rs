//! A small in-memory JDWP server used for unit/integration testing.
//!
//! It supports just enough of JDWP to exercise tern-jdwp and the debugger
//! host without requiring a JDK: a data-driven world of classes, objects and
//! threads, event-request bookkeeping with explicit event emission hooks, and
//! scripted `InvokeMethod` replies. Script objects understand the `get` and
//! `size` entry points the host's engine adapter relies on, so evaluation and
//! property-extraction flows can run end to end against it.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_command, encode_reply, JdwpReader, JdwpWriter, HANDSHAKE, HEADER_LEN},
    types::{
        FieldId, FieldInfo, FrameId, JdwpIdSizes, JdwpValue, LineTable, Location, MethodId,
        MethodInfo, ObjectId, ReferenceTypeId, ThreadId, VariableInfo, ERROR_ABSENT_INFORMATION,
        ERROR_INVALID_OBJECT, ERROR_INVALID_SLOT, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
        EVENT_KIND_EXCEPTION, EVENT_KIND_VM_DEATH, TAG_OBJECT,
    },
};

const ERROR_INVALID_METHODID: u16 = 23;
const ERROR_INVALID_CLASS: u16 = 21;
const ERROR_INVALID_THREAD: u16 = 10;

/// First object id handed out for strings interned via
/// `VirtualMachine.CreateString`.
const CREATED_OBJECT_ID_BASE: u64 = 0xF000_0000;

#[derive(Debug, Clone)]
pub struct MockMethod {
    pub info: MethodInfo,
    pub arg_count: u32,
    pub variables: Vec<VariableInfo>,
    pub line_table: Option<LineTable>,
}

impl MockMethod {
    pub fn named(method_id: MethodId, name: &str) -> Self {
        Self {
            info: MethodInfo {
                method_id,
                name: name.to_string(),
                signature: "()Ljava/lang/Object;".to_string(),
                mod_bits: 0,
            },
            arg_count: 0,
            variables: Vec::new(),
            line_table: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockClass {
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub ref_type_tag: u8,
    pub status: u32,
    pub superclass: Option<ReferenceTypeId>,
    pub interfaces: Vec<ReferenceTypeId>,
    pub source_file: Option<String>,
    pub fields: Vec<FieldInfo>,
    pub static_values: HashMap<FieldId, JdwpValue>,
    pub methods: Vec<MockMethod>,
}

impl MockClass {
    pub fn new(type_id: ReferenceTypeId, signature: &str) -> Self {
        Self {
            type_id,
            signature: signature.to_string(),
            ref_type_tag: 1,
            status: 7,
            superclass: None,
            interfaces: Vec::new(),
            source_file: None,
            fields: Vec::new(),
            static_values: HashMap::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: MockMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_field(mut self, field_id: FieldId, name: &str, signature: &str) -> Self {
        self.fields.push(FieldInfo {
            field_id,
            name: name.to_string(),
            signature: signature.to_string(),
            mod_bits: 0,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub enum MockObjectKind {
    Plain {
        fields: HashMap<FieldId, JdwpValue>,
    },
    Str(String),
    Array {
        element_tag: u8,
        values: Vec<JdwpValue>,
    },
    /// A Nashorn-ish script object: ordered named properties, readable via
    /// an invoked `get(String|int)` and countable via `size()`.
    Script {
        properties: Vec<(String, JdwpValue)>,
    },
}

#[derive(Debug, Clone)]
pub struct MockObject {
    pub class_id: ReferenceTypeId,
    pub kind: MockObjectKind,
}

impl MockObject {
    pub fn plain(class_id: ReferenceTypeId) -> Self {
        Self {
            class_id,
            kind: MockObjectKind::Plain {
                fields: HashMap::new(),
            },
        }
    }

    pub fn string(class_id: ReferenceTypeId, value: &str) -> Self {
        Self {
            class_id,
            kind: MockObjectKind::Str(value.to_string()),
        }
    }

    pub fn array(class_id: ReferenceTypeId, element_tag: u8, values: Vec<JdwpValue>) -> Self {
        Self {
            class_id,
            kind: MockObjectKind::Array {
                element_tag,
                values,
            },
        }
    }

    pub fn script(class_id: ReferenceTypeId, properties: Vec<(String, JdwpValue)>) -> Self {
        Self {
            class_id,
            kind: MockObjectKind::Script { properties },
        }
    }

    pub fn with_field(mut self, field_id: FieldId, value: JdwpValue) -> Self {
        if let MockObjectKind::Plain { fields } = &mut self.kind {
            fields.insert(field_id, value);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct MockFrame {
    pub frame_id: FrameId,
    pub location: Location,
    pub this_object: ObjectId,
    /// Live local slots. A slot listed in the method's variable table but
    /// absent here makes `StackFrame.GetValues` fail with `INVALID_SLOT`.
    pub locals: HashMap<u32, JdwpValue>,
}

#[derive(Debug, Clone)]
pub struct MockThread {
    pub id: ThreadId,
    pub name: String,
    pub frames: Vec<MockFrame>,
}

/// The mutable VM world served to the client. Tests stage it up front via
/// [`MockVmConfig`] and mutate it mid-test via [`MockJdwpServer::with_world`].
#[derive(Debug, Default)]
pub struct World {
    pub classes: Vec<MockClass>,
    pub objects: HashMap<ObjectId, MockObject>,
    pub threads: Vec<MockThread>,
}

impl World {
    pub fn class(&self, type_id: ReferenceTypeId) -> Option<&MockClass> {
        self.classes.iter().find(|c| c.type_id == type_id)
    }

    pub fn string_value(&self, id: ObjectId) -> Option<String> {
        match &self.objects.get(&id)?.kind {
            MockObjectKind::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn frame_mut(&mut self, thread: ThreadId, frame_id: FrameId) -> Option<&mut MockFrame> {
        self.threads
            .iter_mut()
            .find(|t| t.id == thread)?
            .frames
            .iter_mut()
            .find(|f| f.frame_id == frame_id)
    }
}

#[derive(Debug, Default)]
pub struct MockVmConfig {
    pub id_sizes: JdwpIdSizes,
    pub classes: Vec<MockClass>,
    pub objects: Vec<(ObjectId, MockObject)>,
    pub threads: Vec<MockThread>,
}

impl MockVmConfig {
    pub fn into_world(self) -> World {
        World {
            classes: self.classes,
            objects: self.objects.into_iter().collect(),
            threads: self.threads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: i32,
    pub modifiers: Vec<MockEventRequestModifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEventRequestModifier {
    Count { count: u32 },
    ThreadOnly { thread: ThreadId },
    ClassOnly { class_id: ReferenceTypeId },
    ClassMatch { pattern: String },
    ClassExclude { pattern: String },
    LocationOnly { location: Location },
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step { thread: ThreadId, size: u32, depth: u32 },
}

/// One `InvokeMethod` observed by the mock, with object-id arguments that
/// point at string objects resolved for convenience.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub receiver: u64,
    pub method_id: MethodId,
    pub method_name: String,
    pub args: Vec<JdwpValue>,
    pub string_args: Vec<Option<String>>,
}

struct State {
    id_sizes: JdwpIdSizes,
    world: Mutex<World>,
    next_request_id: AtomicU32,
    next_packet_id: AtomicU32,
    next_object_id: AtomicU64,
    event_requests: Mutex<Vec<MockEventRequest>>,
    scripted_invokes: Mutex<HashMap<(u64, MethodId), VecDeque<(JdwpValue, ObjectId)>>>,
    default_invokes: Mutex<HashMap<(u64, MethodId), (JdwpValue, ObjectId)>>,
    invocations: Mutex<Vec<MockInvocation>>,
    created_strings: Mutex<Vec<(ObjectId, String)>>,
    vm_suspend_calls: AtomicU32,
    vm_resume_calls: AtomicU32,
    thread_suspend_calls: AtomicU32,
    thread_resume_calls: AtomicU32,
    writer: tokio::sync::Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
}

pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

impl MockJdwpServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockVmConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockVmConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State {
            id_sizes: config.id_sizes,
            world: Mutex::new(config.into_world()),
            next_request_id: AtomicU32::new(0),
            next_packet_id: AtomicU32::new(0),
            next_object_id: AtomicU64::new(CREATED_OBJECT_ID_BASE),
            event_requests: Mutex::new(Vec::new()),
            scripted_invokes: Mutex::new(HashMap::new()),
            default_invokes: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            created_strings: Mutex::new(Vec::new()),
            vm_suspend_calls: AtomicU32::new(0),
            vm_resume_calls: AtomicU32::new(0),
            thread_suspend_calls: AtomicU32::new(0),
            thread_resume_calls: AtomicU32::new(0),
            writer: tokio::sync::Mutex::new(None),
        });

        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mutate (or inspect) the VM world mid-test.
    pub fn with_world<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        let mut world = self.state.world.lock().expect("world poisoned");
        f(&mut world)
    }

    /// Queue a reply for the next `InvokeMethod` against `receiver` (an
    /// object id, or a class id for static invocations) and `method_id`.
    pub fn push_invoke_reply(
        &self,
        receiver: u64,
        method_id: MethodId,
        value: JdwpValue,
        exception: ObjectId,
    ) {
        let mut scripted = self.state.scripted_invokes.lock().expect("scripted poisoned");
        scripted
            .entry((receiver, method_id))
            .or_default()
            .push_back((value, exception));
    }

    /// Install a persistent reply for `InvokeMethod` against `receiver` and
    /// `method_id`, used whenever the one-shot queue is empty.
    pub fn set_invoke_reply(
        &self,
        receiver: u64,
        method_id: MethodId,
        value: JdwpValue,
        exception: ObjectId,
    ) {
        let mut defaults = self.state.default_invokes.lock().expect("defaults poisoned");
        defaults.insert((receiver, method_id), (value, exception));
    }

    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.state.invocations.lock().expect("invocations poisoned").clone()
    }

    pub fn created_strings(&self) -> Vec<(ObjectId, String)> {
        self.state
            .created_strings
            .lock()
            .expect("created_strings poisoned")
            .clone()
    }

    pub fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.event_requests.lock().expect("requests poisoned").clone()
    }

    pub fn frame_local(&self, thread: ThreadId, frame_id: FrameId, slot: u32) -> Option<JdwpValue> {
        self.with_world(|w| {
            w.frame_mut(thread, frame_id)
                .and_then(|f| f.locals.get(&slot).copied())
        })
    }

    pub fn vm_suspend_calls(&self) -> u32 {
        self.state.vm_suspend_calls.load(Ordering::Relaxed)
    }

    pub fn vm_resume_calls(&self) -> u32 {
        self.state.vm_resume_calls.load(Ordering::Relaxed)
    }

    /// Emit a breakpoint event through the first matching `LocationOnly`
    /// breakpoint request. Returns the request id used, or `None` when no
    /// request matches.
    pub async fn emit_breakpoint(&self, thread: ThreadId, location: Location) -> Option<i32> {
        let request_id = {
            let requests = self.state.event_requests.lock().expect("requests poisoned");
            requests
                .iter()
                .find(|r| {
                    r.event_kind == EVENT_KIND_BREAKPOINT
                        && r.modifiers.iter().any(|m| {
                            matches!(m, MockEventRequestModifier::LocationOnly { location: l } if *l == location)
                        })
                })
                .map(|r| r.request_id)
        }?;

        let sizes = self.state.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(1); // suspend policy: event thread
        w.write_u32(1);
        w.write_u8(EVENT_KIND_BREAKPOINT);
        w.write_i32(request_id);
        w.write_object_id(thread, &sizes);
        w.write_location(&location, &sizes);
        self.send_event_packet(w.into_vec()).await;
        Some(request_id)
    }

    /// Emit a class-prepare event for `type_id` (which must exist in the
    /// world) through the first class-prepare request.
    pub async fn emit_class_prepare(&self, thread: ThreadId, type_id: ReferenceTypeId) -> Option<i32> {
        let request_id = {
            let requests = self.state.event_requests.lock().expect("requests poisoned");
            requests
                .iter()
                .find(|r| r.event_kind == EVENT_KIND_CLASS_PREPARE)
                .map(|r| r.request_id)
        }?;
        let (ref_type_tag, signature, status) = self.with_world(|world| {
            let class = world.class(type_id).expect("unknown class for class-prepare");
            (class.ref_type_tag, class.signature.clone(), class.status)
        });

        let sizes = self.state.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(0);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_CLASS_PREPARE);
        w.write_i32(request_id);
        w.write_object_id(thread, &sizes);
        w.write_u8(ref_type_tag);
        w.write_reference_type_id(type_id, &sizes);
        w.write_string(&signature);
        w.write_u32(status);
        self.send_event_packet(w.into_vec()).await;
        Some(request_id)
    }

    /// Emit an exception event through the first exception request.
    pub async fn emit_exception(
        &self,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        caught: bool,
    ) -> Option<i32> {
        let request_id = {
            let requests = self.state.event_requests.lock().expect("requests poisoned");
            requests
                .iter()
                .find(|r| r.event_kind == EVENT_KIND_EXCEPTION)
                .map(|r| r.request_id)
        }?;

        let sizes = self.state.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(1);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_EXCEPTION);
        w.write_i32(request_id);
        w.write_object_id(thread, &sizes);
        w.write_location(&location, &sizes);
        w.write_u8(TAG_OBJECT);
        w.write_object_id(exception, &sizes);
        let catch = if caught {
            location
        } else {
            Location {
                type_tag: 0,
                class_id: 0,
                method_id: 0,
                index: 0,
            }
        };
        w.write_location(&catch, &sizes);
        self.send_event_packet(w.into_vec()).await;
        Some(request_id)
    }

    pub async fn emit_vm_death(&self) {
        let mut w = JdwpWriter::new();
        w.write_u8(0);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_VM_DEATH);
        w.write_i32(0);
        self.send_event_packet(w.into_vec()).await;
    }

    /// Close the connection without a VmDeath, as a crashing debuggee would.
    pub async fn drop_connection(&self) {
        let mut writer = self.state.writer.lock().await;
        *writer = None;
        self.shutdown.cancel();
    }

    async fn send_event_packet(&self, payload: Vec<u8>) {
        let id = self.state.next_packet_id.fetch_add(1, Ordering::Relaxed) + 1;
        let packet = encode_command(id, 64, 100, &payload);
        let mut writer = self.state.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            let _ = writer.write_all(&packet).await;
        }
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => {
            let (mut socket, _) = accept?;

            let mut hs = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut hs).await?;
            if hs != *HANDSHAKE {
                return Ok(());
            }
            socket.write_all(HANDSHAKE).await?;

            let (mut reader, writer) = socket.into_split();
            *state.writer.lock().await = Some(writer);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    res = read_packet(&mut reader) => {
                        let Some(packet) = res? else {
                            return Ok(());
                        };
                        handle_packet(&state, packet).await?;
                    }
                }
            }
        }
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if header[8] != 0 {
        // The mock only expects commands from the debugger.
        return Ok(None);
    }
    let command_set = header[9];
    let command = header[10];
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id,
        command_set,
        command,
        payload,
    }))
}

async fn handle_packet(state: &Arc<State>, packet: Packet) -> std::io::Result<()> {
    let sizes = state.id_sizes;
    let mut r = JdwpReader::new(&packet.payload);

    let (error_code, payload) = match (packet.command_set, packet.command) {
        // VirtualMachine.IDSizes
        (1, 7) => {
            let mut w = JdwpWriter::new();
            w.write_u32(sizes.field_id as u32);
            w.write_u32(sizes.method_id as u32);
            w.write_u32(sizes.object_id as u32);
            w.write_u32(sizes.reference_type_id as u32);
            w.write_u32(sizes.frame_id as u32);
            (0, w.into_vec())
        }
        // VirtualMachine.AllClasses
        (1, 3) => {
            let world = state.world.lock().expect("world poisoned");
            let mut w = JdwpWriter::new();
            w.write_u32(world.classes.len() as u32);
            for class in &world.classes {
                w.write_u8(class.ref_type_tag);
                w.write_reference_type_id(class.type_id, &sizes);
                w.write_string(&class.signature);
                w.write_u32(class.status);
            }
            (0, w.into_vec())
        }
        // VirtualMachine.AllThreads
        (1, 4) => {
            let world = state.world.lock().expect("world poisoned");
            let mut w = JdwpWriter::new();
            w.write_u32(world.threads.len() as u32);
            for thread in &world.threads {
                w.write_object_id(thread.id, &sizes);
            }
            (0, w.into_vec())
        }
        // VirtualMachine.Suspend / Resume
        (1, 8) => {
            state.vm_suspend_calls.fetch_add(1, Ordering::Relaxed);
            (0, Vec::new())
        }
        (1, 9) => {
            state.vm_resume_calls.fetch_add(1, Ordering::Relaxed);
            (0, Vec::new())
        }
        // VirtualMachine.CreateString
        (1, 11) => {
            let value = r.read_string().unwrap_or_default();
            let id = state.next_object_id.fetch_add(1, Ordering::Relaxed);
            {
                let mut world = state.world.lock().expect("world poisoned");
                world.objects.insert(
                    id,
                    MockObject {
                        class_id: 0,
                        kind: MockObjectKind::Str(value.clone()),
                    },
                );
            }
            state
                .created_strings
                .lock()
                .expect("created_strings poisoned")
                .push((id, value));
            let mut w = JdwpWriter::new();
            w.write_object_id(id, &sizes);
            (0, w.into_vec())
        }
        // ReferenceType.Signature
        (2, 1) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_string(&class.signature);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ReferenceType.Fields
        (2, 4) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(class.fields.len() as u32);
                    for field in &class.fields {
                        w.write_id(field.field_id, sizes.field_id);
                        w.write_string(&field.name);
                        w.write_string(&field.signature);
                        w.write_u32(field.mod_bits);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ReferenceType.Methods
        (2, 5) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(class.methods.len() as u32);
                    for method in &class.methods {
                        w.write_id(method.info.method_id, sizes.method_id);
                        w.write_string(&method.info.name);
                        w.write_string(&method.info.signature);
                        w.write_u32(method.info.mod_bits);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ReferenceType.GetValues (static fields)
        (2, 6) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let count = r.read_u32().unwrap_or(0) as usize;
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(count as u32);
                    for _ in 0..count {
                        let field_id = r.read_id(sizes.field_id).unwrap_or(0);
                        let value = class
                            .static_values
                            .get(&field_id)
                            .copied()
                            .unwrap_or(JdwpValue::NULL);
                        w.write_tagged_value(&value, &sizes);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ReferenceType.SourceFile
        (2, 7) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id).and_then(|c| c.source_file.clone()) {
                Some(file) => {
                    let mut w = JdwpWriter::new();
                    w.write_string(&file);
                    (0, w.into_vec())
                }
                None => (ERROR_ABSENT_INFORMATION, Vec::new()),
            }
        }
        // ReferenceType.Interfaces
        (2, 10) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(class.interfaces.len() as u32);
                    for interface in &class.interfaces {
                        w.write_reference_type_id(*interface, &sizes);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ClassType.Superclass
        (3, 1) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.class(type_id) {
                Some(class) => {
                    let mut w = JdwpWriter::new();
                    w.write_reference_type_id(class.superclass.unwrap_or(0), &sizes);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_CLASS, Vec::new()),
            }
        }
        // ClassType.InvokeMethod
        (3, 3) => {
            let class_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let _thread = r.read_object_id(&sizes).unwrap_or(0);
            let method_id = r.read_id(sizes.method_id).unwrap_or(0);
            let args = read_invoke_args(&mut r, &sizes);
            invoke_reply(state, class_id, class_id, method_id, args)
        }
        // Method.LineTable
        (6, 1) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let method_id = r.read_id(sizes.method_id).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            let method = world
                .class(type_id)
                .and_then(|c| c.methods.iter().find(|m| m.info.method_id == method_id));
            match method {
                Some(method) => match &method.line_table {
                    Some(table) => {
                        let mut w = JdwpWriter::new();
                        w.write_u64(table.start);
                        w.write_u64(table.end);
                        w.write_u32(table.lines.len() as u32);
                        for entry in &table.lines {
                            w.write_u64(entry.code_index);
                            w.write_i32(entry.line);
                        }
                        (0, w.into_vec())
                    }
                    None => (ERROR_ABSENT_INFORMATION, Vec::new()),
                },
                None => (ERROR_INVALID_METHODID, Vec::new()),
            }
        }
        // Method.VariableTable
        (6, 2) => {
            let type_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let method_id = r.read_id(sizes.method_id).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            let method = world
                .class(type_id)
                .and_then(|c| c.methods.iter().find(|m| m.info.method_id == method_id));
            match method {
                Some(method) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(method.arg_count);
                    w.write_u32(method.variables.len() as u32);
                    for var in &method.variables {
                        w.write_u64(var.code_index);
                        w.write_string(&var.name);
                        w.write_string(&var.signature);
                        w.write_u32(var.length);
                        w.write_u32(var.slot);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_METHODID, Vec::new()),
            }
        }
        // ObjectReference.ReferenceType
        (9, 1) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.objects.get(&object_id) {
                Some(object) => {
                    let mut w = JdwpWriter::new();
                    w.write_u8(1);
                    w.write_reference_type_id(object.class_id, &sizes);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_OBJECT, Vec::new()),
            }
        }
        // ObjectReference.GetValues
        (9, 2) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let count = r.read_u32().unwrap_or(0) as usize;
            let world = state.world.lock().expect("world poisoned");
            match world.objects.get(&object_id) {
                Some(MockObject {
                    kind: MockObjectKind::Plain { fields },
                    ..
                }) => {
                    let mut w = JdwpWriter::new();
                    w.write_u32(count as u32);
                    for _ in 0..count {
                        let field_id = r.read_id(sizes.field_id).unwrap_or(0);
                        let value = fields.get(&field_id).copied().unwrap_or(JdwpValue::NULL);
                        w.write_tagged_value(&value, &sizes);
                    }
                    (0, w.into_vec())
                }
                Some(_) => (ERROR_INVALID_OBJECT, Vec::new()),
                None => (ERROR_INVALID_OBJECT, Vec::new()),
            }
        }
        // ObjectReference.InvokeMethod
        (9, 6) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let _thread = r.read_object_id(&sizes).unwrap_or(0);
            let class_id = r.read_reference_type_id(&sizes).unwrap_or(0);
            let method_id = r.read_id(sizes.method_id).unwrap_or(0);
            let args = read_invoke_args(&mut r, &sizes);
            invoke_reply(state, object_id, class_id, method_id, args)
        }
        // ObjectReference.DisableCollection / EnableCollection
        (9, 7) | (9, 8) => (0, Vec::new()),
        // StringReference.Value
        (10, 1) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.string_value(object_id) {
                Some(value) => {
                    let mut w = JdwpWriter::new();
                    w.write_string(&value);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_OBJECT, Vec::new()),
            }
        }
        // ThreadReference.Name
        (11, 1) => {
            let thread_id = r.read_object_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.threads.iter().find(|t| t.id == thread_id) {
                Some(thread) => {
                    let mut w = JdwpWriter::new();
                    w.write_string(&thread.name);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        // ThreadReference.Suspend / Resume
        (11, 2) => {
            state.thread_suspend_calls.fetch_add(1, Ordering::Relaxed);
            (0, Vec::new())
        }
        (11, 3) => {
            state.thread_resume_calls.fetch_add(1, Ordering::Relaxed);
            (0, Vec::new())
        }
        // ThreadReference.Frames
        (11, 6) => {
            let thread_id = r.read_object_id(&sizes).unwrap_or(0);
            let start = r.read_i32().unwrap_or(0).max(0) as usize;
            let length = r.read_i32().unwrap_or(-1);
            let world = state.world.lock().expect("world poisoned");
            match world.threads.iter().find(|t| t.id == thread_id) {
                Some(thread) => {
                    let end = if length < 0 {
                        thread.frames.len()
                    } else {
                        (start + length as usize).min(thread.frames.len())
                    };
                    let frames = &thread.frames[start.min(thread.frames.len())..end];
                    let mut w = JdwpWriter::new();
                    w.write_u32(frames.len() as u32);
                    for frame in frames {
                        w.write_id(frame.frame_id, sizes.frame_id);
                        w.write_location(&frame.location, &sizes);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        // ArrayReference.Length
        (13, 1) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let world = state.world.lock().expect("world poisoned");
            match world.objects.get(&object_id) {
                Some(MockObject {
                    kind: MockObjectKind::Array { values, .. },
                    ..
                }) => {
                    let mut w = JdwpWriter::new();
                    w.write_i32(values.len() as i32);
                    (0, w.into_vec())
                }
                _ => (ERROR_INVALID_OBJECT, Vec::new()),
            }
        }
        // ArrayReference.GetValues
        (13, 2) => {
            let object_id = r.read_object_id(&sizes).unwrap_or(0);
            let first = r.read_i32().unwrap_or(0).max(0) as usize;
            let length = r.read_i32().unwrap_or(0).max(0) as usize;
            let world = state.world.lock().expect("world poisoned");
            match world.objects.get(&object_id) {
                Some(MockObject {
                    kind:
                        MockObjectKind::Array {
                            element_tag,
                            values,
                        },
                    ..
                }) => {
                    let end = (first + length).min(values.len());
                    let slice = &values[first.min(values.len())..end];
                    let object_elements = !element_tag.is_ascii_uppercase() || *element_tag == TAG_OBJECT;
                    let mut w = JdwpWriter::new();
                    w.write_u8(*element_tag);
                    w.write_u32(slice.len() as u32);
                    for value in slice {
                        if object_elements {
                            w.write_tagged_value(value, &sizes);
                        } else {
                            // Untagged primitive payload.
                            let mut tagged = JdwpWriter::new();
                            tagged.write_tagged_value(value, &sizes);
                            w.write_bytes(&tagged.into_vec()[1..]);
                        }
                    }
                    (0, w.into_vec())
                }
                _ => (ERROR_INVALID_OBJECT, Vec::new()),
            }
        }
        // EventRequest.Set
        (15, 1) => {
            let event_kind = r.read_u8().unwrap_or(0);
            let suspend_policy = r.read_u8().unwrap_or(0);
            let modifier_count = r.read_u32().unwrap_or(0) as usize;
            let mut modifiers = Vec::with_capacity(modifier_count);
            for _ in 0..modifier_count {
                match read_modifier(&mut r, &sizes) {
                    Some(modifier) => modifiers.push(modifier),
                    None => break,
                }
            }
            let request_id = state.next_request_id.fetch_add(1, Ordering::Relaxed) as i32 + 1;
            state
                .event_requests
                .lock()
                .expect("requests poisoned")
                .push(MockEventRequest {
                    event_kind,
                    suspend_policy,
                    request_id,
                    modifiers,
                });
            let mut w = JdwpWriter::new();
            w.write_i32(request_id);
            (0, w.into_vec())
        }
        // EventRequest.Clear
        (15, 2) => {
            let event_kind = r.read_u8().unwrap_or(0);
            let request_id = r.read_i32().unwrap_or(0);
            state
                .event_requests
                .lock()
                .expect("requests poisoned")
                .retain(|req| !(req.event_kind == event_kind && req.request_id == request_id));
            (0, Vec::new())
        }
        // StackFrame.GetValues
        (16, 1) => {
            let thread_id = r.read_object_id(&sizes).unwrap_or(0);
            let frame_id = r.read_id(sizes.frame_id).unwrap_or(0);
            let count = r.read_u32().unwrap_or(0) as usize;
            let mut slots = Vec::with_capacity(count);
            for _ in 0..count {
                let slot = r.read_u32().unwrap_or(0);
                let _tag = r.read_u8().unwrap_or(0);
                slots.push(slot);
            }
            let mut world = state.world.lock().expect("world poisoned");
            match world.frame_mut(thread_id, frame_id) {
                Some(frame) => {
                    if slots.iter().any(|slot| !frame.locals.contains_key(slot)) {
                        (ERROR_INVALID_SLOT, Vec::new())
                    } else {
                        let mut w = JdwpWriter::new();
                        w.write_u32(slots.len() as u32);
                        for slot in slots {
                            w.write_tagged_value(&frame.locals[&slot], &sizes);
                        }
                        (0, w.into_vec())
                    }
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        // StackFrame.SetValues
        (16, 2) => {
            let thread_id = r.read_object_id(&sizes).unwrap_or(0);
            let frame_id = r.read_id(sizes.frame_id).unwrap_or(0);
            let count = r.read_u32().unwrap_or(0) as usize;
            let mut updates = Vec::with_capacity(count);
            for _ in 0..count {
                let slot = r.read_u32().unwrap_or(0);
                let value = r.read_tagged_value(&sizes).unwrap_or(JdwpValue::NULL);
                updates.push((slot, value));
            }
            let mut world = state.world.lock().expect("world poisoned");
            match world.frame_mut(thread_id, frame_id) {
                Some(frame) => {
                    for (slot, value) in updates {
                        frame.locals.insert(slot, value);
                    }
                    (0, Vec::new())
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        // StackFrame.ThisObject
        (16, 3) => {
            let thread_id = r.read_object_id(&sizes).unwrap_or(0);
            let frame_id = r.read_id(sizes.frame_id).unwrap_or(0);
            let mut world = state.world.lock().expect("world poisoned");
            match world.frame_mut(thread_id, frame_id) {
                Some(frame) => {
                    let mut w = JdwpWriter::new();
                    w.write_u8(TAG_OBJECT);
                    w.write_object_id(frame.this_object, &sizes);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        _ => (ERROR_NOT_IMPLEMENTED, Vec::new()),
    };

    let reply = encode_reply(packet.id, error_code, &payload);
    let mut writer = state.writer.lock().await;
    if let Some(writer) = writer.as_mut() {
        writer.write_all(&reply).await?;
    }
    Ok(())
}

const ERROR_NOT_IMPLEMENTED: u16 = 99;

fn read_invoke_args(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes) -> Vec<JdwpValue> {
    let count = r.read_u32().unwrap_or(0) as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        match r.read_tagged_value(sizes) {
            Ok(value) => args.push(value),
            Err(_) => break,
        }
    }
    args
}

/// Resolve an `InvokeMethod`: scripted replies take precedence, then the
/// built-in script-object semantics (`get`, `size`), then `(Void, 0)`.
fn invoke_reply(
    state: &Arc<State>,
    receiver: u64,
    class_id: ReferenceTypeId,
    method_id: MethodId,
    args: Vec<JdwpValue>,
) -> (u16, Vec<u8>) {
    let sizes = state.id_sizes;
    let world = state.world.lock().expect("world poisoned");

    let method_name = world
        .class(class_id)
        .and_then(|c| c.methods.iter().find(|m| m.info.method_id == method_id))
        .map(|m| m.info.name.clone())
        .unwrap_or_default();

    let string_args: Vec<Option<String>> = args
        .iter()
        .map(|arg| arg.object_id().and_then(|id| world.string_value(id)))
        .collect();
    state
        .invocations
        .lock()
        .expect("invocations poisoned")
        .push(MockInvocation {
            receiver,
            method_id,
            method_name: method_name.clone(),
            args: args.clone(),
            string_args: string_args.clone(),
        });

    let scripted = {
        let mut scripted = state.scripted_invokes.lock().expect("scripted poisoned");
        scripted
            .get_mut(&(receiver, method_id))
            .and_then(|queue| queue.pop_front())
    }
    .or_else(|| {
        let defaults = state.default_invokes.lock().expect("defaults poisoned");
        defaults.get(&(receiver, method_id)).copied()
    });

    let (value, exception) = if let Some(reply) = scripted {
        reply
    } else {
        match (&method_name[..], world.objects.get(&receiver)) {
            (
                "get",
                Some(MockObject {
                    kind: MockObjectKind::Script { properties },
                    ..
                }),
            ) => {
                let key = match args.first() {
                    Some(JdwpValue::Int(i)) => Some(i.to_string()),
                    Some(other) => other.object_id().and_then(|id| world.string_value(id)),
                    None => None,
                };
                let value = key
                    .and_then(|k| {
                        properties
                            .iter()
                            .find(|(name, _)| *name == k)
                            .map(|(_, v)| *v)
                    })
                    .unwrap_or(JdwpValue::NULL);
                (value, 0)
            }
            (
                "size",
                Some(MockObject {
                    kind: MockObjectKind::Script { properties },
                    ..
                }),
            ) => (JdwpValue::Int(properties.len() as i32), 0),
            _ => (JdwpValue::Void, 0),
        }
    };

    let mut w = JdwpWriter::new();
    w.write_tagged_value(&value, &sizes);
    w.write_u8(TAG_OBJECT);
    w.write_object_id(exception, &sizes);
    (0, w.into_vec())
}

fn read_modifier(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes) -> Option<MockEventRequestModifier> {
    let kind = r.read_u8().ok()?;
    Some(match kind {
        1 => MockEventRequestModifier::Count {
            count: r.read_u32().ok()?,
        },
        3 => MockEventRequestModifier::ThreadOnly {
            thread: r.read_object_id(sizes).ok()?,
        },
        4 => MockEventRequestModifier::ClassOnly {
            class_id: r.read_reference_type_id(sizes).ok()?,
        },
        5 => MockEventRequestModifier::ClassMatch {
            pattern: r.read_string().ok()?,
        },
        6 => MockEventRequestModifier::ClassExclude {
            pattern: r.read_string().ok()?,
        },
        7 => MockEventRequestModifier::LocationOnly {
            location: r.read_location(sizes).ok()?,
        },
        8 => MockEventRequestModifier::ExceptionOnly {
            exception_or_null: r.read_reference_type_id(sizes).ok()?,
            caught: r.read_bool().ok()?,
            uncaught: r.read_bool().ok()?,
        },
        10 => MockEventRequestModifier::Step {
            thread: r.read_object_id(sizes).ok()?,
            size: r.read_u32().ok()?,
            depth: r.read_u32().ok()?,
        },
        _ => return None,
    })
}
