//! The debugger host: one attached target, one serial event pump.
//!
//! All host state is owned by a single tokio task. External calls post typed
//! commands into its mailbox and get their answer over a oneshot; VM events
//! arrive over the JDWP client's broadcast channel and are consumed by the
//! same task. There is no suspension point inside a handler that another
//! handler could interleave with, which is what makes the snapshot and
//! cache-invalidation discipline of the pause engine sound.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tern_jdwp::{
    types::{
        EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION,
        EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT, SUSPEND_POLICY_EVENT_THREAD,
        SUSPEND_POLICY_NONE, TAG_OBJECT,
    },
    EventModifier, JdwpClient, JdwpEvent, JdwpValue, Location, ObjectId, ReferenceTypeId,
    ThreadId,
};

use crate::breakpoints::{
    BreakableLocationTable, Breakpoint, EnabledBreakpoint, ScriptLocation,
};
use crate::error::{HostError, HostResult};
use crate::eval::{self, EvalOutcome};
use crate::events::{DebuggerEvent, EventBus, EventStream};
use crate::invoke::{MethodResolver, TypeNameCache};
use crate::marshal::{self, MarshalCtx};
use crate::nashorn::{self, EngineHandles, InfraClasses};
use crate::objects::ObjectRegistry;
use crate::pause::{
    self, PausedData, StackFrameView, StepKind, VariableTableCache,
};
use crate::properties;
use crate::script::ScriptRegistry;
use crate::url::ScriptUrl;
use crate::values::{ErrorValue, ObjectPropertyDescriptor, RemoteObjectId, ValueNode};

/// How long class-prepare traffic must stay quiet before the host considers
/// the target settled and runs full initialization.
const INIT_POSTPONE: Duration = Duration::from_millis(200);

/// Source recovery retry budget: the engine sets the `source` field
/// reflectively shortly after class-prepare, so a handful of short retries
/// usually suffices.
const INITIAL_SCRIPT_RESOLVE_ATTEMPTS: u32 = 5;
const SCRIPT_RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// JVM service threads that pause-at-next-statement must not arm.
const INFRASTRUCTURE_THREADS: [&str; 7] = [
    "Reference Handler",
    "Finalizer",
    "Signal Dispatcher",
    "Attach Listener",
    "Common-Cleaner",
    "Notification Thread",
    "DestroyJavaVM",
];

#[derive(Debug, Clone)]
pub struct AttachArgs {
    pub host: String,
    pub port: u16,
}

impl Default for AttachArgs {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7777,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionPauseMode {
    None,
    Caught,
    Uncaught,
    All,
}

impl ExceptionPauseMode {
    fn flags(self) -> Option<(bool, bool)> {
        match self {
            ExceptionPauseMode::None => None,
            ExceptionPauseMode::Caught => Some((true, false)),
            ExceptionPauseMode::Uncaught => Some((false, true)),
            ExceptionPauseMode::All => Some((true, true)),
        }
    }
}

type Reply<T> = oneshot::Sender<HostResult<T>>;

enum HostCommand {
    Scripts(Reply<Vec<Arc<crate::script::Script>>>),
    ScriptById(String, Reply<Option<Arc<crate::script::Script>>>),
    SetBreakpoint(String, ScriptLocation, Reply<Option<Breakpoint>>),
    RemoveBreakpoint(String, Reply<()>),
    GetBreakpointLocations(
        String,
        ScriptLocation,
        Option<ScriptLocation>,
        Reply<Vec<ScriptLocation>>,
    ),
    Resume(Reply<()>),
    Step(StepKind, Reply<()>),
    SetWillPauseOnBreakpoints(bool, Reply<()>),
    PauseOnExceptions(ExceptionPauseMode, Reply<()>),
    PauseAtNextStatement(Reply<()>),
    Reset(Reply<()>),
    Evaluate {
        stack_frame_id: String,
        expression: String,
        named_objects: HashMap<String, RemoteObjectId>,
        reply: Reply<ValueNode>,
    },
    GetObjectProperties {
        object_id: RemoteObjectId,
        only_own: bool,
        only_accessors: bool,
        reply: Reply<HashMap<String, ObjectPropertyDescriptor>>,
    },
    // Internal: (re-)consider a loaded type, with a source retry budget.
    ConsiderReferenceType {
        type_id: ReferenceTypeId,
        name: String,
        attempts_left: u32,
    },
}

/// Handle to a running debugger host. Cloneable; dropping every handle does
/// not stop the pump (the VM connection does).
#[derive(Clone)]
pub struct DebuggerHost {
    cmd_tx: mpsc::UnboundedSender<HostCommand>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl DebuggerHost {
    /// Attach to a JDWP target and start the event pump.
    pub async fn attach(args: AttachArgs) -> HostResult<Self> {
        let addr_text = format!("{}:{}", args.host, args.port);
        let mut addrs = tokio::net::lookup_host(&addr_text)
            .await
            .map_err(|err| HostError::Connect {
                addr: addr_text.clone(),
                source: err.into(),
            })?;
        let addr = addrs.next().ok_or_else(|| HostError::Connect {
            addr: addr_text.clone(),
            source: tern_jdwp::JdwpError::Protocol("no address resolved".to_string()),
        })?;

        let client = JdwpClient::connect(addr)
            .await
            .map_err(|source| HostError::Connect {
                addr: addr_text.clone(),
                source,
            })?;

        // Subscribe before arming the class-prepare request so no prepare
        // event can slip through unobserved.
        let events = client.subscribe_events();

        // Track every class load from the start; initialization is postponed
        // until class-prepare traffic quiesces.
        client
            .event_request_set(
                EVENT_KIND_CLASS_PREPARE,
                SUSPEND_POLICY_NONE,
                vec![EventModifier::ClassMatch {
                    pattern: "*".to_string(),
                }],
            )
            .await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let shutdown = client.shutdown_token();

        let pump = Pump {
            events,
            client,
            bus: bus.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            state: HostState::default(),
        };
        tokio::spawn(pump.run());

        Ok(Self {
            cmd_tx,
            bus,
            shutdown,
        })
    }

    /// Subscribe to the host event stream. A subscriber attaching after
    /// initialization sees a synthetic `InitialInitializationComplete`
    /// first.
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HostCommand,
    ) -> HostResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| HostError::HostGone)?;
        rx.await.map_err(|_| HostError::HostGone)?
    }

    pub async fn scripts(&self) -> HostResult<Vec<Arc<crate::script::Script>>> {
        self.call(HostCommand::Scripts).await
    }

    pub async fn script_by_id(&self, id: &str) -> HostResult<Option<Arc<crate::script::Script>>> {
        let id = id.to_string();
        self.call(|reply| HostCommand::ScriptById(id, reply)).await
    }

    pub async fn set_breakpoint(
        &self,
        script_url: &str,
        location: ScriptLocation,
    ) -> HostResult<Option<Breakpoint>> {
        let url = script_url.to_string();
        self.call(|reply| HostCommand::SetBreakpoint(url, location, reply))
            .await
    }

    pub async fn remove_breakpoint_by_id(&self, breakpoint_id: &str) -> HostResult<()> {
        let id = breakpoint_id.to_string();
        self.call(|reply| HostCommand::RemoveBreakpoint(id, reply))
            .await
    }

    pub async fn get_breakpoint_locations(
        &self,
        script_id: &str,
        from: ScriptLocation,
        to: Option<ScriptLocation>,
    ) -> HostResult<Vec<ScriptLocation>> {
        let id = script_id.to_string();
        self.call(|reply| HostCommand::GetBreakpointLocations(id, from, to, reply))
            .await
    }

    pub async fn resume(&self) -> HostResult<()> {
        self.call(HostCommand::Resume).await
    }

    pub async fn step(&self, kind: StepKind) -> HostResult<()> {
        self.call(|reply| HostCommand::Step(kind, reply)).await
    }

    pub async fn pause_on_breakpoints(&self) -> HostResult<()> {
        self.call(|reply| HostCommand::SetWillPauseOnBreakpoints(true, reply))
            .await
    }

    pub async fn ignore_breakpoints(&self) -> HostResult<()> {
        self.call(|reply| HostCommand::SetWillPauseOnBreakpoints(false, reply))
            .await
    }

    pub async fn pause_on_exceptions(&self, mode: ExceptionPauseMode) -> HostResult<()> {
        self.call(|reply| HostCommand::PauseOnExceptions(mode, reply))
            .await
    }

    pub async fn pause_at_next_statement(&self) -> HostResult<()> {
        self.call(HostCommand::PauseAtNextStatement).await
    }

    pub async fn reset(&self) -> HostResult<()> {
        self.call(HostCommand::Reset).await
    }

    pub async fn evaluate_on_stack_frame(
        &self,
        stack_frame_id: &str,
        expression: &str,
        named_objects: HashMap<String, RemoteObjectId>,
    ) -> HostResult<ValueNode> {
        let stack_frame_id = stack_frame_id.to_string();
        let expression = expression.to_string();
        self.call(|reply| HostCommand::Evaluate {
            stack_frame_id,
            expression,
            named_objects,
            reply,
        })
        .await
    }

    pub async fn get_object_properties(
        &self,
        object_id: RemoteObjectId,
        only_own: bool,
        only_accessors: bool,
    ) -> HostResult<HashMap<String, ObjectPropertyDescriptor>> {
        self.call(|reply| HostCommand::GetObjectProperties {
            object_id,
            only_own,
            only_accessors,
            reply,
        })
        .await
    }
}

#[derive(Default)]
struct HostState {
    initialized: bool,
    will_pause_on_breakpoints: bool,
    class_prepare_count: u64,
    count_at_last_tick: u64,
    scripts: ScriptRegistry,
    table: BreakableLocationTable,
    infra: InfraClasses,
    engine: Option<EngineHandles>,
    context_obj: Option<ObjectId>,
    extractor_fn: Option<ObjectId>,
    methods: MethodResolver,
    names: TypeNameCache,
    var_tables: VariableTableCache,
    registry: ObjectRegistry,
    paused: Option<PausedData>,
    exception_request: Option<i32>,
    debugger_trap_request: Option<i32>,
    /// Method entry/exit arms from pause-at-next-statement; cleared on the
    /// next pause.
    pause_arm_requests: Vec<(u8, i32)>,
    processed_types: HashSet<ReferenceTypeId>,
}

struct Pump {
    client: JdwpClient,
    bus: EventBus,
    cmd_rx: mpsc::UnboundedReceiver<HostCommand>,
    cmd_tx: mpsc::UnboundedSender<HostCommand>,
    events: tokio::sync::broadcast::Receiver<JdwpEvent>,
    state: HostState,
}

impl Pump {
    async fn run(mut self) {
        let mut init_timer: Pin<Box<tokio::time::Sleep>> =
            Box::pin(tokio::time::sleep(INIT_POSTPONE));

        loop {
            tokio::select! {
                _ = &mut init_timer, if !self.state.initialized => {
                    self.on_init_tick().await;
                    init_timer = Box::pin(tokio::time::sleep(INIT_POSTPONE));
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => break,
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Ok(event) => {
                            if self.on_vm_event(event).await {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target = "tern.host",
                                skipped,
                                "VM event stream lagged"
                            );
                        }
                    }
                }
            }
        }

        self.bus.complete();
        tracing::info!(target = "tern.host", "event pump stopped");
    }

    async fn on_init_tick(&mut self) {
        if self.state.class_prepare_count != self.state.count_at_last_tick {
            // Classes are still streaming in; wait for quiescence.
            self.state.count_at_last_tick = self.state.class_prepare_count;
            return;
        }
        if let Err(err) = self.initialize().await {
            tracing::info!(target = "tern.host", error = %err, "initialization postponed");
            return;
        }
        self.state.initialized = true;
        self.bus.publish(DebuggerEvent::InitialInitializationComplete);
    }

    async fn initialize(&mut self) -> HostResult<()> {
        let classes = self.client.all_classes().await?;
        for class in classes {
            let name = nashorn::signature_to_type_name(&class.signature);
            self.consider_reference_type(class.type_id, name, INITIAL_SCRIPT_RESOLVE_ATTEMPTS)
                .await;
        }

        match EngineHandles::resolve(&self.client, &self.state.infra, &mut self.state.methods)
            .await
        {
            Ok(engine) => {
                // The `debugger` statement lands in ScriptRuntime.DEBUGGER; a
                // fixed breakpoint there realizes it.
                let request = self
                    .client
                    .event_request_set(
                        EVENT_KIND_BREAKPOINT,
                        SUSPEND_POLICY_EVENT_THREAD,
                        vec![EventModifier::LocationOnly {
                            location: engine.debugger_location,
                        }],
                    )
                    .await?;
                self.state.debugger_trap_request = Some(request);
                self.state.engine = Some(engine);
            }
            Err(err) => {
                // Without the engine entry points the host can still list
                // scripts and pause, but evaluation is off the table. This
                // is an engine-version mismatch and is reported loudly.
                tracing::error!(target = "tern.host", error = %err, "engine contract not satisfied");
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Scripts(reply) => {
                let _ = reply.send(Ok(self.state.scripts.scripts()));
            }
            HostCommand::ScriptById(id, reply) => {
                let _ = reply.send(Ok(self.state.scripts.by_id(&id)));
            }
            HostCommand::SetBreakpoint(url, location, reply) => {
                let _ = reply.send(self.set_breakpoint(&url, location).await);
            }
            HostCommand::RemoveBreakpoint(id, reply) => {
                let _ = reply.send(self.remove_breakpoint(&id).await);
            }
            HostCommand::GetBreakpointLocations(script_id, from, to, reply) => {
                let _ = reply.send(Ok(self
                    .state
                    .table
                    .locations_in_range(&script_id, from, to)));
            }
            HostCommand::Resume(reply) => {
                let _ = reply.send(self.resume_from_pause().await);
            }
            HostCommand::Step(kind, reply) => {
                let _ = reply.send(self.step(kind).await);
            }
            HostCommand::SetWillPauseOnBreakpoints(enabled, reply) => {
                self.state.will_pause_on_breakpoints = enabled;
                let _ = reply.send(Ok(()));
            }
            HostCommand::PauseOnExceptions(mode, reply) => {
                let _ = reply.send(self.pause_on_exceptions(mode).await);
            }
            HostCommand::PauseAtNextStatement(reply) => {
                let _ = reply.send(self.pause_at_next_statement().await);
            }
            HostCommand::Reset(reply) => {
                let _ = reply.send(self.reset().await);
            }
            HostCommand::Evaluate {
                stack_frame_id,
                expression,
                named_objects,
                reply,
            } => {
                let _ = reply.send(
                    self.evaluate_on_stack_frame(&stack_frame_id, &expression, named_objects)
                        .await,
                );
            }
            HostCommand::GetObjectProperties {
                object_id,
                only_own,
                only_accessors,
                reply,
            } => {
                let _ = reply.send(
                    self.get_object_properties(object_id, only_own, only_accessors)
                        .await,
                );
            }
            HostCommand::ConsiderReferenceType {
                type_id,
                name,
                attempts_left,
            } => {
                if self.state.paused.is_some() {
                    // Registration must not run mid-pause; try again after
                    // the resume without spending an attempt.
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(SCRIPT_RESOLVE_RETRY_DELAY).await;
                        let _ = cmd_tx.send(HostCommand::ConsiderReferenceType {
                            type_id,
                            name,
                            attempts_left,
                        });
                    });
                } else {
                    self.consider_reference_type(type_id, name, attempts_left)
                        .await;
                }
            }
        }
    }

    /// Returns `true` when the pump must terminate.
    async fn on_vm_event(&mut self, event: JdwpEvent) -> bool {
        match event {
            JdwpEvent::VmDeath | JdwpEvent::VmDisconnected => {
                tracing::info!(target = "tern.host", "target VM disconnected");
                return true;
            }
            JdwpEvent::ClassPrepare {
                type_id, signature, ..
            } => {
                if self.state.paused.is_some() {
                    // One debug session at a time: while suspended, the event
                    // set is ignored so the pause snapshot stays atomic. The
                    // class resurfaces through AllClasses on a later load or
                    // re-attach.
                    tracing::debug!(
                        target = "tern.host",
                        signature = %signature,
                        "ignoring class-prepare while paused"
                    );
                } else if self.state.initialized {
                    let name = nashorn::signature_to_type_name(&signature);
                    self.consider_reference_type(
                        type_id,
                        name,
                        INITIAL_SCRIPT_RESOLVE_ATTEMPTS,
                    )
                    .await;
                } else {
                    self.state.class_prepare_count += 1;
                }
            }
            JdwpEvent::Breakpoint {
                request_id,
                thread,
                location,
            } => {
                self.handle_pause_trigger(request_id, thread, location, None)
                    .await;
            }
            JdwpEvent::MethodEntry {
                request_id,
                thread,
                location,
            }
            | JdwpEvent::MethodExit {
                request_id,
                thread,
                location,
            } => {
                // Only armed by pause-at-next-statement.
                self.handle_pause_trigger(request_id, thread, location, None)
                    .await;
            }
            JdwpEvent::Exception {
                request_id,
                thread,
                location,
                exception,
                catch_location,
            } => {
                self.handle_pause_trigger(
                    request_id,
                    thread,
                    location,
                    Some((exception, catch_location.is_none())),
                )
                .await;
            }
            JdwpEvent::VmStart { .. }
            | JdwpEvent::SingleStep { .. }
            | JdwpEvent::ThreadStart { .. }
            | JdwpEvent::ThreadDeath { .. } => {}
        }
        false
    }

    async fn consider_reference_type(
        &mut self,
        type_id: ReferenceTypeId,
        name: String,
        attempts_left: u32,
    ) {
        if self.state.processed_types.contains(&type_id) {
            return;
        }

        if nashorn::is_wanted_infrastructure_class(&name) {
            self.state.infra.insert(name, type_id);
            self.state.processed_types.insert(type_id);
            return;
        }

        if !nashorn::is_script_class(&name) {
            self.state.processed_types.insert(type_id);
            return;
        }

        match self.register_script_class(type_id, &name).await {
            Ok(true) => {
                self.state.processed_types.insert(type_id);
            }
            Ok(false) => {
                // No line info; nothing to debug in this class.
                self.state.processed_types.insert(type_id);
            }
            Err(err) => {
                if attempts_left > 0 {
                    tracing::debug!(
                        target = "tern.host",
                        class = %name,
                        attempts_left,
                        error = %err,
                        "script source not yet available, retrying"
                    );
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(SCRIPT_RESOLVE_RETRY_DELAY).await;
                        let _ = cmd_tx.send(HostCommand::ConsiderReferenceType {
                            type_id,
                            name,
                            attempts_left: attempts_left - 1,
                        });
                    });
                } else {
                    tracing::debug!(
                        target = "tern.host",
                        class = %name,
                        error = %err,
                        "dropping script class, source never became available"
                    );
                    self.state.processed_types.insert(type_id);
                }
            }
        }
    }

    /// Register one script class: collect its line locations, recover its
    /// source, dedup, build breakable locations and announce the script.
    /// `Ok(false)` means the class carries no debuggable lines; an error
    /// means source recovery should be retried.
    async fn register_script_class(
        &mut self,
        type_id: ReferenceTypeId,
        class_name: &str,
    ) -> HostResult<bool> {
        let methods = self.state.methods.methods_of(&self.client, type_id).await?;

        let mut line_locations: Vec<(Location, ScriptLocation)> = Vec::new();
        for method in methods.iter() {
            let Ok(table) = self
                .client
                .method_line_table(type_id, method.method_id)
                .await
            else {
                continue;
            };
            for entry in &table.lines {
                if entry.line <= 0 {
                    continue;
                }
                line_locations.push((
                    Location {
                        type_tag: 1,
                        class_id: type_id,
                        method_id: method.method_id,
                        index: entry.code_index,
                    },
                    ScriptLocation::new(entry.line as u32, Some(1)),
                ));
            }
        }
        if line_locations.is_empty() {
            return Ok(false);
        }

        let source_name = self
            .client
            .reference_type_source_file(type_id)
            .await
            .unwrap_or_else(|_| nashorn::EVAL_SOURCE_NAME.to_string());
        let path = if source_name == nashorn::EVAL_SOURCE_NAME {
            nashorn::eval_script_path(class_name)
        } else {
            source_name
        };

        let source = self.recover_source(type_id).await?;

        if source.contains(nashorn::EVALUATED_CODE_MARKER) {
            // Our own evaluated code reappearing at reconnection.
            tracing::debug!(target = "tern.host", class = %class_name, "ignoring own evaluated script");
            return Ok(true);
        }

        let url = match ScriptUrl::create(&path) {
            Ok(url) => url,
            Err(_) => ScriptUrl::create(&nashorn::eval_script_path(class_name))?,
        };

        let outcome = self.state.scripts.register(url.clone(), source);
        let script = outcome.script().clone();
        let is_new = outcome.is_new_url();

        self.state
            .table
            .add_locations(&url, &script, line_locations);

        if is_new {
            tracing::info!(
                target = "tern.host",
                url = %url,
                script_id = %script.id(),
                "script registered"
            );
            self.bus.publish(DebuggerEvent::ScriptAdded(script));
        }
        Ok(true)
    }

    /// Walk the private `source -> data -> array` field path of a script
    /// class and concatenate the char array. Any absent link is an error so
    /// the caller can retry; the engine populates these fields reflectively
    /// shortly after class-prepare.
    async fn recover_source(&mut self, type_id: ReferenceTypeId) -> HostResult<String> {
        let source_obj = self
            .read_static_object(type_id, nashorn::SOURCE_FIELD)
            .await?;
        let data_obj = self
            .read_instance_object(source_obj, nashorn::SOURCE_DATA_FIELD)
            .await?;
        let array_id = self
            .read_instance_object(data_obj, nashorn::SOURCE_ARRAY_FIELD)
            .await?;

        let length = self.client.array_reference_length(array_id).await?.max(0);
        let mut source = String::with_capacity(length as usize);
        if length > 0 {
            let values = self
                .client
                .array_reference_get_values(array_id, 0, length)
                .await?;
            for value in values {
                match value {
                    JdwpValue::Char(c) => {
                        source.push(char::from_u32(c.into()).unwrap_or('\u{FFFD}'));
                    }
                    other => {
                        return Err(HostError::EngineContract(format!(
                            "source array holds a non-char value: {other}"
                        )))
                    }
                }
            }
        }
        Ok(source)
    }

    async fn read_static_object(
        &mut self,
        type_id: ReferenceTypeId,
        field_name: &str,
    ) -> HostResult<ObjectId> {
        let fields = self.client.reference_type_fields(type_id).await?;
        let field = fields
            .iter()
            .find(|f| f.name == field_name)
            .ok_or_else(|| {
                HostError::EngineContract(format!("field {field_name} missing on script class"))
            })?;
        let values = self
            .client
            .reference_type_get_values(type_id, &[field.field_id])
            .await?;
        values
            .into_iter()
            .next()
            .and_then(|v| v.object_id())
            .ok_or_else(|| HostError::Evaluation(format!("field {field_name} not yet set")))
    }

    async fn read_instance_object(
        &mut self,
        object_id: ObjectId,
        field_name: &str,
    ) -> HostResult<ObjectId> {
        let class_id = self
            .client
            .object_reference_reference_type(object_id)
            .await?;
        let fields = self.client.reference_type_fields(class_id).await?;
        let field = fields
            .iter()
            .find(|f| f.name == field_name)
            .ok_or_else(|| {
                HostError::EngineContract(format!("field {field_name} missing on source object"))
            })?;
        let values = self
            .client
            .object_reference_get_values(object_id, &[field.field_id])
            .await?;
        values
            .into_iter()
            .next()
            .and_then(|v| v.object_id())
            .ok_or_else(|| HostError::Evaluation(format!("field {field_name} not yet set")))
    }

    async fn set_breakpoint(
        &mut self,
        script_url: &str,
        location: ScriptLocation,
    ) -> HostResult<Option<Breakpoint>> {
        let url = ScriptUrl::create(script_url)?;
        let matches: Vec<_> = self
            .state
            .table
            .find_exact(&url, location)
            .into_iter()
            .cloned()
            .collect();
        if matches.is_empty() {
            return Ok(None);
        }

        let id = self.state.table.allocate_breakpoint_id();
        let mut request_ids = Vec::with_capacity(matches.len());
        let mut vm_locations = Vec::with_capacity(matches.len());
        for bl in &matches {
            let request_id = self
                .client
                .event_request_set(
                    EVENT_KIND_BREAKPOINT,
                    SUSPEND_POLICY_EVENT_THREAD,
                    vec![EventModifier::LocationOnly {
                        location: bl.vm_location,
                    }],
                )
                .await?;
            request_ids.push(request_id);
            vm_locations.push(bl.vm_location);
        }

        let first = &matches[0];
        self.state.table.record_enabled(EnabledBreakpoint {
            id: id.clone(),
            breakable_id: first.id.clone(),
            request_ids,
            vm_locations,
            one_shot: false,
        });

        Ok(Some(Breakpoint {
            id,
            script_id: first.script.id().to_string(),
            location: first.script_location,
        }))
    }

    async fn remove_breakpoint(&mut self, breakpoint_id: &str) -> HostResult<()> {
        let Some(enabled) = self.state.table.take_enabled(breakpoint_id) else {
            return Ok(());
        };
        for request_id in enabled.request_ids {
            let _ = self
                .client
                .event_request_clear(EVENT_KIND_BREAKPOINT, request_id)
                .await;
        }
        Ok(())
    }

    async fn pause_on_exceptions(&mut self, mode: ExceptionPauseMode) -> HostResult<()> {
        if let Some(request_id) = self.state.exception_request.take() {
            let _ = self
                .client
                .event_request_clear(EVENT_KIND_EXCEPTION, request_id)
                .await;
        }
        let Some((caught, uncaught)) = mode.flags() else {
            return Ok(());
        };
        let ecma = self
            .state
            .infra
            .get(nashorn::ECMA_EXCEPTION_CLASS)
            .unwrap_or(0);
        let request_id = self
            .client
            .event_request_set(
                EVENT_KIND_EXCEPTION,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![
                    EventModifier::ExceptionOnly {
                        exception_or_null: ecma,
                        caught,
                        uncaught,
                    },
                    EventModifier::ClassMatch {
                        pattern: nashorn::SCRIPT_CLASS_MATCH.to_string(),
                    },
                ],
            )
            .await?;
        self.state.exception_request = Some(request_id);
        Ok(())
    }

    /// Briefly suspend the VM, arm one-shot breakpoints on the current line
    /// locations of every non-infrastructure thread plus method entry/exit
    /// on script classes, then resume. The first event clears all arms.
    async fn pause_at_next_statement(&mut self) -> HostResult<()> {
        if self.state.paused.is_some() {
            return Err(HostError::IllegalState(
                "already paused; pause-at-next-statement needs a running target".to_string(),
            ));
        }

        self.client.vm_suspend().await?;
        let result = self.arm_next_statement().await;
        let resume = self.client.vm_resume().await;
        result?;
        resume?;
        Ok(())
    }

    async fn arm_next_statement(&mut self) -> HostResult<()> {
        let threads = self.client.all_threads().await?;
        let mut seeds: Vec<Location> = Vec::new();
        for thread in threads {
            let name = self
                .client
                .thread_name(thread)
                .await
                .unwrap_or_default();
            if INFRASTRUCTURE_THREADS.contains(&name.as_str()) || name.starts_with("JDWP") {
                continue;
            }
            let Ok(frames) = self.client.frames(thread, 0, -1).await else {
                continue;
            };
            for frame in frames {
                let Ok(table) = self
                    .client
                    .method_line_table(frame.location.class_id, frame.location.method_id)
                    .await
                else {
                    continue;
                };
                if table.lines.is_empty() {
                    continue;
                }
                seeds.extend(table.lines.iter().map(|entry| Location {
                    type_tag: frame.location.type_tag,
                    class_id: frame.location.class_id,
                    method_id: frame.location.method_id,
                    index: entry.code_index,
                }));
                break;
            }
        }

        self.arm_one_shot_breakpoints(&seeds).await?;

        for event_kind in [EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT] {
            let request_id = self
                .client
                .event_request_set(
                    event_kind,
                    SUSPEND_POLICY_EVENT_THREAD,
                    vec![EventModifier::ClassMatch {
                        pattern: nashorn::SCRIPT_CLASS_MATCH.to_string(),
                    }],
                )
                .await?;
            self.state.pause_arm_requests.push((event_kind, request_id));
        }
        Ok(())
    }

    async fn arm_one_shot_breakpoints(&mut self, seeds: &[Location]) -> HostResult<()> {
        for location in seeds {
            let request_id = self
                .client
                .event_request_set(
                    EVENT_KIND_BREAKPOINT,
                    SUSPEND_POLICY_EVENT_THREAD,
                    vec![EventModifier::LocationOnly {
                        location: *location,
                    }],
                )
                .await?;
            let id = self.state.table.allocate_breakpoint_id();
            self.state.table.record_enabled(EnabledBreakpoint {
                id,
                breakable_id: String::new(),
                request_ids: vec![request_id],
                vm_locations: vec![*location],
                one_shot: true,
            });
        }
        Ok(())
    }

    async fn step(&mut self, kind: StepKind) -> HostResult<()> {
        let Some(paused) = self.state.paused.as_ref() else {
            return Err(HostError::IllegalState("step requires a pause".to_string()));
        };
        let seeds = pause::step_seed_locations(&self.state.table, paused, kind);
        self.arm_one_shot_breakpoints(&seeds).await?;
        self.resume_from_pause().await
    }

    async fn resume_from_pause(&mut self) -> HostResult<()> {
        if self.state.paused.take().is_none() {
            return Err(HostError::IllegalState("not paused".to_string()));
        }
        self.state.registry.clear();
        self.client.vm_resume().await?;
        self.bus.publish(DebuggerEvent::Resumed);
        Ok(())
    }

    async fn clear_one_shot_arms(&mut self) {
        for enabled in self.state.table.take_one_shots() {
            for request_id in enabled.request_ids {
                let _ = self
                    .client
                    .event_request_clear(EVENT_KIND_BREAKPOINT, request_id)
                    .await;
            }
        }
        let arms = std::mem::take(&mut self.state.pause_arm_requests);
        for (event_kind, request_id) in arms {
            let _ = self.client.event_request_clear(event_kind, request_id).await;
        }
    }

    async fn handle_pause_trigger(
        &mut self,
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: Option<(ObjectId, bool)>,
    ) {
        if self.state.paused.is_some() {
            // One debug session at a time; release the extra thread.
            let _ = self.client.thread_resume(thread).await;
            return;
        }

        let is_debugger_trap = self.state.debugger_trap_request == Some(request_id);

        if !self.state.will_pause_on_breakpoints {
            let _ = self.client.thread_resume(thread).await;
            return;
        }

        // Source for some script classes only becomes readable between
        // class-prepare and the first hit; retries are already queued via
        // the mailbox, so at this point the table simply reflects what
        // resolved so far.
        self.clear_one_shot_arms().await;
        self.state.registry.clear();

        let snapshot = match pause::snapshot_thread(
            &self.client,
            &mut self.state.var_tables,
            thread,
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(target = "tern.host", error = %err, "frame snapshot failed");
                let _ = self.client.thread_resume(thread).await;
                return;
            }
        };

        let top_recognized = snapshot
            .frames
            .first()
            .map(|f| self.state.table.find_by_vm_location(&f.location).is_some())
            .unwrap_or(false);
        if !top_recognized && !is_debugger_trap {
            tracing::debug!(
                target = "tern.host",
                ?location,
                "ignoring hit outside known scripts"
            );
            let _ = self.client.thread_resume(thread).await;
            return;
        }

        // From here on, invoking into the VM is allowed: the raw snapshot is
        // taken. Resolve the engine's Context instance on the first pause.
        if self.state.context_obj.is_none() {
            if let Some(engine) = self.state.engine.clone() {
                let mut ctx = MarshalCtx {
                    client: &self.client,
                    thread,
                    registry: &mut self.state.registry,
                    methods: &mut self.state.methods,
                    names: &mut self.state.names,
                };
                match eval::resolve_context_instance(&mut ctx, &engine).await {
                    Ok(context_obj) => self.state.context_obj = Some(context_obj),
                    Err(err) => {
                        tracing::warn!(target = "tern.host", error = %err, "Context instance unavailable");
                    }
                }
            }
        }

        let engine = self.state.engine.clone();
        let context_obj = self.state.context_obj;
        let mut ctx = MarshalCtx {
            client: &self.client,
            thread,
            registry: &mut self.state.registry,
            methods: &mut self.state.methods,
            names: &mut self.state.names,
        };
        let frames = match pause::build_paused_frames(
            &mut ctx,
            engine.as_ref(),
            context_obj,
            &self.state.table,
            &snapshot,
        )
        .await
        {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(target = "tern.host", error = %err, "building stack frames failed");
                let _ = self.client.thread_resume(thread).await;
                return;
            }
        };

        if frames.is_empty() {
            let _ = self.client.thread_resume(thread).await;
            return;
        }

        if let Some((exception_obj, uncaught)) = exception {
            if uncaught {
                let error = self.marshal_error(thread, exception_obj).await;
                self.bus.publish(DebuggerEvent::UncaughtError(error));
            }
        }

        let views: Vec<StackFrameView> = frames.iter().map(|f| f.view.clone()).collect();
        self.state.paused = Some(PausedData {
            thread,
            frames,
            properties_cache: HashMap::new(),
        });
        self.bus.publish(DebuggerEvent::HitBreakpoint(views));
    }

    async fn marshal_error(&mut self, thread: ThreadId, exception_obj: ObjectId) -> ErrorValue {
        let mut ctx = MarshalCtx {
            client: &self.client,
            thread,
            registry: &mut self.state.registry,
            methods: &mut self.state.methods,
            names: &mut self.state.names,
        };
        match marshal::marshal_thrown(&mut ctx, exception_obj).await {
            Ok(ValueNode::Error { data, .. }) => data,
            Ok(other) => ErrorValue {
                name: "Error".to_string(),
                message: format!("{other:?}"),
                stack: None,
            },
            Err(err) => ErrorValue {
                name: "Error".to_string(),
                message: err.to_string(),
                stack: None,
            },
        }
    }

    async fn evaluate_on_stack_frame(
        &mut self,
        stack_frame_id: &str,
        expression: &str,
        named_objects: HashMap<String, RemoteObjectId>,
    ) -> HostResult<ValueNode> {
        let Some(paused) = self.state.paused.as_ref() else {
            return Err(HostError::IllegalState(
                "evaluateOnStackFrame requires a pause".to_string(),
            ));
        };
        let thread = paused.thread;
        let Some(frame) = paused.frame(stack_frame_id) else {
            return Err(HostError::InvalidRequest(format!(
                "unknown stack frame id {stack_frame_id}"
            )));
        };
        let engine = self
            .state
            .engine
            .clone()
            .ok_or_else(|| HostError::EngineContract("engine entry points unresolved".to_string()))?;
        let context_obj = self
            .state
            .context_obj
            .ok_or_else(|| HostError::EngineContract("Context instance unresolved".to_string()))?;

        let frame_wrapper = frame.wrapper;
        let frame_location = frame.location;
        let this_raw = frame.this_raw.unwrap_or(engine.undefined);
        let base_scope = frame
            .wrapper
            .map(|id| JdwpValue::Object { tag: TAG_OBJECT, id })
            .or(frame.original_scope)
            .or(frame.this_raw)
            .unwrap_or(engine.undefined);
        let frame_locals: Vec<(String, u32, String)> = frame
            .locals
            .iter()
            .map(|l| (l.name.clone(), l.slot, l.signature.clone()))
            .collect();

        // Resolve ad-hoc named objects against the registry up front so a
        // stale id fails the call before anything runs in the target.
        let mut named_raw: Vec<(String, JdwpValue)> = Vec::with_capacity(named_objects.len());
        for (name, object_id) in named_objects {
            let raw = self
                .state
                .registry
                .raw(&object_id)
                .ok_or(HostError::UnknownObject(object_id))?;
            named_raw.push((name, raw));
        }

        let mut ctx = MarshalCtx {
            client: &self.client,
            thread,
            registry: &mut self.state.registry,
            methods: &mut self.state.methods,
            names: &mut self.state.names,
        };

        // Start from a clean change log so write-back only sees this
        // evaluation's mutations.
        if let Some(wrapper) = frame_wrapper {
            eval::reset_changes(&mut ctx, &engine, wrapper).await?;
        }

        let scope = if named_raw.is_empty() {
            base_scope
        } else {
            let wrapper =
                eval::create_scope_wrapper(&mut ctx, &engine, context_obj, base_scope, &named_raw)
                    .await?;
            JdwpValue::Object {
                tag: TAG_OBJECT,
                id: wrapper,
            }
        };

        let outcome = eval::evaluate(&mut ctx, &engine, context_obj, scope, this_raw, expression)
            .await?;

        let node = match outcome {
            EvalOutcome::Value(value) => marshal::marshal(&mut ctx, value).await?,
            EvalOutcome::Thrown(exception) => marshal::marshal_thrown(&mut ctx, exception).await?,
        };

        // Write back mutated locals to the real frame slots.
        if let Some(wrapper) = frame_wrapper {
            let changes = eval::read_changes(&mut ctx, wrapper).await?;
            if !changes.is_empty() {
                self.write_back_locals(thread, frame_location, &frame_locals, changes)
                    .await?;
            }
        }

        // Evaluation may have mutated arbitrary objects.
        if let Some(paused) = self.state.paused.as_mut() {
            paused.properties_cache.clear();
        }

        Ok(node)
    }

    /// Apply `[name, newValue]` change records to the JDI frame that still
    /// matches the recorded location (invocations may have replaced frame
    /// handles since the snapshot).
    async fn write_back_locals(
        &mut self,
        thread: ThreadId,
        location: Location,
        locals: &[(String, u32, String)],
        changes: Vec<(String, JdwpValue)>,
    ) -> HostResult<()> {
        let frames = self.client.frames(thread, 0, -1).await?;
        let Some(frame) = frames.iter().find(|f| f.location == location) else {
            tracing::warn!(
                target = "tern.host",
                "no frame matches the recorded location; dropping local write-back"
            );
            return Ok(());
        };

        let mut updates: Vec<(u32, JdwpValue)> = Vec::new();
        for (name, new_value) in changes {
            let Some((_, slot, signature)) = locals.iter().find(|(n, _, _)| *n == name) else {
                continue;
            };
            let value = self.coerce_for_slot(thread, signature, new_value).await;
            updates.push((*slot, value));
        }
        if updates.is_empty() {
            return Ok(());
        }
        self.client
            .stack_frame_set_values(thread, frame.frame_id, &updates)
            .await?;
        Ok(())
    }

    /// Unbox a boxed primitive when the local slot wants a primitive
    /// signature; Nashorn slots are usually `Object`, where the boxed value
    /// is stored as-is.
    async fn coerce_for_slot(
        &mut self,
        _thread: ThreadId,
        signature: &str,
        value: JdwpValue,
    ) -> JdwpValue {
        let primitive_slot = matches!(
            signature.as_bytes().first(),
            Some(b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z')
        );
        if !primitive_slot {
            return value;
        }
        let Some(object_id) = value.object_id() else {
            return value;
        };
        // Read the box's `value` field.
        let Ok(class_id) = self
            .client
            .object_reference_reference_type(object_id)
            .await
        else {
            return value;
        };
        let Ok(fields) = self.client.reference_type_fields(class_id).await else {
            return value;
        };
        let Some(field) = fields.iter().find(|f| f.name == "value") else {
            return value;
        };
        match self
            .client
            .object_reference_get_values(object_id, &[field.field_id])
            .await
        {
            Ok(values) if !values.is_empty() => values[0],
            _ => value,
        }
    }

    async fn get_object_properties(
        &mut self,
        object_id: RemoteObjectId,
        only_own: bool,
        only_accessors: bool,
    ) -> HostResult<HashMap<String, ObjectPropertyDescriptor>> {
        let Some(paused) = self.state.paused.as_ref() else {
            return Err(HostError::IllegalState(
                "getObjectProperties requires a pause".to_string(),
            ));
        };
        let thread = paused.thread;

        let cache_key = (object_id.clone(), only_own, only_accessors);
        if let Some(cached) = paused.properties_cache.get(&cache_key) {
            return Ok(cached.iter().cloned().collect());
        }

        let Some(entry) = self.state.registry.get(&object_id).cloned() else {
            tracing::warn!(
                target = "tern.host",
                object_id = %object_id,
                "unknown object id (stale pause?); returning no properties"
            );
            return Ok(HashMap::new());
        };

        self.ensure_extractor(thread).await;

        let engine = self.state.engine.clone();
        let extractor_fn = self.state.extractor_fn;
        let mut ctx = MarshalCtx {
            client: &self.client,
            thread,
            registry: &mut self.state.registry,
            methods: &mut self.state.methods,
            names: &mut self.state.names,
        };
        let properties = properties::extract_properties(
            &mut ctx,
            engine.as_ref(),
            extractor_fn,
            &entry,
            only_own,
            only_accessors,
        )
        .await?;

        if let Some(paused) = self.state.paused.as_mut() {
            paused.properties_cache.insert(cache_key, properties.clone());
        }
        Ok(properties.into_iter().collect())
    }

    /// Evaluate and pin the in-target property extractor on first use.
    async fn ensure_extractor(&mut self, thread: ThreadId) {
        if self.state.extractor_fn.is_some() {
            return;
        }
        let (Some(engine), Some(context_obj)) =
            (self.state.engine.clone(), self.state.context_obj)
        else {
            return;
        };
        let mut ctx = MarshalCtx {
            client: &self.client,
            thread,
            registry: &mut self.state.registry,
            methods: &mut self.state.methods,
            names: &mut self.state.names,
        };
        match eval::evaluate(
            &mut ctx,
            &engine,
            context_obj,
            engine.undefined,
            engine.undefined,
            eval::PROPERTY_EXTRACTOR_SOURCE,
        )
        .await
        {
            Ok(EvalOutcome::Value(value)) => {
                if let Some(fn_id) = value.object_id() {
                    let _ = self.client.object_reference_disable_collection(fn_id).await;
                    self.state.extractor_fn = Some(fn_id);
                }
            }
            Ok(EvalOutcome::Thrown(_)) | Err(_) => {
                tracing::debug!(
                    target = "tern.host",
                    "in-target property extractor unavailable"
                );
            }
        }
    }

    async fn reset(&mut self) -> HostResult<()> {
        for enabled in self.state.table.drain_enabled() {
            for request_id in enabled.request_ids {
                let _ = self
                    .client
                    .event_request_clear(EVENT_KIND_BREAKPOINT, request_id)
                    .await;
            }
        }
        let arms = std::mem::take(&mut self.state.pause_arm_requests);
        for (event_kind, request_id) in arms {
            let _ = self.client.event_request_clear(event_kind, request_id).await;
        }
        if let Some(request_id) = self.state.exception_request.take() {
            let _ = self
                .client
                .event_request_clear(EVENT_KIND_EXCEPTION, request_id)
                .await;
        }
        if let Some(extractor_fn) = self.state.extractor_fn.take() {
            let _ = self
                .client
                .object_reference_enable_collection(extractor_fn)
                .await;
        }
        self.state.will_pause_on_breakpoints = false;
        if self.state.paused.is_some() {
            self.resume_from_pause().await?;
        }
        Ok(())
    }
}
