//! The pause engine: frame snapshots, scope chains, stepping seeds.
//!
//! Order matters on pause entry. A JDWP method invocation temporarily
//! resumes the suspended thread, which invalidates every frame and slot
//! reference obtained from it. The snapshot phase therefore reads all local
//! slots without a single invocation; only once the raw snapshot is taken
//! does marshalling (which may call into the VM) start.

use std::collections::HashMap;
use std::sync::Arc;

use tern_jdwp::{
    types::ERROR_INVALID_SLOT, FrameId, JdwpClient, JdwpValue, Location, MethodId, ObjectId,
    ReferenceTypeId, ThreadId, VariableInfo,
};

use crate::breakpoints::{BreakableLocationTable, ScriptLocation};
use crate::error::HostResult;
use crate::eval;
use crate::invoke::{invoke_named, InvokeOutcome};
use crate::marshal::{marshal, MarshalCtx};
use crate::nashorn::{self, EngineHandles, ScopeKind};
use crate::objects::ObjectEntry;
use crate::url::ScriptUrl;
use crate::values::{ObjectPropertyDescriptor, RemoteObjectId, ValueNode};

/// Frame-local variables Nashorn maintains under reserved names.
const THIS_LOCAL: &str = ":this";
const SCOPE_LOCAL: &str = ":scope";
const RETURN_LOCAL: &str = ":return";

const PROTO_WALK_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub struct NamedLocal {
    pub name: String,
    pub slot: u32,
    pub signature: String,
    pub value: JdwpValue,
}

#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame_id: FrameId,
    pub location: Location,
    pub locals: Vec<NamedLocal>,
}

impl FrameSnapshot {
    pub fn special(&self, name: &str) -> Option<JdwpValue> {
        self.locals
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value)
    }

    /// Locals that are real script variables (reserved `:`-names excluded).
    pub fn plain_locals(&self) -> Vec<NamedLocal> {
        self.locals
            .iter()
            .filter(|l| !l.name.starts_with(':'))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PauseSnapshot {
    pub thread: ThreadId,
    pub frames: Vec<FrameSnapshot>,
}

/// Method variable tables, cached per attach.
#[derive(Default)]
pub struct VariableTableCache {
    tables: HashMap<(ReferenceTypeId, MethodId), Arc<Vec<VariableInfo>>>,
}

impl VariableTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &mut self,
        client: &JdwpClient,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> HostResult<Arc<Vec<VariableInfo>>> {
        let key = (class_id, method_id);
        if let Some(table) = self.tables.get(&key) {
            return Ok(table.clone());
        }
        let (_argc, vars) = client.method_variable_table(class_id, method_id).await?;
        let table = Arc::new(vars);
        self.tables.insert(key, table.clone());
        Ok(table)
    }
}

/// Snapshot every frame of the suspended thread: visible variables resolved
/// in one batch per frame, degrading to per-variable reads when the VM
/// rejects a batch with `INVALID_SLOT` (slots the variable table lists but
/// the compiled code never materialized).
pub async fn snapshot_thread(
    client: &JdwpClient,
    tables: &mut VariableTableCache,
    thread: ThreadId,
) -> HostResult<PauseSnapshot> {
    let frames = client.frames(thread, 0, -1).await?;
    let mut out = Vec::with_capacity(frames.len());

    for frame in frames {
        let table = tables
            .get(client, frame.location.class_id, frame.location.method_id)
            .await;
        let visible: Vec<VariableInfo> = match table {
            Ok(table) => table
                .iter()
                .filter(|v| v.visible_at(frame.location.index) && v.name != RETURN_LOCAL)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };

        let locals = read_frame_locals(client, thread, frame.frame_id, &visible).await?;
        out.push(FrameSnapshot {
            frame_id: frame.frame_id,
            location: frame.location,
            locals,
        });
    }

    Ok(PauseSnapshot { thread, frames: out })
}

async fn read_frame_locals(
    client: &JdwpClient,
    thread: ThreadId,
    frame_id: FrameId,
    visible: &[VariableInfo],
) -> HostResult<Vec<NamedLocal>> {
    if visible.is_empty() {
        return Ok(Vec::new());
    }

    let slots: Vec<(u32, String)> = visible
        .iter()
        .map(|v| (v.slot, v.signature.clone()))
        .collect();

    match client.stack_frame_get_values(thread, frame_id, &slots).await {
        Ok(values) => Ok(visible
            .iter()
            .zip(values)
            .map(|(var, value)| NamedLocal {
                name: var.name.clone(),
                slot: var.slot,
                signature: var.signature.clone(),
                value,
            })
            .collect()),
        Err(err) if err.vm_error_code() == Some(ERROR_INVALID_SLOT) => {
            // Retry one variable at a time, dropping the offenders.
            let mut locals = Vec::with_capacity(visible.len());
            for var in visible {
                match client
                    .stack_frame_get_values(
                        thread,
                        frame_id,
                        &[(var.slot, var.signature.clone())],
                    )
                    .await
                {
                    Ok(mut values) if !values.is_empty() => locals.push(NamedLocal {
                        name: var.name.clone(),
                        slot: var.slot,
                        signature: var.signature.clone(),
                        value: values.remove(0),
                    }),
                    Ok(_) => {}
                    Err(err) if err.vm_error_code() == Some(ERROR_INVALID_SLOT) => {
                        tracing::warn!(
                            target = "tern.host",
                            variable = %var.name,
                            slot = var.slot,
                            "skipping local with invalid slot"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(locals)
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Clone, Debug)]
pub struct ScopeView {
    pub kind: ScopeKind,
    pub object: ValueNode,
}

#[derive(Clone, Debug)]
pub struct StackFrameView {
    pub id: String,
    pub function_name: String,
    pub script_id: String,
    pub url: ScriptUrl,
    pub location: ScriptLocation,
    pub this: ValueNode,
    pub scope_chain: Vec<ScopeView>,
}

#[derive(Debug)]
pub struct PausedFrame {
    pub view: StackFrameView,
    pub frame_id: FrameId,
    pub location: Location,
    /// The synthesized scope object in the target, when the frame has
    /// locals. Evaluations run against it.
    pub wrapper: Option<ObjectId>,
    pub this_raw: Option<JdwpValue>,
    pub original_scope: Option<JdwpValue>,
    pub locals: Vec<NamedLocal>,
}

pub struct PausedData {
    pub thread: ThreadId,
    pub frames: Vec<PausedFrame>,
    pub properties_cache:
        HashMap<(RemoteObjectId, bool, bool), Vec<(String, ObjectPropertyDescriptor)>>,
}

impl PausedData {
    pub fn frame(&self, stack_frame_id: &str) -> Option<&PausedFrame> {
        if stack_frame_id == "$top" {
            return self.frames.first();
        }
        self.frames.iter().find(|f| f.view.id == stack_frame_id)
    }

    pub fn views(&self) -> Vec<StackFrameView> {
        self.frames.iter().map(|f| f.view.clone()).collect()
    }
}

/// Marshal a raw snapshot into paused frames with scope chains. This phase
/// may invoke into the VM freely; the snapshot is already taken.
#[allow(clippy::too_many_arguments)]
pub async fn build_paused_frames(
    ctx: &mut MarshalCtx<'_>,
    engine: Option<&EngineHandles>,
    context_obj: Option<ObjectId>,
    table: &BreakableLocationTable,
    snapshot: &PauseSnapshot,
) -> HostResult<Vec<PausedFrame>> {
    let mut frames = Vec::with_capacity(snapshot.frames.len());

    for (idx, frame) in snapshot.frames.iter().enumerate() {
        let Some(breakable) = table.find_by_vm_location(&frame.location).cloned() else {
            continue;
        };

        let this_raw = frame.special(THIS_LOCAL);
        let scope_raw = frame.special(SCOPE_LOCAL);
        let plain_locals = frame.plain_locals();
        let frame_view_id = format!("sf-{}", idx + 1);

        // Synthesize the locals wrapper when the frame has locals and the
        // engine entry points are available.
        let mut wrapper = None;
        let mut scope_chain = Vec::new();
        if !plain_locals.is_empty() {
            if let (Some(engine), Some(context_obj)) = (engine, context_obj) {
                let proto = scope_raw
                    .or(this_raw)
                    .unwrap_or(engine.undefined);
                let local_pairs: Vec<(String, JdwpValue)> = plain_locals
                    .iter()
                    .map(|l| (l.name.clone(), l.value))
                    .collect();
                match eval::create_scope_wrapper(ctx, engine, context_obj, proto, &local_pairs)
                    .await
                {
                    Ok(wrapper_id) => {
                        let locals_node_id = RemoteObjectId::new(format!("$$locals-{frame_view_id}"));
                        let mut extras = HashMap::new();
                        for local in &plain_locals {
                            let node = marshal(ctx, local.value).await?;
                            extras.insert(local.name.clone(), node);
                        }
                        let node = ValueNode::Object {
                            class_name: "Object".to_string(),
                            id: locals_node_id.clone(),
                        };
                        ctx.registry.insert(
                            locals_node_id,
                            ObjectEntry {
                                raw: Some(JdwpValue::Object {
                                    tag: tern_jdwp::types::TAG_OBJECT,
                                    id: wrapper_id,
                                }),
                                node: node.clone(),
                                extras,
                            },
                        );
                        scope_chain.push(ScopeView {
                            kind: ScopeKind::Local,
                            object: node,
                        });
                        wrapper = Some(wrapper_id);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "tern.host",
                            error = %err,
                            "failed to synthesize locals scope"
                        );
                    }
                }
            }
        }

        scope_chain
            .extend(original_scope_chain(ctx, scope_raw).await?);

        // Make sure a Global scope terminates the chain.
        if !scope_chain.iter().any(|s| s.kind == ScopeKind::Global) {
            if let Some(global) = global_scope(ctx, engine, context_obj).await {
                scope_chain.push(global);
            }
        }

        let this_node = match this_raw {
            Some(value) => marshal(ctx, value).await?,
            None => ValueNode::UNDEFINED,
        };

        let method_name = ctx
            .methods
            .methods_of(ctx.client, frame.location.class_id)
            .await
            .ok()
            .and_then(|methods| {
                methods
                    .iter()
                    .find(|m| m.method_id == frame.location.method_id)
                    .map(|m| m.name.clone())
            })
            .unwrap_or_default();
        let function_name = script_function_name(&method_name);

        frames.push(PausedFrame {
            view: StackFrameView {
                id: frame_view_id,
                function_name,
                script_id: breakable.script.id().to_string(),
                url: breakable.script.url().clone(),
                location: breakable.script_location,
                this: this_node,
                scope_chain,
            },
            frame_id: frame.frame_id,
            location: frame.location,
            wrapper,
            this_raw,
            original_scope: scope_raw,
            locals: plain_locals,
        });
    }

    Ok(frames)
}

/// Walk the original scope and its prototype chain, labelling each link by
/// its VM type.
async fn original_scope_chain(
    ctx: &mut MarshalCtx<'_>,
    scope_raw: Option<JdwpValue>,
) -> HostResult<Vec<ScopeView>> {
    let mut chain = Vec::new();
    let mut current = scope_raw;
    for _ in 0..PROTO_WALK_LIMIT {
        let Some(value) = current else { break };
        let Some(object_id) = value.object_id() else { break };

        let class_name = ctx
            .names
            .name_of_object(ctx.client, object_id)
            .await
            .unwrap_or_default();
        let kind = nashorn::scope_kind_for_class(&class_name);
        let node = marshal(ctx, value).await?;
        chain.push(ScopeView { kind, object: node });
        if kind == ScopeKind::Global {
            break;
        }

        current = match invoke_named(ctx.client, ctx.methods, ctx.thread, object_id, "getProto", &[])
            .await
        {
            Ok(InvokeOutcome::Value(proto)) if proto.object_id().is_some() => Some(proto),
            _ => None,
        };
    }
    Ok(chain)
}

async fn global_scope(
    ctx: &mut MarshalCtx<'_>,
    engine: Option<&EngineHandles>,
    context_obj: Option<ObjectId>,
) -> Option<ScopeView> {
    let engine = engine?;
    context_obj?;
    let (global, exception) = ctx
        .client
        .class_type_invoke_method(
            engine.context_class,
            ctx.thread,
            engine.get_global_method,
            &[],
            0,
        )
        .await
        .ok()?;
    if exception != 0 || global.object_id().is_none() {
        return None;
    }
    let node = marshal(ctx, global).await.ok()?;
    Some(ScopeView {
        kind: ScopeKind::Global,
        object: node,
    })
}

/// Nashorn compiles global code into a `:program` method and functions into
/// methods whose (possibly mangled) name ends with the function name.
fn script_function_name(method_name: &str) -> String {
    if method_name.starts_with(':') {
        return String::new();
    }
    method_name
        .rsplit('$')
        .next()
        .unwrap_or(method_name)
        .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

/// Compute the VM locations to arm as one-shot breakpoints for a step.
///
/// Script lines and JVM lines do not correspond, so stepping is faked with
/// one-shot breakpoints: step-into seeds every breakable location of every
/// script; step-over seeds the current frame's method at lines past the
/// current one plus the same in the parent frame; step-out seeds the parent
/// frame only.
pub fn step_seed_locations(
    table: &BreakableLocationTable,
    paused: &PausedData,
    kind: StepKind,
) -> Vec<Location> {
    let mut seeds: Vec<Location> = Vec::new();

    match kind {
        StepKind::Into => {
            seeds.extend(table.all().map(|bl| bl.vm_location));
        }
        StepKind::Over => {
            if let Some(top) = paused.frames.first() {
                seeds.extend(method_locations_after(table, &top.location));
            }
            if let Some(parent) = paused.frames.get(1) {
                seeds.extend(method_locations_after(table, &parent.location));
            }
        }
        StepKind::Out => {
            if let Some(parent) = paused.frames.get(1) {
                seeds.extend(method_locations_after(table, &parent.location));
            }
        }
    }

    seeds.sort_by_key(|l| (l.class_id, l.method_id, l.index));
    seeds.dedup();
    seeds
}

/// Breakable locations in the method of `at`, strictly after its line.
fn method_locations_after(table: &BreakableLocationTable, at: &Location) -> Vec<Location> {
    let current_line = line_at(table, at).unwrap_or(0);
    table
        .all()
        .filter(|bl| {
            bl.vm_location.class_id == at.class_id
                && bl.vm_location.method_id == at.method_id
                && bl.script_location.line > current_line
        })
        .map(|bl| bl.vm_location)
        .collect()
}

/// The script line of a VM location: exact match preferred, otherwise the
/// closest breakable location at or before the code index in the same
/// method.
fn line_at(table: &BreakableLocationTable, location: &Location) -> Option<u32> {
    if let Some(bl) = table.find_by_vm_location(location) {
        return Some(bl.script_location.line);
    }
    table
        .all()
        .filter(|bl| {
            bl.vm_location.class_id == location.class_id
                && bl.vm_location.method_id == location.method_id
                && bl.vm_location.index <= location.index
        })
        .max_by_key(|bl| bl.vm_location.index)
        .map(|bl| bl.script_location.line)
}
