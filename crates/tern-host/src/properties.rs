//! Property extraction from remote objects.
//!
//! `getObjectProperties` dispatches on the runtime kind of the raw value
//! behind an object id. Script objects prefer the in-target extractor
//! function (one invocation returns every descriptor); JDI arrays, mirror
//! objects, `Hashtable`s and arbitrary host objects each get their own
//! walker. Hidden names (the `||` prefix) never leak out.

use tern_jdwp::{
    types::{TAG_ARRAY, TAG_STRING},
    JdwpValue, ObjectId,
};

use crate::error::{HostError, HostResult};
use crate::invoke::{invoke_named, script_object_get, InvokeOutcome};
use crate::marshal::{marshal, MarshalCtx};
use crate::nashorn::{self, EngineHandles};
use crate::objects::ObjectEntry;
use crate::values::{ObjectPropertyDescriptor, ValueNode};

/// Upper bound on `Hashtable` enumeration, as a defense against a target
/// that keeps answering `hasMoreElements() == true`.
const HASHTABLE_ENTRY_LIMIT: usize = 10_000;

/// How many prototype links the fallback key walk follows.
const PROTO_WALK_LIMIT: usize = 8;

pub async fn extract_properties(
    ctx: &mut MarshalCtx<'_>,
    engine: Option<&EngineHandles>,
    extractor_fn: Option<ObjectId>,
    entry: &ObjectEntry,
    only_own: bool,
    only_accessors: bool,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let mut out: Vec<(String, ObjectPropertyDescriptor)> = Vec::new();

    // Synthesized extra entries (e.g. the members of a `$$locals-*` object)
    // come first; the raw object below contributes the rest.
    if !only_accessors {
        let mut extras: Vec<_> = entry.extras.iter().collect();
        extras.sort_by(|a, b| a.0.cmp(b.0));
        for (name, node) in extras {
            out.push((
                name.clone(),
                ObjectPropertyDescriptor::data(node.clone(), false, true),
            ));
        }
    }

    let Some(raw) = entry.raw else {
        return Ok(out);
    };
    let Some(object_id) = raw.object_id() else {
        return Ok(out);
    };

    let properties = match raw {
        JdwpValue::Object { tag: TAG_ARRAY, .. } => {
            if only_accessors {
                Vec::new()
            } else {
                array_properties(ctx, object_id).await?
            }
        }
        _ => {
            let class_name = ctx.names.name_of_object(ctx.client, object_id).await?;
            if class_name.starts_with(nashorn::SCRIPT_OBJECT_PACKAGE) {
                script_object_properties(
                    ctx,
                    engine,
                    extractor_fn,
                    object_id,
                    only_own,
                    only_accessors,
                )
                .await?
            } else if is_mirror_class(&class_name) {
                if only_accessors {
                    Vec::new()
                } else {
                    mirror_properties(ctx, object_id).await?
                }
            } else if is_hashtable(ctx, object_id).await? {
                // Hash tables expose entries as plain data; accessors cannot
                // exist on them.
                if only_accessors {
                    Vec::new()
                } else {
                    hashtable_properties(ctx, object_id).await?
                }
            } else if only_accessors {
                Vec::new()
            } else {
                host_object_properties(ctx, object_id, only_own).await?
            }
        }
    };

    out.extend(
        properties
            .into_iter()
            .filter(|(name, _)| !name.starts_with(nashorn::HIDDEN_PREFIX)),
    );
    Ok(out)
}

async fn array_properties(
    ctx: &mut MarshalCtx<'_>,
    array_id: ObjectId,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let length = ctx.client.array_reference_length(array_id).await?.max(0);
    let mut out = Vec::with_capacity(length as usize + 1);
    if length > 0 {
        let values = ctx
            .client
            .array_reference_get_values(array_id, 0, length)
            .await?;
        for (idx, value) in values.into_iter().enumerate() {
            let node = marshal(ctx, value).await?;
            out.push((
                idx.to_string(),
                ObjectPropertyDescriptor::data(node, true, true),
            ));
        }
    }
    out.push((
        "length".to_string(),
        ObjectPropertyDescriptor::data(
            ValueNode::Simple(crate::values::SimpleValue::Number(length.into())),
            false,
            true,
        ),
    ));
    Ok(out)
}

async fn script_object_properties(
    ctx: &mut MarshalCtx<'_>,
    engine: Option<&EngineHandles>,
    extractor_fn: Option<ObjectId>,
    object_id: ObjectId,
    only_own: bool,
    only_accessors: bool,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    if let (Some(engine), Some(extractor_fn)) = (engine, extractor_fn) {
        match extract_via_helper(ctx, engine, extractor_fn, object_id, only_own, only_accessors)
            .await
        {
            Ok(properties) => return Ok(properties),
            Err(err) => {
                tracing::debug!(
                    target = "tern.host",
                    error = %err,
                    "in-target extractor failed, walking keys instead"
                );
            }
        }
    }
    own_keys_properties(ctx, object_id, only_own, only_accessors).await
}

/// Run the pre-compiled extractor function in the target. It returns a flat
/// `Object[]` of `[name, flags, value, getter, setter]` 5-tuples, where
/// `flags` is a subset of `"cewo"`.
async fn extract_via_helper(
    ctx: &mut MarshalCtx<'_>,
    engine: &EngineHandles,
    extractor_fn: ObjectId,
    object_id: ObjectId,
    only_own: bool,
    only_accessors: bool,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let fn_value = JdwpValue::Object {
        tag: tern_jdwp::types::TAG_OBJECT,
        id: extractor_fn,
    };
    let target = JdwpValue::Object {
        tag: tern_jdwp::types::TAG_OBJECT,
        id: object_id,
    };
    let (result, exception) = ctx
        .client
        .class_type_invoke_method(
            engine.script_runtime,
            ctx.thread,
            engine.apply_method,
            &[
                fn_value,
                engine.undefined,
                target,
                JdwpValue::Boolean(only_own),
                JdwpValue::Boolean(only_accessors),
            ],
            0,
        )
        .await?;
    if exception != 0 {
        return Err(HostError::Evaluation(
            "property extractor threw in the target".to_string(),
        ));
    }

    let Some(array_id) = result.object_id() else {
        return Ok(Vec::new());
    };
    let length = ctx.client.array_reference_length(array_id).await?.max(0);
    if length == 0 {
        return Ok(Vec::new());
    }
    let values = ctx
        .client
        .array_reference_get_values(array_id, 0, length)
        .await?;

    let mut out = Vec::new();
    for tuple in values.chunks(5) {
        let [name, flags, value, getter, setter] = tuple else {
            break;
        };
        let Some(name) = string_of(ctx, *name).await else {
            continue;
        };
        let flags = string_of(ctx, *flags).await.unwrap_or_default();
        let is_own = flags.contains('o');
        let writable = flags.contains('w');
        let enumerable = flags.contains('e');
        let configurable = flags.contains('c');

        let getter_node = if getter.is_null() {
            None
        } else {
            Some(marshal(ctx, *getter).await?)
        };
        let setter_node = if setter.is_null() {
            None
        } else {
            Some(marshal(ctx, *setter).await?)
        };

        let mut descriptor = if getter_node.is_some() || setter_node.is_some() {
            ObjectPropertyDescriptor::accessor(getter_node, setter_node, is_own)
        } else {
            let node = marshal(ctx, *value).await?;
            ObjectPropertyDescriptor::data(node, writable, is_own)
        };
        descriptor.enumerable = enumerable;
        descriptor.configurable = configurable;
        out.push((name, descriptor));
    }
    Ok(out)
}

/// Fallback walk when no in-target extractor is available: own keys via
/// `getOwnKeys`, values via `get`, following the prototype chain (`getProto`)
/// unless `only_own`. A shadowed name keeps the nearest definition. Reads
/// that succeed become Data descriptors; a key whose read throws in the
/// target becomes Generic (the slot exists but its value is unobtainable
/// from here). Accessor classification needs the in-target extractor, so
/// accessor-only queries yield nothing on this path.
async fn own_keys_properties(
    ctx: &mut MarshalCtx<'_>,
    object_id: ObjectId,
    only_own: bool,
    only_accessors: bool,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    if only_accessors {
        return Ok(Vec::new());
    }

    let mut out: Vec<(String, ObjectPropertyDescriptor)> = Vec::new();
    let mut current = object_id;
    for depth in 0..PROTO_WALK_LIMIT {
        let is_own = depth == 0;
        for key in own_keys_of(ctx, current).await? {
            let Some(name) = string_of(ctx, key).await else {
                continue;
            };
            if out.iter().any(|(seen, _)| *seen == name) {
                continue;
            }
            let descriptor =
                match script_object_get(ctx.client, ctx.methods, ctx.thread, current, key).await {
                    Ok(value) => {
                        let node = marshal(ctx, value).await?;
                        ObjectPropertyDescriptor::data(node, true, is_own)
                    }
                    Err(_) => ObjectPropertyDescriptor::generic(is_own),
                };
            out.push((name, descriptor));
        }

        if only_own {
            break;
        }
        match invoke_named(ctx.client, ctx.methods, ctx.thread, current, "getProto", &[]).await {
            Ok(InvokeOutcome::Value(proto)) => match proto.object_id() {
                Some(proto_id) => current = proto_id,
                None => break,
            },
            Ok(InvokeOutcome::Thrown(_)) | Err(_) => break,
        }
    }
    Ok(out)
}

/// One object's own keys through `getOwnKeys(true)`. An engine without a
/// reachable `getOwnKeys` (or a throwing one) yields no walkable keys.
async fn own_keys_of(ctx: &mut MarshalCtx<'_>, object_id: ObjectId) -> HostResult<Vec<JdwpValue>> {
    let keys = match invoke_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        object_id,
        "getOwnKeys",
        &[JdwpValue::Boolean(true)],
    )
    .await
    {
        Ok(InvokeOutcome::Value(value)) => value,
        Ok(InvokeOutcome::Thrown(_)) | Err(_) => return Ok(Vec::new()),
    };
    let Some(keys_array) = keys.object_id() else {
        return Ok(Vec::new());
    };
    let count = ctx.client.array_reference_length(keys_array).await?.max(0);
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(ctx
        .client
        .array_reference_get_values(keys_array, 0, count)
        .await?)
}

/// `keySet()`/`getMember` walk over a Nashorn mirror object.
async fn mirror_properties(
    ctx: &mut MarshalCtx<'_>,
    object_id: ObjectId,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let key_set = match invoke_named(ctx.client, ctx.methods, ctx.thread, object_id, "keySet", &[])
        .await?
    {
        InvokeOutcome::Value(value) => value,
        InvokeOutcome::Thrown(_) => return Ok(Vec::new()),
    };
    let Some(set_id) = key_set.object_id() else {
        return Ok(Vec::new());
    };

    // Drain the set through its array form to avoid iterator plumbing.
    let array = match invoke_named(ctx.client, ctx.methods, ctx.thread, set_id, "toArray", &[])
        .await?
    {
        InvokeOutcome::Value(value) => value,
        InvokeOutcome::Thrown(_) => return Ok(Vec::new()),
    };
    let Some(array_id) = array.object_id() else {
        return Ok(Vec::new());
    };
    let count = ctx.client.array_reference_length(array_id).await?.max(0);
    if count == 0 {
        return Ok(Vec::new());
    }
    let keys = ctx
        .client
        .array_reference_get_values(array_id, 0, count)
        .await?;

    let mut out = Vec::new();
    for key in keys {
        let Some(name) = string_of(ctx, key).await else {
            continue;
        };
        let value = match invoke_named(
            ctx.client,
            ctx.methods,
            ctx.thread,
            object_id,
            "getMember",
            &[key],
        )
        .await?
        {
            InvokeOutcome::Value(value) => value,
            InvokeOutcome::Thrown(_) => continue,
        };
        let node = marshal(ctx, value).await?;
        out.push((name, ObjectPropertyDescriptor::data(node, true, true)));
    }
    Ok(out)
}

/// Drive `keys()`/`hasMoreElements()`/`nextElement()` over a `Hashtable`.
async fn hashtable_properties(
    ctx: &mut MarshalCtx<'_>,
    object_id: ObjectId,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let enumeration =
        match invoke_named(ctx.client, ctx.methods, ctx.thread, object_id, "keys", &[]).await? {
            InvokeOutcome::Value(value) => value,
            InvokeOutcome::Thrown(_) => return Ok(Vec::new()),
        };
    let Some(enumeration_id) = enumeration.object_id() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for _ in 0..HASHTABLE_ENTRY_LIMIT {
        let more = match invoke_named(
            ctx.client,
            ctx.methods,
            ctx.thread,
            enumeration_id,
            "hasMoreElements",
            &[],
        )
        .await?
        {
            InvokeOutcome::Value(JdwpValue::Boolean(more)) => more,
            _ => false,
        };
        if !more {
            break;
        }

        let key = match invoke_named(
            ctx.client,
            ctx.methods,
            ctx.thread,
            enumeration_id,
            "nextElement",
            &[],
        )
        .await?
        {
            InvokeOutcome::Value(key) => key,
            InvokeOutcome::Thrown(_) => break,
        };

        let name = match stringify_key(ctx, key).await {
            Some(name) => name,
            None => continue,
        };
        let value = match invoke_named(
            ctx.client,
            ctx.methods,
            ctx.thread,
            object_id,
            "get",
            &[key],
        )
        .await?
        {
            InvokeOutcome::Value(value) => value,
            InvokeOutcome::Thrown(_) => continue,
        };
        let node = marshal(ctx, value).await?;
        out.push((name, ObjectPropertyDescriptor::data(node, true, true)));
    }
    Ok(out)
}

/// Reflective field walk over an arbitrary host object. Superclass fields
/// are included (as non-own) unless `only_own`.
async fn host_object_properties(
    ctx: &mut MarshalCtx<'_>,
    object_id: ObjectId,
    only_own: bool,
) -> HostResult<Vec<(String, ObjectPropertyDescriptor)>> {
    let own_class = ctx.client.object_reference_reference_type(object_id).await?;

    let mut out = Vec::new();
    let mut class_id = own_class;
    for depth in 0..8 {
        let fields = ctx.client.reference_type_fields(class_id).await?;
        let instance_fields: Vec<_> = fields.into_iter().filter(|f| !f.is_static()).collect();
        if !instance_fields.is_empty() {
            let field_ids: Vec<u64> = instance_fields.iter().map(|f| f.field_id).collect();
            let values = ctx
                .client
                .object_reference_get_values(object_id, &field_ids)
                .await?;
            for (field, value) in instance_fields.into_iter().zip(values) {
                // Shadowed superclass fields keep the subclass entry.
                if out.iter().any(|(name, _)| *name == field.name) {
                    continue;
                }
                let node = marshal(ctx, value).await?;
                out.push((
                    field.name,
                    ObjectPropertyDescriptor::data(node, true, depth == 0),
                ));
            }
        }

        if only_own {
            break;
        }
        match ctx.client.class_type_superclass(class_id).await.unwrap_or(None) {
            Some(superclass) => class_id = superclass,
            None => break,
        }
    }
    Ok(out)
}

fn is_mirror_class(class_name: &str) -> bool {
    class_name == nashorn::MIRROR_CLASS
}

async fn is_hashtable(ctx: &mut MarshalCtx<'_>, object_id: ObjectId) -> HostResult<bool> {
    let mut class_id = ctx.client.object_reference_reference_type(object_id).await?;
    for _ in 0..8 {
        let name = ctx.names.name_of(ctx.client, class_id).await?;
        if name == "java.util.Hashtable" {
            return Ok(true);
        }
        match ctx.client.class_type_superclass(class_id).await.unwrap_or(None) {
            Some(superclass) => class_id = superclass,
            None => break,
        }
    }
    Ok(false)
}

async fn string_of(ctx: &mut MarshalCtx<'_>, value: JdwpValue) -> Option<String> {
    match value {
        JdwpValue::Object { tag: TAG_STRING, id } if id != 0 => {
            ctx.client.string_reference_value(id).await.ok()
        }
        JdwpValue::Object { id, .. } if id != 0 => {
            // ConsString keys and similar: one toString round.
            match invoke_named(ctx.client, ctx.methods, ctx.thread, id, "toString", &[]).await {
                Ok(InvokeOutcome::Value(JdwpValue::Object { tag: TAG_STRING, id })) if id != 0 => {
                    ctx.client.string_reference_value(id).await.ok()
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Hash-table keys can be arbitrary objects; stringify primitives directly
/// and objects through `toString`.
async fn stringify_key(ctx: &mut MarshalCtx<'_>, key: JdwpValue) -> Option<String> {
    match key {
        JdwpValue::Object { .. } => string_of(ctx, key).await,
        JdwpValue::Void => None,
        primitive => Some(primitive.to_string()),
    }
}
