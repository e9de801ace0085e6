//! Expression evaluation and scope synthesis.
//!
//! To evaluate user code on a suspended frame the host builds a transient
//! scope object in the target VM: its prototype is the frame's original
//! scope, and every local is shadowed by an accessor pair whose setter
//! appends `[name, newValue]` records to a hidden `||changes` array. After
//! the evaluation those records are replayed onto the real JDI local slots.
//!
//! Every piece of code shipped to the target is prefixed with the evaluated
//! code marker so the host can recognize (and ignore) its own artifacts if
//! they resurface as script classes on a later attach.

use tern_jdwp::{
    types::{TAG_OBJECT, TAG_STRING},
    JdwpValue, ObjectId,
};

use crate::error::{HostError, HostResult};
use crate::invoke::{script_object_get_index, script_object_get_named};
use crate::marshal::MarshalCtx;
use crate::nashorn::{self, EngineHandles};

/// The in-target property extractor (see the property extraction module).
/// Evaluated once per attach and pinned; returns a flat
/// `[name, flags, value, getter, setter]` 5-tuple array per property, with
/// `flags` a subset of `"cewo"`. `Java.to` forces a Java array so lazily
/// concatenated strings collapse to real `String`s on the wire.
pub const PROPERTY_EXTRACTOR_SOURCE: &str = r#"(function(target, onlyOwn, onlyAccessors) {
    var result = [];
    var current = target;
    var own = true;
    while (current !== null && current !== undefined) {
        var names = Object.getOwnPropertyNames(current);
        for (var i = 0; i < names.length; i++) {
            var name = names[i];
            if (name.indexOf('||') === 0) continue;
            var desc = Object.getOwnPropertyDescriptor(current, name);
            var hasAccessor = desc.get !== undefined || desc.set !== undefined;
            if (onlyAccessors && !hasAccessor) continue;
            var flags = '';
            if (desc.configurable) flags += 'c';
            if (desc.enumerable) flags += 'e';
            if (desc.writable) flags += 'w';
            if (own) flags += 'o';
            result.push(name, flags, hasAccessor ? undefined : desc.value, desc.get, desc.set);
        }
        if (onlyOwn) break;
        current = Object.getPrototypeOf(current);
        own = false;
    }
    return (typeof Java !== 'undefined' && Java.to) ? Java.to(result, 'java.lang.Object[]') : result;
})"#;

/// Generate the factory that builds a scope wrapper for the given locals.
/// The factory takes the prototype scope followed by one argument per local,
/// in order.
pub fn wrapper_factory_source(local_names: &[String]) -> String {
    let mut src = String::from("(function(__scope__");
    for idx in 0..local_names.len() {
        src.push_str(&format!(", __v{idx}__"));
    }
    src.push_str(") {\n");
    src.push_str(
        "  var sc = (__scope__ === null || __scope__ === undefined) ? {} : Object.create(__scope__);\n",
    );
    src.push_str("  var changes = [];\n");
    src.push_str(&format!(
        "  Object.defineProperty(sc, {}, {{ value: changes }});\n",
        js_string(nashorn::CHANGES_PROPERTY)
    ));
    src.push_str(&format!(
        "  Object.defineProperty(sc, {}, {{ value: function() {{ changes.length = 0; }} }});\n",
        js_string(nashorn::RESET_CHANGES_PROPERTY)
    ));
    for (idx, name) in local_names.iter().enumerate() {
        let shadow = js_string(&format!("{}{}", nashorn::HIDDEN_PREFIX, name));
        let name_lit = js_string(name);
        src.push_str(&format!("  sc[{shadow}] = __v{idx}__;\n"));
        src.push_str(&format!(
            "  Object.defineProperty(sc, {name_lit}, {{\n    enumerable: true,\n    get: function() {{ return sc[{shadow}]; }},\n    set: function(v) {{ sc[{shadow}] = v; changes.push([{name_lit}, v]); }}\n  }});\n"
        ));
    }
    src.push_str("  return sc;\n})");
    src
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).expect("strings always serialize")
}

/// A completed in-target evaluation: a value, or the exception object of a
/// throw completion (kept distinct from a returned value).
#[derive(Debug, Clone, Copy)]
pub enum EvalOutcome {
    Value(JdwpValue),
    Thrown(ObjectId),
}

/// Run `code` through the engine's private `Context.eval` with the given
/// scope and receiver. The marker prefix is added here; a result that is
/// exactly the marker string (statements have no completion value beyond the
/// leading literal) is suppressed to undefined.
pub async fn evaluate(
    ctx: &mut MarshalCtx<'_>,
    engine: &EngineHandles,
    context_obj: ObjectId,
    scope: JdwpValue,
    this: JdwpValue,
    code: &str,
) -> HostResult<EvalOutcome> {
    let full_code = format!("'{}';{}", nashorn::EVALUATED_CODE_MARKER, code);
    let code_id = ctx.client.create_string(&full_code).await?;

    let (value, exception) = ctx
        .client
        .object_reference_invoke_method(
            context_obj,
            ctx.thread,
            engine.context_class,
            engine.eval_method,
            &[
                scope,
                JdwpValue::Object {
                    tag: TAG_STRING,
                    id: code_id,
                },
                this,
                engine.undefined,
            ],
            0,
        )
        .await?;

    if exception != 0 {
        return Ok(EvalOutcome::Thrown(exception));
    }

    if let JdwpValue::Object { tag: TAG_STRING, id } = value {
        if id != 0 {
            let text = ctx.client.string_reference_value(id).await?;
            if text == nashorn::EVALUATED_CODE_MARKER {
                return Ok(EvalOutcome::Value(JdwpValue::Void));
            }
        }
    }

    Ok(EvalOutcome::Value(value))
}

/// Build a scope wrapper whose prototype is `proto`, shadowing `locals` with
/// change-tracking accessors. Returns the wrapper's object id.
pub async fn create_scope_wrapper(
    ctx: &mut MarshalCtx<'_>,
    engine: &EngineHandles,
    context_obj: ObjectId,
    proto: JdwpValue,
    locals: &[(String, JdwpValue)],
) -> HostResult<ObjectId> {
    let names: Vec<String> = locals.iter().map(|(name, _)| name.clone()).collect();
    let factory_src = wrapper_factory_source(&names);

    let factory_scope = if proto.object_id().is_some() {
        proto
    } else {
        engine.undefined
    };
    let factory = match evaluate(ctx, engine, context_obj, factory_scope, engine.undefined, &factory_src)
        .await?
    {
        EvalOutcome::Value(value) => value,
        EvalOutcome::Thrown(_) => {
            return Err(HostError::Evaluation(
                "scope wrapper factory threw in the target".to_string(),
            ))
        }
    };
    if factory.object_id().is_none() {
        return Err(HostError::Evaluation(
            "scope wrapper factory did not produce a function".to_string(),
        ));
    }

    let mut args = Vec::with_capacity(locals.len() + 3);
    args.push(factory);
    args.push(engine.undefined);
    args.push(proto);
    for (_, value) in locals {
        args.push(engine.box_primitive(ctx.client, ctx.thread, *value).await?);
    }

    let (wrapper, exception) = ctx
        .client
        .class_type_invoke_method(
            engine.script_runtime,
            ctx.thread,
            engine.apply_method,
            &args,
            0,
        )
        .await?;
    if exception != 0 {
        return Err(HostError::Evaluation(
            "scope wrapper construction threw in the target".to_string(),
        ));
    }
    wrapper.object_id().ok_or_else(|| {
        HostError::Evaluation("scope wrapper factory returned a non-object".to_string())
    })
}

/// Clear the wrapper's change log so only mutations from the next
/// evaluation are written back.
pub async fn reset_changes(
    ctx: &mut MarshalCtx<'_>,
    engine: &EngineHandles,
    wrapper: ObjectId,
) -> HostResult<()> {
    let reset_fn = script_object_get_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        wrapper,
        nashorn::RESET_CHANGES_PROPERTY,
    )
    .await?;
    if reset_fn.object_id().is_none() {
        return Ok(());
    }
    let (_, exception) = ctx
        .client
        .class_type_invoke_method(
            engine.script_runtime,
            ctx.thread,
            engine.apply_method,
            &[reset_fn, engine.undefined],
            0,
        )
        .await?;
    if exception != 0 {
        tracing::debug!(target = "tern.host", "resetChanges threw in the target");
    }
    Ok(())
}

/// Read the `[name, newValue]` pairs accumulated in the wrapper's hidden
/// change log.
pub async fn read_changes(
    ctx: &mut MarshalCtx<'_>,
    wrapper: ObjectId,
) -> HostResult<Vec<(String, JdwpValue)>> {
    let changes = script_object_get_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        wrapper,
        nashorn::CHANGES_PROPERTY,
    )
    .await?;
    let Some(changes_id) = changes.object_id() else {
        return Ok(Vec::new());
    };

    let length = match script_object_get_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        changes_id,
        "length",
    )
    .await?
    {
        JdwpValue::Int(len) => len.max(0),
        JdwpValue::Double(len) if len >= 0.0 => len as i32,
        _ => 0,
    };

    let mut out = Vec::with_capacity(length as usize);
    for idx in 0..length {
        let pair = script_object_get_index(ctx.client, ctx.methods, ctx.thread, changes_id, idx)
            .await?;
        let Some(pair_id) = pair.object_id() else {
            continue;
        };
        let name_value =
            script_object_get_index(ctx.client, ctx.methods, ctx.thread, pair_id, 0).await?;
        let Some(name) = string_value(ctx, name_value).await else {
            continue;
        };
        let new_value =
            script_object_get_index(ctx.client, ctx.methods, ctx.thread, pair_id, 1).await?;
        out.push((name, new_value));
    }
    Ok(out)
}

/// Resolve (and cache) the engine's `Context` instance:
/// `Context.getGlobal().getContext()`.
pub async fn resolve_context_instance(
    ctx: &mut MarshalCtx<'_>,
    engine: &EngineHandles,
) -> HostResult<ObjectId> {
    let (global, exception) = ctx
        .client
        .class_type_invoke_method(
            engine.context_class,
            ctx.thread,
            engine.get_global_method,
            &[],
            0,
        )
        .await?;
    if exception != 0 {
        return Err(HostError::EngineContract(
            "Context.getGlobal() threw".to_string(),
        ));
    }
    let Some(global_id) = global.object_id() else {
        return Err(HostError::EngineContract(
            "Context.getGlobal() returned null".to_string(),
        ));
    };

    let context = crate::invoke::invoke_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        global_id,
        "getContext",
        &[],
    )
    .await?
    .value()?;
    let context_id = context.object_id().ok_or_else(|| {
        HostError::EngineContract("getContext() returned null".to_string())
    })?;

    // Pin it: the instance is reused across pauses.
    let _ = ctx
        .client
        .object_reference_disable_collection(context_id)
        .await;
    Ok(context_id)
}

async fn string_value(ctx: &mut MarshalCtx<'_>, value: JdwpValue) -> Option<String> {
    match value {
        JdwpValue::Object { tag: TAG_STRING, id } if id != 0 => {
            ctx.client.string_reference_value(id).await.ok()
        }
        JdwpValue::Object { tag: TAG_OBJECT, id } if id != 0 => {
            // Allow plain objects that stringify (ConsString keys).
            match crate::invoke::invoke_named(ctx.client, ctx.methods, ctx.thread, id, "toString", &[])
                .await
            {
                Ok(crate::invoke::InvokeOutcome::Value(JdwpValue::Object {
                    tag: TAG_STRING,
                    id,
                })) if id != 0 => ctx.client.string_reference_value(id).await.ok(),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_a_32_digit_hex_token() {
        assert_eq!(nashorn::EVALUATED_CODE_MARKER.len(), 32);
        assert!(nashorn::EVALUATED_CODE_MARKER
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn factory_source_defines_accessors_and_hidden_shadows() {
        let src = wrapper_factory_source(&["x".to_string(), "y".to_string()]);
        assert!(src.starts_with("(function(__scope__, __v0__, __v1__)"));
        assert!(src.contains("\"||x\""));
        assert!(src.contains("\"||y\""));
        assert!(src.contains("\"||changes\""));
        assert!(src.contains("\"||resetChanges\""));
        assert!(src.contains("changes.push([\"x\", v])"));
        assert!(src.ends_with("return sc;\n})"));
    }

    #[test]
    fn factory_source_escapes_awkward_names() {
        let src = wrapper_factory_source(&["weird \"name\"".to_string()]);
        assert!(src.contains("\"weird \\\"name\\\"\""));
    }

    #[test]
    fn extractor_source_skips_hidden_names() {
        assert!(PROPERTY_EXTRACTOR_SOURCE.contains("indexOf('||')"));
        assert!(PROPERTY_EXTRACTOR_SOURCE.contains("Java.to"));
    }
}
