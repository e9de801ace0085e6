//! Marshalling raw VM values into the outward value model.
//!
//! Dispatch is by runtime class name. Complex values are registered in the
//! per-pause object registry so the outside can come back and ask for their
//! properties; cyclic graphs are therefore never recursed into here — a
//! node's children stay behind its object id.

use tern_jdwp::{
    types::{TAG_ARRAY, TAG_STRING},
    JdwpClient, JdwpValue, ObjectId, ThreadId,
};

use crate::error::HostResult;
use crate::invoke::{invoke_named, InvokeOutcome, MethodResolver, TypeNameCache};
use crate::nashorn;
use crate::objects::{ObjectEntry, ObjectRegistry};
use crate::values::{ErrorValue, RemoteObjectId, SimpleValue, ValueNode};

pub struct MarshalCtx<'a> {
    pub client: &'a JdwpClient,
    pub thread: ThreadId,
    pub registry: &'a mut ObjectRegistry,
    pub methods: &'a mut MethodResolver,
    pub names: &'a mut TypeNameCache,
}

impl<'a> MarshalCtx<'a> {
    fn register(&mut self, raw: JdwpValue, node: ValueNode) -> RemoteObjectId {
        let id = self.registry.allocate_id();
        self.registry.insert(
            id.clone(),
            ObjectEntry {
                raw: Some(raw),
                node,
                extras: Default::default(),
            },
        );
        id
    }
}

pub async fn marshal(ctx: &mut MarshalCtx<'_>, raw: JdwpValue) -> HostResult<ValueNode> {
    Ok(match raw {
        JdwpValue::Void => ValueNode::UNDEFINED,
        JdwpValue::Boolean(v) => ValueNode::Simple(SimpleValue::Bool(v)),
        JdwpValue::Byte(v) => ValueNode::Simple(SimpleValue::Number(v.into())),
        JdwpValue::Short(v) => ValueNode::Simple(SimpleValue::Number(v.into())),
        JdwpValue::Int(v) => ValueNode::Simple(SimpleValue::Number(v.into())),
        JdwpValue::Long(v) => ValueNode::Simple(SimpleValue::Number(v as f64)),
        JdwpValue::Float(v) => ValueNode::Simple(SimpleValue::Number(v.into())),
        JdwpValue::Double(v) => ValueNode::Simple(SimpleValue::Number(v)),
        JdwpValue::Char(v) => ValueNode::Simple(SimpleValue::Str(
            char::from_u32(v.into()).unwrap_or('\u{FFFD}').to_string(),
        )),
        JdwpValue::Object { id: 0, .. } => ValueNode::NULL,
        JdwpValue::Object { tag: TAG_STRING, id } => {
            ValueNode::Simple(SimpleValue::Str(ctx.client.string_reference_value(id).await?))
        }
        JdwpValue::Object { tag: TAG_ARRAY, id } => {
            let length = ctx.client.array_reference_length(id).await?.max(0) as usize;
            let object_id = ctx.registry.allocate_id();
            let node = ValueNode::Array {
                length,
                id: object_id.clone(),
            };
            ctx.registry.insert(
                object_id,
                ObjectEntry {
                    raw: Some(raw),
                    node: node.clone(),
                    extras: Default::default(),
                },
            );
            node
        }
        JdwpValue::Object { id, .. } => marshal_object(ctx, raw, id).await?,
    })
}

async fn marshal_object(
    ctx: &mut MarshalCtx<'_>,
    raw: JdwpValue,
    id: ObjectId,
) -> HostResult<ValueNode> {
    let class_name = ctx.names.name_of_object(ctx.client, id).await?;

    if class_name == nashorn::UNDEFINED_CLASS {
        return Ok(ValueNode::UNDEFINED);
    }

    if class_name.ends_with(".ConsString") {
        // Flatten lazily-concatenated engine strings.
        if let Some(value) = to_string_value(ctx, id).await {
            return Ok(ValueNode::Simple(SimpleValue::Str(value)));
        }
    }

    if let Some(primitive) = unbox_primitive(ctx, &class_name, id).await? {
        return Box::pin(marshal(ctx, primitive)).await;
    }

    let node = if class_name == "jdk.nashorn.internal.objects.NativeDate" {
        let string_value = to_string_value(ctx, id).await.unwrap_or_default();
        let object_id = ctx.registry.allocate_id();
        ValueNode::Date {
            string_value,
            id: object_id,
        }
    } else if class_name == "jdk.nashorn.internal.objects.NativeRegExp" {
        let string_value = to_string_value(ctx, id).await.unwrap_or_default();
        let object_id = ctx.registry.allocate_id();
        ValueNode::RegExp {
            string_value,
            id: object_id,
        }
    } else if class_name == "jdk.nashorn.internal.objects.NativeArray" {
        let length = script_array_length(ctx, id).await.unwrap_or(0);
        let object_id = ctx.registry.allocate_id();
        ValueNode::Array {
            length,
            id: object_id,
        }
    } else if is_script_function_class(&class_name) {
        let name = property_string(ctx, id, "name").await.unwrap_or_default();
        let source = to_string_value(ctx, id).await;
        let object_id = ctx.registry.allocate_id();
        ValueNode::Function {
            name,
            source,
            id: object_id,
        }
    } else if class_name == nashorn::ECMA_EXCEPTION_CLASS {
        return marshal_thrown(ctx, id).await;
    } else if is_native_error_class(&class_name) {
        let data = script_error_value(ctx, id).await;
        let object_id = ctx.registry.allocate_id();
        ValueNode::Error {
            data,
            id: object_id,
        }
    } else if class_name.starts_with(nashorn::SCRIPT_OBJECT_PACKAGE) {
        let object_id = ctx.registry.allocate_id();
        ValueNode::Object {
            class_name: "Object".to_string(),
            id: object_id,
        }
    } else {
        let object_id = ctx.registry.allocate_id();
        ValueNode::Object {
            class_name,
            id: object_id,
        }
    };

    // The id was allocated above; bind the raw value to it.
    if let Some(object_id) = node.object_id().cloned() {
        ctx.registry.insert(
            object_id,
            ObjectEntry {
                raw: Some(raw),
                node: node.clone(),
                extras: Default::default(),
            },
        );
    }
    Ok(node)
}

/// Marshal the value thrown by an in-target invocation (the pseudo-value for
/// a throw completion). For the engine's ECMA wrapper the underlying thrown
/// value is surfaced, not the wrapper.
pub async fn marshal_thrown(ctx: &mut MarshalCtx<'_>, exception: ObjectId) -> HostResult<ValueNode> {
    let class_name = ctx
        .names
        .name_of_object(ctx.client, exception)
        .await
        .unwrap_or_default();

    if class_name == nashorn::ECMA_EXCEPTION_CLASS {
        if let Some(thrown) = read_instance_field(ctx, exception, "thrown").await? {
            if !thrown.is_null() {
                let node = Box::pin(marshal(ctx, thrown)).await?;
                return Ok(match node {
                    // A thrown primitive (`throw "oops"`) still surfaces as
                    // an error to the caller, not as a plain value.
                    ValueNode::Simple(simple) => {
                        let message = match simple {
                            SimpleValue::Str(s) => s,
                            SimpleValue::Number(n) => n.to_string(),
                            SimpleValue::Bool(b) => b.to_string(),
                            SimpleValue::Null => "null".to_string(),
                            SimpleValue::Undefined => "undefined".to_string(),
                        };
                        let object_id = ctx.registry.allocate_id();
                        ValueNode::Error {
                            data: ErrorValue {
                                name: "Error".to_string(),
                                message,
                                stack: None,
                            },
                            id: object_id,
                        }
                    }
                    other => other,
                });
            }
        }
    }

    let message = match invoke_named(
        ctx.client,
        ctx.methods,
        ctx.thread,
        exception,
        "getMessage",
        &[],
    )
    .await
    {
        Ok(InvokeOutcome::Value(value)) => value_to_string(ctx, value).await.unwrap_or_default(),
        _ => String::new(),
    };

    let simple_name = class_name.rsplit('.').next().unwrap_or("Error").to_string();
    let object_id = ctx.registry.allocate_id();
    let node = ValueNode::Error {
        data: ErrorValue {
            name: simple_name,
            message,
            stack: None,
        },
        id: object_id.clone(),
    };
    ctx.registry.insert(
        object_id,
        ObjectEntry {
            raw: Some(JdwpValue::Object {
                tag: tern_jdwp::types::TAG_OBJECT,
                id: exception,
            }),
            node: node.clone(),
            extras: Default::default(),
        },
    );
    Ok(node)
}

fn is_script_function_class(class_name: &str) -> bool {
    class_name.starts_with("jdk.nashorn.internal.runtime.ScriptFunction")
        || class_name.starts_with("jdk.nashorn.internal.objects.ScriptFunction")
}

fn is_native_error_class(class_name: &str) -> bool {
    class_name.starts_with("jdk.nashorn.internal.objects.Native") && class_name.ends_with("Error")
}

async fn unbox_primitive(
    ctx: &mut MarshalCtx<'_>,
    class_name: &str,
    id: ObjectId,
) -> HostResult<Option<JdwpValue>> {
    let boxed = matches!(
        class_name,
        "java.lang.Boolean"
            | "java.lang.Byte"
            | "java.lang.Character"
            | "java.lang.Short"
            | "java.lang.Integer"
            | "java.lang.Long"
            | "java.lang.Float"
            | "java.lang.Double"
    );
    if !boxed {
        return Ok(None);
    }
    read_instance_field(ctx, id, "value").await
}

async fn read_instance_field(
    ctx: &mut MarshalCtx<'_>,
    id: ObjectId,
    field_name: &str,
) -> HostResult<Option<JdwpValue>> {
    let class_id = ctx.client.object_reference_reference_type(id).await?;
    let fields = ctx.client.reference_type_fields(class_id).await?;
    let Some(field) = fields.iter().find(|f| f.name == field_name) else {
        return Ok(None);
    };
    let values = ctx
        .client
        .object_reference_get_values(id, &[field.field_id])
        .await?;
    Ok(values.into_iter().next())
}

/// Best-effort `toString()` on a target object. `None` when the invocation
/// fails or yields something that is not a string.
async fn to_string_value(ctx: &mut MarshalCtx<'_>, id: ObjectId) -> Option<String> {
    match invoke_named(ctx.client, ctx.methods, ctx.thread, id, "toString", &[]).await {
        Ok(InvokeOutcome::Value(value)) => value_to_string(ctx, value).await,
        _ => None,
    }
}

async fn value_to_string(ctx: &mut MarshalCtx<'_>, value: JdwpValue) -> Option<String> {
    match value {
        JdwpValue::Object { tag: TAG_STRING, id } if id != 0 => {
            ctx.client.string_reference_value(id).await.ok()
        }
        _ => None,
    }
}

async fn property_string(ctx: &mut MarshalCtx<'_>, id: ObjectId, name: &str) -> Option<String> {
    let value =
        crate::invoke::script_object_get_named(ctx.client, ctx.methods, ctx.thread, id, name)
            .await
            .ok()?;
    value_to_string(ctx, value).await
}

async fn script_array_length(ctx: &mut MarshalCtx<'_>, id: ObjectId) -> Option<usize> {
    let value =
        crate::invoke::script_object_get_named(ctx.client, ctx.methods, ctx.thread, id, "length")
            .await
            .ok()?;
    match value {
        JdwpValue::Int(v) => Some(v.max(0) as usize),
        JdwpValue::Long(v) => Some(v.max(0) as usize),
        JdwpValue::Double(v) if v >= 0.0 => Some(v as usize),
        _ => None,
    }
}

/// Build an error descriptor from a script error object (`message`/`name`
/// properties read through the script-object entry point).
async fn script_error_value(ctx: &mut MarshalCtx<'_>, id: ObjectId) -> ErrorValue {
    let name = property_string(ctx, id, "name")
        .await
        .unwrap_or_else(|| "Error".to_string());
    let message = property_string(ctx, id, "message").await.unwrap_or_default();
    let stack = property_string(ctx, id, "stack").await;
    ErrorValue {
        name,
        message,
        stack,
    }
}
