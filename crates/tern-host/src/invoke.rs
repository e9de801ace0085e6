//! Method resolution and invocation helpers.
//!
//! Everything here runs against a thread suspended by an event. Invoking a
//! method temporarily resumes that thread, so callers must follow the
//! snapshot discipline documented in the pause engine: no invocations
//! between the frame snapshot and the point where `PausedData` is stored.

use std::collections::HashMap;
use std::sync::Arc;

use tern_jdwp::{JdwpClient, JdwpValue, MethodId, MethodInfo, ObjectId, ReferenceTypeId, ThreadId};

use crate::error::{HostError, HostResult};

/// How many superclass links to follow when resolving a method by name.
const SUPERCLASS_WALK_LIMIT: usize = 8;

/// Per-class method lists and superclass links, cached for the lifetime of
/// the attach (class structure never changes under us).
#[derive(Default)]
pub struct MethodResolver {
    methods: HashMap<ReferenceTypeId, Arc<Vec<MethodInfo>>>,
    superclasses: HashMap<ReferenceTypeId, Option<ReferenceTypeId>>,
}

impl MethodResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn methods_of(
        &mut self,
        client: &JdwpClient,
        class_id: ReferenceTypeId,
    ) -> HostResult<Arc<Vec<MethodInfo>>> {
        if let Some(methods) = self.methods.get(&class_id) {
            return Ok(methods.clone());
        }
        let methods = Arc::new(client.reference_type_methods(class_id).await?);
        self.methods.insert(class_id, methods.clone());
        Ok(methods)
    }

    async fn superclass_of(
        &mut self,
        client: &JdwpClient,
        class_id: ReferenceTypeId,
    ) -> HostResult<Option<ReferenceTypeId>> {
        if let Some(superclass) = self.superclasses.get(&class_id) {
            return Ok(*superclass);
        }
        let superclass = client.class_type_superclass(class_id).await.unwrap_or(None);
        self.superclasses.insert(class_id, superclass);
        Ok(superclass)
    }

    /// Find `name` on `class_id` or one of its superclasses. Returns the
    /// declaring class and the method id.
    pub async fn find(
        &mut self,
        client: &JdwpClient,
        class_id: ReferenceTypeId,
        name: &str,
    ) -> HostResult<Option<(ReferenceTypeId, MethodId)>> {
        let mut current = class_id;
        for _ in 0..SUPERCLASS_WALK_LIMIT {
            let methods = self.methods_of(client, current).await?;
            if let Some(method) = methods.iter().find(|m| m.name == name) {
                return Ok(Some((current, method.method_id)));
            }
            match self.superclass_of(client, current).await? {
                Some(superclass) => current = superclass,
                None => break,
            }
        }
        Ok(None)
    }
}

/// Class-name lookups by reference type, cached per attach.
#[derive(Default)]
pub struct TypeNameCache {
    names: HashMap<ReferenceTypeId, String>,
}

impl TypeNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn name_of(
        &mut self,
        client: &JdwpClient,
        class_id: ReferenceTypeId,
    ) -> HostResult<String> {
        if let Some(name) = self.names.get(&class_id) {
            return Ok(name.clone());
        }
        let signature = client.reference_type_signature(class_id).await?;
        let name = crate::nashorn::signature_to_type_name(&signature);
        self.names.insert(class_id, name.clone());
        Ok(name)
    }

    pub async fn name_of_object(
        &mut self,
        client: &JdwpClient,
        object_id: ObjectId,
    ) -> HostResult<String> {
        let class_id = client.object_reference_reference_type(object_id).await?;
        self.name_of(client, class_id).await
    }
}

/// The outcome of an in-target invocation: either a value or the exception
/// object the invocation threw.
#[derive(Debug, Clone, Copy)]
pub enum InvokeOutcome {
    Value(JdwpValue),
    Thrown(ObjectId),
}

impl InvokeOutcome {
    pub fn value(self) -> HostResult<JdwpValue> {
        match self {
            InvokeOutcome::Value(value) => Ok(value),
            InvokeOutcome::Thrown(_) => Err(HostError::Evaluation(
                "in-target invocation threw an exception".to_string(),
            )),
        }
    }
}

/// Invoke a named instance method on `object_id`, resolving it against the
/// object's runtime class (superclasses included).
pub async fn invoke_named(
    client: &JdwpClient,
    methods: &mut MethodResolver,
    thread: ThreadId,
    object_id: ObjectId,
    name: &str,
    args: &[JdwpValue],
) -> HostResult<InvokeOutcome> {
    let class_id = client.object_reference_reference_type(object_id).await?;
    let Some((declaring, method_id)) = methods.find(client, class_id, name).await? else {
        return Err(HostError::EngineContract(format!(
            "method {name} not found on runtime class of object {object_id:#x}"
        )));
    };
    let (value, exception) = client
        .object_reference_invoke_method(object_id, thread, declaring, method_id, args, 0)
        .await?;
    Ok(if exception != 0 {
        InvokeOutcome::Thrown(exception)
    } else {
        InvokeOutcome::Value(value)
    })
}

/// Read a property of a script object through its `get(Object)` entry point.
/// `key` must already be a target-VM value (an interned string or an int).
pub async fn script_object_get(
    client: &JdwpClient,
    methods: &mut MethodResolver,
    thread: ThreadId,
    object_id: ObjectId,
    key: JdwpValue,
) -> HostResult<JdwpValue> {
    invoke_named(client, methods, thread, object_id, "get", &[key])
        .await?
        .value()
}

/// Read a named property, interning the key string first.
pub async fn script_object_get_named(
    client: &JdwpClient,
    methods: &mut MethodResolver,
    thread: ThreadId,
    object_id: ObjectId,
    key: &str,
) -> HostResult<JdwpValue> {
    let key_id = client.create_string(key).await?;
    script_object_get(
        client,
        methods,
        thread,
        object_id,
        JdwpValue::Object {
            tag: tern_jdwp::types::TAG_STRING,
            id: key_id,
        },
    )
    .await
}

/// Read an indexed property through the `get(int)` overload.
pub async fn script_object_get_index(
    client: &JdwpClient,
    methods: &mut MethodResolver,
    thread: ThreadId,
    object_id: ObjectId,
    index: i32,
) -> HostResult<JdwpValue> {
    script_object_get(client, methods, thread, object_id, JdwpValue::Int(index)).await
}
