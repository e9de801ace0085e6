//! The Nashorn engine contract.
//!
//! The host depends on private structure of the target engine: script class
//! naming, the reflective `source -> data -> array` path used to recover
//! evaluated source, the `ScriptRuntime.DEBUGGER` trap, `ScriptRuntime.apply`
//! and `Context.getGlobal()/getContext()/eval(...)` entry points, and the
//! boxed-primitive `valueOf` factories. Everything is named here and resolved
//! once against the attached VM; a missing piece is a hard
//! [`HostError::EngineContract`] so an engine upgrade fails loudly instead of
//! silently regressing.

use std::collections::HashMap;

use tern_jdwp::{
    types::{TAG_BOOLEAN, TAG_BYTE, TAG_CHAR, TAG_DOUBLE, TAG_FLOAT, TAG_INT, TAG_LONG, TAG_SHORT},
    JdwpClient, JdwpValue, Location, MethodId, ReferenceTypeId,
};

use crate::error::{HostError, HostResult};
use crate::invoke::MethodResolver;

/// Prefix of every class Nashorn compiles from script source.
pub const SCRIPT_CLASS_PREFIX: &str = "jdk.nashorn.internal.scripts.Script$";

/// JDWP class-match pattern covering all script classes.
pub const SCRIPT_CLASS_MATCH: &str = "jdk.nashorn.internal.scripts.*";

pub const SCRIPT_RUNTIME_CLASS: &str = "jdk.nashorn.internal.runtime.ScriptRuntime";
pub const CONTEXT_CLASS: &str = "jdk.nashorn.internal.runtime.Context";
pub const ECMA_EXCEPTION_CLASS: &str = "jdk.nashorn.internal.runtime.ECMAException";
pub const UNDEFINED_CLASS: &str = "jdk.nashorn.internal.runtime.Undefined";
pub const SCRIPT_OBJECT_PACKAGE: &str = "jdk.nashorn.internal.";
pub const MIRROR_CLASS: &str = "jdk.nashorn.api.scripting.ScriptObjectMirror";
pub const JS_OBJECT_INTERFACE: &str = "jdk.nashorn.api.scripting.JSObject";

/// Reflective field path on a script class used to recover its source.
pub const SOURCE_FIELD: &str = "source";
pub const SOURCE_DATA_FIELD: &str = "data";
pub const SOURCE_ARRAY_FIELD: &str = "array";

/// Name of the source file JDWP reports for dynamically evaluated scripts.
pub const EVAL_SOURCE_NAME: &str = "<eval>";

/// Names are hidden from user-visible property listings when they start with
/// this prefix; the scope wrapper stores its machinery under it.
pub const HIDDEN_PREFIX: &str = "||";
pub const CHANGES_PROPERTY: &str = "||changes";
pub const RESET_CHANGES_PROPERTY: &str = "||resetChanges";

/// Opaque token prepended to every piece of code this host evaluates in the
/// target. Scripts containing it are our own artifacts reappearing at
/// reconnection and are never registered.
pub const EVALUATED_CODE_MARKER: &str = "5a7d62b9c3fe4e24a2d0f1c58b9e6a37";

const BOXED_CLASSES: [(&str, u8); 8] = [
    ("java.lang.Boolean", TAG_BOOLEAN),
    ("java.lang.Byte", TAG_BYTE),
    ("java.lang.Character", TAG_CHAR),
    ("java.lang.Short", TAG_SHORT),
    ("java.lang.Integer", TAG_INT),
    ("java.lang.Long", TAG_LONG),
    ("java.lang.Float", TAG_FLOAT),
    ("java.lang.Double", TAG_DOUBLE),
];

/// Whether `name` is one of the infrastructure classes cached for later
/// method invocation instead of being treated as a script class.
pub fn is_wanted_infrastructure_class(name: &str) -> bool {
    name == SCRIPT_RUNTIME_CLASS
        || name == CONTEXT_CLASS
        || name == ECMA_EXCEPTION_CLASS
        || name == UNDEFINED_CLASS
        || BOXED_CLASSES.iter().any(|(boxed, _)| *boxed == name)
}

pub fn is_script_class(name: &str) -> bool {
    name.starts_with(SCRIPT_CLASS_PREFIX)
}

/// Synthesize an `eval:/...` path for a script class compiled from
/// dynamically evaluated code: engine package stripped, the mangling
/// characters `$`, `^` and `_` removed, `.` mapped to `/`, and a trailing
/// `/eval` segment dropped.
pub fn eval_script_path(class_name: &str) -> String {
    let stripped = class_name
        .strip_prefix(SCRIPT_CLASS_PREFIX)
        .unwrap_or(class_name);
    let cleaned: String = stripped
        .chars()
        .filter(|c| !matches!(c, '$' | '^' | '_'))
        .map(|c| if c == '.' { '/' } else { c })
        .collect();
    let cleaned = cleaned.strip_suffix("/eval").unwrap_or(&cleaned);
    format!("eval:/{cleaned}")
}

/// Turn a JNI-style signature into a dotted class name. Array signatures
/// recurse on their element type and pick up a `[]` suffix per dimension;
/// primitives map to their Java keywords.
pub fn signature_to_type_name(signature: &str) -> String {
    match signature.split_at_checked(1) {
        Some(("[", element)) => signature_to_type_name(element) + "[]",
        Some(("L", class)) => class
            .strip_suffix(';')
            .unwrap_or(class)
            .replace('/', "."),
        Some(("B", _)) => "byte".to_string(),
        Some(("C", _)) => "char".to_string(),
        Some(("D", _)) => "double".to_string(),
        Some(("F", _)) => "float".to_string(),
        Some(("I", _)) => "int".to_string(),
        Some(("J", _)) => "long".to_string(),
        Some(("S", _)) => "short".to_string(),
        Some(("Z", _)) => "boolean".to_string(),
        Some(("V", _)) => "void".to_string(),
        _ => format!("<unresolved signature {signature}>"),
    }
}

/// The scope kinds a frame's scope chain distinguishes, classified by the VM
/// type of the scope object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Local,
    Closure,
    With,
    Global,
}

pub fn scope_kind_for_class(class_name: &str) -> ScopeKind {
    if class_name.ends_with(".Global") {
        ScopeKind::Global
    } else if class_name.ends_with("WithObject") {
        ScopeKind::With
    } else {
        ScopeKind::Closure
    }
}

/// Infrastructure classes observed during registration, by dotted name.
#[derive(Debug, Default)]
pub struct InfraClasses {
    by_name: HashMap<String, ReferenceTypeId>,
}

impl InfraClasses {
    pub fn insert(&mut self, name: String, type_id: ReferenceTypeId) {
        self.by_name.insert(name, type_id);
    }

    pub fn get(&self, name: &str) -> Option<ReferenceTypeId> {
        self.by_name.get(name).copied()
    }

    fn require(&self, name: &str) -> HostResult<ReferenceTypeId> {
        self.get(name)
            .ok_or_else(|| HostError::EngineContract(format!("class {name} not seen in target VM")))
    }
}

/// The resolved engine entry points. Built once after initialization.
#[derive(Debug, Clone)]
pub struct EngineHandles {
    pub script_runtime: ReferenceTypeId,
    /// `ScriptRuntime.apply(fn, thisArg, args...)` — our route for calling a
    /// script function from outside.
    pub apply_method: MethodId,
    /// `ScriptRuntime.DEBUGGER` — the JavaScript `debugger` statement lands
    /// here; a fixed breakpoint realizes it.
    pub debugger_location: Location,
    /// The `ScriptRuntime.UNDEFINED` sentinel instance.
    pub undefined: JdwpValue,
    pub context_class: ReferenceTypeId,
    /// Static `Context.getGlobal()`.
    pub get_global_method: MethodId,
    /// Instance `Context.eval(scope, code, this, location)`.
    pub eval_method: MethodId,
    pub ecma_exception_class: Option<ReferenceTypeId>,
    /// Boxed-primitive `valueOf` factories keyed by primitive value tag.
    boxers: HashMap<u8, (ReferenceTypeId, MethodId)>,
}

impl EngineHandles {
    pub async fn resolve(
        client: &JdwpClient,
        infra: &InfraClasses,
        methods: &mut MethodResolver,
    ) -> HostResult<Self> {
        let script_runtime = infra.require(SCRIPT_RUNTIME_CLASS)?;
        let apply_method = require_method(client, methods, script_runtime, "apply").await?;
        let debugger_method = require_method(client, methods, script_runtime, "DEBUGGER").await?;
        let undefined = resolve_undefined(client, script_runtime).await?;

        let context_class = infra.require(CONTEXT_CLASS)?;
        let get_global_method = require_method(client, methods, context_class, "getGlobal").await?;
        let eval_method = require_method(client, methods, context_class, "eval").await?;

        let mut boxers = HashMap::new();
        for (class_name, tag) in BOXED_CLASSES {
            if let Some(class_id) = infra.get(class_name) {
                if let Some((_, method_id)) = methods.find(client, class_id, "valueOf").await? {
                    boxers.insert(tag, (class_id, method_id));
                }
            }
        }

        Ok(Self {
            script_runtime,
            apply_method,
            debugger_location: Location {
                type_tag: 1,
                class_id: script_runtime,
                method_id: debugger_method,
                index: 0,
            },
            undefined,
            context_class,
            get_global_method,
            eval_method,
            ecma_exception_class: infra.get(ECMA_EXCEPTION_CLASS),
            boxers,
        })
    }

    /// Box a primitive through the engine's `valueOf` factories so it can be
    /// passed where the script side expects an object.
    pub async fn box_primitive(
        &self,
        client: &JdwpClient,
        thread: tern_jdwp::ThreadId,
        value: JdwpValue,
    ) -> HostResult<JdwpValue> {
        match value {
            JdwpValue::Object { .. } | JdwpValue::Void => Ok(value),
            primitive => {
                let Some((class_id, method_id)) = self.boxers.get(&primitive.tag()).copied() else {
                    return Err(HostError::EngineContract(format!(
                        "no valueOf factory for primitive tag {:?}",
                        primitive.tag() as char
                    )));
                };
                let (boxed, exception) = client
                    .class_type_invoke_method(class_id, thread, method_id, &[primitive], 0)
                    .await?;
                if exception != 0 {
                    return Err(HostError::Evaluation(
                        "boxing a primitive threw in the target".to_string(),
                    ));
                }
                Ok(boxed)
            }
        }
    }
}

async fn require_method(
    client: &JdwpClient,
    methods: &mut MethodResolver,
    class_id: ReferenceTypeId,
    name: &str,
) -> HostResult<MethodId> {
    match methods.find(client, class_id, name).await? {
        Some((_, method_id)) => Ok(method_id),
        None => Err(HostError::EngineContract(format!(
            "method {name} not found on engine class {class_id:#x}"
        ))),
    }
}

async fn resolve_undefined(
    client: &JdwpClient,
    script_runtime: ReferenceTypeId,
) -> HostResult<JdwpValue> {
    let fields = client.reference_type_fields(script_runtime).await?;
    let undefined_field = fields
        .iter()
        .find(|f| f.name == "UNDEFINED")
        .ok_or_else(|| {
            HostError::EngineContract("ScriptRuntime.UNDEFINED field not found".to_string())
        })?;
    let values = client
        .reference_type_get_values(script_runtime, &[undefined_field.field_id])
        .await?;
    values
        .into_iter()
        .next()
        .filter(|v| !v.is_null())
        .ok_or_else(|| HostError::EngineContract("ScriptRuntime.UNDEFINED is null".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_classes_are_recognized() {
        assert!(is_wanted_infrastructure_class(SCRIPT_RUNTIME_CLASS));
        assert!(is_wanted_infrastructure_class(CONTEXT_CLASS));
        assert!(is_wanted_infrastructure_class("java.lang.Integer"));
        assert!(!is_wanted_infrastructure_class("java.lang.String"));
        assert!(!is_wanted_infrastructure_class(
            "jdk.nashorn.internal.scripts.Script$app"
        ));
    }

    #[test]
    fn eval_paths_are_derived_from_mangled_class_names() {
        assert_eq!(
            eval_script_path("jdk.nashorn.internal.scripts.Script$tools.repl"),
            "eval:/tools/repl"
        );
        assert_eq!(
            eval_script_path("jdk.nashorn.internal.scripts.Script$Recompilation$2$app"),
            "eval:/Recompilation2app"
        );
        assert_eq!(
            eval_script_path("jdk.nashorn.internal.scripts.Script$boot.eval"),
            "eval:/boot"
        );
    }

    #[test]
    fn scope_kinds_follow_class_suffix() {
        assert_eq!(
            scope_kind_for_class("jdk.nashorn.internal.objects.Global"),
            ScopeKind::Global
        );
        assert_eq!(
            scope_kind_for_class("jdk.nashorn.internal.runtime.WithObject"),
            ScopeKind::With
        );
        assert_eq!(
            scope_kind_for_class("jdk.nashorn.internal.scripts.JO4"),
            ScopeKind::Closure
        );
    }

    #[test]
    fn signatures_map_to_type_names() {
        assert_eq!(
            signature_to_type_name("Ljava/lang/String;"),
            "java.lang.String"
        );
        assert_eq!(signature_to_type_name("[I"), "int[]");
        assert_eq!(signature_to_type_name("[[Ljava/lang/Object;"), "java.lang.Object[][]");
        assert_eq!(signature_to_type_name("Z"), "boolean");
    }
}
