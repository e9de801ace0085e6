//! The per-pause object registry.
//!
//! Every complex value surfaced to the outside gets a [`RemoteObjectId`]
//! here, paired with the raw VM value it stands for. The registry is cleared
//! on every pause entry and on resume, which is what makes ids from an old
//! pause mechanically invalid: lookups simply miss.

use std::collections::HashMap;

use tern_jdwp::JdwpValue;

use crate::values::{RemoteObjectId, ValueNode};

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub raw: Option<JdwpValue>,
    pub node: ValueNode,
    /// Extra named entries attached to a synthesized object (e.g. the local
    /// names behind a `$$locals-*` scope object).
    pub extras: HashMap<String, ValueNode>,
}

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    next: u64,
    by_id: HashMap<RemoteObjectId, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> RemoteObjectId {
        self.next += 1;
        RemoteObjectId::new(format!("objid-{}", self.next))
    }

    pub fn insert(&mut self, id: RemoteObjectId, entry: ObjectEntry) {
        self.by_id.insert(id, entry);
    }

    pub fn get(&self, id: &RemoteObjectId) -> Option<&ObjectEntry> {
        self.by_id.get(id)
    }

    pub fn raw(&self, id: &RemoteObjectId) -> Option<JdwpValue> {
        self.by_id.get(id).and_then(|entry| entry.raw)
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        // Ids keep counting up across pauses so a stale id from pause P can
        // never collide with a fresh id from pause P+1.
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::SimpleValue;

    #[test]
    fn cleared_registry_forgets_ids_but_not_the_counter() {
        let mut registry = ObjectRegistry::new();
        let first = registry.allocate_id();
        registry.insert(
            first.clone(),
            ObjectEntry {
                raw: Some(JdwpValue::Int(1)),
                node: ValueNode::Simple(SimpleValue::Number(1.0)),
                extras: HashMap::new(),
            },
        );
        assert!(registry.get(&first).is_some());

        registry.clear();
        assert!(registry.get(&first).is_none());

        let second = registry.allocate_id();
        assert_ne!(first, second);
    }
}
