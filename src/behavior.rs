//! Behavior processor (§4.2): deterministic per-send transforms applied to
//! fields after mutation, never before.

use std::collections::HashMap;

use crate::model::DataModel;
use crate::parser::{apply_behavior, FieldMap, FieldValue};

/// Per-session counter state for `increment` behaviors, keyed by field name.
/// `seeded` tracks whether a field's counter has already consumed its
/// `initial` value, so a counter wrapping back through zero isn't reseeded.
#[derive(Debug, Default, Clone)]
pub struct BehaviorState {
    counters: HashMap<String, i64>,
    seeded: HashMap<String, bool>,
}

impl BehaviorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every block's `behavior`, if any, to `fields`. Must be called
    /// after the mutator has already run for this send.
    pub fn apply(&mut self, model: &DataModel, fields: &mut FieldMap) {
        for block in &model.blocks {
            let Some(behavior) = &block.behavior else {
                continue;
            };
            let width_bytes = block.kind.fixed_width_bytes().unwrap_or(8);
            let current = fields.get(&block.name).and_then(FieldValue::as_int).unwrap_or(0);
            let counter = self.counters.entry(block.name.clone()).or_insert(0);
            let seeded = self.seeded.entry(block.name.clone()).or_insert(false);
            let next = apply_behavior(behavior, width_bytes, current, counter, seeded);
            fields.insert(block.name.clone(), FieldValue::Int(next));
        }
    }
}
