//! Hybrid mutation engine (§4.5): on each call, dispatches either to the
//! structure-aware mutator or to a byte-level strategy applied to the
//! re-serialized message, re-parsing afterward so downstream stages still
//! see a field map.

use rand::Rng;

use crate::error::PluginError;
use crate::model::{DataModel, MutationMode};
use crate::parser::{self, FieldMap};

use super::byte::{self, ByteMutator};
use super::structure;

const STRATEGIES: [ByteMutator; 6] = [
    ByteMutator::BitFlip,
    ByteMutator::ByteFlip,
    ByteMutator::Arithmetic,
    ByteMutator::InterestingValue,
    ByteMutator::Havoc,
    ByteMutator::Splice,
];

pub struct MutationEngine {
    seeds: Vec<Vec<u8>>,
    mode: MutationMode,
    structure_aware_weight: u8,
}

impl MutationEngine {
    /// `seeds` is the session's corpus. Errors eagerly if fewer than two
    /// seeds are available, since `splice` is always one of the candidate
    /// byte-level strategies and needs a second buffer to draw from.
    /// `structure_aware_weight` is clamped to 0-100 and only consulted in
    /// `hybrid` mode.
    pub fn new(
        seeds: Vec<Vec<u8>>,
        mode: MutationMode,
        structure_aware_weight: u8,
    ) -> Result<Self, PluginError> {
        if seeds.len() < 2 {
            return Err(PluginError::InsufficientSeedsForSplice(seeds.len()));
        }
        Ok(Self {
            seeds,
            mode,
            structure_aware_weight: structure_aware_weight.min(100),
        })
    }

    pub fn seeds(&self) -> &[Vec<u8>] {
        &self.seeds
    }

    /// Produce a mutated field map from `fields`, plus the name of the field
    /// the structure-aware path mutated, when it ran and produced the
    /// result (`None` for a byte-level result, for coverage accounting).
    /// Falls back to structure-aware mutation if a byte-level pass breaks
    /// the model's parse invariants (e.g. a size field pointing past the
    /// buffer).
    pub fn mutate(
        &self,
        rng: &mut impl Rng,
        model: &DataModel,
        fields: &FieldMap,
    ) -> (FieldMap, Option<String>) {
        let mut mutated = fields.clone();

        let take_structure_aware = match self.mode {
            MutationMode::StructureAware => true,
            MutationMode::ByteLevel => false,
            MutationMode::Hybrid => rng.gen_range(1..=100u8) <= self.structure_aware_weight,
        };

        if take_structure_aware {
            let field = self.mutate_structure_aware(rng, model, &mut mutated);
            return (mutated, field);
        }

        let Ok(mut raw) = parser::serialize(model, &mutated) else {
            let field = self.mutate_structure_aware(rng, model, &mut mutated);
            return (mutated, field);
        };

        match STRATEGIES[rng.gen_range(0..STRATEGIES.len())] {
            ByteMutator::Splice => {
                let donor = self.random_donor(rng, &raw);
                raw = byte::splice(rng, &raw, donor);
            }
            other => byte::apply(other, rng, &mut raw),
        }

        match parser::parse(model, &raw) {
            Ok(reparsed) => (reparsed, None),
            Err(_) => {
                let field = self.mutate_structure_aware(rng, model, &mut mutated);
                (mutated, field)
            }
        }
    }

    fn mutate_structure_aware(
        &self,
        rng: &mut impl Rng,
        model: &DataModel,
        fields: &mut FieldMap,
    ) -> Option<String> {
        let block = structure::choose_field(rng, model)?;
        let name = block.name.clone();
        structure::mutate_field(rng, block, fields);
        Some(name)
    }

    fn random_donor<'a>(&'a self, rng: &mut impl Rng, current: &[u8]) -> &'a [u8] {
        let candidates: Vec<&Vec<u8>> = self
            .seeds
            .iter()
            .filter(|s| s.as_slice() != current)
            .collect();
        if candidates.is_empty() {
            return &self.seeds[0];
        }
        candidates[rng.gen_range(0..candidates.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> DataModel {
        let block = Block {
            name: "payload".into(),
            kind: BlockKind::Bytes,
            size: Some(8),
            max_size: None,
            endian: Endian::Big,
            bit_order: BitOrder::Msb,
            default: None,
            mutable: true,
            values: None,
            is_size_field: false,
            size_of: None,
            size_unit: SizeUnit::Bytes,
            is_checksum: false,
            checksum_algorithm: None,
            checksum_over: None,
            behavior: None,
            from_context: None,
        };
        DataModel {
            blocks: vec![block],
            ..Default::default()
        }
    }

    #[test]
    fn rejects_construction_with_fewer_than_two_seeds() {
        let err = MutationEngine::new(vec![vec![1, 2, 3]], MutationMode::Hybrid, 70).unwrap_err();
        assert!(matches!(err, PluginError::InsufficientSeedsForSplice(1)));
    }

    #[test]
    fn mutate_never_panics_across_many_calls() {
        let engine =
            MutationEngine::new(vec![vec![0u8; 8], vec![0xFFu8; 8]], MutationMode::Hybrid, 70).unwrap();
        let model = model();
        let mut fields = FieldMap::new();
        fields.insert("payload".into(), crate::parser::FieldValue::Bytes(vec![0u8; 8]));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let (next, _field) = engine.mutate(&mut rng, &model, &fields);
            fields = next;
        }
    }

    #[test]
    fn byte_level_mode_never_reports_a_mutated_field() {
        let engine =
            MutationEngine::new(vec![vec![0u8; 8], vec![0xFFu8; 8]], MutationMode::ByteLevel, 70).unwrap();
        let model = model();
        let mut fields = FieldMap::new();
        fields.insert("payload".into(), crate::parser::FieldValue::Bytes(vec![0u8; 8]));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let (next, field) = engine.mutate(&mut rng, &model, &fields);
            assert!(field.is_none());
            fields = next;
        }
    }

    #[test]
    fn structure_aware_mode_always_reports_the_mutated_field() {
        let engine = MutationEngine::new(
            vec![vec![0u8; 8], vec![0xFFu8; 8]],
            MutationMode::StructureAware,
            70,
        )
        .unwrap();
        let model = model();
        let mut fields = FieldMap::new();
        fields.insert("payload".into(), crate::parser::FieldValue::Bytes(vec![0u8; 8]));
        let mut rng = StdRng::seed_from_u64(7);
        let (_next, field) = engine.mutate(&mut rng, &model, &fields);
        assert_eq!(field.as_deref(), Some("payload"));
    }
}
