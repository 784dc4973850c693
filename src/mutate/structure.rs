//! Structure-aware mutator (§4.4): picks a structurally-mutable field and
//! mutates its decoded value directly, respecting the field's declared
//! shape and bounds, rather than flipping raw bytes.

use rand::Rng;

use crate::model::{Block, BlockKind, DataModel};
use crate::parser::{FieldMap, FieldValue};

use super::byte;

/// Choose a uniformly random field eligible for structural mutation.
pub fn choose_field<'a>(rng: &mut impl Rng, model: &'a DataModel) -> Option<&'a Block> {
    let eligible: Vec<&Block> = model
        .blocks
        .iter()
        .filter(|b| b.is_structurally_mutable())
        .collect();
    if eligible.is_empty() {
        return None;
    }
    Some(eligible[rng.gen_range(0..eligible.len())])
}

/// Mutate `fields[block.name]` in place, dispatching on the field's kind.
pub fn mutate_field(rng: &mut impl Rng, block: &Block, fields: &mut FieldMap) {
    match block.kind {
        k if k.is_integer() => mutate_integer(rng, block, fields),
        BlockKind::Bytes | BlockKind::String => mutate_variable(rng, block, fields),
        BlockKind::Bits => mutate_bits(rng, block, fields),
    }
}

fn mutate_integer(rng: &mut impl Rng, block: &Block, fields: &mut FieldMap) {
    let width = block.kind.fixed_width_bytes().unwrap_or(8) as usize;
    let current = fields
        .get(&block.name)
        .and_then(FieldValue::as_int)
        .unwrap_or(0);
    let value = match rng.gen_range(0..4) {
        0 => boundary_value(rng, width, block.kind.is_signed()),
        1 => {
            let mut bytes = value_to_be_bytes(current, width);
            byte::bit_flip(rng, &mut bytes);
            be_bytes_to_value(&bytes, block.kind.is_signed())
        }
        2 => {
            let mut bytes = value_to_be_bytes(current, width);
            byte::arithmetic(rng, &mut bytes);
            be_bytes_to_value(&bytes, block.kind.is_signed())
        }
        _ => {
            let mut bytes = value_to_be_bytes(current, width);
            byte::interesting_value(rng, &mut bytes);
            be_bytes_to_value(&bytes, block.kind.is_signed())
        }
    };
    fields.insert(block.name.clone(), FieldValue::Int(value));
}

/// One of 0, 1, the field's max value, max - 1, its midpoint, and (for
/// signed widths) -1.
fn boundary_value(rng: &mut impl Rng, width: usize, signed: bool) -> i128 {
    let bits = (width * 8) as u32;
    let max: i128 = if signed {
        if bits == 0 || bits >= 128 {
            i128::MAX
        } else {
            (1i128 << (bits - 1)) - 1
        }
    } else if bits >= 128 {
        i128::MAX
    } else {
        (1i128 << bits) - 1
    };
    let mut candidates = vec![0i128, 1, max, max - 1, max / 2];
    if signed {
        candidates.push(-1);
    }
    candidates[rng.gen_range(0..candidates.len())]
}

fn mutate_bits(rng: &mut impl Rng, block: &Block, fields: &mut FieldMap) {
    let width = block.size.unwrap_or(8).min(64);
    let current = fields
        .get(&block.name)
        .and_then(FieldValue::as_int)
        .unwrap_or(0) as u64;
    let bit = rng.gen_range(0..width);
    let mutated = current ^ (1u64 << bit);
    fields.insert(block.name.clone(), FieldValue::Int(mutated as i128));
}

fn mutate_variable(rng: &mut impl Rng, block: &Block, fields: &mut FieldMap) {
    let mut bytes = fields
        .get(&block.name)
        .and_then(FieldValue::as_bytes)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();

    // A fixed-size bytes/string block must keep its declared wire length;
    // only its content can change, never grow_or_shrink.
    if let Some(fixed) = block.size {
        let len = (fixed as usize).max(1);
        bytes.resize(len, 0);
        match rng.gen_range(0..3) {
            0 => byte::bit_flip(rng, &mut bytes),
            1 => byte::byte_flip(rng, &mut bytes),
            _ => byte::havoc(rng, &mut bytes),
        }
        bytes.resize(fixed as usize, 0);
        fields.insert(block.name.clone(), FieldValue::Bytes(bytes));
        return;
    }

    if bytes.is_empty() {
        bytes = vec![0u8; 8];
    }
    match rng.gen_range(0..4) {
        0 => byte::bit_flip(rng, &mut bytes),
        1 => byte::byte_flip(rng, &mut bytes),
        2 => byte::havoc(rng, &mut bytes),
        _ => grow_or_shrink(rng, &mut bytes, block.max_size),
    }
    if let Some(max) = block.max_size {
        bytes.truncate(max as usize);
    }
    fields.insert(block.name.clone(), FieldValue::Bytes(bytes));
}

fn grow_or_shrink(rng: &mut impl Rng, bytes: &mut Vec<u8>, max_size: Option<u32>) {
    let at_max = max_size.map(|m| bytes.len() as u32 >= m).unwrap_or(false);
    if !at_max && (bytes.is_empty() || rng.gen_bool(0.5)) {
        let extra = rng.gen_range(1..=16);
        bytes.extend((0..extra).map(|_| rng.gen::<u8>()));
    } else if bytes.len() > 1 {
        let cut = rng.gen_range(1..bytes.len());
        bytes.truncate(cut);
    }
}

fn value_to_be_bytes(v: i128, width: usize) -> Vec<u8> {
    let magnitude = v as u128;
    let mut out = vec![0u8; width];
    let mut m = magnitude;
    for i in (0..width).rev() {
        out[i] = (m & 0xFF) as u8;
        m >>= 8;
    }
    out
}

fn be_bytes_to_value(bytes: &[u8], signed: bool) -> i128 {
    let mut magnitude: u128 = 0;
    for &b in bytes {
        magnitude = (magnitude << 8) | b as u128;
    }
    if signed && !bytes.is_empty() {
        let bits = (bytes.len() * 8) as u32;
        let sign_bit = 1u128 << (bits - 1);
        if magnitude & sign_bit != 0 {
            let full = 1u128 << bits;
            return (magnitude as i128) - (full as i128);
        }
    }
    magnitude as i128
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn uint_field(name: &str) -> Block {
        Block {
            name: name.to_string(),
            kind: BlockKind::Uint16,
            size: Some(2),
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
        }
    }

    #[test]
    fn size_and_checksum_fields_are_never_chosen() {
        let mut size_field = uint_field("len");
        size_field.is_size_field = true;
        let mut checksum_field = uint_field("crc");
        checksum_field.is_checksum = true;
        let normal = uint_field("count");
        let model = DataModel {
            blocks: vec![size_field, checksum_field, normal],
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let chosen = choose_field(&mut rng, &model).unwrap();
            assert_eq!(chosen.name, "count");
        }
    }

    #[test]
    fn variable_field_respects_max_size() {
        let mut block = uint_field("blob");
        block.kind = BlockKind::Bytes;
        block.size = None;
        block.max_size = Some(8);
        let mut fields = FieldMap::new();
        fields.insert("blob".into(), FieldValue::Bytes(vec![0u8; 4]));
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            mutate_field(&mut rng, &block, &mut fields);
            let len = fields.get("blob").unwrap().as_bytes().unwrap().len();
            assert!(len <= 8);
        }
    }

    #[test]
    fn fixed_size_bytes_field_never_changes_length() {
        let mut block = uint_field("tag");
        block.kind = BlockKind::Bytes;
        block.size = Some(6);
        let mut fields = FieldMap::new();
        fields.insert("tag".into(), FieldValue::Bytes(vec![0u8; 6]));
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..50 {
            mutate_field(&mut rng, &block, &mut fields);
            assert_eq!(fields.get("tag").unwrap().as_bytes().unwrap().len(), 6);
        }
    }

    #[test]
    fn integer_mutation_can_produce_boundary_values() {
        let block = uint_field("count");
        let mut fields = FieldMap::new();
        fields.insert("count".into(), FieldValue::Int(5));
        let mut rng = StdRng::seed_from_u64(21);
        let mut saw_max = false;
        for _ in 0..500 {
            mutate_field(&mut rng, &block, &mut fields);
            if fields.get("count").unwrap().as_int() == Some(0xFFFF) {
                saw_max = true;
            }
        }
        assert!(saw_max, "boundary_values should eventually hit the field's max value");
    }
}
