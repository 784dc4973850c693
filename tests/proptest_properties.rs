//! Round-trip and boundary-law properties from the testable-properties list,
//! checked against randomly generated inputs rather than fixed examples.

use fuzzcore::model::*;
use fuzzcore::parser::{self, FieldMap, FieldValue};
use proptest::prelude::*;

fn uint_block(name: &str, kind: BlockKind, endian: Endian) -> Block {
    Block {
        name: name.to_string(),
        kind,
        size: kind.fixed_width_bytes(),
        max_size: None,
        endian,
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

fn single_field_model(kind: BlockKind, endian: Endian) -> DataModel {
    DataModel {
        blocks: vec![uint_block("v", kind, endian)],
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn endian_roundtrip_u32(value in any::<u32>()) {
        for endian in [Endian::Big, Endian::Little] {
            let model = single_field_model(BlockKind::Uint32, endian);
            let mut fields = FieldMap::new();
            fields.insert("v".into(), FieldValue::Int(value as i128));
            let bytes = parser::serialize(&model, &fields).unwrap();
            let parsed = parser::parse(&model, &bytes).unwrap();
            prop_assert_eq!(parsed.get("v").unwrap().as_int(), Some(value as i128));
        }
    }

    #[test]
    fn endian_roundtrip_i16(value in any::<i16>()) {
        for endian in [Endian::Big, Endian::Little] {
            let model = single_field_model(BlockKind::Int16, endian);
            let mut fields = FieldMap::new();
            fields.insert("v".into(), FieldValue::Int(value as i128));
            let bytes = parser::serialize(&model, &fields).unwrap();
            let parsed = parser::parse(&model, &bytes).unwrap();
            prop_assert_eq!(parsed.get("v").unwrap().as_int(), Some(value as i128));
        }
    }

    #[test]
    fn checksum_changes_under_any_single_byte_flip(body in prop::collection::vec(any::<u8>(), 4..32), flip_index in any::<usize>()) {
        let mut body_block = uint_block("body", BlockKind::Bytes, Endian::Big);
        body_block.size = Some(body.len() as u32);
        let mut sum = uint_block("sum", BlockKind::Uint32, Endian::Big);
        sum.is_checksum = true;
        sum.checksum_algorithm = Some(ChecksumAlgorithm::Crc32);
        sum.checksum_over = Some(ChecksumOver::Before);
        let model = DataModel {
            blocks: vec![body_block, sum],
            ..Default::default()
        };

        let mut fields = FieldMap::new();
        fields.insert("body".into(), FieldValue::Bytes(body.clone()));
        let original = parser::serialize(&model, &fields).unwrap();

        let idx = flip_index % body.len();
        let mut flipped = body.clone();
        flipped[idx] ^= 0xFF;
        fields.insert("body".into(), FieldValue::Bytes(flipped));
        let mutated = parser::serialize(&model, &fields).unwrap();

        prop_assert_ne!(&original[body.len()..], &mutated[body.len()..]);
    }

    #[test]
    fn parse_then_serialize_preserves_non_derived_fields(a in any::<u8>(), b in any::<u16>()) {
        let field_a = uint_block("a", BlockKind::Uint8, Endian::Big);
        let field_b = uint_block("b", BlockKind::Uint16, Endian::Big);
        let model = DataModel {
            blocks: vec![field_a, field_b],
            ..Default::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("a".into(), FieldValue::Int(a as i128));
        fields.insert("b".into(), FieldValue::Int(b as i128));
        let bytes = parser::serialize(&model, &fields).unwrap();
        let reparsed = parser::parse(&model, &bytes).unwrap();
        prop_assert_eq!(reparsed.get("a").unwrap().as_int(), Some(a as i128));
        prop_assert_eq!(reparsed.get("b").unwrap().as_int(), Some(b as i128));
    }
}
