//! Protocol parser / serializer (§4.1).
//!
//! Walks a `DataModel`'s blocks in declared order over a byte-and-bit
//! cursor. Two passes on serialize: emit placeholders for derived fields,
//! then fix up sizes and checksums in place.

use std::collections::HashMap;

use crate::error::ParseError;
use crate::model::{
    Behavior, BitOrder, Block, BlockKind, ChecksumAlgorithm, ChecksumOver, DataModel, Endian,
    Literal, SizeUnit,
};

/// A parsed field's value. Integers (including `bits` fields) are stored
/// widened to `i128` so unsigned 64-bit values round-trip without loss;
/// `bytes`/`string` share a `Bytes` representation.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i128),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::Int(_) => None,
        }
    }
}

pub type FieldMap = HashMap<String, FieldValue>;

#[derive(Default, Clone, Copy)]
struct BitCursor {
    bit_index: u64,
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Multi-byte `bits` fields assemble MSB-first by default; for `little`
/// endian and widths that are a whole number of bytes (>8 bits), the byte
/// order of that assembled value is reversed. Narrower / non-byte-multiple
/// widths have no meaningful byte order and are left unchanged.
fn reorder_for_endian(v: u64, width: u32, endian: Endian) -> u64 {
    if endian == Endian::Big || width <= 8 || width % 8 != 0 {
        return v & mask(width);
    }
    let nbytes = (width / 8) as usize;
    let be = v.to_be_bytes();
    let start = 8 - nbytes;
    let mut out = [0u8; 8];
    for i in 0..nbytes {
        out[start + i] = be[8 - 1 - i];
    }
    u64::from_be_bytes(out) & mask(width)
}

fn read_bits(cur: &mut BitCursor, data: &[u8], width: u32, order: BitOrder) -> Result<u64, ParseError> {
    if width > 64 {
        return Err(ParseError::BitWidthTooLarge(width));
    }
    let mut raw: u64 = 0;
    for _ in 0..width {
        let byte_idx = (cur.bit_index / 8) as usize;
        if byte_idx >= data.len() {
            return Err(ParseError::Eof {
                offset: byte_idx,
                reason: "bit field".into(),
            });
        }
        let bit_in_byte = (cur.bit_index % 8) as u8;
        let bit = match order {
            BitOrder::Msb => (data[byte_idx] >> (7 - bit_in_byte)) & 1,
            BitOrder::Lsb => (data[byte_idx] >> bit_in_byte) & 1,
        };
        raw = (raw << 1) | bit as u64;
        cur.bit_index += 1;
    }
    Ok(raw)
}

fn write_bits(cur: &mut BitCursor, buf: &mut Vec<u8>, value: u64, width: u32, order: BitOrder, endian: Endian) {
    let raw = reorder_for_endian(value & mask(width), width, endian);
    for i in (0..width).rev() {
        let bit = ((raw >> i) & 1) as u8;
        let byte_idx = (cur.bit_index / 8) as usize;
        while byte_idx >= buf.len() {
            buf.push(0);
        }
        let bit_in_byte = (cur.bit_index % 8) as u8;
        if bit == 1 {
            match order {
                BitOrder::Msb => buf[byte_idx] |= 1 << (7 - bit_in_byte),
                BitOrder::Lsb => buf[byte_idx] |= 1 << bit_in_byte,
            }
        }
        cur.bit_index += 1;
    }
}

fn read_int(data: &[u8], endian: Endian, signed: bool) -> i128 {
    let width = data.len();
    let mut magnitude: u128 = 0;
    match endian {
        Endian::Big => {
            for &b in data {
                magnitude = (magnitude << 8) | b as u128;
            }
        }
        Endian::Little => {
            for &b in data.iter().rev() {
                magnitude = (magnitude << 8) | b as u128;
            }
        }
    }
    if signed && width > 0 {
        let bits = (width * 8) as u32;
        let sign_bit = 1u128 << (bits - 1);
        if magnitude & sign_bit != 0 {
            let full = 1u128 << bits;
            return (magnitude as i128) - (full as i128);
        }
    }
    magnitude as i128
}

fn write_int(v: i128, width: u32, endian: Endian) -> Vec<u8> {
    let mut magnitude = (v as i128) as u128;
    // keep only the low `width` bytes (two's complement for negatives already
    // falls out of the `as u128` cast for the widths we support, <= 16 bytes).
    let mut bytes = vec![0u8; width as usize];
    for i in (0..width as usize).rev() {
        bytes[i] = (magnitude & 0xFF) as u8;
        magnitude >>= 8;
    }
    if endian == Endian::Little {
        bytes.reverse();
    }
    bytes
}

fn get_int(fields: &FieldMap, block: &Block) -> i128 {
    match fields.get(&block.name) {
        Some(FieldValue::Int(v)) => *v,
        _ => match &block.default {
            Some(Literal::Int(v)) => *v as i128,
            _ => 0,
        },
    }
}

fn get_bytes(fields: &FieldMap, block: &Block) -> Vec<u8> {
    match fields.get(&block.name) {
        Some(FieldValue::Bytes(b)) => b.clone(),
        _ => match &block.default {
            Some(Literal::Bytes(b)) => b.clone(),
            Some(Literal::Str(s)) => s.as_bytes().to_vec(),
            _ => Vec::new(),
        },
    }
}

/// Parse bytes into a field map, per §4.1 "Parse".
pub fn parse(model: &DataModel, data: &[u8]) -> Result<FieldMap, ParseError> {
    parse_prefix(model, data).map(|(map, _consumed)| map)
}

/// Like `parse`, but also returns how many leading bytes of `data` the model
/// consumed. Trailing bytes beyond that point are left untouched, which lets
/// a connection reader use this to find a message boundary inside a byte
/// stream that may hold more than one message.
pub fn parse_prefix(model: &DataModel, data: &[u8]) -> Result<(FieldMap, usize), ParseError> {
    let mut map = FieldMap::new();
    let mut byte_cursor: usize = 0;
    let mut bitcur = BitCursor::default();
    let mut in_bits = false;

    for (idx, block) in model.blocks.iter().enumerate() {
        if matches!(block.kind, BlockKind::Bits) {
            if !in_bits {
                bitcur.bit_index = (byte_cursor as u64) * 8;
                in_bits = true;
            }
            let width = block.size.unwrap_or(0);
            let raw = read_bits(&mut bitcur, data, width, block.bit_order)?;
            let value = reorder_for_endian(raw, width, block.endian);
            map.insert(block.name.clone(), FieldValue::Int(value as i128));
            continue;
        }

        if in_bits {
            byte_cursor = ((bitcur.bit_index + 7) / 8) as usize;
            in_bits = false;
        }

        match block.kind {
            BlockKind::Bits => unreachable!(),
            k if k.is_integer() => {
                let width = k.fixed_width_bytes().unwrap() as usize;
                if byte_cursor + width > data.len() {
                    return Err(ParseError::SizeExceedsInput {
                        offset: byte_cursor,
                        declared: width,
                        remaining: data.len().saturating_sub(byte_cursor),
                    });
                }
                let slice = &data[byte_cursor..byte_cursor + width];
                let v = read_int(slice, block.endian, k.is_signed());
                map.insert(block.name.clone(), FieldValue::Int(v));
                byte_cursor += width;
            }
            BlockKind::Bytes | BlockKind::String => {
                let len = if let Some(fixed) = block.size {
                    fixed as usize
                } else if let Some(len) = variable_length(model, &map, idx) {
                    len
                } else {
                    data.len().saturating_sub(byte_cursor)
                };
                if byte_cursor + len > data.len() {
                    return Err(ParseError::SizeExceedsInput {
                        offset: byte_cursor,
                        declared: len,
                        remaining: data.len().saturating_sub(byte_cursor),
                    });
                }
                map.insert(
                    block.name.clone(),
                    FieldValue::Bytes(data[byte_cursor..byte_cursor + len].to_vec()),
                );
                byte_cursor += len;
            }
        }
    }
    if in_bits {
        byte_cursor = ((bitcur.bit_index + 7) / 8) as usize;
    }
    Ok((map, byte_cursor))
}

fn variable_length(model: &DataModel, map: &FieldMap, idx: usize) -> Option<usize> {
    let this_name = model.blocks[idx].name.as_str();
    for b in &model.blocks[..idx] {
        if !b.is_size_field {
            continue;
        }
        let Some(size_of) = &b.size_of else { continue };
        let targets = size_of.fields();
        if !targets.contains(&this_name) {
            continue;
        }
        let raw = match map.get(&b.name) {
            Some(FieldValue::Int(v)) => *v,
            _ => 0,
        };
        if b.size_unit == SizeUnit::Bits {
            return Some((raw as usize) / 8);
        }
        let unit_bytes = b.size_unit.bytes_per_unit().unwrap_or(1) as i128;
        let total_bytes = (raw * unit_bytes).max(0) as usize;
        let other_fixed: usize = targets
            .iter()
            .filter(|t| **t != this_name)
            .filter_map(|t| model.field(t))
            .filter_map(|ob| ob.size)
            .map(|s| s as usize)
            .sum();
        return Some(total_bytes.saturating_sub(other_fixed));
    }
    None
}

struct SizeFixup {
    offset: usize,
    width: u32,
    endian: Endian,
    unit: SizeUnit,
    targets: Vec<String>,
}

struct ChecksumFixup {
    offset: usize,
    width: u32,
    endian: Endian,
    algorithm: ChecksumAlgorithm,
    over: ChecksumOver,
}

/// Serialize a field map into bytes, per §4.1 "Serialize". Recomputes every
/// `is_size_field` and `is_checksum` block regardless of what (if anything)
/// the caller put in `fields` for them.
pub fn serialize(model: &DataModel, fields: &FieldMap) -> Result<Vec<u8>, ParseError> {
    let mut out: Vec<u8> = Vec::new();
    let mut bitbuf: Vec<u8> = Vec::new();
    let mut bitcur = BitCursor::default();
    let mut offsets: HashMap<String, (usize, usize)> = HashMap::new();
    let mut size_fixups: Vec<SizeFixup> = Vec::new();
    let mut checksum_fixups: Vec<ChecksumFixup> = Vec::new();
    let mut first_variable_payload: Option<(usize, usize)> = None;

    for (idx, block) in model.blocks.iter().enumerate() {
        if matches!(block.kind, BlockKind::Bits) {
            let width = block.size.unwrap_or(0);
            let v = get_int(fields, block) as u64;
            write_bits(&mut bitcur, &mut bitbuf, v, width, block.bit_order, block.endian);
            let next_is_bits = model
                .blocks
                .get(idx + 1)
                .map(|b| matches!(b.kind, BlockKind::Bits))
                .unwrap_or(false);
            if !next_is_bits {
                out.extend_from_slice(&bitbuf);
                bitbuf.clear();
                bitcur = BitCursor::default();
            }
            continue;
        }

        let start = out.len();
        match block.kind {
            BlockKind::Bits => unreachable!(),
            k if k.is_integer() => {
                let width = k.fixed_width_bytes().unwrap();
                if block.is_size_field || block.is_checksum {
                    out.extend(std::iter::repeat(0u8).take(width as usize));
                } else {
                    let v = get_int(fields, block);
                    out.extend(write_int(v, width, block.endian));
                }
            }
            BlockKind::Bytes | BlockKind::String => {
                let mut bytes = get_bytes(fields, block);
                if let Some(fixed) = block.size {
                    bytes.resize(fixed as usize, 0);
                } else if first_variable_payload.is_none() {
                    first_variable_payload = Some((start, bytes.len()));
                }
                out.extend_from_slice(&bytes);
            }
        }
        let len = out.len() - start;
        offsets.insert(block.name.clone(), (start, len));

        if block.is_size_field {
            let targets = block
                .size_of
                .as_ref()
                .map(|s| s.fields().into_iter().map(str::to_string).collect())
                .unwrap_or_default();
            size_fixups.push(SizeFixup {
                offset: start,
                width: block.kind.fixed_width_bytes().unwrap(),
                endian: block.endian,
                unit: block.size_unit,
                targets,
            });
        }
        if block.is_checksum {
            checksum_fixups.push(ChecksumFixup {
                offset: start,
                width: block.kind.fixed_width_bytes().unwrap(),
                endian: block.endian,
                algorithm: block.checksum_algorithm.ok_or_else(|| {
                    ParseError::InvalidChecksumRegion(block.name.clone(), "missing algorithm".into())
                })?,
                over: block.checksum_over.ok_or_else(|| {
                    ParseError::InvalidChecksumRegion(block.name.clone(), "missing region".into())
                })?,
            });
        }
    }

    for fx in &size_fixups {
        let total_bytes: usize = fx
            .targets
            .iter()
            .filter_map(|t| offsets.get(t))
            .map(|(_, l)| *l)
            .sum();
        let value = match fx.unit {
            SizeUnit::Bits => (total_bytes as u64) * 8,
            other => (total_bytes as u64) / other.bytes_per_unit().unwrap_or(1) as u64,
        };
        let bytes = write_int(value as i128, fx.width, fx.endian);
        out[fx.offset..fx.offset + fx.width as usize].copy_from_slice(&bytes);
    }

    for fx in &checksum_fixups {
        let region: Vec<u8> = match fx.over {
            ChecksumOver::Before => out[..fx.offset].to_vec(),
            ChecksumOver::After => out[fx.offset + fx.width as usize..].to_vec(),
            ChecksumOver::All => {
                let mut v = out[..fx.offset].to_vec();
                v.extend_from_slice(&out[fx.offset + fx.width as usize..]);
                v
            }
            ChecksumOver::Header => match first_variable_payload {
                Some((start, _)) => out[..start].to_vec(),
                None => out[..fx.offset].to_vec(),
            },
            ChecksumOver::Payload => match first_variable_payload {
                Some((start, len)) => out[start..start + len].to_vec(),
                None => Vec::new(),
            },
        };
        let value = compute_checksum(fx.algorithm, &region);
        let bytes = write_int(value as i128, fx.width, fx.endian);
        out[fx.offset..fx.offset + fx.width as usize].copy_from_slice(&bytes);
    }

    Ok(out)
}

pub fn compute_checksum(algorithm: ChecksumAlgorithm, data: &[u8]) -> u64 {
    match algorithm {
        ChecksumAlgorithm::Crc32 => {
            const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
            CRC.checksum(data) as u64
        }
        ChecksumAlgorithm::Adler32 => {
            adler32::adler32(std::io::Cursor::new(data)).unwrap_or(1) as u64
        }
        ChecksumAlgorithm::Sum => data.iter().fold(0u64, |acc, &b| acc.wrapping_add(b as u64)),
        ChecksumAlgorithm::Xor => data.iter().fold(0u8, |acc, &b| acc ^ b) as u64,
        ChecksumAlgorithm::Sum8 => data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) as u64,
        ChecksumAlgorithm::Sum16 => data
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(b as u16)) as u64,
    }
}

/// Applies a behavior's transform to the current value of its host field,
/// per §4.2. `counter` is the in-session counter state for this field,
/// updated in place. `seeded` records whether `initial` has already been
/// consumed for this field, so a counter that wraps back through zero isn't
/// mistaken for an unseeded one.
pub fn apply_behavior(
    behavior: &Behavior,
    width_bytes: u32,
    current: i128,
    counter: &mut i64,
    seeded: &mut bool,
) -> i128 {
    let max_value: i128 = if width_bytes >= 16 {
        i128::MAX
    } else {
        (1i128 << (width_bytes * 8)) - 1
    };
    match behavior.operation {
        crate::model::BehaviorOp::Increment => {
            if !*seeded {
                if let Some(initial) = behavior.initial {
                    *counter = initial;
                }
                *seeded = true;
            }
            let out = *counter;
            let step = behavior.step.unwrap_or(1);
            let wrap = behavior.wrap.unwrap_or(max_value as i64 + 1);
            *counter = (*counter + step).rem_euclid(wrap.max(1));
            out as i128
        }
        crate::model::BehaviorOp::AddConstant => {
            let value = behavior.value.unwrap_or(0) as i128;
            (current + value).rem_euclid(max_value + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn int_block(name: &str, kind: BlockKind) -> Block {
        Block {
            name: name.to_string(),
            kind,
            size: kind.fixed_width_bytes(),
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

    fn bytes_block(name: &str, size: Option<u32>) -> Block {
        let mut b = int_block(name, BlockKind::Bytes);
        b.size = size;
        b
    }

    #[test]
    fn length_auto_fix_scenario() {
        // {magic:"SIMP" (4 bytes, immutable), len:uint16/big (size_of payload),
        //  payload:bytes}
        let mut magic = bytes_block("magic", Some(4));
        magic.mutable = false;
        let mut len = int_block("len", BlockKind::Uint16);
        len.is_size_field = true;
        len.size_of = Some(SizeOf::Single("payload".into()));
        let payload = bytes_block("payload", None);

        let model = DataModel {
            blocks: vec![magic, len, payload],
            ..Default::default()
        };

        let seed = vec![0x53, 0x49, 0x4D, 0x50, 0x00, 0x05, b'H', b'E', b'L', b'L', b'O'];
        let mut fields = parse(&model, &seed).unwrap();
        fields.insert(
            "payload".into(),
            FieldValue::Bytes(b"HELLOHELLO".to_vec()),
        );
        let out = serialize(&model, &fields).unwrap();
        assert_eq!(&out[0..6], &[0x53, 0x49, 0x4D, 0x50, 0x00, 0x0A]);
        assert_eq!(&out[6..], b"HELLOHELLO");
    }

    #[test]
    fn checksum_recompute_scenario() {
        let hdr = {
            let mut b = int_block("hdr", BlockKind::Uint8);
            b.default = Some(Literal::Int(0x01));
            b
        };
        let body = bytes_block("body", Some(4));
        let mut sum = int_block("sum", BlockKind::Uint32);
        sum.is_checksum = true;
        sum.checksum_algorithm = Some(ChecksumAlgorithm::Crc32);
        sum.checksum_over = Some(ChecksumOver::Before);

        let model = DataModel {
            blocks: vec![hdr, body, sum],
            ..Default::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("hdr".into(), FieldValue::Int(0x01));
        fields.insert(
            "body".into(),
            FieldValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        );
        let out = serialize(&model, &fields).unwrap();
        let expected = compute_checksum(ChecksumAlgorithm::Crc32, &[0x01, 0xDE, 0xAD, 0xBE, 0xEF]);
        let got = u32::from_be_bytes(out[5..9].try_into().unwrap()) as u64;
        assert_eq!(got, expected);
    }

    #[test]
    fn bit_field_packing_three_fields_two_bytes() {
        let mut a = int_block("a", BlockKind::Bits);
        a.size = Some(3);
        let mut b = int_block("b", BlockKind::Bits);
        b.size = Some(5);
        let mut c = int_block("c", BlockKind::Bits);
        c.size = Some(8);
        let model = DataModel {
            blocks: vec![a, b, c],
            ..Default::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("a".into(), FieldValue::Int(0b101));
        fields.insert("b".into(), FieldValue::Int(0b10110));
        fields.insert("c".into(), FieldValue::Int(0xAB));
        let out = serialize(&model, &fields).unwrap();
        assert_eq!(out.len(), 2);
        let parsed = parse(&model, &out).unwrap();
        assert_eq!(parsed.get("a").unwrap().as_int(), Some(0b101));
        assert_eq!(parsed.get("b").unwrap().as_int(), Some(0b10110));
        assert_eq!(parsed.get("c").unwrap().as_int(), Some(0xAB));
    }

    #[test]
    fn size_field_in_bits_unit() {
        let mut len = int_block("len", BlockKind::Uint32);
        len.is_size_field = true;
        len.size_of = Some(SizeOf::Single("payload".into()));
        len.size_unit = SizeUnit::Bits;
        let payload = bytes_block("payload", Some(40));
        let model = DataModel {
            blocks: vec![len, payload],
            ..Default::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("payload".into(), FieldValue::Bytes(vec![0u8; 40]));
        let out = serialize(&model, &fields).unwrap();
        let len_value = u32::from_be_bytes(out[0..4].try_into().unwrap());
        assert_eq!(len_value, 320);
    }

    #[test]
    fn integer_endian_roundtrip() {
        for endian in [Endian::Big, Endian::Little] {
            let bytes = write_int(0x0102_0304, 4, endian);
            let v = read_int(&bytes, endian, false);
            assert_eq!(v, 0x0102_0304);
        }
    }

    #[test]
    fn signed_sign_extension() {
        let bytes = write_int(-1, 2, Endian::Big);
        assert_eq!(read_int(&bytes, Endian::Big, true), -1);
        assert_eq!(read_int(&bytes, Endian::Big, false), 0xFFFF);
    }

    #[test]
    fn parse_rejects_truncated_input() {
        let block = int_block("v", BlockKind::Uint32);
        let model = DataModel {
            blocks: vec![block],
            ..Default::default()
        };
        let err = parse(&model, &[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, ParseError::SizeExceedsInput { .. }));
    }
}
