//! Response planner (§4.6): parses an incoming response against a stage's
//! `response_model`, matches it against `response_handlers`, and resolves
//! the field values the next outgoing message should carry.

use std::collections::HashMap;

use crate::model::{DataModel, ExtractBits, Literal, ResponseHandler, SetField, Transition};
use crate::parser::{self, FieldMap, FieldValue};

#[derive(Debug, Default, Clone)]
pub struct ResponsePlan {
    pub parsed: Option<FieldMap>,
    pub matched_handler: Option<String>,
    pub set_fields: HashMap<String, FieldValue>,
}

/// Parse `response_bytes` against `model.response_model`, if any, and apply
/// the first matching handler in `model.response_handlers`.
pub fn plan_response(model: &DataModel, response_bytes: &[u8]) -> ResponsePlan {
    let Some(response_model) = &model.response_model else {
        return ResponsePlan::default();
    };
    let Ok(parsed) = parser::parse(response_model, response_bytes) else {
        return ResponsePlan::default();
    };

    let handler = model
        .response_handlers
        .iter()
        .find(|h| handler_matches(h, &parsed));

    let set_fields = handler
        .map(|h| resolve_set_fields(h, &parsed))
        .unwrap_or_default();

    ResponsePlan {
        parsed: Some(parsed),
        matched_handler: handler.map(|h| h.name.clone()),
        set_fields,
    }
}

fn handler_matches(handler: &ResponseHandler, parsed: &FieldMap) -> bool {
    handler.match_fields.iter().all(|(field, expected)| {
        match (parsed.get(field), expected) {
            (Some(FieldValue::Int(v)), Literal::Int(e)) => *v == *e as i128,
            (Some(FieldValue::Bytes(v)), Literal::Bytes(e)) => v == e,
            (Some(FieldValue::Bytes(v)), Literal::Str(e)) => v.as_slice() == e.as_bytes(),
            _ => false,
        }
    })
}

fn resolve_set_fields(handler: &ResponseHandler, parsed: &FieldMap) -> HashMap<String, FieldValue> {
    let mut out = HashMap::new();
    for (name, set) in &handler.set_fields {
        let value = match set {
            SetField::Literal(Literal::Int(v)) => Some(FieldValue::Int(*v as i128)),
            SetField::Literal(Literal::Bytes(v)) => Some(FieldValue::Bytes(v.clone())),
            SetField::Literal(Literal::Str(v)) => Some(FieldValue::Bytes(v.as_bytes().to_vec())),
            SetField::CopyFromResponse {
                copy_from_response,
                extract_bits,
            } => parsed
                .get(copy_from_response)
                .and_then(|v| apply_extract_bits(v, extract_bits.as_ref())),
        };
        if let Some(value) = value {
            out.insert(name.clone(), value);
        }
    }
    out
}

fn apply_extract_bits(value: &FieldValue, extract_bits: Option<&ExtractBits>) -> Option<FieldValue> {
    let Some(eb) = extract_bits else {
        return Some(value.clone());
    };
    let FieldValue::Int(v) = value else {
        return Some(value.clone());
    };
    let shifted = v >> eb.start;
    let mask: i128 = if eb.count >= 128 { -1 } else { (1i128 << eb.count) - 1 };
    Some(FieldValue::Int(shifted & mask))
}

/// Whether a response advances `transition`, per the resolved Open Question:
/// a byte-prefix match against `expected_response`'s literal bytes when
/// present, otherwise any response that parses against a declared
/// `response_model` counts as advancing.
pub fn advances(transition: &Transition, model: &DataModel, response_bytes: &[u8]) -> bool {
    if let Some(expected) = &transition.expected_response {
        return response_bytes.starts_with(expected);
    }
    match &model.response_model {
        Some(response_model) => parser::parse(response_model, response_bytes).is_ok(),
        None => false,
    }
}
