//! Stage runner (§4.10): drives a `ProtocolStack`'s stages in order
//! (typically `bootstrap`, `fuzz_target`, `teardown`), threading a
//! `ProtocolContext` between them so a later stage can use values an
//! earlier one exported from its response.

use std::time::Duration;

use tracing::info;

use crate::connection::ManagedConnection;
use crate::context::{ContextValue, ProtocolContext};
use crate::error::EngineResult;
use crate::model::{DataModel, ExportType, Exports, ProtocolStack, Stage};
use crate::parser::{self, FieldMap, FieldValue};

const RESPONSE_BUF: usize = 65536;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

fn build_fields_from_context(model: &DataModel, ctx: &ProtocolContext) -> FieldMap {
    let mut fields = FieldMap::new();
    for block in &model.blocks {
        let Some(key) = &block.from_context else { continue };
        let Some(value) = ctx.get(key) else { continue };
        let field_value = match value {
            ContextValue::Bytes(b) => FieldValue::Bytes(b.clone()),
            ContextValue::U64(v) => FieldValue::Int(*v as i128),
            ContextValue::I64(v) => FieldValue::Int(*v as i128),
            ContextValue::Str(s) => FieldValue::Bytes(s.as_bytes().to_vec()),
            ContextValue::Bool(b) => FieldValue::Int(*b as i128),
        };
        fields.insert(block.name.clone(), field_value);
    }
    fields
}

fn resolve_exports(exports: &Exports, response_fields: &FieldMap, ctx: &mut ProtocolContext) {
    for (key, spec) in exports {
        let Some(value) = response_fields.get(&spec.from_field) else { continue };
        let resolved = match (spec.value_type, value) {
            (ExportType::Bytes, FieldValue::Bytes(b)) => Some(ContextValue::Bytes(b.clone())),
            (ExportType::Str, FieldValue::Bytes(b)) => {
                Some(ContextValue::Str(String::from_utf8_lossy(b).into_owned()))
            }
            (ExportType::U64, FieldValue::Int(v)) => Some(ContextValue::U64(*v as u64)),
            (ExportType::I64, FieldValue::Int(v)) => Some(ContextValue::I64(*v as i64)),
            (ExportType::Bool, FieldValue::Int(v)) => Some(ContextValue::Bool(*v != 0)),
            _ => None,
        };
        if let Some(resolved) = resolved {
            ctx.set(key.clone(), resolved);
        }
    }
}

/// Run a single stage: inject context values, send, and (if the stage
/// declares a `response_model`) parse the reply and resolve its exports.
pub async fn run_stage(
    stage: &Stage,
    ctx: &mut ProtocolContext,
    conn: &mut ManagedConnection,
) -> EngineResult<Option<FieldMap>> {
    let plugin = &stage.plugin;
    let fields = build_fields_from_context(&plugin.data_model, ctx);
    let bytes = parser::serialize(&plugin.data_model, &fields)?;
    conn.send(&bytes).await?;

    if plugin.data_model.response_model.is_none() {
        return Ok(None);
    }
    let response_model = plugin.data_model.response_model.as_ref().unwrap();
    let mut buf = vec![0u8; RESPONSE_BUF];
    let n = conn.recv(&mut buf, RESPONSE_TIMEOUT).await?;
    let parsed = parser::parse(response_model, &buf[..n])?;
    resolve_exports(&plugin.exports, &parsed, ctx);
    Ok(Some(parsed))
}

/// Run every stage of a protocol stack in declared order.
pub async fn run_stack(
    stack: &ProtocolStack,
    ctx: &mut ProtocolContext,
    conn: &mut ManagedConnection,
) -> EngineResult<()> {
    for stage in &stack.stages {
        info!(stage = %stage.name, "running stage");
        run_stage(stage, ctx, conn).await?;
    }
    Ok(())
}
