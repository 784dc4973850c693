//! Declarative protocol model: the schema types plugins are built from.
//!
//! `Block` and `DataModel` are immutable once loaded (§3 Lifecycle); nothing
//! in this module mutates a model after construction — mutation happens on
//! the *field map* produced by parsing one, never on the schema itself.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::PluginError;

/// Endianness for multi-byte integer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Bit-packing order within a `bits` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BitOrder {
    #[default]
    Msb,
    Lsb,
}

/// Unit a size field is expressed in.
///
/// NOTE: `words` = 4 bytes and `dwords` = 2 bytes here, inverted from common
/// convention — this mirrors the source system's convention and is called
/// out explicitly because it will surprise anyone used to the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Bits,
    #[default]
    Bytes,
    Words,
    Dwords,
}

impl SizeUnit {
    /// Number of bytes represented by one unit, or `None` for `bits` (which
    /// is sub-byte and handled separately).
    pub fn bytes_per_unit(self) -> Option<u32> {
        match self {
            SizeUnit::Bits => None,
            SizeUnit::Bytes => Some(1),
            SizeUnit::Words => Some(4),
            SizeUnit::Dwords => Some(2),
        }
    }
}

/// Checksum algorithm for an `is_checksum` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Adler32,
    Sum,
    Xor,
    Sum8,
    Sum16,
}

/// Region a checksum is computed over, relative to the checksum block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumOver {
    All,
    Header,
    Payload,
    Before,
    After,
}

/// Deterministic per-send transform applied to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Behavior {
    pub operation: BehaviorOp,
    #[serde(default)]
    pub initial: Option<i64>,
    #[serde(default)]
    pub step: Option<i64>,
    #[serde(default)]
    pub wrap: Option<i64>,
    #[serde(default)]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorOp {
    Increment,
    AddConstant,
}

/// A literal default/constant value attached to a `Block`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

/// `extract_bits` modifier on a response handler's `copy_from_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractBits {
    pub start: u32,
    pub count: u32,
}

/// Which mutation path `MutationEngine::mutate` takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    ByteLevel,
    StructureAware,
    Hybrid,
}

impl Default for MutationMode {
    fn default() -> Self {
        MutationMode::Hybrid
    }
}

/// Dispatch knobs for §4.5's hybrid mutation engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MutationConfig {
    #[serde(default)]
    pub mode: MutationMode,
    /// In `hybrid` mode, the chance (0-100) a given call takes the
    /// structure-aware path rather than a raw byte-level one.
    #[serde(default = "default_structure_aware_weight")]
    pub structure_aware_weight: u8,
}

fn default_structure_aware_weight() -> u8 {
    70
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            mode: MutationMode::Hybrid,
            structure_aware_weight: default_structure_aware_weight(),
        }
    }
}

/// Tagged variant over the field's fundamental shape. Orthogonal concerns
/// (derived-field markers, mutability, context injection) live on `Block`
/// itself rather than duplicated per variant, per the REDESIGN FLAGS note on
/// avoiding class hierarchies for field-type polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockKind {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Bytes,
    String,
    Bits,
}

impl BlockKind {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BlockKind::Uint8
                | BlockKind::Uint16
                | BlockKind::Uint32
                | BlockKind::Uint64
                | BlockKind::Int8
                | BlockKind::Int16
                | BlockKind::Int32
                | BlockKind::Int64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BlockKind::Int8 | BlockKind::Int16 | BlockKind::Int32 | BlockKind::Int64
        )
    }

    /// Fixed width in bytes for fixed-width integer kinds; `None` for
    /// variable-shape kinds (`bytes`, `string`, `bits`).
    pub fn fixed_width_bytes(self) -> Option<u32> {
        match self {
            BlockKind::Uint8 | BlockKind::Int8 => Some(1),
            BlockKind::Uint16 | BlockKind::Int16 => Some(2),
            BlockKind::Uint32 | BlockKind::Int32 => Some(4),
            BlockKind::Uint64 | BlockKind::Int64 => Some(8),
            BlockKind::Bytes | BlockKind::String | BlockKind::Bits => None,
        }
    }

    pub fn is_variable_shape(self) -> bool {
        matches!(self, BlockKind::Bytes | BlockKind::String)
    }
}

/// A typed field within a `DataModel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    #[serde(flatten)]
    pub kind: BlockKind,
    /// Bytes for fixed types, bits for `bits`.
    #[serde(default)]
    pub size: Option<u32>,
    /// Only meaningful for variable `bytes`/`string`.
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub endian: Endian,
    #[serde(default)]
    pub bit_order: BitOrder,
    #[serde(default)]
    pub default: Option<Literal>,
    #[serde(default = "default_true")]
    pub mutable: bool,
    #[serde(default)]
    pub values: Option<BTreeMap<i64, String>>,

    #[serde(default)]
    pub is_size_field: bool,
    #[serde(default)]
    pub size_of: Option<SizeOf>,
    #[serde(default)]
    pub size_unit: SizeUnit,

    #[serde(default)]
    pub is_checksum: bool,
    #[serde(default)]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    #[serde(default)]
    pub checksum_over: Option<ChecksumOver>,

    #[serde(default)]
    pub behavior: Option<Behavior>,

    #[serde(default)]
    pub from_context: Option<String>,
}

fn default_true() -> bool {
    true
}

/// `size_of` can name a single field or an ordered list of fields whose
/// concatenated serialized length is tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeOf {
    Single(String),
    List(Vec<String>),
}

impl SizeOf {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            SizeOf::Single(s) => vec![s.as_str()],
            SizeOf::List(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl Block {
    /// Is this block eligible for selection by the structure-aware mutator?
    pub fn is_structurally_mutable(&self) -> bool {
        self.mutable
            && !self.is_size_field
            && !self.is_checksum
            && self.from_context.is_none()
    }
}

/// One entry in `response_handlers`: a match clause plus fields to set on
/// the next outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHandler {
    pub name: String,
    #[serde(rename = "match")]
    pub match_fields: BTreeMap<String, Literal>,
    pub set_fields: BTreeMap<String, SetField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetField {
    Literal(Literal),
    CopyFromResponse {
        copy_from_response: String,
        #[serde(default)]
        extract_bits: Option<ExtractBits>,
    },
}

/// Ordered sequence of fields plus optional response handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataModel {
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub response_model: Option<Box<DataModel>>,
    #[serde(default)]
    pub response_handlers: Vec<ResponseHandler>,
    #[serde(default)]
    pub seeds: Vec<Vec<u8>>,
}

impl DataModel {
    pub fn field(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    /// Validate §3 structural invariants. Called at plugin load time.
    pub fn validate(&self) -> Result<(), PluginError> {
        let mut seen = std::collections::HashSet::new();
        for b in &self.blocks {
            if !seen.insert(b.name.clone()) {
                return Err(PluginError::DuplicateField(b.name.clone()));
            }
        }
        for b in &self.blocks {
            if b.is_size_field {
                if let Some(size_of) = &b.size_of {
                    for target in size_of.fields() {
                        if self.field(target).is_none() {
                            return Err(PluginError::UnknownSizeOfTarget(
                                b.name.clone(),
                                target.to_string(),
                            ));
                        }
                    }
                }
            }
        }
        // Variable bytes/string must be last, or have a size field pointing at them.
        let has_size_field_for = |name: &str| {
            self.blocks.iter().any(|b| {
                b.is_size_field
                    && b.size_of
                        .as_ref()
                        .map(|s| s.fields().contains(&name))
                        .unwrap_or(false)
            })
        };
        let last_index = self.blocks.len().saturating_sub(1);
        for (i, b) in self.blocks.iter().enumerate() {
            if b.kind.is_variable_shape() && b.size.is_none() {
                if i != last_index && !has_size_field_for(&b.name) {
                    return Err(PluginError::UnboundedVariableField(b.name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Finite automaton over declared states and transitions between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateModel {
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub trigger: Option<String>,
    pub message_type: String,
    #[serde(default)]
    pub expected_response: Option<Vec<u8>>,
}

impl StateModel {
    pub fn validate(&self) -> Result<(), PluginError> {
        let states: std::collections::HashSet<&str> =
            self.states.iter().map(String::as_str).collect();
        if !states.contains(self.initial_state.as_str()) {
            return Err(PluginError::UnknownInitialState(self.initial_state.clone()));
        }
        for t in &self.transitions {
            if !states.contains(t.from.as_str()) {
                return Err(PluginError::UnknownState(t.from.clone()));
            }
            if !states.contains(t.to.as_str()) {
                return Err(PluginError::UnknownState(t.to.clone()));
            }
        }
        Ok(())
    }

    pub fn transitions_from(&self, state: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.from == state).collect()
    }
}

/// Transport kind for a connection spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub transport: Transport,
    #[serde(default)]
    pub persistent: bool,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatAction {
    Reconnect,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatOnFailure {
    pub action: HeartbeatAction,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSpec {
    pub interval: f64,
    #[serde(default)]
    pub jitter: f64,
    pub message: DataModel,
    #[serde(default)]
    pub expect_response: bool,
    pub on_failure: HeartbeatOnFailure,
}

/// One stage of the protocol stack, e.g. `bootstrap`, `fuzz_target`, `teardown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub plugin: StagePlugin,
}

/// Everything a stage can bind, per §4.10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StagePlugin {
    pub data_model: DataModel,
    #[serde(default)]
    pub state_model: Option<StateModel>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSpec>,
    #[serde(default)]
    pub exports: Exports,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStack {
    pub stages: Vec<Stage>,
}

/// Dotted-path export: context-key -> where to read it from the last parsed
/// response, and its intended type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub from_field: String,
    #[serde(rename = "type")]
    pub value_type: ExportType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    Bytes,
    U64,
    I64,
    Str,
    Bool,
}

pub type Exports = HashMap<String, ExportSpec>;

/// Top-level plugin record: a sum over optional capability blocks, as the
/// REDESIGN FLAGS note recommends over a class hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub data_model: DataModel,
    #[serde(default)]
    pub state_model: Option<StateModel>,
    #[serde(default)]
    pub protocol_stack: Option<ProtocolStack>,
    #[serde(default)]
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSpec>,
    #[serde(default)]
    pub exports: Exports,
    #[serde(default)]
    pub mutation: MutationConfig,
}

impl Plugin {
    /// Validate every structural invariant from §3 plus the Open Question
    /// decision on state-advancement detectability.
    pub fn validate(&self) -> Result<(), PluginError> {
        self.data_model.validate()?;
        if let Some(sm) = &self.state_model {
            sm.validate()?;
            if !sm.transitions.is_empty() {
                let has_signal = self.data_model.response_model.is_some()
                    || !self.data_model.response_handlers.is_empty()
                    || sm.transitions.iter().any(|t| t.expected_response.is_some());
                if !has_signal {
                    return Err(PluginError::NoAdvancementSignal);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint_block(name: &str, size: u32) -> Block {
        Block {
            name: name.to_string(),
            kind: BlockKind::Uint16,
            size: Some(size),
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
    fn rejects_duplicate_field_names() {
        let model = DataModel {
            blocks: vec![uint_block("a", 2), uint_block("a", 2)],
            ..Default::default()
        };
        assert!(matches!(model.validate(), Err(PluginError::DuplicateField(_))));
    }

    #[test]
    fn rejects_unbounded_variable_field_in_the_middle() {
        let mut payload = uint_block("payload", 0);
        payload.kind = BlockKind::Bytes;
        payload.size = None;
        let tail = uint_block("tail", 1);
        let model = DataModel {
            blocks: vec![payload, tail],
            ..Default::default()
        };
        assert!(matches!(
            model.validate(),
            Err(PluginError::UnboundedVariableField(_))
        ));
    }

    #[test]
    fn size_unit_words_is_four_bytes() {
        assert_eq!(SizeUnit::Words.bytes_per_unit(), Some(4));
        assert_eq!(SizeUnit::Dwords.bytes_per_unit(), Some(2));
    }

    #[test]
    fn state_model_rejects_unknown_transition_state() {
        let sm = StateModel {
            initial_state: "INIT".into(),
            states: vec!["INIT".into()],
            transitions: vec![Transition {
                from: "INIT".into(),
                to: "GHOST".into(),
                trigger: None,
                message_type: "x".into(),
                expected_response: None,
            }],
        };
        assert!(matches!(sm.validate(), Err(PluginError::UnknownState(_))));
    }
}
