//! Relocatable assembly and two-pass address resolution
//!
//! An [`Assembly`] is an ordered item list plus nested sub-assemblies and
//! named data segments. [`Assembly::assemble`] resolves symbolic tags to
//! concrete offsets in two passes: pass one tentatively positions every
//! item assuming the widest supported address encoding, pass two re-encodes
//! with the tightest width that still covers the measured upper bound.
//! Rounding the width up from an over-estimate keeps the process stable:
//! re-assembling an assembled unit never grows it further.

use crate::backends::item::{byte_length, bytes_required, AssemblyItem, ItemKind};
use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use indexmap::IndexMap;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Write as _;
use tracing::debug;

/// Widest supported tag address encoding, in bytes
pub const MAX_ADDRESS_LENGTH: usize = 4;

/// Target machine variants
///
/// `Compact` re-encodes tag references with the tightest covering width;
/// `Wide` always uses the full four-byte encoding and keeps the
/// function-call jump annotations for subroutine-aware loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Machine {
    #[default]
    Compact,
    Wide,
}

/// A fully assembled bytecode object
#[derive(Debug, Clone, Default, Serialize)]
pub struct BytecodeObject {
    /// Final byte stream
    pub bytecode: Vec<u8>,
    /// Concrete offset of every local tag, indexed by tag id
    pub tag_positions: Vec<usize>,
    /// Start offset of each embedded sub-assembly
    pub sub_offsets: Vec<usize>,
    /// Name and start offset of each data segment
    pub data_offsets: Vec<(String, usize)>,
    /// Positions of library address placeholders awaiting linking
    pub unlinked_refs: Vec<(usize, String)>,
}

impl BytecodeObject {
    /// Bytecode as a lowercase hex string
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.bytecode.len() * 2);
        for byte in &self.bytecode {
            write!(out, "{:02x}", byte).expect("writing to string cannot fail");
        }
        out
    }
}

/// A relocatable item sequence under construction
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    items: Vec<AssemblyItem>,
    subs: Vec<Assembly>,
    data: IndexMap<String, Vec<u8>>,
    used_tags: usize,
    named_tags: IndexMap<String, usize>,
}

impl Assembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembly over a pre-lowered item list; tag allocation picks up
    /// after the highest local tag id mentioned in the items.
    pub fn from_items(items: Vec<AssemblyItem>) -> Self {
        let mut used_tags = 0;
        for item in &items {
            if let ItemKind::Tag(_) | ItemKind::PushTag(_) = item.kind() {
                if let Ok((None, tag)) = item.split_foreign_push_tag() {
                    used_tags = used_tags.max(tag + 1);
                }
            }
        }
        Self {
            items,
            used_tags,
            ..Self::default()
        }
    }

    /// Append an arbitrary item
    pub fn append(&mut self, item: AssemblyItem) {
        self.items.push(item);
    }

    /// Append a plain operation
    pub fn append_operation(&mut self, op: Opcode) {
        self.items.push(AssemblyItem::operation(op));
    }

    /// Append a literal push
    pub fn append_constant(&mut self, value: U256) {
        self.items.push(AssemblyItem::push(value));
    }

    /// Allocate a fresh tag; returns its definition item
    ///
    /// Append the returned item to place the label; use
    /// [`AssemblyItem::push_tag`] on it to reference the label.
    pub fn new_tag(&mut self) -> AssemblyItem {
        let tag = self.used_tags;
        self.used_tags += 1;
        AssemblyItem::new(ItemKind::Tag(U256::from(tag)))
    }

    /// Tag identified by name, allocated on first use
    pub fn named_tag(&mut self, name: &str) -> AssemblyItem {
        if let Some(tag) = self.named_tags.get(name) {
            return AssemblyItem::new(ItemKind::Tag(U256::from(*tag)));
        }
        let item = self.new_tag();
        let tag = self.used_tags - 1;
        self.named_tags.insert(name.to_string(), tag);
        item
    }

    /// Number of tags allocated so far
    pub fn tag_count(&self) -> usize {
        self.used_tags
    }

    /// Embed a sub-assembly; returns its id
    pub fn append_sub(&mut self, sub: Assembly) -> usize {
        self.subs.push(sub);
        self.subs.len() - 1
    }

    /// Add a named data segment; returns its id
    pub fn append_data(&mut self, name: &str, data: Vec<u8>) -> usize {
        self.data.insert(name.to_string(), data);
        self.data.get_index_of(name).expect("just inserted")
    }

    pub fn items(&self) -> &[AssemblyItem] {
        &self.items
    }

    pub fn subs(&self) -> &[Assembly] {
        &self.subs
    }

    /// Human-readable listing of items, sub-assemblies and data
    pub fn assembly_string(&self) -> String {
        let mut out = String::new();
        self.write_listing(&mut out, 0);
        out
    }

    fn write_listing(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        for item in &self.items {
            let _ = writeln!(out, "{}{}", indent, item);
        }
        for (id, sub) in self.subs.iter().enumerate() {
            let _ = writeln!(out, "{}sub_{}:", indent, id);
            sub.write_listing(out, depth + 1);
        }
        for (name, data) in &self.data {
            let mut hex = String::with_capacity(data.len() * 2);
            for byte in data {
                let _ = write!(hex, "{:02x}", byte);
            }
            let _ = writeln!(out, "{}data \"{}\" hex\"{}\"", indent, name, hex);
        }
    }

    /// Resolve all symbolic references and produce the final byte stream
    ///
    /// Pure with respect to stored state: may be invoked repeatedly for
    /// different target machines.
    pub fn assemble(&self, machine: Machine) -> Result<BytecodeObject> {
        // Sub-assemblies are self-contained; assemble them first so their
        // exact sizes feed the parent's size bound.
        let sub_objects: Vec<BytecodeObject> = self
            .subs
            .iter()
            .map(|sub| sub.assemble(machine))
            .collect::<Result<_>>()?;

        // Pass one: upper bound with the widest address encoding.
        let mut upper_bound = bytes_required(&self.items, MAX_ADDRESS_LENGTH);
        for object in &sub_objects {
            upper_bound += object.bytecode.len();
        }
        for data in self.data.values() {
            upper_bound += data.len();
        }

        let address_length = match machine {
            Machine::Wide => MAX_ADDRESS_LENGTH,
            Machine::Compact => byte_length(U256::from(upper_bound)).max(1),
        };
        if address_length > MAX_ADDRESS_LENGTH {
            return Err(CoreError::internal(format!(
                "assembly of {} bytes exceeds the addressable range",
                upper_bound
            )));
        }
        debug!(
            items = self.items.len(),
            upper_bound, address_length, "assembling"
        );

        // Pass two: emit with the chosen width, recording patch positions.
        let mut bytecode: Vec<u8> = Vec::with_capacity(upper_bound);
        let mut tag_positions = vec![usize::MAX; self.used_tags];
        let mut tag_refs: Vec<(usize, &AssemblyItem)> = Vec::new();
        let mut sub_refs: Vec<(usize, usize)> = Vec::new();
        let mut data_refs: Vec<(usize, usize)> = Vec::new();
        let mut size_refs: Vec<usize> = Vec::new();
        let mut unlinked_refs: Vec<(usize, String)> = Vec::new();

        for item in &self.items {
            match item.kind() {
                ItemKind::Operation(op) => {
                    if op.is_pseudo() {
                        return Err(CoreError::internal(format!(
                            "pseudo-op `{}` reached assembly",
                            op
                        )));
                    }
                    bytecode.push(*op as u8);
                }
                ItemKind::Push(value) => {
                    let encoded = to_compact_be(*value);
                    bytecode.push(Opcode::push(encoded.len()) as u8);
                    bytecode.extend_from_slice(&encoded);
                }
                ItemKind::PushTag(_) => {
                    bytecode.push(Opcode::push(address_length) as u8);
                    tag_refs.push((bytecode.len(), item));
                    bytecode.resize(bytecode.len() + address_length, 0);
                }
                ItemKind::Tag(_) => {
                    let (sub, tag) = item.split_foreign_push_tag()?;
                    if sub.is_some() {
                        return Err(CoreError::internal(
                            "definition of a foreign sub-assembly tag",
                        ));
                    }
                    let slot = tag_positions.get_mut(tag).ok_or_else(|| {
                        CoreError::internal(format!("definition of unallocated tag {}", tag))
                    })?;
                    if *slot != usize::MAX {
                        return Err(CoreError::internal(format!(
                            "tag {} defined twice",
                            tag
                        )));
                    }
                    *slot = bytecode.len();
                    if item.pushed_value().is_none() {
                        item.set_pushed_value(U256::from(bytecode.len()))?;
                    }
                    bytecode.push(Opcode::JumpDest as u8);
                }
                ItemKind::PushSub(id) => {
                    if *id >= sub_objects.len() {
                        return Err(CoreError::internal(format!(
                            "reference to unknown sub-assembly {}",
                            id
                        )));
                    }
                    bytecode.push(Opcode::push(address_length) as u8);
                    sub_refs.push((bytecode.len(), *id));
                    bytecode.resize(bytecode.len() + address_length, 0);
                }
                ItemKind::PushSubSize(id) => {
                    let size = sub_objects
                        .get(*id)
                        .map(|object| object.bytecode.len())
                        .ok_or_else(|| {
                            CoreError::internal(format!(
                                "size reference to unknown sub-assembly {}",
                                id
                            ))
                        })?;
                    bytecode.push(Opcode::push(4) as u8);
                    bytecode.extend_from_slice(&(size as u32).to_be_bytes());
                    if item.pushed_value().is_none() {
                        item.set_pushed_value(U256::from(size))?;
                    }
                }
                ItemKind::PushProgramSize => {
                    bytecode.push(Opcode::push(4) as u8);
                    size_refs.push(bytecode.len());
                    bytecode.resize(bytecode.len() + 4, 0);
                }
                ItemKind::PushData(id) => {
                    bytecode.push(Opcode::push(address_length) as u8);
                    data_refs.push((bytecode.len(), id.low_u64() as usize));
                    bytecode.resize(bytecode.len() + address_length, 0);
                }
                ItemKind::PushLibraryAddress(hash) => {
                    bytecode.push(Opcode::push(20) as u8);
                    unlinked_refs.push((bytecode.len(), format!("{:x}", hash)));
                    bytecode.resize(bytecode.len() + 20, 0);
                }
                ItemKind::PushDeployTimeAddress => {
                    bytecode.push(Opcode::push(20) as u8);
                    bytecode.resize(bytecode.len() + 20, 0);
                }
            }
        }

        // Embed sub-assemblies and data after the code.
        let mut sub_offsets = Vec::with_capacity(sub_objects.len());
        for object in &sub_objects {
            sub_offsets.push(bytecode.len());
            for (position, symbol) in &object.unlinked_refs {
                unlinked_refs.push((bytecode.len() + position, symbol.clone()));
            }
            bytecode.extend_from_slice(&object.bytecode);
        }
        let mut data_offsets = Vec::with_capacity(self.data.len());
        for (name, data) in &self.data {
            data_offsets.push((name.clone(), bytecode.len()));
            bytecode.extend_from_slice(data);
        }

        let total_size = bytecode.len();
        if byte_length(U256::from(total_size)) > address_length {
            return Err(CoreError::internal(
                "assembled size exceeds the chosen address width",
            ));
        }

        // Patch recorded references.
        for (position, item) in tag_refs {
            let (sub, tag) = item.split_foreign_push_tag()?;
            let target = match sub {
                None => *tag_positions.get(tag).ok_or_else(|| {
                    CoreError::internal(format!("reference to unallocated tag {}", tag))
                })?,
                Some(sub_id) => {
                    let object = sub_objects.get(sub_id).ok_or_else(|| {
                        CoreError::internal(format!(
                            "reference into unknown sub-assembly {}",
                            sub_id
                        ))
                    })?;
                    let inner = *object.tag_positions.get(tag).ok_or_else(|| {
                        CoreError::internal(format!(
                            "reference to unallocated tag {} in sub-assembly {}",
                            tag, sub_id
                        ))
                    })?;
                    if inner == usize::MAX {
                        return Err(CoreError::internal(format!(
                            "undefined but referenced tag {} in sub-assembly {}",
                            tag, sub_id
                        )));
                    }
                    sub_offsets[sub_id] + inner
                }
            };
            if target == usize::MAX {
                return Err(CoreError::internal(format!(
                    "undefined but referenced tag {}",
                    tag
                )));
            }
            write_be(&mut bytecode, position, address_length, target)?;
            if item.pushed_value().is_none() {
                item.set_pushed_value(U256::from(target))?;
            }
        }
        for (position, sub_id) in sub_refs {
            write_be(&mut bytecode, position, address_length, sub_offsets[sub_id])?;
        }
        for (position, data_id) in data_refs {
            let offset = data_offsets
                .get(data_id)
                .map(|(_, offset)| *offset)
                .ok_or_else(|| {
                    CoreError::internal(format!("reference to unknown data segment {}", data_id))
                })?;
            write_be(&mut bytecode, position, address_length, offset)?;
        }
        for position in size_refs {
            write_be(&mut bytecode, position, 4, total_size)?;
        }

        Ok(BytecodeObject {
            bytecode,
            tag_positions,
            sub_offsets,
            data_offsets,
            unlinked_refs,
        })
    }
}

/// Minimal big-endian encoding of a word, at least one byte
fn to_compact_be(value: U256) -> SmallVec<[u8; 32]> {
    let length = byte_length(value).max(1);
    let mut full = [0u8; 32];
    value.to_big_endian(&mut full);
    SmallVec::from_slice(&full[32 - length..])
}

/// Write `value` big-endian into `length` bytes at `position`
fn write_be(bytecode: &mut [u8], position: usize, length: usize, value: usize) -> Result<()> {
    if byte_length(U256::from(value)) > length {
        return Err(CoreError::internal(format!(
            "value {} does not fit into {} address bytes",
            value, length
        )));
    }
    for i in 0..length {
        bytecode[position + i] = ((value >> (8 * (length - i - 1))) & 0xff) as u8;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::item::JumpType;

    fn jump_to(assembly: &mut Assembly, tag: &AssemblyItem) {
        assembly.append(tag.push_tag().unwrap());
        assembly.append_operation(Opcode::Jump);
    }

    #[test]
    fn test_forward_reference_resolution() {
        let mut assembly = Assembly::new();
        let end = assembly.new_tag();
        jump_to(&mut assembly, &end);
        assembly.append_operation(Opcode::Trap);
        assembly.append(end.clone());
        assembly.append_operation(Opcode::Stop);

        let object = assembly.assemble(Machine::Compact).unwrap();
        // push1 target, jump, trap, jumpdest, stop
        assert_eq!(object.tag_positions, vec![4]);
        assert_eq!(object.bytecode[1], 4);
        assert_eq!(object.bytecode[4], Opcode::JumpDest as u8);
    }

    #[test]
    fn test_wide_machine_uses_fixed_width() {
        let mut assembly = Assembly::new();
        let end = assembly.new_tag();
        jump_to(&mut assembly, &end);
        assembly.append(end);
        let compact = assembly.assemble(Machine::Compact).unwrap();
        let wide = assembly.assemble(Machine::Wide).unwrap();
        assert!(wide.bytecode.len() > compact.bytecode.len());
        assert_eq!(wide.bytecode[0], Opcode::push(4) as u8);
    }

    #[test]
    fn test_undefined_tag_is_internal_error() {
        let mut assembly = Assembly::new();
        let tag = assembly.new_tag();
        assembly.append(tag.push_tag().unwrap());
        // tag definition never appended
        assert!(assembly.assemble(Machine::Compact).is_err());
    }

    #[test]
    fn test_sub_assembly_embedding() {
        let mut runtime = Assembly::new();
        runtime.append_operation(Opcode::Stop);
        let mut creation = Assembly::new();
        let id = creation.append_sub(runtime);
        creation.append(AssemblyItem::new(ItemKind::PushSubSize(id)));
        creation.append(AssemblyItem::new(ItemKind::PushSub(id)));
        creation.append_operation(Opcode::Stop);

        let object = creation.assemble(Machine::Compact).unwrap();
        assert_eq!(object.sub_offsets.len(), 1);
        let sub_offset = object.sub_offsets[0];
        assert_eq!(object.bytecode[sub_offset], Opcode::Stop as u8);
        // PushSubSize payload holds the sub's one-byte size
        assert_eq!(&object.bytecode[1..5], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_data_segment_offsets() {
        let mut assembly = Assembly::new();
        let id = assembly.append_data("table", vec![0xAA, 0xBB]);
        assembly.append(AssemblyItem::new(ItemKind::PushData(U256::from(id))));
        assembly.append_operation(Opcode::Stop);
        let object = assembly.assemble(Machine::Compact).unwrap();
        let (name, offset) = &object.data_offsets[0];
        assert_eq!(name, "table");
        assert_eq!(&object.bytecode[*offset..*offset + 2], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_reassembly_is_stable() {
        // Enough padding that positions straddle the one/two byte address
        // boundary: the width estimate must round up once and then stay put.
        let mut assembly = Assembly::new();
        let mut tags = Vec::new();
        for _ in 0..8 {
            let tag = assembly.new_tag();
            assembly.append(tag.push_tag().unwrap());
            tags.push(tag);
        }
        for _ in 0..120 {
            assembly.append_constant(U256::from(0xFFu64));
        }
        for tag in &tags {
            assembly.append(tag.clone());
        }
        let first = assembly.assemble(Machine::Compact).unwrap();
        let second = assembly.assemble(Machine::Compact).unwrap();
        assert_eq!(first.bytecode, second.bytecode);
        // All tag targets land beyond the one-byte range, so the two-byte
        // encoding must have been chosen up front.
        assert!(first.tag_positions.iter().all(|p| *p > 0xFF));
    }

    #[test]
    fn test_jump_annotation_survives_listing() {
        let mut assembly = Assembly::new();
        let fun = assembly.new_tag();
        assembly.append(fun.push_tag().unwrap());
        assembly.append(
            AssemblyItem::operation(Opcode::Jump).with_jump_type(JumpType::IntoFunction),
        );
        assembly.append(fun);
        let listing = assembly.assembly_string();
        assert!(listing.contains("jump\t[in]"));
    }
}
