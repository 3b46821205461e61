//! Assembly item model
//!
//! One lowered instruction, pushed constant or symbolic reference. Items
//! are value types: equality and ordering look at `(kind, data)` only, so
//! deduplication and common-subexpression passes can compare items without
//! being confused by source locations or cached values.

use crate::backends::opcode::Opcode;
use crate::error::{CoreError, Result};
use crate::util::span::Span;
use once_cell::unsync::OnceCell;
use primitive_types::U256;
use std::cmp::Ordering;
use std::fmt;

/// Control-flow classification of a jump item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JumpType {
    #[default]
    Ordinary,
    IntoFunction,
    OutOfFunction,
}

impl JumpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JumpType::Ordinary => "",
            JumpType::IntoFunction => "[in]",
            JumpType::OutOfFunction => "[out]",
        }
    }
}

/// Item payload variants
///
/// Tag payloads pack `(subassembly_id, local_tag_id)` into one word:
/// `(sub + 1) << 64 | tag`, zero high bits meaning "not foreign".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemKind {
    /// Plain machine operation
    Operation(Opcode),
    /// Push of a literal word
    Push(U256),
    /// Push of a symbolic jump target address
    PushTag(U256),
    /// Definition of a jump target (lowered to a jumpdest)
    Tag(U256),
    /// Push of a sub-assembly's start offset
    PushSub(usize),
    /// Push of a sub-assembly's byte size
    PushSubSize(usize),
    /// Push of the total program size
    PushProgramSize,
    /// Push of a named data segment's offset
    PushData(U256),
    /// Push of a not-yet-known library address
    PushLibraryAddress(U256),
    /// Push of an address patched at deploy time
    PushDeployTimeAddress,
}

/// One bytecode item
#[derive(Debug, Clone)]
pub struct AssemblyItem {
    kind: ItemKind,
    span: Option<Span>,
    jump_type: JumpType,
    /// Value cache filled by the assembler during final encoding.
    /// The single permitted post-construction mutation.
    pushed_value: OnceCell<U256>,
}

impl AssemblyItem {
    /// New item of the given kind
    pub fn new(kind: ItemKind) -> Self {
        Self {
            kind,
            span: None,
            jump_type: JumpType::Ordinary,
            pushed_value: OnceCell::new(),
        }
    }

    /// Plain operation item
    pub fn operation(op: Opcode) -> Self {
        Self::new(ItemKind::Operation(op))
    }

    /// Literal push item
    pub fn push(value: U256) -> Self {
        Self::new(ItemKind::Push(value))
    }

    /// Attach a source location
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Attach a jump classification
    pub fn with_jump_type(mut self, jump_type: JumpType) -> Self {
        self.jump_type = jump_type;
        self
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }

    pub fn jump_type(&self) -> JumpType {
        self.jump_type
    }

    pub fn set_jump_type(&mut self, jump_type: JumpType) {
        self.jump_type = jump_type;
    }

    /// Raw payload word of a non-operation item
    pub fn data(&self) -> Result<U256> {
        match self.kind() {
            ItemKind::Operation(_) => Err(CoreError::internal("data() called on operation item")),
            ItemKind::Push(value)
            | ItemKind::PushTag(value)
            | ItemKind::Tag(value)
            | ItemKind::PushData(value)
            | ItemKind::PushLibraryAddress(value) => Ok(*value),
            ItemKind::PushSub(id) | ItemKind::PushSubSize(id) => Ok(U256::from(*id)),
            ItemKind::PushProgramSize | ItemKind::PushDeployTimeAddress => Ok(U256::zero()),
        }
    }

    /// Convert a tag-class item into a label definition
    pub fn tag(&self) -> Result<AssemblyItem> {
        match self.kind() {
            ItemKind::PushTag(data) | ItemKind::Tag(data) => {
                Ok(AssemblyItem::new(ItemKind::Tag(*data)))
            }
            _ => Err(CoreError::internal("tag() called on non-tag item")),
        }
    }

    /// Convert a tag-class item into a label reference
    pub fn push_tag(&self) -> Result<AssemblyItem> {
        match self.kind() {
            ItemKind::PushTag(data) | ItemKind::Tag(data) => {
                Ok(AssemblyItem::new(ItemKind::PushTag(*data)))
            }
            _ => Err(CoreError::internal("push_tag() called on non-tag item")),
        }
    }

    /// Rewrite a local tag for use from an enclosing assembly
    pub fn to_sub_assembly_tag(&self, sub_id: usize) -> Result<AssemblyItem> {
        let data = match self.kind() {
            ItemKind::PushTag(data) | ItemKind::Tag(data) => *data,
            _ => {
                return Err(CoreError::internal(
                    "to_sub_assembly_tag() called on non-tag item",
                ));
            }
        };
        if data >= (U256::one() << 64) {
            return Err(CoreError::internal("tag already has a subassembly set"));
        }
        let packed = (U256::from(sub_id as u64) + U256::one()) << 64 | data;
        let mut item = self.clone();
        item.kind = ItemKind::PushTag(packed);
        item.pushed_value = OnceCell::new();
        Ok(item)
    }

    /// Split a tag payload into `(subassembly_id, local_tag_id)`
    ///
    /// The subassembly id of non-foreign tags is `None`.
    pub fn split_foreign_push_tag(&self) -> Result<(Option<usize>, usize)> {
        let data = match self.kind() {
            ItemKind::PushTag(data) | ItemKind::Tag(data) => *data,
            _ => {
                return Err(CoreError::internal(
                    "split_foreign_push_tag() called on non-tag item",
                ));
            }
        };
        let sub = (data >> 64).low_u64();
        let tag = data.low_u64() as usize;
        if sub == 0 {
            Ok((None, tag))
        } else {
            Ok((Some((sub - 1) as usize), tag))
        }
    }

    /// Upper bound on the encoded byte size of this item, assuming jump
    /// tag references take `address_length` bytes
    pub fn bytes_required(&self, address_length: usize) -> usize {
        match self.kind() {
            // tags cost one byte for the jumpdest
            ItemKind::Operation(_) | ItemKind::Tag(_) => 1,
            ItemKind::Push(value) => 1 + byte_length(*value).max(1),
            ItemKind::PushSubSize(_) | ItemKind::PushProgramSize => 1 + 4,
            ItemKind::PushTag(_) | ItemKind::PushSub(_) | ItemKind::PushData(_) => {
                1 + address_length
            }
            ItemKind::PushLibraryAddress(_) | ItemKind::PushDeployTimeAddress => 1 + 20,
        }
    }

    /// Stack items this item consumes
    pub fn arguments(&self) -> usize {
        match self.kind() {
            ItemKind::Operation(op) => op.info().args,
            _ => 0,
        }
    }

    /// Stack items this item produces
    pub fn return_values(&self) -> usize {
        match self.kind() {
            ItemKind::Operation(op) => op.info().rets,
            ItemKind::Tag(_) => 0,
            _ => 1,
        }
    }

    /// Net stack height effect
    pub fn deposit(&self) -> i32 {
        self.return_values() as i32 - self.arguments() as i32
    }

    /// True if this item can appear inside a functional expression
    pub fn can_be_functional(&self) -> bool {
        if self.jump_type != JumpType::Ordinary {
            return false;
        }
        match self.kind() {
            ItemKind::Operation(op) => !op.is_dup() && !op.is_swap(),
            ItemKind::Tag(_) => false,
            _ => true,
        }
    }

    /// Cached value resolved during assembly, if already set
    pub fn pushed_value(&self) -> Option<&U256> {
        self.pushed_value.get()
    }

    /// Record the resolved value; may be called at most once
    pub fn set_pushed_value(&self, value: U256) -> Result<()> {
        self.pushed_value
            .set(value)
            .map_err(|_| CoreError::internal("pushed value set twice on one item"))
    }
}

/// Minimal number of bytes needed to encode a word
pub fn byte_length(value: U256) -> usize {
    (value.bits() + 7) / 8
}

/// Total upper-bound encoded size of an item sequence
pub fn bytes_required(items: &[AssemblyItem], address_length: usize) -> usize {
    items
        .iter()
        .map(|item| item.bytes_required(address_length))
        .sum()
}

impl PartialEq for AssemblyItem {
    fn eq(&self, other: &Self) -> bool {
        // location, jump type and cache are not part of item identity
        self.kind() == other.kind()
    }
}

impl Eq for AssemblyItem {}

impl PartialOrd for AssemblyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AssemblyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind().cmp(other.kind())
    }
}

impl std::hash::Hash for AssemblyItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
    }
}

impl fmt::Display for AssemblyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ItemKind::Operation(op) => {
                write!(f, "{}", op)?;
                if matches!(op, Opcode::Jump | Opcode::JumpI)
                    && self.jump_type != JumpType::Ordinary
                {
                    write!(f, "\t{}", self.jump_type.as_str())?;
                }
                Ok(())
            }
            ItemKind::Push(value) => write!(f, "0x{:x}", value),
            ItemKind::PushTag(_) => {
                let (sub, tag) = self
                    .split_foreign_push_tag()
                    .expect("push tag item splits");
                match sub {
                    None => write!(f, "tag_{}", tag),
                    Some(sub) => write!(f, "tag_{}_{}", sub, tag),
                }
            }
            ItemKind::Tag(data) => write!(f, "tag_{}:", data.low_u64()),
            ItemKind::PushSub(id) => write!(f, "dataOffset(sub_{})", id),
            ItemKind::PushSubSize(id) => write!(f, "dataSize(sub_{})", id),
            ItemKind::PushProgramSize => write!(f, "bytecodeSize"),
            ItemKind::PushData(id) => write!(f, "data_{:x}", id),
            ItemKind::PushLibraryAddress(hash) => write!(f, "linkerSymbol(\"{:x}\")", hash),
            ItemKind::PushDeployTimeAddress => write!(f, "deployTimeAddress()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tag_push_tag_round_trip() {
        let tag = AssemblyItem::new(ItemKind::Tag(U256::from(7)));
        assert_eq!(tag.push_tag().unwrap().tag().unwrap(), tag);
        let reference = AssemblyItem::new(ItemKind::PushTag(U256::from(7)));
        assert_eq!(reference.tag().unwrap().push_tag().unwrap(), reference);
    }

    #[test]
    fn test_tag_conversion_rejects_non_tags() {
        let item = AssemblyItem::push(U256::from(1));
        assert!(item.tag().is_err());
        assert!(item.push_tag().is_err());
        assert!(item.split_foreign_push_tag().is_err());
    }

    #[test]
    fn test_foreign_tag_split() {
        let local = AssemblyItem::new(ItemKind::Tag(U256::from(3)));
        assert_eq!(local.split_foreign_push_tag().unwrap(), (None, 3));
        let foreign = local.to_sub_assembly_tag(2).unwrap();
        assert_eq!(foreign.split_foreign_push_tag().unwrap(), (Some(2), 3));
    }

    #[test]
    fn test_double_foreign_rejected() {
        let foreign = AssemblyItem::new(ItemKind::Tag(U256::from(1)))
            .to_sub_assembly_tag(0)
            .unwrap();
        assert!(foreign.to_sub_assembly_tag(1).is_err());
    }

    #[test]
    fn test_bytes_required() {
        assert_eq!(AssemblyItem::operation(Opcode::Add).bytes_required(4), 1);
        assert_eq!(AssemblyItem::push(U256::zero()).bytes_required(4), 2);
        assert_eq!(AssemblyItem::push(U256::from(0x1234)).bytes_required(4), 3);
        assert_eq!(
            AssemblyItem::new(ItemKind::PushTag(U256::from(1))).bytes_required(4),
            5
        );
        assert_eq!(
            AssemblyItem::new(ItemKind::PushSubSize(0)).bytes_required(2),
            5
        );
    }

    #[test]
    fn test_deposit() {
        assert_eq!(AssemblyItem::operation(Opcode::Add).deposit(), -1);
        assert_eq!(AssemblyItem::operation(Opcode::MStore).deposit(), -2);
        assert_eq!(AssemblyItem::push(U256::from(1)).deposit(), 1);
        assert_eq!(AssemblyItem::new(ItemKind::Tag(U256::from(1))).deposit(), 0);
    }

    #[test]
    fn test_equality_ignores_location_and_cache() {
        let span = crate::util::span::Span::new(
            crate::util::span::Position::new(1, 1, 0),
            crate::util::span::Position::new(1, 2, 1),
        );
        let plain = AssemblyItem::push(U256::from(5));
        let located = AssemblyItem::push(U256::from(5)).with_span(span);
        located.set_pushed_value(U256::from(5)).unwrap();
        assert_eq!(plain, located);
    }

    #[test]
    fn test_pushed_value_single_writer() {
        let item = AssemblyItem::new(ItemKind::PushTag(U256::from(1)));
        item.set_pushed_value(U256::from(10)).unwrap();
        assert_eq!(item.pushed_value(), Some(&U256::from(10)));
        assert!(item.set_pushed_value(U256::from(11)).is_err());
    }

    proptest! {
        #[test]
        fn prop_tag_round_trip(tag in 0u64..u64::MAX) {
            let item = AssemblyItem::new(ItemKind::Tag(U256::from(tag)));
            prop_assert_eq!(item.push_tag().unwrap().tag().unwrap(), item.clone());
            prop_assert_eq!(item.tag().unwrap(), item);
        }

        #[test]
        fn prop_sub_assembly_tag_split(sub in 0usize..1_000_000, tag in 0u64..u64::MAX) {
            let item = AssemblyItem::new(ItemKind::Tag(U256::from(tag)));
            let foreign = item.to_sub_assembly_tag(sub).unwrap();
            prop_assert_eq!(
                foreign.split_foreign_push_tag().unwrap(),
                (Some(sub), tag as usize)
            );
        }
    }
}
