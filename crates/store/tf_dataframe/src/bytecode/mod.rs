//! The register-based instruction set the planner compiles queries into.
//!
//! Every instruction is a fixed-size record — a `u32` opcode plus six
//! packed `u32` arguments — so a program is a flat `Vec<Bytecode>` that
//! serializes by memcpy. The `(column type × operator)` templates are
//! flattened into a dense range of concrete opcodes so the variant for a
//! given combination is computed arithmetically; the enumeration is
//! append-only, existing opcodes are never renumbered (serialized plans
//! depend on it).

pub(crate) mod interpreter;
pub(crate) mod registers;

use tf_containers::Slab;

use crate::specs::{Op, StorageType};
use crate::types::{CastFilterValueResult, Range, Span};

use self::registers::Handle;

/// Defines the dense opcode enumeration. Order is load-bearing: group
/// offsets are computed from the first variant of each group.
macro_rules! define_opcodes {
    ($($name:ident,)+) => {
        #[repr(u32)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub(crate) enum Opcode {
            $($name,)+
        }

        const ALL_OPCODES: &[Opcode] = &[$(Opcode::$name,)+];

        impl Opcode {
            /// Total number of opcodes.
            #[cfg(test)]
            pub(crate) const COUNT: u32 = ALL_OPCODES.len() as u32;

            /// Decodes a raw opcode, e.g. from a deserialized plan.
            #[inline]
            pub(crate) fn try_from_u32(raw: u32) -> Option<Self> {
                ALL_OPCODES.get(raw as usize).copied()
            }

            /// Decodes a raw opcode known to be valid.
            #[inline]
            pub(crate) fn from_u32(raw: u32) -> Self {
                Self::try_from_u32(raw)
                    .unwrap_or_else(|| unreachable!("invalid opcode {raw}"))
            }

            pub(crate) fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)+
                }
            }
        }
    };
}

define_opcodes! {
    InitRange,
    AllocateIndices,
    Iota,
    CastFilterValueId,
    CastFilterValueUint32,
    CastFilterValueInt32,
    CastFilterValueInt64,
    CastFilterValueDouble,
    CastFilterValueString,
    SortedFilterIdEqualRange,
    SortedFilterIdLowerBound,
    SortedFilterIdUpperBound,
    SortedFilterUint32EqualRange,
    SortedFilterUint32LowerBound,
    SortedFilterUint32UpperBound,
    SortedFilterInt32EqualRange,
    SortedFilterInt32LowerBound,
    SortedFilterInt32UpperBound,
    SortedFilterInt64EqualRange,
    SortedFilterInt64LowerBound,
    SortedFilterInt64UpperBound,
    SortedFilterDoubleEqualRange,
    SortedFilterDoubleLowerBound,
    SortedFilterDoubleUpperBound,
    SortedFilterStringEqualRange,
    SortedFilterStringLowerBound,
    SortedFilterStringUpperBound,
    Uint32SetIdSortedEq,
    NonStringFilterIdEq,
    NonStringFilterIdNe,
    NonStringFilterIdLt,
    NonStringFilterIdLe,
    NonStringFilterIdGt,
    NonStringFilterIdGe,
    NonStringFilterUint32Eq,
    NonStringFilterUint32Ne,
    NonStringFilterUint32Lt,
    NonStringFilterUint32Le,
    NonStringFilterUint32Gt,
    NonStringFilterUint32Ge,
    NonStringFilterInt32Eq,
    NonStringFilterInt32Ne,
    NonStringFilterInt32Lt,
    NonStringFilterInt32Le,
    NonStringFilterInt32Gt,
    NonStringFilterInt32Ge,
    NonStringFilterInt64Eq,
    NonStringFilterInt64Ne,
    NonStringFilterInt64Lt,
    NonStringFilterInt64Le,
    NonStringFilterInt64Gt,
    NonStringFilterInt64Ge,
    NonStringFilterDoubleEq,
    NonStringFilterDoubleNe,
    NonStringFilterDoubleLt,
    NonStringFilterDoubleLe,
    NonStringFilterDoubleGt,
    NonStringFilterDoubleGe,
    StringFilterEq,
    StringFilterNe,
    StringFilterLt,
    StringFilterLe,
    StringFilterGt,
    StringFilterGe,
    StringFilterGlob,
    StringFilterRegex,
    NullFilterIsNotNull,
    NullFilterIsNull,
    StrideCopy,
    StrideTranslateAndCopySparseNullIndices,
    StrideCopyDenseNullIndices,
    PrefixPopcount,
    TranslateSparseNullIndices,
}

/// How a sorted filter narrows its range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SortedFilterMode {
    /// Narrow both ends to the equal-value sub-range.
    EqualRange,
    LowerBound,
    UpperBound,
}

impl SortedFilterMode {
    #[inline]
    fn index(self) -> u32 {
        match self {
            Self::EqualRange => 0,
            Self::LowerBound => 1,
            Self::UpperBound => 2,
        }
    }
}

/// Which end of the range a sorted filter writes its result to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BoundModifier {
    BothBounds,
    BeginBound,
    EndBound,
}

impl BoundModifier {
    #[inline]
    fn to_u32(self) -> u32 {
        match self {
            Self::BothBounds => 0,
            Self::BeginBound => 1,
            Self::EndBound => 2,
        }
    }

    #[inline]
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::BothBounds,
            1 => Self::BeginBound,
            2 => Self::EndBound,
            _ => unreachable!("invalid bound modifier {raw}"),
        }
    }
}

impl Opcode {
    /// `CastFilterValue` specialized for `ty`.
    #[inline]
    pub(crate) fn cast_filter_value(ty: StorageType) -> Self {
        Self::from_u32(Self::CastFilterValueId as u32 + ty.index())
    }

    /// `SortedFilter` specialized for `(ty, mode)`.
    #[inline]
    pub(crate) fn sorted_filter(ty: StorageType, mode: SortedFilterMode) -> Self {
        Self::from_u32(Self::SortedFilterIdEqualRange as u32 + ty.index() * 3 + mode.index())
    }

    /// `NonStringFilter` specialized for `(ty, op)`. `ty` must not be
    /// `String`; `op` must be a comparison.
    #[inline]
    pub(crate) fn non_string_filter(ty: StorageType, op: Op) -> Self {
        debug_assert!(!ty.is_string());
        Self::from_u32(Self::NonStringFilterIdEq as u32 + ty.index() * 6 + op.comparison_index())
    }

    /// `StringFilter` specialized for `op` (a comparison, `Glob`, or
    /// `Regex`).
    #[inline]
    pub(crate) fn string_filter(op: Op) -> Self {
        Self::from_u32(Self::StringFilterEq as u32 + op.string_index())
    }

    #[inline]
    pub(crate) fn null_filter(is_null: bool) -> Self {
        if is_null {
            Self::NullFilterIsNull
        } else {
            Self::NullFilterIsNotNull
        }
    }
}

/// Number of packed argument words per instruction.
const BYTECODE_ARGS: usize = 6;

/// One fixed-size instruction record.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct Bytecode {
    pub opcode: u32,
    pub args: [u32; BYTECODE_ARGS],
}

static_assertions::const_assert_eq!(std::mem::size_of::<Bytecode>(), 28);

impl Bytecode {
    fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode as u32,
            args: [0; BYTECODE_ARGS],
        }
    }
}

impl std::fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_bytecode(self))
    }
}

// --- Instruction shapes ---
//
// Each shape knows how to pack itself into the fixed record and back. The
// opcode is passed at encode time since several opcodes share a shape.

pub(crate) struct InitRange {
    pub size: u32,
    pub dest: Handle<Range>,
}

impl InitRange {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::InitRange);
        bc.args[0] = self.size;
        bc.args[1] = self.dest.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            size: bc.args[0],
            dest: Handle::new(bc.args[1]),
        }
    }
}

pub(crate) struct AllocateIndices {
    pub size: u32,
    pub dest_slab: Handle<Slab<u32>>,
    pub dest_span: Handle<Span>,
}

impl AllocateIndices {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::AllocateIndices);
        bc.args[0] = self.size;
        bc.args[1] = self.dest_slab.index;
        bc.args[2] = self.dest_span.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            size: bc.args[0],
            dest_slab: Handle::new(bc.args[1]),
            dest_span: Handle::new(bc.args[2]),
        }
    }
}

pub(crate) struct Iota {
    pub source: Handle<Range>,
    pub update: Handle<Span>,
}

impl Iota {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::Iota);
        bc.args[0] = self.source.index;
        bc.args[1] = self.update.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            source: Handle::new(bc.args[0]),
            update: Handle::new(bc.args[1]),
        }
    }
}

pub(crate) struct CastFilterValue {
    pub fval_handle: u32,
    pub dest: Handle<CastFilterValueResult>,
    pub op: Op,
}

impl CastFilterValue {
    pub fn encode(self, ty: StorageType) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::cast_filter_value(ty));
        bc.args[0] = self.fval_handle;
        bc.args[1] = self.dest.index;
        bc.args[2] = op_to_u32(self.op);
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            fval_handle: bc.args[0],
            dest: Handle::new(bc.args[1]),
            op: op_from_u32(bc.args[2]),
        }
    }
}

pub(crate) struct SortedFilter {
    pub col: u32,
    pub val: Handle<CastFilterValueResult>,
    pub update: Handle<Range>,
    pub write_result_to: BoundModifier,
}

impl SortedFilter {
    pub fn encode(self, ty: StorageType, mode: SortedFilterMode) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::sorted_filter(ty, mode));
        bc.args[0] = self.col;
        bc.args[1] = self.val.index;
        bc.args[2] = self.update.index;
        bc.args[3] = self.write_result_to.to_u32();
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            val: Handle::new(bc.args[1]),
            update: Handle::new(bc.args[2]),
            write_result_to: BoundModifier::from_u32(bc.args[3]),
        }
    }
}

pub(crate) struct Uint32SetIdSortedEq {
    pub col: u32,
    pub val: Handle<CastFilterValueResult>,
    pub update: Handle<Range>,
}

impl Uint32SetIdSortedEq {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::Uint32SetIdSortedEq);
        bc.args[0] = self.col;
        bc.args[1] = self.val.index;
        bc.args[2] = self.update.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            val: Handle::new(bc.args[1]),
            update: Handle::new(bc.args[2]),
        }
    }
}

/// Shared shape of `NonStringFilter` and `StringFilter`.
pub(crate) struct LinearFilter {
    pub col: u32,
    pub val: Handle<CastFilterValueResult>,
    pub source: Handle<Span>,
    pub update: Handle<Span>,
}

impl LinearFilter {
    pub fn encode(self, opcode: Opcode) -> Bytecode {
        let mut bc = Bytecode::new(opcode);
        bc.args[0] = self.col;
        bc.args[1] = self.val.index;
        bc.args[2] = self.source.index;
        bc.args[3] = self.update.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            val: Handle::new(bc.args[1]),
            source: Handle::new(bc.args[2]),
            update: Handle::new(bc.args[3]),
        }
    }
}

pub(crate) struct NullFilter {
    pub col: u32,
    pub update: Handle<Span>,
}

impl NullFilter {
    pub fn encode(self, is_null: bool) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::null_filter(is_null));
        bc.args[0] = self.col;
        bc.args[1] = self.update.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            update: Handle::new(bc.args[1]),
        }
    }
}

pub(crate) struct StrideCopy {
    pub source: Handle<Span>,
    pub update: Handle<Span>,
    pub stride: u32,
}

impl StrideCopy {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::StrideCopy);
        bc.args[0] = self.source.index;
        bc.args[1] = self.update.index;
        bc.args[2] = self.stride;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            source: Handle::new(bc.args[0]),
            update: Handle::new(bc.args[1]),
            stride: bc.args[2],
        }
    }
}

pub(crate) struct StrideTranslateAndCopySparseNullIndices {
    pub col: u32,
    pub popcount: Handle<Slab<u32>>,
    pub update: Handle<Span>,
    pub offset: u32,
    pub stride: u32,
}

impl StrideTranslateAndCopySparseNullIndices {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::StrideTranslateAndCopySparseNullIndices);
        bc.args[0] = self.col;
        bc.args[1] = self.popcount.index;
        bc.args[2] = self.update.index;
        bc.args[3] = self.offset;
        bc.args[4] = self.stride;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            popcount: Handle::new(bc.args[1]),
            update: Handle::new(bc.args[2]),
            offset: bc.args[3],
            stride: bc.args[4],
        }
    }
}

pub(crate) struct StrideCopyDenseNullIndices {
    pub col: u32,
    pub update: Handle<Span>,
    pub offset: u32,
    pub stride: u32,
}

impl StrideCopyDenseNullIndices {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::StrideCopyDenseNullIndices);
        bc.args[0] = self.col;
        bc.args[1] = self.update.index;
        bc.args[2] = self.offset;
        bc.args[3] = self.stride;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            update: Handle::new(bc.args[1]),
            offset: bc.args[2],
            stride: bc.args[3],
        }
    }
}

pub(crate) struct PrefixPopcount {
    pub col: u32,
    pub dest: Handle<Slab<u32>>,
}

impl PrefixPopcount {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::PrefixPopcount);
        bc.args[0] = self.col;
        bc.args[1] = self.dest.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            dest: Handle::new(bc.args[1]),
        }
    }
}

pub(crate) struct TranslateSparseNullIndices {
    pub col: u32,
    pub popcount: Handle<Slab<u32>>,
    pub source: Handle<Span>,
    pub update: Handle<Span>,
}

impl TranslateSparseNullIndices {
    pub fn encode(self) -> Bytecode {
        let mut bc = Bytecode::new(Opcode::TranslateSparseNullIndices);
        bc.args[0] = self.col;
        bc.args[1] = self.popcount.index;
        bc.args[2] = self.source.index;
        bc.args[3] = self.update.index;
        bc
    }

    pub fn decode(bc: &Bytecode) -> Self {
        Self {
            col: bc.args[0],
            popcount: Handle::new(bc.args[1]),
            source: Handle::new(bc.args[2]),
            update: Handle::new(bc.args[3]),
        }
    }
}

fn op_to_u32(op: Op) -> u32 {
    match op {
        Op::Eq => 0,
        Op::Ne => 1,
        Op::Lt => 2,
        Op::Le => 3,
        Op::Gt => 4,
        Op::Ge => 5,
        Op::IsNull => 6,
        Op::IsNotNull => 7,
        Op::Glob => 8,
        Op::Regex => 9,
    }
}

fn op_from_u32(raw: u32) -> Op {
    match raw {
        0 => Op::Eq,
        1 => Op::Ne,
        2 => Op::Lt,
        3 => Op::Le,
        4 => Op::Gt,
        5 => Op::Ge,
        6 => Op::IsNull,
        7 => Op::IsNotNull,
        8 => Op::Glob,
        9 => Op::Regex,
        _ => unreachable!("invalid op encoding {raw}"),
    }
}

/// Human-readable rendering of one instruction, e.g.
/// `InitRange: [size=5, dest_register=Register(0)]`.
pub(crate) fn format_bytecode(bc: &Bytecode) -> String {
    use Opcode as O;
    let opcode = Opcode::from_u32(bc.opcode);
    let name = opcode.name();
    let args = match opcode {
        O::InitRange => {
            let a = InitRange::decode(bc);
            format!("size={}, dest_register={:?}", a.size, a.dest)
        }
        O::AllocateIndices => {
            let a = AllocateIndices::decode(bc);
            format!(
                "size={}, dest_slab_register={:?}, dest_span_register={:?}",
                a.size, a.dest_slab, a.dest_span
            )
        }
        O::Iota => {
            let a = Iota::decode(bc);
            format!(
                "source_register={:?}, update_register={:?}",
                a.source, a.update
            )
        }
        O::CastFilterValueId
        | O::CastFilterValueUint32
        | O::CastFilterValueInt32
        | O::CastFilterValueInt64
        | O::CastFilterValueDouble
        | O::CastFilterValueString => {
            let a = CastFilterValue::decode(bc);
            format!(
                "fval_handle={}, write_register={:?}, op={:?}",
                a.fval_handle, a.dest, a.op
            )
        }
        O::Uint32SetIdSortedEq => {
            let a = Uint32SetIdSortedEq::decode(bc);
            format!(
                "col={}, val_register={:?}, update_register={:?}",
                a.col, a.val, a.update
            )
        }
        O::NullFilterIsNotNull | O::NullFilterIsNull => {
            let a = NullFilter::decode(bc);
            format!("col={}, update_register={:?}", a.col, a.update)
        }
        O::StrideCopy => {
            let a = StrideCopy::decode(bc);
            format!(
                "source_register={:?}, update_register={:?}, stride={}",
                a.source, a.update, a.stride
            )
        }
        O::StrideTranslateAndCopySparseNullIndices => {
            let a = StrideTranslateAndCopySparseNullIndices::decode(bc);
            format!(
                "col={}, popcount_register={:?}, update_register={:?}, offset={}, stride={}",
                a.col, a.popcount, a.update, a.offset, a.stride
            )
        }
        O::StrideCopyDenseNullIndices => {
            let a = StrideCopyDenseNullIndices::decode(bc);
            format!(
                "col={}, update_register={:?}, offset={}, stride={}",
                a.col, a.update, a.offset, a.stride
            )
        }
        O::PrefixPopcount => {
            let a = PrefixPopcount::decode(bc);
            format!("col={}, dest_register={:?}", a.col, a.dest)
        }
        O::TranslateSparseNullIndices => {
            let a = TranslateSparseNullIndices::decode(bc);
            format!(
                "col={}, popcount_register={:?}, source_register={:?}, update_register={:?}",
                a.col, a.popcount, a.source, a.update
            )
        }
        _ if (O::SortedFilterIdEqualRange as u32..=O::SortedFilterStringUpperBound as u32)
            .contains(&bc.opcode) =>
        {
            let a = SortedFilter::decode(bc);
            format!(
                "col={}, val_register={:?}, update_register={:?}, write_result_to={:?}",
                a.col, a.val, a.update, a.write_result_to
            )
        }
        _ => {
            // Linear filters (NonStringFilter*, StringFilter*).
            let a = LinearFilter::decode(bc);
            format!(
                "col={}, val_register={:?}, source_register={:?}, update_register={:?}",
                a.col, a.val, a.source, a.update
            )
        }
    };
    format!("{name}: [{args}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_count_is_stable() {
        // 3 structural + 6 casts + 18 sorted + 1 setid + 30 non-string + 8
        // string + 2 null + 5 output/translate.
        assert_eq!(Opcode::COUNT, 73);
        assert_eq!(Opcode::try_from_u32(72), Some(Opcode::TranslateSparseNullIndices));
        assert_eq!(Opcode::try_from_u32(73), None);
    }

    #[test]
    fn arithmetic_opcode_construction() {
        assert_eq!(
            Opcode::cast_filter_value(StorageType::Id),
            Opcode::CastFilterValueId
        );
        assert_eq!(
            Opcode::cast_filter_value(StorageType::String),
            Opcode::CastFilterValueString
        );
        assert_eq!(
            Opcode::sorted_filter(StorageType::Int64, SortedFilterMode::UpperBound),
            Opcode::SortedFilterInt64UpperBound
        );
        assert_eq!(
            Opcode::non_string_filter(StorageType::Double, Op::Gt),
            Opcode::NonStringFilterDoubleGt
        );
        assert_eq!(Opcode::string_filter(Op::Glob), Opcode::StringFilterGlob);
        assert_eq!(Opcode::null_filter(true), Opcode::NullFilterIsNull);
    }

    #[test]
    fn encode_decode_round_trip() {
        let bc = SortedFilter {
            col: 3,
            val: Handle::new(7),
            update: Handle::new(0),
            write_result_to: BoundModifier::EndBound,
        }
        .encode(StorageType::Double, SortedFilterMode::LowerBound);
        assert_eq!(
            Opcode::from_u32(bc.opcode),
            Opcode::SortedFilterDoubleLowerBound
        );
        let decoded = SortedFilter::decode(&bc);
        assert_eq!(decoded.col, 3);
        assert_eq!(decoded.val.index, 7);
        assert_eq!(decoded.update.index, 0);
        assert_eq!(decoded.write_result_to, BoundModifier::EndBound);
    }

    #[test]
    fn formatting() {
        let bc = InitRange {
            size: 5,
            dest: Handle::new(0),
        }
        .encode();
        assert_eq!(format_bytecode(&bc), "InitRange: [size=5, dest_register=Register(0)]");
    }
}
