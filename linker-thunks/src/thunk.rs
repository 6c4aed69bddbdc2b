use crate::arch::Arch;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;

/// Records where a call relocation was redirected: which thunk serves it and which entry
/// within that thunk. `(-1, -1)` means the relocation needed no redirection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThunkRef {
    pub thunk_idx: i64,
    pub sym_idx: i64,
}

impl ThunkRef {
    pub const NONE: ThunkRef = ThunkRef {
        thunk_idx: -1,
        sym_idx: -1,
    };
}

impl Default for ThunkRef {
    fn default() -> ThunkRef {
        ThunkRef::NONE
    }
}

/// A placed thunk: one address-materializing entry per symbol, in a deterministic order.
#[derive(derive_more::Debug, PartialEq, Eq)]
pub struct Thunk {
    pub thunk_idx: i64,

    #[debug("0x{offset:x}")]
    pub offset: i64,

    /// Sorted by `(file.priority, sym_idx)`. A symbol's `thunk_sym_idx` is its position here.
    pub symbols: Vec<SymbolId>,
}

impl Thunk {
    pub fn size<A: Arch>(&self) -> i64 {
        self.symbols.len() as i64 * A::THUNK_ENTRY_SIZE
    }

    /// Byte offset of entry `slot` within the output section, for the output phase that
    /// writes the entry instructions and for redirected branch targets.
    pub fn entry_offset<A: Arch>(&self, slot: usize) -> i64 {
        self.offset + slot as i64 * A::THUNK_ENTRY_SIZE
    }

    /// Forgets the thunk assignment of every symbol in the group so that later thunks can
    /// claim them afresh.
    pub(crate) fn reset(&self, symbol_db: &SymbolDb) {
        for &sym in &self.symbols {
            symbol_db.symbol(sym).thunk_info.clear();
        }
    }
}

#[test]
fn test_size_and_entry_offsets() {
    use crate::arch::AArch64;

    let thunk = Thunk {
        thunk_idx: 0,
        offset: 0x400,
        symbols: vec![SymbolId::from_usize(0), SymbolId::from_usize(1)],
    };
    assert_eq!(thunk.size::<AArch64>(), 24);
    assert_eq!(thunk.entry_offset::<AArch64>(0), 0x400);
    assert_eq!(thunk.entry_offset::<AArch64>(1), 0x40c);
}
