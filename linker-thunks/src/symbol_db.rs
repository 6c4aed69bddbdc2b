//! The resolved symbol table that the thunk pass works against. Symbol resolution has already
//! happened: every symbol record points at its defining file and section, and every input
//! file carries a table mapping its local symbol indexes (`r_sym`) to global [`SymbolId`]s.

use crate::section::SectionRef;
use bitflags::bitflags;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u32);

impl FileId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(raw: usize) -> SymbolId {
        SymbolId(raw as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ValueFlags: u8 {
        /// Calls to the symbol go through its PLT entry rather than the definition.
        const PLT = 1 << 0;
    }
}

pub struct File {
    /// Position of the file on the link command line. Determines symbol order within a thunk.
    pub priority: i64,

    /// Local symbol index -> resolved global symbol.
    pub symbols: Vec<SymbolId>,
}

#[derive(Debug, Default)]
pub struct Symbol {
    /// The file that defines the symbol. `None` for undefined symbols, which never get thunk
    /// entries; the relocation-application phase reports them instead.
    pub file: Option<FileId>,

    /// Index of the symbol within its defining file's symbol table.
    pub sym_idx: u32,

    /// Offset of the symbol within its defining section. For ARM32 Thumb functions the low
    /// bit is set, as in `st_value`.
    pub value: i64,

    pub section: Option<SectionRef>,

    pub value_flags: ValueFlags,

    pub thunk_info: ThunkInfo,
}

impl Symbol {
    pub fn has_plt(&self) -> bool {
        self.value_flags.contains(ValueFlags::PLT)
    }
}

/// Which thunk currently carries the symbol, if any. Shared between the serial sweep and the
/// parallel relocation scanners. Every field has a single writer at any point in time, so
/// all accesses are `Relaxed`.
#[derive(Debug)]
pub struct ThunkInfo {
    thunk_idx: AtomicI64,
    thunk_sym_idx: AtomicI64,

    /// Claim word for parallel scanners racing to add the symbol to the thunk being built.
    /// 0 = unclaimed, -1 = claimed.
    flags: AtomicI32,
}

impl Default for ThunkInfo {
    fn default() -> ThunkInfo {
        ThunkInfo {
            thunk_idx: AtomicI64::new(-1),
            thunk_sym_idx: AtomicI64::new(-1),
            flags: AtomicI32::new(0),
        }
    }
}

impl ThunkInfo {
    pub fn thunk_idx(&self) -> i64 {
        self.thunk_idx.load(Relaxed)
    }

    pub fn thunk_sym_idx(&self) -> i64 {
        self.thunk_sym_idx.load(Relaxed)
    }

    /// Returns true exactly once between resets, designating the caller that pushes the
    /// symbol into the thunk.
    pub(crate) fn try_claim(&self) -> bool {
        self.flags.swap(-1, Relaxed) == 0
    }

    pub(crate) fn assign(&self, thunk_idx: i64, thunk_sym_idx: i64) {
        self.thunk_idx.store(thunk_idx, Relaxed);
        self.thunk_sym_idx.store(thunk_sym_idx, Relaxed);
    }

    pub(crate) fn clear(&self) {
        self.thunk_idx.store(-1, Relaxed);
        self.thunk_sym_idx.store(-1, Relaxed);
        self.flags.store(0, Relaxed);
    }
}

#[derive(Default)]
pub struct SymbolDb {
    files: Vec<File>,
    symbols: Vec<Symbol>,
}

impl SymbolDb {
    pub fn add_file(&mut self, priority: i64) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(File {
            priority,
            symbols: Vec::new(),
        });
        id
    }

    /// Registers `symbol` in `owner`'s local symbol table and returns its global id. The
    /// defining file recorded on the symbol itself may be a different file, or `None`.
    pub fn add_symbol(&mut self, owner: FileId, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        self.files[owner.as_usize()].symbols.push(id);
        id
    }

    pub fn file(&self, id: FileId) -> &File {
        &self.files[id.as_usize()]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }
}
