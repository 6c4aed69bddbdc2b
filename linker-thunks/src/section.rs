use crate::alignment::Alignment;
use crate::elf::Rela;
use crate::symbol_db::FileId;
use crate::thunk::Thunk;
use crate::thunk::ThunkRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSectionId(u32);

impl OutputSectionId {
    pub fn new(raw: u32) -> OutputSectionId {
        OutputSectionId(raw)
    }
}

/// Names an input section by its position within an output section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionRef {
    pub output_section: OutputSectionId,
    pub member: u32,
}

#[derive(Debug)]
pub struct InputSection {
    pub file: FileId,

    pub alignment: Alignment,

    pub sh_size: u64,

    /// Byte position within the output section. -1 until the layout sweep places the section.
    pub offset: i64,

    rels: Vec<Rela>,
}

impl InputSection {
    pub fn new(file: FileId, alignment: Alignment, sh_size: u64, rels: Vec<Rela>) -> InputSection {
        InputSection {
            file,
            alignment,
            sh_size,
            offset: -1,
            rels,
        }
    }

    pub fn rels(&self) -> &[Rela] {
        &self.rels
    }
}

/// A contiguous region of the output image: an ordered run of input sections with thunks
/// interleaved between them.
pub struct OutputSection {
    pub id: OutputSectionId,

    pub members: Vec<InputSection>,

    /// Thunks in placement order. `Thunk::thunk_idx` equals the position here.
    pub thunks: Vec<Thunk>,

    /// Per-member redirection table, parallel to `members`: one entry per relocation of that
    /// member, filled in by the layout sweep and consumed when relocations are applied.
    pub thunk_refs: Vec<Vec<ThunkRef>>,

    pub sh_size: u64,
}

impl OutputSection {
    pub fn new(id: OutputSectionId, members: Vec<InputSection>) -> OutputSection {
        let num_members = members.len();
        OutputSection {
            id,
            members,
            thunks: Vec::new(),
            thunk_refs: vec![Vec::new(); num_members],
            sh_size: 0,
        }
    }
}
