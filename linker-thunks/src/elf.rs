/// A relocation record with an explicit addend. For REL-style inputs (ARM32), the addend has
/// already been extracted from the instruction bytes by the time this pass runs.
#[derive(Clone, Copy, Debug)]
pub struct Rela {
    pub r_type: u32,
    pub r_sym: u32,
    pub r_offset: i64,
    pub r_addend: i64,
}
