//! Lays out the members of one output section and creates range-extension thunks between
//! them, so that every call relocation has a target within reach of its branch immediate by
//! the time relocations are applied. Section offsets and thunk positions are assigned in a
//! single forward sweep; out-of-reach calls are redirected into the nearest thunk that
//! carries an entry for their symbol.

use crate::arch::Arch;
use crate::elf::Rela;
use crate::error::Result;
use crate::section::InputSection;
use crate::section::OutputSection;
use crate::section::OutputSectionId;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::thunk::Thunk;
use crate::thunk::ThunkRef;
use anyhow::ensure;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::Mutex;

#[cfg(test)]
use crate::alignment::Alignment;
#[cfg(test)]
use crate::symbol_db::FileId;

/// Upper bound on the size of a single thunk. A batch spans `BATCH_SIZE` bytes of code and
/// can't reference more distinct symbols than fit in this envelope, which the section
/// placement below always reserves room for.
pub const MAX_THUNK_SIZE: i64 = 102400;

pub fn create_range_extension_thunks<A: Arch>(
    symbol_db: &SymbolDb,
    osec: &mut OutputSection,
) -> Result {
    let OutputSection {
        id,
        members,
        thunks,
        thunk_refs,
        sh_size,
    } = osec;
    let osec_id = *id;

    if members.is_empty() {
        return Ok(());
    }

    tracing::debug!(arch = ?A::KIND, members = members.len(), "create range extension thunks");

    // Give the first member its final position and mark the rest unplaced, so that placed
    // and unplaced sections can be told apart while scanning.
    members[0].offset = 0;
    members[1..].par_iter_mut().for_each(|m| m.offset = -1);

    // Progress is tracked with four cursors into `members` plus one into `thunks`, all
    // non-decreasing, with a <= b <= c <= d:
    //   a: oldest thunk that pending relocations may still reach
    //   b: first section not yet served by a thunk
    //   c: end of the batch currently being served
    //   d: first section without even a tentative offset
    let mut a = 0;
    let mut b = 0;
    let mut d = 0;
    let mut offset: i64 = 0;

    while b < members.len() {
        // Place sections while a branch from B can still reach past them into a worst-case
        // thunk that would follow.
        while d < members.len() {
            let aligned = members[d].alignment.align_up(offset);
            if aligned + members[d].sh_size as i64 + MAX_THUNK_SIZE
                >= members[b].offset + A::MAX_DISTANCE
            {
                break;
            }
            offset = aligned;
            members[d].offset = offset;
            offset += members[d].sh_size as i64;
            d += 1;
        }

        // The batch is at least one section (so that we always make progress) and at most
        // BATCH_SIZE bytes.
        let mut c = b + 1;
        while c < members.len()
            && members[c].offset + (members[c].sh_size as i64) < members[b].offset + A::BATCH_SIZE
        {
            c += 1;
        }

        // Retire thunks that nothing at or after C can reach any more. Their symbols become
        // claimable again for later thunks.
        let c_offset = if c == members.len() {
            offset
        } else {
            members[c].offset
        };
        while a < thunks.len() && thunks[a].offset + A::MAX_DISTANCE < c_offset {
            thunks[a].reset(symbol_db);
            a += 1;
        }

        // The thunk serving this batch goes after everything placed so far.
        let thunk_idx = thunks.len() as i64;
        offset = A::THUNK_ALIGNMENT.align_up(offset);
        let thunk_offset = offset;

        // First scan: collect the symbols that out-of-reach relocations in the batch refer
        // to. The entry index within the thunk isn't known until the group is sorted, so
        // relocations routed to this thunk record a slot of -1 for now.
        let pending = Mutex::new(Vec::new());
        {
            let members: &[InputSection] = &*members;
            thunk_refs[b..c]
                .par_iter_mut()
                .zip(&members[b..c])
                .for_each(|(refs, isec)| {
                    scan_relocations::<A>(
                        symbol_db, osec_id, members, isec, refs, thunk_idx, &pending,
                    );
                });
        }

        // Sort the claimed symbols so that the result doesn't depend on scan scheduling,
        // then hand each its entry.
        let mut symbols: Vec<SymbolId> = pending.into_inner().unwrap();
        symbols.sort_unstable_by_key(|&sym_id| {
            let sym = symbol_db.symbol(sym_id);
            let file = sym.file.expect("claimed symbols are always defined");
            (symbol_db.file(file).priority, sym.sym_idx)
        });
        for (i, &sym_id) in symbols.iter().enumerate() {
            symbol_db.symbol(sym_id).thunk_info.assign(thunk_idx, i as i64);
        }

        let thunk = Thunk {
            thunk_idx,
            offset: thunk_offset,
            symbols,
        };
        let thunk_size = thunk.size::<A>();
        ensure!(
            thunk_size < MAX_THUNK_SIZE,
            "thunk {thunk_idx} with {} entries would occupy 0x{thunk_size:x} bytes",
            thunk.symbols.len()
        );
        offset += thunk_size;

        tracing::trace!(
            thunk_idx,
            offset = thunk_offset,
            entries = thunk.symbols.len(),
            "placed thunk"
        );
        thunks.push(thunk);

        // Second scan: fill in the entry indexes that the first scan left at -1.
        {
            let members: &[InputSection] = &*members;
            thunk_refs[b..c]
                .par_iter_mut()
                .zip(&members[b..c])
                .for_each(|(refs, isec)| {
                    let file = symbol_db.file(isec.file);
                    for (rel, r) in isec.rels().iter().zip(refs.iter_mut()) {
                        if r.thunk_idx == thunk_idx {
                            let sym = symbol_db.symbol(file.symbols[rel.r_sym as usize]);
                            r.sym_idx = sym.thunk_info.thunk_sym_idx();
                        }
                    }
                });
        }

        b = c;
    }

    for thunk in &thunks[a..] {
        thunk.reset(symbol_db);
    }

    *sh_size = offset as u64;
    Ok(())
}

/// First relocation scan over one input section. Sizes the section's redirection table, then
/// routes each out-of-reach call either to the thunk an earlier batch already gave its
/// symbol, or to the thunk being built.
fn scan_relocations<A: Arch>(
    symbol_db: &SymbolDb,
    osec_id: OutputSectionId,
    members: &[InputSection],
    isec: &InputSection,
    refs: &mut Vec<ThunkRef>,
    thunk_idx: i64,
    pending: &Mutex<Vec<SymbolId>>,
) {
    let file = symbol_db.file(isec.file);
    refs.resize(isec.rels().len(), ThunkRef::NONE);

    for (rel, r) in isec.rels().iter().zip(refs.iter_mut()) {
        if !A::needs_thunk(rel.r_type) {
            continue;
        }

        // Undefined symbols are skipped; applying the relocation will report them.
        let sym_id = file.symbols[rel.r_sym as usize];
        let sym = symbol_db.symbol(sym_id);
        if sym.file.is_none() {
            continue;
        }

        if is_reachable::<A>(osec_id, members, isec, sym, rel) {
            continue;
        }

        // If an active thunk already carries the symbol, reuse its entry.
        let existing = sym.thunk_info.thunk_idx();
        if existing != -1 {
            r.thunk_idx = existing;
            r.sym_idx = sym.thunk_info.thunk_sym_idx();
            continue;
        }

        r.thunk_idx = thunk_idx;
        r.sym_idx = -1;

        // Scanners for different sections race to add the symbol; exactly one wins.
        if sym.thunk_info.try_claim() {
            pending.lock().unwrap().push(sym_id);
        }
    }
}

/// Whether a direct branch at `rel` inside `isec` reaches `sym` in the layout as placed so
/// far.
fn is_reachable<A: Arch>(
    osec_id: OutputSectionId,
    members: &[InputSection],
    isec: &InputSection,
    sym: &Symbol,
    rel: &Rela,
) -> bool {
    // References that leave the output section are pessimistically treated as out of range.
    let Some(section) = sym.section else {
        return false;
    };
    if section.output_section != osec_id {
        return false;
    }

    // Calls to a symbol with a PLT entry branch to the PLT, which lives outside this layout,
    // even when the definition itself is nearby.
    if sym.has_plt() {
        return false;
    }

    // The target section hasn't been placed yet.
    let target = &members[section.member as usize];
    if target.offset == -1 {
        return false;
    }

    let s = target.offset + sym.value;
    if A::needs_interworking_thunk(rel.r_type, s) {
        return false;
    }

    let p = isec.offset + rel.r_offset;
    let val = s + rel.r_addend - p;
    -A::MAX_DISTANCE <= val && val < A::MAX_DISTANCE
}

#[cfg(test)]
fn call26(r_sym: u32, r_offset: i64) -> Rela {
    Rela {
        r_type: object::elf::R_AARCH64_CALL26,
        r_sym,
        r_offset,
        r_addend: 0,
    }
}

#[cfg(test)]
fn defined_symbol(
    file: FileId,
    sym_idx: u32,
    output_section: OutputSectionId,
    member: u32,
    value: i64,
) -> Symbol {
    use crate::section::SectionRef;

    Symbol {
        file: Some(file),
        sym_idx,
        value,
        section: Some(SectionRef {
            output_section,
            member,
        }),
        ..Symbol::default()
    }
}

/// 40 sections of 8 MiB, each with one call to a symbol near the start of the last section
/// and one to a symbol near the start of the first. Spans several batches in both
/// directions, so thunks get created, reused, and retired.
#[cfg(test)]
fn far_call_fixture() -> (SymbolDb, OutputSection) {
    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    symbol_db.add_symbol(file, defined_symbol(file, 0, osec_id, 39, 16));
    symbol_db.add_symbol(file, defined_symbol(file, 1, osec_id, 0, 32));

    let members = (0..40)
        .map(|_| {
            InputSection::new(
                file,
                Alignment { exponent: 2 },
                8 << 20,
                vec![call26(0, 8), call26(1, 64)],
            )
        })
        .collect();
    (symbol_db, OutputSection::new(osec_id, members))
}

#[test]
fn test_empty_output_section() {
    use crate::arch::AArch64;

    let symbol_db = SymbolDb::default();
    let mut osec = OutputSection::new(OutputSectionId::new(0), Vec::new());
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();
    assert!(osec.thunks.is_empty());
    assert_eq!(osec.sh_size, 0);
}

#[test]
fn test_call_within_reach_needs_no_thunk() {
    use crate::arch::AArch64;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    symbol_db.add_symbol(file, defined_symbol(file, 0, osec_id, 0, 512));

    let isec = InputSection::new(file, Alignment { exponent: 2 }, 1024, vec![call26(0, 0)]);
    let mut osec = OutputSection::new(osec_id, vec![isec]);
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    assert_eq!(osec.members[0].offset, 0);
    assert_eq!(osec.thunks.len(), 1);
    assert!(osec.thunks[0].symbols.is_empty());
    assert_eq!(osec.thunk_refs[0][0], ThunkRef::NONE);
    assert_eq!(osec.sh_size, 1024);
}

#[test]
fn test_far_call_redirected_to_thunk() {
    use crate::arch::AArch64;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    let f = symbol_db.add_symbol(file, defined_symbol(file, 0, osec_id, 1, 0));

    let near = InputSection::new(file, Alignment { exponent: 2 }, 1024, vec![call26(0, 0)]);
    let far = InputSection::new(file, Alignment { exponent: 2 }, 200 << 20, Vec::new());
    let mut osec = OutputSection::new(osec_id, vec![near, far]);
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    assert_eq!(
        osec.thunk_refs[0][0],
        ThunkRef {
            thunk_idx: 0,
            sym_idx: 0
        }
    );
    assert_eq!(osec.thunks[0].symbols, vec![f]);
    assert_eq!(osec.thunks[0].offset, 1024);
    assert!(osec.thunks[0].offset <= AArch64::MAX_DISTANCE);
    assert_eq!(osec.sh_size, 1036);
}

#[test]
fn test_plt_call_redirected_even_when_near() {
    use crate::arch::AArch64;
    use crate::symbol_db::ValueFlags;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    let mut g = defined_symbol(file, 0, osec_id, 0, 512);
    g.value_flags = ValueFlags::PLT;
    let g = symbol_db.add_symbol(file, g);

    let isec = InputSection::new(file, Alignment { exponent: 2 }, 1024, vec![call26(0, 0)]);
    let mut osec = OutputSection::new(osec_id, vec![isec]);
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    assert_eq!(osec.thunks[0].symbols, vec![g]);
    assert_eq!(
        osec.thunk_refs[0][0],
        ThunkRef {
            thunk_idx: 0,
            sym_idx: 0
        }
    );
}

#[test]
fn test_arm_state_change_forces_thunk() {
    use crate::arch::Arm;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    // A Thumb symbol 101 bytes in: well within range, but an ARM-state B can't reach it
    // without switching state.
    let t = symbol_db.add_symbol(file, defined_symbol(file, 0, osec_id, 0, 101));

    let rels = vec![
        Rela {
            r_type: object::elf::R_ARM_JUMP24,
            r_sym: 0,
            r_offset: 0,
            r_addend: 0,
        },
        Rela {
            r_type: object::elf::R_ARM_CALL,
            r_sym: 0,
            r_offset: 4,
            r_addend: 0,
        },
    ];
    let isec = InputSection::new(file, Alignment { exponent: 2 }, 1024, rels);
    let mut osec = OutputSection::new(osec_id, vec![isec]);
    create_range_extension_thunks::<Arm>(&symbol_db, &mut osec).unwrap();

    assert_eq!(
        osec.thunk_refs[0][0],
        ThunkRef {
            thunk_idx: 0,
            sym_idx: 0
        }
    );
    // BL interworks by itself, so the call stays direct.
    assert_eq!(osec.thunk_refs[0][1], ThunkRef::NONE);
    assert_eq!(osec.thunks[0].symbols, vec![t]);
}

#[test]
fn test_cross_output_section_call_redirected() {
    use crate::arch::AArch64;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let here = OutputSectionId::new(0);
    let elsewhere = OutputSectionId::new(1);
    let g = symbol_db.add_symbol(file, defined_symbol(file, 0, elsewhere, 0, 0));

    let isec = InputSection::new(file, Alignment { exponent: 2 }, 1024, vec![call26(0, 0)]);
    let mut osec = OutputSection::new(here, vec![isec]);
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    assert_eq!(osec.thunks[0].symbols, vec![g]);
    assert_eq!(
        osec.thunk_refs[0][0],
        ThunkRef {
            thunk_idx: 0,
            sym_idx: 0
        }
    );
}

#[test]
fn test_thunk_symbols_sorted_by_file_priority_and_index() {
    use crate::arch::AArch64;

    let mut symbol_db = SymbolDb::default();
    let file = symbol_db.add_file(1);
    let osec_id = OutputSectionId::new(0);
    // Registered in descending sym_idx order; the thunk must sort them back.
    let high = symbol_db.add_symbol(file, defined_symbol(file, 7, osec_id, 1, 0));
    let low = symbol_db.add_symbol(file, defined_symbol(file, 3, osec_id, 1, 4));

    let near = InputSection::new(
        file,
        Alignment { exponent: 2 },
        1024,
        vec![call26(0, 0), call26(1, 4)],
    );
    let far = InputSection::new(file, Alignment { exponent: 2 }, 200 << 20, Vec::new());
    let mut osec = OutputSection::new(osec_id, vec![near, far]);
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    assert_eq!(osec.thunks[0].symbols, vec![low, high]);
    assert_eq!(osec.thunk_refs[0][0].sym_idx, 1);
    assert_eq!(osec.thunk_refs[0][1].sym_idx, 0);
}

#[test]
fn test_multi_batch_layout_properties() {
    use crate::arch::AArch64;
    use foldhash::HashSet;
    use itertools::Itertools;

    let (symbol_db, mut osec) = far_call_fixture();
    create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec).unwrap();

    // The layout spans multiple batches and actually redirected something.
    assert!(osec.thunks.len() > 1);
    assert_ne!(osec.thunk_refs[0][0], ThunkRef::NONE);

    // Placed sections have strictly increasing, aligned, non-overlapping offsets.
    for (prev, next) in osec.members.iter().tuple_windows() {
        assert!(prev.offset >= 0);
        assert!(prev.offset + prev.sh_size as i64 <= next.offset);
        assert_eq!(next.offset, next.alignment.align_up(next.offset));
    }

    for thunk in &osec.thunks {
        assert!(thunk.size::<AArch64>() <= MAX_THUNK_SIZE);

        // Entries are unique and strictly ordered by (file priority, symbol index).
        let unique: HashSet<_> = thunk.symbols.iter().collect();
        assert_eq!(unique.len(), thunk.symbols.len());
        for (x, y) in thunk.symbols.iter().tuple_windows() {
            let (sx, sy) = (symbol_db.symbol(*x), symbol_db.symbol(*y));
            let kx = (symbol_db.file(sx.file.unwrap()).priority, sx.sym_idx);
            let ky = (symbol_db.file(sy.file.unwrap()).priority, sy.sym_idx);
            assert!(kx < ky);
        }
    }

    // Every call relocation is either reachable in the final layout or redirected to a
    // thunk entry for its symbol that its branch can reach.
    for (isec, refs) in osec.members.iter().zip(&osec.thunk_refs) {
        for (rel, r) in isec.rels().iter().zip(refs) {
            if !AArch64::needs_thunk(rel.r_type) {
                continue;
            }
            let sym_id = symbol_db.file(isec.file).symbols[rel.r_sym as usize];
            let sym = symbol_db.symbol(sym_id);
            if r.thunk_idx == -1 {
                assert!(is_reachable::<AArch64>(osec.id, &osec.members, isec, sym, rel));
            } else {
                let thunk = &osec.thunks[r.thunk_idx as usize];
                assert!(r.sym_idx >= 0);
                assert_eq!(thunk.symbols[r.sym_idx as usize], sym_id);
                let p = isec.offset + rel.r_offset;
                let entry = thunk.entry_offset::<AArch64>(r.sym_idx as usize);
                assert!((entry - p).abs() <= AArch64::MAX_DISTANCE);
            }
        }
    }
}

#[test]
fn test_layout_is_deterministic_across_thread_counts() {
    use crate::arch::AArch64;

    let run = |threads: usize| {
        let (symbol_db, mut osec) = far_call_fixture();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        pool.install(|| create_range_extension_thunks::<AArch64>(&symbol_db, &mut osec))
            .unwrap();
        let offsets: Vec<i64> = osec.members.iter().map(|m| m.offset).collect();
        (offsets, osec.thunks, osec.thunk_refs, osec.sh_size)
    };

    assert_eq!(run(1), run(8));
}
