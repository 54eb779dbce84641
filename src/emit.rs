//! Emission: layout assignment, relative re-encoding and patching.
//!
//! Data blocks are written first, so data and import targets always resolve
//! to concrete addresses. Code blocks follow in creation order; a relative
//! instruction whose target is already written is re-encoded against the
//! known delta, while a forward target gets a pessimistic encoding plus a
//! patch record that is satisfied as soon as the target block lands.
//!
//! When a code region cannot hold the next write, the emitter seals it with
//! an unconditional jump to the next region's base and restarts the current
//! block there.

use crate::block::{BlockId, BlockStore, BranchForm, DataBlockId, InstrCategory, Target};
use crate::error::{Error, RegionKind, Result};
use crate::symbol::{SymbolId, SymbolTable, SymbolTarget};

use tracing::{debug, trace};

/// Length of the rel32 jump that seals a full code region.
const REGION_JUMP_LEN: usize = 5;

/// Alignment of data blocks within a data region.
const DATA_ALIGN: usize = 8;

// ============================================================================
// Output regions
// ============================================================================

/// A caller-provided output region with a write cursor.
#[derive(Clone, Debug)]
struct OutputRegion {
    base: u64,
    size: usize,
    cursor: usize,
}

impl OutputRegion {
    fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            cursor: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    fn write_address(&self) -> u64 {
        self.base + self.cursor as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size as u64
    }

    /// Append bytes at the cursor. The caller has already checked the fit.
    fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining());
        // The region was handed to this session for exclusive use.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.base + self.cursor as u64) as *mut u8,
                bytes.len(),
            );
        }
        self.cursor += bytes.len();
    }

    /// Append zero bytes at the cursor.
    fn zero(&mut self, len: usize) {
        debug_assert!(len <= self.remaining());
        unsafe {
            std::ptr::write_bytes((self.base + self.cursor as u64) as *mut u8, 0, len);
        }
        self.cursor += len;
    }
}

// ============================================================================
// Patch records
// ============================================================================

/// Deferred fix-up of a forward reference: a byte range to overwrite once
/// the target block's final address is known.
#[derive(Clone, Debug)]
struct PatchRecord {
    /// Final address of the instruction containing the field.
    site_address: u64,
    /// Original RVA the instruction targets.
    target_rva: u32,
    /// Offset of the patch field within the instruction.
    field_offset: u8,
    /// 1 (rel8) or 4 (rel32 / disp32).
    field_len: u8,
    /// Encoded instruction length; the stored value is measured from the
    /// instruction end.
    instr_len: u8,
    /// Whether the field is a RIP-relative displacement (affects which
    /// range error is reported).
    rip_disp: bool,
}

// ============================================================================
// Branch encoding
// ============================================================================

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// Re-encode a branch for a delta measured from the instruction start.
///
/// Returns the encoded bytes and the (offset, length) of the displacement
/// field. The stored immediate is `delta - encoded_length`, since x86-64
/// branches measure from the instruction end.
fn encode_branch(
    form: BranchForm,
    prefix: &[u8],
    delta: i64,
    site_rva: u32,
) -> Result<(Vec<u8>, (u8, u8))> {
    let p = prefix.len();
    let out_of_range = || Error::BranchOutOfRange { rva: site_rva };

    let short = |opcode: u8| -> Option<(Vec<u8>, (u8, u8))> {
        let len = (p + 2) as i64;
        let imm = delta - len;
        if imm.abs() <= 0x7F {
            let mut bytes = prefix.to_vec();
            bytes.push(opcode);
            bytes.push(imm as i8 as u8);
            Some((bytes, ((p + 1) as u8, 1)))
        } else {
            None
        }
    };

    match form {
        BranchForm::Jump => {
            if let Some(enc) = short(0xEB) {
                return Ok(enc);
            }
            let len = (p + 5) as i64;
            let imm = delta - len;
            if !fits_i32(imm) {
                return Err(out_of_range());
            }
            let mut bytes = prefix.to_vec();
            bytes.push(0xE9);
            bytes.extend_from_slice(&(imm as i32).to_le_bytes());
            Ok((bytes, ((p + 1) as u8, 4)))
        }
        BranchForm::Call => {
            let len = (p + 5) as i64;
            let imm = delta - len;
            if !fits_i32(imm) {
                return Err(out_of_range());
            }
            let mut bytes = prefix.to_vec();
            bytes.push(0xE8);
            bytes.extend_from_slice(&(imm as i32).to_le_bytes());
            Ok((bytes, ((p + 1) as u8, 4)))
        }
        BranchForm::Cond(cc) => {
            if let Some(enc) = short(0x70 | cc) {
                return Ok(enc);
            }
            let len = (p + 6) as i64;
            let imm = delta - len;
            if !fits_i32(imm) {
                return Err(out_of_range());
            }
            let mut bytes = prefix.to_vec();
            bytes.push(0x0F);
            bytes.push(0x80 | cc);
            bytes.extend_from_slice(&(imm as i32).to_le_bytes());
            Ok((bytes, ((p + 2) as u8, 4)))
        }
        BranchForm::Rel8Only(opcode) => short(opcode).ok_or_else(out_of_range),
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Where a symbolic target resolved to.
enum Resolution {
    /// Concrete final address (data, import, or already-written code).
    Address(u64),
    /// Not yet emitted; carries the original target RVA and the target
    /// block for pessimistic sizing.
    Forward { target_rva: u32, block: BlockId },
}

/// An instruction ready to be written, plus its pending patch field.
struct Encoded {
    bytes: Vec<u8>,
    /// (field_offset, field_len, target_rva, rip_disp)
    patch: Option<(u8, u8, u32, bool)>,
}

struct Emitter<'a> {
    image: &'a [u8],
    code_regions: Vec<OutputRegion>,
    data_regions: Vec<OutputRegion>,
    current_code: usize,
    current_data: usize,
    pending: Vec<PatchRecord>,
}

/// Emit the disassembled program into the given regions.
///
/// Returns the final address of `entry_rva`. On error the regions must be
/// considered poisoned and must not be executed.
pub fn emit(
    image: &[u8],
    store: &mut BlockStore,
    symbols: &mut SymbolTable,
    code_regions: &[(u64, usize)],
    data_regions: &[(u64, usize)],
    entry_rva: u32,
    resolver: &mut dyn FnMut(&str, &str) -> Option<u64>,
) -> Result<u64> {
    let mut emitter = Emitter {
        image,
        code_regions: code_regions
            .iter()
            .map(|&(base, size)| OutputRegion::new(base, size))
            .collect(),
        data_regions: data_regions
            .iter()
            .map(|&(base, size)| OutputRegion::new(base, size))
            .collect(),
        current_code: 0,
        current_data: 0,
        pending: Vec::new(),
    };

    // A failed emission may be retried into fresh regions; start clean.
    for block in store.code_blocks_mut() {
        block.final_address = None;
        block.final_size = None;
        for instr in &mut block.instructions {
            instr.final_address = None;
        }
    }
    for db in store.data_blocks_mut() {
        db.final_address = None;
    }
    store.finalize();

    emitter.emit_data(store)?;

    if store.code_len() > 0 && emitter.code_regions.is_empty() {
        return Err(Error::OutOfSpace(RegionKind::Code));
    }
    for idx in 0..store.code_len() {
        let block_id = BlockId::new(idx as u32);
        emitter.emit_block(block_id, store, symbols)?;
        emitter.drain_patches(block_id, store)?;
    }

    if !emitter.pending.is_empty() {
        return Err(Error::UnresolvedForwardRef(emitter.pending.len()));
    }

    emitter.resolve_imports(store, symbols, resolver)?;

    let entry_block = store
        .find_by_rva(entry_rva)
        .ok_or(Error::IncompleteCoverage { rva: entry_rva })?;
    let block = store.block(entry_block);
    let entry = block
        .instruction_index_at(entry_rva)
        .and_then(|i| block.instructions[i].final_address)
        .ok_or(Error::IncompleteCoverage { rva: entry_rva })?;

    debug!(
        "emission complete: entry 0x{entry:X}, {} code blocks, {} data blocks, {} imports",
        store.code_len(),
        store.data_len(),
        symbols.import_slots().len()
    );
    Ok(entry)
}

impl Emitter<'_> {
    // ------------------------------------------------------------------
    // Data emission
    // ------------------------------------------------------------------

    fn emit_data(&mut self, store: &mut BlockStore) -> Result<()> {
        for idx in 0..store.data_len() {
            let id = DataBlockId::new(idx as u32);
            let (extent, file_offset, copy_len) = {
                let db = store.data_block(id);
                let extent = db.extent() as usize;
                let copy_len = db.file_size.min(db.extent()) as usize;
                (extent, db.file_offset, copy_len)
            };

            // Advance to a region with room; blocks are 8-byte aligned.
            let pad = loop {
                if self.current_data >= self.data_regions.len() {
                    return Err(Error::OutOfSpace(RegionKind::Data));
                }
                let region = &self.data_regions[self.current_data];
                let pad = (DATA_ALIGN - region.cursor % DATA_ALIGN) % DATA_ALIGN;
                if pad + extent <= region.remaining() {
                    break pad;
                }
                self.current_data += 1;
            };

            let region = &mut self.data_regions[self.current_data];
            region.zero(pad);
            let addr = region.write_address();
            let initialized = self
                .image
                .get(file_offset..file_offset + copy_len)
                .ok_or(Error::MalformedPe("section data out of file bounds"))?;
            region.write(initialized);
            region.zero(extent - copy_len);

            let db = store.data_block_mut(id);
            db.final_address = Some(addr);
            trace!("data block {} ({}) placed at 0x{addr:X}", db.id, db.name);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Code emission
    // ------------------------------------------------------------------

    fn emit_block(
        &mut self,
        block_id: BlockId,
        store: &mut BlockStore,
        symbols: &SymbolTable,
    ) -> Result<()> {
        'restart: loop {
            let start_cursor = self.code_regions[self.current_code].cursor;
            let block_addr = self.code_regions[self.current_code].write_address();
            let pending_mark = self.pending.len();
            store.block_mut(block_id).final_address = Some(block_addr);

            let count = store.block(block_id).instructions.len();
            for idx in 0..count {
                let site = self.code_regions[self.current_code].write_address();
                let enc = self.encode_instruction(block_id, idx, site, store, symbols)?;

                // Keep headroom for the region-sealing jump unless this is
                // the last region.
                let reserve = if self.current_code + 1 < self.code_regions.len() {
                    REGION_JUMP_LEN
                } else {
                    0
                };
                if enc.bytes.len() + reserve > self.code_regions[self.current_code].remaining() {
                    self.pending.truncate(pending_mark);
                    for instr in &mut store.block_mut(block_id).instructions {
                        instr.final_address = None;
                    }
                    if self.current_code + 1 >= self.code_regions.len() {
                        return Err(Error::OutOfSpace(RegionKind::Code));
                    }
                    let next_base = self.code_regions[self.current_code + 1].base;
                    let block_rva = store.block(block_id).original_rva;
                    self.seal_region(start_cursor, next_base, block_rva)?;
                    self.current_code += 1;
                    trace!("restarting {block_id} in next code region");
                    continue 'restart;
                }

                self.code_regions[self.current_code].write(&enc.bytes);
                store.block_mut(block_id).instructions[idx].final_address = Some(site);
                if let Some((field_offset, field_len, target_rva, rip_disp)) = enc.patch {
                    self.pending.push(PatchRecord {
                        site_address: site,
                        target_rva,
                        field_offset,
                        field_len,
                        instr_len: enc.bytes.len() as u8,
                        rip_disp,
                    });
                }
            }

            let final_size = self.code_regions[self.current_code].write_address() - block_addr;
            let block = store.block_mut(block_id);
            block.final_size = Some(final_size as u32);
            debug_assert!(block.estimated_size() as u64 >= final_size);
            return Ok(());
        }
    }

    /// Seal the current region at `cursor` with a rel32 jump to the next
    /// region's base, discarding any partial block bytes after it.
    fn seal_region(&mut self, cursor: usize, target: u64, block_rva: u32) -> Result<()> {
        let region = &mut self.code_regions[self.current_code];
        region.cursor = cursor;
        let delta = target as i64 - (region.write_address() as i64 + REGION_JUMP_LEN as i64);
        if !fits_i32(delta) {
            return Err(Error::BranchOutOfRange { rva: block_rva });
        }
        let mut bytes = [0u8; REGION_JUMP_LEN];
        bytes[0] = 0xE9;
        bytes[1..5].copy_from_slice(&(delta as i32).to_le_bytes());
        region.write(&bytes);
        Ok(())
    }

    fn encode_instruction(
        &self,
        block_id: BlockId,
        idx: usize,
        site: u64,
        store: &BlockStore,
        symbols: &SymbolTable,
    ) -> Result<Encoded> {
        let block = store.block(block_id);
        let instr = &block.instructions[idx];
        let site_rva = instr.original_rva.unwrap_or(block.original_rva);

        let Some(target) = instr.target else {
            return Ok(Encoded {
                bytes: instr.bytes.clone(),
                patch: None,
            });
        };
        let (symbol, addend) = match target {
            Target::Sym { symbol, addend } => (symbol, addend),
            // An unsymbolized operand means the target was never covered.
            Target::Rva(rva) => return Err(Error::IncompleteCoverage { rva }),
        };
        let resolution = self.resolve(symbol, addend, store, symbols)?;

        if instr.category == InstrCategory::RelativeMemory {
            let mut bytes = instr.bytes.clone();
            let off = instr.disp_offset as usize;
            return Ok(match resolution {
                Resolution::Address(target_addr) => {
                    let disp = target_addr as i64 - (site as i64 + bytes.len() as i64);
                    if !fits_i32(disp) {
                        return Err(Error::DispOutOfRange { rva: site_rva });
                    }
                    bytes[off..off + 4].copy_from_slice(&(disp as i32).to_le_bytes());
                    Encoded { bytes, patch: None }
                }
                Resolution::Forward { target_rva, .. } => {
                    bytes[off..off + 4].fill(0);
                    Encoded {
                        bytes,
                        patch: Some((off as u8, 4, target_rva, true)),
                    }
                }
            });
        }

        let Some(form) = instr.branch else {
            return Ok(Encoded {
                bytes: instr.bytes.clone(),
                patch: None,
            });
        };

        match resolution {
            Resolution::Address(target_addr) => {
                let delta = target_addr as i64 - site as i64;
                let (bytes, _) = encode_branch(form, instr.prefix_bytes(), delta, site_rva)?;
                Ok(Encoded { bytes, patch: None })
            }
            Resolution::Forward { target_rva, block } => {
                // Pessimistic upper bound: the summed size estimates of every
                // block from here through the target, so the chosen form can
                // always hold the real delta.
                let delta = self.pessimistic_delta(block_id, block, store);
                let (bytes, (field_offset, field_len)) =
                    encode_branch(form, instr.prefix_bytes(), delta, site_rva)?;
                Ok(Encoded {
                    bytes,
                    patch: Some((field_offset, field_len, target_rva, false)),
                })
            }
        }
    }

    fn resolve(
        &self,
        symbol: SymbolId,
        addend: i32,
        store: &BlockStore,
        symbols: &SymbolTable,
    ) -> Result<Resolution> {
        let sym = symbols.lookup(symbol)?;
        match sym.target {
            SymbolTarget::Invalid { rva } => Err(Error::IncompleteCoverage { rva }),
            SymbolTarget::Data { block, offset } => {
                let db = store.data_block(block);
                let base = db.final_address.ok_or(Error::IncompleteCoverage {
                    rva: db.original_rva,
                })?;
                Ok(Resolution::Address(
                    (base as i64 + offset as i64 + addend as i64) as u64,
                ))
            }
            SymbolTarget::Import { slot } => {
                let slot = &symbols.import_slots()[slot as usize];
                let addr = self
                    .import_slot_address(slot.iat_rva, store)
                    .ok_or(Error::IncompleteCoverage { rva: slot.iat_rva })?;
                Ok(Resolution::Address(addr))
            }
            SymbolTarget::Code { block } => {
                let b = store.block(block);
                let target_rva = b.original_rva.wrapping_add(addend as u32);
                if let Some(i) = b.instruction_index_at(target_rva) {
                    if let Some(addr) = b.instructions[i].final_address {
                        return Ok(Resolution::Address(addr));
                    }
                } else if b.final_size.is_some() {
                    // Already emitted with no instruction at that RVA: the
                    // target sits inside an instruction.
                    return Err(Error::IncompleteCoverage { rva: target_rva });
                }
                Ok(Resolution::Forward {
                    target_rva,
                    block: b.id,
                })
            }
        }
    }

    /// The rewritten IAT slot backing an import, inside its data block.
    fn import_slot_address(&self, iat_rva: u32, store: &BlockStore) -> Option<u64> {
        let (db, offset) = store.find_data_by_rva(iat_rva)?;
        let base = store.data_block(db).final_address?;
        Some(base + offset as u64)
    }

    fn pessimistic_delta(&self, from: BlockId, to: BlockId, store: &BlockStore) -> i64 {
        let (lo, hi) = if from.index() <= to.index() {
            (from.index(), to.index())
        } else {
            (to.index(), from.index())
        };
        (lo..=hi)
            .map(|i| store.block(BlockId::new(i as u32)).estimated_size() as i64)
            .sum()
    }

    // ------------------------------------------------------------------
    // Patching
    // ------------------------------------------------------------------

    /// Satisfy every pending patch whose target lies in the block that was
    /// just emitted.
    fn drain_patches(&mut self, block_id: BlockId, store: &BlockStore) -> Result<()> {
        let block = store.block(block_id);
        let start = block.original_rva;
        let end = block.original_end();

        let mut i = 0;
        while i < self.pending.len() {
            let target_rva = self.pending[i].target_rva;
            let in_range = target_rva == start || (target_rva > start && target_rva < end);
            if !in_range {
                i += 1;
                continue;
            }
            let rec = self.pending.swap_remove(i);

            let target_addr = block
                .instruction_index_at(rec.target_rva)
                .and_then(|idx| block.instructions[idx].final_address)
                .ok_or(Error::IncompleteCoverage {
                    rva: rec.target_rva,
                })?;

            let value = target_addr as i64 - (rec.site_address as i64 + rec.instr_len as i64);
            let field_addr = rec.site_address + rec.field_offset as u64;
            match rec.field_len {
                1 => {
                    let v = i8::try_from(value).map_err(|_| Error::BranchOutOfRange {
                        rva: rec.target_rva,
                    })?;
                    self.write_absolute(field_addr, &[v as u8]);
                }
                _ => {
                    let v = i32::try_from(value).map_err(|_| {
                        if rec.rip_disp {
                            Error::DispOutOfRange {
                                rva: rec.target_rva,
                            }
                        } else {
                            Error::BranchOutOfRange {
                                rva: rec.target_rva,
                            }
                        }
                    })?;
                    self.write_absolute(field_addr, &v.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Overwrite bytes at an address the emitter itself produced.
    fn write_absolute(&self, addr: u64, bytes: &[u8]) {
        debug_assert!(
            self.code_regions
                .iter()
                .chain(self.data_regions.iter())
                .any(|r| r.contains(addr)),
            "patch outside every output region"
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
    }

    // ------------------------------------------------------------------
    // Import resolution
    // ------------------------------------------------------------------

    fn resolve_imports(
        &mut self,
        store: &BlockStore,
        symbols: &mut SymbolTable,
        resolver: &mut dyn FnMut(&str, &str) -> Option<u64>,
    ) -> Result<()> {
        for idx in 0..symbols.import_slots().len() {
            let (module, routine, iat_rva) = {
                let slot = &symbols.import_slots()[idx];
                (slot.module.clone(), slot.routine.clone(), slot.iat_rva)
            };
            let addr = resolver(&module, &routine)
                .filter(|&a| a != 0)
                .ok_or_else(|| Error::ImportResolveFailure {
                    module: module.clone(),
                    routine: routine.clone(),
                })?;
            let slot_addr = self
                .import_slot_address(iat_rva, store)
                .ok_or(Error::IncompleteCoverage { rva: iat_rva })?;
            self.write_absolute(slot_addr, &addr.to_le_bytes());
            symbols.import_slots_mut()[idx].resolved = Some(addr);
            trace!("bound {module}!{routine} to 0x{addr:X}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_selects_short_form() {
        // delta measured from the instruction start; -5 fits rel8
        let (bytes, field) = encode_branch(BranchForm::Jump, &[], -5, 0).unwrap();
        assert_eq!(bytes, vec![0xEB, 0xF9]);
        assert_eq!(field, (1, 1));
    }

    #[test]
    fn test_jump_selects_long_form() {
        let (bytes, field) = encode_branch(BranchForm::Jump, &[], 0x1000, 0).unwrap();
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(&bytes[1..5], &(0x1000i32 - 5).to_le_bytes());
        assert_eq!(field, (1, 4));
    }

    #[test]
    fn test_call_has_no_short_form() {
        let (bytes, _) = encode_branch(BranchForm::Call, &[], 0, 0).unwrap();
        assert_eq!(bytes[0], 0xE8);
        assert_eq!(&bytes[1..5], &(-5i32).to_le_bytes());
    }

    #[test]
    fn test_jcc_forms() {
        let (short, _) = encode_branch(BranchForm::Cond(0x4), &[], 0x10, 0).unwrap();
        assert_eq!(short, vec![0x74, 0x0E]);

        let (long, field) = encode_branch(BranchForm::Cond(0x4), &[], 0x4000, 0).unwrap();
        assert_eq!(&long[..2], &[0x0F, 0x84]);
        assert_eq!(&long[2..6], &(0x4000i32 - 6).to_le_bytes());
        assert_eq!(field, (2, 4));
    }

    #[test]
    fn test_prefix_preserved_and_field_shifted() {
        let (bytes, field) = encode_branch(BranchForm::Cond(0x5), &[0x3E], 0x4000, 0).unwrap();
        assert_eq!(&bytes[..3], &[0x3E, 0x0F, 0x85]);
        assert_eq!(field, (3, 4));
    }

    #[test]
    fn test_rel8_only_out_of_range() {
        assert!(matches!(
            encode_branch(BranchForm::Rel8Only(0xE2), &[], 0x1000, 0x42),
            Err(Error::BranchOutOfRange { rva: 0x42 })
        ));
    }

    #[test]
    fn test_branch_out_of_rel32_range() {
        assert!(matches!(
            encode_branch(BranchForm::Jump, &[], 0x1_0000_0000, 0x42),
            Err(Error::BranchOutOfRange { rva: 0x42 })
        ));
    }

    #[test]
    fn test_output_region_cursor() {
        let mut buf = vec![0u8; 16];
        let mut region = OutputRegion::new(buf.as_mut_ptr() as u64, buf.len());
        region.write(&[1, 2, 3]);
        region.zero(2);
        region.write(&[4]);
        assert_eq!(region.cursor, 6);
        assert_eq!(&buf[..6], &[1, 2, 3, 0, 0, 4]);
    }
}
