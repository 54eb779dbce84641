//! Recursive disassembly into basic blocks.
//!
//! A worklist of pending RVAs is seeded from the exception directory and the
//! entry point, then processed to exhaustion: each RVA becomes a basic block
//! decoded sequentially until a control-flow boundary, the start of another
//! block, or the end of the section. Branch and call targets feed the
//! worklist; a target landing inside an existing block splits it eagerly.
//! A final symbolization pass rewrites every relative operand from a raw RVA
//! to a `(symbol, addend)` pair.

use crate::block::{BlockId, BlockStore, BranchForm, Instr, InstrCategory, Target};
use crate::error::Result;
use crate::pe::PeParser;
use crate::symbol::SymbolTable;

use iced_x86::{Code, ConstantOffsets, Decoder, DecoderOptions, FlowControl, Instruction, OpKind};
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Configuration for the disassembler.
#[derive(Clone, Debug)]
pub struct DisasmConfig {
    /// Whether `INT3`/`INT1` terminate a block (default) or are kept as
    /// interior padding.
    pub int3_terminates: bool,
}

impl Default for DisasmConfig {
    fn default() -> Self {
        Self {
            int3_terminates: true,
        }
    }
}

/// Non-fatal findings collected during disassembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// An instruction failed to decode; the enclosing block was truncated.
    DecodeFailure { rva: u32 },
    /// A relative operand targets an RVA no block or import covers.
    IncompleteCoverage { rva: u32 },
    /// The exception directory was absent or empty; only the entry point
    /// seeded traversal.
    LowCoverage,
    /// Two sections overlap in the virtual address space.
    OverlappingSections { first: String, second: String },
    /// A seed RVA landed inside an instruction of an existing block.
    SplitInsideInstruction { rva: u32 },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecodeFailure { rva } => {
                write!(f, "undecodable instruction at RVA 0x{rva:X}, block truncated")
            }
            Self::IncompleteCoverage { rva } => {
                write!(f, "target RVA 0x{rva:X} not covered by any block")
            }
            Self::LowCoverage => {
                write!(f, "exception directory empty, seeding from entry point only")
            }
            Self::OverlappingSections { first, second } => {
                write!(f, "sections {first} and {second} overlap")
            }
            Self::SplitInsideInstruction { rva } => {
                write!(f, "RVA 0x{rva:X} falls inside an instruction, cannot split")
            }
        }
    }
}

/// Counters for the traversal, logged when it completes.
#[derive(Clone, Debug, Default)]
pub struct DisasmStats {
    pub blocks_created: usize,
    pub instructions_decoded: usize,
    pub splits: usize,
    pub rip_relative_refs: usize,
    pub targets_enqueued: usize,
}

/// Classify a branch-with-immediate by its opcode bytes.
///
/// Returns the encoding family and the number of leading prefix bytes, or
/// `None` for encodings with no near-relative form (far branches).
fn branch_form(raw: &[u8], imm_offset: usize) -> Option<(BranchForm, usize)> {
    if imm_offset == 0 || imm_offset > raw.len() {
        return None;
    }
    let op = raw[imm_offset - 1];
    if imm_offset >= 2 && raw[imm_offset - 2] == 0x0F && (0x80..=0x8F).contains(&op) {
        return Some((BranchForm::Cond(op & 0x0F), imm_offset - 2));
    }
    match op {
        0xE8 => Some((BranchForm::Call, imm_offset - 1)),
        0xE9 | 0xEB => Some((BranchForm::Jump, imm_offset - 1)),
        0x70..=0x7F => Some((BranchForm::Cond(op & 0x0F), imm_offset - 1)),
        // LOOP/LOOPE/LOOPNE/JrCXZ: rel8 only.
        0xE0..=0xE3 => Some((BranchForm::Rel8Only(op), imm_offset - 1)),
        _ => None,
    }
}

/// Recursive worklist disassembler.
pub struct Disassembler<'a> {
    image: &'a [u8],
    pe: &'a PeParser,
    config: DisasmConfig,
    worklist: Vec<u32>,
    queued: HashSet<u32>,
    diagnostics: Vec<Diagnostic>,
    stats: DisasmStats,
}

impl<'a> Disassembler<'a> {
    pub fn new(image: &'a [u8], pe: &'a PeParser, config: DisasmConfig) -> Self {
        Self {
            image,
            pe,
            config,
            worklist: Vec::new(),
            queued: HashSet::new(),
            diagnostics: Vec::new(),
            stats: DisasmStats::default(),
        }
    }

    /// Run traversal, data materialization and symbolization.
    pub fn run(&mut self, store: &mut BlockStore, symbols: &mut SymbolTable) -> Result<()> {
        let mut seeds: Vec<u32> = self.pe.function_starts().collect();
        if seeds.is_empty() {
            self.diagnostics.push(Diagnostic::LowCoverage);
        }
        if self.pe.entry_point != 0 {
            seeds.push(self.pe.entry_point);
        }
        for seed in seeds {
            self.enqueue(seed);
        }

        while let Some(rva) = self.worklist.pop() {
            self.process(rva, store)?;
        }

        self.materialize_data(store);
        self.symbolize(store, symbols);

        debug!(
            "disassembly complete: {} blocks, {} instructions, {} splits, {} data blocks, {} symbols",
            self.stats.blocks_created,
            self.stats.instructions_decoded,
            self.stats.splits,
            store.data_len(),
            symbols.len()
        );
        Ok(())
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn stats(&self) -> &DisasmStats {
        &self.stats
    }

    fn enqueue(&mut self, rva: u32) {
        if self.queued.insert(rva) {
            self.worklist.push(rva);
            self.stats.targets_enqueued += 1;
        }
    }

    fn process(&mut self, rva: u32, store: &mut BlockStore) -> Result<()> {
        if let Some(existing) = store.find_by_rva(rva) {
            if store.block(existing).original_rva == rva {
                return Ok(());
            }
            return self.split(store, existing, rva);
        }
        self.decode_block(rva, store)
    }

    /// Split `block` at `rva`: the prefix keeps its id and receives a
    /// synthetic jump to the new suffix block.
    fn split(&mut self, store: &mut BlockStore, block: BlockId, rva: u32) -> Result<()> {
        let Some(suffix) = store.split_off_instructions(block, rva) else {
            self.diagnostics.push(Diagnostic::SplitInsideInstruction { rva });
            return Ok(());
        };
        trace!("splitting {block} at RVA 0x{rva:X}");

        let prefix = store.block(block);
        let suffix_offset = prefix.file_offset + (rva - prefix.original_rva) as usize;
        let suffix_block = store.add_code_block(rva, suffix_offset);
        for instr in suffix {
            store.append_instruction(suffix_block, instr)?;
        }
        store.append_instruction(block, Instr::synthetic_jump(rva))?;
        self.stats.splits += 1;
        self.stats.blocks_created += 1;
        Ok(())
    }

    fn decode_block(&mut self, rva: u32, store: &mut BlockStore) -> Result<()> {
        // Targets outside executable sections are skipped here and reported
        // as coverage gaps during symbolization.
        let Some(section) = self
            .pe
            .section_containing(rva)
            .filter(|s| s.is_executable())
        else {
            return Ok(());
        };

        let delta = (rva - section.virtual_address) as usize;
        if delta >= section.size_of_raw_data as usize {
            return Ok(());
        }
        let image = self.image;
        let start = section.pointer_to_raw_data as usize + delta;
        let end = (section.pointer_to_raw_data + section.size_of_raw_data) as usize;
        let code = &image[start.min(image.len())..end.min(image.len())];

        let block = store.add_code_block(rva, start);
        self.stats.blocks_created += 1;

        // Decoding never runs into or across a previously discovered block.
        let stop_at = store.next_block_start_after(rva);

        let mut decoder = Decoder::with_ip(64, code, rva as u64, DecoderOptions::NONE);
        let mut pos = 0usize;

        loop {
            let cur_rva = decoder.ip() as u32;
            if stop_at == Some(cur_rva) {
                store.append_instruction(block, Instr::synthetic_jump(cur_rva))?;
                break;
            }
            if !decoder.can_decode() {
                // End-of-section boundary.
                break;
            }

            let inst = decoder.decode();
            if inst.is_invalid() {
                self.diagnostics.push(Diagnostic::DecodeFailure { rva: cur_rva });
                break;
            }
            if let Some(next_start) = stop_at {
                if cur_rva + inst.len() as u32 > next_start {
                    // Phase mismatch: the instruction would straddle an
                    // existing block start.
                    self.diagnostics
                        .push(Diagnostic::SplitInsideInstruction { rva: next_start });
                    break;
                }
            }

            let raw = &code[pos..decoder.position()];
            pos = decoder.position();
            let offsets = decoder.get_constant_offsets(&inst);
            let (ir, terminates) = self.lift(cur_rva, raw, &inst, &offsets);
            self.stats.instructions_decoded += 1;

            if let Some(Target::Rva(target)) = ir.target {
                if matches!(
                    ir.category,
                    InstrCategory::Call
                        | InstrCategory::ConditionalBranch
                        | InstrCategory::UnconditionalBranch
                ) {
                    self.enqueue(target);
                }
            }

            store.append_instruction(block, ir)?;
            if terminates {
                break;
            }
        }
        Ok(())
    }

    /// Build the IR instruction and decide whether it terminates the block.
    fn lift(
        &mut self,
        rva: u32,
        raw: &[u8],
        inst: &Instruction,
        offsets: &ConstantOffsets,
    ) -> (Instr, bool) {
        let mut ir = Instr {
            original_rva: Some(rva),
            bytes: raw.to_vec(),
            category: InstrCategory::Normal,
            target: None,
            branch: None,
            prefix_len: 0,
            disp_offset: 0,
            final_address: None,
        };

        let fc = inst.flow_control();

        // RIP-relative memory operands keep their 32-bit displacement layout
        // and get the displacement recomputed at emission. This covers
        // indirect calls and jumps through the IAT as well.
        if inst.is_ip_rel_memory_operand()
            && offsets.has_displacement()
            && offsets.displacement_size() == 4
        {
            ir.category = InstrCategory::RelativeMemory;
            ir.disp_offset = offsets.displacement_offset() as u8;
            ir.target = Some(Target::Rva(inst.ip_rel_memory_address() as u32));
            self.stats.rip_relative_refs += 1;
            let terminates = matches!(
                fc,
                FlowControl::IndirectBranch | FlowControl::UnconditionalBranch
            );
            return (ir, terminates);
        }

        let near_target = (inst.op0_kind() == OpKind::NearBranch64)
            .then(|| inst.near_branch_target() as u32);

        match fc {
            FlowControl::Next => (ir, false),
            FlowControl::Call | FlowControl::IndirectCall => {
                ir.category = InstrCategory::Call;
                self.attach_branch(&mut ir, raw, offsets, near_target);
                (ir, false)
            }
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch => {
                ir.category = InstrCategory::UnconditionalBranch;
                self.attach_branch(&mut ir, raw, offsets, near_target);
                (ir, true)
            }
            FlowControl::ConditionalBranch => {
                ir.category = InstrCategory::ConditionalBranch;
                self.attach_branch(&mut ir, raw, offsets, near_target);
                (ir, false)
            }
            FlowControl::Return => {
                ir.category = InstrCategory::Return;
                (ir, true)
            }
            FlowControl::Interrupt | FlowControl::Exception => {
                ir.category = InstrCategory::Interrupt;
                let soft_padding = matches!(inst.code(), Code::Int3 | Code::Int1);
                (ir, !soft_padding || self.config.int3_terminates)
            }
            _ => (ir, false),
        }
    }

    /// Attach the relative operand and encoding family to a branch, when it
    /// has an immediate near target. Far and indirect branches keep their
    /// bytes verbatim.
    fn attach_branch(
        &mut self,
        ir: &mut Instr,
        raw: &[u8],
        offsets: &ConstantOffsets,
        near_target: Option<u32>,
    ) {
        let Some(target) = near_target else { return };
        let Some((form, prefix_len)) = branch_form(raw, offsets.immediate_offset()) else {
            return;
        };
        ir.target = Some(Target::Rva(target));
        ir.branch = Some(form);
        ir.prefix_len = prefix_len as u8;
    }

    /// One data block per non-executable section, plus the overlap check.
    fn materialize_data(&mut self, store: &mut BlockStore) {
        let mut spans: Vec<(u32, u32, &str)> = Vec::new();
        for section in &self.pe.sections {
            spans.push((
                section.virtual_address,
                section.virtual_extent(),
                &section.name,
            ));
            if section.is_executable() || section.virtual_extent() == 0 {
                continue;
            }
            store.add_data_block(
                &section.name,
                section.virtual_address,
                section.pointer_to_raw_data as usize,
                section.size_of_raw_data,
                section.virtual_size,
            );
        }

        spans.sort_by_key(|&(va, _, _)| va);
        for pair in spans.windows(2) {
            let (va_a, extent_a, name_a) = pair[0];
            let (va_b, _, name_b) = pair[1];
            if va_a + extent_a > va_b {
                self.diagnostics.push(Diagnostic::OverlappingSections {
                    first: name_a.to_owned(),
                    second: name_b.to_owned(),
                });
            }
        }
    }

    /// Rewrite every relative operand from a raw RVA to `(symbol, addend)`.
    fn symbolize(&mut self, store: &mut BlockStore, symbols: &mut SymbolTable) {
        // IAT slot RVA -> (module, routine).
        let mut iat: HashMap<u32, (&str, &str)> = HashMap::new();
        for module in &self.pe.imports {
            for routine in &module.routines {
                iat.insert(routine.iat_rva, (&module.name, &routine.name));
            }
        }

        let mut pending: Vec<(BlockId, usize, u32, InstrCategory)> = Vec::new();
        for block in store.code_blocks() {
            for (idx, instr) in block.instructions.iter().enumerate() {
                if let Some(Target::Rva(rva)) = instr.target {
                    pending.push((block.id, idx, rva, instr.category));
                }
            }
        }

        for (block_id, idx, rva, category) in pending {
            let target = if category == InstrCategory::RelativeMemory {
                if let Some(&(module, routine)) = iat.get(&rva) {
                    Target::Sym {
                        symbol: symbols.intern_import(module, routine, rva),
                        addend: 0,
                    }
                } else if let Some((data_block, offset)) = store.find_data_by_rva(rva) {
                    Target::Sym {
                        symbol: symbols.intern_data(data_block, offset, None),
                        addend: 0,
                    }
                } else if let Some(code_block) = store.find_by_rva(rva) {
                    let addend = rva.wrapping_sub(store.block(code_block).original_rva) as i32;
                    Target::Sym {
                        symbol: symbols.intern_code(code_block, None),
                        addend,
                    }
                } else {
                    self.diagnostics.push(Diagnostic::IncompleteCoverage { rva });
                    Target::Sym {
                        symbol: symbols.intern_placeholder(rva),
                        addend: 0,
                    }
                }
            } else if let Some(code_block) = store.find_by_rva(rva) {
                let addend = rva.wrapping_sub(store.block(code_block).original_rva) as i32;
                Target::Sym {
                    symbol: symbols.intern_code(code_block, None),
                    addend,
                }
            } else {
                self.diagnostics.push(Diagnostic::IncompleteCoverage { rva });
                Target::Sym {
                    symbol: symbols.intern_placeholder(rva),
                    addend: 0,
                }
            };

            store.block_mut(block_id).instructions[idx].target = Some(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_form_short_jcc() {
        // jz +0x10
        let raw = [0x74, 0x10];
        assert_eq!(branch_form(&raw, 1), Some((BranchForm::Cond(0x4), 0)));
    }

    #[test]
    fn test_branch_form_near_jcc() {
        // jnz near, 0F 85 imm32
        let raw = [0x0F, 0x85, 0x00, 0x10, 0x00, 0x00];
        assert_eq!(branch_form(&raw, 2), Some((BranchForm::Cond(0x5), 0)));
    }

    #[test]
    fn test_branch_form_call_and_jmp() {
        assert_eq!(
            branch_form(&[0xE8, 0, 0, 0, 0], 1),
            Some((BranchForm::Call, 0))
        );
        assert_eq!(
            branch_form(&[0xE9, 0, 0, 0, 0], 1),
            Some((BranchForm::Jump, 0))
        );
        assert_eq!(branch_form(&[0xEB, 0xFE], 1), Some((BranchForm::Jump, 0)));
    }

    #[test]
    fn test_branch_form_loop_family() {
        assert_eq!(
            branch_form(&[0xE2, 0xF0], 1),
            Some((BranchForm::Rel8Only(0xE2), 0))
        );
    }

    #[test]
    fn test_branch_form_preserves_prefix() {
        // 3E (branch-taken hint) jz rel8
        let raw = [0x3E, 0x74, 0x05];
        assert_eq!(branch_form(&raw, 2), Some((BranchForm::Cond(0x4), 1)));
    }

    #[test]
    fn test_decode_loop_categorizes() {
        // mov rax, [rip+8]; ret
        let code = [0x48, 0x8B, 0x05, 0x08, 0x00, 0x00, 0x00, 0xC3];
        let mut decoder = Decoder::with_ip(64, &code, 0x1000, DecoderOptions::NONE);

        let inst = decoder.decode();
        assert!(inst.is_ip_rel_memory_operand());
        let offsets = decoder.get_constant_offsets(&inst);
        assert_eq!(offsets.displacement_offset(), 3);
        assert_eq!(offsets.displacement_size(), 4);
        assert_eq!(inst.ip_rel_memory_address(), 0x1000 + 7 + 8);

        let inst = decoder.decode();
        assert_eq!(inst.flow_control(), FlowControl::Return);
    }
}
