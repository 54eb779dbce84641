//! A rewriting session: parse, disassemble, emit.
//!
//! The session owns the input image, the block store and the symbol table
//! for one rewrite. Disassembly and emission are strict phases; the store is
//! finalized when emission begins and everything stays valid until the
//! session is dropped.

use crate::block::BlockStore;
use crate::disasm::{Diagnostic, DisasmConfig, Disassembler};
use crate::emit;
use crate::error::{Error, Result};
use crate::pe::PeParser;
use crate::symbol::SymbolTable;

use tracing::{debug, warn};

/// A single rewriting session over one PE image.
pub struct Session {
    image: Vec<u8>,
    pe: PeParser,
    store: BlockStore,
    symbols: SymbolTable,
    config: DisasmConfig,
    code_regions: Vec<(u64, usize)>,
    data_regions: Vec<(u64, usize)>,
    diagnostics: Vec<Diagnostic>,
    disassembled: bool,
}

impl Session {
    /// Create a session, parsing the PE headers up front.
    pub fn new(pe_bytes: Vec<u8>) -> Result<Self> {
        Self::with_config(pe_bytes, DisasmConfig::default())
    }

    pub fn with_config(pe_bytes: Vec<u8>, config: DisasmConfig) -> Result<Self> {
        let pe = PeParser::parse(&pe_bytes)?;
        debug!(
            "parsed PE image: {} sections, {} pdata functions, {} import modules, entry 0x{:X}",
            pe.sections.len(),
            pe.functions.len(),
            pe.imports.len(),
            pe.entry_point
        );
        Ok(Self {
            image: pe_bytes,
            pe,
            store: BlockStore::new(),
            symbols: SymbolTable::new(),
            config,
            code_regions: Vec::new(),
            data_regions: Vec::new(),
            diagnostics: Vec::new(),
            disassembled: false,
        })
    }

    /// Register an executable output region. Callable multiple times before
    /// `emit`; regions are consumed in the order supplied.
    ///
    /// # Safety
    /// `base` must point to `size` bytes of writable memory that stays valid
    /// and exclusively owned by this session until `emit` returns.
    pub unsafe fn add_code_region(&mut self, base: u64, size: usize) {
        self.code_regions.push((base, size));
    }

    /// Register a readable/writable output region for data.
    ///
    /// # Safety
    /// Same contract as [`Session::add_code_region`].
    pub unsafe fn add_data_region(&mut self, base: u64, size: usize) {
        self.data_regions.push((base, size));
    }

    /// Run recursive disassembly and symbolization. Idempotent.
    pub fn disassemble(&mut self) -> Result<()> {
        if self.disassembled {
            return Ok(());
        }
        let mut disasm = Disassembler::new(&self.image, &self.pe, self.config.clone());
        disasm.run(&mut self.store, &mut self.symbols)?;
        self.diagnostics = disasm.take_diagnostics();
        for diagnostic in &self.diagnostics {
            warn!(%diagnostic, "disassembly diagnostic");
        }
        self.disassembled = true;
        Ok(())
    }

    /// Emit the rewritten program into the registered regions.
    ///
    /// The resolver maps (module, routine) to an absolute address; `None`
    /// (or a returned 0) fails the emission. Returns the final address of
    /// the entry point. On error the output regions are poisoned and must
    /// not be executed.
    pub fn emit<R>(&mut self, mut resolver: R) -> Result<u64>
    where
        R: FnMut(&str, &str) -> Option<u64>,
    {
        if !self.disassembled {
            return Err(Error::NotDisassembled);
        }
        emit::emit(
            &self.image,
            &mut self.store,
            &mut self.symbols,
            &self.code_regions,
            &self.data_regions,
            self.pe.entry_point,
            &mut resolver,
        )
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn pe(&self) -> &PeParser {
        &self.pe
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.store
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failure_on_garbage() {
        assert!(Session::new(vec![0u8; 16]).is_err());
    }
}
