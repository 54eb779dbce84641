//! Symbol table.
//!
//! A symbol names an address that is unknown until emission. Instructions
//! and blocks refer to each other exclusively through symbol ids (plain
//! integers into an append-only array), so the underlying storage can grow
//! without invalidating references and the IR stays free of ownership
//! cycles.

use crate::block::{BlockId, DataBlockId};
use crate::error::{Error, Result};

use std::collections::HashMap;

/// A stable 32-bit handle to a symbol. Id 0 is reserved as invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub const INVALID: Self = Self(0);

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sym{}", self.0)
    }
}

/// The different kinds of symbols that exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Invalid,
    Code,
    Data,
    Import,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Code => "code",
            Self::Data => "data",
            Self::Import => "import",
        };
        write!(f, "{s}")
    }
}

/// What a symbol resolves to at emission time.
#[derive(Clone, Debug)]
pub enum SymbolTarget {
    /// Unresolvable. Placeholders for uncovered targets keep the original
    /// RVA for reporting; the reserved id-0 entry carries RVA 0.
    Invalid { rva: u32 },
    Code { block: BlockId },
    Data { block: DataBlockId, offset: u32 },
    /// Index into the import slot list.
    Import { slot: u32 },
}

/// A symbol: a name for an address resolved at emission.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub id: SymbolId,
    pub target: SymbolTarget,
    pub name: Option<String>,
}

impl Symbol {
    pub fn kind(&self) -> SymbolKind {
        match self.target {
            SymbolTarget::Invalid { .. } => SymbolKind::Invalid,
            SymbolTarget::Code { .. } => SymbolKind::Code,
            SymbolTarget::Data { .. } => SymbolKind::Data,
            SymbolTarget::Import { .. } => SymbolKind::Import,
        }
    }
}

/// One entry of the import thunk table.
#[derive(Clone, Debug)]
pub struct ImportSlot {
    pub module: String,
    pub routine: String,
    /// RVA of the original 8-byte IAT slot this import is bound through.
    pub iat_rva: u32,
    /// Resolver-provided absolute address, filled in during emission.
    pub resolved: Option<u64>,
}

/// Owns every symbol of a rewriting session.
///
/// Ids are dense from 1 upward, assigned monotonically and never reused.
/// Code and data interning is intentionally not deduplicating; import
/// interning is deduplicated by (module, routine).
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    import_slots: Vec<ImportSlot>,
    import_index: HashMap<(String, String), SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        // Slot 0 backs the reserved invalid id so ids index directly.
        Self {
            symbols: vec![Symbol {
                id: SymbolId::INVALID,
                target: SymbolTarget::Invalid { rva: 0 },
                name: None,
            }],
            import_slots: Vec::new(),
            import_index: HashMap::new(),
        }
    }

    fn push(&mut self, target: SymbolTarget, name: Option<String>) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol { id, target, name });
        id
    }

    /// Intern a symbol for a basic block.
    pub fn intern_code(&mut self, block: BlockId, name: Option<&str>) -> SymbolId {
        self.push(SymbolTarget::Code { block }, name.map(str::to_owned))
    }

    /// Intern a symbol for an offset within a data block.
    pub fn intern_data(&mut self, block: DataBlockId, offset: u32, name: Option<&str>) -> SymbolId {
        self.push(
            SymbolTarget::Data { block, offset },
            name.map(str::to_owned),
        )
    }

    /// Intern an import symbol, deduplicated by (module, routine).
    pub fn intern_import(&mut self, module: &str, routine: &str, iat_rva: u32) -> SymbolId {
        let key = (module.to_owned(), routine.to_owned());
        if let Some(&id) = self.import_index.get(&key) {
            return id;
        }
        let slot = self.import_slots.len() as u32;
        self.import_slots.push(ImportSlot {
            module: module.to_owned(),
            routine: routine.to_owned(),
            iat_rva,
            resolved: None,
        });
        let id = self.push(
            SymbolTarget::Import { slot },
            Some(format!("{module}!{routine}")),
        );
        self.import_index.insert(key, id);
        id
    }

    /// Intern a placeholder for a target no block covers.
    pub fn intern_placeholder(&mut self, rva: u32) -> SymbolId {
        self.push(
            SymbolTarget::Invalid { rva },
            Some(format!("unk_{rva:x}")),
        )
    }

    /// Look up a symbol by id. Fails with `InvalidSymbol` for id 0 and for
    /// ids this table never produced.
    pub fn lookup(&self, id: SymbolId) -> Result<&Symbol> {
        if !id.is_valid() {
            return Err(Error::InvalidSymbol(id.0));
        }
        self.symbols
            .get(id.0 as usize)
            .ok_or(Error::InvalidSymbol(id.0))
    }

    /// Number of symbols, excluding the reserved invalid entry.
    pub fn len(&self) -> usize {
        self.symbols.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate all real symbols (id 1 upward).
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().skip(1)
    }

    pub fn import_slots(&self) -> &[ImportSlot] {
        &self.import_slots
    }

    pub fn import_slots_mut(&mut self) -> &mut [ImportSlot] {
        &mut self.import_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_dense_from_one() {
        let mut table = SymbolTable::new();
        let a = table.intern_code(BlockId::new(0), None);
        let b = table.intern_code(BlockId::new(0), Some("dup"));
        let c = table.intern_data(DataBlockId::new(0), 0x10, None);
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 2);
        assert_eq!(c.index(), 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_code_interning_not_deduplicated() {
        let mut table = SymbolTable::new();
        let a = table.intern_code(BlockId::new(7), None);
        let b = table.intern_code(BlockId::new(7), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_import_interning_deduplicated() {
        let mut table = SymbolTable::new();
        let a = table.intern_import("ntdll.dll", "CloseHandle", 0x3000);
        let b = table.intern_import("ntdll.dll", "CloseHandle", 0x3000);
        let c = table.intern_import("ntdll.dll", "NtClose", 0x3008);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.import_slots().len(), 2);
    }

    #[test]
    fn test_invalid_lookup_fails() {
        let table = SymbolTable::new();
        assert!(matches!(
            table.lookup(SymbolId::INVALID),
            Err(Error::InvalidSymbol(0))
        ));
    }

    #[test]
    fn test_lookup_roundtrip() {
        let mut table = SymbolTable::new();
        let id = table.intern_import("kernel32.dll", "ExitProcess", 0x4000);
        let sym = table.lookup(id).unwrap();
        assert_eq!(sym.kind(), SymbolKind::Import);
        assert_eq!(sym.name.as_deref(), Some("kernel32.dll!ExitProcess"));
    }
}
