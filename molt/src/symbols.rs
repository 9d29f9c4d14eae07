use std::collections::HashMap;

use object::Symbol;

/// Interned strings. Names and library URLs are interned once; identity
/// predicates compare symbol ids instead of string contents.
pub struct SymbolTable {
    map: HashMap<String, Symbol, ahash::RandomState>,
    names: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::default(),
            names: Vec::new(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.map.get(name) {
            return sym;
        }
        let sym = Symbol(self.names.len() as u32);
        self.names.push(name.to_owned());
        self.map.insert(name.to_owned(), sym);
        sym
    }

    pub fn name(&self, sym: Symbol) -> &str {
        &self.names[sym.0 as usize]
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbols the runtime itself needs to compare against.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownSymbols {
    pub plus: Symbol,
    pub minus: Symbol,
    pub equals: Symbol,
    pub toplevel: Symbol,
}

impl WellKnownSymbols {
    pub fn intern_into(table: &mut SymbolTable) -> Self {
        Self {
            plus: table.intern("+"),
            minus: table.intern("-"),
            equals: table.intern("=="),
            toplevel: table.intern("::toplevel"),
        }
    }
}
