// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/symtab.rs

// A table to associate symbol names with efficient internal IDs, and
// the global environment those IDs index into.

// <>

use super::core::Value;
use super::grow;
use super::TernErr;

use rustc_hash::FxHashMap;

use std::fmt;

/// Interned symbol identifier; IDs start at 1 and are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    #[inline(always)]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    nm_to_id: FxHashMap<String, SymbolId>,
    // id N lives at N - 1
    id_to_nm: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ID for `name`, assigning the next free one on first
    /// mention
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.nm_to_id.get(name) {
            return *id;
        }

        self.id_to_nm.push(name.to_owned());
        let id = SymbolId(self.id_to_nm.len() as u32);
        self.nm_to_id.insert(name.to_owned(), id);

        log::trace!("interned {:?} as {}", name, id);

        id
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<SymbolId> {
        self.nm_to_id.get(name).copied()
    }

    pub fn lookup_by_id(&self, id: SymbolId) -> Option<&str> {
        let idx = (id.0 as usize).checked_sub(1)?;
        self.id_to_nm.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_nm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_nm.is_empty()
    }
}

static NIL: Value = Value::Nil;

/// Extra slots exposed whenever a write lands past the end of the
/// value table
const ENV_SLACK: usize = 10;

/// Proof of one dynamic binding; must be handed back to
/// [`Environment::dynamic_unbind`] in reverse order of creation
#[must_use = "a dynamic binding must be released with dynamic_unbind"]
#[derive(Debug)]
pub struct Binding {
    symbol: SymbolId,
    depth: usize,
}

impl Binding {
    pub fn symbol(&self) -> SymbolId {
        self.symbol
    }
}

/// Global values indexed by symbol ID, plus the save stack used for
/// dynamic rebinding
#[derive(Debug, Default)]
pub struct Environment {
    values: Vec<Value>,
    saved: Vec<(SymbolId, Value)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a symbol; nil if it was never set
    pub fn get(&self, sym: SymbolId) -> &Value {
        self.values.get(sym.0 as usize).unwrap_or(&NIL)
    }

    /// Sets the current value of a symbol, returning the old one
    pub fn set(&mut self, sym: SymbolId, val: Value) -> Value {
        let idx = sym.0 as usize;
        if idx >= self.values.len() {
            grow::ensure_len(&mut self.values, idx + ENV_SLACK);
        }

        std::mem::replace(&mut self.values[idx], val)
    }

    /// Saves the symbol's current value and overwrites it
    pub fn dynamic_bind(&mut self, sym: SymbolId, val: Value) -> Binding {
        let old = self.set(sym, val);
        self.saved.push((sym, old));

        Binding {
            symbol: sym,
            depth: self.saved.len() - 1,
        }
    }

    /// Restores the value saved by `binding`
    ///
    /// Only the most recent outstanding binding may be released; any
    /// other is refused, the environment is left untouched, and the
    /// token comes back with the error so it can be released later.
    pub fn dynamic_unbind(&mut self, binding: Binding) -> Result<(), (Binding, TernErr)> {
        match self.saved.last() {
            Some((sym, _)) if *sym == binding.symbol && binding.depth + 1 == self.saved.len() => {
                if let Some((sym, old)) = self.saved.pop() {
                    self.set(sym, old);
                }
                Ok(())
            }
            _ => {
                let err = TernErr::BindOrder(binding.symbol);
                Err((binding, err))
            }
        }
    }

    /// Number of outstanding dynamic bindings
    pub fn binding_depth(&self) -> usize {
        self.saved.len()
    }
}
