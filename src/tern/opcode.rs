// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/opcode.rs

// Opcode numbers and the registry mapping each to a name and a
// declared child count. Built once per context, consulted by both
// the compiler and the evaluator.

// <>

use super::grow;
use super::TernErr;

use rustc_hash::FxHashMap;

enum_and_tryfrom! {
    /// Operation code at the start of every bytecode node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum Opcode {
        /// Terminates a compile unit
        None = 0,
        /// car, cdr
        Cons = 1,
        /// lhs, rhs
        Add = 2,
        /// lhs, rhs
        Sub = 3,
        /// lhs, rhs
        Mul = 4,
        /// lhs, rhs
        Div = 5,
        /// Immediate signed integer; leaf
        Int = 6,
        /// One value to render
        Print = 7,
        /// Immediate symbol and argument count; arguments follow
        Call = 8,
        /// Immediate argument slot; leaf
        Local = 9,
        /// Immediate symbol whose global value is pushed; leaf
        Get = 10,
    }
}

impl Opcode {
    /// Decodes a raw opcode as read off a stream
    #[inline(always)]
    pub fn from_raw(raw: u32) -> Option<Self> {
        u8::try_from(raw).ok().and_then(|b| Self::try_from(b).ok())
    }

    #[inline(always)]
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Builtin opcodes with their registry names and declared child counts;
/// `Call` takes its real count from the stream
const BUILTINS: &[(Opcode, &str, u32)] = &[
    (Opcode::Add, "ADD", 2),
    (Opcode::Sub, "SUB", 2),
    (Opcode::Mul, "MUL", 2),
    (Opcode::Div, "DIV", 2),
    (Opcode::Cons, "CONS", 2),
    (Opcode::Print, "PRINT", 1),
    (Opcode::Int, "INT", 0),
    (Opcode::Call, "CALL", 0),
    (Opcode::Local, "LOCAL", 0),
    (Opcode::Get, "GET", 0),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeDef {
    pub opcode: u32,
    pub name: String,
    pub arity: u32,
}

#[derive(Debug, Default)]
pub struct OpcodeRegistry {
    defs: Vec<Option<OpcodeDef>>,
    names: FxHashMap<String, u32>,
}

impl OpcodeRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every builtin opcode
    pub fn standard() -> Self {
        let mut out = Self::new();
        for (op, name, arity) in BUILTINS {
            // a fresh registry cannot hold duplicates
            let _ = out.register(op.raw(), name, *arity);
        }
        out
    }

    /// Registers an opcode; a name or number already in use is refused
    /// and the existing registration is kept
    pub fn register(&mut self, opcode: u32, name: &str, arity: u32) -> Result<(), TernErr> {
        if self.names.contains_key(name) || self.def(opcode).is_some() {
            log::warn!("opcode '{}' ({}) is already defined", name, opcode);
            return Err(TernErr::DuplicateOpcode(name.to_owned()));
        }

        let idx = opcode as usize;
        if idx >= self.defs.len() {
            grow::ensure_len(&mut self.defs, (idx * 2).max(idx + 1));
        }

        self.defs[idx] = Some(OpcodeDef {
            opcode,
            name: name.to_owned(),
            arity,
        });
        self.names.insert(name.to_owned(), opcode);

        Ok(())
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    /// Definition of a registered opcode
    pub fn lookup_def(&self, opcode: u32) -> Result<&OpcodeDef, TernErr> {
        self.def(opcode).ok_or(TernErr::UnknownOpcode(opcode as u64))
    }

    pub fn name(&self, opcode: u32) -> Option<&str> {
        self.def(opcode).map(|d| d.name.as_str())
    }

    fn def(&self, opcode: u32) -> Option<&OpcodeDef> {
        self.defs.get(opcode as usize).and_then(Option::as_ref)
    }
}
