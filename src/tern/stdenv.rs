// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/stdenv.rs

// Functions which are part of the standard Tern environment and are
// loaded into every new context. Each is a thin bytecode wrapper
// around one builtin opcode.

// <>

use super::bytecode::Writer;
use super::opcode::Opcode;
use super::symtab::SymbolId;
use super::{Context, TernErr};

/// Generates the table of standard functions: name, wrapped opcode,
/// parameter names
macro_rules! tern_fn {
    ( const $array:ident;
      $( $name:literal $op:ident [ $($param:literal),* ] )+
    ) => {
        pub const $array: &[(&str, Opcode, &[&str])] = &[
            $( ($name, Opcode::$op, &[$($param),*]), )+
        ];
    };
}

tern_fn! {
    const ENVFNS;

    "+" Add ["fst", "snd"]
    "-" Sub ["fst", "snd"]
    "*" Mul ["fst", "snd"]
    "/" Div ["fst", "snd"]
    "cons" Cons ["car", "cdr"]
    "print" Print ["val"]
}

/// Body applying `op` to the function's arguments in order
fn wrapper_body(op: Opcode, argc: usize) -> Vec<u8> {
    let mut wd = Writer::new();
    wd.op_node(op);
    for slot in 0..argc {
        wd.local_node(slot as u32);
    }
    wd.into_inner()
}

/// Defines every standard function in `ctx`
pub fn load(ctx: &mut Context) -> Result<(), TernErr> {
    for (name, op, params) in ENVFNS {
        let sym = ctx.symbol(name);
        let params: Vec<SymbolId> = params.iter().map(|p| ctx.symbol(p)).collect();
        let body = wrapper_body(*op, params.len());
        ctx.load_function(sym, params, body)?;
    }

    log::debug!("loaded {} standard functions", ENVFNS.len());
    Ok(())
}
