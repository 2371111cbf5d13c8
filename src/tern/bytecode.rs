// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/bytecode.rs

// Byte cursors over Tern bytecode with LEB128 varints, emitters for
// each node layout, and a disassembler for diagnostics.

// <>

//! Node layouts (all integers LEB128 unless noted):
//!
//! | Node | Layout |
//! |---|---|
//! | `Int` | opcode, signed value, magic |
//! | `Add` `Sub` `Mul` `Div` `Cons` | opcode, magic, two children |
//! | `Print` | opcode, magic, one child |
//! | `Call` | opcode, symbol, child count, magic, children |
//! | `Local` | opcode, slot, magic |
//! | `Get` | opcode, symbol, magic |
//! | `None` | a single zero byte |

use super::opcode::{Opcode, OpcodeRegistry};
use super::symtab::SymbolId;
use super::TernErr;

use std::fmt::Write as _;

/// Synchronization byte closing the immediates of every node
pub const MAGIC: u8 = 0x5A;

/// Longest LEB128 encoding of a 64-bit integer
const MAX_VARINT_LEN: usize = 10;

/// Read cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8, TernErr> {
        let out = self.peek_u8().ok_or(TernErr::Truncated(self.offset))?;
        self.offset += 1;
        Ok(out)
    }

    pub fn advance(&mut self, n: usize) -> Result<(), TernErr> {
        if n > self.data.len() - self.offset {
            return Err(TernErr::Truncated(self.data.len()));
        }
        self.offset += n;
        Ok(())
    }

    /// Moves the cursor back by `n` bytes, stopping at the start
    pub fn rewind(&mut self, n: usize) {
        self.offset = self.offset.saturating_sub(n);
    }

    pub fn read_unsigned_varint(&mut self) -> Result<u64, TernErr> {
        let start = self.offset;
        let mut out: u64 = 0;

        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7F) as u64;

            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(TernErr::Varint(start));
            }

            out |= bits << (7 * i);

            if byte & 0x80 == 0 {
                return Ok(out);
            }
        }

        Err(TernErr::Varint(start))
    }

    pub fn read_signed_varint(&mut self) -> Result<i64, TernErr> {
        let start = self.offset;
        let mut out: i64 = 0;

        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;

            // the last byte holds only bit 63, already sign-extended
            if i == MAX_VARINT_LEN - 1 {
                return match byte {
                    0x00 => Ok(out),
                    0x7F => Ok(out | i64::MIN),
                    _ => Err(TernErr::Varint(start)),
                };
            }

            let shift = 7 * i;
            out |= ((byte & 0x7F) as i64) << shift;

            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 {
                    out |= -1i64 << (shift + 7);
                }
                return Ok(out);
            }
        }

        Err(TernErr::Varint(start))
    }

    /// Reads an unsigned varint that must fit in 32 bits
    pub fn read_u32_varint(&mut self) -> Result<u32, TernErr> {
        let start = self.offset;
        let raw = self.read_unsigned_varint()?;
        u32::try_from(raw).map_err(|_| TernErr::Varint(start))
    }

    /// Consumes the synchronization byte closing a node
    pub fn expect_magic(&mut self) -> Result<(), TernErr> {
        let at = self.offset;
        let got = self.read_u8()?;
        if got != MAGIC {
            return Err(TernErr::BadMagic { offset: at, got });
        }
        Ok(())
    }
}

/// Growable output buffer
#[derive(Debug, Clone, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear()
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.data.push(byte)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    pub fn write_unsigned_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.write_u8(byte);
                return;
            }
            self.write_u8(byte | 0x80);
        }
    }

    pub fn write_signed_varint(&mut self, mut val: i64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;

            let done = (val == 0 && byte & 0x40 == 0) || (val == -1 && byte & 0x40 != 0);
            if done {
                self.write_u8(byte);
                return;
            }
            self.write_u8(byte | 0x80);
        }
    }

    // node emitters

    /// Header of a node whose only immediate is the opcode itself
    pub fn op_node(&mut self, op: Opcode) {
        self.write_unsigned_varint(op.raw() as u64);
        self.write_u8(MAGIC);
    }

    pub fn int_node(&mut self, val: i64) {
        self.write_unsigned_varint(Opcode::Int.raw() as u64);
        self.write_signed_varint(val);
        self.write_u8(MAGIC);
    }

    /// Header of a call; exactly `argc` child nodes must follow
    pub fn call_node(&mut self, sym: SymbolId, argc: u32) {
        self.write_unsigned_varint(Opcode::Call.raw() as u64);
        self.write_unsigned_varint(sym.get() as u64);
        self.write_unsigned_varint(argc as u64);
        self.write_u8(MAGIC);
    }

    pub fn local_node(&mut self, slot: u32) {
        self.write_unsigned_varint(Opcode::Local.raw() as u64);
        self.write_unsigned_varint(slot as u64);
        self.write_u8(MAGIC);
    }

    pub fn get_node(&mut self, sym: SymbolId) {
        self.write_unsigned_varint(Opcode::Get.raw() as u64);
        self.write_unsigned_varint(sym.get() as u64);
        self.write_u8(MAGIC);
    }

    /// Ends a compile unit
    pub fn terminate(&mut self) {
        self.write_unsigned_varint(Opcode::None.raw() as u64);
    }
}

/// Renders one line per node, indented by nesting depth
///
/// Walks the same way the evaluator does, so a stream that
/// disassembles cleanly is at least structurally sound.
pub fn disassemble(code: &[u8], opcodes: &OpcodeRegistry) -> Result<String, TernErr> {
    let mut rd = Reader::new(code);
    let mut out = String::new();
    // children still expected at each open level
    let mut open: Vec<u32> = Vec::new();

    while !rd.at_end() {
        let at = rd.offset();
        let raw = rd.read_u32_varint()?;
        let indent = open.len() * 2;

        if raw == Opcode::None.raw() {
            let _ = writeln!(out, "{:04} {:indent$}NONE", at, "", indent = indent);
            continue;
        }

        let def = opcodes.lookup_def(raw)?;
        let mut children = def.arity;
        let _ = write!(out, "{:04} {:indent$}{}", at, "", def.name, indent = indent);

        match Opcode::from_raw(raw) {
            Some(Opcode::Int) => {
                let _ = write!(out, " {}", rd.read_signed_varint()?);
            }
            Some(Opcode::Call) => {
                let sym = rd.read_u32_varint()?;
                children = rd.read_u32_varint()?;
                let _ = write!(out, " sym={} argc={}", sym, children);
            }
            Some(Opcode::Local) => {
                let _ = write!(out, " {}", rd.read_u32_varint()?);
            }
            Some(Opcode::Get) => {
                let _ = write!(out, " sym={}", rd.read_u32_varint()?);
            }
            Some(Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div)
            | Some(Opcode::Cons | Opcode::Print) => {}
            _ => return Err(TernErr::NoHandler(raw)),
        }

        rd.expect_magic()?;
        out.push('\n');

        if children > 0 {
            open.push(children);
        } else {
            // close every level this leaf completes
            while let Some(top) = open.last_mut() {
                *top -= 1;
                if *top > 0 {
                    break;
                }
                open.pop();
            }
        }
    }

    Ok(out)
}
