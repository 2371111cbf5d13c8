// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/parser.rs

// Reads Tern source text and compiles it straight to bytecode. Text
// primitives work on `Scan` positions, which are plain offsets; any
// number of them may be held at once and each read begins by moving
// the shared byte cursor to the position it was given.

// <>

use super::bytecode::{Reader, Writer};
use super::symtab::SymbolTable;
use super::TernErr;

/// Position in a source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scan {
    offset: usize,
}

impl Scan {
    pub fn start() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn offset(self) -> usize {
        self.offset
    }

    /// Position `n` bytes further on
    #[inline(always)]
    pub fn advance(self, n: usize) -> Self {
        Scan {
            offset: self.offset + n,
        }
    }
}

fn is_blank(c: u8) -> bool {
    c.is_ascii_whitespace()
}

fn is_endexpr(c: u8) -> bool {
    c == b'(' || c == b')' || c == b';' || is_blank(c)
}

fn parse_err(at: Scan, reason: &'static str) -> TernErr {
    TernErr::Parse {
        offset: at.offset,
        reason,
    }
}

/// Source text under a single byte cursor
pub struct Source<'a> {
    rd: Reader<'a>,
}

impl<'a> Source<'a> {
    pub fn new(text: &'a str) -> Self {
        Source {
            rd: Reader::new(text.as_bytes()),
        }
    }

    /// Moves the cursor to `at`, clamped to the end of the text
    fn fix(&mut self, at: Scan) {
        let target = at.offset.min(self.rd.size());
        let here = self.rd.offset();

        if here > target {
            self.rd.rewind(here - target);
        } else if here < target {
            // in range after clamping
            let _ = self.rd.advance(target - here);
        }
    }

    /// Byte at `at`; `None` past the end of the text
    pub fn next_byte(&mut self, at: Scan) -> Option<u8> {
        self.fix(at);
        self.rd.peek_u8()
    }

    fn scan_until<F>(&mut self, at: Scan, mut out: Option<&mut Vec<u8>>, f: F) -> Scan
    where
        F: Fn(u8) -> bool,
    {
        self.fix(at);
        let mut at = at;

        while let Some(c) = self.rd.peek_u8() {
            if f(c) {
                break;
            }
            if let Some(out) = out.as_deref_mut() {
                out.push(c);
            }
            // peeked, so in range
            let _ = self.rd.advance(1);
            at = at.advance(1);
        }

        at
    }

    /// Copies bytes into `out` up to the first byte satisfying `f`
    pub fn read_until<F: Fn(u8) -> bool>(&mut self, at: Scan, out: &mut Vec<u8>, f: F) -> Scan {
        self.scan_until(at, Some(out), f)
    }

    pub fn read_while<F: Fn(u8) -> bool>(&mut self, at: Scan, out: &mut Vec<u8>, f: F) -> Scan {
        self.scan_until(at, Some(out), |c| !f(c))
    }

    pub fn read_untilc(&mut self, at: Scan, out: &mut Vec<u8>, stop: u8) -> Scan {
        self.scan_until(at, Some(out), |c| c == stop)
    }

    pub fn skip_until<F: Fn(u8) -> bool>(&mut self, at: Scan, f: F) -> Scan {
        self.scan_until(at, None, f)
    }

    pub fn skip_while<F: Fn(u8) -> bool>(&mut self, at: Scan, f: F) -> Scan {
        self.scan_until(at, None, |c| !f(c))
    }

    pub fn skip_untilc(&mut self, at: Scan, stop: u8) -> Scan {
        self.scan_until(at, None, |c| c == stop)
    }

    /// Skips whitespace and `;` line comments
    pub fn skip_blank(&mut self, at: Scan) -> Scan {
        let mut at = self.skip_while(at, is_blank);
        while self.next_byte(at) == Some(b';') {
            at = self.skip_untilc(at, b'\n');
            at = self.skip_while(at, is_blank);
        }
        at
    }

    /// Reads a quoted string; a doubled quote stands for one quote
    pub fn read_str(&mut self, at: Scan, out: &mut Vec<u8>) -> Result<Scan, TernErr> {
        let start = self.skip_while(at, is_blank);
        if self.next_byte(start) != Some(b'"') {
            return Err(parse_err(start, "expected a string"));
        }

        let mut at = start.advance(1);
        loop {
            match self.next_byte(at) {
                None => return Err(parse_err(start, "unterminated string")),
                Some(b'"') => {
                    at = at.advance(1);
                    if self.next_byte(at) != Some(b'"') {
                        return Ok(at);
                    }
                    out.push(b'"');
                }
                Some(c) => out.push(c),
            }
            at = at.advance(1);
        }
    }

    /// Reads a hexadecimal token, with or without a `0x` prefix
    pub fn read_hex(&mut self, at: Scan, buf: &mut Vec<u8>) -> Result<(Scan, u64), TernErr> {
        buf.clear();
        let end = self.read_until(at, buf, is_endexpr);

        let token: &[u8] = buf;
        let digits = token.strip_prefix(b"0x").unwrap_or(token);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(parse_err(at, "malformed hex literal"));
        }

        let text =
            std::str::from_utf8(digits).map_err(|_| parse_err(at, "malformed hex literal"))?;
        let val =
            u64::from_str_radix(text, 16).map_err(|_| parse_err(at, "hex literal out of range"))?;

        Ok((end, val))
    }

    pub fn read_f64(&mut self, at: Scan, buf: &mut Vec<u8>) -> Result<(Scan, f64), TernErr> {
        buf.clear();
        let at = self.skip_while(at, is_blank);
        let end = self.read_until(at, buf, is_endexpr);

        std::str::from_utf8(buf)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|val| (end, val))
            .ok_or_else(|| parse_err(at, "malformed float literal"))
    }

    /// Reads a decimal integer with an optional leading minus sign
    pub fn read_integer(&mut self, at: Scan, buf: &mut Vec<u8>) -> Result<(Scan, i64), TernErr> {
        buf.clear();
        let at = self.skip_while(at, is_blank);
        let end = self.read_until(at, buf, is_endexpr);

        let token: &[u8] = buf;
        let digits = token.strip_prefix(b"-").unwrap_or(token);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(parse_err(at, "expected an integer"));
        }

        std::str::from_utf8(buf)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|val| (end, val))
            .ok_or_else(|| parse_err(at, "integer out of range"))
    }

    /// Reads a bare symbol name
    pub fn read_symbol(&mut self, at: Scan, buf: &mut Vec<u8>) -> Result<(Scan, String), TernErr> {
        buf.clear();
        let at = self.skip_while(at, is_blank);
        let end = self.read_until(at, buf, is_endexpr);

        if buf.is_empty() {
            return Err(parse_err(at, "expected a symbol"));
        }

        String::from_utf8(buf.clone())
            .map(|name| (end, name))
            .map_err(|_| parse_err(at, "symbol is not valid UTF-8"))
    }
}

/// Compiles one expression to a bytecode unit terminated with NONE
///
/// `expr := integer | #hex | '(' symbol expr* ')'`
pub fn compile(symtab: &mut SymbolTable, text: &str) -> Result<Vec<u8>, TernErr> {
    let mut comp = Compiler {
        src: Source::new(text),
        symtab,
        buf: Vec::new(),
    };

    let out = comp.unit();
    if let Err(err) = &out {
        log::error!("compilation failed: {}", err);
    }
    out
}

struct Compiler<'a, 't> {
    src: Source<'t>,
    symtab: &'a mut SymbolTable,
    // token scratch space
    buf: Vec<u8>,
}

impl Compiler<'_, '_> {
    fn unit(&mut self) -> Result<Vec<u8>, TernErr> {
        let mut out = Writer::new();

        let at = self.expr(Scan::start(), &mut out)?;
        let at = self.src.skip_blank(at);
        if self.src.next_byte(at).is_some() {
            return Err(parse_err(at, "unexpected input after expression"));
        }

        out.terminate();
        Ok(out.into_inner())
    }

    fn expr(&mut self, at: Scan, out: &mut Writer) -> Result<Scan, TernErr> {
        let at = self.src.skip_blank(at);

        match self.src.next_byte(at) {
            None => Err(parse_err(at, "expected an expression")),
            Some(b'(') => self.list(at.advance(1), out),
            Some(b'#') => {
                // hex literals keep their bit pattern
                let (at, val) = self.src.read_hex(at.advance(1), &mut self.buf)?;
                out.int_node(val as i64);
                Ok(at)
            }
            Some(b')') => Err(parse_err(at, "unexpected ')'")),
            Some(_) => {
                let (at, val) = self.src.read_integer(at, &mut self.buf)?;
                log::trace!("int literal {}", val);
                out.int_node(val);
                Ok(at)
            }
        }
    }

    /// Children are buffered so the call header can carry their count
    fn list(&mut self, at: Scan, out: &mut Writer) -> Result<Scan, TernErr> {
        let open = at;
        let (mut at, name) = self.src.read_symbol(at, &mut self.buf)?;
        let sym = self.symtab.intern(&name);

        let mut body = Writer::new();
        let mut count = 0u32;

        loop {
            at = self.src.skip_blank(at);
            match self.src.next_byte(at) {
                None => return Err(parse_err(open, "unterminated list")),
                Some(b')') => break,
                Some(_) => {
                    at = self.expr(at, &mut body)?;
                    count += 1;
                }
            }
        }

        out.call_node(sym, count);
        out.write(body.as_bytes());

        Ok(at.advance(1))
    }
}
