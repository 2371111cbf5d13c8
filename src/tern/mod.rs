// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/mod.rs

// Tern runtime instance, error type, value display, and the
// top-level entry points tying the compiler and evaluator together.

// <>

//! Tern, a compact bytecode Lisp
//!
//! Source text compiles to a self-describing bytecode tree, which an
//! iterative frame-stack evaluator reduces onto a value stack. Every
//! piece of runtime state lives in one [`Context`].

#[macro_use]
pub mod core;

pub mod bytecode;
pub mod eval;
pub mod grow;
pub mod memmgt;
pub mod opcode;
pub mod parser;
pub mod stdenv;
pub mod symtab;

use self::bytecode::Reader;
use self::core::{Value, ValueType};
use self::eval::Evaluator;
use self::memmgt::{ConsHeap, ConsRef};
use self::opcode::OpcodeRegistry;
use self::symtab::{Binding, Environment, SymbolId, SymbolTable};

use std::error;
use std::fmt;

/// Cons chains longer than this are cut off when displayed
const DISPLAY_LIMIT: usize = 1024;

/// Everything that can stop a Tern operation
#[derive(Debug, Clone, PartialEq)]
pub enum TernErr {
    /// Opcode name or number registered twice
    DuplicateOpcode(String),
    /// Function loaded for a symbol that already has a value
    DuplicateDefinition(SymbolId),
    UnknownOpcode(u64),
    /// Opcode registered but not understood by the evaluator
    NoHandler(u32),
    BadMagic {
        offset: usize,
        got: u8,
    },
    /// Stream ended inside a node or tree
    Truncated(usize),
    /// Overlong or out-of-range varint
    Varint(usize),
    TypeMismatch {
        op: &'static str,
        expected: ValueType,
        found: ValueType,
    },
    DivideByZero,
    StackUnderflow,
    /// Cons handle used after its cell was freed
    StaleCons(u32),
    /// Dynamic binding released out of order
    BindOrder(SymbolId),
    /// Call to a symbol with no function bound
    UnboundSymbol(SymbolId),
    Arity {
        symbol: SymbolId,
        expected: usize,
        found: usize,
    },
    /// Argument slot missing from the innermost call
    LocalSlot(u32),
    Parse {
        offset: usize,
        reason: &'static str,
    },
    /// Built-in self test found a broken invariant
    SelfTest(&'static str),
}

impl fmt::Display for TernErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TernErr::DuplicateOpcode(name) => write!(f, "opcode {} is already defined", name),
            TernErr::DuplicateDefinition(sym) => write!(f, "symbol {} is already defined", sym),
            TernErr::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
            TernErr::NoHandler(op) => write!(f, "no handler for opcode {}", op),
            TernErr::BadMagic { offset, got } => write!(
                f,
                "bad magic byte {:#04x} at offset {} (expected {:#04x})",
                got,
                offset,
                bytecode::MAGIC
            ),
            TernErr::Truncated(offset) => write!(f, "bytecode truncated at offset {}", offset),
            TernErr::Varint(offset) => write!(f, "malformed varint at offset {}", offset),
            TernErr::TypeMismatch {
                op,
                expected,
                found,
            } => write!(f, "{} expected {}, found {}", op, expected, found),
            TernErr::DivideByZero => write!(f, "division by zero"),
            TernErr::StackUnderflow => write!(f, "value stack underflow"),
            TernErr::StaleCons(idx) => write!(f, "stale cons handle {}", idx),
            TernErr::BindOrder(sym) => write!(f, "binding of {} released out of order", sym),
            TernErr::UnboundSymbol(sym) => write!(f, "no function bound to {}", sym),
            TernErr::Arity {
                symbol,
                expected,
                found,
            } => write!(
                f,
                "{} takes {} argument(s), got {}",
                symbol, expected, found
            ),
            TernErr::LocalSlot(slot) => write!(f, "no argument in slot {}", slot),
            TernErr::Parse { offset, reason } => {
                write!(f, "parse error at offset {}: {}", offset, reason)
            }
            TernErr::SelfTest(what) => write!(f, "self test failed: {}", what),
        }
    }
}

impl error::Error for TernErr {}

/// One Tern runtime instance
///
/// Owns the cons heap, symbols, global environment, opcode registry,
/// and value stack. Nothing is shared between contexts.
#[derive(Debug, Default)]
pub struct Context {
    heap: ConsHeap,
    symtab: SymbolTable,
    env: Environment,
    opcodes: OpcodeRegistry,
    stack: Vec<Value>,
    /// Argument slots of each active call, innermost last
    locals: Vec<Vec<Value>>,
}

impl Context {
    /// Creates a context with the builtin opcodes and the standard
    /// environment loaded
    pub fn new() -> Self {
        let mut ctx = Self::bare();

        if let Err(err) = stdenv::load(&mut ctx) {
            log::error!("standard environment failed to load: {}", err);
        }

        ctx
    }

    /// Creates a context with the builtin opcodes and nothing else
    pub fn bare() -> Self {
        Context {
            opcodes: OpcodeRegistry::standard(),
            ..Default::default()
        }
    }

    pub fn heap(&self) -> &ConsHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ConsHeap {
        &mut self.heap
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn opcodes(&self) -> &OpcodeRegistry {
        &self.opcodes
    }

    pub fn opcodes_mut(&mut self) -> &mut OpcodeRegistry {
        &mut self.opcodes
    }

    /// Current value stack, bottom first
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn symbol(&mut self, name: &str) -> SymbolId {
        self.symtab.intern(name)
    }

    /// Name of an interned symbol, for diagnostics
    pub fn symbol_name(&self, sym: SymbolId) -> &str {
        self.symtab.lookup_by_id(sym).unwrap_or("<unnamed>")
    }

    #[inline(always)]
    pub fn push(&mut self, val: Value) {
        log::trace!("push {:?}; depth {}", val, self.stack.len() + 1);
        self.stack.push(val);
    }

    pub fn push_i64(&mut self, n: i64) {
        self.push(Value::I64(n))
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<Value, TernErr> {
        let out = self.stack.pop().ok_or(TernErr::StackUnderflow)?;
        log::trace!("pop {:?}; depth {}", out, self.stack.len());
        Ok(out)
    }

    pub fn pop_i64(&mut self) -> Result<i64, TernErr> {
        let val = self.pop()?;
        val.as_i64().ok_or(TernErr::TypeMismatch {
            op: "POP",
            expected: ValueType::I64,
            found: val.value_type(),
        })
    }

    /// Pops `n` values, returned in the order they were pushed
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, TernErr> {
        let len = self.stack.len();
        if n > len {
            return Err(TernErr::StackUnderflow);
        }
        Ok(self.stack.split_off(len - n))
    }

    pub fn new_cons(&mut self, car: Value, cdr: Value) -> ConsRef {
        self.heap.cons(car, cdr)
    }

    pub fn free_cons(&mut self, cell: ConsRef) -> Result<(), TernErr> {
        self.heap.free(cell)
    }

    /// Argument `slot` of the innermost active call
    pub fn local(&self, slot: u32) -> Result<Value, TernErr> {
        self.locals
            .last()
            .and_then(|args| args.get(slot as usize))
            .cloned()
            .ok_or(TernErr::LocalSlot(slot))
    }

    /// Binds a raw bytecode body to `sym`; its arguments are reachable
    /// only through `Local`
    pub fn load_function_bytecode(&mut self, sym: SymbolId, code: &[u8]) -> Result<(), TernErr> {
        self.define_value(sym, Value::bytecode(code))
    }

    /// Binds a function with named parameters to `sym`
    pub fn load_function(
        &mut self,
        sym: SymbolId,
        params: Vec<SymbolId>,
        code: Vec<u8>,
    ) -> Result<(), TernErr> {
        self.define_value(sym, Value::function(params, code))
    }

    /// Compiles `source` as the body of a new function `name`
    pub fn define(&mut self, name: &str, params: &[&str], source: &str) -> Result<SymbolId, TernErr> {
        let sym = self.symbol(name);
        let params = params.iter().map(|p| self.symbol(p)).collect();
        let code = self.compile(source)?;

        self.load_function(sym, params, code)?;
        Ok(sym)
    }

    fn define_value(&mut self, sym: SymbolId, val: Value) -> Result<(), TernErr> {
        if !self.env.get(sym).nil_p() {
            log::warn!("{} ({}) is already defined", self.symbol_name(sym), sym);
            return Err(TernErr::DuplicateDefinition(sym));
        }

        self.env.set(sym, val);
        Ok(())
    }

    /// Compiles one expression into a NONE-terminated bytecode unit
    pub fn compile(&mut self, text: &str) -> Result<Vec<u8>, TernErr> {
        parser::compile(&mut self.symtab, text)
    }

    /// Evaluates bytecode, leaving its results on the value stack
    pub fn evaluate(&mut self, code: &[u8]) -> Result<(), TernErr> {
        Evaluator::new().run(self, &mut Reader::new(code))
    }

    /// Compiles and evaluates `text`, returning the values it produced
    ///
    /// On failure the stack is restored to its depth before the call.
    pub fn run_source(&mut self, text: &str) -> Result<Vec<Value>, TernErr> {
        let code = self.compile(text)?;
        let mark = self.stack.len();

        match self.evaluate(&code) {
            Ok(()) => Ok(self.stack.split_off(mark.min(self.stack.len()))),
            Err(err) => {
                self.stack.truncate(mark);
                Err(err)
            }
        }
    }

    /// Runs `body` with each parameter dynamically bound to its
    /// argument and the arguments visible as `Local` slots
    ///
    /// Bindings and slots are released in reverse on every exit path.
    pub fn with_bindings<R, F>(
        &mut self,
        params: &[SymbolId],
        args: Vec<Value>,
        body: F,
    ) -> Result<R, TernErr>
    where
        F: FnOnce(&mut Self) -> Result<R, TernErr>,
    {
        let bindings: Vec<Binding> = params
            .iter()
            .zip(args.iter())
            .map(|(sym, val)| self.env.dynamic_bind(*sym, val.clone()))
            .collect();
        self.locals.push(args);

        let out = body(self);

        self.locals.pop();
        let mut released = Ok(());
        for binding in bindings.into_iter().rev() {
            if let Err((_, err)) = self.env.dynamic_unbind(binding) {
                released = Err(err);
            }
        }

        let out = out?;
        released?;
        Ok(out)
    }

    /// Pairs a value with this context for display
    pub fn display<'a>(&'a self, val: &'a Value) -> ContextVal<'a> {
        ContextVal { ctx: self, val }
    }
}

/// Bundles together a value and its context for display
pub struct ContextVal<'a> {
    ctx: &'a Context,
    val: &'a Value,
}

impl fmt::Display for ContextVal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = self.ctx;

        match self.val {
            Value::Nil => write!(f, "()"),
            Value::Cons(cell) => {
                write!(f, "(")?;
                let mut cell = *cell;
                let mut shown = 0;

                loop {
                    let (car, cdr) = match ctx.heap.read(cell) {
                        Ok(pair) => pair,
                        Err(_) => return write!(f, "<stale cons {}>)", cell.index()),
                    };

                    write!(f, "{}", ctx.display(&car))?;
                    shown += 1;

                    match cdr {
                        Value::Nil => break,
                        Value::Cons(next) if shown < DISPLAY_LIMIT => {
                            write!(f, " ")?;
                            cell = next;
                        }
                        Value::Cons(_) => {
                            write!(f, " ...")?;
                            break;
                        }
                        tail => {
                            write!(f, " . {}", ctx.display(&tail))?;
                            break;
                        }
                    }
                }

                write!(f, ")")
            }
            Value::Symbol(sym) => match ctx.symtab.lookup_by_id(*sym) {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "{}", sym),
            },
            Value::I32(n) => write!(f, "{}", n),
            Value::I64(n) => write!(f, "{}", n),
            Value::F32(x) => write!(f, "{}", x),
            Value::F64(x) => write!(f, "{}", x),
            Value::Byte(b) => write!(f, "#x{:02x}", b),
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            Value::Array(arr) => write!(f, "<array {} x{}>", arr.elem, arr.byte_len()),
            Value::Function(func) => write!(f, "<function/{}>", func.params.len()),
            Value::Type(t) => write!(f, "<type {}>", t),
        }
    }
}

/// Interprets a Tern expression in a fresh context, returning its
/// rendered results
pub fn interpret(code: &str) -> Result<String, TernErr> {
    let mut ctx = Context::new();
    let results = ctx.run_source(code)?;

    let out: Vec<String> = results
        .iter()
        .map(|val| ctx.display(val).to_string())
        .collect();

    Ok(out.join(" "))
}

fn ensure(cond: bool, what: &'static str) -> Result<(), TernErr> {
    if cond {
        Ok(())
    } else {
        log::error!("self test: {}", what);
        Err(TernErr::SelfTest(what))
    }
}

/// Exercises each runtime component once
pub fn self_test() -> Result<(), TernErr> {
    let mut buf: Vec<u32> = Vec::new();
    let first = grow::alloc_elems(&mut buf, 3);
    let second = grow::alloc_elems(&mut buf, 5);
    ensure(first == (0..3) && second == (3..8), "buffer growth")?;

    let mut heap = ConsHeap::new();
    for _ in 0..40 {
        let mut held = Vec::with_capacity(32);
        for _ in 0..32 {
            let cell = heap.allocate();
            ensure(cell.index() < 50, "cons heap churn")?;
            held.push(cell);
        }
        for cell in held {
            heap.free(cell)?;
        }
    }

    let mut ctx = Context::new();
    ctx.push_i64(5);
    ctx.push(Value::Nil);
    ensure(ctx.pop()?.nil_p() && ctx.pop_i64()? == 5, "value stack")?;

    let one = ctx.symbol("test1");
    ensure(one == ctx.symbol("test1"), "symbol interning")?;
    ensure(one != ctx.symbol("test2"), "symbol interning")?;

    ctx.env_mut().set(one, Value::I64(5));
    ensure(ctx.env().get(one) == &Value::I64(5), "symbol values")?;

    let sum = ctx.run_source("(+ 1 2)")?;
    ensure(sum == [Value::I64(3)], "(+ 1 2)")?;
    ensure(ctx.stack().is_empty(), "stack left clean")?;

    log::info!("self test passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_self_test() {
        self_test().unwrap();
    }

    #[test]
    fn interpreting() {
        assert_eq!(interpret("(+ 1 2)").unwrap(), "3");
        assert_eq!(interpret("(* (- 10 4) (/ 9 3))").unwrap(), "18");
        assert!(interpret("(cons 1 (cons 2 (cons 3 ())))").is_err());
        assert_eq!(interpret("(print 7)").unwrap(), "");
        assert!(matches!(interpret("(+ 1"), Err(TernErr::Parse { .. })));
    }

    #[test]
    fn lists_display() {
        let mut ctx = Context::new();
        let sym = ctx.symbol("item");

        let tail = ctx.new_cons(Value::I64(3), Value::Nil);
        let mid = ctx.new_cons(Value::Symbol(sym), Value::Cons(tail));
        let head = ctx.new_cons(Value::I64(1), Value::Cons(mid));
        let pair = ctx.new_cons(Value::I64(1), Value::I64(2));

        assert_eq!(ctx.display(&Value::Cons(head)).to_string(), "(1 item 3)");
        assert_eq!(ctx.display(&Value::Cons(pair)).to_string(), "(1 . 2)");
        assert_eq!(ctx.display(&Value::Nil).to_string(), "()");

        ctx.free_cons(tail).unwrap();
        assert_eq!(
            ctx.display(&Value::Cons(head)).to_string(),
            format!("(1 item <stale cons {}>)", tail.index())
        );
    }

    #[test]
    fn strings_display_readably() {
        let ctx = Context::bare();
        let text = ctx
            .display(&Value::String("say \"hi\"".to_string()))
            .to_string();
        assert_eq!(text, "\"say \"\"hi\"\"\"");

        let mut src = parser::Source::new(&text);
        let mut out = Vec::new();
        src.read_str(parser::Scan::start(), &mut out).unwrap();
        assert_eq!(out, b"say \"hi\"");
    }

    #[test]
    fn cyclic_lists_display() {
        let mut ctx = Context::new();
        let cell = ctx.new_cons(Value::I64(0), Value::Nil);
        ctx.heap_mut().set_cdr(cell, Value::Cons(cell)).unwrap();

        let text = ctx.display(&Value::Cons(cell)).to_string();
        assert!(text.ends_with(" ...)"));
    }

    #[test]
    fn cons_through_calls() {
        let mut ctx = Context::new();
        let out = ctx.run_source("(cons 1 (cons 2 3))").unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(ctx.display(&out[0]).to_string(), "(1 2 . 3)");
    }

    #[test]
    fn pop_helpers() {
        let mut ctx = Context::bare();
        ctx.push_i64(1);
        ctx.push_i64(2);
        ctx.push_i64(3);

        assert_eq!(ctx.pop_n(4), Err(TernErr::StackUnderflow));
        assert_eq!(ctx.pop_n(2).unwrap(), vec![Value::I64(2), Value::I64(3)]);
        assert_eq!(ctx.pop_i64(), Ok(1));
        assert_eq!(ctx.pop(), Err(TernErr::StackUnderflow));

        ctx.push(Value::Byte(7));
        assert_eq!(
            ctx.pop_i64(),
            Err(TernErr::TypeMismatch {
                op: "POP",
                expected: ValueType::I64,
                found: ValueType::Byte,
            })
        );
        assert!(ctx.stack().is_empty());
    }

    #[test]
    fn failed_runs_restore_stack() {
        let mut ctx = Context::new();
        ctx.push_i64(9);

        assert_eq!(ctx.run_source("(+ 1 (/ 2 0))"), Err(TernErr::DivideByZero));
        assert_eq!(ctx.stack(), &[Value::I64(9)]);
    }

    #[test]
    fn defining_functions() {
        let mut ctx = Context::new();
        let four = ctx.define("four", &["n"], "(* 2 2)").unwrap();
        assert!(matches!(ctx.env().get(four), Value::Function(_)));

        assert_eq!(
            ctx.define("four", &["n"], "(+ 2 2)"),
            Err(TernErr::DuplicateDefinition(four))
        );
        assert_eq!(ctx.run_source("(four 5)").unwrap(), vec![Value::I64(4)]);
        assert!(matches!(
            ctx.run_source("(four)"),
            Err(TernErr::Arity { expected: 1, found: 0, .. })
        ));

        // a body that fails to compile defines nothing
        assert!(ctx.define("bad", &[], "(+ 1").is_err());
        assert!(ctx.env().get(ctx.symtab().lookup_by_name("bad").unwrap()).nil_p());
    }

    #[test]
    fn error_messages() {
        let err = TernErr::BadMagic {
            offset: 4,
            got: 0x12,
        };
        assert_eq!(
            err.to_string(),
            "bad magic byte 0x12 at offset 4 (expected 0x5a)"
        );
        assert_eq!(
            TernErr::Parse {
                offset: 2,
                reason: "unterminated list"
            }
            .to_string(),
            "parse error at offset 2: unterminated list"
        );
    }
}
