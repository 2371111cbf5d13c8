// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/eval.rs

// Iterative frame-stack evaluator for Tern bytecode. Walks each tree
// depth first and applies operators post order, keeping pending nodes
// in an explicit frame array instead of on the host stack.

// <>

use super::bytecode::Reader;
use super::core::{Value, ValueType};
use super::grow;
use super::opcode::Opcode;
use super::symtab::SymbolId;
use super::{Context, TernErr};

/// Frames available to a fresh evaluator before the first growth
pub const INITIAL_FRAMES: usize = 64;

/// Pending state of one node in the tree being reduced
#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    opcode: u32,
    /// Stream offset where the node begins
    node_id: usize,
    /// Children not yet fully evaluated
    remaining: u32,
    call: Option<CallSite>,
}

#[derive(Debug, Clone, Copy)]
struct CallSite {
    symbol: SymbolId,
    argc: u32,
}

/// Value-producing node read in full before it touches the stack
enum Leaf {
    Int(i64),
    Local(u32),
    Get(SymbolId),
}

/// Tern bytecode evaluator
#[derive(Debug)]
pub struct Evaluator {
    frames: Vec<Frame>,
    cursor: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            frames: vec![Frame::default(); INITIAL_FRAMES],
            cursor: 0,
        }
    }

    /// Number of frames currently allocated
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Evaluates every top-level tree remaining in `rd`
    ///
    /// Results are left on the context's value stack. On error the
    /// pending frames are discarded, while whatever earlier nodes pushed
    /// stays where it is.
    pub fn run(&mut self, ctx: &mut Context, rd: &mut Reader) -> Result<(), TernErr> {
        self.cursor = 0;
        let out = self.walk(ctx, rd);

        if let Err(err) = &out {
            let node = self.frames.get(self.cursor).map_or(0, |f| f.node_id);
            log::error!(
                "evaluation aborted in node at {} (stream offset {}): {}",
                node,
                rd.offset(),
                err
            );
            self.cursor = 0;
        }

        out
    }

    fn walk(&mut self, ctx: &mut Context, rd: &mut Reader) -> Result<(), TernErr> {
        loop {
            if self.cursor >= self.frames.len() {
                let cap = grow::grow_capacity(self.frames.len(), self.cursor + 1);
                grow::ensure_len(&mut self.frames, cap);

                if cfg!(feature = "stkdbg") {
                    log::debug!("frame array grew to {}", cap);
                }
            }

            let node_id = rd.offset();
            self.frames[self.cursor] = Frame {
                node_id,
                ..Frame::default()
            };

            if rd.at_end() {
                return self.finish(node_id);
            }

            let raw = rd.read_u32_varint()?;
            if raw == Opcode::None.raw() {
                return self.finish(node_id);
            }

            let mut frame = Frame {
                opcode: raw,
                node_id,
                remaining: ctx.opcodes().lookup_def(raw)?.arity,
                call: None,
            };

            let leaf = match Opcode::from_raw(raw) {
                Some(Opcode::Int) => Some(Leaf::Int(rd.read_signed_varint()?)),
                Some(Opcode::Local) => Some(Leaf::Local(rd.read_u32_varint()?)),
                Some(Opcode::Get) => Some(Leaf::Get(SymbolId(rd.read_u32_varint()?))),
                Some(Opcode::Call) => {
                    let symbol = SymbolId(rd.read_u32_varint()?);
                    let argc = rd.read_u32_varint()?;
                    frame.remaining = argc;
                    frame.call = Some(CallSite { symbol, argc });
                    None
                }
                Some(Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div)
                | Some(Opcode::Cons | Opcode::Print) => None,
                _ => return Err(TernErr::NoHandler(raw)),
            };

            rd.expect_magic()?;

            if let Some(leaf) = leaf {
                frame.remaining = 0;
                let val = match leaf {
                    Leaf::Int(n) => Value::I64(n),
                    Leaf::Local(slot) => ctx.local(slot)?,
                    Leaf::Get(sym) => ctx.env().get(sym).clone(),
                };
                ctx.push(val);
            }

            self.frames[self.cursor] = frame;

            // descend into the next child, or apply and climb back up
            loop {
                let top = self.frames[self.cursor];

                if top.remaining > 0 {
                    if cfg!(feature = "stkdbg") {
                        log::debug!(
                            "PUSH: {:?} @{}; depth {}",
                            Opcode::from_raw(top.opcode),
                            top.node_id,
                            self.cursor + 1
                        );
                    }
                    self.cursor += 1;
                    break;
                }

                apply(ctx, &top)?;

                if cfg!(feature = "stkdbg") {
                    log::debug!(
                        "POP: {:?} @{}; depth {}",
                        Opcode::from_raw(top.opcode),
                        top.node_id,
                        self.cursor
                    );
                }

                if self.cursor == 0 {
                    break;
                }

                self.cursor -= 1;
                self.frames[self.cursor].remaining -= 1;
            }
        }
    }

    /// Stops cleanly only if no tree is half read
    fn finish(&self, offset: usize) -> Result<(), TernErr> {
        if self.cursor > 0 {
            return Err(TernErr::Truncated(offset));
        }
        Ok(())
    }
}

/// Runs a node's operator against the value stack once all of its
/// children have been reduced
fn apply(ctx: &mut Context, frame: &Frame) -> Result<(), TernErr> {
    match Opcode::from_raw(frame.opcode) {
        Some(Opcode::Add) => arith(ctx, "ADD", |l, r| Ok(l.wrapping_add(r))),
        Some(Opcode::Sub) => arith(ctx, "SUB", |l, r| Ok(l.wrapping_sub(r))),
        Some(Opcode::Mul) => arith(ctx, "MUL", |l, r| Ok(l.wrapping_mul(r))),
        Some(Opcode::Div) => arith(ctx, "DIV", |l, r| {
            if r == 0 {
                Err(TernErr::DivideByZero)
            } else {
                Ok(l.wrapping_div(r))
            }
        }),
        Some(Opcode::Cons) => {
            let cdr = ctx.pop()?;
            let car = ctx.pop()?;
            let cell = ctx.new_cons(car, cdr);
            ctx.push(Value::Cons(cell));
            Ok(())
        }
        Some(Opcode::Print) => {
            let val = ctx.pop()?;
            let text = ctx.display(&val).to_string();
            log::debug!("print: {}", text);
            println!("{}", text);
            Ok(())
        }
        Some(Opcode::Call) => match frame.call {
            Some(site) => call(ctx, site),
            None => Ok(()),
        },
        // leaves pushed their value when read
        _ => Ok(()),
    }
}

/// Binary operator on two 64-bit integers; the first pop is the right
/// operand
fn arith<F>(ctx: &mut Context, op: &'static str, f: F) -> Result<(), TernErr>
where
    F: Fn(i64, i64) -> Result<i64, TernErr>,
{
    let rhs = ctx.pop()?;
    let lhs = ctx.pop()?;

    let (l, r) = match (&lhs, &rhs) {
        (Value::I64(l), Value::I64(r)) => (*l, *r),
        (Value::I64(_), other) | (other, _) => {
            return Err(TernErr::TypeMismatch {
                op,
                expected: ValueType::I64,
                found: other.value_type(),
            })
        }
    };

    ctx.push(Value::I64(f(l, r)?));
    Ok(())
}

/// Invokes the function bound to the call's symbol
///
/// Arguments are visible to the body both as `Local` slots and as
/// dynamic bindings of the named parameters; both are released before
/// returning, whether or not the body succeeded.
fn call(ctx: &mut Context, site: CallSite) -> Result<(), TernErr> {
    let argc = site.argc as usize;

    let (params, code) = match ctx.env().get(site.symbol) {
        Value::Function(func) => {
            if func.params.len() != argc {
                return Err(TernErr::Arity {
                    symbol: site.symbol,
                    expected: func.params.len(),
                    found: argc,
                });
            }
            // owned copies: binding a parameter may overwrite the
            // value the body was read from
            (func.params.clone(), func.code.clone())
        }
        Value::Array(arr) if arr.elem == ValueType::Byte => (Vec::new(), arr.data.clone()),
        Value::Nil => return Err(TernErr::UnboundSymbol(site.symbol)),
        other => {
            return Err(TernErr::TypeMismatch {
                op: "CALL",
                expected: ValueType::Function,
                found: other.value_type(),
            })
        }
    };

    let args = ctx.pop_n(argc)?;

    log::debug!(
        "call {} with {} argument(s)",
        ctx.symbol_name(site.symbol),
        argc
    );

    ctx.with_bindings(&params, args, |ctx| {
        let mut rd = Reader::new(&code);
        Evaluator::new().run(ctx, &mut rd)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tern::bytecode::{Writer, MAGIC};

    fn run(ctx: &mut Context, wd: &Writer) -> Result<(), TernErr> {
        ctx.evaluate(wd.as_bytes())
    }

    #[test]
    fn operand_order() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Sub);
        wd.int_node(10);
        wd.int_node(3);
        wd.op_node(Opcode::Div);
        wd.int_node(-20);
        wd.int_node(6);

        run(&mut ctx, &wd).unwrap();
        assert_eq!(ctx.stack(), &[Value::I64(7), Value::I64(-3)]);
    }

    #[test]
    fn nested_arithmetic() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        // (* (+ 1 2) (- 10 4))
        wd.op_node(Opcode::Mul);
        wd.op_node(Opcode::Add);
        wd.int_node(1);
        wd.int_node(2);
        wd.op_node(Opcode::Sub);
        wd.int_node(10);
        wd.int_node(4);
        wd.terminate();

        run(&mut ctx, &wd).unwrap();
        assert_eq!(ctx.stack(), &[Value::I64(18)]);
    }

    #[test]
    fn deep_trees_grow_frames() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        for _ in 0..200 {
            wd.op_node(Opcode::Add);
            wd.int_node(1);
        }
        wd.int_node(1);

        let mut ev = Evaluator::new();
        ev.run(&mut ctx, &mut Reader::new(wd.as_bytes())).unwrap();

        assert!(ev.capacity() > INITIAL_FRAMES);
        assert_eq!(ctx.stack(), &[Value::I64(201)]);
    }

    #[test]
    fn wrapping_overflow() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Add);
        wd.int_node(i64::MAX);
        wd.int_node(1);

        run(&mut ctx, &wd).unwrap();
        assert_eq!(ctx.stack(), &[Value::I64(i64::MIN)]);
    }

    #[test]
    fn divide_by_zero() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Div);
        wd.int_node(1);
        wd.int_node(0);

        assert_eq!(run(&mut ctx, &wd), Err(TernErr::DivideByZero));
    }

    #[test]
    fn operand_types_checked() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Add);
        wd.int_node(1);
        wd.op_node(Opcode::Cons);
        wd.int_node(2);
        wd.int_node(3);

        assert_eq!(
            run(&mut ctx, &wd),
            Err(TernErr::TypeMismatch {
                op: "ADD",
                expected: ValueType::I64,
                found: ValueType::Cons,
            })
        );
    }

    #[test]
    fn cons_pairs_in_order() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Cons);
        wd.int_node(1);
        wd.int_node(2);

        run(&mut ctx, &wd).unwrap();
        let cell = ctx.pop().unwrap().as_cons().unwrap();
        assert_eq!(
            ctx.heap().read(cell).unwrap(),
            (Value::I64(1), Value::I64(2))
        );
    }

    #[test]
    fn truncated_tree() {
        let mut ctx = Context::new();
        let mut wd = Writer::new();
        wd.op_node(Opcode::Add);
        wd.int_node(1);

        assert_eq!(run(&mut ctx, &wd), Err(TernErr::Truncated(wd.offset())));

        wd.terminate();
        assert!(matches!(run(&mut ctx, &wd), Err(TernErr::Truncated(_))));
    }

    #[test]
    fn registered_opcode_without_handler() {
        let mut ctx = Context::new();
        ctx.opcodes_mut().register(40, "LERP", 3).unwrap();

        let bytes = [40, MAGIC];
        assert_eq!(ctx.evaluate(&bytes), Err(TernErr::NoHandler(40)));
        assert_eq!(ctx.evaluate(&[41, MAGIC]), Err(TernErr::UnknownOpcode(41)));
    }

    #[test]
    fn calls_bind_arguments() {
        let mut ctx = Context::new();
        let x = ctx.symbol("x");
        let y = ctx.symbol("y");
        let sub = ctx.symbol("sub2");

        // body: (- y x) via the dynamic bindings
        let mut body = Writer::new();
        body.op_node(Opcode::Sub);
        body.get_node(y);
        body.get_node(x);
        ctx.load_function(sub, vec![x, y], body.into_inner()).unwrap();

        ctx.env_mut().set(x, Value::I64(-1));

        let mut wd = Writer::new();
        wd.call_node(sub, 2);
        wd.int_node(3);
        wd.int_node(10);

        run(&mut ctx, &wd).unwrap();
        assert_eq!(ctx.stack(), &[Value::I64(7)]);

        // bindings and slots are gone after the call
        assert_eq!(ctx.env().get(x), &Value::I64(-1));
        assert!(ctx.env().get(y).nil_p());
        assert_eq!(ctx.env().binding_depth(), 0);
        assert_eq!(ctx.local(0), Err(TernErr::LocalSlot(0)));
    }

    #[test]
    fn failed_calls_release_bindings() {
        let mut ctx = Context::new();
        let x = ctx.symbol("x");
        let bad = ctx.symbol("bad");

        let mut body = Writer::new();
        body.op_node(Opcode::Div);
        body.local_node(0);
        body.int_node(0);
        ctx.load_function(bad, vec![x], body.into_inner()).unwrap();

        let mut wd = Writer::new();
        wd.call_node(bad, 1);
        wd.int_node(5);

        assert_eq!(run(&mut ctx, &wd), Err(TernErr::DivideByZero));
        assert_eq!(ctx.env().binding_depth(), 0);
        assert!(ctx.env().get(x).nil_p());
    }

    #[test]
    fn call_errors() {
        let mut ctx = Context::new();
        let nobody = ctx.symbol("nobody");
        let plus = ctx.symbol("+");
        let num = ctx.symbol("num");
        ctx.env_mut().set(num, Value::I64(4));

        let mut wd = Writer::new();
        wd.call_node(nobody, 0);
        assert_eq!(run(&mut ctx, &wd), Err(TernErr::UnboundSymbol(nobody)));

        wd.clear();
        wd.call_node(plus, 1);
        wd.int_node(1);
        assert_eq!(
            run(&mut ctx, &wd),
            Err(TernErr::Arity {
                symbol: plus,
                expected: 2,
                found: 1,
            })
        );

        wd.clear();
        wd.call_node(num, 0);
        assert!(matches!(
            run(&mut ctx, &wd),
            Err(TernErr::TypeMismatch { op: "CALL", .. })
        ));
    }

    #[test]
    fn raw_bytecode_callee() {
        let mut ctx = Context::new();
        let twice = ctx.symbol("twice");

        let mut body = Writer::new();
        body.op_node(Opcode::Add);
        body.local_node(0);
        body.local_node(0);
        ctx.load_function_bytecode(twice, body.as_bytes()).unwrap();

        let mut wd = Writer::new();
        wd.call_node(twice, 1);
        wd.int_node(21);

        run(&mut ctx, &wd).unwrap();
        assert_eq!(ctx.stack(), &[Value::I64(42)]);

        wd.clear();
        wd.local_node(1);
        assert_eq!(run(&mut ctx, &wd), Err(TernErr::LocalSlot(1)));
    }
}
