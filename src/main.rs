// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Runs the built-in self test, then evaluates an embedded demo.

// <>

use skiff::tern::{
    self,
    bytecode::{self, Writer},
    opcode::Opcode,
    Context,
};

use std::process;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    if let Err(err) = tern::self_test() {
        log::error!("{}", err);
        process::exit(1);
    }

    // (print (+ 10 10)), assembled by hand
    let mut demo = Writer::new();
    demo.op_node(Opcode::Print);
    demo.op_node(Opcode::Add);
    demo.int_node(10);
    demo.int_node(10);
    demo.terminate();

    let mut ctx = Context::new();

    match bytecode::disassemble(demo.as_bytes(), ctx.opcodes()) {
        Ok(listing) => log::info!("demo bytecode:\n{}", listing),
        Err(err) => log::warn!("demo bytecode does not disassemble: {}", err),
    }

    if let Err(err) = ctx.evaluate(demo.as_bytes()) {
        log::error!("demo failed: {}", err);
        process::exit(1);
    }

    match tern::interpret("(cons (* 6 7) (cons (- 1 2) (/ 81 9)))") {
        Ok(out) => println!("{}", out),
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}
