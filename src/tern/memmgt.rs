// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/memmgt.rs

// Memory management for Tern cons cells. A contiguous pool of cells
// with a free list threaded through the cdr of every unused cell;
// lifetimes are managed entirely by the caller.

// <>

use super::core::Value;
use super::grow;
use super::TernErr;

/// Handle to a cons cell in a heap
///
/// The generation is bumped every time a cell is freed, so a handle
/// kept past `free` is detected rather than silently reading the
/// cell's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsRef {
    index: u32,
    generation: u32,
}

impl ConsRef {
    /// Position of the cell in its heap; never 0 for an allocated cell
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct Cell {
    car: Value,
    cdr: Value,
    generation: u32,
    live: bool,
}

/// Index 0 is never handed out; a free link pointing at it marks the
/// end of the free list
const FREE_END: u32 = 0;

/// Pool of cons cells backed by a free list
#[derive(Debug, Default)]
pub struct ConsHeap {
    cells: Vec<Cell>,
    /// Head of the free list
    free: u32,
    /// Number of cells currently allocated
    live: usize,
}

impl ConsHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of slots, including the reserved slot 0
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of cells currently allocated
    pub fn live(&self) -> usize {
        self.live
    }

    /// Pops a cell off the free list, growing the pool first if the
    /// list is empty
    pub fn allocate(&mut self) -> ConsRef {
        if self.free == FREE_END {
            self.grow();
        }

        let index = self.free;
        let cell = &mut self.cells[index as usize];

        self.free = match cell.cdr {
            Value::Cons(link) => link.index,
            _ => FREE_END,
        };

        cell.car = Value::Nil;
        cell.cdr = Value::Nil;
        cell.live = true;
        self.live += 1;

        ConsRef {
            index,
            generation: cell.generation,
        }
    }

    /// Allocates a cell and fills it
    pub fn cons(&mut self, car: Value, cdr: Value) -> ConsRef {
        let out = self.allocate();
        let cell = &mut self.cells[out.index as usize];
        cell.car = car;
        cell.cdr = cdr;
        out
    }

    /// Returns a cell to the free list; the handle (and every copy of
    /// it) is invalid afterwards
    pub fn free(&mut self, loc: ConsRef) -> Result<(), TernErr> {
        self.check(loc)?;

        let cell = &mut self.cells[loc.index as usize];
        cell.generation = cell.generation.wrapping_add(1);
        self.link_free(loc.index);
        self.live -= 1;

        if cfg!(feature = "memdbg") {
            log::debug!("freed cons {}; {} live", loc.index, self.live);
        }

        Ok(())
    }

    /// Returns copies of both fields of a cell
    pub fn read(&self, loc: ConsRef) -> Result<(Value, Value), TernErr> {
        let cell = self.cell(loc)?;
        Ok((cell.car.clone(), cell.cdr.clone()))
    }

    pub fn car(&self, loc: ConsRef) -> Result<&Value, TernErr> {
        Ok(&self.cell(loc)?.car)
    }

    pub fn cdr(&self, loc: ConsRef) -> Result<&Value, TernErr> {
        Ok(&self.cell(loc)?.cdr)
    }

    pub fn set_car(&mut self, loc: ConsRef, val: Value) -> Result<(), TernErr> {
        self.check(loc)?;
        self.cells[loc.index as usize].car = val;
        Ok(())
    }

    pub fn set_cdr(&mut self, loc: ConsRef, val: Value) -> Result<(), TernErr> {
        self.check(loc)?;
        self.cells[loc.index as usize].cdr = val;
        Ok(())
    }

    fn cell(&self, loc: ConsRef) -> Result<&Cell, TernErr> {
        self.check(loc)?;
        Ok(&self.cells[loc.index as usize])
    }

    fn check(&self, loc: ConsRef) -> Result<(), TernErr> {
        match self.cells.get(loc.index as usize) {
            Some(cell)
                if loc.index != FREE_END && cell.live && cell.generation == loc.generation =>
            {
                Ok(())
            }
            _ => Err(TernErr::StaleCons(loc.index)),
        }
    }

    /// Pushes a cell onto the free list; its cdr becomes the link
    fn link_free(&mut self, index: u32) {
        let cell = &mut self.cells[index as usize];
        cell.car = Value::Nil;
        cell.cdr = Value::Cons(ConsRef {
            index: self.free,
            generation: 0,
        });
        cell.live = false;
        self.free = index;
    }

    /// Grows the pool by half plus slack; every new slot goes onto the
    /// free list in ascending order
    fn grow(&mut self) {
        let old_len = self.cells.len();
        let new_len = (old_len + 2) * 3 / 2;

        grow::ensure_len(&mut self.cells, new_len);

        for index in old_len.max(1)..new_len {
            self.link_free(index as u32);
        }

        if cfg!(feature = "memdbg") {
            log::debug!("cons heap grew from {} to {} cells", old_len, new_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn churn_stays_compact() {
        let mut heap = ConsHeap::new();

        for _ in 0..40 {
            let mut held = Vec::with_capacity(32);
            for _ in 0..32 {
                let c = heap.allocate();
                assert!(c.index() < 50);
                held.push(c);
            }
            for c in held {
                heap.free(c).unwrap();
            }
        }

        assert!(heap.is_empty());
        assert!(heap.len() < 50);
    }

    #[test]
    fn index_zero_reserved() {
        let mut heap = ConsHeap::new();
        let all: Vec<_> = (0..100).map(|_| heap.allocate()).collect();

        assert!(all.iter().all(|c| c.index() != 0));

        let mut idx: Vec<_> = all.iter().map(|c| c.index()).collect();
        idx.sort_unstable();
        idx.dedup();
        assert_eq!(idx.len(), 100);
    }

    #[test]
    fn fresh_slots_pop_descending() {
        let mut heap = ConsHeap::new();

        // the first growth makes slots 1 and 2, pushed in ascending order
        assert_eq!(heap.allocate().index(), 2);
        assert_eq!(heap.allocate().index(), 1);
        assert_eq!(heap.len(), 3);
    }

    #[test]
    fn stale_handles_rejected() {
        let mut heap = ConsHeap::new();
        let c = heap.cons(Value::I64(1), Value::Nil);

        heap.free(c).unwrap();

        assert_eq!(heap.free(c), Err(TernErr::StaleCons(c.index())));
        assert!(heap.read(c).is_err());

        // the slot is reused under a new generation
        let d = heap.allocate();
        assert_eq!(d.index(), c.index());
        assert_ne!(d.generation(), c.generation());
        assert!(heap.read(c).is_err());
        assert_eq!(heap.read(d).unwrap(), (Value::Nil, Value::Nil));
    }

    #[test]
    fn fields() {
        let mut heap = ConsHeap::new();
        let tail = heap.cons(Value::I64(2), Value::Nil);
        let head = heap.cons(Value::I64(1), Value::Cons(tail));

        assert_eq!(heap.car(head).unwrap(), &Value::I64(1));
        assert_eq!(heap.cdr(head).unwrap(), &Value::Cons(tail));

        heap.set_car(tail, Value::I64(20)).unwrap();
        heap.set_cdr(tail, Value::I32(3)).unwrap();

        assert_eq!(heap.read(tail).unwrap(), (Value::I64(20), Value::I32(3)));
        assert_eq!(heap.live(), 2);
    }
}
