// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/grow.rs

// Geometric growth policy shared by every growable table in the
// runtime: the cons heap, the global environment, the opcode table,
// and the evaluator's frame array.

// <>

use std::ops::Range;

/// Smallest capacity handed out by a growth step
const MIN_CAP: usize = 4;

/// Returns the capacity a buffer currently holding `cap` slots should
/// move to so that at least `needed` slots fit
///
/// Capacity at least doubles on every growth step, so repeated growth
/// is amortized O(1) per element.
#[inline]
pub fn grow_capacity(cap: usize, needed: usize) -> usize {
    if needed <= cap {
        cap
    } else {
        (cap * 2).max(needed).max(MIN_CAP)
    }
}

/// Reserves geometrically so that `buf` can hold `needed` elements
/// without another reallocation
fn reserve_for<T>(buf: &mut Vec<T>, needed: usize) {
    if needed > buf.capacity() {
        let cap = grow_capacity(buf.capacity(), needed);
        buf.reserve_exact(cap - buf.len());
    }
}

/// Extends `buf` with default elements until its length is at least
/// `len`; never shrinks
pub fn ensure_len<T: Default>(buf: &mut Vec<T>, len: usize) {
    if buf.len() >= len {
        return;
    }

    reserve_for(buf, len);
    buf.resize_with(len, T::default);
}

/// Appends `count` default elements to `buf` and returns the index
/// range they occupy
pub fn alloc_elems<T: Default>(buf: &mut Vec<T>, count: usize) -> Range<usize> {
    let start = buf.len();
    let end = start + count;

    reserve_for(buf, end);
    buf.resize_with(end, T::default);

    start..end
}
