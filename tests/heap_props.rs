// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// tests/heap_props.rs

// Property tests for the cons heap and symbol table.

// <>

use skiff::tern::core::Value;
use skiff::tern::memmgt::ConsHeap;
use skiff::tern::symtab::SymbolTable;

use proptest::prelude::*;

use std::collections::HashSet;

/// Allocation count together with a permutation of 0..count
fn count_and_order() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..120).prop_flat_map(|n| (Just(n), Just((0..n).collect::<Vec<_>>()).prop_shuffle()))
}

fn symbol_name() -> impl Strategy<Value = String> {
    "[a-z+*/-][a-z0-9-]{0,8}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn freed_cells_come_back_lifo((n, order) in count_and_order()) {
        let mut heap = ConsHeap::new();
        let held: Vec<_> = (0..n).map(|_| heap.allocate()).collect();

        let distinct: HashSet<u32> = held.iter().map(|c| c.index()).collect();
        prop_assert_eq!(distinct.len(), n);

        for &i in &order {
            heap.free(held[i]).unwrap();
        }
        prop_assert!(heap.is_empty());

        let again: Vec<u32> = (0..n).map(|_| heap.allocate().index()).collect();
        let expected: Vec<u32> = order.iter().rev().map(|&i| held[i].index()).collect();
        prop_assert_eq!(again, expected);
    }

    #[test]
    fn growth_preserves_contents(first in 1usize..60, extra in 1usize..200) {
        let mut heap = ConsHeap::new();
        let cells: Vec<_> = (0..first)
            .map(|i| heap.cons(Value::I64(i as i64), Value::I64(-(i as i64))))
            .collect();

        let before = heap.len();
        for _ in 0..extra {
            heap.allocate();
        }
        prop_assert!(heap.len() >= before);

        for (i, cell) in cells.iter().enumerate() {
            prop_assert_eq!(
                heap.read(*cell).unwrap(),
                (Value::I64(i as i64), Value::I64(-(i as i64)))
            );
        }
        prop_assert_eq!(heap.live(), first + extra);
    }

    #[test]
    fn interning_is_stable(names in prop::collection::vec(symbol_name(), 1..50)) {
        let mut tab = SymbolTable::new();
        let ids: Vec<_> = names.iter().map(|n| tab.intern(n)).collect();

        for (name, id) in names.iter().zip(&ids) {
            prop_assert!(id.get() != 0);
            prop_assert_eq!(tab.intern(name), *id);
            prop_assert_eq!(tab.lookup_by_id(*id), Some(name.as_str()));
        }

        let unique_names: HashSet<&String> = names.iter().collect();
        let unique_ids: HashSet<_> = ids.iter().collect();
        prop_assert_eq!(unique_names.len(), unique_ids.len());
        prop_assert_eq!(tab.len(), unique_names.len());
    }
}
