// SKIFF, a compact bytecode Lisp runtime.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// SKIFF is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/tern/core.rs

// The Tern object model: a closed sum type over every value variant,
// plus the owned out-of-line payloads (arrays and compiled functions)
// that some variants carry.

// <>

use super::memmgt::ConsRef;
use super::symtab::SymbolId;

use std::fmt;

/// Declares a fieldless `repr(u8)` enum along with a `TryFrom<u8>`
/// conversion covering exactly its variants
macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

enum_and_tryfrom! {
    /// Tag naming each Tern value variant; also used as the element
    /// type of arrays
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum ValueType {
        Nil = 0,
        Cons = 1,
        Symbol = 2,
        I32,
        I64,
        F32,
        F64,
        Byte,
        String,
        Array,
        Function,
        Type,
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Nil => "nil",
            ValueType::Cons => "cons",
            ValueType::Symbol => "symbol",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Byte => "byte",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Function => "function",
            ValueType::Type => "type",
        };
        write!(f, "{}", name)
    }
}

/// Owned blob of homogeneous elements, stored out of line
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub elem: ValueType,
    pub data: Vec<u8>,
}

impl Array {
    /// Length of the blob in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Compiled function: named positional parameters and a bytecode body
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Vec<SymbolId>,
    pub code: Vec<u8>,
}

/// A Tern value
///
/// Cloning is always deep: `Array` and `Function` payloads are owned
/// by exactly one value and are dropped with it, never aliased.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Cons(ConsRef),
    Symbol(SymbolId),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Byte(u8),
    String(String),
    Array(Box<Array>),
    Function(Box<Function>),
    Type(ValueType),
}

impl Value {
    /// Creates an array value owning a copy of `data`
    pub fn array(elem: ValueType, data: &[u8]) -> Self {
        Value::Array(Box::new(Array {
            elem,
            data: data.to_vec(),
        }))
    }

    /// Creates a byte array holding a compiled bytecode body
    pub fn bytecode(code: &[u8]) -> Self {
        Self::array(ValueType::Byte, code)
    }

    pub fn function(params: Vec<SymbolId>, code: Vec<u8>) -> Self {
        Value::Function(Box::new(Function { params, code }))
    }

    /// Returns the tag of the live variant
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Cons(_) => ValueType::Cons,
            Value::Symbol(_) => ValueType::Symbol,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Byte(_) => ValueType::Byte,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Function(_) => ValueType::Function,
            Value::Type(_) => ValueType::Type,
        }
    }

    #[inline(always)]
    pub fn nil_p(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_cons(&self) -> Option<ConsRef> {
        match self {
            Value::Cons(c) => Some(*c),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::I64(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::I32(n)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Value::F32(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::F64(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_follow_variants() {
        assert_eq!(Value::Nil.value_type(), ValueType::Nil);
        assert_eq!(Value::from(5i64).value_type(), ValueType::I64);
        assert_eq!(Value::from(5i32).value_type(), ValueType::I32);
        assert_eq!(Value::from(0.5f32).value_type(), ValueType::F32);
        assert_eq!(Value::from(0.5f64).value_type(), ValueType::F64);
        assert_eq!(Value::bytecode(&[1, 2]).value_type(), ValueType::Array);
        assert_eq!(
            Value::Type(ValueType::I64).value_type(),
            ValueType::Type
        );
        assert!(Value::default().nil_p());
    }

    #[test]
    fn tag_roundtrip() {
        assert_eq!(ValueType::try_from(4u8), Ok(ValueType::I64));
        assert_eq!(ValueType::try_from(0u8), Ok(ValueType::Nil));
        assert!(ValueType::try_from(200u8).is_err());
    }

    #[test]
    fn clone_does_not_alias_payload() {
        let a = Value::bytecode(&[7, 8, 9]);
        let mut b = a.clone();

        if let Value::Array(arr) = &mut b {
            arr.data[0] = 0;
        }

        match (&a, &b) {
            (Value::Array(x), Value::Array(y)) => {
                assert_eq!(x.data, vec![7, 8, 9]);
                assert_eq!(y.data, vec![0, 8, 9]);
                assert_eq!(x.elem, ValueType::Byte);
                assert_eq!(x.byte_len(), 3);
            }
            _ => unreachable!(),
        }
    }
}
