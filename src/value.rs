//! Representation of Scheme values
//!
//! The same type serves as the expression tree produced by the reader and as
//! the runtime value manipulated by the VM. Trees built by the reader are
//! acyclic, and every pair owns its two children.
use core::fmt;
use std::{mem, rc::Rc};

use crate::runtime::Procedure;

pub type Integer = i32;

// Type that stores all possible values!
#[derive(Clone, Default, Debug, PartialEq)]
pub enum Value {
    // This is the value written as ()
    #[default]
    Null,
    Boolean(bool),
    // Bounded by the 4-byte word of the bytecode format
    Number(Integer),
    Symbol(Rc<str>),
    Pair(Rc<Pair>),
    // Represents something runnable (only ever created at run time)
    Procedure(Procedure),
}

#[derive(Clone, Debug)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

// Lists can be far longer than the host stack is deep, so comparing and
// dropping walk the cdr chain in a loop. Only car nesting recurses.
impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (self, other);
        loop {
            if a.car != b.car {
                return false;
            }
            match (&a.cdr, &b.cdr) {
                (Value::Pair(x), Value::Pair(y)) => {
                    if Rc::ptr_eq(x, y) {
                        return true;
                    }
                    a = x;
                    b = y;
                }
                (x, y) => return x == y,
            }
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        let mut next = mem::take(&mut self.cdr);
        while let Value::Pair(rc) = next {
            match Rc::try_unwrap(rc) {
                Ok(mut pair) => next = mem::take(&mut pair.cdr),
                // still shared, whoever holds it drops the rest
                Err(_) => break,
            }
        }
    }
}

impl Value {
    pub fn symbol(name: impl AsRef<str>) -> Self {
        Self::Symbol(Rc::from(name.as_ref()))
    }

    pub fn cons(car: Value, cdr: Value) -> Self {
        Self::Pair(Rc::new(Pair { car, cdr }))
    }

    /// Builds a proper list out of the given elements
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::list_with_tail(items, Value::Null)
    }

    /// Builds a list ending in `tail` instead of null (dotted when `tail` is not a list)
    pub fn list_with_tail(items: impl IntoIterator<Item = Value>, tail: Value) -> Self {
        let items: Vec<_> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Self::cons(item, acc))
    }

    pub fn as_number(&self) -> Option<Integer> {
        match self {
            Self::Number(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(sym) => Some(sym.as_ref()),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<&Pair> {
        match self {
            Self::Pair(pair) => Some(pair.as_ref()),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<&Procedure> {
        match self {
            Self::Procedure(proc) => Some(proc),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Only `#f` is false, everything else (including `()`) is true
    pub fn is_true(&self) -> bool {
        !matches!(self, Self::Boolean(false))
    }

    /// Walks the cdr chain of a list
    pub fn iter_list(&self) -> ListIter<'_> {
        ListIter { rest: self }
    }

    /// Collects a proper list, or returns `None` if the list is improper
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        let mut iter = self.iter_list();
        let items: Vec<_> = iter.by_ref().cloned().collect();
        iter.tail().is_null().then_some(items)
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::Symbol(_) => "symbol",
            Self::Pair(_) => "pair",
            Self::Procedure(_) => "procedure",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Number(value)
    }
}

/// Iterator over the elements of a (possibly improper) list.
///
/// Once exhausted, [`ListIter::tail`] is the final cdr: `()` for proper lists.
pub struct ListIter<'a> {
    rest: &'a Value,
}

impl<'a> ListIter<'a> {
    pub fn tail(&self) -> &'a Value {
        self.rest
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rest {
            Value::Pair(pair) => {
                self.rest = &pair.cdr;
                Some(&pair.car)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "()"),
            Value::Boolean(true) => write!(f, "#t"),
            Value::Boolean(false) => write!(f, "#f"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Pair(_) => {
                write!(f, "(")?;
                let mut iter = self.iter_list();
                for (i, item) in iter.by_ref().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                match iter.tail() {
                    Value::Null => write!(f, ")"),
                    tail => write!(f, " . {tail})"),
                }
            }
            Value::Procedure(proc) => write!(f, "{proc}"),
        }
    }
}
