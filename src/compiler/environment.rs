//! Compile-time view of variable bindings.
//!
//! Every code object being compiled gets a [`Scope`]. The scope owns the
//! varnames table of its code object and remembers which names the code
//! object binds itself (parameters and internal definitions), so that the
//! compiler can tell where an assignment will land before emitting it.
use std::collections::HashSet;

use lasso::{Key, Rodeo};

/// Where a name is bound, relative to the code object referencing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// bound by the code object itself
    Local,
    /// bound by an enclosing code object, `depth` levels out
    Enclosing(usize),
    /// provided by the host environment (primitives)
    Global,
}

#[derive(Debug, Default)]
pub struct Scope {
    names: Rodeo,
    bound: HashSet<Box<str>>,
}

impl Scope {
    /// Index of `name` in the varnames table, interning it on first use.
    ///
    /// Indices are handed out sequentially, so the table lists names in the
    /// order they were first referenced.
    pub fn slot(&mut self, name: &str) -> usize {
        self.names.get_or_intern(name).into_usize()
    }

    /// Marks `name` as bound by this scope, without touching the varnames table
    pub fn bind(&mut self, name: &str) {
        if !self.bound.contains(name) {
            self.bound.insert(Box::from(name));
        }
    }

    pub fn binds(&self, name: &str) -> bool {
        self.bound.contains(name)
    }

    pub fn varnames(&self) -> Vec<String> {
        self.names.strings().map(String::from).collect()
    }
}

/// Resolves `name` against a stack of scopes, innermost last
pub fn resolve<'a>(
    scopes: impl DoubleEndedIterator<Item = &'a Scope>,
    globals: &HashSet<Box<str>>,
    name: &str,
) -> Option<Resolution> {
    scopes
        .rev()
        .position(|scope| scope.binds(name))
        .map(|depth| match depth {
            0 => Resolution::Local,
            depth => Resolution::Enclosing(depth),
        })
        .or_else(|| globals.contains(name).then_some(Resolution::Global))
}
