//! The standard host primitives

use std::{io, rc::Rc};

use crate::value::{Integer, Value};

use super::{Arity, NativeProcedure, Primitive, PrimitiveError};

type PrimitiveFn = fn(&mut dyn io::Write, &[Value]) -> Result<Value, PrimitiveError>;

/// A primitive backed by a plain function
pub struct Builtin {
    name: &'static str,
    arity: Arity,
    func: PrimitiveFn,
}

impl Builtin {
    pub const fn new(name: &'static str, arity: Arity, func: PrimitiveFn) -> Self {
        Self { name, arity, func }
    }
}

impl Primitive for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn call(&self, out: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
        (self.func)(out, args)
    }
}

/// Every primitive a program can reach without the host adding its own
pub fn standard() -> Vec<NativeProcedure> {
    [
        Builtin::new("+", Arity::Min(0), add),
        Builtin::new("-", Arity::Min(1), subtract),
        Builtin::new("*", Arity::Min(0), multiply),
        Builtin::new("=", Arity::Min(1), |_, args| compare(args, |a, b| a == b)),
        Builtin::new("<", Arity::Min(1), |_, args| compare(args, |a, b| a < b)),
        Builtin::new(">", Arity::Min(1), |_, args| compare(args, |a, b| a > b)),
        Builtin::new("cons", Arity::Exact(2), cons),
        Builtin::new("car", Arity::Exact(1), car),
        Builtin::new("cdr", Arity::Exact(1), cdr),
        Builtin::new("list", Arity::Min(0), |_, args| {
            Ok(Value::list(args.iter().cloned()))
        }),
        Builtin::new("null?", Arity::Exact(1), |_, args| {
            let [value] = force_arity(args)?;
            Ok(Value::Boolean(value.is_null()))
        }),
        Builtin::new("pair?", Arity::Exact(1), |_, args| {
            let [value] = force_arity(args)?;
            Ok(Value::Boolean(value.as_pair().is_some()))
        }),
        Builtin::new("eq?", Arity::Exact(2), is_eq),
        Builtin::new("not", Arity::Exact(1), |_, args| {
            let [value] = force_arity(args)?;
            Ok(Value::Boolean(!value.is_true()))
        }),
        Builtin::new("write", Arity::Exact(1), write),
    ]
    .into_iter()
    .map(NativeProcedure::from)
    .collect()
}

fn force_arity<const N: usize>(args: &[Value]) -> Result<&[Value; N], PrimitiveError> {
    args.try_into().map_err(|_| PrimitiveError::ArgumentCount {
        expected: N,
        got: args.len(),
    })
}

fn number(value: &Value) -> Result<Integer, PrimitiveError> {
    value.as_number().ok_or_else(|| PrimitiveError::TypeMismatch {
        expected: "number",
        got: value.to_string(),
    })
}

fn numbers(args: &[Value]) -> Result<Vec<Integer>, PrimitiveError> {
    args.iter().map(number).collect()
}

fn add(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    numbers(args)?
        .into_iter()
        .try_fold(0, Integer::checked_add)
        .map(Value::Number)
        .ok_or(PrimitiveError::Overflow)
}

fn multiply(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    numbers(args)?
        .into_iter()
        .try_fold(1, Integer::checked_mul)
        .map(Value::Number)
        .ok_or(PrimitiveError::Overflow)
}

// (- x) negates, (- x y ...) subtracts the rest from x
fn subtract(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let result = match numbers(args)?.as_slice() {
        [] => {
            return Err(PrimitiveError::ArgumentCount {
                expected: 1,
                got: 0,
            })
        }
        [only] => only.checked_neg(),
        [first, rest @ ..] => rest
            .iter()
            .try_fold(*first, |acc, n| acc.checked_sub(*n)),
    };
    result.map(Value::Number).ok_or(PrimitiveError::Overflow)
}

fn compare(args: &[Value], holds: fn(Integer, Integer) -> bool) -> Result<Value, PrimitiveError> {
    let nums = numbers(args)?;
    Ok(Value::Boolean(
        nums.windows(2).all(|pair| holds(pair[0], pair[1])),
    ))
}

fn cons(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let [car, cdr] = force_arity(args)?;
    Ok(Value::cons(car.clone(), cdr.clone()))
}

fn pair_of(value: &Value) -> Result<&crate::value::Pair, PrimitiveError> {
    value.as_pair().ok_or_else(|| PrimitiveError::TypeMismatch {
        expected: "pair",
        got: value.to_string(),
    })
}

fn car(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let [value] = force_arity(args)?;
    Ok(pair_of(value)?.car.clone())
}

fn cdr(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let [value] = force_arity(args)?;
    Ok(pair_of(value)?.cdr.clone())
}

// Pairs are compared by identity, everything else by value
fn is_eq(_: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let [a, b] = force_arity(args)?;
    let same = match (a, b) {
        (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
        (a, b) => a == b,
    };
    Ok(Value::Boolean(same))
}

fn write(out: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
    let [value] = force_arity(args)?;
    writeln!(out, "{value}")?;
    Ok(Value::Null)
}
