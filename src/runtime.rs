//! The stack machine that executes compiled code objects.
//!
//! Execution is iterative: a call saves the caller's activation on a
//! side stack instead of recursing, so the depth of Scheme recursion is
//! bounded by [`VmConfig::max_call_depth`] and not by the host stack.
//!
//! Variables live in [`Frame`]s. A frame has one slot per entry of its code
//! object's varnames table and points at the frame its procedure was
//! *defined* in. Lookups first try the slot the instruction names, then
//! walk outwards by name. The root of every chain is the host frame holding
//! the primitives.

use core::fmt;
use std::{cell::RefCell, io, mem, rc::Rc};

use tracing::{debug, instrument, trace};

use crate::{
    compiler::bytecode::{CodeObject, Constant, Instruction, Opcode},
    value::Value,
};

pub use self::fuel::Fuel;

pub mod fuel;
pub mod primitives;

/// Procedure arity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Exact(usize),
    Min(usize),
}

impl Arity {
    pub fn is_satisfied(&self, len: usize) -> bool {
        match self {
            Self::Exact(e) => *e == len,
            Self::Min(m) => *m <= len,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(e) => write!(f, "{e}"),
            Self::Min(m) => write!(f, "at least {m}"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PrimitiveError {
    #[error("expected a {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
    #[error("integer overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("unbound variable {0}")]
    UnboundVariable(String),
    #[error("{name}: expected {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: Arity,
        got: usize,
    },
    #[error("attempt to call non-procedure {0}")]
    NotCallable(String),
    #[error("{instr} at offset {offset}: malformed operand")]
    BadOperand { offset: usize, instr: Instruction },
    #[error("value stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("{extra} values left behind by RETURN at offset {offset}")]
    StackImbalance { offset: usize, extra: usize },
    #[error("execution ran past the end of {0}")]
    MissingReturn(String),
    #[error("{name}: {source}")]
    Primitive {
        name: String,
        #[source]
        source: PrimitiveError,
    },
    #[error("out of fuel")]
    OutOfFuel,
    #[error("maximum call depth of {0} exceeded")]
    CallDepthExceeded(usize),
    #[error("frame names are not a prefix of the code's varnames")]
    IncompatibleFrame,
}

/// A procedure implemented by the host.
///
/// Primitives get their operands directly off the value stack and never
/// allocate a frame. Their arity is checked before they are called.
pub trait Primitive {
    fn name(&self) -> &str;

    fn arity(&self) -> Arity;

    fn call(&self, out: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError>;
}

#[derive(Clone)]
pub struct NativeProcedure(Rc<dyn Primitive>);

impl<T: Primitive + 'static> From<T> for NativeProcedure {
    fn from(value: T) -> Self {
        Self(Rc::new(value))
    }
}

impl NativeProcedure {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn arity(&self) -> Arity {
        self.0.arity()
    }

    pub fn call(&self, out: &mut dyn io::Write, args: &[Value]) -> Result<Value, PrimitiveError> {
        self.0.call(out, args)
    }
}

impl fmt::Debug for NativeProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<procedure {} {:p}>", self.name(), Rc::as_ptr(&self.0))
    }
}

/// A compiled procedure together with the frame it was created in
pub struct Closure {
    pub code: Rc<CodeObject>,
    pub frame: Rc<Frame>,
}

#[derive(Clone)]
pub enum Procedure {
    Closure(Rc<Closure>),
    Native(NativeProcedure),
}

impl Procedure {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Closure(closure) => closure.code.name.as_deref(),
            Self::Native(native) => Some(native.name()),
        }
    }

    // report the arity of a procedure
    pub fn arity(&self) -> Arity {
        match self {
            Self::Closure(closure) => closure.code.arity(),
            Self::Native(native) => native.arity(),
        }
    }
}

// procedures are only ever equal to themselves
impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "#<procedure {name}>"),
            None => write!(f, "#<procedure>"),
        }
    }
}

// Frames can reach closures that capture them, so never print through one
impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closure(closure) => write!(f, "{self} {:p}", Rc::as_ptr(closure)),
            Self::Native(native) => write!(f, "{native:?}"),
        }
    }
}

/// Variable storage for one activation of a code object.
///
/// Slots are `None` until the name is bound. The top-level frame of a
/// session may switch to a newer code object whose name table extends its
/// current one (see [`Vm::run_in`]).
pub struct Frame {
    code: RefCell<Rc<CodeObject>>,
    slots: RefCell<Vec<Option<Value>>>,
    parent: Option<Rc<Frame>>,
}

impl Frame {
    fn new(code: Rc<CodeObject>, parent: Option<Rc<Frame>>) -> Self {
        let slots = vec![None; code.varnames.len()];
        Self {
            code: RefCell::new(code),
            slots: RefCell::new(slots),
            parent,
        }
    }

    fn host(primitives: impl IntoIterator<Item = NativeProcedure>) -> Self {
        let mut varnames: Vec<String> = vec![];
        let mut slots = vec![];
        for native in primitives {
            let value = Some(Value::Procedure(Procedure::Native(native.clone())));
            match varnames.iter().position(|name| name == native.name()) {
                Some(slot) => slots[slot] = value,
                None => {
                    varnames.push(native.name().into());
                    slots.push(value);
                }
            }
        }
        let code = CodeObject {
            name: Some("host".into()),
            varnames,
            ..CodeObject::default()
        };
        Self {
            code: RefCell::new(Rc::new(code)),
            slots: RefCell::new(slots),
            parent: None,
        }
    }

    /// Names this frame has slots for, in slot order
    pub fn varnames(&self) -> Vec<String> {
        self.code.borrow().varnames.clone()
    }

    /// Names currently bound in this frame (not its parents)
    pub fn bound_names(&self) -> Vec<String> {
        let code = self.code.borrow();
        let slots = self.slots.borrow();
        code.varnames
            .iter()
            .zip(slots.iter())
            .filter(|(_, slot)| slot.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The value bound to `name` in this frame only
    pub fn get(&self, name: &str) -> Option<Value> {
        let slot = self.code.borrow().slot_of(name)?;
        self.slots.borrow().get(slot).cloned().flatten()
    }

    fn ancestors(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(self.parent.as_deref(), |frame| frame.parent.as_deref())
    }

    fn is_bound(&self, slot: usize) -> bool {
        matches!(self.slots.borrow().get(slot), Some(Some(_)))
    }

    // The frame and slot holding the nearest binding of `name`
    fn binding(&self, slot: usize, name: &str) -> Option<(&Frame, usize)> {
        if self.is_bound(slot) {
            return Some((self, slot));
        }
        self.ancestors().find_map(|frame| {
            let slot = frame.code.borrow().slot_of(name)?;
            frame.is_bound(slot).then_some((frame, slot))
        })
    }

    fn lookup(&self, slot: usize, name: &str) -> Option<Value> {
        let (frame, slot) = self.binding(slot, name)?;
        let slots = frame.slots.borrow();
        slots.get(slot).cloned().flatten()
    }

    fn assign(&self, slot: usize, name: &str, value: Value) -> bool {
        let Some((frame, slot)) = self.binding(slot, name) else {
            return false;
        };
        frame.define(slot, value);
        true
    }

    fn define(&self, slot: usize, value: Value) {
        let mut slots = self.slots.borrow_mut();
        if slot >= slots.len() {
            slots.resize(slot + 1, None);
        }
        slots[slot] = Some(value);
    }

    // Switches a top-level frame over to `code`, keeping existing bindings
    fn adopt(&self, code: Rc<CodeObject>) -> Result<(), VmError> {
        {
            let current = self.code.borrow();
            if !code.varnames.starts_with(&current.varnames) {
                return Err(VmError::IncompatibleFrame);
            }
        }
        self.slots.borrow_mut().resize(code.varnames.len(), None);
        *self.code.borrow_mut() = code;
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.borrow().name)
            .field("bound", &self.bound_names())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Active procedure calls allowed at once
    pub max_call_depth: usize,
    /// Instruction budget, unlimited if `None`
    pub fuel: Option<i32>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 10_000,
            fuel: None,
        }
    }
}

// A suspended caller
struct Activation {
    code: Rc<CodeObject>,
    pc: usize,
    frame: Rc<Frame>,
    // stack height when the activation started, what RETURN must leave behind
    base: usize,
}

pub struct Vm<W = io::Stdout> {
    config: VmConfig,
    fuel: Option<Fuel>,
    out: W,
    host: Rc<Frame>,
}

impl Vm<io::Stdout> {
    /// A VM with the standard primitives, writing to stdout
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, io::stdout())
    }
}

impl<W: io::Write> Vm<W> {
    pub fn with_output(config: VmConfig, out: W) -> Self {
        Self::with_primitives(config, out, primitives::standard())
    }

    pub fn with_primitives(
        config: VmConfig,
        out: W,
        primitives: impl IntoIterator<Item = NativeProcedure>,
    ) -> Self {
        Self {
            fuel: config.fuel.map(Fuel::with),
            config,
            out,
            host: Rc::new(Frame::host(primitives)),
        }
    }

    pub fn primitive_names(&self) -> Vec<String> {
        self.host.varnames()
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub fn fuel_mut(&mut self) -> Option<&mut Fuel> {
        self.fuel.as_mut()
    }

    /// A fresh top-level frame, parented to the primitives
    pub fn new_toplevel(&self) -> Rc<Frame> {
        Rc::new(Frame::new(
            Rc::new(CodeObject::default()),
            Some(self.host.clone()),
        ))
    }

    /// Runs a top-level code object in a fresh top-level frame
    pub fn run(&mut self, code: Rc<CodeObject>) -> Result<Value, VmError> {
        let frame = self.new_toplevel();
        self.run_in(code, &frame)
    }

    /// Runs a top-level code object in an existing top-level frame.
    ///
    /// The frame's names must be a prefix of `code.varnames`, which is
    /// what [`crate::compiler::Compiler::with_toplevel_names`] produces.
    #[instrument(level = "debug", skip_all, fields(instructions = code.code.len()))]
    pub fn run_in(&mut self, code: Rc<CodeObject>, frame: &Rc<Frame>) -> Result<Value, VmError> {
        frame.adopt(code.clone())?;

        let mut stack: Vec<Value> = vec![];
        let mut calls: Vec<Activation> = vec![];
        let mut current = Activation {
            code,
            pc: 0,
            frame: frame.clone(),
            base: 0,
        };

        loop {
            if let Some(fuel) = &mut self.fuel {
                if !fuel.should_continue() {
                    return Err(VmError::OutOfFuel);
                }
                fuel.consume(1);
            }

            let offset = current.pc;
            let Some(instr) = current.code.code.get(offset).copied() else {
                let name = current.code.name.as_deref().unwrap_or("<toplevel>");
                return Err(VmError::MissingReturn(name.into()));
            };
            current.pc += 1;
            trace!(offset, %instr, depth = stack.len());

            let operand = || {
                instr
                    .arg
                    .and_then(|arg| usize::try_from(arg).ok())
                    .ok_or(VmError::BadOperand { offset, instr })
            };
            let varname = |slot: usize| {
                current
                    .code
                    .varnames
                    .get(slot)
                    .cloned()
                    .ok_or(VmError::BadOperand { offset, instr })
            };
            let underflow = VmError::StackUnderflow { offset };

            match instr.opcode {
                Opcode::Const => match current.code.constants.get(operand()?) {
                    Some(Constant::Value(value)) => stack.push(value.clone()),
                    _ => return Err(VmError::BadOperand { offset, instr }),
                },
                Opcode::LoadVar => {
                    let slot = operand()?;
                    let name = varname(slot)?;
                    let value = current
                        .frame
                        .lookup(slot, &name)
                        .ok_or(VmError::UnboundVariable(name))?;
                    stack.push(value);
                }
                Opcode::StoreVar => {
                    let slot = operand()?;
                    let name = varname(slot)?;
                    let value = stack.pop().ok_or(underflow)?;
                    if !current.frame.assign(slot, &name, value) {
                        return Err(VmError::UnboundVariable(name));
                    }
                }
                Opcode::DefVar => {
                    let slot = operand()?;
                    varname(slot)?;
                    let value = stack.pop().ok_or(underflow)?;
                    current.frame.define(slot, value);
                }
                Opcode::Function => match current.code.constants.get(operand()?) {
                    Some(Constant::Code(code)) => {
                        let closure = Closure {
                            code: code.clone(),
                            frame: current.frame.clone(),
                        };
                        stack.push(Value::Procedure(Procedure::Closure(Rc::new(closure))));
                    }
                    _ => return Err(VmError::BadOperand { offset, instr }),
                },
                Opcode::Pop => {
                    stack.pop().ok_or(underflow)?;
                }
                Opcode::Jump => current.pc = operand()?,
                Opcode::FJump => {
                    let target = operand()?;
                    if !stack.pop().ok_or(underflow)?.is_true() {
                        current.pc = target;
                    }
                }
                Opcode::Return => {
                    let value = stack.pop().ok_or(underflow)?;
                    if stack.len() != current.base {
                        return Err(VmError::StackImbalance {
                            offset,
                            extra: stack.len().saturating_sub(current.base),
                        });
                    }
                    match calls.pop() {
                        Some(caller) => {
                            current = caller;
                            stack.push(value);
                        }
                        None => return Ok(value),
                    }
                }
                Opcode::Call => {
                    let argc = operand()?;
                    if stack.len() < argc + 1 {
                        return Err(underflow);
                    }
                    let args = stack.split_off(stack.len() - argc);
                    let procedure = match stack.pop().ok_or(underflow)? {
                        Value::Procedure(procedure) => procedure,
                        other => return Err(VmError::NotCallable(other.to_string())),
                    };
                    let arity = procedure.arity();
                    if !arity.is_satisfied(args.len()) {
                        return Err(VmError::Arity {
                            name: procedure.to_string(),
                            expected: arity,
                            got: args.len(),
                        });
                    }
                    match procedure {
                        Procedure::Native(native) => {
                            let result = native.call(&mut self.out, &args).map_err(|source| {
                                VmError::Primitive {
                                    name: native.name().into(),
                                    source,
                                }
                            })?;
                            stack.push(result);
                        }
                        Procedure::Closure(closure) => {
                            if calls.len() >= self.config.max_call_depth {
                                return Err(VmError::CallDepthExceeded(self.config.max_call_depth));
                            }
                            debug!(
                                name = closure.code.name.as_deref().unwrap_or("<anonymous>"),
                                argc,
                                depth = calls.len() + 1,
                                "call"
                            );
                            let frame = Frame::new(closure.code.clone(), Some(closure.frame.clone()));
                            for (arg, value) in closure.code.args.iter().zip(args) {
                                if let Some(slot) = closure.code.slot_of(arg) {
                                    frame.define(slot, value);
                                }
                            }
                            let callee = Activation {
                                code: closure.code.clone(),
                                pc: 0,
                                frame: Rc::new(frame),
                                base: stack.len(),
                            };
                            calls.push(mem::replace(&mut current, callee));
                        }
                    }
                }
            }
        }
    }
}
