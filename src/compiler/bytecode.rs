//! Bytecode model: instructions and the code objects that own them.
//!
//! A [`CodeObject`] is a compiled procedure. It is immutable once built and is
//! shared behind an [`Rc`] by every closure created from it.
use core::fmt;
use std::rc::Rc;

use arbitrary::Arbitrary;

use crate::{runtime::Arity, value::Value};

/// Operation selectors. The discriminants are the opcode bytes of the
/// persisted format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
#[repr(u8)]
pub enum Opcode {
    /// push `constants[arg]`
    Const = 0x00,
    /// push the value bound to `varnames[arg]`, searching the frame chain
    LoadVar = 0x10,
    /// pop, then overwrite the nearest existing binding of `varnames[arg]`
    StoreVar = 0x11,
    /// pop, then bind `varnames[arg]` in the current frame
    DefVar = 0x12,
    /// push a closure over `constants[arg]` and the current frame
    Function = 0x20,
    Pop = 0x30,
    /// jump to the absolute offset `arg`
    Jump = 0x40,
    /// pop, then jump to `arg` if the popped value is `#f`
    FJump = 0x41,
    Return = 0x50,
    /// call with `arg` operands
    Call = 0x51,
}

impl Opcode {
    pub const ALL: [Opcode; 10] = [
        Opcode::Const,
        Opcode::LoadVar,
        Opcode::StoreVar,
        Opcode::DefVar,
        Opcode::Function,
        Opcode::Pop,
        Opcode::Jump,
        Opcode::FJump,
        Opcode::Return,
        Opcode::Call,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == byte)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Const => "CONST",
            Opcode::LoadVar => "LOADVAR",
            Opcode::StoreVar => "STOREVAR",
            Opcode::DefVar => "DEFVAR",
            Opcode::Function => "FUNCTION",
            Opcode::Pop => "POP",
            Opcode::Jump => "JUMP",
            Opcode::FJump => "FJUMP",
            Opcode::Return => "RETURN",
            Opcode::Call => "CALL",
        }
    }

    /// Whether instructions with this opcode carry an argument
    pub fn takes_arg(self) -> bool {
        !matches!(self, Opcode::Pop | Opcode::Return)
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::FJump)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: Option<i32>,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: i32) -> Self {
        Self {
            opcode,
            arg: Some(arg),
        }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self { opcode, arg: None }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arg {
            Some(arg) => write!(f, "{} {arg}", self.opcode),
            None => write!(f, "{}", self.opcode),
        }
    }
}

/// An entry of a constants table
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Value(Value),
    Code(Rc<CodeObject>),
}

/// A Scheme procedure in its compiled form.
///
/// The top-level program is itself a code object without name or arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeObject {
    /// Present for procedures bound by `define`
    pub name: Option<String>,
    pub args: Vec<String>,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub varnames: Vec<String>,
}

/// A broken structural invariant of a [`CodeObject`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InvalidCode {
    #[error("{instr} at offset {offset}: missing argument")]
    MissingArgument { offset: usize, instr: Instruction },
    #[error("{instr} at offset {offset}: unexpected argument")]
    UnexpectedArgument { offset: usize, instr: Instruction },
    #[error("{instr} at offset {offset}: operand out of range")]
    OperandOutOfRange { offset: usize, instr: Instruction },
    #[error("{instr} at offset {offset}: constant has the wrong kind")]
    WrongConstantKind { offset: usize, instr: Instruction },
    #[error("code object has no instructions")]
    Empty,
}

impl CodeObject {
    pub fn arity(&self) -> Arity {
        Arity::Exact(self.args.len())
    }

    /// The varnames index of `name`, if this code object references it at all
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.varnames.iter().position(|var| var == name)
    }

    /// Code objects nested in this one's constants, in table order
    pub fn children(&self) -> impl Iterator<Item = &Rc<CodeObject>> {
        self.constants.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code),
            Constant::Value(_) => None,
        })
    }

    /// Checks operand ranges and jump targets for this code object and every
    /// code object nested in it.
    pub fn validate(&self) -> Result<(), InvalidCode> {
        if self.code.is_empty() {
            return Err(InvalidCode::Empty);
        }
        for (offset, instr) in self.code.iter().copied().enumerate() {
            let arg = match (instr.opcode.takes_arg(), instr.arg) {
                (true, Some(arg)) => arg,
                (true, None) => return Err(InvalidCode::MissingArgument { offset, instr }),
                (false, None) => continue,
                (false, Some(_)) => return Err(InvalidCode::UnexpectedArgument { offset, instr }),
            };
            let out_of_range = InvalidCode::OperandOutOfRange { offset, instr };
            let Ok(index) = usize::try_from(arg) else {
                return Err(out_of_range);
            };
            match instr.opcode {
                Opcode::Const | Opcode::Function => {
                    let constant = self.constants.get(index).ok_or(out_of_range)?;
                    let kind_matches = matches!(
                        (instr.opcode, constant),
                        (Opcode::Const, Constant::Value(_)) | (Opcode::Function, Constant::Code(_))
                    );
                    if !kind_matches {
                        return Err(InvalidCode::WrongConstantKind { offset, instr });
                    }
                }
                Opcode::LoadVar | Opcode::StoreVar | Opcode::DefVar => {
                    if index >= self.varnames.len() {
                        return Err(out_of_range);
                    }
                }
                Opcode::Jump | Opcode::FJump => {
                    if index >= self.code.len() {
                        return Err(out_of_range);
                    }
                }
                Opcode::Call | Opcode::Pop | Opcode::Return => {}
            }
        }
        self.children().try_for_each(|child| child.validate())
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, nesting: usize) -> fmt::Result {
        let prefix = " ".repeat(nesting);
        writeln!(f, "{prefix}----------")?;
        writeln!(f, "{prefix}CodeObject: {}", self.name.as_deref().unwrap_or(""))?;
        writeln!(f, "{prefix}Args: [{}]", self.args.join(", "))?;
        for (offset, instr) in self.code.iter().enumerate() {
            let mut line = format!("{prefix}  {offset:>4} {:<12} ", instr.opcode.mnemonic());
            if let Some(arg) = instr.arg {
                line.push_str(&format!("{arg:>4}"));
            }
            let index = instr.arg.and_then(|arg| usize::try_from(arg).ok());
            match (instr.opcode, index) {
                (Opcode::Const, Some(idx)) => match self.constants.get(idx) {
                    Some(Constant::Value(value)) => line.push_str(&format!(" {{= {value}}}")),
                    Some(Constant::Code(_)) => line.push_str(" {= <code>}"),
                    None => line.push_str(" {= ?}"),
                },
                (Opcode::LoadVar | Opcode::StoreVar | Opcode::DefVar, Some(idx)) => {
                    match self.varnames.get(idx) {
                        Some(name) => line.push_str(&format!(" {{= {name}}}")),
                        None => line.push_str(" {= ?}"),
                    }
                }
                (Opcode::Function, Some(idx)) => {
                    if let Some(Constant::Code(code)) = self.constants.get(idx) {
                        writeln!(f, "{line} {{=")?;
                        code.fmt_nested(f, nesting + 8)?;
                        continue;
                    }
                    line.push_str(" {= ?}");
                }
                _ => {}
            }
            writeln!(f, "{}", line.trim_end())?;
        }
        writeln!(f, "{prefix}----------")
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{CodeObject, Constant, Instruction, InvalidCode, Opcode};
    use crate::value::Value;
    use assert2::{check, let_assert};

    fn sample() -> CodeObject {
        let inner = CodeObject {
            name: Some("id".into()),
            args: vec!["x".into()],
            code: vec![
                Instruction::new(Opcode::LoadVar, 0),
                Instruction::bare(Opcode::Return),
            ],
            constants: vec![],
            varnames: vec!["x".into()],
        };
        CodeObject {
            name: None,
            args: vec![],
            code: vec![
                Instruction::new(Opcode::Function, 1),
                Instruction::new(Opcode::Const, 0),
                Instruction::new(Opcode::Call, 1),
                Instruction::bare(Opcode::Return),
            ],
            constants: vec![Constant::Value(Value::Number(5)), Constant::Code(Rc::new(inner))],
            varnames: vec![],
        }
    }

    #[test]
    fn opcode_bytes() {
        for op in Opcode::ALL {
            check!(Opcode::from_byte(op as u8) == Some(op));
        }
        check!(Opcode::from_byte(0x01) == None);
        check!(Opcode::Call as u8 == 0x51);
    }

    #[test]
    fn validates_sample() {
        check!(sample().validate() == Ok(()));
    }

    #[test]
    fn rejects_broken_invariants() {
        let mut code = sample();
        code.code[1] = Instruction::new(Opcode::Const, 7);
        let_assert!(Err(InvalidCode::OperandOutOfRange { offset: 1, .. }) = code.validate());

        let mut code = sample();
        code.code[1] = Instruction::new(Opcode::Const, 1);
        let_assert!(Err(InvalidCode::WrongConstantKind { offset: 1, .. }) = code.validate());

        let mut code = sample();
        code.code[2] = Instruction::new(Opcode::Jump, 4);
        let_assert!(Err(InvalidCode::OperandOutOfRange { offset: 2, .. }) = code.validate());

        let mut code = sample();
        code.code[3] = Instruction::new(Opcode::Return, 0);
        let_assert!(Err(InvalidCode::UnexpectedArgument { offset: 3, .. }) = code.validate());

        let mut code = sample();
        code.code[0] = Instruction::bare(Opcode::Function);
        let_assert!(Err(InvalidCode::MissingArgument { offset: 0, .. }) = code.validate());

        check!(CodeObject::default().validate() == Err(InvalidCode::Empty));
    }

    #[test]
    fn disassembly_lists_nested_code() {
        let listing = sample().to_string();
        let lines: Vec<_> = listing.lines().collect();
        check!(lines[0] == "----------");
        check!(lines[1] == "CodeObject: ");
        check!(lines[2] == "Args: []");
        check!(lines[3] == "     0 FUNCTION        1 {=");
        check!(lines[4] == "        ----------");
        check!(lines[5] == "        CodeObject: id");
        check!(lines[6] == "        Args: [x]");
        check!(lines[7] == "             0 LOADVAR         0 {= x}");
        check!(lines[8] == "             1 RETURN");
        check!(lines[9] == "        ----------");
        check!(lines[10] == "     1 CONST           0 {= 5}");
        check!(lines[11] == "     2 CALL            1");
        check!(lines[12] == "     3 RETURN");
        check!(lines[13] == "----------");
    }
}
