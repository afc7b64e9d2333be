//! Compile Scheme expressions into bytecode
//!
//! For example:
//!
//! ((lambda (a b) (+ a b)) 3 4)
//!
//! compiles to
//!
//! ```text
//! FUNCTION 0      ; closure over the nested code object below
//! CONST    1      ; 3
//! CONST    2      ; 4
//! CALL     2
//! RETURN
//!
//!     == (lambda (a b) ...), varnames [a, b, +] ==
//!     LOADVAR 2   ; +
//!     LOADVAR 0   ; a
//!     LOADVAR 1   ; b
//!     CALL    2
//!     RETURN
//! ```
//!
//! Every expression compiles to code that leaves exactly one value on the
//! stack. Names are never resolved to a frame at compile time: each code
//! object only records the names it mentions, and the VM walks the frame
//! chain at run time.
use std::{collections::HashSet, rc::Rc};

use tracing::{debug, trace};

use crate::value::Value;

use self::{
    bytecode::{CodeObject, Constant, Instruction, Opcode},
    environment::{resolve, Scope},
    syntax::{defined_names, Form, SpecialForm},
};

pub mod bytecode;
pub mod environment;
pub mod syntax;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unknown expression: {0}")]
    UnknownExpression(String),
    #[error("cannot evaluate the empty combination ()")]
    EmptyCombination,
    #[error("malformed {form}: {expr}")]
    Malformed { form: SpecialForm, expr: String },
    #[error("expected an identifier in parameter list, found {0}")]
    NonIdentifierParameter(String),
    #[error("duplicate parameter {0}")]
    DuplicateParameter(String),
    #[error("improper parameter list {0}")]
    ImproperParameters(String),
    #[error("set! of undefined variable {0}")]
    UndefinedAssignment(String),
    #[error("jump label {0} was never placed")]
    UnresolvedLabel(usize),
    #[error("table index {0} does not fit an instruction argument")]
    IndexOverflow(usize),
}

/// Compiles a whole program with no host-provided names
pub fn compile(program: &[Value]) -> Result<CodeObject, CompileError> {
    Compiler::new().compile(program)
}

#[derive(Debug, Clone, Default)]
pub struct Compiler {
    globals: HashSet<Box<str>>,
    toplevel_names: Vec<Box<str>>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names bound outside of anything being compiled (the host's
    /// primitives, or definitions from an earlier compilation). Only
    /// consulted to accept `set!` targets.
    pub fn with_globals<S: AsRef<str>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.globals
            .extend(names.into_iter().map(|name| Box::from(name.as_ref())));
        self
    }

    /// Pre-populates the varnames table of the top-level code object, so
    /// that its first slots line up with an existing top-level frame.
    pub fn with_toplevel_names<S: AsRef<str>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.toplevel_names
            .extend(names.into_iter().map(|name| Box::from(name.as_ref())));
        self
    }

    /// Compiles `program` as the body of a nameless zero-argument procedure
    pub fn compile(&self, program: &[Value]) -> Result<CodeObject, CompileError> {
        let mut code = CodeBuilder::new(None, vec![]);
        for name in &self.toplevel_names {
            code.scope.slot(name);
        }
        self.body(&mut code, &[], program)?;
        let code = code.finish()?;
        debug!(
            instructions = code.code.len(),
            constants = code.constants.len(),
            varnames = code.varnames.len(),
            "compiled program"
        );
        Ok(code)
    }

    fn body(
        &self,
        code: &mut CodeBuilder,
        enclosing: &[&Scope],
        exprs: &[Value],
    ) -> Result<(), CompileError> {
        for name in defined_names(exprs) {
            code.scope.bind(&name);
        }
        self.sequence(code, enclosing, exprs)?;
        code.emit_bare(Opcode::Return);
        Ok(())
    }

    fn sequence(
        &self,
        code: &mut CodeBuilder,
        enclosing: &[&Scope],
        exprs: &[Value],
    ) -> Result<(), CompileError> {
        let Some((last, init)) = exprs.split_last() else {
            return code.emit_const(Value::Null);
        };
        for expr in init {
            self.expr(code, enclosing, expr, None)?;
            code.emit_bare(Opcode::Pop);
        }
        self.expr(code, enclosing, last, None)
    }

    // `name` is the variable a lambda expression is about to be bound to
    fn expr(
        &self,
        code: &mut CodeBuilder,
        enclosing: &[&Scope],
        expr: &Value,
        name: Option<&str>,
    ) -> Result<(), CompileError> {
        match Form::classify(expr)? {
            Form::SelfEvaluating(value) | Form::Quoted(value) => code.emit_const(value),
            Form::Variable(var) => {
                let slot = code.scope.slot(&var);
                code.emit(Opcode::LoadVar, slot)
            }
            Form::Assignment { name: var, value } => {
                let scopes = enclosing.iter().copied().chain([&code.scope]);
                let Some(resolution) = resolve(scopes, &self.globals, &var) else {
                    return Err(CompileError::UndefinedAssignment(var.into()));
                };
                trace!(name = %var, ?resolution, "assignment");
                let slot = code.scope.slot(&var);
                self.expr(code, enclosing, &value, None)?;
                code.emit(Opcode::StoreVar, slot)?;
                code.emit_const(Value::Null)
            }
            Form::Definition { name: var, value } => {
                code.scope.bind(&var);
                let slot = code.scope.slot(&var);
                self.expr(code, enclosing, &value, Some(&var))?;
                code.emit(Opcode::DefVar, slot)?;
                code.emit_const(Value::Null)
            }
            Form::If {
                predicate,
                consequent,
                alternative,
            } => {
                let otherwise = code.new_label();
                let after = code.new_label();
                self.expr(code, enclosing, &predicate, None)?;
                code.emit_jump(Opcode::FJump, otherwise);
                self.expr(code, enclosing, &consequent, None)?;
                code.emit_jump(Opcode::Jump, after);
                code.place(otherwise);
                match alternative {
                    Some(alternative) => self.expr(code, enclosing, &alternative, None)?,
                    None => code.emit_const(Value::Boolean(false))?,
                }
                code.place(after);
                Ok(())
            }
            Form::Lambda { params, body } => self.lambda(code, enclosing, name, &params, &body),
            Form::Begin(exprs) => self.sequence(code, enclosing, &exprs),
            Form::Application { operator, operands } => {
                self.expr(code, enclosing, &operator, None)?;
                for operand in &operands {
                    self.expr(code, enclosing, operand, None)?;
                }
                code.emit(Opcode::Call, operands.len())
            }
        }
    }

    fn lambda(
        &self,
        code: &mut CodeBuilder,
        enclosing: &[&Scope],
        name: Option<&str>,
        params: &Value,
        body: &[Value],
    ) -> Result<(), CompileError> {
        let args = parameter_names(params)?;
        let mut inner = CodeBuilder::new(name.map(String::from), args);
        for arg in &inner.args {
            inner.scope.slot(arg);
            inner.scope.bind(arg);
        }

        let mut scopes = enclosing.to_vec();
        scopes.push(&code.scope);
        self.body(&mut inner, &scopes, body)?;
        let inner = inner.finish()?;
        trace!(
            name = inner.name.as_deref().unwrap_or("<anonymous>"),
            instructions = inner.code.len(),
            "compiled lambda"
        );
        code.emit_function(Rc::new(inner))
    }
}

fn parameter_names(params: &Value) -> Result<Vec<String>, CompileError> {
    let mut iter = params.iter_list();
    let mut names: Vec<String> = vec![];
    for param in iter.by_ref() {
        let Some(name) = param.as_symbol() else {
            return Err(CompileError::NonIdentifierParameter(param.to_string()));
        };
        if names.iter().any(|seen| seen == name) {
            return Err(CompileError::DuplicateParameter(name.into()));
        }
        names.push(name.into());
    }
    if !iter.tail().is_null() {
        return Err(CompileError::ImproperParameters(params.to_string()));
    }
    Ok(names)
}

fn operand(index: usize) -> Result<i32, CompileError> {
    i32::try_from(index).map_err(|_| CompileError::IndexOverflow(index))
}

#[derive(Debug, Clone, Copy)]
struct Label(usize);

#[derive(Debug)]
enum Emitted {
    Ready(Instruction),
    Jump(Opcode, Label),
}

/// A code object under construction. Jumps refer to labels until
/// [`CodeBuilder::finish`] patches in the offsets.
#[derive(Debug)]
struct CodeBuilder {
    name: Option<String>,
    args: Vec<String>,
    scope: Scope,
    code: Vec<Emitted>,
    constants: Vec<Constant>,
    labels: Vec<Option<usize>>,
}

impl CodeBuilder {
    fn new(name: Option<String>, args: Vec<String>) -> Self {
        Self {
            name,
            args,
            scope: Scope::default(),
            code: vec![],
            constants: vec![],
            labels: vec![],
        }
    }

    fn emit(&mut self, opcode: Opcode, index: usize) -> Result<(), CompileError> {
        let instr = Instruction::new(opcode, operand(index)?);
        self.code.push(Emitted::Ready(instr));
        Ok(())
    }

    fn emit_bare(&mut self, opcode: Opcode) {
        self.code.push(Emitted::Ready(Instruction::bare(opcode)));
    }

    fn emit_const(&mut self, value: Value) -> Result<(), CompileError> {
        let existing = self
            .constants
            .iter()
            .position(|constant| matches!(constant, Constant::Value(v) if *v == value));
        let index = match existing {
            Some(index) => index,
            None => {
                self.constants.push(Constant::Value(value));
                self.constants.len() - 1
            }
        };
        self.emit(Opcode::Const, index)
    }

    fn emit_function(&mut self, code: Rc<CodeObject>) -> Result<(), CompileError> {
        self.constants.push(Constant::Code(code));
        self.emit(Opcode::Function, self.constants.len() - 1)
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Points `label` at the next instruction to be emitted
    fn place(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        self.code.push(Emitted::Jump(opcode, label));
    }

    fn finish(self) -> Result<CodeObject, CompileError> {
        let labels = self.labels;
        let code = self
            .code
            .into_iter()
            .map(|emitted| match emitted {
                Emitted::Ready(instr) => Ok(instr),
                Emitted::Jump(opcode, label) => {
                    let target = labels
                        .get(label.0)
                        .copied()
                        .flatten()
                        .ok_or(CompileError::UnresolvedLabel(label.0))?;
                    Ok(Instruction::new(opcode, operand(target)?))
                }
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(CodeObject {
            name: self.name,
            args: self.args,
            code,
            constants: self.constants,
            varnames: self.scope.varnames(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bytecode::{CodeObject, Constant, Instruction, Opcode},
        compile, CompileError, Compiler,
    };
    use crate::{reader::read, value::Value};
    use assert2::{check, let_assert};

    use Opcode::*;

    fn compile_src(src: &str) -> Result<CodeObject, CompileError> {
        let_assert!(Ok(program) = read(src));
        compile(&program)
    }

    fn ops(code: &CodeObject) -> Vec<Instruction> {
        code.code.clone()
    }

    fn i(opcode: Opcode, arg: i32) -> Instruction {
        Instruction::new(opcode, arg)
    }

    fn bare(opcode: Opcode) -> Instruction {
        Instruction::bare(opcode)
    }

    fn nested(code: &CodeObject, index: usize) -> &CodeObject {
        let_assert!(Some(Constant::Code(inner)) = code.constants.get(index));
        inner
    }

    #[test]
    fn definition_then_reference() {
        let_assert!(Ok(code) = compile_src("(define x 5) x"));
        check!(
            ops(&code)
                == vec![
                    i(Const, 0),
                    i(DefVar, 0),
                    i(Const, 1),
                    bare(Pop),
                    i(LoadVar, 0),
                    bare(Return)
                ]
        );
        check!(code.constants == vec![Constant::Value(Value::Number(5)), Constant::Value(Value::Null)]);
        check!(code.varnames == vec!["x".to_string()]);
        check!(code.name == None);
        check!(code.args.is_empty());
    }

    #[test]
    fn conditional_jumps_are_backpatched() {
        let_assert!(Ok(code) = compile_src("(if #f 1 2)"));
        check!(
            ops(&code)
                == vec![
                    i(Const, 0),
                    i(FJump, 4),
                    i(Const, 1),
                    i(Jump, 5),
                    i(Const, 2),
                    bare(Return)
                ]
        );

        // one-armed if falls back to #f
        let_assert!(Ok(code) = compile_src("(if #t 1)"));
        check!(code.constants[2] == Constant::Value(Value::Boolean(false)));
        check!(code.code[4] == i(Const, 2));
    }

    #[test]
    fn lambda_application() {
        let_assert!(Ok(code) = compile_src("((lambda (a b) (+ a b)) 3 4)"));
        check!(
            ops(&code) == vec![i(Function, 0), i(Const, 1), i(Const, 2), i(Call, 2), bare(Return)]
        );
        let inner = nested(&code, 0);
        check!(inner.name == None);
        check!(inner.args == vec!["a".to_string(), "b".to_string()]);
        check!(inner.varnames == vec!["a".to_string(), "b".to_string(), "+".to_string()]);
        check!(
            ops(inner)
                == vec![
                    i(LoadVar, 2),
                    i(LoadVar, 0),
                    i(LoadVar, 1),
                    i(Call, 2),
                    bare(Return)
                ]
        );
    }

    #[test]
    fn defined_lambdas_are_named() {
        let_assert!(Ok(code) = compile_src("(define (square n) (* n n)) (define id (lambda (x) x))"));
        check!(nested(&code, 0).name.as_deref() == Some("square"));
        let_assert!(Some(Constant::Code(id)) = code.constants.last());
        check!(id.name.as_deref() == Some("id"));
    }

    #[test]
    fn sequences_pop_all_but_last() {
        let_assert!(Ok(code) = compile_src("(begin 1 2 3)"));
        check!(
            ops(&code)
                == vec![
                    i(Const, 0),
                    bare(Pop),
                    i(Const, 1),
                    bare(Pop),
                    i(Const, 2),
                    bare(Return)
                ]
        );
        let_assert!(Ok(empty) = compile_src(""));
        check!(ops(&empty) == vec![i(Const, 0), bare(Return)]);
        check!(empty.constants == vec![Constant::Value(Value::Null)]);
    }

    #[test]
    fn constants_are_shared_but_code_is_not() {
        let_assert!(Ok(code) = compile_src("(f 1 1 '(a) '(a) (lambda () 1) (lambda () 1))"));
        let values = code
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Value(_)))
            .count();
        check!(values == 2);
        check!(code.children().count() == 2);
    }

    #[test]
    fn assignment_needs_a_binding() {
        let_assert!(Err(CompileError::UndefinedAssignment(name)) = compile_src("(set! y 1)"));
        check!(name == "y");

        // later definitions in the same body count
        let_assert!(Ok(_) = compile_src("(define (bump) (set! counter 1)) (define counter 0)"));
        // so do parameters of enclosing lambdas
        let_assert!(Ok(_) = compile_src("(lambda (n) (lambda () (set! n 2)))"));
        // and names the host announced
        let_assert!(Ok(program) = read("(set! + 1)"));
        let_assert!(Ok(_) = Compiler::new().with_globals(["+"]).compile(&program));

        let_assert!(Ok(code) = compile_src("(define x 1) (set! x 2)"));
        check!(code.code[4] == i(Const, 2));
        check!(code.code[5] == i(StoreVar, 0));
        check!(code.code[6] == i(Const, 1));
    }

    #[test]
    fn parameters_come_first() {
        let_assert!(Ok(code) = compile_src("(lambda (x y) (g y x))"));
        let inner = nested(&code, 0);
        check!(inner.varnames[..2] == ["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn desugared_forms() {
        let_assert!(Ok(code) = compile_src("(let ((a 1)) a)"));
        check!(ops(&code) == vec![i(Function, 0), i(Const, 1), i(Call, 1), bare(Return)]);

        let_assert!(Ok(code) = compile_src("(cond (#f 1) (else 2))"));
        check!(code.code[1] == i(FJump, 4));
    }

    #[test]
    fn toplevel_names_keep_their_slots() {
        let_assert!(Ok(program) = read("(define z 3) y"));
        let_assert!(Ok(code) = Compiler::new().with_toplevel_names(["y", "w"]).compile(&program));
        check!(code.varnames == vec!["y".to_string(), "w".to_string(), "z".to_string()]);
        check!(code.code[4] == i(LoadVar, 0));
    }

    #[test]
    fn rejects_bad_programs() {
        let_assert!(Err(CompileError::NonIdentifierParameter(_)) = compile_src("(lambda (1) 1)"));
        let_assert!(Err(CompileError::DuplicateParameter(_)) = compile_src("(lambda (a a) a)"));
        let_assert!(Err(CompileError::ImproperParameters(_)) = compile_src("(lambda args 1)"));
        let_assert!(Err(CompileError::ImproperParameters(_)) = compile_src("(lambda (a . b) 1)"));
        let_assert!(Err(CompileError::EmptyCombination) = compile_src("(f ())"));
        let_assert!(Err(CompileError::UnknownExpression(_)) = compile_src("(f . 1)"));
        let_assert!(Err(CompileError::Malformed { .. }) = compile_src("(define)"));
    }

    #[test]
    fn compiled_code_validates() {
        let src = "(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) \
                   (define (count) (let ((c 0)) (lambda () (set! c (+ c 1)) c))) \
                   (cond ((fact 3) 'yes) (else 'no))";
        let_assert!(Ok(code) = compile_src(src));
        check!(code.validate() == Ok(()));
        check!(compile_src(src) == Ok(code));
    }
}
