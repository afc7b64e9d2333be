use core::fmt;

use crate::value::Value;

use super::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    Quote,
    SetBang,
    Define,
    If,
    Cond,
    Let,
    Lambda,
    Begin,
}

impl SpecialForm {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "quote" => Self::Quote,
            "set!" => Self::SetBang,
            "define" => Self::Define,
            "if" => Self::If,
            "cond" => Self::Cond,
            "let" => Self::Let,
            "lambda" => Self::Lambda,
            "begin" => Self::Begin,
            _ => return None,
        })
    }
}

impl fmt::Display for SpecialForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quote => "quote",
            Self::SetBang => "set!",
            Self::Define => "define",
            Self::If => "if",
            Self::Cond => "cond",
            Self::Let => "let",
            Self::Lambda => "lambda",
            Self::Begin => "begin",
        })
    }
}

/// The shape of an expression, as far as code generation cares.
///
/// `cond` and `let` never show up here: they are rewritten into `if` and
/// lambda application before classification finishes.
#[derive(Debug, Clone)]
pub(crate) enum Form {
    SelfEvaluating(Value),
    Variable(Box<str>),
    Quoted(Value),
    Assignment {
        name: Box<str>,
        value: Value,
    },
    Definition {
        name: Box<str>,
        value: Value,
    },
    If {
        predicate: Value,
        consequent: Value,
        alternative: Option<Value>,
    },
    Lambda {
        params: Value,
        body: Vec<Value>,
    },
    Begin(Vec<Value>),
    Application {
        operator: Value,
        operands: Vec<Value>,
    },
}

fn malformed(form: SpecialForm, expr: &Value) -> CompileError {
    CompileError::Malformed {
        form,
        expr: expr.to_string(),
    }
}

impl Form {
    pub(crate) fn classify(expr: &Value) -> Result<Self, CompileError> {
        match expr {
            Value::Number(_) | Value::Boolean(_) => Ok(Self::SelfEvaluating(expr.clone())),
            Value::Symbol(name) => Ok(Self::Variable(Box::from(name.as_ref()))),
            Value::Null => Err(CompileError::EmptyCombination),
            Value::Procedure(_) => Err(CompileError::UnknownExpression(expr.to_string())),
            Value::Pair(pair) => {
                let Some(items) = expr.to_vec() else {
                    return Err(CompileError::UnknownExpression(expr.to_string()));
                };
                match pair.car.as_symbol().and_then(SpecialForm::from_keyword) {
                    Some(form) => Self::special(form, expr, &items[1..]),
                    None => Ok(Self::Application {
                        operator: items[0].clone(),
                        operands: items[1..].to_vec(),
                    }),
                }
            }
        }
    }

    fn special(form: SpecialForm, expr: &Value, rest: &[Value]) -> Result<Self, CompileError> {
        match (form, rest) {
            (SpecialForm::Quote, [datum]) => Ok(Self::Quoted(datum.clone())),
            (SpecialForm::SetBang, [Value::Symbol(name), value]) => Ok(Self::Assignment {
                name: Box::from(name.as_ref()),
                value: value.clone(),
            }),
            (SpecialForm::Define, [Value::Symbol(name), value]) => Ok(Self::Definition {
                name: Box::from(name.as_ref()),
                value: value.clone(),
            }),
            // (define (name . params) body...) is sugar for binding a lambda
            (SpecialForm::Define, [Value::Pair(target), body @ ..]) if !body.is_empty() => {
                let Some(name) = target.car.as_symbol() else {
                    return Err(malformed(form, expr));
                };
                let lambda = Value::list_with_tail(
                    [Value::symbol("lambda"), target.cdr.clone()],
                    Value::list(body.iter().cloned()),
                );
                Ok(Self::Definition {
                    name: Box::from(name),
                    value: lambda,
                })
            }
            (SpecialForm::If, [predicate, consequent]) => Ok(Self::If {
                predicate: predicate.clone(),
                consequent: consequent.clone(),
                alternative: None,
            }),
            (SpecialForm::If, [predicate, consequent, alternative]) => Ok(Self::If {
                predicate: predicate.clone(),
                consequent: consequent.clone(),
                alternative: Some(alternative.clone()),
            }),
            (SpecialForm::Lambda, [params, body @ ..]) if !body.is_empty() => Ok(Self::Lambda {
                params: params.clone(),
                body: body.to_vec(),
            }),
            (SpecialForm::Begin, body) if !body.is_empty() => Ok(Self::Begin(body.to_vec())),
            (SpecialForm::Cond, clauses) => Self::classify(&cond_to_if(expr, clauses)?),
            (SpecialForm::Let, [bindings, body @ ..]) if !body.is_empty() => {
                Self::classify(&let_to_application(expr, bindings, body)?)
            }
            _ => Err(malformed(form, expr)),
        }
    }
}

/// Rewrites `(cond (p e...) ... (else e...))` into nested `if`s.
/// Falling off the end yields `#f`.
fn cond_to_if(expr: &Value, clauses: &[Value]) -> Result<Value, CompileError> {
    let malformed = || malformed(SpecialForm::Cond, expr);
    let mut result = Value::Boolean(false);
    for (idx, clause) in clauses.iter().enumerate().rev() {
        let items = clause.to_vec().ok_or_else(malformed)?;
        let [test, body @ ..] = items.as_slice() else {
            return Err(malformed());
        };
        if body.is_empty() {
            return Err(malformed());
        }
        let sequence = Value::list_with_tail(
            [Value::symbol("begin")],
            Value::list(body.iter().cloned()),
        );
        if test.as_symbol() == Some("else") {
            if idx != clauses.len() - 1 {
                return Err(malformed());
            }
            result = sequence;
        } else {
            result = Value::list([Value::symbol("if"), test.clone(), sequence, result]);
        }
    }
    Ok(result)
}

/// Rewrites `(let ((v e) ...) body...)` into `((lambda (v ...) body...) e ...)`
fn let_to_application(
    expr: &Value,
    bindings: &Value,
    body: &[Value],
) -> Result<Value, CompileError> {
    let malformed = || malformed(SpecialForm::Let, expr);
    let bindings = bindings.to_vec().ok_or_else(malformed)?;
    let mut names = Vec::with_capacity(bindings.len());
    let mut inits = Vec::with_capacity(bindings.len());
    for binding in bindings {
        match binding.to_vec().as_deref() {
            Some([name @ Value::Symbol(_), init]) => {
                names.push(name.clone());
                inits.push(init.clone());
            }
            _ => return Err(malformed()),
        }
    }
    let lambda = Value::list_with_tail(
        [Value::symbol("lambda"), Value::list(names)],
        Value::list(body.iter().cloned()),
    );
    Ok(Value::list_with_tail([lambda], Value::list(inits)))
}

/// Names bound by `define` directly in `body` (looking through `begin`),
/// in order of appearance.
pub(crate) fn defined_names(body: &[Value]) -> Vec<Box<str>> {
    fn visit(expr: &Value, names: &mut Vec<Box<str>>) {
        let Some(pair) = expr.as_pair() else {
            return;
        };
        match pair.car.as_symbol().and_then(SpecialForm::from_keyword) {
            Some(SpecialForm::Define) => {
                let target = pair.cdr.as_pair().map(|p| &p.car);
                let name = match target {
                    Some(Value::Symbol(name)) => Some(name.as_ref()),
                    Some(Value::Pair(signature)) => signature.car.as_symbol(),
                    _ => None,
                };
                if let Some(name) = name {
                    names.push(Box::from(name));
                }
            }
            Some(SpecialForm::Begin) => {
                for inner in pair.cdr.iter_list() {
                    visit(inner, names);
                }
            }
            _ => {}
        }
    }

    let mut names = vec![];
    for expr in body {
        visit(expr, &mut names);
    }
    names
}
