use std::rc::Rc;

use arbitrary::Unstructured;
use arbtest::arbtest;
use assert2::{check, let_assert};
use bob::{
    compile_source, deserialize, runtime::PrimitiveError, serialize, CodeObject, Constant,
    FormatError, Instruction, Opcode, Value, Vm, VmConfig, VmError,
};

// A random expression over the names in `scope`. Every procedure is applied
// right where it is created, so generated programs always terminate.
fn expr(u: &mut Unstructured<'_>, depth: u32, scope: &[&'static str]) -> arbitrary::Result<String> {
    if depth == 0 || u.ratio(1u8, 3u8)? {
        return Ok(match u.int_in_range(0u8..=3)? {
            0 => u.int_in_range(-100i32..=100)?.to_string(),
            1 => (if u.arbitrary()? { "#t" } else { "#f" }).to_string(),
            2 => format!("'{}", u.choose(&["a", "b", "(1 2)", "()", "(1 . #f)"])?),
            _ => u.choose(scope)?.to_string(),
        });
    }

    let depth = depth - 1;
    Ok(match u.int_in_range(0u8..=6)? {
        0 => format!(
            "(if {} {} {})",
            expr(u, depth, scope)?,
            expr(u, depth, scope)?,
            expr(u, depth, scope)?
        ),
        1 => format!("(+ {} {})", expr(u, depth, scope)?, expr(u, depth, scope)?),
        2 => format!("(begin {} {})", expr(u, depth, scope)?, expr(u, depth, scope)?),
        3 => {
            let name = u.choose(scope)?;
            format!("(set! {name} {})", expr(u, depth, scope)?)
        }
        4 => {
            let mut inner = scope.to_vec();
            inner.push("p");
            format!(
                "((lambda (p) {}) {})",
                expr(u, depth, &inner)?,
                expr(u, depth, scope)?
            )
        }
        5 => format!("(cons {} {})", expr(u, depth, scope)?, expr(u, depth, scope)?),
        _ => {
            let mut inner = scope.to_vec();
            inner.push("q");
            format!(
                "(let ((q {})) {})",
                expr(u, depth, scope)?,
                expr(u, depth, &inner)?
            )
        }
    })
}

fn program(u: &mut Unstructured<'_>) -> arbitrary::Result<String> {
    let x: i8 = u.arbitrary()?;
    let y: i8 = u.arbitrary()?;
    let body = expr(u, 4, &["x", "y"])?;
    Ok(format!("(define x {x}) (define y {y}) {body}"))
}

fn each_code_object(code: &CodeObject, visit: &mut impl FnMut(&CodeObject)) {
    visit(code);
    for child in code.children() {
        each_code_object(child, visit);
    }
}

#[test]
fn compiled_programs_survive_the_codec() {
    arbtest(|u| {
        let source = program(u)?;
        let_assert!(Ok(code) = compile_source(&source), "{source}");
        let_assert!(Ok(bytes) = serialize(&code), "{source}");
        let_assert!(Ok(decoded) = deserialize(&bytes), "{source}");
        check!(decoded == code, "{source}");
        let_assert!(Ok(again) = serialize(&decoded));
        check!(again == bytes, "{source}");
        Ok(())
    });
}

#[test]
fn compilation_is_deterministic() {
    arbtest(|u| {
        let source = program(u)?;
        let_assert!(Ok(first) = compile_source(&source));
        let_assert!(Ok(second) = compile_source(&source));
        check!(first == second, "{source}");
        Ok(())
    });
}

#[test]
fn jumps_stay_inside_their_code_object() {
    arbtest(|u| {
        let source = program(u)?;
        let_assert!(Ok(code) = compile_source(&source));
        check!(code.validate().is_ok(), "{source}");
        each_code_object(&code, &mut |code| {
            check!(code.code.last().map(|i| i.opcode) == Some(Opcode::Return), "{source}");
            for instr in code.code.iter().filter(|i| i.opcode.is_jump()) {
                let_assert!(Some(target) = instr.arg);
                check!((0..code.code.len() as i32).contains(&target), "{source}");
            }
        });
        Ok(())
    });
}

// Dynamic type errors are fine. Faults in the machine itself never are, and
// every RETURN must find exactly its result above the caller's operands.
#[test]
fn generated_programs_run_balanced_without_machine_faults() {
    arbtest(|u| {
        let source = program(u)?;
        let_assert!(Ok(code) = compile_source(&source));
        let config = VmConfig {
            fuel: Some(100_000),
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(config, Vec::<u8>::new());
        match vm.run(Rc::new(code)) {
            Ok(_)
            | Err(VmError::NotCallable(_))
            | Err(VmError::Primitive {
                source: PrimitiveError::TypeMismatch { .. } | PrimitiveError::Overflow,
                ..
            }) => {}
            Err(err @ VmError::StackImbalance { .. }) => {
                panic!("unbalanced code for {source}: {err}")
            }
            Err(err) => panic!("{source}: {err}"),
        }
        Ok(())
    });
}

#[test]
fn hand_built_code_encodes_exactly_when_valid() {
    arbtest(|u| {
        let len = u.int_in_range(1usize..=8)?;
        let code = CodeObject {
            code: (0..len)
                .map(|_| u.arbitrary::<Instruction>())
                .collect::<arbitrary::Result<_>>()?,
            constants: vec![
                Constant::Value(Value::Number(0)),
                Constant::Code(Rc::new(CodeObject {
                    code: vec![Instruction::bare(Opcode::Return)],
                    ..CodeObject::default()
                })),
            ],
            varnames: vec!["v".into()],
            ..CodeObject::default()
        };
        match serialize(&code) {
            Ok(bytes) => {
                check!(code.validate().is_ok());
                let_assert!(Ok(decoded) = deserialize(&bytes));
                check!(decoded == code);
            }
            // CALL counts are not table indices, so only the encoder bounds them
            Err(err) => {
                check!(
                    code.validate().is_err() || matches!(err, FormatError::ArgumentOutOfRange { .. })
                );
            }
        }
        Ok(())
    });
}
