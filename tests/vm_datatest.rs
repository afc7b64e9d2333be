use std::rc::Rc;

use bob::{compile_source, deserialize, serialize, Error, Vm, VmConfig};
use datatest_stable::Utf8Path;

#[derive(thiserror::Error, Debug)]
#[error("error(s) occured in vm datatest at {0}")]
pub struct DatatestError(Box<Utf8Path>);

// Generous enough for every scenario, small enough that a runaway test fails
const TEST_FUEL: i32 = 1_000_000;

/// A scenario file: the lines the program writes, `---`, the final value
/// (or `error: <message>`), `---`, and the program itself.
///
/// Lines starting with `;` before the source are comments.
#[derive(Debug, Default)]
struct Scenario<'a> {
    comments: Vec<&'a str>,
    output: Vec<&'a str>,
    result: Vec<&'a str>,
    source: String,
}

fn read_scenario(contents: &str) -> Scenario {
    #[derive(PartialEq, Eq, Debug, Default)]
    enum Section {
        #[default]
        Output,
        Result,
        Source,
    }

    let mut scenario = Scenario::default();
    let mut section = Section::default();
    for line in contents.lines() {
        if section != Section::Source && line.trim_start().starts_with(';') {
            scenario.comments.push(line);
            continue;
        }
        match section {
            Section::Output if line.trim_end() == "---" => section = Section::Result,
            Section::Output => scenario.output.push(line),
            Section::Result if line.trim_end() == "---" => section = Section::Source,
            Section::Result => scenario.result.push(line),
            Section::Source => {
                if !scenario.source.is_empty() {
                    scenario.source.push('\n');
                }
                scenario.source.push_str(line);
            }
        }
    }
    scenario
}

// from https://matklad.github.io/2021/05/31/how-to-test.html
// DATATEST_EXPECT rewrites the file with what actually happened.
fn stitch_scenario(comments: &[&str], output: &str, result: &str, source: &str) -> String {
    let mut lines: Vec<&str> = comments.to_vec();
    lines.extend(output.lines());
    lines.push("---");
    lines.extend(result.lines());
    lines.push("---");
    lines.extend(source.lines());
    let mut stitched = lines.join("\n");
    stitched.push('\n');
    stitched
}

// Runs the program after a trip through the codec, so every scenario also
// checks that serialization preserves behavior.
fn execute(source: &str) -> (String, String) {
    let config = VmConfig {
        fuel: Some(TEST_FUEL),
        ..VmConfig::default()
    };
    let mut vm = Vm::with_output(config, Vec::<u8>::new());
    let result = compile_source(source).and_then(|code| {
        let bytes = serialize(&code)?;
        let decoded = deserialize(&bytes)?;
        assert_eq!(decoded, code, "codec round trip changed the code object");
        Ok(vm.run(Rc::new(decoded))?)
    });
    let result = match result {
        Ok(value) => value.to_string(),
        Err(err @ Error::Vm(_)) | Err(err @ Error::Compile(_)) | Err(err @ Error::Parse(_)) => {
            format!("error: {err}")
        }
        Err(err @ Error::Format(_)) => panic!("codec failure: {err}"),
    };
    let output = String::from_utf8_lossy(vm.output()).into_owned();
    (output, result)
}

fn vm_test(path: &Utf8Path, contents: String) -> datatest_stable::Result<()> {
    let scenario = read_scenario(&contents);
    let (output, result) = execute(&scenario.source);

    if std::env::var("DATATEST_EXPECT").is_ok() {
        std::fs::write(
            path,
            stitch_scenario(&scenario.comments, &output, &result, &scenario.source),
        )?;
        return Ok(());
    }

    let expected_output = scenario.output.join("\n");
    let expected_result = scenario.result.join("\n");
    let mut failed = false;
    if output.trim_end() != expected_output.trim_end() {
        println!(
            "error in {path}: mismatched output\n\nGot:\n{}\n\nExpected:\n{}",
            output.trim_end(),
            expected_output.trim_end()
        );
        failed = true;
    }
    if result.trim() != expected_result.trim() {
        println!(
            "error in {path}: mismatched result\n\nGot:\n{}\n\nExpected:\n{}",
            result.trim(),
            expected_result.trim()
        );
        failed = true;
    }

    if failed {
        Err(DatatestError(Box::from(path)))?
    } else {
        Ok(())
    }
}

datatest_stable::harness! {
    vm_test, "test_data", r"^.*\.bobt",
}
