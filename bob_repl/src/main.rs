use std::{
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::Context;
use bob::{
    compile_source, deserialize, lexer::Span, read, serialize, CodeObject, Compiler, Error, Frame,
    ParseError, Value, Vm, VmConfig,
};
use clap::{Parser, Subcommand};
use codesnake::{Block, CodeWidth, Label, LineIndex};
use rustyline::error::ReadlineError;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yansi::Paint;

#[derive(Parser, Debug)]
#[command(name = "bob", about = "Compile Scheme to bytecode and run it")]
struct Cli {
    /// Instruction budget for each program or REPL entry
    #[arg(long, global = true)]
    fuel: Option<i32>,

    /// Maximum number of active procedure calls
    #[arg(long, global = true, default_value_t = VmConfig::default().max_call_depth)]
    max_call_depth: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a source file to a bytecode file
    Compile {
        source: PathBuf,
        /// Defaults to the source path with a `.bobc` extension
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the disassembly instead of writing a file
        #[arg(long)]
        disassemble: bool,
    },
    /// Run a source file (`.scm`) or a bytecode file
    Run { file: PathBuf },
    /// Print the disassembly of a bytecode file
    Disasm { file: PathBuf },
}

fn visible_span(src: &str, span: Span) -> Span {
    // an error at end of input still needs something to point at
    if !span.is_empty() {
        return span;
    }
    match src[..span.start].chars().next_back() {
        Some(c) => span.start - c.len_utf8()..span.start,
        None => span,
    }
}

fn report_parse_error(file: &str, src: &str, err: &ParseError) {
    let idx = LineIndex::new(src);
    let label = Label::new(visible_span(src, err.span.clone()))
        .with_text(err.kind.to_string().red().to_string())
        .with_style(|s| s.red().to_string());

    eprintln!("{}: {}", "error".red().bold(), err.kind);
    if let Some(block) = Block::new(&idx, [label]) {
        let block = block.map_code(|c| CodeWidth::new(c, c.len()));
        eprintln!("{}[{file}]", block.prologue());
        eprint!("{block}");
        eprintln!("{}", block.epilogue());
    }
}

fn load_source(path: &Path) -> anyhow::Result<CodeObject> {
    let src = fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    match compile_source(&src) {
        Ok(code) => Ok(code),
        Err(Error::Parse(err)) => {
            report_parse_error(&path.display().to_string(), &src, &err);
            anyhow::bail!("could not parse {}", path.display())
        }
        Err(err) => Err(err).with_context(|| format!("could not compile {}", path.display())),
    }
}

fn load_bytecode(path: &Path) -> anyhow::Result<CodeObject> {
    let bytes = fs::read(path).with_context(|| format!("could not read {}", path.display()))?;
    deserialize(&bytes).with_context(|| format!("could not decode {}", path.display()))
}

fn is_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "scm")
}

fn compile(source: &Path, output: Option<PathBuf>, disassemble: bool) -> anyhow::Result<()> {
    let code = load_source(source)?;
    if disassemble {
        print!("{code}");
        return Ok(());
    }
    let output = output.unwrap_or_else(|| source.with_extension("bobc"));
    let bytes = serialize(&code)?;
    fs::write(&output, &bytes)
        .with_context(|| format!("could not write {}", output.display()))?;
    info!(output = %output.display(), bytes = bytes.len(), "wrote bytecode");
    Ok(())
}

fn run(file: &Path, config: VmConfig) -> anyhow::Result<()> {
    let code = if is_source(file) {
        load_source(file)?
    } else {
        load_bytecode(file)?
    };
    let mut vm = Vm::new(config);
    match vm.run(Rc::new(code))? {
        Value::Null => {}
        value => println!("{value}"),
    }
    Ok(())
}

// Each entry is compiled against what the session has bound so far, so
// its name table extends the frame's.
fn eval(vm: &mut Vm, frame: &Rc<Frame>, input: &str) -> Result<Value, Error> {
    let program = read(input)?;
    let mut globals = vm.primitive_names();
    globals.extend(frame.bound_names());
    let code = Compiler::new()
        .with_globals(globals)
        .with_toplevel_names(frame.varnames())
        .compile(&program)?;
    debug!(instructions = code.code.len(), "compiled entry");
    Ok(vm.run_in(Rc::new(code), frame)?)
}

fn repl(config: VmConfig) -> anyhow::Result<()> {
    let budget = config.fuel;
    let mut vm = Vm::new(config);
    let frame = vm.new_toplevel();
    let mut readline = rustyline::DefaultEditor::new()?;

    loop {
        let input = match readline.readline("bob> ") {
            Ok(input) => input,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        if input.trim().is_empty() {
            continue;
        }
        readline.add_history_entry(input.as_str())?;

        match eval(&mut vm, &frame, &input) {
            Ok(Value::Null) => {}
            Ok(value) => println!("{value}"),
            Err(Error::Parse(err)) => report_parse_error("repl", &input, &err),
            Err(err) => eprintln!("{}: {err}", "error".red().bold()),
        }

        if let (Some(fuel), Some(budget)) = (vm.fuel_mut(), budget) {
            fuel.refill(budget, budget);
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = VmConfig {
        max_call_depth: cli.max_call_depth,
        fuel: cli.fuel,
    };

    match cli.command {
        Some(Command::Compile {
            source,
            output,
            disassemble,
        }) => compile(&source, output, disassemble),
        Some(Command::Run { file }) => run(&file, config),
        Some(Command::Disasm { file }) => {
            print!("{}", load_bytecode(&file)?);
            Ok(())
        }
        None => repl(config),
    }
}
