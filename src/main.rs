mod demo;

use std::{fs, process};

use clap::{Parser as ClapParser, Subcommand};
use log::info;

use cinder::analysis::{ControlFlowGraph, Liveness, decompile};
use cinder::bytecode::disasm::disassemble;
use cinder::bytecode::stack_check::check_program;
use cinder::{CompileOptions, Program, TargetVersion, Vm, VmConfig, compile_with_options};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "YARV-style bytecode compiler and VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Keep every call a generic `send`
    #[arg(long, global = true)]
    no_specialize: bool,

    /// Keep `getlocal`/`setlocal`/`putobject` in their operand forms
    #[arg(long, global = true)]
    no_unify: bool,

    /// Compile string literals as frozen objects
    #[arg(long, global = true)]
    frozen_strings: bool,

    /// Language version the bytecode targets, e.g. 3.1
    #[arg(long, global = true, default_value_t = TargetVersion::LATEST)]
    target: TargetVersion,

    /// Abort execution after this many instructions
    #[arg(long, global = true)]
    max_steps: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, disassemble and run the built-in samples
    Demo {
        /// Only this sample
        name: Option<String>,
    },
    /// Write the serialized form of a sample
    Dump { sample: String, out: String },
    /// Disassemble a serialized program
    Disasm { file: String },
    /// Print the control-flow graph and liveness of a serialized program
    Cfg { file: String },
    /// Execute a serialized program
    Run { file: String },
    /// List the built-in samples
    List,
}

impl Cli {
    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            frozen_string_literal: self.frozen_strings,
            operands_unification: !self.no_unify,
            specialized_instruction: !self.no_specialize,
            ..CompileOptions::default()
        }
        .with_target(self.target)
    }

    fn vm_config(&self) -> VmConfig {
        VmConfig {
            max_steps: self.max_steps,
            ..VmConfig::default()
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command.as_ref().unwrap_or(&Command::Demo { name: None }) {
        Command::Demo { name } => run_demo(&cli, name.as_deref()),
        Command::Dump { sample, out } => dump_sample(&cli, sample, out),
        Command::Disasm { file } => print!("{}", disassemble(&load(file))),
        Command::Cfg { file } => print_cfg(&load(file)),
        Command::Run { file } => {
            let program = load(file);
            execute(&cli, &program);
        }
        Command::List => {
            for sample in demo::SAMPLES {
                println!("{:<8} {}", sample.name, sample.source.replace('\n', "; "));
            }
        }
    }
}

fn fail(stage: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", stage, error);
    process::exit(1);
}

fn compile_sample(cli: &Cli, sample: &demo::Sample) -> Program {
    let node = (sample.build)();
    compile_with_options(&node, cli.compile_options()).unwrap_or_else(|e| fail("Compile error", e))
}

fn run_demo(cli: &Cli, only: Option<&str>) {
    let samples: Vec<&demo::Sample> = match only {
        Some(name) => match demo::find(name) {
            Some(sample) => vec![sample],
            None => fail("Unknown sample", name),
        },
        None => demo::SAMPLES.iter().collect(),
    };

    for sample in samples {
        println!("=== {} ===", sample.name);
        println!("{}", sample.source);
        println!();
        let program = compile_sample(cli, sample);
        if let Err(e) = check_program(&program) {
            fail("Stack check failed", e);
        }
        print!("{}", disassemble(&program));
        let value = execute(cli, &program);
        if value != sample.expected {
            eprintln!("warning: {} evaluated to {}, expected {}", sample.name, value, sample.expected);
        }
        println!();
    }
}

fn execute(cli: &Cli, program: &Program) -> String {
    let mut vm = Vm::with_config(cli.vm_config());
    match vm.run(program) {
        Ok(value) => {
            let shown = value.inspect();
            println!("=> {}", shown);
            shown
        }
        Err(e) => fail("Runtime error", e),
    }
}

fn dump_sample(cli: &Cli, name: &str, out: &str) {
    let Some(sample) = demo::find(name) else {
        fail("Unknown sample", name);
    };
    let program = compile_sample(cli, sample);
    let bytes = program.dump().unwrap_or_else(|e| fail("Serialization failed", e));
    if let Err(e) = fs::write(out, &bytes) {
        fail(&format!("Failed to write '{}'", out), e);
    }
    info!("wrote {} bytes to {}", bytes.len(), out);
}

fn load(file: &str) -> Program {
    let bytes = fs::read(file).unwrap_or_else(|e| fail(&format!("Failed to read '{}'", file), e));
    Program::load(&bytes).unwrap_or_else(|e| fail("Load failed", e))
}

fn print_cfg(program: &Program) {
    for (id, iseq) in program.iter() {
        let cfg = ControlFlowGraph::build(program, id).unwrap_or_else(|e| fail("CFG failed", e));
        print!("{}", cfg.render(program));
        let liveness = Liveness::compute(&cfg);
        for block in cfg.blocks() {
            let live: Vec<&str> = iseq
                .local_table
                .names()
                .enumerate()
                .filter(|(slot, _)| liveness.is_live_in(block.id, *slot))
                .map(|(_, name)| name)
                .collect();
            if !live.is_empty() {
                println!("live into block {}: {}", block.id, live.join(", "));
            }
        }
        println!();
    }
    match decompile(program) {
        Ok(node) => println!("decompiled: {:?}", node),
        Err(e) => println!("decompiled: {}", e),
    }
}
