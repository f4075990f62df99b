use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use zamc::{asm, cfg, program};

#[derive(Parser)]
#[command(name = "zamc")]
#[command(about = "The ZAM bytecode JIT compiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a bytecode listing to native code and execute it
    Run {
        /// The listing to run
        file: PathBuf,

        /// Print the compile trace and generated LLVM IR
        #[arg(long)]
        trace: bool,

        /// Print elapsed compile+run time
        #[arg(long)]
        time: bool,
    },

    /// Show the decoded program: functions, blocks, instructions
    Dump {
        /// The listing to inspect
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct DumpProgram {
    functions: Vec<DumpFunction>,
}

#[derive(Serialize)]
struct DumpFunction {
    id: usize,
    arity: usize,
    entry: usize,
    end: usize,
    instructions: Vec<DumpInstruction>,
}

#[derive(Serialize)]
struct DumpInstruction {
    index: usize,
    opcode: String,
    args: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    targets: Vec<u32>,
    leader: bool,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, trace, time } => run_cmd(&file, trace, time),
        Commands::Dump { file, json } => dump_cmd(&file, json),
    }
}

fn read_listing(file: &PathBuf) -> String {
    match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("{}: {}", file.display(), e);
            std::process::exit(1);
        }
    }
}

fn run_cmd(file: &PathBuf, trace: bool, time: bool) {
    let text = read_listing(file);
    let started = std::time::Instant::now();

    match zamc::run_source(&text, trace) {
        Ok(raw) => {
            if time {
                eprintln!("{:.6}s", started.elapsed().as_secs_f64());
            }
            if zam_rt::value::is_int(raw) {
                println!("{}", zam_rt::value::int_val(raw));
            } else {
                println!("<block {:#x}>", raw);
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn dump_cmd(file: &PathBuf, json: bool) {
    let text = read_listing(file);
    let source = match asm::parse_source(&text) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    let program = match program::partition(&source.instrs, source.initial_accu) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    if json {
        let dump = DumpProgram {
            functions: program
                .functions
                .iter()
                .map(|f| DumpFunction {
                    id: f.id,
                    arity: f.arity,
                    entry: f.entry,
                    end: f.end,
                    instructions: f
                        .instrs
                        .iter()
                        .enumerate()
                        .map(|(i, inst)| DumpInstruction {
                            index: f.entry + i,
                            opcode: inst.op.name().to_string(),
                            args: inst.args.to_vec(),
                            targets: inst.rec.clone(),
                            leader: inst.leader,
                        })
                        .collect(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&dump).unwrap());
        return;
    }

    for func in &program.functions {
        println!(
            "function {} (arity {}) @ {}..{}",
            func.id, func.arity, func.entry, func.end
        );
        match cfg::build(func) {
            Ok(cfg) => {
                for block in cfg.blocks.values() {
                    println!(
                        "  block {}: preds {:?} taken {:?} fall {:?} traps {:?}",
                        block.start, block.preds, block.taken, block.fall, block.traps
                    );
                    for at in block.start..block.end {
                        let inst = func.at(at);
                        let args: Vec<String> =
                            inst.args.iter().map(|a| a.to_string()).collect();
                        let rec: String =
                            inst.rec.iter().map(|t| format!(" ->{}", t)).collect();
                        println!(
                            "    {:4}: {} [{}]{}",
                            at,
                            inst.op.name(),
                            args.join(" "),
                            rec
                        );
                    }
                }
            }
            Err(e) => println!("  <block construction failed: {}>", e),
        }
    }
}
