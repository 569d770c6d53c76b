use clap::Parser as ClapParser;
use std::process;

use ktro::{package, Vm, VmCreateInfo};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The packaged program to execute
    #[arg(help = "The .pkg file to execute")]
    file: String,

    /// Size of the memory buffer in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    memory: usize,

    /// Log a trace line per executed step (needs RUST_LOG=trace)
    #[arg(long, help = "Trace every execution step")]
    trace: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let program = match package::read_package(&cli.file) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("Error reading package '{}': {}", cli.file, err);
            process::exit(1);
        }
    };

    let info = VmCreateInfo {
        memory_size: cli.memory,
        trace_steps: cli.trace,
    };
    let mut vm = match Vm::new(info, &program) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error loading '{}': {}", cli.file, err);
            process::exit(1);
        }
    };

    let exit_code = vm.run();
    process::exit(exit_code as i32);
}
