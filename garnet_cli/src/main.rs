//! Garnet embedding host.
//!
//! Startup order matters and mirrors the runtime's contracts: capture the
//! start-of-stack address first (the conservative collector scans from
//! there), bootstrap the runtime with collection disabled, wire `ARGV` and
//! `$0`, enable collection, run, then the at-exit hooks, then exit with
//! the appropriate code.

mod args;
mod error;
mod selftest;

use args::ExecutionMode;
use garnet_runtime::array_object::ArrayObject;
use garnet_runtime::string_object::StringObject;
use garnet_runtime::value_ext::ValueExt;
use garnet_runtime::{intern, GlobalEnv};
use std::process::ExitCode;

fn main() -> ExitCode {
    // The address of this local bounds every stack scan.
    let stack_marker: usize = 0;

    let parsed = match args::parse(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(usage) => return error::usage_error(&usage),
    };

    match parsed.mode {
        ExecutionMode::PrintHelp => {
            println!("{}", args::HELP);
            ExitCode::from(error::EXIT_SUCCESS)
        }
        ExecutionMode::PrintVersion => {
            println!("garnet {}", garnet_core::VERSION);
            ExitCode::from(error::EXIT_SUCCESS)
        }
        mode => run(&parsed, mode, &stack_marker as *const usize as usize),
    }
}

fn run(parsed: &args::GarnetArgs, mode: ExecutionMode, start_of_stack: usize) -> ExitCode {
    if parsed.gc_stats {
        // The heap reads this when it is first built, which is below.
        std::env::set_var("GARNET_GC_STATS", "1");
    }

    let env = garnet_runtime::init_runtime(start_of_stack);
    let global = GlobalEnv::the();

    // ARGV and $0, per the embedding contract.
    let argv_values: Vec<_> = parsed
        .positional
        .iter()
        .map(|arg| StringObject::create(arg.as_str()))
        .collect();
    let argv = ArrayObject::create(argv_values);
    global
        .object_class()
        .as_module()
        .const_set(intern("ARGV"), argv);
    let exe = std::env::args().next().unwrap_or_else(|| "garnet".to_owned());
    global.global_set(intern("$0"), StringObject::create(exe));

    let status = match mode {
        ExecutionMode::SelfTest => match selftest::run(env) {
            Ok(()) => {
                println!("self-test passed");
                0
            }
            Err(reason) => {
                eprintln!("{reason}");
                i32::from(error::EXIT_ERROR)
            }
        },
        _ => {
            println!(
                "garnet {} (runtime core; no script front-end — try --selftest)",
                garnet_core::VERSION
            );
            0
        }
    };

    let hook_status = global.run_at_exit_hooks(env);
    error::exit_code_from_status(hook_status.unwrap_or(status))
}
