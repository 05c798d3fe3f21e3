use clap::Parser;
use std::process::ExitCode;

pub mod builder;
pub mod demo;
pub mod emit;
pub mod error;
pub mod invoke;
pub mod overrides;
pub mod types;
#[macro_use]
pub mod vm;

pub use builder::TypeBuilder;
pub use error::{BuildError, EmitError, SynthError};
pub use invoke::{BoundInvoker, DynamicInvokeSynthesizer, DynamicInvoker, ShimCache};
pub use overrides::MemberOverrideBuilder;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Synthesize override members and dynamic-invoke shims for a demonstration type"
)]
pub struct Args {
    /// Run the synthesized members in the interpreter after dumping them
    #[arg(short, long)]
    pub run: bool,
    /// Emit explicit (private, name-mangled) overrides
    #[arg(short, long)]
    pub explicit: bool,
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    let demo = match demo::build_demo(args.explicit) {
        Ok(demo) => demo,
        Err(e) => {
            eprintln!("synthesis failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    demo::print_type_info(&demo.widget);
    demo::print_type_info(demo.doubler.host());

    if args.run {
        println!();
        if let Err(e) = demo::run_demo(&demo) {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }
    let tracer = vm::tracer::tracer();
    tracer.print_stats();
    tracer.flush();
    ExitCode::SUCCESS
}
