use std::process::ExitCode;

fn main() -> ExitCode {
    dotnet_synth::run_cli()
}
