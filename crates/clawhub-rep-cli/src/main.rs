use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = clawhub_rep_cli::Cli::parse();
    if let Err(err) = clawhub_rep_cli::init_logging(cli.verbose(), cli.log_format()) {
        eprintln!("failed to initialize logging: {err}");
    }

    match clawhub_rep_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", clawhub_rep_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
