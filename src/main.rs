//! PawScript CLI.
//!
//! A thin driver around `pawscript::host::Instance`: run a script file or
//! an inline `-c` string against a fresh instance with the demo command
//! set registered.

use std::process::ExitCode;

use clap::Parser;

mod demos;

#[derive(Parser)]
#[command(name = "pawscript", about = "Run a PawScript file or inline script")]
struct Cli {
    /// Script file to execute.
    script: Option<std::path::PathBuf>,

    /// Run this script text instead of reading a file.
    #[arg(short = 'c', long)]
    command: Option<String>,
}

fn main() -> ExitCode {
    pawscript::logger::init_stderr_logger();
    let cli = Cli::parse();

    let instance = pawscript::host::Instance::new(pawscript::config::Config::default());
    demos::register(&instance);

    let result = match (&cli.command, &cli.script) {
        (Some(src), _) => instance.execute_in_root(src),
        (None, Some(path)) => instance.execute_file(path),
        (None, None) => {
            eprintln!("usage: pawscript <script> | -c <script>");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(r) => {
            if r.status() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
