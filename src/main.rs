use clap::Parser;

mod cli;
mod core;
mod logging;
mod util;

fn main() {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = cli::execute(cli.command) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
