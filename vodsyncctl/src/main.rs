use clap::Parser;

fn main() {
    let cli = vodsyncctl::Cli::parse();
    vodsyncctl::init_tracing();
    if let Err(err) = vodsyncctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
