mod cli;

fn main() {
    env_logger::init();
    if let Err(err) = cli::run(std::env::args_os()) {
        eprintln!("fatal: {:#}", err);
        std::process::exit(1);
    }
}
