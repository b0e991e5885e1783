use std::process;

fn main() {
    if let Err(err) = teb::app::cli::run() {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}
