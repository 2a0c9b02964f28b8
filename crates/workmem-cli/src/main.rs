#![forbid(unsafe_code)]

fn main() {
    std::process::exit(workmem_cli::run());
}
