fn main() {
    match daemonshepherd::shepherd::ctl_cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
