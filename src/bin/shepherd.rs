fn main() -> anyhow::Result<()> {
    daemonshepherd::shepherd::cli::run()
}
