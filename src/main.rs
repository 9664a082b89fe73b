fn main() -> anyhow::Result<()> {
    pagepulse::run()
}
