fn main() -> anyhow::Result<()> {
    conjure_lib::run()
}
