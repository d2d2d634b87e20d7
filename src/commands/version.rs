pub fn run() -> anyhow::Result<()> {
    println!("netpolicy-controller {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
