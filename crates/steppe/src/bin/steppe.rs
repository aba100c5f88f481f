#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let result = steppe::run().await;

    // Raw mode is off again by now; flush so an error lands on a clean line
    use std::io::{self, Write};
    let _ = io::stderr().flush();
    let _ = io::stdout().flush();

    result
}
