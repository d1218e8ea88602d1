#[tokio::main]
async fn main() -> anyhow::Result<()> {
    financeflip_lib::run().await
}
