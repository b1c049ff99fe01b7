#[tokio::main]
async fn main() -> anyhow::Result<()> {
    procura_server::run().await
}
