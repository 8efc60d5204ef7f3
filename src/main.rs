#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bunk_office_lib::run().await
}
