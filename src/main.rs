use napbot::NapBot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    NapBot::builder().config_path(path).build().run().await
}
