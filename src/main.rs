#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    recipe_feed_server::start_server().await
}
