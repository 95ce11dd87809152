/// LivePivot WebSocket Server
///
/// Standalone server exposing the host protocol over WebSocket text frames.

use livepivot::server::run_server;
use livepivot::Settings;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = match std::env::var("PORT") {
        Ok(value) => value.parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "PORT must be a number")
        })?,
        Err(_) => 8080,
    };

    run_server(&host, port, Settings::from_env()).await
}
