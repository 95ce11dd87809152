/// HTTP server with a WebSocket endpoint for the host protocol
use actix_web::{middleware, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use std::rc::Rc;

use crate::engine::{Engine, MemoryEngine};
use crate::settings::Settings;
use crate::websocket::{AppState, PivotWebSocket};
use crate::worker::Worker;

/// WebSocket endpoint handler
async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let resp = ws::start(PivotWebSocket::new(state), &req, stream)?;
    Ok(resp)
}

/// Health check endpoint
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "message": "LivePivot WebSocket server is running"
    }))
}

/// Start the HTTP server; all connections share one worker and engine.
pub async fn run_server(host: &str, port: u16, settings: Settings) -> std::io::Result<()> {
    let worker = Worker::spawn(settings, |_: Option<&[u8]>| {
        Ok(Rc::new(MemoryEngine::new()) as Rc<dyn Engine>)
    })?;
    let state = web::Data::new(AppState::new(worker.clone()));

    log::info!("WebSocket: ws://{}:{}/ws", host, port);
    log::info!("Health check: http://{}:{}/health", host, port);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            // CORS for development
            .wrap(
                actix_cors::Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .route("/ws", web::get().to(ws_index))
            .route("/health", web::get().to(health_check))
    })
    .bind((host, port))?
    .run()
    .await;

    worker.shutdown();
    result
}
