/// WebSocket session forwarding protocol frames to the worker
use actix::prelude::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::messages::Reply;
use crate::worker::WorkerHandle;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for all WebSocket connections
pub struct AppState {
    pub worker: WorkerHandle,
}

impl AppState {
    pub fn new(worker: WorkerHandle) -> Self {
        Self { worker }
    }
}

/// Reply from the worker, delivered to the session actor
#[derive(Message)]
#[rtype(result = "()")]
struct ReplyMessage(Reply);

/// WebSocket connection actor; one client id per connection
pub struct PivotWebSocket {
    hb: Instant,
    client_id: String,
    state: actix_web::web::Data<AppState>,
    outbox: Option<mpsc::UnboundedSender<Reply>>,
}

impl PivotWebSocket {
    pub fn new(state: actix_web::web::Data<AppState>) -> Self {
        Self {
            hb: Instant::now(),
            client_id: Uuid::new_v4().to_string(),
            state,
            outbox: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::info!("Client {} heartbeat failed, disconnecting", act.client_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_reply(reply: &Reply, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(reply) {
            Ok(text) => ctx.text(text),
            Err(e) => log::error!("Failed to encode reply: {}", e),
        }
    }
}

impl Actor for PivotWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);

        let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
        self.outbox = Some(tx);
        let addr = ctx.address();
        actix::spawn(async move {
            while let Some(reply) = rx.recv().await {
                if !addr.connected() {
                    break;
                }
                addr.do_send(ReplyMessage(reply));
            }
        });
        log::debug!("Client {} connected", self.client_id);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.outbox = None;
        if let Err(e) = self.state.worker.disconnect(&self.client_id) {
            log::warn!("Could not clean up client {}: {}", self.client_id, e);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PivotWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                let Some(outbox) = self.outbox.clone() else {
                    return;
                };
                if let Err(e) = self.state.worker.post(&self.client_id, text.to_string(), outbox) {
                    Self::send_reply(&Reply::error(None, &e), ctx);
                }
            }
            Ok(ws::Message::Binary(_)) => {
                let err = Error::protocol("binary frames are not supported; send JSON text");
                Self::send_reply(&Reply::error(None, &err), ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

impl Handler<ReplyMessage> for PivotWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ReplyMessage, ctx: &mut Self::Context) {
        Self::send_reply(&msg.0, ctx);
    }
}
