use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hyper::{Body, Method, Request};
use serde::{Deserialize, Serialize};

use relayio::{RelayIo, Socket};
use serde_json::Value;
use std::sync::Arc;

/// The OPEN payload of the engine handshake.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

/// Sends one engine request. `params` is the query tail after `EIO=4&`.
pub async fn send_req(port: u16, params: String, method: Method, body: Option<String>) -> String {
    let body = body.map(Body::from).unwrap_or_else(Body::empty);
    let req = Request::builder()
        .method(method)
        .uri(format!("http://127.0.0.1:{port}/socket.io/?EIO=4&{params}"))
        .body(body)
        .unwrap();

    let mut res = hyper::Client::new().request(req).await.unwrap();
    let body = hyper::body::to_bytes(res.body_mut()).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

/// Runs the polling handshake and returns the session id.
pub async fn create_polling_connection(port: u16) -> String {
    let body = send_req(port, "transport=polling".to_string(), Method::GET, None).await;
    let open: OpenPacket = serde_json::from_str(&body[1..]).unwrap();

    send_req(
        port,
        format!("transport=polling&sid={}", open.sid),
        Method::POST,
        Some("40".to_string()),
    )
    .await;

    open.sid
}

/// Binds a server on the given port with an echoing "/" namespace:
/// a "ping" with an ack gets an ack reply, a "ping" without one gets an
/// unsolicited "pong" event back.
pub async fn create_server(port: u16) -> RelayIo {
    let (svc, io) = RelayIo::builder()
        .ns("/", |socket: Arc<Socket>| async move {
            socket.on("ping", |socket, data: Value, _bin, ack| async move {
                let arg = data
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match ack {
                    Some(ack) => {
                        ack.send(format!("pong-{arg}")).ok();
                    }
                    None => {
                        socket.emit("pong", arg).ok();
                    }
                }
            });
        })
        .build_svc();

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let server = hyper::Server::bind(&addr).serve(svc.into_make_service());
    tokio::spawn(server);
    io
}
