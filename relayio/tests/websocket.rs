mod fixture;

use fixture::{create_polling_connection, create_server, send_req};
use futures::{SinkExt, StreamExt};
use hyper::Method;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_connect(port: u16, sid: Option<&str>) -> Ws {
    let sid = sid.map(|sid| format!("&sid={sid}")).unwrap_or_default();
    let url = format!("ws://127.0.0.1:{port}/socket.io/?EIO=4&transport=websocket{sid}");
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

/// Next text frame, skipping anything else (noop packets, pings).
async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a ws frame")
            .expect("ws stream ended")
            .unwrap();
        match msg {
            Message::Text(msg) if msg == "6" || msg == "2" => continue,
            Message::Text(msg) => return msg,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn direct_websocket_handshake_and_echo() {
    const PORT: u16 = 34200;
    create_server(PORT).await;

    let mut ws = ws_connect(PORT, None).await;

    let open = next_text(&mut ws).await;
    assert!(open.starts_with("0{"), "unexpected handshake frame: {open}");

    ws.send(Message::Text("40".to_string())).await.unwrap();
    let ack = next_text(&mut ws).await;
    assert!(ack.starts_with("40{\"sid\":\""), "unexpected connect ack: {ack}");

    ws.send(Message::Text("421[\"ping\",\"x\"]".to_string()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "431[\"pong-x\"]");
}

#[tokio::test]
async fn polling_session_upgrades_to_websocket() {
    const PORT: u16 = 34201;
    create_server(PORT).await;

    let sid = create_polling_connection(PORT).await;
    // drain the connect ack so the buffer is empty at upgrade time
    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;

    let mut ws = ws_connect(PORT, Some(&sid)).await;

    // probe handshake
    ws.send(Message::Text("2probe".to_string())).await.unwrap();
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(msg) if msg == "3probe" => break,
            Message::Text(msg) => panic!("unexpected frame during probe: {msg}"),
            _ => continue,
        }
    }
    ws.send(Message::Text("5".to_string())).await.unwrap();

    // the session now lives on the websocket: the echo still works
    ws.send(Message::Text("427[\"ping\",\"up\"]".to_string()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "437[\"pong-up\"]");

    // and the polling transport no longer accepts requests for this sid
    let body = send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;
    assert!(body.is_empty(), "expected an error response, got: {body}");
}

#[tokio::test]
async fn packets_buffered_before_the_upgrade_are_not_lost() {
    const PORT: u16 = 34202;
    let io = create_server(PORT).await;

    let sid = create_polling_connection(PORT).await;
    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;

    // queue a packet while the session is still on polling
    io.of("/").unwrap().emit("queued", "before-upgrade").unwrap();

    let mut ws = ws_connect(PORT, Some(&sid)).await;
    ws.send(Message::Text("2probe".to_string())).await.unwrap();
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(msg) if msg == "3probe" => break,
            _ => continue,
        }
    }
    ws.send(Message::Text("5".to_string())).await.unwrap();

    // the buffered packet drains into the new transport
    assert_eq!(
        next_text(&mut ws).await,
        "42[\"queued\",\"before-upgrade\"]"
    );
}
