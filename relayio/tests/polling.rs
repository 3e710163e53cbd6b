mod fixture;

use fixture::{create_polling_connection, create_server, send_req, OpenPacket};
use hyper::Method;

#[tokio::test]
async fn handshake_advertises_the_session_parameters() {
    const PORT: u16 = 34100;
    create_server(PORT).await;

    let body = send_req(PORT, "transport=polling".to_string(), Method::GET, None).await;
    assert!(body.starts_with("0{"), "unexpected handshake body: {body}");

    let open: OpenPacket = serde_json::from_str(&body[1..]).unwrap();
    assert_eq!(open.upgrades, ["websocket"]);
    assert_eq!(open.ping_interval, 25000);
    assert_eq!(open.ping_timeout, 20000);
    assert_eq!(open.max_payload, 100_000);
    assert_eq!(open.sid.len(), 16);
}

#[tokio::test]
async fn connect_is_acknowledged_on_the_next_poll() {
    const PORT: u16 = 34101;
    create_server(PORT).await;
    let sid = create_polling_connection(PORT).await;

    let body = send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;
    assert!(
        body.starts_with("40{\"sid\":\""),
        "expected a connect ack, got: {body}"
    );
}

#[tokio::test]
async fn event_with_ack_is_answered() {
    const PORT: u16 = 34102;
    create_server(PORT).await;
    let sid = create_polling_connection(PORT).await;

    // drain the connect ack
    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;

    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::POST,
        Some("212[\"ping\",\"x\"]".to_string()),
    )
    .await;

    let body = send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(body, "312[\"pong-x\"]");
}

#[tokio::test]
async fn event_without_ack_gets_an_event_back() {
    const PORT: u16 = 34103;
    create_server(PORT).await;
    let sid = create_polling_connection(PORT).await;

    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;

    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::POST,
        Some("2[\"ping\",\"x\"]".to_string()),
    )
    .await;

    let body = send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(body, "2[\"pong\",\"x\"]");
}

#[tokio::test]
async fn unknown_namespace_is_refused() {
    const PORT: u16 = 34104;
    create_server(PORT).await;

    let body = send_req(PORT, "transport=polling".to_string(), Method::GET, None).await;
    let open: OpenPacket = serde_json::from_str(&body[1..]).unwrap();

    send_req(
        PORT,
        format!("transport=polling&sid={}", open.sid),
        Method::POST,
        Some("40/nowhere,".to_string()),
    )
    .await;

    let body = send_req(
        PORT,
        format!("transport=polling&sid={}", open.sid),
        Method::GET,
        None,
    )
    .await;
    assert_eq!(body, "4/nowhere,{\"message\":\"Invalid namespace\"}");
}

#[tokio::test]
async fn malformed_payload_closes_the_session() {
    const PORT: u16 = 34105;
    create_server(PORT).await;
    let sid = create_polling_connection(PORT).await;

    send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::POST,
        Some("not a packet".to_string()),
    )
    .await;

    // the session is gone: the next poll cannot find it
    let body = send_req(
        PORT,
        format!("transport=polling&sid={sid}"),
        Method::GET,
        None,
    )
    .await;
    assert!(body.is_empty(), "expected an error response, got: {body}");
}
