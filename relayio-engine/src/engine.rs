use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::{stream::SplitStream, SinkExt, StreamExt, TryStreamExt};
use http::{Request, Response, StatusCode};
use hyper::upgrade::Upgraded;
use tokio_tungstenite::{
    tungstenite::{protocol::Role, Message},
    WebSocketStream,
};
use tracing::debug;

use crate::{
    body::ResponseBody,
    config::EngineConfig,
    errors::Error,
    futures::{http_response, ws_response},
    handler::SessionHandler,
    packet::{OpenPacket, Packet},
    payload::{poll_decoder, poll_encoder},
    service::TransportType,
    session::{DisconnectReason, Session, SessionReq},
    sid::Sid,
};

/// The engine server: accepts handshakes, owns the session registry and
/// routes every subsequent request to the right session.
pub struct EngineServer<H: SessionHandler> {
    sessions: RwLock<HashMap<Sid, Arc<Session<H::Data>>>>,
    handler: H,
    pub config: EngineConfig,
}

impl<H: SessionHandler> EngineServer<H> {
    pub fn new(handler: H, config: EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            handler,
            config,
        }
    }

    /// Handshake on the polling transport: registers a new session, starts
    /// its heartbeat and answers with the OPEN packet.
    pub(crate) fn on_open_req<B, R>(
        self: Arc<Self>,
        req: Request<R>,
    ) -> Result<Response<ResponseBody<B>>, Error>
    where
        B: Send + 'static,
    {
        let engine = self.clone();
        let close_fn = Box::new(move |sid, reason| engine.close_session(sid, reason));
        let sid = Sid::new();
        let session = Arc::new(Session::new(
            sid,
            TransportType::Polling,
            &self.config,
            SessionReq::from(req.into_parts().0),
            close_fn,
        ));
        self.sessions.write().unwrap().insert(sid, session.clone());
        session.spawn_heartbeat(self.config.ping_interval, self.config.ping_timeout);
        self.handler.on_connect(session);

        let packet = OpenPacket::new(TransportType::Polling, sid, &self.config);
        let packet: String = Packet::Open(packet).try_into()?;
        Ok(http_response(StatusCode::OK, packet)?)
    }

    /// Long-poll GET: drains the session write buffer into one response, or
    /// hangs until a packet shows up.
    pub(crate) async fn on_polling_req<B>(
        self: Arc<Self>,
        sid: Sid,
    ) -> Result<Response<ResponseBody<B>>, Error>
    where
        B: Send + 'static,
    {
        let session = self.get_session(sid).ok_or(Error::UnknownSession(sid))?;
        if !session.is_polling() {
            return Err(Error::TransportMismatch);
        }

        // A contended buffer lock means a second poll for the same session,
        // which the protocol forbids.
        let rx = match session.internal_rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => {
                self.close_session(sid, DisconnectReason::MultiplePollingRequests);
                return Err(Error::HttpErrorResponse(StatusCode::BAD_REQUEST));
            }
        };

        debug!("[sid={sid}] polling request");
        let data = poll_encoder(rx, self.config.max_payload).await?;
        Ok(http_response(StatusCode::OK, data)?)
    }

    /// Long-poll POST: splits the body into packets and dispatches them.
    pub(crate) async fn on_post_req<R, B>(
        self: Arc<Self>,
        sid: Sid,
        req: Request<R>,
    ) -> Result<Response<ResponseBody<B>>, Error>
    where
        R: http_body::Body + Send + 'static,
        R::Error: Debug,
        R::Data: Send,
        B: Send + 'static,
    {
        let body = hyper::body::to_bytes(req.into_body()).await.map_err(|e| {
            debug!("[sid={sid}] error reading request body: {:?}", e);
            Error::HttpErrorResponse(StatusCode::BAD_REQUEST)
        })?;
        if body.len() as u64 > self.config.max_payload {
            self.close_session(sid, DisconnectReason::PacketParsing);
            return Err(Error::PayloadTooLarge);
        }

        let session = self.get_session(sid).ok_or(Error::UnknownSession(sid))?;
        if !session.is_polling() {
            return Err(Error::TransportMismatch);
        }

        let body = std::str::from_utf8(&body).map_err(|_| {
            self.close_session(sid, DisconnectReason::PacketParsing);
            Error::InvalidPacketType
        })?;

        for packet in poll_decoder(body) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("[sid={sid}] error parsing packet: {:?}", e);
                    self.close_session(sid, DisconnectReason::PacketParsing);
                    return Err(e);
                }
            };
            match packet {
                Packet::Close => {
                    debug!("[sid={sid}] closing session");
                    session.send(Packet::Noop).ok();
                    self.close_session(sid, DisconnectReason::TransportClose);
                    break;
                }
                Packet::Ping | Packet::Pong => session
                    .pong_tx
                    .try_send(())
                    .map_err(|_| Error::HeartbeatTimeout)?,
                Packet::Message(msg) => self.handler.on_message(msg, session.clone()),
                Packet::Binary(data) => self.handler.on_binary(data, session.clone()),
                p => {
                    debug!("[sid={sid}] bad packet received: {:?}", p);
                    self.close_session(sid, DisconnectReason::PacketParsing);
                    return Err(Error::BadPacket(p));
                }
            }
        }
        Ok(http_response(StatusCode::OK, "ok")?)
    }

    /// Answers a websocket upgrade request and spawns the connection task.
    ///
    /// With a `sid` in the query this is a transport upgrade of an existing
    /// polling session; without one it is a direct websocket handshake.
    pub(crate) fn on_ws_req<R, B>(
        self: Arc<Self>,
        sid: Option<Sid>,
        req: Request<R>,
    ) -> Result<Response<ResponseBody<B>>, Error> {
        let (parts, _) = req.into_parts();
        let ws_key = parts
            .headers
            .get("Sec-WebSocket-Key")
            .ok_or(Error::HttpErrorResponse(StatusCode::BAD_REQUEST))?
            .clone();
        let req_data = SessionReq::from(&parts);

        let req = Request::from_parts(parts, ());
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(conn) => match self.on_ws_conn(conn, sid, req_data).await {
                    Ok(_) => debug!("ws closed"),
                    Err(e) => debug!("ws closed with error: {:?}", e),
                },
                Err(e) => debug!("ws upgrade error: {}", e),
            }
        });

        ws_response(&ws_key)
    }

    /// Runs one websocket connection to completion: performs the upgrade or
    /// init handshake, pipes the write buffer out and dispatches inbound
    /// frames.
    async fn on_ws_conn(
        self: Arc<Self>,
        conn: Upgraded,
        sid: Option<Sid>,
        req_data: SessionReq,
    ) -> Result<(), Error> {
        let mut ws = WebSocketStream::from_raw_socket(conn, Role::Server, None).await;

        let (session, is_upgrade) = if let Some(sid) = sid {
            let session = self.get_session(sid).ok_or(Error::UnknownSession(sid))?;
            if session.is_ws() {
                return Err(Error::UpgradeError);
            }
            debug!("[sid={sid}] websocket upgrade");
            self.ws_upgrade_handshake(&session, &mut ws).await?;
            (session, true)
        } else {
            let sid = Sid::new();
            let engine = self.clone();
            let close_fn = Box::new(move |sid, reason| engine.close_session(sid, reason));
            let session = Arc::new(Session::new(
                sid,
                TransportType::Websocket,
                &self.config,
                req_data,
                close_fn,
            ));
            self.sessions.write().unwrap().insert(sid, session.clone());
            debug!("[sid={sid}] new websocket connection");

            let packet = OpenPacket::new(TransportType::Websocket, sid, &self.config);
            let packet: String = Packet::Open(packet).try_into()?;
            ws.send(Message::Text(packet)).await?;
            session.spawn_heartbeat(self.config.ping_interval, self.config.ping_timeout);
            (session, false)
        };

        let (mut tx, rx) = ws.split();

        // Pipe the session write buffer into the websocket sink. Buffered
        // packets from before an upgrade drain here in their original order.
        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            let mut buffer = match writer_session.internal_rx.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    writer_session.close(DisconnectReason::TransportError);
                    return;
                }
            };
            while let Some(packet) = buffer.recv().await {
                let res = match packet {
                    Packet::Binary(bin) => tx.send(Message::Binary(bin.to_vec())).await,
                    Packet::Close => {
                        tx.send(Message::Close(None)).await.ok();
                        break;
                    }
                    packet => match TryInto::<String>::try_into(packet) {
                        Ok(msg) => tx.send(Message::Text(msg)).await,
                        Err(_) => break,
                    },
                };
                if let Err(e) = res {
                    debug!("[sid={}] ws write error: {}", writer_session.sid, e);
                    break;
                }
            }
        });

        if !is_upgrade {
            self.handler.on_connect(session.clone());
        }
        if let Err(e) = self.ws_forward(rx, &session).await {
            debug!("[sid={}] ws read error: {:?}", session.sid, e);
        }
        self.close_session(session.sid, DisconnectReason::TransportClose);
        writer.abort();
        Ok(())
    }

    /// Dispatches every frame read from the websocket to the handler.
    async fn ws_forward(
        &self,
        mut rx: SplitStream<WebSocketStream<Upgraded>>,
        session: &Arc<Session<H::Data>>,
    ) -> Result<(), Error> {
        while let Ok(msg) = rx.try_next().await {
            let Some(msg) = msg else { break };
            match msg {
                Message::Text(msg) => match Packet::try_from(msg.as_str())? {
                    Packet::Close => break,
                    Packet::Ping | Packet::Pong => session
                        .pong_tx
                        .try_send(())
                        .map_err(|_| Error::HeartbeatTimeout)?,
                    Packet::Message(msg) => self.handler.on_message(msg, session.clone()),
                    p => return Err(Error::BadPacket(p)),
                },
                Message::Binary(data) => self.handler.on_binary(Bytes::from(data), session.clone()),
                Message::Close(_) => break,
                _ => (),
            }
        }
        Ok(())
    }

    /// The upgrade handshake, seen from the server:
    ///
    /// ```text
    /// CLIENT                                   SERVER
    ///   │  ── 2probe ─────────────────────────►  │   probe ping on the new ws
    ///   │  ◄───────────────────────── 3probe ──  │   probe pong
    ///   │  ◄────────────────────────────── 6 ──  │   noop flushed to polling
    ///   │  ── 5 ─────────────────────────────►   │   upgrade confirmed
    /// ```
    ///
    /// Writes issued during the probe window keep going to the polling
    /// transport; only once UPGRADE is in and the pending poll released does
    /// the buffer switch over.
    async fn ws_upgrade_handshake(
        &self,
        session: &Arc<Session<H::Data>>,
        ws: &mut WebSocketStream<Upgraded>,
    ) -> Result<(), Error> {
        let msg = match ws.next().await {
            Some(Ok(Message::Text(msg))) => msg,
            _ => return Err(Error::UpgradeError),
        };
        match Packet::try_from(msg.as_str())? {
            Packet::PingProbe => {
                ws.send(Message::Text(Packet::PongProbe.try_into()?)).await?;
            }
            p => return Err(Error::BadPacket(p)),
        };

        // release any pending polling request so it closes gracefully
        session.send(Packet::Noop)?;

        let msg = match ws.next().await {
            Some(Ok(Message::Text(msg))) => msg,
            _ => return Err(Error::UpgradeError),
        };
        match Packet::try_from(msg.as_str())? {
            Packet::Upgrade => debug!("[sid={}] ws upgrade successful", session.sid),
            p => return Err(Error::BadPacket(p)),
        };

        // wait for the in-flight polling request to release the write buffer
        drop(session.internal_rx.lock().await);
        session.upgrade_to_websocket();
        Ok(())
    }

    /// The only path that unregisters a session. Idempotent.
    pub(crate) fn close_session(&self, sid: Sid, reason: DisconnectReason) {
        let session = self.sessions.write().unwrap().remove(&sid);
        if let Some(session) = session {
            session.abort_heartbeat();
            self.handler.on_disconnect(session, reason);
            debug!(
                "[sid={sid}] session closed ({reason}), {} remaining",
                self.sessions.read().unwrap().len()
            );
        }
    }

    /// Fetches a session by id, cloning the ref so the lock is not held.
    pub fn get_session(&self, sid: Sid) -> Option<Arc<Session<H::Data>>> {
        self.sessions.read().unwrap().get(&sid).cloned()
    }
}

impl<H: SessionHandler> std::fmt::Debug for EngineServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServer")
            .field("config", &self.config)
            .field("sessions", &self.sessions.read().unwrap().len())
            .finish()
    }
}
