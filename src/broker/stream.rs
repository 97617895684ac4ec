use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::crypto::aes_cbc_base64_decrypt;
use super::wire::{
    classify_message, parse_execution_notice, parse_order_book, parse_tick, InboundMessage,
    RealtimeFrame, TR_EXECUTION, TR_EXECUTION_SANDBOX, TR_ORDER_BOOK, TR_TICK,
};

const KIS_REAL_WS: &str = "ws://ops.koreainvestment.com:21000";
const KIS_SANDBOX_WS: &str = "ws://ops.koreainvestment.com:31000";

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const DEGRADE_AFTER_FAILURES: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum StreamCommand {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug)]
pub enum StreamEvent {
    Tick(crate::types::PriceTick),
    Book(crate::types::BookTop),
    Execution(crate::types::ExecutionNotice),
    Connected,
    Disconnected,
    /// Too many consecutive connect failures; consumers should fall back to
    /// pull-only pricing until `Connected` arrives again.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub approval_key: String,
    pub hts_id: String,
    pub sandbox: bool,
}

impl StreamConfig {
    fn url(&self) -> &'static str {
        if self.sandbox {
            KIS_SANDBOX_WS
        } else {
            KIS_REAL_WS
        }
    }

    fn execution_tr_id(&self) -> &'static str {
        if self.sandbox {
            TR_EXECUTION_SANDBOX
        } else {
            TR_EXECUTION
        }
    }
}

/// Long-lived websocket session. Owns the connection, echoes PINGPONG,
/// resubscribes after reconnects, decrypts execution notices, and never lets
/// a malformed frame escape as a panic.
pub struct StreamSession {
    config: StreamConfig,
    subscriptions: HashSet<String>,
    aes_key: Option<String>,
    aes_iv: Option<String>,
    events: mpsc::Sender<StreamEvent>,
}

impl StreamSession {
    pub fn spawn(
        config: StreamConfig,
        commands: mpsc::Receiver<StreamCommand>,
        events: mpsc::Sender<StreamEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let session = StreamSession {
            config,
            subscriptions: HashSet::new(),
            aes_key: None,
            aes_iv: None,
            events,
        };
        tokio::spawn(session.run(commands, shutdown))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<StreamCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = RECONNECT_BASE;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(self.config.url()).await {
                Ok((ws, _)) => {
                    info!("realtime stream connected");
                    failures = 0;
                    backoff = RECONNECT_BASE;
                    let _ = self.events.send(StreamEvent::Connected).await;
                    self.drive(ws, &mut commands, &mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!("realtime stream closed, reconnecting");
                    let _ = self.events.send(StreamEvent::Disconnected).await;
                }
                Err(e) => {
                    failures += 1;
                    error!("stream connect failed ({}): {}", failures, e);
                    if failures == DEGRADE_AFTER_FAILURES {
                        let _ = self.events.send(StreamEvent::Degraded).await;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
        info!("realtime stream task stopped");
    }

    async fn drive(
        &mut self,
        ws: WsStream,
        commands: &mut mpsc::Receiver<StreamCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let (mut write, mut read) = ws.split();

        // Re-establish every live subscription plus the execution-notice
        // channel on each (re)connect.
        let exec_tr = self.config.execution_tr_id();
        let hts_id = self.config.hts_id.clone();
        if self
            .send_subscription(&mut write, exec_tr, &hts_id, true)
            .await
            .is_err()
        {
            return;
        }
        let codes: Vec<String> = self.subscriptions.iter().cloned().collect();
        for code in codes {
            if self.subscribe_symbol(&mut write, &code, true).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                command = commands.recv() => {
                    match command {
                        Some(StreamCommand::Subscribe(code)) => {
                            if self.subscriptions.insert(code.clone()) {
                                if self.subscribe_symbol(&mut write, &code, true).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(StreamCommand::Unsubscribe(code)) => {
                            if self.subscriptions.remove(&code) {
                                let _ = self.subscribe_symbol(&mut write, &code, false).await;
                            }
                        }
                        None => return,
                    }
                }
                next = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match next {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(echo) = self.handle_text(&text).await {
                                if write.send(Message::Text(echo)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("stream closed by server");
                            return;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            error!("stream read error: {}", e);
                            return;
                        }
                        Ok(None) => return,
                        Err(_) => {
                            warn!("no stream traffic for {:?}, reconnecting", READ_TIMEOUT);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handles one text message; returns a reply to send when the message
    /// demands one (PINGPONG echo).
    async fn handle_text(&mut self, text: &str) -> Option<String> {
        match classify_message(text)? {
            InboundMessage::PingPong(raw) => {
                debug!("PINGPONG echoed");
                return Some(raw);
            }
            InboundMessage::System(msg) => {
                if let (Some(key), Some(iv)) = (msg.aes_key, msg.aes_iv) {
                    info!("execution-notice cipher keys negotiated");
                    self.aes_key = Some(key);
                    self.aes_iv = Some(iv);
                } else if !msg.success && !msg.message.is_empty() {
                    warn!("stream system error [{}]: {}", msg.tr_id, msg.message);
                }
            }
            InboundMessage::Realtime(frame) => self.handle_realtime(frame).await,
        }
        None
    }

    async fn handle_realtime(&mut self, frame: RealtimeFrame) {
        match frame.tr_id.as_str() {
            TR_TICK => {
                let payload = match self.payload(&frame) {
                    Some(p) => p,
                    None => return,
                };
                match parse_tick(&payload) {
                    Some(tick) => {
                        let _ = self.events.send(StreamEvent::Tick(tick)).await;
                    }
                    None => debug!("dropped malformed tick frame"),
                }
            }
            TR_ORDER_BOOK => {
                let payload = match self.payload(&frame) {
                    Some(p) => p,
                    None => return,
                };
                match parse_order_book(&payload) {
                    Some(book) => {
                        let _ = self.events.send(StreamEvent::Book(book)).await;
                    }
                    None => debug!("dropped malformed order-book frame"),
                }
            }
            TR_EXECUTION | TR_EXECUTION_SANDBOX => {
                // Execution notices are always encrypted.
                let (Some(key), Some(iv)) = (self.aes_key.as_deref(), self.aes_iv.as_deref()) else {
                    warn!("execution notice before key negotiation, dropped");
                    return;
                };
                let Some(decrypted) = aes_cbc_base64_decrypt(key, iv, &frame.payload) else {
                    warn!("execution notice failed to decrypt, dropped");
                    return;
                };
                match parse_execution_notice(&decrypted) {
                    Some(notice) => {
                        info!(
                            "execution notice: {} {} {}@{}",
                            notice.stock_code, notice.kind, notice.quantity, notice.price
                        );
                        let _ = self.events.send(StreamEvent::Execution(notice)).await;
                    }
                    None => debug!("non-fill or malformed execution notice dropped"),
                }
            }
            other => debug!("unknown realtime tr_id {}", other),
        }
    }

    fn payload(&self, frame: &RealtimeFrame) -> Option<String> {
        if frame.encrypted {
            let key = self.aes_key.as_deref()?;
            let iv = self.aes_iv.as_deref()?;
            aes_cbc_base64_decrypt(key, iv, &frame.payload)
        } else {
            Some(frame.payload.clone())
        }
    }

    async fn subscribe_symbol(
        &mut self,
        write: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        code: &str,
        subscribe: bool,
    ) -> Result<(), ()> {
        // Each symbol consumes two channels: tick and order book.
        self.send_subscription(write, TR_TICK, code, subscribe).await?;
        self.send_subscription(write, TR_ORDER_BOOK, code, subscribe).await
    }

    async fn send_subscription(
        &mut self,
        write: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        tr_id: &str,
        tr_key: &str,
        subscribe: bool,
    ) -> Result<(), ()> {
        let request = json!({
            "header": {
                "approval_key": self.config.approval_key,
                "custtype": "P",
                "tr_type": if subscribe { "1" } else { "2" },
                "content-type": "utf-8",
            },
            "body": { "input": { "tr_id": tr_id, "tr_key": tr_key } }
        });
        write
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| {
                error!("subscription send failed ({} {}): {}", tr_id, tr_key, e);
            })
    }
}
