use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

use crate::types::{BookTop, ExecutionNotice, OrderKind, PriceTick};

pub const TR_TICK: &str = "H0STCNT0";
pub const TR_ORDER_BOOK: &str = "H0STASP0";
pub const TR_EXECUTION: &str = "H0STCNI0";
pub const TR_EXECUTION_SANDBOX: &str = "H0STCNI9";
pub const TR_PINGPONG: &str = "PINGPONG";

/// One inbound stream message after the first dispatch level.
#[derive(Debug)]
pub enum InboundMessage {
    /// `encryption_flag|tr_id|count|payload` realtime frame.
    Realtime(RealtimeFrame),
    /// Keep-alive that must be echoed back verbatim.
    PingPong(String),
    /// Subscription ack / system notice, possibly carrying AES key material.
    System(SystemMessage),
}

#[derive(Debug)]
pub struct RealtimeFrame {
    pub encrypted: bool,
    pub tr_id: String,
    pub payload: String,
}

#[derive(Debug, Default)]
pub struct SystemMessage {
    pub tr_id: String,
    pub success: bool,
    pub message: String,
    pub aes_key: Option<String>,
    pub aes_iv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SystemJson {
    #[serde(default)]
    header: SystemHeader,
    #[serde(default)]
    body: Option<SystemBody>,
}

#[derive(Debug, Default, Deserialize)]
struct SystemHeader {
    #[serde(default)]
    tr_id: String,
}

#[derive(Debug, Deserialize)]
struct SystemBody {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output: Option<SystemOutput>,
}

#[derive(Debug, Deserialize)]
struct SystemOutput {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    iv: Option<String>,
}

/// First dispatch level: realtime frames start with the encryption flag
/// (`'0'`/`'1'`), everything else is JSON. Malformed input yields None and is
/// dropped by the caller.
pub fn classify_message(raw: &str) -> Option<InboundMessage> {
    let first = raw.chars().next()?;
    if first == '0' || first == '1' {
        let mut parts = raw.splitn(4, '|');
        let flag = parts.next()?;
        let tr_id = parts.next()?;
        let _count = parts.next()?;
        let payload = parts.next()?;
        return Some(InboundMessage::Realtime(RealtimeFrame {
            encrypted: flag == "1",
            tr_id: tr_id.to_string(),
            payload: payload.to_string(),
        }));
    }

    let json: SystemJson = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparseable system message: {}", e);
            return None;
        }
    };

    if json.header.tr_id == TR_PINGPONG {
        return Some(InboundMessage::PingPong(raw.to_string()));
    }

    let mut msg = SystemMessage {
        tr_id: json.header.tr_id,
        ..Default::default()
    };
    if let Some(body) = json.body {
        msg.success = body.rt_cd == "0";
        msg.message = body.msg1;
        if let Some(output) = body.output {
            msg.aes_key = output.key;
            msg.aes_iv = output.iv;
        }
    }
    Some(InboundMessage::System(msg))
}

/// Tick frame payload: `^`-separated, [0] code, [2] price, [5] change rate,
/// [14] accumulated volume. Short or malformed payloads are dropped.
pub fn parse_tick(payload: &str) -> Option<PriceTick> {
    let parts: Vec<&str> = payload.split('^').collect();
    if parts.len() < 20 {
        return None;
    }
    let price = Decimal::from_str(parts[2]).ok()?;
    if price <= Decimal::ZERO {
        return None;
    }
    Some(PriceTick {
        stock_code: parts[0].to_string(),
        price,
        change_rate: parts[5].parse().unwrap_or(0.0),
        accumulated_volume: parts[14].parse().unwrap_or(0),
        received_at: chrono::Utc::now(),
    })
}

/// Order-book payload: [3] best ask, [13] best bid, [23]/[33] their sizes.
pub fn parse_order_book(payload: &str) -> Option<BookTop> {
    let parts: Vec<&str> = payload.split('^').collect();
    if parts.len() < 45 {
        return None;
    }
    Some(BookTop {
        stock_code: parts[0].to_string(),
        ask_price: Decimal::from_str(parts[3]).ok()?,
        bid_price: Decimal::from_str(parts[13]).ok()?,
        ask_quantity: parts[23].parse().unwrap_or(0),
        bid_quantity: parts[33].parse().unwrap_or(0),
    })
}

/// Decrypted execution notice: [2] order no, [4] side code (`01` sell /
/// `02` buy), [8] stock code, [9] quantity, [10] price, [11] time, [13] fill
/// flag. Only fill notices (`'2'`) with positive quantity and price survive.
pub fn parse_execution_notice(decrypted: &str) -> Option<ExecutionNotice> {
    let parts: Vec<&str> = decrypted.split('^').collect();
    if parts.len() < 20 {
        return None;
    }
    if parts[13] != "2" {
        return None;
    }
    let kind = match parts[4] {
        "01" => OrderKind::Sell,
        "02" => OrderKind::Buy,
        _ => return None,
    };
    let quantity: u32 = parts[9].parse().ok()?;
    let price: i64 = parts[10].parse().ok()?;
    if quantity == 0 || price <= 0 {
        return None;
    }
    Some(ExecutionNotice {
        stock_code: parts[8].to_string(),
        order_no: parts[2].to_string(),
        kind,
        quantity,
        price,
        execution_time: parts[11].to_string(),
    })
}
