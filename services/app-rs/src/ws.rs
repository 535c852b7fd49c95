//! WebSocket fanout: per-short-code subscriber registry.
//!
//! Emission is synchronous from the caller's point of view: payloads go
//! into per-connection unbounded channels, each drained by that
//! connection's writer task. Closed channels are reaped on emit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FanoutStats {
    pub channels: usize,
    pub subscribers: usize,
    pub emitted: u64,
    pub reaped: u64,
}

#[derive(Default)]
pub struct Fanout {
    subscribers: DashMap<String, HashMap<u64, UnboundedSender<Message>>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    reaped: AtomicU64,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, short_code: &str) -> (u64, UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(short_code.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, short_code: &str, id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(short_code) {
            entry.remove(&id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers
                    .remove_if(short_code, |_, subs| subs.is_empty());
            }
        }
    }

    /// Deliver `payload` to every live subscriber of `short_code`.
    /// Returns the number of deliveries; dead connections are dropped.
    pub fn emit(&self, short_code: &str, payload: &serde_json::Value) -> usize {
        let Some(mut entry) = self.subscribers.get_mut(short_code) else {
            return 0;
        };
        let text = payload.to_string();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in entry.iter() {
            if tx.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in &dead {
            entry.remove(id);
        }
        self.emitted.fetch_add(delivered as u64, Ordering::Relaxed);
        self.reaped.fetch_add(dead.len() as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self, short_code: &str) -> usize {
        self.subscribers
            .get(short_code)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> FanoutStats {
        let subscribers = self.subscribers.iter().map(|e| e.value().len()).sum();
        FanoutStats {
            channels: self.subscribers.len(),
            subscribers,
            emitted: self.emitted.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

/// GET /api/v1/analytics/live/:short_code (upgrade).
pub async fn live_clicks(
    ws: WebSocketUpgrade,
    Path(short_code): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, short_code, state.fanout.clone()))
}

async fn serve_subscriber(socket: WebSocket, short_code: String, fanout: Arc<Fanout>) {
    let (id, mut rx) = fanout.subscribe(&short_code);
    tracing::debug!(
        %short_code,
        id,
        subscribers = fanout.subscriber_count(&short_code),
        "ws subscriber connected"
    );

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    // Clients only listen; anything but a close is ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    fanout.unsubscribe(&short_code, id);
    tracing::debug!(%short_code, id, "ws subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_reaches_every_live_subscriber_once() {
        let fanout = Fanout::new();
        let (_ida, mut rxa) = fanout.subscribe("abc");
        let (_idb, mut rxb) = fanout.subscribe("abc");
        let (_idc, mut rxc) = fanout.subscribe("other");

        let delivered = fanout.emit("abc", &json!({"shortCode": "abc"}));
        assert_eq!(delivered, 2);
        assert!(rxa.try_recv().is_ok());
        assert!(rxb.try_recv().is_ok());
        assert!(rxc.try_recv().is_err());
        // no second delivery
        assert!(rxa.try_recv().is_err());
    }

    #[test]
    fn dead_subscribers_are_reaped_on_emit() {
        let fanout = Fanout::new();
        let (_id, rx) = fanout.subscribe("abc");
        drop(rx);
        assert_eq!(fanout.subscriber_count("abc"), 1);
        assert_eq!(fanout.emit("abc", &json!({})), 0);
        assert_eq!(fanout.subscriber_count("abc"), 0);
        assert_eq!(fanout.stats().reaped, 1);
    }

    #[test]
    fn unsubscribe_removes_empty_channels() {
        let fanout = Fanout::new();
        let (id, _rx) = fanout.subscribe("abc");
        fanout.unsubscribe("abc", id);
        assert_eq!(fanout.subscriber_count("abc"), 0);
        assert_eq!(fanout.stats().channels, 0);
    }
}
