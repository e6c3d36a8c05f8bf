//! Subscription router.
//!
//! While subscribed, the server interleaves asynchronous push messages with
//! the acknowledgements of subscribe-family commands. A push is a top-level
//! array whose first element is one of:
//!
//! ```text
//! ["message",      channel, payload]
//! ["pmessage",     pattern, channel, payload]
//! ["subscribe",    channel, count]     ["unsubscribe",  channel|nil, count]
//! ["psubscribe",   pattern, count]     ["punsubscribe", pattern|nil, count]
//! ```
//!
//! Messages go to the listeners registered for the channel or pattern.
//! Acknowledgements update the table and complete the subscribe-family
//! request that caused them.

use crate::error::{Error, Result};
use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Whether a subscription names a channel or a glob pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

/// Direction of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Subscribe,
    Unsubscribe,
}

impl AckAction {
    /// Maps a subscribe-family command name to its acknowledgement shape.
    pub fn for_command(name: &str) -> Option<(AckAction, SubscriptionKind)> {
        match name {
            "SUBSCRIBE" => Some((AckAction::Subscribe, SubscriptionKind::Channel)),
            "UNSUBSCRIBE" => Some((AckAction::Unsubscribe, SubscriptionKind::Channel)),
            "PSUBSCRIBE" => Some((AckAction::Subscribe, SubscriptionKind::Pattern)),
            "PUNSUBSCRIBE" => Some((AckAction::Unsubscribe, SubscriptionKind::Pattern)),
            _ => None,
        }
    }
}

/// A published message delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Bytes,
    /// The matching pattern for messages received through `PSUBSCRIBE`
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.channel),
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// A decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Message(Message),
    Ack {
        action: AckAction,
        kind: SubscriptionKind,
        /// `None` when an unsubscribe-all found nothing to unsubscribe
        name: Option<Bytes>,
        count: i64,
        reply: RespValue,
    },
}

/// Result of classifying a decoded value.
#[derive(Debug, PartialEq)]
pub enum Classified {
    Push(Push),
    Reply(RespValue),
}

/// Splits push messages from ordinary replies.
///
/// A value carrying a push marker but the wrong shape is a protocol error.
pub fn classify(value: RespValue) -> Result<Classified> {
    let marker = match value.as_array().and_then(|items| items.first()) {
        Some(first) => first.as_bytes().map(<[u8]>::to_vec),
        None => None,
    };
    let Some(marker) = marker else {
        return Ok(Classified::Reply(value));
    };

    let ack = match marker.as_slice() {
        b"message" | b"pmessage" => None,
        b"subscribe" => Some((AckAction::Subscribe, SubscriptionKind::Channel)),
        b"unsubscribe" => Some((AckAction::Unsubscribe, SubscriptionKind::Channel)),
        b"psubscribe" => Some((AckAction::Subscribe, SubscriptionKind::Pattern)),
        b"punsubscribe" => Some((AckAction::Unsubscribe, SubscriptionKind::Pattern)),
        _ => return Ok(Classified::Reply(value)),
    };

    let items = value.as_array().unwrap_or(&[]);
    let malformed = || {
        Error::Protocol(format!(
            "malformed {} push message",
            String::from_utf8_lossy(&marker)
        ))
    };

    let push = match (ack, items) {
        (None, [_, channel, payload]) if marker == b"message" => Push::Message(Message {
            channel: bulk(channel).ok_or_else(malformed)?,
            pattern: None,
            payload: bulk(payload).ok_or_else(malformed)?,
        }),
        (None, [_, pattern, channel, payload]) if marker == b"pmessage" => {
            Push::Message(Message {
                channel: bulk(channel).ok_or_else(malformed)?,
                pattern: Some(bulk(pattern).ok_or_else(malformed)?),
                payload: bulk(payload).ok_or_else(malformed)?,
            })
        }
        (Some((action, kind)), [_, name, count]) => {
            let name = match name {
                RespValue::Null => None,
                other => Some(bulk(other).ok_or_else(malformed)?),
            };
            let count = count.as_integer().ok_or_else(malformed)?;
            Push::Ack {
                action,
                kind,
                name,
                count,
                reply: value.clone(),
            }
        }
        _ => return Err(malformed()),
    };

    Ok(Classified::Push(push))
}

fn bulk(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(b) => Some(b.clone()),
        RespValue::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    }
}

/// Acknowledgements still owed to a subscribe-family request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAcks {
    pub action: AckAction,
    pub kind: SubscriptionKind,
    /// `None` for a bare (P)UNSUBSCRIBE, which gets one ack per active entry
    remaining: Option<usize>,
}

impl PendingAcks {
    pub fn new(action: AckAction, kind: SubscriptionKind, names: usize) -> Self {
        let remaining = match (action, names) {
            (AckAction::Unsubscribe, 0) => None,
            (_, n) => Some(n.max(1)),
        };
        Self {
            action,
            kind,
            remaining,
        }
    }

    pub fn matches(&self, action: AckAction, kind: SubscriptionKind) -> bool {
        self.action == action && self.kind == kind
    }

    /// Counts one acknowledgement. Returns true when the request is complete.
    pub fn record(&mut self, nil_name: bool, none_confirmed: bool) -> bool {
        match &mut self.remaining {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => nil_name || none_confirmed,
        }
    }
}

/// Identifies one registered listener.
pub type ListenerId = u64;

#[derive(Debug)]
struct Listener {
    id: ListenerId,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct Entry {
    /// The server has acknowledged this subscription
    confirmed: bool,
    listeners: Vec<Listener>,
}

/// The subscription table: channel or pattern to active listeners.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    channels: HashMap<Bytes, Entry>,
    patterns: HashMap<Bytes, Entry>,
    /// Subscription count reported by the latest acknowledgement
    server_count: i64,
    next_id: ListenerId,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&mut self, kind: SubscriptionKind) -> &mut HashMap<Bytes, Entry> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    /// Adds a listener for `name`.
    pub fn register(
        &mut self,
        kind: SubscriptionKind,
        name: Bytes,
        tx: mpsc::UnboundedSender<Message>,
    ) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.table(kind)
            .entry(name)
            .or_default()
            .listeners
            .push(Listener { id, tx });
        id
    }

    /// Removes one listener. Returns true if `name` has no listeners left.
    ///
    /// An entry the server never confirmed is dropped with its last
    /// listener; a confirmed one stays until its unsubscribe ack.
    pub fn unregister(&mut self, kind: SubscriptionKind, name: &[u8], id: ListenerId) -> bool {
        let table = self.table(kind);
        let Some(entry) = table.get_mut(name) else {
            return true;
        };
        entry.listeners.retain(|l| l.id != id);
        if !entry.listeners.is_empty() {
            return false;
        }
        if !entry.confirmed {
            table.remove(name);
        }
        true
    }

    /// Number of channel and pattern entries in the table.
    pub fn len(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a server acknowledgement to the table.
    pub fn apply_ack(
        &mut self,
        action: AckAction,
        kind: SubscriptionKind,
        name: Option<&Bytes>,
        count: i64,
    ) {
        self.server_count = count;
        let Some(name) = name else {
            return;
        };
        match action {
            AckAction::Subscribe => {
                self.table(kind).entry(name.clone()).or_default().confirmed = true;
            }
            AckAction::Unsubscribe => {
                // Dropping the listeners ends their message streams.
                if let Some(entry) = self.table(kind).remove(name) {
                    debug!(
                        name = %String::from_utf8_lossy(name),
                        listeners = entry.listeners.len(),
                        "Subscription removed"
                    );
                }
            }
        }
    }

    /// Delivers a message to every listener of its channel, or of its
    /// pattern for `pmessage`. Returns the number of listeners reached.
    pub fn dispatch(&mut self, message: Message) -> usize {
        let (kind, key) = match &message.pattern {
            Some(pattern) => (SubscriptionKind::Pattern, pattern.clone()),
            None => (SubscriptionKind::Channel, message.channel.clone()),
        };
        let Some(entry) = self.table(kind).get_mut(&key) else {
            trace!(
                channel = %String::from_utf8_lossy(&message.channel),
                "Message for unknown subscription"
            );
            return 0;
        };

        entry.listeners.retain(|l| !l.tx.is_closed());
        let mut delivered = 0;
        for listener in &entry.listeners {
            if listener.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// True if the server has confirmed no subscription of this kind.
    pub fn none_confirmed(&self, kind: SubscriptionKind) -> bool {
        let table = match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        };
        !table.values().any(|e| e.confirmed)
    }

    pub fn is_subscribed(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        let table = match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        };
        table.get(name).is_some_and(|e| e.confirmed)
    }

    pub fn server_count(&self) -> i64 {
        self.server_count
    }

    /// Drops every entry and listener.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
        self.server_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(items: &[&str]) -> RespValue {
        RespValue::array(
            items
                .iter()
                .map(|s| RespValue::bulk_string(Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        )
    }

    #[test]
    fn test_classify_message() {
        let classified = classify(push(&["message", "news", "hello"])).unwrap();
        assert_eq!(
            classified,
            Classified::Push(Push::Message(Message {
                channel: Bytes::from("news"),
                pattern: None,
                payload: Bytes::from("hello"),
            }))
        );
    }

    #[test]
    fn test_classify_pmessage() {
        let classified = classify(push(&["pmessage", "n*", "news", "hi"])).unwrap();
        let Classified::Push(Push::Message(msg)) = classified else {
            panic!("expected message");
        };
        assert_eq!(msg.pattern, Some(Bytes::from("n*")));
        assert_eq!(msg.channel, Bytes::from("news"));
    }

    #[test]
    fn test_classify_ack() {
        let value = RespValue::array(vec![
            RespValue::bulk_string("unsubscribe"),
            RespValue::Null,
            RespValue::integer(0),
        ]);
        let Classified::Push(Push::Ack {
            action,
            kind,
            name,
            count,
            ..
        }) = classify(value).unwrap()
        else {
            panic!("expected ack");
        };
        assert_eq!(action, AckAction::Unsubscribe);
        assert_eq!(kind, SubscriptionKind::Channel);
        assert_eq!(name, None);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_classify_ordinary_replies() {
        for value in [
            RespValue::ok(),
            RespValue::array(vec![]),
            push(&["pong", ""]),
            RespValue::array(vec![RespValue::integer(1)]),
        ] {
            assert_eq!(classify(value.clone()).unwrap(), Classified::Reply(value));
        }
    }

    #[test]
    fn test_classify_malformed_push() {
        assert!(matches!(
            classify(push(&["message", "only-channel"])),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            classify(push(&["subscribe", "news", "not-a-count"])),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_dispatch_reaches_all_listeners() {
        let mut router = SubscriptionRouter::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        router.register(SubscriptionKind::Channel, Bytes::from("news"), tx1);
        router.register(SubscriptionKind::Channel, Bytes::from("news"), tx2);

        let message = Message {
            channel: Bytes::from("news"),
            pattern: None,
            payload: Bytes::from("hello"),
        };
        assert_eq!(router.dispatch(message.clone()), 2);
        assert_eq!(rx1.try_recv().unwrap(), message);
        assert_eq!(rx2.try_recv().unwrap(), message);
    }

    #[test]
    fn test_dispatch_prunes_dropped_listeners() {
        let mut router = SubscriptionRouter::new();
        let (tx, rx) = mpsc::unbounded_channel();
        router.register(SubscriptionKind::Pattern, Bytes::from("n*"), tx);
        drop(rx);

        let message = Message {
            channel: Bytes::from("news"),
            pattern: Some(Bytes::from("n*")),
            payload: Bytes::from("x"),
        };
        assert_eq!(router.dispatch(message), 0);
    }

    #[test]
    fn test_unregister_reports_last_listener() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = router.register(SubscriptionKind::Channel, Bytes::from("c"), tx.clone());
        let b = router.register(SubscriptionKind::Channel, Bytes::from("c"), tx);
        assert!(!router.unregister(SubscriptionKind::Channel, b"c", a));
        assert!(router.unregister(SubscriptionKind::Channel, b"c", b));
    }

    #[test]
    fn test_unconfirmed_entry_dropped_with_last_listener() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = router.register(SubscriptionKind::Pattern, Bytes::from("n*"), tx);
        assert_eq!(router.len(), 1);

        // SUBSCRIBE never acknowledged, e.g. it timed out
        assert!(router.unregister(SubscriptionKind::Pattern, b"n*", id));
        assert!(router.is_empty());
    }

    #[test]
    fn test_confirmed_entry_kept_until_unsubscribe_ack() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let news = Bytes::from("news");
        let id = router.register(SubscriptionKind::Channel, news.clone(), tx);
        router.apply_ack(AckAction::Subscribe, SubscriptionKind::Channel, Some(&news), 1);

        assert!(router.unregister(SubscriptionKind::Channel, b"news", id));
        assert!(router.is_subscribed(SubscriptionKind::Channel, b"news"));

        router.apply_ack(AckAction::Unsubscribe, SubscriptionKind::Channel, Some(&news), 0);
        assert!(router.is_empty());
    }

    #[test]
    fn test_acks_update_table() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let news = Bytes::from("news");
        router.register(SubscriptionKind::Channel, news.clone(), tx);
        assert!(router.none_confirmed(SubscriptionKind::Channel));

        router.apply_ack(AckAction::Subscribe, SubscriptionKind::Channel, Some(&news), 1);
        assert!(router.is_subscribed(SubscriptionKind::Channel, b"news"));
        assert_eq!(router.server_count(), 1);

        router.apply_ack(AckAction::Unsubscribe, SubscriptionKind::Channel, Some(&news), 0);
        assert!(router.none_confirmed(SubscriptionKind::Channel));
        assert_eq!(router.server_count(), 0);
        // Listener sender was dropped with the entry.
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }

    #[test]
    fn test_pending_acks_counting() {
        let mut acks = PendingAcks::new(AckAction::Subscribe, SubscriptionKind::Channel, 2);
        assert!(!acks.record(false, false));
        assert!(acks.record(false, false));

        let mut all = PendingAcks::new(AckAction::Unsubscribe, SubscriptionKind::Channel, 0);
        assert!(!all.record(false, false));
        assert!(all.record(false, true));

        let mut nothing = PendingAcks::new(AckAction::Unsubscribe, SubscriptionKind::Pattern, 0);
        assert!(nothing.record(true, true));
    }
}
