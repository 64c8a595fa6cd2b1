use super::{Bus, BusMessage};
use crate::error::BusError;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// In-process [`Bus`] adapter with redis-style glob patterns.
///
/// Fanout is synchronous and in-order per publisher, which matches the
/// delivery assumptions the connection machinery makes about the real bus.
/// Used by the integration tests; also handy for running a gateway and a
/// worker inside one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    subs: Arc<Mutex<Vec<MemorySub>>>,
}

#[derive(Debug)]
struct MemorySub {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Match a redis-style glob `pattern` against `topic`. Only the `*`
/// wildcard is supported, which is all the topic contracts here use.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), topic.as_bytes());
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            // Backtrack: let the last `*` swallow one more byte.
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions whose pattern matches `topic`. Lets
    /// tests observe that per-connection subscriptions are released.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subs
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.tx.is_closed() && topic_matches(&s.pattern, topic))
            .count()
    }

    fn add(&self, pattern: &str) -> UnboundedReceiverStream<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().unwrap().push(MemorySub {
            pattern: pattern.to_owned(),
            tx,
        });
        UnboundedReceiverStream::new(rx)
    }
}

impl Bus for MemoryBus {
    type Subscription = UnboundedReceiverStream<BusMessage>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter().filter(|s| topic_matches(&s.pattern, topic)) {
            let _ = sub.tx.send(BusMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Self::Subscription, BusError> {
        Ok(self.add(topic))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Self::Subscription, BusError> {
        Ok(self.add(pattern))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn glob_matching() {
        assert!(topic_matches("conn.7", "conn.7"));
        assert!(!topic_matches("conn.7", "conn.17"));
        assert!(topic_matches("conn.*", "conn.17"));
        assert!(!topic_matches("conn.*", "worker.17"));
        assert!(topic_matches(
            "*keyspace*:user:*",
            "__keyspace@0__:user:ana"
        ));
        assert!(!topic_matches("*keyspace*:user:*", "__keyevent@0__:set"));
        assert!(topic_matches("*", "anything.at.all"));
    }

    #[tokio::test]
    async fn pattern_subscription_sees_concrete_topic() {
        let bus = MemoryBus::new();
        let mut sub = bus.psubscribe("conn.*").await.unwrap();
        bus.publish("conn.3", Bytes::from_static(b"hi")).await.unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.topic, "conn.3");
        assert_eq!(msg.payload.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn dropped_subscription_stops_counting() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("worker.1").await.unwrap();
        assert_eq!(bus.subscriber_count("worker.1"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("worker.1"), 0);
    }
}
