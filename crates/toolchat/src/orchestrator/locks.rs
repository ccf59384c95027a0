//! Per-conversation turn ordering.
//!
//! [`ConversationLocks::ticket`] is called synchronously when a turn is
//! submitted and places it at the back of its conversation's queue. A
//! ticket's [`wait`](TurnTicket::wait) resolves once every earlier ticket
//! for the same conversation has been dropped, so turns run and persist in
//! submission order. A ticket dropped while still queued keeps its place in
//! the chain: later tickets still wait for the turns ahead of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

/// Resolves when a ticket and everything ahead of it has been released.
type Released = Shared<BoxFuture<'static, ()>>;

struct Tail {
    seq: u64,
    released: Released,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    tails: HashMap<String, Tail>,
}

#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<Inner>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the back of `conversation_id`'s queue.
    pub fn ticket(&self, conversation_id: &str) -> TurnTicket {
        let (release, released_rx) = oneshot::channel::<()>();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_seq += 1;
        let seq = inner.next_seq;

        let ahead = inner
            .tails
            .get(conversation_id)
            .map(|t| (t.seq, t.released.clone()));
        let released: Released = match &ahead {
            Some((_, prev)) => {
                let prev = prev.clone();
                async move {
                    prev.await;
                    let _ = released_rx.await;
                }
                .boxed()
                .shared()
            }
            None => async move {
                let _ = released_rx.await;
            }
            .boxed()
            .shared(),
        };
        inner
            .tails
            .insert(conversation_id.to_string(), Tail { seq, released });

        TurnTicket {
            key: conversation_id.to_string(),
            seq,
            ahead,
            _release: release,
            locks: self.clone(),
        }
    }

    /// Conversations with at least one live ticket.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tails
            .len()
    }
}

/// A place in a conversation's queue. Holding it after [`wait`](Self::wait)
/// returns means holding the conversation; dropping it lets the next turn
/// run.
pub struct TurnTicket {
    key: String,
    seq: u64,
    /// The ticket directly ahead, until it has been released.
    ahead: Option<(u64, Released)>,
    _release: oneshot::Sender<()>,
    locks: ConversationLocks,
}

impl TurnTicket {
    /// Wait until every earlier turn on this conversation has finished.
    pub async fn wait(&mut self) {
        if let Some((_, ahead)) = &self.ahead {
            ahead.clone().await;
        }
        self.ahead = None;
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        let mut inner = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        let is_tail = inner.tails.get(&self.key).is_some_and(|t| t.seq == self.seq);
        if !is_tail {
            return;
        }
        match self.ahead.take() {
            // Abandoned while queued: the queue's tail reverts to the ticket
            // ahead of this one, unless that one has already been released.
            Some((seq, released)) if released.clone().now_or_never().is_none() => {
                inner.tails.insert(self.key.clone(), Tail { seq, released });
            }
            _ => {
                inner.tails.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn resolves(ticket: &mut TurnTicket) -> bool {
        tokio::time::timeout(Duration::from_millis(50), ticket.wait())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn first_ticket_runs_immediately() {
        let locks = ConversationLocks::new();
        let mut t = locks.ticket("a");
        assert!(resolves(&mut t).await);
        assert_eq!(locks.active(), 1);
        drop(t);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn second_ticket_waits_for_first() {
        let locks = ConversationLocks::new();
        let mut first = locks.ticket("a");
        let mut second = locks.ticket("a");
        first.wait().await;

        assert!(!resolves(&mut second).await);
        drop(first);
        assert!(resolves(&mut second).await);
    }

    #[tokio::test]
    async fn conversations_are_independent() {
        let locks = ConversationLocks::new();
        let mut a = locks.ticket("a");
        let mut b = locks.ticket("b");
        a.wait().await;
        assert!(resolves(&mut b).await);
    }

    #[tokio::test]
    async fn abandoned_ticket_keeps_queue_order() {
        let locks = ConversationLocks::new();
        let mut first = locks.ticket("a");
        first.wait().await;
        let second = locks.ticket("a");
        let mut third = locks.ticket("a");

        drop(second);
        assert!(!resolves(&mut third).await, "third ran while first still held");
        drop(first);
        assert!(resolves(&mut third).await);
    }

    #[tokio::test]
    async fn abandoned_tail_does_not_free_the_conversation() {
        let locks = ConversationLocks::new();
        let mut first = locks.ticket("a");
        first.wait().await;
        drop(locks.ticket("a"));

        let mut late = locks.ticket("a");
        assert!(!resolves(&mut late).await);
        drop(first);
        assert!(resolves(&mut late).await);
        drop(late);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn tail_dropped_after_release_frees_the_conversation() {
        let locks = ConversationLocks::new();
        let first = locks.ticket("a");
        let second = locks.ticket("a");
        drop(first);
        drop(second);
        assert_eq!(locks.active(), 0);

        let mut next = locks.ticket("a");
        assert!(resolves(&mut next).await);
    }

    #[tokio::test]
    async fn tickets_run_in_submission_order() {
        let locks = ConversationLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let mut ticket = locks.ticket("a");
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                ticket.wait().await;
                // Earlier turns take longer, so only the queue keeps them first.
                tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
