//! Test-only doubles: a queued request responder resolving `§9`'s
//! `forceResponse`/`forceError` open question.
//!
//! Resolution (see DESIGN.md): **always-peek**. Reading the head of either
//! queue never mutates it; only an explicit [`ForceQueue::pop`] advances
//! past it. A responder that reads without popping gets the same item
//! back on every call, however many items are queued behind it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::kernel::Bus;
use crate::message::{ChannelName, Payload};
use crate::observable::SubscriptionId;

/// A FIFO queue whose head can be inspected without being consumed.
pub struct ForceQueue<T> {
    items: RefCell<VecDeque<T>>,
}

impl<T> Default for ForceQueue<T> {
    fn default() -> Self {
        Self {
            items: RefCell::new(VecDeque::new()),
        }
    }
}

impl<T: Clone> ForceQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.borrow_mut().push_back(item);
    }

    /// Look at the head without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.items.borrow().front().cloned()
    }

    /// Consume and return the head.
    pub fn pop(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

/// A request responder whose replies are pre-queued by the test rather
/// than computed, used to exercise `request_once_with_id`, store
/// mutations and proxy relays without a real backing service.
///
/// If both queues are non-empty when a request arrives, the error queue
/// takes priority — a forced failure should never be silently shadowed by
/// a forced success queued earlier by mistake.
#[derive(Default)]
pub struct MockResponder {
    pub force_response: ForceQueue<Payload>,
    pub force_error: ForceQueue<Payload>,
}

impl MockResponder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install this responder on `channel`: every Request-kind message
    /// arriving there is answered from the queues, popping exactly one
    /// item per request. Logs and drops the request if both queues are
    /// empty — mirroring `§4.F`'s missing-handler failure semantics.
    pub fn attach(self: &Rc<Self>, bus: &Rc<Bus>, channel: &ChannelName) -> SubscriptionId {
        let responder = Rc::clone(self);
        let bus = Rc::clone(bus);
        let channel = channel.clone();
        bus.get_channel(&channel).subscribe_requests(move |msg| {
            if let Some(error) = responder.force_error.pop() {
                bus.send_error_with_id(&channel, error, msg.id.clone(), "mock-responder");
            } else if let Some(response) = responder.force_response.pop() {
                bus.send_response_with_id(&channel, response, msg.id.clone(), "mock-responder");
            } else {
                tracing::warn!(%channel, "mock responder has no queued reply for request");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peeking_never_mutates_the_queue() {
        let queue: ForceQueue<&'static str> = ForceQueue::new();
        queue.push("a");
        queue.push("b");

        assert_eq!(queue.peek(), Some("a"));
        assert_eq!(queue.peek(), Some("a"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.peek(), Some("b"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn attached_responder_answers_from_force_response_queue() {
        let bus = Rc::new(Bus::new());
        let channel = ChannelName::new("svc");
        let responder = Rc::new(MockResponder::new());
        responder.force_response.push(serde_json::json!("ok"));
        responder.attach(&bus, &channel);

        let id = crate::message::Identifier::generate();
        let result = bus
            .request_once_with_id(id, channel, serde_json::json!("ping"), None, "client")
            .await;

        assert_eq!(result, Ok(serde_json::json!("ok")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn force_error_takes_priority_over_force_response() {
        let bus = Rc::new(Bus::new());
        let channel = ChannelName::new("svc");
        let responder = Rc::new(MockResponder::new());
        responder.force_response.push(serde_json::json!("ok"));
        responder.force_error.push(serde_json::json!("boom"));
        responder.attach(&bus, &channel);

        let id = crate::message::Identifier::generate();
        let result = bus
            .request_once_with_id(id, channel, serde_json::json!("ping"), None, "client")
            .await;

        assert_eq!(result, Err(serde_json::json!("boom")));
    }
}
