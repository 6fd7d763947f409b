//! Abstraction over the browser's `window`/`window.parent`/`window.frames`
//! coupling (Design Note 9), so the proxy controller itself never touches a
//! concrete transport.
//!
//! A non-browser host (sockets between processes, an in-process test
//! double) supplies its own [`FrameHost`] implementation.

use crate::proxy::wire::WireMessage;

/// One inbound post-message-shaped event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub origin: String,
    pub data: WireMessage,
}

/// A handle to unsubscribe a previously-registered inbound callback.
pub struct InboundSubscription {
    unsubscribe: Box<dyn FnOnce()>,
}

impl InboundSubscription {
    #[must_use]
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Box::new(unsubscribe),
        }
    }

    pub fn cancel(self) {
        (self.unsubscribe)();
    }
}

/// The transport a [`crate::proxy::controller::ProxyController`] relays
/// over. `postToParent`/`postToChildren` mirror `window.postMessage`;
/// `on_inbound_message` mirrors the `window.onmessage` listener.
pub trait FrameHost {
    /// Post a message to the parent frame at `origin`.
    fn post_to_parent(&self, message: &WireMessage, origin: &str);

    /// Post a message to child frames at `origin`. `target_ids`, when given,
    /// restricts delivery to those specific child bus ids instead of
    /// broadcasting to every child frame.
    fn post_to_children(&self, message: &WireMessage, origin: &str, target_ids: Option<&[String]>);

    /// Register a callback for inbound window-message-shaped events.
    /// Returns a handle that unregisters it when cancelled.
    fn on_inbound_message(&self, callback: Box<dyn FnMut(&InboundEvent)>) -> InboundSubscription;

    /// This host's own origin, used to stamp outbound messages and reason
    /// about same-origin relaying.
    fn current_origin(&self) -> String;
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    //! An in-memory [`FrameHost`] pair, used to exercise the proxy
    //! controller without a real window.

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Link {
        origin: String,
        inbound: crate::observable::Observable<InboundEvent>,
    }

    /// One side of an in-memory parent/child frame link.
    #[derive(Clone)]
    pub struct MemoryFrameHost {
        origin: String,
        /// The other side's inbound observable — posting here delivers to
        /// the peer.
        peer_inbound: Rc<RefCell<Option<crate::observable::Observable<InboundEvent>>>>,
        own: Rc<Link>,
    }

    impl MemoryFrameHost {
        /// Build a connected parent/child pair: `parent_origin` and
        /// `child_origin` are each host's own origin, used when the other
        /// side posts to it.
        #[must_use]
        pub fn pair(parent_origin: &str, child_origin: &str) -> (Self, Self) {
            let parent = Self {
                origin: parent_origin.to_owned(),
                peer_inbound: Rc::new(RefCell::new(None)),
                own: Rc::new(Link {
                    origin: parent_origin.to_owned(),
                    inbound: crate::observable::Observable::new(),
                }),
            };
            let child = Self {
                origin: child_origin.to_owned(),
                peer_inbound: Rc::new(RefCell::new(None)),
                own: Rc::new(Link {
                    origin: child_origin.to_owned(),
                    inbound: crate::observable::Observable::new(),
                }),
            };
            *parent.peer_inbound.borrow_mut() = Some(child.own.inbound.clone());
            *child.peer_inbound.borrow_mut() = Some(parent.own.inbound.clone());
            (parent, child)
        }
    }

    impl FrameHost for MemoryFrameHost {
        fn post_to_parent(&self, message: &WireMessage, _origin: &str) {
            if let Some(peer) = self.peer_inbound.borrow().as_ref() {
                peer.emit(&InboundEvent {
                    origin: self.origin.clone(),
                    data: message.clone(),
                });
            }
        }

        fn post_to_children(&self, message: &WireMessage, _origin: &str, _target_ids: Option<&[String]>) {
            if let Some(peer) = self.peer_inbound.borrow().as_ref() {
                peer.emit(&InboundEvent {
                    origin: self.origin.clone(),
                    data: message.clone(),
                });
            }
        }

        fn on_inbound_message(&self, mut callback: Box<dyn FnMut(&InboundEvent)>) -> InboundSubscription {
            let id = self.own.inbound.subscribe(move |event: &InboundEvent| callback(event));
            let inbound = self.own.inbound.clone();
            InboundSubscription::new(move || {
                inbound.unsubscribe(id);
            })
        }

        fn current_origin(&self) -> String {
            self.origin.clone()
        }
    }
}
