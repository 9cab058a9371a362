//! Message router
//!
//! The dispatch engine between decoded frames and peer send paths. Frames
//! arrive here from the WebSocket reader loops and from the HTTP sideband
//! `send` endpoint; both paths are treated identically. Broadcasts fan out
//! to every peer in the sender's group except the sender, with the body
//! unprefixed (the subscription channel itself marks the frame as a peer
//! message). Direct sends go to a single peer prefixed `msg:` so the
//! recipient can tell peer payloads from service frames. Bodies larger
//! than the payload budget are spilled and forwarded as `get:<slotId>`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::frame::{self, Inbound};
use crate::registry::GroupRegistry;
use crate::session::PeerSession;
use crate::spill::SpillStore;

/// Routes frames between peer sessions
#[derive(Clone)]
pub struct Router {
    registry: Arc<GroupRegistry>,
    store: Arc<SpillStore>,
    max_payload: usize,
}

impl Router {
    pub fn new(registry: Arc<GroupRegistry>, store: Arc<SpillStore>, max_payload: usize) -> Self {
        Self {
            registry,
            store,
            max_payload,
        }
    }

    /// Admit a freshly upgraded session: queue its `welcome:`, register it
    /// (evicting a same-id incumbent) and announce it to the group.
    ///
    /// The `welcome:` frame is queued before registration, so it is the
    /// first thing the newcomer can receive.
    pub fn admit(&self, session: &Arc<PeerSession>) {
        session.send(frame::welcome(self.max_payload));

        if let Some(evicted) = self.registry.add(session.group(), session.clone()) {
            warn!(
                "Peer id {} reconnected to group {}, previous connection evicted",
                session.id(),
                session.group()
            );
            self.broadcast_service(session, &frame::disconnect(evicted.id()));
        }

        self.broadcast_service(session, &frame::connect(session.id()));
        debug!("Peer {} joined group {}", session.id(), session.group());
    }

    /// Transport close event. Removes the session and announces the
    /// disconnect exactly once; a second close event for the same session
    /// (or one for an evicted incumbent) is a no-op.
    pub fn handle_close(&self, session: &Arc<PeerSession>) {
        if self.registry.remove(session.group(), session) {
            self.broadcast_service(session, &frame::disconnect(session.id()));
            debug!("Peer {} left group {}", session.id(), session.group());
        }
    }

    /// Route one inbound frame from `sender`
    pub fn handle_incoming(&self, sender: &Arc<PeerSession>, raw: &str) {
        let (recipient, body) = match frame::parse(raw) {
            Ok(Inbound::Ping) => {
                sender.send(frame::pong());
                return;
            }
            Ok(Inbound::Message { recipient, body }) => (recipient, body),
            Err(e) => {
                warn!(
                    "Dropping malformed frame from peer {} in group {}: {}",
                    sender.id(),
                    sender.group(),
                    e
                );
                return;
            }
        };

        // Forwarded bodies must fit the payload budget; larger ones are
        // parked in the store and replaced by a fetch reference
        let body = if body.len() > self.max_payload {
            frame::fetch(&self.store.put(body.to_string()))
        } else {
            body.to_string()
        };

        match recipient {
            None | Some("") => self.broadcast(sender, body),
            Some(frame::BROADCAST_ALL) => {
                // Same recipient set as a broadcast, delivered per peer
                // over the direct path
                for peer in self.recipients(sender) {
                    self.deliver(&peer, frame::message(&body));
                }
            }
            Some(target) => {
                match self.registry.find_by_id(sender.group(), target) {
                    Some(peer) => self.deliver(&peer, frame::message(&body)),
                    None => debug!(
                        "Peer {} sent to unknown peer {} in group {}",
                        sender.id(),
                        target,
                        sender.group()
                    ),
                }
            }
        }
    }

    /// Fan a body out to every peer in the sender's group except the
    /// sender, unprefixed
    fn broadcast(&self, sender: &Arc<PeerSession>, body: String) {
        if !self.registry.contains(sender.group(), sender) {
            warn!(
                "Dropping broadcast from unregistered peer {} in group {}",
                sender.id(),
                sender.group()
            );
            return;
        }
        for peer in self.recipients(sender) {
            self.deliver(&peer, body.clone());
        }
    }

    /// Service announcement (`connect:`/`disconnect:`) to everyone in the
    /// group but `about`
    fn broadcast_service(&self, about: &Arc<PeerSession>, frame: &str) {
        for peer in self.recipients(about) {
            self.deliver(&peer, frame.to_string());
        }
    }

    fn recipients(&self, sender: &Arc<PeerSession>) -> Vec<Arc<PeerSession>> {
        self.registry
            .list(sender.group())
            .into_iter()
            .filter(|p| !Arc::ptr_eq(p, sender))
            .collect()
    }

    fn deliver(&self, peer: &Arc<PeerSession>, frame: String) {
        if !peer.send(frame) {
            warn!(
                "Back-pressure delivering to peer {} in group {}",
                peer.id(),
                peer.group()
            );
        }
    }
}
