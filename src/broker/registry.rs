//! Connection registry — the single source of truth for who is online
//!
//! Maps each role to at most one live connection handle. Every read and
//! write happens under one mutex, and presence notices are enqueued while
//! that mutex is held, so notice delivery can never be reordered relative to
//! a concurrent registration or deregistration. The handle is a connection's
//! outbound queue; the socket write itself happens later on that
//! connection's writer task.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{Role, RoutingTable, ACK};

// ─────────────────────────────────────────────────────────────────
// Peer Handle
// ─────────────────────────────────────────────────────────────────

/// The registry's view of one live connection: its id for logs and the
/// sender side of its outbound queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Connection id, for correlating log lines
    pub conn_id: Uuid,

    /// Outbound queue drained by the connection's writer task
    outbound: mpsc::UnboundedSender<Vec<u8>>,

    /// Close signal observed by the connection's handler task
    close: watch::Sender<bool>,
}

impl PeerHandle {
    /// Create a handle around a connection's outbound queue and close signal
    pub fn new(
        conn_id: Uuid,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        close: watch::Sender<bool>,
    ) -> Self {
        Self {
            conn_id,
            outbound,
            close,
        }
    }

    /// Enqueue a payload for this connection; false if the writer is gone
    pub fn enqueue(&self, payload: Vec<u8>) -> bool {
        self.outbound.send(payload).is_ok()
    }

    /// Ask the connection's handler to shut the connection down
    pub fn close(&self) {
        let _ = self.close.send(true);
    }
}

// ─────────────────────────────────────────────────────────────────
// Registration Outcome
// ─────────────────────────────────────────────────────────────────

/// What happened during a registration, for the handler's log line
#[derive(Debug)]
pub struct Registration {
    /// Handle this registration displaced, if the role was occupied.
    /// Dropping it closes the displaced connection's outbound queue.
    pub displaced: Option<PeerHandle>,

    /// Presence notices enqueued as part of this registration
    pub notices: Vec<Role>,
}

// ─────────────────────────────────────────────────────────────────
// Connection Registry
// ─────────────────────────────────────────────────────────────────

/// Role → live connection map behind a single lock
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<Role, PeerHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection under a role.
    ///
    /// At most one handle per role: an occupied slot is evicted and the old
    /// handle returned so the caller can close it. Presence notices and the
    /// handshake ack are enqueued under the registry lock, in a fixed order:
    /// a provider joining learns of an already-present console first, then
    /// an already-present device; a console or device joining is announced
    /// to a present provider. The ack to the new connection is enqueued
    /// after its notices.
    pub fn register(&self, role: Role, handle: PeerHandle) -> Registration {
        let mut slots = self.slots.lock();

        let displaced = slots.insert(role, handle.clone());
        let mut notices = Vec::new();

        match role {
            Role::Provider => {
                for peer in [Role::Console, Role::Device] {
                    if slots.contains_key(&peer) {
                        handle.enqueue(peer.presence_notice().into_bytes());
                        notices.push(peer);
                    }
                }
            }
            Role::Console | Role::Device => {
                if let Some(provider) = slots.get(&Role::Provider) {
                    provider.enqueue(role.presence_notice().into_bytes());
                    notices.push(role);
                }
            }
        }

        handle.enqueue(ACK.as_bytes().to_vec());

        Registration { displaced, notices }
    }

    /// Remove a role's entry if it is still owned by `conn_id`.
    ///
    /// Idempotent: an empty slot, or a slot already taken over by a
    /// replacement connection, is left untouched. Returns whether an entry
    /// was removed.
    pub fn deregister(&self, role: Role, conn_id: Uuid) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&role) {
            Some(handle) if handle.conn_id == conn_id => {
                slots.remove(&role);
                true
            }
            _ => false,
        }
    }

    /// Look up the handle currently registered for a role
    pub fn lookup(&self, role: Role) -> Option<PeerHandle> {
        self.slots.lock().get(&role).cloned()
    }

    /// Whether a role currently has a live connection
    pub fn is_registered(&self, role: Role) -> bool {
        self.slots.lock().contains_key(&role)
    }

    /// Roles with a live connection right now
    pub fn registered_roles(&self) -> Vec<Role> {
        let slots = self.slots.lock();
        Role::ALL
            .iter()
            .copied()
            .filter(|role| slots.contains_key(role))
            .collect()
    }

    /// Forward a payload from `from` to every registered routing target.
    ///
    /// Fire-and-forget, at most once per registered peer: absent
    /// destinations are skipped silently, and the payload is enqueued
    /// verbatim. Returns how many peers it was enqueued to.
    pub fn forward(&self, from: Role, payload: &[u8]) -> usize {
        let slots = self.slots.lock();
        let mut delivered = 0;

        for target in RoutingTable::targets(from) {
            if let Some(handle) = slots.get(target) {
                if handle.enqueue(payload.to_vec()) {
                    delivered += 1;
                } else {
                    debug!(target = %target, "Forward target queue closed, skipping");
                }
            }
        }

        delivered
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle() -> (PeerHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, _close_rx) = watch::channel(false);
        (PeerHandle::new(Uuid::new_v4(), tx, close_tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(String::from_utf8(payload).unwrap());
        }
        out
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle();
        let conn_id = handle.conn_id;

        let reg = registry.register(Role::Device, handle);
        assert!(reg.displaced.is_none());
        assert_eq!(registry.lookup(Role::Device).unwrap().conn_id, conn_id);
        assert!(!registry.is_registered(Role::Provider));
    }

    #[test]
    fn test_one_handle_per_role() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = make_handle();
        let first_id = first.conn_id;
        let (second, _rx2) = make_handle();
        let second_id = second.conn_id;

        registry.register(Role::Console, first);
        let reg = registry.register(Role::Console, second);

        // The first handle was displaced, the slot holds exactly the second
        assert_eq!(reg.displaced.unwrap().conn_id, first_id);
        assert_eq!(registry.lookup(Role::Console).unwrap().conn_id, second_id);
        assert_eq!(registry.registered_roles(), vec![Role::Console]);
    }

    #[test]
    fn test_ack_sent_on_register() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = make_handle();

        registry.register(Role::Device, handle);
        assert_eq!(drain(&mut rx), vec!["CONNECTED"]);
    }

    #[test]
    fn test_provider_notified_of_present_peers_in_order() {
        let registry = ConnectionRegistry::new();
        let (console, _crx) = make_handle();
        let (device, _drx) = make_handle();
        registry.register(Role::Console, console);
        registry.register(Role::Device, device);

        let (provider, mut prx) = make_handle();
        let reg = registry.register(Role::Provider, provider);

        assert_eq!(reg.notices, vec![Role::Console, Role::Device]);
        // Console notice, then device notice, then the ack
        assert_eq!(
            drain(&mut prx),
            vec!["CONSOLE_CONNECTED", "DEVICE_CONNECTED", "CONNECTED"]
        );
    }

    #[test]
    fn test_provider_notified_of_late_peer() {
        let registry = ConnectionRegistry::new();
        let (provider, mut prx) = make_handle();
        registry.register(Role::Provider, provider);
        drain(&mut prx);

        let (device, mut drx) = make_handle();
        let reg = registry.register(Role::Device, device);

        assert_eq!(reg.notices, vec![Role::Device]);
        assert_eq!(drain(&mut prx), vec!["DEVICE_CONNECTED"]);
        // The late peer itself only gets the ack
        assert_eq!(drain(&mut drx), vec!["CONNECTED"]);
    }

    #[test]
    fn test_no_notice_between_console_and_device() {
        let registry = ConnectionRegistry::new();
        let (console, mut crx) = make_handle();
        registry.register(Role::Console, console);
        drain(&mut crx);

        let (device, _drx) = make_handle();
        let reg = registry.register(Role::Device, device);

        assert!(reg.notices.is_empty());
        assert!(drain(&mut crx).is_empty());
    }

    #[test]
    fn test_deregister_idempotent() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = make_handle();
        let conn_id = handle.conn_id;
        registry.register(Role::Device, handle);

        assert!(registry.deregister(Role::Device, conn_id));
        assert!(!registry.deregister(Role::Device, conn_id));
        assert!(!registry.is_registered(Role::Device));
    }

    #[test]
    fn test_deregister_ignores_replaced_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = make_handle();
        let first_id = first.conn_id;
        registry.register(Role::Console, first);

        let (second, _rx2) = make_handle();
        let second_id = second.conn_id;
        registry.register(Role::Console, second);

        // The displaced connection's late deregister must not evict its
        // replacement
        assert!(!registry.deregister(Role::Console, first_id));
        assert_eq!(registry.lookup(Role::Console).unwrap().conn_id, second_id);
    }

    #[test]
    fn test_forward_fans_out_to_registered_targets() {
        let registry = ConnectionRegistry::new();
        let (console, mut crx) = make_handle();
        let (device, mut drx) = make_handle();
        registry.register(Role::Console, console);
        registry.register(Role::Device, device);
        drain(&mut crx);
        drain(&mut drx);

        let delivered = registry.forward(Role::Provider, b"city: Oslo");
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut crx), vec!["city: Oslo"]);
        assert_eq!(drain(&mut drx), vec!["city: Oslo"]);
    }

    #[test]
    fn test_forward_skips_absent_target() {
        let registry = ConnectionRegistry::new();
        let (console, mut crx) = make_handle();
        registry.register(Role::Console, console);
        drain(&mut crx);

        // Device absent: console still gets it, no error for the device
        let delivered = registry.forward(Role::Provider, b"report");
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut crx), vec!["report"]);

        // No targets at all
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.forward(Role::Provider, b"report"), 0);
    }

    #[test]
    fn test_forward_respects_routing_direction() {
        let registry = ConnectionRegistry::new();
        let (provider, mut prx) = make_handle();
        let (device, mut drx) = make_handle();
        registry.register(Role::Provider, provider);
        registry.register(Role::Device, device);
        drain(&mut prx);
        drain(&mut drx);

        // Console payloads route to the provider only
        let delivered = registry.forward(Role::Console, b"beijing");
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut prx), vec!["beijing"]);
        assert!(drain(&mut drx).is_empty());
    }
}
