//! Broker readiness.
//!
//! Real-mode ordering requires three flags:
//! - Logged in to the broker API
//! - Order connection up
//! - Order-reply connection up (without it fills would never be seen)
//!
//! All three must be true for the probe to report ready.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Broker readiness flags.
///
/// Changes to overall readiness are broadcast via a watch channel.
#[derive(Debug)]
pub struct BrokerReadiness {
    logged_in: AtomicBool,
    order_connected: AtomicBool,
    reply_connected: AtomicBool,
    tx: watch::Sender<bool>,
}

impl BrokerReadiness {
    /// Create a checker with every flag down.
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let readiness = Self {
            logged_in: AtomicBool::new(false),
            order_connected: AtomicBool::new(false),
            reply_connected: AtomicBool::new(false),
            tx,
        };
        (readiness, rx)
    }

    pub fn set_logged_in(&self, ready: bool) {
        let old = self.logged_in.swap(ready, Ordering::SeqCst);
        if old != ready {
            debug!(logged_in = ready, "Login flag changed");
            self.notify_change();
        }
    }

    pub fn set_order_connected(&self, ready: bool) {
        let old = self.order_connected.swap(ready, Ordering::SeqCst);
        if old != ready {
            debug!(order_connected = ready, "Order connection flag changed");
            self.notify_change();
        }
    }

    pub fn set_reply_connected(&self, ready: bool) {
        let old = self.reply_connected.swap(ready, Ordering::SeqCst);
        if old != ready {
            debug!(reply_connected = ready, "Reply connection flag changed");
            self.notify_change();
        }
    }

    /// Set all three flags at once.
    pub fn set_all(&self, ready: bool) {
        self.set_logged_in(ready);
        self.set_order_connected(ready);
        self.set_reply_connected(ready);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
            && self.order_connected.load(Ordering::SeqCst)
            && self.reply_connected.load(Ordering::SeqCst)
    }

    /// Returns (logged_in, order_connected, reply_connected).
    #[must_use]
    pub fn flags(&self) -> (bool, bool, bool) {
        (
            self.logged_in.load(Ordering::SeqCst),
            self.order_connected.load(Ordering::SeqCst),
            self.reply_connected.load(Ordering::SeqCst),
        )
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the broker is ready.
    pub async fn wait_until_ready(&self) {
        if self.is_ready() {
            return;
        }

        let mut rx = self.tx.subscribe();
        loop {
            if rx.changed().await.is_err() {
                warn!("BrokerReadiness sender dropped while waiting");
                return;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    fn notify_change(&self) {
        let ready = self.is_ready();
        let changed = self.tx.send_if_modified(|current| {
            if *current != ready {
                *current = ready;
                true
            } else {
                false
            }
        });
        if changed {
            let (logged_in, order_connected, reply_connected) = self.flags();
            info!(
                ready,
                logged_in, order_connected, reply_connected, "Broker readiness changed"
            );
        }
    }
}
