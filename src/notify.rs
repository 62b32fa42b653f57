// ===============================
// src/notify.rs
// ===============================
//
// Notification surface: one visible notification at a time, auto-cleared
// after a fixed TTL. Owned by the controller (no globals) so it can be
// driven and asserted without any rendering environment.

use crate::domain::{NoteKind, Notification};
use crate::metrics::NOTES;

#[derive(Debug, Clone)]
pub struct NotificationSlot {
    current: Option<Notification>,
    ttl_ms: i64,
}

impl NotificationSlot {
    pub fn new(ttl_ms: u64) -> Self {
        Self { current: None, ttl_ms: ttl_ms as i64 }
    }

    /// Replace whatever is visible and restart the auto-clear timer.
    pub fn post(&mut self, kind: NoteKind, message: impl Into<String>, now_ms: i64) {
        let label = match kind {
            NoteKind::Success => "success",
            NoteKind::Error => "error",
        };
        NOTES.with_label_values(&[label]).inc();
        self.current = Some(Notification { kind, message: message.into(), created_at_ms: now_ms });
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&Notification> {
        self.current.as_ref()
    }

    /// How long a posted notification stays visible.
    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_replaces_previous_notification() {
        let mut slot = NotificationSlot::new(5_000);
        assert_eq!(slot.ttl_ms(), 5_000);
        slot.post(NoteKind::Success, "Deposit confirmed", 1_000);

        // a newer post preempts the previous one and restarts its timer
        slot.post(NoteKind::Error, "Borrow failed", 3_000);
        let n = slot.current().unwrap();
        assert_eq!(n.kind, NoteKind::Error);
        assert_eq!(n.message, "Borrow failed");
        assert_eq!(n.created_at_ms, 3_000);
    }

    #[test]
    fn clear_is_immediate() {
        let mut slot = NotificationSlot::new(5_000);
        slot.post(NoteKind::Error, "Withdraw failed", 10);
        slot.clear();
        assert!(slot.current().is_none());
    }
}
