//! Realtime change notification.
//!
//! The notifier is an explicit collaborator: it is constructed once at
//! startup, handed to the service by reference, and torn down when the
//! process exits. Nothing in the crate reaches for a process-wide handle.
//!
//! Delivery is fire-and-forget over a tokio broadcast channel. Slow
//! subscribers can lag and drop events, so clients must tolerate duplicate
//! or missing notifications and refetch the sheet when in doubt.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::sheet::CellUpdate;

/// Event names and payload shapes match what grid clients listen for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SheetEvent {
    CellUpdated {
        cell: String,
        value: String,
        formula: String,
    },
    SheetResized {
        rows: u32,
        cols: u32,
    },
}

impl From<CellUpdate> for SheetEvent {
    fn from(update: CellUpdate) -> Self {
        SheetEvent::CellUpdated {
            cell: update.cell,
            value: update.value,
            formula: update.formula,
        }
    }
}

/// Receives the changed cells of a sheet and delivers them to interested
/// parties. At-least-once from the receivers' point of view; order between
/// cells is not guaranteed.
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, sheet_id: Uuid, event: SheetEvent);
}

/// Broadcast-channel backed notifier shared by all websocket subscribers.
pub struct BroadcastHub {
    tx: broadcast::Sender<(Uuid, SheetEvent)>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, SheetEvent)> {
        self.tx.subscribe()
    }
}

impl ChangeNotifier for BroadcastHub {
    fn publish(&self, sheet_id: Uuid, event: SheetEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.tx.send((sheet_id, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_in_client_shape() {
        let event = SheetEvent::CellUpdated {
            cell: "A1".to_string(),
            value: "7".to_string(),
            formula: "=B1+3".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cell-updated");
        assert_eq!(json["cell"], "A1");
        assert_eq!(json["value"], "7");
        assert_eq!(json["formula"], "=B1+3");

        let resized = SheetEvent::SheetResized { rows: 11, cols: 10 };
        let json = serde_json::to_value(&resized).unwrap();
        assert_eq!(json["type"], "sheet-resized");
        assert_eq!(json["rows"], 11);
    }

    #[test]
    fn subscribers_receive_published_events() {
        let hub = BroadcastHub::new(16);
        let mut rx = hub.subscribe();

        let id = Uuid::new_v4();
        let event = SheetEvent::SheetResized { rows: 2, cols: 2 };
        hub.publish(id, event.clone());

        let (got_id, got_event) = rx.try_recv().unwrap();
        assert_eq!(got_id, id);
        assert_eq!(got_event, event);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let hub = BroadcastHub::new(16);
        hub.publish(
            Uuid::new_v4(),
            SheetEvent::SheetResized { rows: 1, cols: 1 },
        );
    }
}
