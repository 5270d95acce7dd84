use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per room type.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a room type's events. Creates the channel if needed.
    pub fn subscribe(&self, room_type_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_type_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room_type_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&room_type_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a room type's channel; subscribers see the stream close.
    pub fn remove(&self, room_type_id: &Ulid) {
        self.channels.remove(room_type_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rt = Ulid::new();
        let mut rx = hub.subscribe(rt);

        let event = Event::RoomTypeCreated {
            id: rt,
            name: Some("Double".into()),
            qty: 2,
            price_per_night: 12_000,
            actor: None,
        };
        hub.send(rt, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rt = Ulid::new();
        hub.send(rt, &Event::RoomTypeRetired { id: rt, actor: None });
    }

    #[tokio::test]
    async fn channels_are_per_room_type() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);

        hub.send(b, &Event::RoomTypeRetired { id: b, actor: None });
        hub.send(a, &Event::RoomTypeRetired { id: a, actor: None });

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.room_type_id(), a);
    }

    #[tokio::test]
    async fn remove_closes_stream() {
        let hub = NotifyHub::new();
        let rt = Ulid::new();
        let mut rx = hub.subscribe(rt);
        hub.remove(&rt);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
