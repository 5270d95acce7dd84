use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{PhysicalRoom, Stay};

/// The hotel's physical-room directory. Owned outside the engine.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn rooms_of_type(&self, room_type_id: Ulid) -> Vec<PhysicalRoom>;

    async fn all_rooms(&self) -> Vec<PhysicalRoom>;

    async fn room(&self, physical_room_id: &str) -> Option<PhysicalRoom>;

    /// True if the room is unavailable during `stay` for reasons the engine doesn't
    /// track itself (out of order, blocked by housekeeping, held by another system).
    async fn occupancy_during(&self, physical_room_id: &str, stay: &Stay) -> bool;
}

/// Directory kept in process memory.
pub struct InMemoryDirectory {
    rooms: DashMap<String, PhysicalRoom>,
    blocks: DashMap<String, Vec<Stay>>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    pub fn add_room(&self, room: PhysicalRoom) {
        self.rooms.insert(room.id.clone(), room);
    }

    pub fn remove_room(&self, physical_room_id: &str) -> Option<PhysicalRoom> {
        self.blocks.remove(physical_room_id);
        self.rooms.remove(physical_room_id).map(|(_, room)| room)
    }

    /// Take a room out of service for `stay`.
    pub fn block(&self, physical_room_id: &str, stay: Stay) {
        self.blocks
            .entry(physical_room_id.to_string())
            .or_default()
            .push(stay);
    }

    pub fn clear_blocks(&self, physical_room_id: &str) {
        self.blocks.remove(physical_room_id);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl RoomDirectory for InMemoryDirectory {
    async fn rooms_of_type(&self, room_type_id: Ulid) -> Vec<PhysicalRoom> {
        self.rooms
            .iter()
            .filter(|e| e.value().room_type_id == room_type_id)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn all_rooms(&self) -> Vec<PhysicalRoom> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    async fn room(&self, physical_room_id: &str) -> Option<PhysicalRoom> {
        self.rooms.get(physical_room_id).map(|e| e.value().clone())
    }

    async fn occupancy_during(&self, physical_room_id: &str, stay: &Stay) -> bool {
        self.blocks
            .get(physical_room_id)
            .is_some_and(|blocks| blocks.iter().any(|b| b.overlaps(stay)))
    }
}
