//! Bidirectional room membership map.
//!
//! `room -> sockets` and `socket -> rooms` live behind one mutex so that every
//! operation updates both directions together.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::{Room, SocketId};

#[derive(Debug, Default)]
struct Maps {
    rooms: HashMap<Room, HashSet<SocketId>>,
    sids: HashMap<SocketId, HashSet<Room>>,
}

/// Room registry owned by one adapter.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    maps: Mutex<Maps>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a socket to rooms. Already-held memberships are left untouched.
    pub fn add_all(&self, id: &SocketId, rooms: impl IntoIterator<Item = Room>) {
        let mut maps = self.lock();
        let mut added = Vec::new();
        {
            let held = maps.sids.entry(id.clone()).or_default();
            for room in rooms {
                if held.insert(room.clone()) {
                    added.push(room);
                }
            }
        }
        for room in added {
            maps.rooms.entry(room).or_default().insert(id.clone());
        }
    }

    /// Remove a socket from one room. No-op when it is not a member.
    pub fn del(&self, id: &SocketId, room: &Room) {
        let mut maps = self.lock();
        if let Some(held) = maps.sids.get_mut(id) {
            held.remove(room);
        }
        let now_empty = match maps.rooms.get_mut(room) {
            Some(members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            maps.rooms.remove(room);
        }
    }

    /// Remove a socket from every room, returning the rooms it held.
    pub fn del_all(&self, id: &SocketId) -> HashSet<Room> {
        let mut maps = self.lock();
        let Some(held) = maps.sids.remove(id) else {
            return HashSet::new();
        };
        for room in &held {
            let now_empty = match maps.rooms.get_mut(room) {
                Some(members) => {
                    members.remove(id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                maps.rooms.remove(room);
            }
        }
        held
    }

    /// Union of the members of `rooms`; everyone known when `rooms` is empty.
    pub fn sockets(&self, rooms: &HashSet<Room>) -> HashSet<SocketId> {
        self.resolve(rooms, &HashSet::new())
    }

    /// Members of `rooms` (or everyone) minus members of any `except` room.
    pub fn resolve(&self, rooms: &HashSet<Room>, except: &HashSet<Room>) -> HashSet<SocketId> {
        let maps = self.lock();

        let excluded: HashSet<&SocketId> = except
            .iter()
            .filter_map(|room| maps.rooms.get(room))
            .flatten()
            .collect();

        if rooms.is_empty() {
            maps.sids
                .keys()
                .filter(|id| !excluded.contains(id))
                .cloned()
                .collect()
        } else {
            rooms
                .iter()
                .filter_map(|room| maps.rooms.get(room))
                .flatten()
                .filter(|id| !excluded.contains(id))
                .cloned()
                .collect()
        }
    }

    pub fn rooms_of(&self, id: &SocketId) -> Option<HashSet<Room>> {
        self.lock().sids.get(id).cloned()
    }

    /// Every room that currently has at least one member.
    pub fn rooms(&self) -> HashSet<Room> {
        self.lock().rooms.keys().cloned().collect()
    }

    /// Copy of all memberships, used when migrating to a new adapter.
    pub fn snapshot(&self) -> Vec<(SocketId, HashSet<Room>)> {
        self.lock()
            .sids
            .iter()
            .map(|(id, rooms)| (id.clone(), rooms.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SocketId {
        SocketId::from(s)
    }

    fn rooms(names: &[&str]) -> HashSet<Room> {
        names.iter().map(|n| Room::from(*n)).collect()
    }

    fn ids(names: &[&str]) -> HashSet<SocketId> {
        names.iter().map(|n| SocketId::from(*n)).collect()
    }

    fn assert_symmetric(registry: &RoomRegistry) {
        let maps = registry.lock();
        for (id, held) in &maps.sids {
            for room in held {
                assert!(maps.rooms.get(room).is_some_and(|m| m.contains(id)));
            }
        }
        for (room, members) in &maps.rooms {
            assert!(!members.is_empty(), "empty room {room} left behind");
            for id in members {
                assert!(maps.sids.get(id).is_some_and(|r| r.contains(room)));
            }
        }
    }

    #[test]
    fn test_add_and_query_both_directions() {
        let registry = RoomRegistry::new();
        registry.add_all(&sid("s1"), rooms(&["a", "b"]));
        registry.add_all(&sid("s2"), rooms(&["b"]));

        assert_eq!(registry.rooms_of(&sid("s1")), Some(rooms(&["a", "b"])));
        assert_eq!(registry.sockets(&rooms(&["b"])), ids(&["s1", "s2"]));
        assert_eq!(registry.sockets(&HashSet::new()), ids(&["s1", "s2"]));
        assert_symmetric(&registry);
    }

    #[test]
    fn test_operations_are_idempotent() {
        let registry = RoomRegistry::new();
        registry.add_all(&sid("s1"), rooms(&["a"]));
        registry.add_all(&sid("s1"), rooms(&["a"]));
        assert_eq!(registry.sockets(&rooms(&["a"])).len(), 1);

        registry.del(&sid("s1"), &Room::from("never-joined"));
        registry.del(&sid("ghost"), &Room::from("a"));
        assert_eq!(registry.rooms_of(&sid("s1")), Some(rooms(&["a"])));

        registry.del(&sid("s1"), &Room::from("a"));
        registry.del(&sid("s1"), &Room::from("a"));
        assert!(registry.rooms().is_empty());
        assert_symmetric(&registry);
    }

    #[test]
    fn test_del_all_returns_held_rooms() {
        let registry = RoomRegistry::new();
        registry.add_all(&sid("s1"), rooms(&["a", "b"]));
        registry.add_all(&sid("s2"), rooms(&["a"]));

        assert_eq!(registry.del_all(&sid("s1")), rooms(&["a", "b"]));
        assert!(registry.del_all(&sid("s1")).is_empty());
        assert_eq!(registry.rooms(), rooms(&["a"]));
        assert!(registry.rooms_of(&sid("s1")).is_none());
        assert_symmetric(&registry);
    }

    #[test]
    fn test_resolve_excludes_members_of_except_rooms() {
        let registry = RoomRegistry::new();
        registry.add_all(&sid("only-a"), rooms(&["A"]));
        registry.add_all(&sid("both"), rooms(&["A", "B"]));
        registry.add_all(&sid("only-b"), rooms(&["B"]));
        registry.add_all(&sid("neither"), rooms(&["C"]));

        let resolved = registry.resolve(&rooms(&["A", "B"]), &rooms(&["B"]));
        assert_eq!(resolved, ids(&["only-a"]));

        let everyone_but_b = registry.resolve(&HashSet::new(), &rooms(&["B"]));
        assert_eq!(everyone_but_b, ids(&["only-a", "neither"]));
    }

    #[test]
    fn test_concurrent_mutation_keeps_maps_symmetric() {
        let registry = std::sync::Arc::new(RoomRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = sid(&format!("s{}", (t * 7 + i) % 13));
                        let room = Room::from(format!("r{}", i % 5));
                        match i % 3 {
                            0 => registry.add_all(&id, [room]),
                            1 => registry.del(&id, &room),
                            _ => {
                                registry.del_all(&id);
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_symmetric(&registry);
    }
}
