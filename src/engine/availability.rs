use std::collections::HashSet;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// The booking that stands in the way of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub booking_id: Ulid,
    pub stay: Stay,
    pub status: BookingStatus,
    /// Requested rooms this booking holds (all of them when either side is whole-property).
    pub rooms: Vec<Ulid>,
}

/// Rooms a request covers. Whole-property means every active room; anything else
/// must name at least one active room of this property, each at most once.
pub fn resolve_rooms(ps: &PropertyState, occupancy: &Occupancy) -> Result<Vec<Ulid>, EngineError> {
    match occupancy {
        Occupancy::WholeProperty => {
            let rooms: Vec<Ulid> = ps.active_rooms().map(|r| r.id).collect();
            if rooms.is_empty() {
                return Err(EngineError::validation(format!(
                    "property {} has no active rooms",
                    ps.property.id
                )));
            }
            Ok(rooms)
        }
        Occupancy::Rooms(ids) => {
            if ids.is_empty() {
                return Err(EngineError::validation(
                    "room_ids must name at least one room unless booking the whole property",
                ));
            }
            let mut seen = HashSet::with_capacity(ids.len());
            for id in ids {
                if !seen.insert(*id) {
                    return Err(EngineError::validation(format!("room {id} listed twice")));
                }
                match ps.room(id) {
                    Some(room) if room.active => {}
                    Some(_) => {
                        return Err(EngineError::validation(format!("room {id} is not active")));
                    }
                    None => return Err(EngineError::NotFound(*id)),
                }
            }
            Ok(ids.clone())
        }
    }
}

/// Rooms of `existing` that collide with a request for `rooms`, or `None`.
/// Whole-property on either side collides with everything.
fn colliding_rooms(existing: &Booking, request: &Occupancy, rooms: &[Ulid]) -> Option<Vec<Ulid>> {
    if request.is_whole_property() || existing.occupancy.is_whole_property() {
        return Some(rooms.to_vec());
    }
    let hit: Vec<Ulid> = rooms
        .iter()
        .filter(|r| existing.holds_room(r))
        .copied()
        .collect();
    (!hit.is_empty()).then_some(hit)
}

/// First non-cancelled booking that conflicts with the request. Blocked rows count.
pub fn find_conflict(
    ps: &PropertyState,
    stay: &Stay,
    request: &Occupancy,
    rooms: &[Ulid],
) -> Option<Conflict> {
    ps.overlapping(stay)
        .filter(|b| b.status.occupies())
        .find_map(|b| {
            colliding_rooms(b, request, rooms).map(|hit| Conflict {
                booking_id: b.id,
                stay: b.stay,
                status: b.status,
                rooms: hit,
            })
        })
}

/// Availability of one room for a stay, as shown when choosing rooms.
#[derive(Debug, Clone, Serialize)]
pub struct RoomAvailability {
    pub room_id: Ulid,
    pub name: String,
    pub available: bool,
    /// Held by an imported external block rather than a guest booking.
    pub externally_blocked: bool,
}

/// Per-room view of a stay over every active room. The whole property is bookable
/// only if every entry is available.
pub fn room_availability(ps: &PropertyState, stay: &Stay) -> Vec<RoomAvailability> {
    let holders: Vec<&Booking> = ps
        .overlapping(stay)
        .filter(|b| b.status.occupies())
        .collect();
    ps.active_rooms()
        .map(|room| {
            let held: Vec<&&Booking> = holders.iter().filter(|b| b.holds_room(&room.id)).collect();
            RoomAvailability {
                room_id: room.id,
                name: room.name.clone(),
                available: held.is_empty(),
                externally_blocked: held.iter().any(|b| b.status == BookingStatus::Blocked),
            }
        })
        .collect()
}
