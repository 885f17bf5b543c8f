//! Room storage operations

use rusqlite::{params, Connection};
use tracing::{debug, instrument};

use super::parse::{
    format_datetime, parse_datetime, parse_plan_opt, parse_room_id, parse_user_id, OptionalExt,
};
use crate::error::{Error, Result};
use crate::models::{Plan, Room, RoomId};

pub struct RoomStore<'a> {
    conn: &'a Connection,
}

impl<'a> RoomStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new room
    #[instrument(skip(self, room), fields(room_id = %room.id, game = %room.game))]
    pub fn create(&self, room: &Room) -> Result<()> {
        if let Some(plan) = &room.active_plan {
            plan.validate()?;
        }
        let plan_json = room
            .active_plan
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO rooms (id, host_id, game, active_plan, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                room.id.to_string(),
                room.host_id.to_string(),
                room.game,
                plan_json,
                format_datetime(room.created_at),
            ],
        )?;
        Ok(())
    }

    /// Find room by ID
    #[instrument(skip(self))]
    pub fn find_by_id(&self, id: RoomId) -> Result<Option<Room>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, host_id, game, active_plan, created_at
             FROM rooms WHERE id = ?1",
        )?;

        let room = stmt
            .query_row(params![id.to_string()], |row| {
                Ok(Room {
                    id: parse_room_id(&row.get::<_, String>(0)?)?,
                    host_id: parse_user_id(&row.get::<_, String>(1)?)?,
                    game: row.get(2)?,
                    active_plan: parse_plan_opt(row.get::<_, Option<String>>(3)?),
                    created_at: parse_datetime(&row.get::<_, String>(4)?)?,
                })
            })
            .optional()?;

        Ok(room)
    }

    /// Overwrite the whole `active_plan` document.
    ///
    /// There is no version check: the last write to commit wins.
    #[instrument(skip(self, plan), fields(phases = plan.phases.len()))]
    pub fn replace_plan(&self, id: RoomId, plan: &Plan) -> Result<()> {
        plan.validate()?;
        let json = serde_json::to_string(plan)?;
        let updated = self.conn.execute(
            "UPDATE rooms SET active_plan = ?1 WHERE id = ?2",
            params![json, id.to_string()],
        )?;

        if updated == 0 {
            return Err(Error::NotFound(format!("room {}", id)));
        }
        debug!("Plan replaced");
        Ok(())
    }
}
