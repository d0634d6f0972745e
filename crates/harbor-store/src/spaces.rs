//! Space hierarchy edges. Each row carries two independent halves: the
//! child half asserted by the parent space's `space.child` state, and the
//! parent half asserted by the child room's `space.parent` state.

use rusqlite::{Connection, Row, params};

use harbor_types::{EventRowId, RoomId, SpaceEdge};

use crate::{Result, Store};

/// Child-half input: the parent space claims `child_id` as a child.
#[derive(Debug, Clone)]
pub struct ChildHalf {
    pub child_id: RoomId,
    pub child_event: EventRowId,
    pub ordering: Option<String>,
    pub suggested: bool,
}

/// Parent-half input: the child claims `space_id` as a parent.
#[derive(Debug, Clone)]
pub struct ParentHalf {
    pub space_id: RoomId,
    pub parent_event: EventRowId,
    pub canonical: bool,
}

fn map_edge(row: &Row<'_>) -> rusqlite::Result<SpaceEdge> {
    Ok(SpaceEdge {
        space_id: RoomId(row.get(0)?),
        child_id: RoomId(row.get(1)?),
        child_event: row.get::<_, Option<i64>>(2)?.map(EventRowId),
        ordering: row.get(3)?,
        suggested: row.get::<_, i64>(4)? != 0,
        parent_event: row.get::<_, Option<i64>>(5)?.map(EventRowId),
        canonical: row.get::<_, i64>(6)? != 0,
        parent_validated: row.get::<_, i64>(7)? != 0,
    })
}

const EDGE_COLS: &str = "space_id, child_id, child_event, ordering, suggested, \
     parent_event, canonical, parent_validated";

/// Replaces the child halves asserted by one space. With `clear_first` the
/// previous halves are wiped wholesale (full-state sync); `removed` names
/// children explicitly deleted by this batch. Rows left with neither half
/// are pruned.
pub fn replace_child_edges(
    conn: &Connection,
    space_id: &RoomId,
    halves: &[ChildHalf],
    clear_first: bool,
    removed: &[RoomId],
) -> Result<()> {
    if clear_first {
        conn.execute(
            "UPDATE space_edges SET child_event = NULL, ordering = NULL, suggested = 0
             WHERE space_id = ?1",
            [&space_id.0],
        )?;
    }
    for child_id in removed {
        conn.execute(
            "UPDATE space_edges SET child_event = NULL, ordering = NULL, suggested = 0
             WHERE space_id = ?1 AND child_id = ?2",
            params![space_id.0, child_id.0],
        )?;
    }
    for half in halves {
        conn.execute(
            "INSERT INTO space_edges (space_id, child_id, child_event, ordering, suggested)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(space_id, child_id) DO UPDATE SET
                 child_event = excluded.child_event,
                 ordering = excluded.ordering,
                 suggested = excluded.suggested",
            params![
                space_id.0,
                half.child_id.0,
                half.child_event.0,
                half.ordering,
                half.suggested as i64,
            ],
        )?;
    }
    prune_empty(conn)
}

/// Replaces the parent halves asserted by one child room. New parent claims
/// start unvalidated until the power-level check runs.
pub fn replace_parent_edges(
    conn: &Connection,
    child_id: &RoomId,
    halves: &[ParentHalf],
    clear_first: bool,
    removed: &[RoomId],
) -> Result<()> {
    if clear_first {
        conn.execute(
            "UPDATE space_edges SET parent_event = NULL, canonical = 0, parent_validated = 0
             WHERE child_id = ?1",
            [&child_id.0],
        )?;
    }
    for space_id in removed {
        conn.execute(
            "UPDATE space_edges SET parent_event = NULL, canonical = 0, parent_validated = 0
             WHERE space_id = ?1 AND child_id = ?2",
            params![space_id.0, child_id.0],
        )?;
    }
    for half in halves {
        conn.execute(
            "INSERT INTO space_edges (space_id, child_id, parent_event, canonical, parent_validated)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(space_id, child_id) DO UPDATE SET
                 parent_event = excluded.parent_event,
                 canonical = excluded.canonical,
                 parent_validated = 0",
            params![
                half.space_id.0,
                child_id.0,
                half.parent_event.0,
                half.canonical as i64,
            ],
        )?;
    }
    prune_empty(conn)
}

fn prune_empty(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM space_edges WHERE child_event IS NULL AND parent_event IS NULL",
        [],
    )?;
    Ok(())
}

pub fn set_parent_validated(
    conn: &Connection,
    space_id: &RoomId,
    child_id: &RoomId,
    validated: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE space_edges SET parent_validated = ?3 WHERE space_id = ?1 AND child_id = ?2",
        params![space_id.0, child_id.0, validated as i64],
    )?;
    Ok(())
}

/// Edges claiming parents of `child_id` (pointing at that room).
pub fn edges_into(conn: &Connection, child_id: &RoomId) -> Result<Vec<SpaceEdge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLS} FROM space_edges WHERE child_id = ?1 ORDER BY space_id"
    ))?;
    let edges = stmt
        .query_map([&child_id.0], map_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Edges claiming children of `space_id` (pointing away from it).
pub fn edges_from(conn: &Connection, space_id: &RoomId) -> Result<Vec<SpaceEdge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLS} FROM space_edges WHERE space_id = ?1 ORDER BY ordering, child_id"
    ))?;
    let edges = stmt
        .query_map([&space_id.0], map_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

pub fn all_edges(conn: &Connection) -> Result<Vec<SpaceEdge>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLS} FROM space_edges ORDER BY space_id, child_id"
    ))?;
    let edges = stmt
        .query_map([], map_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

impl Store {
    pub fn space_children(&self, space_id: &RoomId) -> Result<Vec<SpaceEdge>> {
        self.with_conn(|conn| edges_from(conn, space_id))
    }
}
