//! The space-hierarchy maintainer: collects parent/child state deltas
//! during sync, applies them transactionally, revalidates authorization,
//! and recomputes depths on demand with a bounded, cycle-safe walk.

use std::collections::{HashMap, HashSet, VecDeque};

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use harbor_store::spaces::{ChildHalf, ParentHalf};
use harbor_store::{Result, events, spaces, state};
use harbor_types::{RoomId, SpaceEdge, kinds};

/// Depth walks stop after this many hops.
pub const MAX_DEPTH: u32 = 10;

/// Space-graph changes collected while applying one sync batch.
#[derive(Debug, Default)]
pub struct SpaceDeltas {
    child_sets: HashMap<RoomId, Vec<ChildHalf>>,
    child_removed: HashMap<RoomId, Vec<RoomId>>,
    parent_sets: HashMap<RoomId, Vec<ParentHalf>>,
    parent_removed: HashMap<RoomId, Vec<RoomId>>,
    /// Spaces whose child list arrived as a full snapshot.
    full_state: HashSet<RoomId>,
    power_changed: HashSet<RoomId>,
}

impl SpaceDeltas {
    pub fn is_empty(&self) -> bool {
        self.child_sets.is_empty()
            && self.child_removed.is_empty()
            && self.parent_sets.is_empty()
            && self.parent_removed.is_empty()
            && self.power_changed.is_empty()
    }

    pub fn add_child(&mut self, space: &RoomId, half: ChildHalf) {
        self.child_sets.entry(space.clone()).or_default().push(half);
    }

    pub fn remove_child(&mut self, space: &RoomId, child: &RoomId) {
        self.child_removed
            .entry(space.clone())
            .or_default()
            .push(child.clone());
    }

    pub fn add_parent(&mut self, child: &RoomId, half: ParentHalf) {
        self.parent_sets.entry(child.clone()).or_default().push(half);
    }

    pub fn remove_parent(&mut self, child: &RoomId, space: &RoomId) {
        self.parent_removed
            .entry(child.clone())
            .or_default()
            .push(space.clone());
    }

    pub fn mark_full_state(&mut self, space: &RoomId) {
        self.full_state.insert(space.clone());
    }

    pub fn mark_power_changed(&mut self, room: &RoomId) {
        self.power_changed.insert(room.clone());
    }
}

/// Applies collected deltas inside the caller's transaction, then
/// revalidates every edge the batch could have affected.
pub fn apply(conn: &Connection, deltas: &SpaceDeltas) -> Result<()> {
    let empty_halves: Vec<ChildHalf> = Vec::new();
    let empty_removed: Vec<RoomId> = Vec::new();

    let mut child_spaces: HashSet<&RoomId> = deltas.child_sets.keys().collect();
    child_spaces.extend(deltas.child_removed.keys());
    child_spaces.extend(deltas.full_state.iter());
    for space in child_spaces {
        spaces::replace_child_edges(
            conn,
            space,
            deltas.child_sets.get(space).unwrap_or(&empty_halves),
            deltas.full_state.contains(space),
            deltas.child_removed.get(space).unwrap_or(&empty_removed),
        )?;
    }

    let mut touched_children: HashSet<&RoomId> = deltas.parent_sets.keys().collect();
    touched_children.extend(deltas.parent_removed.keys());
    let empty_parents: Vec<ParentHalf> = Vec::new();
    for child in &touched_children {
        spaces::replace_parent_edges(
            conn,
            child,
            deltas.parent_sets.get(*child).unwrap_or(&empty_parents),
            false,
            deltas.parent_removed.get(*child).unwrap_or(&empty_removed),
        )?;
    }

    // a room that gained or changed parent claims: recheck every edge
    // pointing at it
    for child in &touched_children {
        for edge in spaces::edges_into(conn, child)? {
            revalidate(conn, &edge)?;
        }
    }
    // a power-level change in a space invalidates the checks of its
    // claimed children
    for space in &deltas.power_changed {
        for edge in spaces::edges_from(conn, space)? {
            revalidate(conn, &edge)?;
        }
    }
    Ok(())
}

/// Re-runs the authorization check for one edge: the sender of the child's
/// parent claim must hold enough power in the claimed parent space to have
/// asserted the relationship.
fn revalidate(conn: &Connection, edge: &SpaceEdge) -> Result<()> {
    let Some(parent_event) = edge.parent_event else {
        return Ok(());
    };
    let validated = match events::get_by_rowid(conn, parent_event)? {
        Some(claim) => sender_may_claim(conn, &edge.space_id, &claim.sender.0)?,
        None => false,
    };
    if validated != edge.parent_validated {
        debug!(
            "edge {} -> {} validation now {}",
            edge.space_id, edge.child_id, validated
        );
    }
    spaces::set_parent_validated(conn, &edge.space_id, &edge.child_id, validated)
}

fn sender_may_claim(conn: &Connection, space: &RoomId, sender: &str) -> Result<bool> {
    let Some(power) = state::get_state(conn, space, kinds::POWER_LEVELS, "")? else {
        // no power-level state: nothing to authorize against
        return Ok(true);
    };
    let content = &power.content;
    let required = content
        .get("events")
        .and_then(|e| e.get(kinds::SPACE_CHILD))
        .and_then(Value::as_i64)
        .or_else(|| content.get("state_default").and_then(Value::as_i64))
        .unwrap_or(50);
    let level = content
        .get("users")
        .and_then(|u| u.get(sender))
        .and_then(Value::as_i64)
        .or_else(|| content.get("users_default").and_then(Value::as_i64))
        .unwrap_or(0);
    Ok(level >= required)
}

/// One row of a flattened hierarchy readout.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SpaceChild {
    pub edge: SpaceEdge,
    pub depth: u32,
}

/// Flattens the hierarchy under `root`: a breadth-first walk over child
/// edges, cycle-safe and bounded at [`MAX_DEPTH`] hops.
pub fn hierarchy(conn: &Connection, root: &RoomId) -> Result<Vec<SpaceChild>> {
    let mut out = Vec::new();
    let mut visited = HashSet::from([root.clone()]);
    let mut queue = VecDeque::from([(root.clone(), 0u32)]);

    while let Some((space, depth)) = queue.pop_front() {
        if depth >= MAX_DEPTH {
            continue;
        }
        for edge in spaces::edges_from(conn, &space)? {
            let child = edge.child_id.clone();
            out.push(SpaceChild {
                edge,
                depth: depth + 1,
            });
            if visited.insert(child.clone()) {
                queue.push_back((child, depth + 1));
            }
        }
    }
    Ok(out)
}

/// Full depth recomputation over the whole graph: starts from spaces with
/// no validated incoming parent edge, then sweeps any cycle-bound leftovers
/// in id order so the assignment is stable.
pub fn recompute_depths(conn: &Connection) -> Result<HashMap<RoomId, u32>> {
    let edges = spaces::all_edges(conn)?;
    let mut children: HashMap<&RoomId, Vec<&RoomId>> = HashMap::new();
    let mut spaces_seen: HashSet<&RoomId> = HashSet::new();
    let mut has_validated_parent: HashSet<&RoomId> = HashSet::new();
    for edge in &edges {
        children.entry(&edge.space_id).or_default().push(&edge.child_id);
        spaces_seen.insert(&edge.space_id);
        if edge.parent_validated {
            has_validated_parent.insert(&edge.child_id);
        }
    }

    let mut roots: Vec<&RoomId> = spaces_seen
        .iter()
        .filter(|s| !has_validated_parent.contains(**s))
        .copied()
        .collect();
    roots.sort();

    let mut depths: HashMap<RoomId, u32> = HashMap::new();
    let mut sweep = |start: &RoomId, depths: &mut HashMap<RoomId, u32>| {
        let mut queue = VecDeque::from([(start.clone(), 0u32)]);
        while let Some((node, depth)) = queue.pop_front() {
            if depths.contains_key(&node) || depth > MAX_DEPTH {
                continue;
            }
            depths.insert(node.clone(), depth);
            if let Some(kids) = children.get(&node) {
                for kid in kids {
                    if !depths.contains_key(*kid) {
                        queue.push_back(((*kid).clone(), depth + 1));
                    }
                }
            }
        }
    };

    for root in roots {
        sweep(root, &mut depths);
    }
    // cycles have no root; sweep their members deterministically
    let mut leftover: Vec<&RoomId> = spaces_seen
        .iter()
        .filter(|s| !depths.contains_key(**s))
        .copied()
        .collect();
    leftover.sort();
    for space in leftover {
        if !depths.contains_key(space) {
            sweep(space, &mut depths);
        }
    }
    Ok(depths)
}
