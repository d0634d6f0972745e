//! Participant-derived room naming from the lazy-load summary, for rooms
//! with no explicit name or canonical alias.

use std::collections::HashMap;

use harbor_types::{UserId, kinds};

/// A derived name plus the DM peer, when the room looks like a DM.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedName {
    pub name: String,
    pub dm_peer: Option<UserId>,
}

/// How many heroes at most contribute to the name.
const MAX_NAMED_HEROES: usize = 5;

fn display(user: &UserId) -> &str {
    let raw = user.0.strip_prefix('@').unwrap_or(&user.0);
    raw.split(':').next().unwrap_or(raw)
}

fn is_service(user: &UserId) -> bool {
    user.0.starts_with("@_")
}

fn join_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => (*only).to_string(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

/// Derives a display name from the heroes list. `memberships` maps each
/// hero to its current membership value; unknown heroes count as joined
/// (the summary would not list a stranger).
pub fn derive_name(
    heroes: &[UserId],
    memberships: &HashMap<UserId, String>,
    own_user: &UserId,
    joined: u64,
    invited: u64,
) -> Option<DerivedName> {
    let usable: Vec<&UserId> = heroes
        .iter()
        .filter(|h| *h != own_user && !is_service(h))
        .take(MAX_NAMED_HEROES)
        .collect();
    if usable.is_empty() {
        return None;
    }

    let (active, departed): (Vec<&UserId>, Vec<&UserId>) = usable.iter().partition(|h| {
        matches!(
            memberships.get(**h).map(String::as_str),
            Some(kinds::MEMBERSHIP_JOIN) | Some(kinds::MEMBERSHIP_INVITE) | None
        )
    });

    if active.is_empty() {
        let names: Vec<&str> = departed.iter().map(|u| display(u)).collect();
        return Some(DerivedName {
            name: format!("Empty room (was {})", join_names(&names)),
            dm_peer: None,
        });
    }

    let names: Vec<&str> = active.iter().map(|u| display(u)).collect();
    // members beyond the named heroes (excluding ourselves)
    let total_others = (joined + invited).saturating_sub(1);
    let name = if total_others > names.len() as u64 {
        let extra = total_others - names.len() as u64;
        format!("{} and {} others", names.join(", "), extra)
    } else {
        join_names(&names)
    };

    let dm_peer = (active.len() == 1 && joined + invited <= 2).then(|| active[0].clone());
    Some(DerivedName { name, dm_peer })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    fn joined_map(users: &[&UserId]) -> HashMap<UserId, String> {
        users
            .iter()
            .map(|u| ((*u).clone(), kinds::MEMBERSHIP_JOIN.to_string()))
            .collect()
    }

    #[test]
    fn single_hero_becomes_dm() {
        let own = user("@me:x");
        let bob = user("@bob:x");
        let derived = derive_name(
            std::slice::from_ref(&bob),
            &joined_map(&[&bob]),
            &own,
            2,
            0,
        )
        .unwrap();
        assert_eq!(derived.name, "bob");
        assert_eq!(derived.dm_peer, Some(bob));
    }

    #[test]
    fn two_heroes_join_with_and() {
        let own = user("@me:x");
        let heroes = vec![user("@alice:x"), user("@bob:x")];
        let derived = derive_name(
            &heroes,
            &joined_map(&[&heroes[0], &heroes[1]]),
            &own,
            3,
            0,
        )
        .unwrap();
        assert_eq!(derived.name, "alice and bob");
        assert!(derived.dm_peer.is_none());
    }

    #[test]
    fn large_rooms_count_the_rest() {
        let own = user("@me:x");
        let heroes = vec![user("@a:x"), user("@b:x")];
        let derived = derive_name(
            &heroes,
            &joined_map(&[&heroes[0], &heroes[1]]),
            &own,
            10,
            1,
        )
        .unwrap();
        assert_eq!(derived.name, "a, b and 8 others");
    }

    #[test]
    fn all_departed_heroes_name_the_ghost_room() {
        let own = user("@me:x");
        let bob = user("@bob:x");
        let mut memberships = HashMap::new();
        memberships.insert(bob.clone(), kinds::MEMBERSHIP_LEAVE.to_string());

        let derived = derive_name(std::slice::from_ref(&bob), &memberships, &own, 1, 0).unwrap();
        assert_eq!(derived.name, "Empty room (was bob)");
        assert!(derived.dm_peer.is_none());
    }

    #[test]
    fn service_members_and_self_are_skipped() {
        let own = user("@me:x");
        let heroes = vec![own.clone(), user("@_bridge:x"), user("@carol:x")];
        let derived = derive_name(
            &heroes,
            &joined_map(&[&heroes[2]]),
            &own,
            2,
            0,
        )
        .unwrap();
        assert_eq!(derived.name, "carol");
        assert_eq!(derived.dm_peer, Some(user("@carol:x")));
    }

    #[test]
    fn no_usable_heroes_yields_nothing() {
        let own = user("@me:x");
        assert!(derive_name(&[own.clone()], &HashMap::new(), &own, 1, 0).is_none());
    }
}
