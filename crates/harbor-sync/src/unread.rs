//! Push-rule evaluation: classifies an incoming event's unread relevance.
//! Self-authored events are never classified.

use serde_json::Value;

use harbor_types::push::{PushAction, PushCondition, PushRule, PushRuleKind, PushRuleSet};
use harbor_types::{RoomId, UnreadFlags, UserId, kinds};

/// Per-room facts the rules evaluate against.
pub struct EvalContext<'a> {
    pub own_user: &'a UserId,
    pub room_id: &'a RoomId,
    pub member_count: u64,
}

/// Evaluates the rule set against one event. The first matching enabled
/// rule decides notify/highlight/sound; the message bit depends only on the
/// event's shape.
pub fn classify(
    rules: &PushRuleSet,
    ctx: &EvalContext<'_>,
    sender: &UserId,
    kind: &str,
    content: &Value,
) -> UnreadFlags {
    if sender == ctx.own_user {
        return UnreadFlags::default();
    }

    let mut flags = UnreadFlags {
        // undecryptable events still count as unread messages
        message: matches!(kind, kinds::MESSAGE | kinds::STICKER | kinds::ENCRYPTED),
        ..Default::default()
    };

    for rule in rules.ordered() {
        if !rule.enabled || !rule_matches(rule, ctx, sender, kind, content) {
            continue;
        }
        for action in &rule.actions {
            match action {
                PushAction::Notify => flags.notify = true,
                PushAction::DontNotify => return flags,
                PushAction::Highlight => {
                    flags.highlight = true;
                    flags.notify = true;
                }
                PushAction::Sound => flags.sound = true,
            }
        }
        return flags;
    }
    flags
}

fn rule_matches(
    rule: &PushRule,
    ctx: &EvalContext<'_>,
    sender: &UserId,
    kind: &str,
    content: &Value,
) -> bool {
    match rule.kind {
        PushRuleKind::Room => return rule.rule_id == ctx.room_id.0,
        PushRuleKind::Sender => return rule.rule_id == sender.0,
        PushRuleKind::Content => {
            let Some(pattern) = &rule.pattern else {
                return false;
            };
            let body = content.get("body").and_then(Value::as_str).unwrap_or("");
            return glob_match(pattern, body);
        }
        PushRuleKind::Override | PushRuleKind::Underride => {}
    }

    rule.conditions
        .iter()
        .all(|cond| condition_holds(cond, ctx, sender, kind, content))
}

fn condition_holds(
    cond: &PushCondition,
    ctx: &EvalContext<'_>,
    sender: &UserId,
    kind: &str,
    content: &Value,
) -> bool {
    match cond {
        PushCondition::EventMatch { key, pattern } => {
            let value = match key.as_str() {
                "type" => Some(kind.to_string()),
                "sender" => Some(sender.0.clone()),
                "room_id" => Some(ctx.room_id.0.clone()),
                _ => key.strip_prefix("content.").and_then(|field| {
                    content.get(field).and_then(Value::as_str).map(String::from)
                }),
            };
            value.is_some_and(|v| glob_match(pattern, &v))
        }
        PushCondition::ContainsDisplayName => {
            let localpart = localpart(ctx.own_user);
            if localpart.is_empty() {
                return false;
            }
            content
                .get("body")
                .and_then(Value::as_str)
                .is_some_and(|body| body.to_lowercase().contains(&localpart.to_lowercase()))
        }
        PushCondition::RoomMemberCount { is } => member_count_matches(is, ctx.member_count),
    }
}

fn localpart(user: &UserId) -> &str {
    let raw = user.0.strip_prefix('@').unwrap_or(&user.0);
    raw.split(':').next().unwrap_or(raw)
}

fn member_count_matches(is: &str, count: u64) -> bool {
    let (op, num) = if let Some(rest) = is.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = is.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = is.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = is.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = is.strip_prefix("==") {
        ("==", rest)
    } else {
        ("==", is)
    };
    let Ok(num) = num.parse::<u64>() else {
        return false;
    };
    match op {
        "<=" => count <= num,
        ">=" => count >= num,
        "<" => count < num,
        ">" => count > num,
        _ => count == num,
    }
}

/// Case-insensitive glob: `*` matches any run, `?` one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    // iterative matcher with single-star backtracking
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(own: &'a UserId, room: &'a RoomId) -> EvalContext<'a> {
        EvalContext {
            own_user: own,
            room_id: room,
            member_count: 5,
        }
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("alice", "Alice"));
        assert!(glob_match("*deploy*", "the deploy failed"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("abc*d", "abc"));
    }

    #[test]
    fn self_authored_events_are_never_unread() {
        let own = UserId::from("@me:x");
        let room = RoomId::from("!r:x");
        let flags = classify(
            &PushRuleSet::default(),
            &ctx(&own, &room),
            &own,
            kinds::MESSAGE,
            &serde_json::json!({"body": "me me me"}),
        );
        assert!(!flags.any());
    }

    #[test]
    fn display_name_mention_highlights() {
        let own = UserId::from("@alice:x");
        let room = RoomId::from("!r:x");
        let flags = classify(
            &PushRuleSet::default(),
            &ctx(&own, &room),
            &UserId::from("@bob:x"),
            kinds::MESSAGE,
            &serde_json::json!({"body": "ping Alice, review please"}),
        );
        assert!(flags.highlight);
        assert!(flags.notify);
        assert!(flags.sound);
        assert!(flags.message);
    }

    #[test]
    fn plain_message_notifies_without_highlight() {
        let own = UserId::from("@alice:x");
        let room = RoomId::from("!r:x");
        let flags = classify(
            &PushRuleSet::default(),
            &ctx(&own, &room),
            &UserId::from("@bob:x"),
            kinds::MESSAGE,
            &serde_json::json!({"body": "lunch?"}),
        );
        assert!(flags.notify);
        assert!(!flags.highlight);
    }

    #[test]
    fn one_to_one_rooms_ring() {
        let own = UserId::from("@alice:x");
        let room = RoomId::from("!dm:x");
        let context = EvalContext {
            own_user: &own,
            room_id: &room,
            member_count: 2,
        };
        let flags = classify(
            &PushRuleSet::default(),
            &context,
            &UserId::from("@bob:x"),
            kinds::MESSAGE,
            &serde_json::json!({"body": "hey"}),
        );
        assert!(flags.sound);
    }

    #[test]
    fn undecrypted_event_counts_as_message_only() {
        let own = UserId::from("@alice:x");
        let room = RoomId::from("!r:x");
        let flags = classify(
            &PushRuleSet::default(),
            &ctx(&own, &room),
            &UserId::from("@bob:x"),
            kinds::ENCRYPTED,
            &serde_json::json!({"algorithm": "aegis.v1"}),
        );
        assert!(flags.message);
        assert!(!flags.notify);
    }

    #[test]
    fn master_rule_mutes_everything_when_enabled() {
        let own = UserId::from("@alice:x");
        let room = RoomId::from("!r:x");
        let mut rules = PushRuleSet::default();
        rules
            .rules
            .iter_mut()
            .find(|r| r.rule_id == ".master")
            .unwrap()
            .enabled = true;

        let flags = classify(
            &rules,
            &ctx(&own, &room),
            &UserId::from("@bob:x"),
            kinds::MESSAGE,
            &serde_json::json!({"body": "ping alice"}),
        );
        assert!(!flags.notify);
        assert!(flags.message);
    }
}
