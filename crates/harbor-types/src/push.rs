//! Push rules: the per-account ordered rule set that classifies incoming
//! events as notify/highlight/sound.

use serde::{Deserialize, Serialize};

/// Rule tiers, in evaluation order. The first matching enabled rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushRuleKind {
    Override,
    Content,
    Room,
    Sender,
    Underride,
}

/// A condition a rule requires of the event under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushCondition {
    /// Glob match of `pattern` against a dotted field of the event.
    EventMatch { key: String, pattern: String },
    /// The event body contains the local user's display name or localpart.
    ContainsDisplayName,
    /// The room's joined member count satisfies `is` (e.g. "2", "<=10").
    RoomMemberCount { is: String },
}

/// What a matched rule does to the event's unread classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushAction {
    Notify,
    DontNotify,
    Highlight,
    Sound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRule {
    pub rule_id: String,
    pub kind: PushRuleKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Content rules: glob matched against the message body.
    pub pattern: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PushCondition>,
    pub actions: Vec<PushAction>,
}

fn default_true() -> bool {
    true
}

/// The account's rule set, kept sorted by tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRuleSet {
    pub rules: Vec<PushRule>,
}

impl PushRuleSet {
    /// Rules in evaluation order: override, content, room, sender, underride,
    /// preserving relative order within a tier.
    pub fn ordered(&self) -> impl Iterator<Item = &PushRule> {
        let mut sorted: Vec<&PushRule> = self.rules.iter().collect();
        sorted.sort_by_key(|r| r.kind);
        sorted.into_iter()
    }
}

impl Default for PushRuleSet {
    /// The baseline rule set used until the account data supplies one.
    fn default() -> Self {
        Self {
            rules: vec![
                PushRule {
                    rule_id: ".master".into(),
                    kind: PushRuleKind::Override,
                    enabled: false,
                    pattern: None,
                    conditions: Vec::new(),
                    actions: vec![PushAction::DontNotify],
                },
                PushRule {
                    rule_id: ".contains_display_name".into(),
                    kind: PushRuleKind::Override,
                    enabled: true,
                    pattern: None,
                    conditions: vec![PushCondition::ContainsDisplayName],
                    actions: vec![PushAction::Notify, PushAction::Highlight, PushAction::Sound],
                },
                PushRule {
                    rule_id: ".one_to_one".into(),
                    kind: PushRuleKind::Underride,
                    enabled: true,
                    pattern: None,
                    conditions: vec![PushCondition::RoomMemberCount { is: "2".into() }],
                    actions: vec![PushAction::Notify, PushAction::Sound],
                },
                PushRule {
                    rule_id: ".message".into(),
                    kind: PushRuleKind::Underride,
                    enabled: true,
                    pattern: None,
                    conditions: vec![PushCondition::EventMatch {
                        key: "type".into(),
                        pattern: "room.message".into(),
                    }],
                    actions: vec![PushAction::Notify],
                },
                PushRule {
                    rule_id: ".sticker".into(),
                    kind: PushRuleKind::Underride,
                    enabled: true,
                    pattern: None,
                    conditions: vec![PushCondition::EventMatch {
                        key: "type".into(),
                        pattern: "room.sticker".into(),
                    }],
                    actions: vec![PushAction::Notify],
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_sorts_by_tier() {
        let set = PushRuleSet {
            rules: vec![
                PushRule {
                    rule_id: "u".into(),
                    kind: PushRuleKind::Underride,
                    enabled: true,
                    pattern: None,
                    conditions: Vec::new(),
                    actions: vec![PushAction::Notify],
                },
                PushRule {
                    rule_id: "o".into(),
                    kind: PushRuleKind::Override,
                    enabled: true,
                    pattern: None,
                    conditions: Vec::new(),
                    actions: vec![PushAction::DontNotify],
                },
            ],
        };
        let ids: Vec<&str> = set.ordered().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["o", "u"]);
    }

    #[test]
    fn default_rules_round_trip() {
        let set = PushRuleSet::default();
        let json = serde_json::to_string(&set).unwrap();
        let back: PushRuleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
