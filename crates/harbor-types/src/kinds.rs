//! Well-known event and account-data type names.

pub const CREATE: &str = "room.create";
pub const TOMBSTONE: &str = "room.tombstone";
pub const NAME: &str = "room.name";
pub const CANONICAL_ALIAS: &str = "room.canonical_alias";
pub const AVATAR: &str = "room.avatar";
pub const TOPIC: &str = "room.topic";
pub const ENCRYPTION: &str = "room.encryption";
pub const POWER_LEVELS: &str = "room.power_levels";
pub const HISTORY_VISIBILITY: &str = "room.history_visibility";
pub const MEMBER: &str = "room.member";
pub const MESSAGE: &str = "room.message";
pub const STICKER: &str = "room.sticker";
pub const ENCRYPTED: &str = "room.encrypted";
pub const REDACTION: &str = "room.redaction";

pub const SPACE_CHILD: &str = "space.child";
pub const SPACE_PARENT: &str = "space.parent";

pub const ACCOUNT_PUSH_RULES: &str = "push_rules";
pub const ACCOUNT_DIRECT: &str = "direct";

/// Membership values carried by `room.member` content.
pub const MEMBERSHIP_JOIN: &str = "join";
pub const MEMBERSHIP_INVITE: &str = "invite";
pub const MEMBERSHIP_LEAVE: &str = "leave";
pub const MEMBERSHIP_BAN: &str = "ban";
