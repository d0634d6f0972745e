pub mod ids;
pub mod kinds;
pub mod models;
pub mod push;
pub mod sync;
pub mod wire;

pub use ids::{EventId, EventRowId, RoomId, SessionId, UserId};
pub use push::{PushAction, PushCondition, PushRule, PushRuleKind, PushRuleSet};
pub use models::{
    Account, Event, NameQuality, Receipt, ReceiptKind, RelationKind, Room, RoomSummary,
    SessionRequest, SpaceEdge, SyncStatus, UnreadFlags,
};
pub use sync::{
    AccountDataEvent, EphemeralSignal, PduEvent, ReceiptEntry, RoomUpdate, SummaryDelta,
    SyncPayload, ToDeviceEvent,
};
pub use wire::{ChangeSet, Command, InboundFrame, OutboundFrame, PushEvent, RoomChange};
