mod event_id;
mod player_id;
mod reset_kind;
mod shard_id;

pub use event_id::{EventKind, InstanceId, MetadataId};
pub use player_id::{AccountId, CharacterId};
pub use reset_kind::ResetKind;
pub use shard_id::ShardId;
