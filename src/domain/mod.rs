mod chain;
mod scan;
mod types;

pub use chain::{filter_visible_messages, reconstruct_chain};
pub use scan::scan_session_file;
pub use types::{
    ConversationMessage, IndexedMetadata, ListQuery, ListUpdateKind, MessageKind, SCHEMA_VERSION,
    SessionContentUpdateData, SessionInfoUpdate, SessionListUpdateData, SessionRecord, SortKey,
    SortOrder, StoreStats, StreamEvent, session_channel,
};
