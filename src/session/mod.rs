pub mod identity;
pub mod store;

pub use identity::{is_group_session_id, ChatKind, PlatformDirectory, SessionKey};
pub use store::{ContextTask, SessionState, SessionStore};
