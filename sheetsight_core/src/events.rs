//! Event names shared with connected clients.
//!
//! These strings are part of the wire contract; renaming one breaks every
//! deployed dashboard, so they live in one place.

pub mod sheet_sync {
    pub const STARTED: &str = "sheet:sync:started";
    pub const COMPLETED: &str = "sheet:sync:completed";
    pub const FAILED: &str = "sheet:sync:failed";
}

pub mod chat {
    pub const MESSAGE_STARTED: &str = "chat:message:started";
    pub const MESSAGE_TOKEN: &str = "chat:message:token";
    pub const MESSAGE_TOOL_START: &str = "chat:message:tool_start";
    pub const MESSAGE_TOOL_END: &str = "chat:message:tool_end";
    pub const MESSAGE_COMPLETED: &str = "chat:message:completed";
    pub const MESSAGE_FAILED: &str = "chat:message:failed";
}

/// Room naming convention: every user gets a personal room.
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}
