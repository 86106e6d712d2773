//! Team chat: the live message window, compose pickers and message rendering.

mod compose;
mod engine;
mod render;

pub use compose::{Composer, Draft, Lookups, Picker};
pub use engine::{ChatEngine, ChatSummary, unread_count};
pub use render::{Segment, parse_segments, route_for};
