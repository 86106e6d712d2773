//! Collection name constants.

/// Production projects.
pub const PROJECT_COLLECTION: &str = "projects";

/// Videos, each belonging to a project.
pub const VIDEO_COLLECTION: &str = "videos";

/// Scripts, optionally linked to a video.
pub const SCRIPT_COLLECTION: &str = "scripts";

/// Studio clients.
pub const CLIENT_COLLECTION: &str = "clients";

/// Post-production assignments.
pub const POST_PRODUCTION_COLLECTION: &str = "postProductions";

/// Team member profiles.
pub const USER_COLLECTION: &str = "users";

/// Per-user notification records.
pub const NOTIFICATION_COLLECTION: &str = "notifications";

/// Global team chat feed.
pub const CHAT_COLLECTION: &str = "chatMessages";

/// Field every collection is ordered by (newest first).
pub const CREATED_AT_FIELD: &str = "createdAt";
