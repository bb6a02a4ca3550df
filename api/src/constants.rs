//! Application constants

/// Maximum transcript length handed to the model, in characters
pub const MAX_TRANSCRIPT_CHARS: usize = 100_000;

/// Maximum length of the generated summary paragraph, in characters
pub const MAX_SUMMARY_CHARS: usize = 1_000;

/// Maximum number of entries kept in each summary list (key points, action items, timestamps)
pub const MAX_SUMMARY_ITEMS: usize = 20;

/// Maximum length of a single summary list entry, in characters
pub const MAX_SUMMARY_ITEM_CHARS: usize = 500;

/// Maximum user-supplied video title length, in characters
pub const MAX_VIDEO_TITLE_CHARS: usize = 500;

/// Maximum user-supplied channel name length, in characters
pub const MAX_VIDEO_CHANNEL_CHARS: usize = 200;

/// Title used in the prompt when the client did not send one
pub const DEFAULT_VIDEO_TITLE: &str = "Untitled Video";

/// Maximum number of videos accepted by a single batch enqueue
pub const MAX_BATCH_SIZE: usize = 10;

/// Days of summary history visible to free users
pub const FREE_HISTORY_DAYS: i64 = 7;

/// Where free users are sent to upgrade
pub const UPGRADE_URL: &str = "https://recap.app/pricing";

/// Default page size for paginated list endpoints
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Maximum page size for paginated list endpoints
pub const MAX_PAGE_SIZE: i64 = 100;

/// Maximum summary search query length, in characters
pub const MAX_SEARCH_QUERY_CHARS: usize = 200;
