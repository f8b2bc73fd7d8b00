//! ============================================================================
//! Executor Module - API calls made on behalf of the signed-in user
//! ============================================================================
//! - BookmarksExecutor: bookmark reads via Twitter API v2
//! ============================================================================

mod bookmarks;

pub use bookmarks::{BookmarksExecutor, BookmarksPage, Tweet, TWITTER_API_BASE};
