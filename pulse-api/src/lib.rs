mod auth;
mod comment;
mod error;
mod event;
mod query;
mod store;
mod user;
mod vote;

pub use auth::AuthToken;
pub use comment::{
    validate_content, Comment, CommentCounts, CommentId, CommentUpdate, DeletionResult,
    NewComment, MAX_CONTENT_LEN, TOMBSTONE,
};
pub use error::Error;
pub use event::{ClientMessage, CreationKind, FeedEvent, FeedMessage, Topic};
pub use query::{CommentPage, DetailQuery, ListQuery, Pagination, SortBy};
pub use store::{
    CommentRecord, CreationOrder, NewCommentRecord, RootFilter, Store, VoteConflict, VoteFilter,
    VoteTally,
};
pub use user::{Author, UserId};
pub use vote::{VoteAction, VoteCounts, VoteResult};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<chrono::Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}
