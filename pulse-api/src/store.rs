use async_trait::async_trait;

use crate::{Author, AuthToken, CommentId, Time, UserId};

/// A comment row, as the store knows it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentRecord {
    pub id: CommentId,
    pub author: Author,
    pub parent_id: Option<CommentId>,
    pub content: String,
    pub created_at: Time,
    pub updated_at: Time,
    pub is_deleted: bool,
    pub reply_count: u64,
}

#[derive(Clone, Debug)]
pub struct NewCommentRecord {
    pub id: CommentId,
    pub author_id: UserId,
    pub parent_id: Option<CommentId>,
    pub content: String,
    pub created_at: Time,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreationOrder {
    NewestFirst,
    OldestFirst,
}

/// Restricts the set of root comments a listing looks at
#[derive(Clone, Debug, Default)]
pub struct RootFilter {
    pub exclude: Vec<CommentId>,
}

#[derive(Clone, Debug, Default)]
pub struct VoteFilter {
    /// Only count votes on these comments, all comments if `None`
    pub ids: Option<Vec<CommentId>>,

    /// Only count votes of this polarity, both if `None`
    pub polarity: Option<bool>,

    /// Only count votes on root comments
    pub roots_only: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VoteTally {
    pub comment_id: CommentId,
    pub is_like: bool,
    pub count: u64,
}

/// A vote row for this (user, comment) pair already exists
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VoteConflict;

/// Gateway to the relational store
///
/// Implementations must enforce that at most one vote exists per (user, comment) pair, and
/// report attempts to create a second one as a `VoteConflict`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn recover_session(&self, token: AuthToken) -> anyhow::Result<Option<UserId>>;

    async fn find_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRecord>>;

    /// Returns the comments that exist among `ids`, in no particular order
    async fn find_comments(&self, ids: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>>;

    async fn list_root_comments(
        &self,
        filter: &RootFilter,
        order: CreationOrder,
        skip: u64,
        take: u64,
    ) -> anyhow::Result<Vec<CommentRecord>>;

    async fn count_root_comments(&self, filter: &RootFilter) -> anyhow::Result<u64>;

    /// Returns the direct replies of all `parents`, oldest first
    async fn list_replies(&self, parents: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>>;

    async fn create_comment(&self, c: NewCommentRecord) -> anyhow::Result<CommentRecord>;

    /// Returns `None` if the comment does not exist or is a tombstone, which is left untouched
    async fn update_comment(
        &self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>>;

    /// Replaces the content with a tombstone, keeping the row and its replies
    async fn soft_delete_comment(
        &self,
        id: CommentId,
        tombstone: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>>;

    /// Removes the comment and its votes, only if it has no replies
    ///
    /// Returns whether a row was removed.
    async fn hard_delete_comment(&self, id: CommentId) -> anyhow::Result<bool>;

    async fn group_votes_by_comment(&self, filter: &VoteFilter) -> anyhow::Result<Vec<VoteTally>>;

    async fn find_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<Option<bool>>;

    /// Returns the votes `user` cast among `ids`
    async fn find_votes(
        &self,
        user: UserId,
        ids: &[CommentId],
    ) -> anyhow::Result<Vec<(CommentId, bool)>>;

    async fn create_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<Result<(), VoteConflict>>;

    /// Returns whether a row was updated
    async fn update_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<bool>;

    /// Returns whether a row was removed
    async fn delete_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<bool>;
}
