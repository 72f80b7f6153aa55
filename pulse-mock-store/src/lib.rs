use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use pulse_api::{
    Author, AuthToken, CommentId, CommentRecord, CreationOrder, NewCommentRecord, RootFilter,
    Store, Time, UserId, Uuid, VoteConflict, VoteFilter, VoteTally,
};
use tokio::sync::Mutex;

/// In-memory store, behaving like the postgres one
pub struct MockStore {
    db: Mutex<Db>,
    unreachable: AtomicBool,
}

#[derive(Default)]
struct Db {
    users: HashMap<UserId, String>,
    sessions: HashMap<AuthToken, UserId>,
    // in insertion order
    comments: Vec<Row>,
    // in insertion order, unique on (user, comment)
    votes: Vec<VoteRow>,
}

#[derive(Clone, Debug)]
struct Row {
    id: CommentId,
    author_id: UserId,
    parent_id: Option<CommentId>,
    content: String,
    created_at: Time,
    updated_at: Time,
    is_deleted: bool,
}

#[derive(Clone, Debug)]
struct VoteRow {
    user: UserId,
    comment: CommentId,
    is_like: bool,
}

impl Db {
    fn row(&self, id: CommentId) -> Option<&Row> {
        self.comments.iter().find(|c| c.id == id)
    }

    fn record(&self, r: &Row) -> CommentRecord {
        CommentRecord {
            id: r.id,
            author: Author {
                id: r.author_id,
                name: self.users.get(&r.author_id).cloned().unwrap_or_default(),
            },
            parent_id: r.parent_id,
            content: r.content.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            is_deleted: r.is_deleted,
            reply_count: self
                .comments
                .iter()
                .filter(|c| c.parent_id == Some(r.id))
                .count() as u64,
        }
    }

    fn roots(&self, filter: &RootFilter) -> Vec<(usize, &Row)> {
        self.comments
            .iter()
            .enumerate()
            .filter(|(_, c)| c.parent_id.is_none() && !filter.exclude.contains(&c.id))
            .collect()
    }
}

impl MockStore {
    pub fn new() -> MockStore {
        MockStore {
            db: Mutex::new(Db::default()),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent call fail, as if the store went down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.unreachable.load(Ordering::SeqCst),
            "mock store is unreachable"
        );
        Ok(())
    }

    pub async fn test_add_user(&self, name: &str) -> UserId {
        let id = UserId(Uuid::new_v4());
        self.db.lock().await.users.insert(id, String::from(name));
        id
    }

    pub async fn test_open_session(&self, user: UserId) -> AuthToken {
        let tok = AuthToken(Uuid::new_v4());
        self.db.lock().await.sessions.insert(tok, user);
        tok
    }

    /// Number of vote rows for this (user, comment) pair
    pub async fn test_vote_rows(&self, user: UserId, comment: CommentId) -> usize {
        self.db
            .lock()
            .await
            .votes
            .iter()
            .filter(|v| v.user == user && v.comment == comment)
            .count()
    }

    pub async fn test_num_comments(&self) -> usize {
        self.db.lock().await.comments.len()
    }
}

impl Default for MockStore {
    fn default() -> MockStore {
        MockStore::new()
    }
}

#[async_trait]
impl Store for MockStore {
    async fn recover_session(&self, token: AuthToken) -> anyhow::Result<Option<UserId>> {
        self.check_reachable()?;
        Ok(self.db.lock().await.sessions.get(&token).copied())
    }

    async fn find_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRecord>> {
        self.check_reachable()?;
        let db = self.db.lock().await;
        Ok(db.row(id).map(|r| db.record(r)))
    }

    async fn find_comments(&self, ids: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        self.check_reachable()?;
        let db = self.db.lock().await;
        Ok(db
            .comments
            .iter()
            .filter(|c| ids.contains(&c.id))
            .map(|c| db.record(c))
            .collect())
    }

    async fn list_root_comments(
        &self,
        filter: &RootFilter,
        order: CreationOrder,
        skip: u64,
        take: u64,
    ) -> anyhow::Result<Vec<CommentRecord>> {
        self.check_reachable()?;
        let db = self.db.lock().await;
        let mut roots = db.roots(filter);
        roots.sort_by_key(|(seq, c)| (c.created_at, *seq));
        if order == CreationOrder::NewestFirst {
            roots.reverse();
        }
        Ok(roots
            .into_iter()
            .skip(skip as usize)
            .take(take as usize)
            .map(|(_, c)| db.record(c))
            .collect())
    }

    async fn count_root_comments(&self, filter: &RootFilter) -> anyhow::Result<u64> {
        self.check_reachable()?;
        Ok(self.db.lock().await.roots(filter).len() as u64)
    }

    async fn list_replies(&self, parents: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        self.check_reachable()?;
        let db = self.db.lock().await;
        let mut replies = db
            .comments
            .iter()
            .enumerate()
            .filter(|(_, c)| c.parent_id.map(|p| parents.contains(&p)).unwrap_or(false))
            .collect::<Vec<_>>();
        replies.sort_by_key(|(seq, c)| (c.created_at, *seq));
        Ok(replies.into_iter().map(|(_, c)| db.record(c)).collect())
    }

    async fn create_comment(&self, c: NewCommentRecord) -> anyhow::Result<CommentRecord> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        anyhow::ensure!(
            db.users.contains_key(&c.author_id),
            "author {:?} does not exist",
            c.author_id
        );
        if let Some(parent) = c.parent_id {
            anyhow::ensure!(
                db.row(parent).is_some(),
                "parent {:?} does not exist",
                parent
            );
        }
        anyhow::ensure!(db.row(c.id).is_none(), "comment {:?} already exists", c.id);
        let row = Row {
            id: c.id,
            author_id: c.author_id,
            parent_id: c.parent_id,
            content: c.content,
            created_at: c.created_at,
            updated_at: c.created_at,
            is_deleted: false,
        };
        let res = db.record(&row);
        db.comments.push(row);
        Ok(res)
    }

    async fn update_comment(
        &self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        let row = match db.comments.iter_mut().find(|c| c.id == id && !c.is_deleted) {
            None => return Ok(None),
            Some(row) => {
                row.content = String::from(content);
                row.updated_at = now;
                row.clone()
            }
        };
        Ok(Some(db.record(&row)))
    }

    async fn soft_delete_comment(
        &self,
        id: CommentId,
        tombstone: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        let row = match db.comments.iter_mut().find(|c| c.id == id) {
            None => return Ok(None),
            Some(row) => {
                row.content = String::from(tombstone);
                row.is_deleted = true;
                row.updated_at = now;
                row.clone()
            }
        };
        Ok(Some(db.record(&row)))
    }

    async fn hard_delete_comment(&self, id: CommentId) -> anyhow::Result<bool> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        if db.comments.iter().any(|c| c.parent_id == Some(id)) {
            return Ok(false);
        }
        let before = db.comments.len();
        db.comments.retain(|c| c.id != id);
        let removed = db.comments.len() != before;
        if removed {
            db.votes.retain(|v| v.comment != id);
        }
        Ok(removed)
    }

    async fn group_votes_by_comment(&self, filter: &VoteFilter) -> anyhow::Result<Vec<VoteTally>> {
        self.check_reachable()?;
        let db = self.db.lock().await;
        let roots = db
            .comments
            .iter()
            .filter(|c| c.parent_id.is_none())
            .map(|c| c.id)
            .collect::<HashSet<_>>();
        let mut res: Vec<VoteTally> = Vec::new();
        for v in db.votes.iter() {
            if filter.ids.as_ref().map(|ids| !ids.contains(&v.comment)).unwrap_or(false)
                || filter.polarity.map(|p| p != v.is_like).unwrap_or(false)
                || (filter.roots_only && !roots.contains(&v.comment))
            {
                continue;
            }
            match res
                .iter_mut()
                .find(|t| t.comment_id == v.comment && t.is_like == v.is_like)
            {
                Some(t) => t.count += 1,
                None => res.push(VoteTally {
                    comment_id: v.comment,
                    is_like: v.is_like,
                    count: 1,
                }),
            }
        }
        Ok(res)
    }

    async fn find_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<Option<bool>> {
        self.check_reachable()?;
        Ok(self
            .db
            .lock()
            .await
            .votes
            .iter()
            .find(|v| v.user == user && v.comment == comment)
            .map(|v| v.is_like))
    }

    async fn find_votes(
        &self,
        user: UserId,
        ids: &[CommentId],
    ) -> anyhow::Result<Vec<(CommentId, bool)>> {
        self.check_reachable()?;
        Ok(self
            .db
            .lock()
            .await
            .votes
            .iter()
            .filter(|v| v.user == user && ids.contains(&v.comment))
            .map(|v| (v.comment, v.is_like))
            .collect())
    }

    async fn create_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<Result<(), VoteConflict>> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        anyhow::ensure!(
            db.row(comment).is_some(),
            "voting on missing comment {:?}",
            comment
        );
        if db.votes.iter().any(|v| v.user == user && v.comment == comment) {
            return Ok(Err(VoteConflict));
        }
        db.votes.push(VoteRow {
            user,
            comment,
            is_like,
        });
        Ok(Ok(()))
    }

    async fn update_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<bool> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        match db
            .votes
            .iter_mut()
            .find(|v| v.user == user && v.comment == comment)
        {
            None => Ok(false),
            Some(v) => {
                v.is_like = is_like;
                Ok(true)
            }
        }
    }

    async fn delete_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<bool> {
        self.check_reachable()?;
        let mut db = self.db.lock().await;
        let before = db.votes.len();
        db.votes.retain(|v| !(v.user == user && v.comment == comment));
        Ok(db.votes.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_comment(author: UserId, parent: Option<CommentId>, content: &str) -> NewCommentRecord {
        NewCommentRecord {
            id: CommentId(Uuid::new_v4()),
            author_id: author,
            parent_id: parent,
            content: String::from(content),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_vote_conflicts() {
        let store = MockStore::new();
        let u = store.test_add_user("alice").await;
        let c = store.create_comment(new_comment(u, None, "hello")).await.unwrap();
        assert_eq!(store.create_vote(u, c.id, true).await.unwrap(), Ok(()));
        assert_eq!(
            store.create_vote(u, c.id, false).await.unwrap(),
            Err(VoteConflict)
        );
        assert_eq!(store.test_vote_rows(u, c.id).await, 1);
    }

    #[tokio::test]
    async fn hard_delete_refuses_parents() {
        let store = MockStore::new();
        let u = store.test_add_user("alice").await;
        let a = store.create_comment(new_comment(u, None, "a")).await.unwrap();
        let b = store.create_comment(new_comment(u, Some(a.id), "b")).await.unwrap();
        assert!(!store.hard_delete_comment(a.id).await.unwrap());
        assert_eq!(store.find_comment(a.id).await.unwrap().unwrap().reply_count, 1);
        assert!(store.hard_delete_comment(b.id).await.unwrap());
        assert!(store.hard_delete_comment(a.id).await.unwrap());
        assert_eq!(store.test_num_comments().await, 0);
    }

    #[tokio::test]
    async fn tombstones_are_not_updated() {
        let store = MockStore::new();
        let u = store.test_add_user("alice").await;
        let a = store.create_comment(new_comment(u, None, "a")).await.unwrap();
        let now = chrono::Utc::now();
        store.soft_delete_comment(a.id, "[gone]", now).await.unwrap();
        assert_eq!(store.update_comment(a.id, "back", now).await.unwrap(), None);
        let a = store.find_comment(a.id).await.unwrap().unwrap();
        assert_eq!(a.content, "[gone]");
        assert!(a.is_deleted);
    }

    #[tokio::test]
    async fn unreachable_store_fails() {
        let store = MockStore::new();
        store.set_unreachable(true);
        assert!(store.count_root_comments(&RootFilter::default()).await.is_err());
        store.set_unreachable(false);
        assert_eq!(store.count_root_comments(&RootFilter::default()).await.unwrap(), 0);
    }
}
