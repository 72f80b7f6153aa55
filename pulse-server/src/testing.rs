//! Shared fixtures for the service and handler tests

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use pulse_api::{
    AuthToken, CommentId, CommentRecord, CreationOrder, FeedEvent, NewCommentRecord, RootFilter,
    Store, Time, Topic, UserId, VoteConflict, VoteFilter, VoteTally,
};
use pulse_mock_store::MockStore;

use crate::{
    cache::{Cache, MemoryCache},
    feeds::Publisher,
    tree::{CommentTree, TreeConfig},
    votes::VoteLedger,
};

/// Publisher remembering everything that went through it
#[derive(Default)]
pub struct RecordingPublisher(Mutex<Vec<(Topic, FeedEvent)>>);

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(Topic, FeedEvent)> {
        self.0.lock().unwrap().clone()
    }

    /// Events sent to the global feed, which receives all of them
    pub fn events(&self) -> Vec<FeedEvent> {
        self.published()
            .into_iter()
            .filter(|(t, _)| *t == Topic::Comments)
            .map(|(_, e)| e)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: Topic, event: FeedEvent, _timestamp: Time) {
        self.0.lock().unwrap().push((topic, event));
    }
}

pub struct Fixture {
    pub store: Arc<MockStore>,
    pub cache: Cache,
    pub publisher: Arc<RecordingPublisher>,
    pub tree: CommentTree,
    pub votes: VoteLedger,
    pub alice: UserId,
    pub bob: UserId,
}

pub async fn fixture() -> Fixture {
    fixture_with_cache(Cache::new(MemoryCache::new())).await
}

pub async fn fixture_with_cache(cache: Cache) -> Fixture {
    let store = Arc::new(MockStore::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let config = TreeConfig::default();
    let tree = CommentTree::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config.clone(),
    );
    let votes = VoteLedger::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config.max_depth_cap,
    );
    let alice = store.test_add_user("alice").await;
    let bob = store.test_add_user("bob").await;
    Fixture {
        store,
        cache,
        publisher,
        tree,
        votes,
        alice,
        bob,
    }
}

/// `MockStore` with hooks to inject concurrent writes and partial failures
pub struct TestStore {
    pub inner: MockStore,
    race_vote: Mutex<Option<bool>>,
    fail_vote_lookups: AtomicBool,
}

impl TestStore {
    pub fn new() -> TestStore {
        TestStore {
            inner: MockStore::new(),
            race_vote: Mutex::new(None),
            fail_vote_lookups: AtomicBool::new(false),
        }
    }

    /// Makes a concurrent vote of polarity `is_like` land right before the next vote creation
    pub fn race_next_vote_creation(&self, is_like: bool) {
        *self.race_vote.lock().unwrap() = Some(is_like);
    }

    /// Makes `find_votes` fail, leaving every other call working
    pub fn fail_vote_lookups(&self, fail: bool) {
        self.fail_vote_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for TestStore {
    async fn recover_session(&self, token: AuthToken) -> anyhow::Result<Option<UserId>> {
        self.inner.recover_session(token).await
    }

    async fn find_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRecord>> {
        self.inner.find_comment(id).await
    }

    async fn find_comments(&self, ids: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        self.inner.find_comments(ids).await
    }

    async fn list_root_comments(
        &self,
        filter: &RootFilter,
        order: CreationOrder,
        skip: u64,
        take: u64,
    ) -> anyhow::Result<Vec<CommentRecord>> {
        self.inner
            .list_root_comments(filter, order, skip, take)
            .await
    }

    async fn count_root_comments(&self, filter: &RootFilter) -> anyhow::Result<u64> {
        self.inner.count_root_comments(filter).await
    }

    async fn list_replies(&self, parents: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        self.inner.list_replies(parents).await
    }

    async fn create_comment(&self, c: NewCommentRecord) -> anyhow::Result<CommentRecord> {
        self.inner.create_comment(c).await
    }

    async fn update_comment(
        &self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        self.inner.update_comment(id, content, now).await
    }

    async fn soft_delete_comment(
        &self,
        id: CommentId,
        tombstone: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        self.inner.soft_delete_comment(id, tombstone, now).await
    }

    async fn hard_delete_comment(&self, id: CommentId) -> anyhow::Result<bool> {
        self.inner.hard_delete_comment(id).await
    }

    async fn group_votes_by_comment(&self, filter: &VoteFilter) -> anyhow::Result<Vec<VoteTally>> {
        self.inner.group_votes_by_comment(filter).await
    }

    async fn find_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<Option<bool>> {
        self.inner.find_vote(user, comment).await
    }

    async fn find_votes(
        &self,
        user: UserId,
        ids: &[CommentId],
    ) -> anyhow::Result<Vec<(CommentId, bool)>> {
        anyhow::ensure!(
            !self.fail_vote_lookups.load(Ordering::SeqCst),
            "vote lookups are down"
        );
        self.inner.find_votes(user, ids).await
    }

    async fn create_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<Result<(), VoteConflict>> {
        let concurrent = self.race_vote.lock().unwrap().take();
        if let Some(concurrent) = concurrent {
            let _ = self.inner.create_vote(user, comment, concurrent).await?;
        }
        self.inner.create_vote(user, comment, is_like).await
    }

    async fn update_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<bool> {
        self.inner.update_vote(user, comment, is_like).await
    }

    async fn delete_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<bool> {
        self.inner.delete_vote(user, comment).await
    }
}
