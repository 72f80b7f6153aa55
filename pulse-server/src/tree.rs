use std::{collections::HashMap, slice, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use chrono::Utc;
use pulse_api::{
    validate_content, Comment, CommentCounts, CommentId, CommentPage, CommentRecord,
    CreationKind, CreationOrder, DeletionResult, FeedEvent, ListQuery, NewComment,
    NewCommentRecord, Pagination, RootFilter, SortBy, Store, UserId, Uuid, VoteFilter, TOMBSTONE,
};

use crate::{
    cache::{keys, Cache},
    feeds::Publisher,
    Error,
};

#[derive(Clone, Debug)]
pub struct TreeConfig {
    pub list_ttl: Duration,
    pub detail_ttl: Duration,
    pub default_max_depth: u32,
    pub max_depth_cap: u32,
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for TreeConfig {
    fn default() -> TreeConfig {
        TreeConfig {
            list_ttl: Duration::from_secs(300),
            detail_ttl: Duration::from_secs(600),
            default_max_depth: 3,
            max_depth_cap: 10,
            default_page_size: 10,
            max_page_size: 100,
        }
    }
}

/// Reads and mutations of the nested comment tree
///
/// Reads go through the cache for anonymous requesters only, as authenticated responses carry
/// the requester's own votes. Mutations hit the store, then invalidate the cache, then publish.
#[derive(Clone)]
pub struct CommentTree {
    store: Arc<dyn Store>,
    cache: Cache,
    publisher: Arc<dyn Publisher>,
    config: Arc<TreeConfig>,
}

impl CommentTree {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Cache,
        publisher: Arc<dyn Publisher>,
        config: TreeConfig,
    ) -> CommentTree {
        CommentTree {
            store,
            cache,
            publisher,
            config: Arc::new(config),
        }
    }

    fn depth(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.config.default_max_depth)
            .min(self.config.max_depth_cap)
    }

    pub async fn list_comments(
        &self,
        q: ListQuery,
        requester: Option<UserId>,
    ) -> Result<CommentPage, Error> {
        let page = q.page.unwrap_or(1);
        let limit = q.limit.unwrap_or(self.config.default_page_size);
        if page == 0 {
            return Err(Error::invalid_pagination("page must be at least 1"));
        }
        if limit == 0 || limit > self.config.max_page_size {
            return Err(Error::invalid_pagination(format!(
                "limit must be between 1 and {}",
                self.config.max_page_size
            )));
        }
        let sort_by = q.sort_by.unwrap_or_default();
        let depth = self.depth(q.max_depth);

        let key = keys::comment_list(page, limit, sort_by, depth);
        if requester.is_none() {
            if let Some(res) = self.cache.get::<CommentPage>(&key).await {
                return Ok(res);
            }
        }

        let skip = (page - 1).saturating_mul(limit);
        let total = self
            .store
            .count_root_comments(&RootFilter::default())
            .await
            .context("counting root comments")?;
        let roots = match sort_by.ranking_polarity() {
            Some(polarity) => self.ranked_roots(polarity, skip, limit).await?,
            None => {
                let order = match sort_by {
                    SortBy::Oldest => CreationOrder::OldestFirst,
                    _ => CreationOrder::NewestFirst,
                };
                self.store
                    .list_root_comments(&RootFilter::default(), order, skip, limit)
                    .await
                    .with_context(|| format!("listing root comments for page {page}"))?
            }
        };

        let mut comments = self.load_trees(roots, depth).await?;
        self.annotate_counts(&mut comments).await;
        if let Some(user) = requester {
            self.annotate_user_votes(&mut comments, user).await?;
        }

        let res = CommentPage {
            pagination: Pagination::new(page, limit, total, comments.len() as u64),
            comments,
        };
        if requester.is_none() {
            self.cache.set(&key, &res, self.config.list_ttl).await;
        }
        Ok(res)
    }

    /// Root comments of one page, ranked by number of votes of `polarity`
    ///
    /// Roots without such votes come after the ranked ones, newest first, so that every page
    /// is full. Ties keep the order the store aggregated votes in.
    async fn ranked_roots(
        &self,
        polarity: bool,
        skip: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<CommentRecord>> {
        let mut tallies = self
            .store
            .group_votes_by_comment(&VoteFilter {
                ids: None,
                polarity: Some(polarity),
                roots_only: true,
            })
            .await
            .context("ranking root comments by votes")?;
        tallies.retain(|t| t.count > 0);
        tallies.sort_by(|a, b| b.count.cmp(&a.count));
        let ranked = tallies.iter().map(|t| t.comment_id).collect::<Vec<_>>();

        let start = usize::try_from(skip).unwrap_or(usize::MAX).min(ranked.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
            .min(ranked.len());
        let mut res = Vec::with_capacity(end - start);
        if start < end {
            let mut found = self
                .store
                .find_comments(&ranked[start..end])
                .await
                .context("fetching ranked root comments")?
                .into_iter()
                .map(|c| (c.id, c))
                .collect::<HashMap<_, _>>();
            res.extend(ranked[start..end].iter().filter_map(|id| found.remove(id)));
        }

        let missing = limit.saturating_sub(res.len() as u64);
        if missing > 0 {
            let filler_skip = skip.saturating_sub(ranked.len() as u64);
            res.extend(
                self.store
                    .list_root_comments(
                        &RootFilter { exclude: ranked },
                        CreationOrder::NewestFirst,
                        filler_skip,
                        missing,
                    )
                    .await
                    .context("listing unranked root comments")?,
            );
        }
        Ok(res)
    }

    /// Loads up to `depth` levels of replies below each of `roots`, one store query per level
    async fn load_trees(
        &self,
        roots: Vec<CommentRecord>,
        depth: u32,
    ) -> anyhow::Result<Vec<Comment>> {
        let mut children = HashMap::<CommentId, Vec<CommentRecord>>::new();
        let mut frontier = roots
            .iter()
            .filter(|r| r.reply_count > 0)
            .map(|r| r.id)
            .collect::<Vec<_>>();
        for level in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let replies = self
                .store
                .list_replies(&frontier)
                .await
                .with_context(|| format!("listing replies at depth {}", level + 1))?;
            frontier = replies
                .iter()
                .filter(|r| r.reply_count > 0)
                .map(|r| r.id)
                .collect();
            for r in replies {
                if let Some(parent) = r.parent_id {
                    children.entry(parent).or_default().push(r);
                }
            }
        }
        Ok(roots
            .into_iter()
            .map(|r| assemble(r, &mut children, depth))
            .collect())
    }

    /// Fills in vote counts, leaving them at zero if they cannot be fetched
    async fn annotate_counts(&self, comments: &mut [Comment]) {
        let ids = comments.iter().flat_map(|c| c.ids()).collect::<Vec<_>>();
        if ids.is_empty() {
            return;
        }
        let tallies = match self
            .store
            .group_votes_by_comment(&VoteFilter {
                ids: Some(ids),
                polarity: None,
                roots_only: false,
            })
            .await
        {
            Ok(tallies) => tallies,
            Err(err) => {
                tracing::warn!(?err, "vote counts unavailable, returning comments without them");
                return;
            }
        };
        let mut counts = HashMap::<CommentId, (u64, u64)>::new();
        for t in tallies {
            let c = counts.entry(t.comment_id).or_default();
            match t.is_like {
                true => c.0 += t.count,
                false => c.1 += t.count,
            }
        }
        for c in comments.iter_mut() {
            c.for_each_mut(&mut |c| {
                let (likes, dislikes) = counts.get(&c.id).copied().unwrap_or_default();
                c.count.likes = likes;
                c.count.dislikes = dislikes;
            });
        }
    }

    async fn annotate_user_votes(
        &self,
        comments: &mut [Comment],
        user: UserId,
    ) -> anyhow::Result<()> {
        let ids = comments.iter().flat_map(|c| c.ids()).collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(());
        }
        let votes = self
            .store
            .find_votes(user, &ids)
            .await
            .with_context(|| format!("fetching votes of {user}"))?
            .into_iter()
            .collect::<HashMap<_, _>>();
        for c in comments.iter_mut() {
            c.for_each_mut(&mut |c| c.user_vote = votes.get(&c.id).copied());
        }
        Ok(())
    }

    pub async fn get_comment(
        &self,
        id: CommentId,
        requester: Option<UserId>,
        max_depth: Option<u32>,
    ) -> Result<Comment, Error> {
        let depth = self.depth(max_depth);
        let key = keys::comment_details(id, depth);
        if requester.is_none() {
            if let Some(res) = self.cache.get::<Comment>(&key).await {
                return Ok(res);
            }
        }

        let record = self
            .store
            .find_comment(id)
            .await
            .with_context(|| format!("fetching comment {id}"))?
            .ok_or_else(|| Error::comment_not_found(id))?;
        let mut comments = self.load_trees(vec![record], depth).await?;
        self.annotate_counts(&mut comments).await;
        if let Some(user) = requester {
            self.annotate_user_votes(&mut comments, user).await?;
        }
        let res = comments
            .pop()
            .ok_or_else(|| anyhow!("loading the tree of {id} lost its root"))?;

        if requester.is_none() {
            self.cache.set(&key, &res, self.config.detail_ttl).await;
        }
        Ok(res)
    }

    /// Checks that `user` may mutate comment `id`
    pub async fn check_owner(&self, id: CommentId, user: UserId) -> Result<CommentRecord, Error> {
        let record = self
            .store
            .find_comment(id)
            .await
            .with_context(|| format!("fetching comment {id}"))?
            .ok_or_else(|| Error::comment_not_found(id))?;
        if record.author.id != user {
            return Err(Error::not_owner(id));
        }
        Ok(record)
    }

    pub async fn create_comment(&self, new: NewComment, author: UserId) -> Result<Comment, Error> {
        let content = validate_content(&new.content)?;
        if let Some(parent) = new.parent_id {
            let exists = self
                .store
                .find_comment(parent)
                .await
                .with_context(|| format!("fetching parent comment {parent}"))?
                .is_some();
            if !exists {
                return Err(Error::parent_not_found(parent));
            }
        }

        let record = self
            .store
            .create_comment(NewCommentRecord {
                id: CommentId(Uuid::new_v4()),
                author_id: author,
                parent_id: new.parent_id,
                content,
                created_at: Utc::now(),
            })
            .await
            .context("creating comment")?;
        tracing::info!(comment=%record.id, parent=?record.parent_id, %author, "comment created");

        let parent_id = record.parent_id;
        invalidate_comment(
            &*self.store,
            &self.cache,
            record.id,
            parent_id,
            self.config.max_depth_cap,
        )
        .await;

        let comment = assemble(record, &mut HashMap::new(), 0);
        let kind = match parent_id {
            None => CreationKind::NewComment,
            Some(_) => CreationKind::NewReply,
        };
        self.publisher
            .publish_event(FeedEvent::CommentCreated {
                kind,
                comment: comment.clone(),
                parent_id,
            })
            .await;
        Ok(comment)
    }

    /// Ownership is checked by the caller
    pub async fn update_comment(
        &self,
        id: CommentId,
        content: &str,
        requester: UserId,
    ) -> Result<Comment, Error> {
        let content = validate_content(content)?;
        let updated = self
            .store
            .update_comment(id, &content, Utc::now())
            .await
            .with_context(|| format!("updating comment {id}"))?;
        let record = match updated {
            Some(record) => record,
            None => {
                // Either missing or tombstoned, the store leaves tombstones untouched
                let exists = self
                    .store
                    .find_comment(id)
                    .await
                    .with_context(|| format!("fetching comment {id}"))?
                    .is_some();
                return Err(match exists {
                    true => Error::comment_deleted(id),
                    false => Error::comment_not_found(id),
                });
            }
        };
        tracing::info!(comment=%id, user=%requester, "comment updated");

        invalidate_comment(
            &*self.store,
            &self.cache,
            id,
            record.parent_id,
            self.config.max_depth_cap,
        )
        .await;

        let mut comment = assemble(record, &mut HashMap::new(), 0);
        self.annotate_counts(slice::from_mut(&mut comment)).await;
        self.publisher
            .publish_event(FeedEvent::CommentUpdated {
                comment: comment.clone(),
            })
            .await;
        // The edit is committed and broadcast by now, so failing here would only mislead
        if let Err(err) = self
            .annotate_user_votes(slice::from_mut(&mut comment), requester)
            .await
        {
            tracing::warn!(?err, comment=%id, "requester vote unavailable after update");
        }
        Ok(comment)
    }

    /// Ownership is checked by the caller
    ///
    /// Comments with replies are replaced by a tombstone, others are removed for good.
    pub async fn delete_comment(
        &self,
        id: CommentId,
        requester: UserId,
    ) -> Result<DeletionResult, Error> {
        let current = self
            .store
            .find_comment(id)
            .await
            .with_context(|| format!("fetching comment {id}"))?
            .ok_or_else(|| Error::comment_not_found(id))?;

        // A reply may land between the count and the deletion, in which case the store refuses
        // the hard delete and the tombstone is used instead
        let hard_delete = current.reply_count == 0
            && self
                .store
                .hard_delete_comment(id)
                .await
                .with_context(|| format!("deleting comment {id}"))?;
        let comment = match hard_delete {
            true => None,
            false => {
                let record = self
                    .store
                    .soft_delete_comment(id, TOMBSTONE, Utc::now())
                    .await
                    .with_context(|| format!("tombstoning comment {id}"))?
                    .ok_or_else(|| Error::comment_not_found(id))?;
                let mut comment = assemble(record, &mut HashMap::new(), 0);
                self.annotate_counts(slice::from_mut(&mut comment)).await;
                Some(comment)
            }
        };
        tracing::info!(comment=%id, user=%requester, hard_delete, "comment deleted");

        invalidate_comment(
            &*self.store,
            &self.cache,
            id,
            current.parent_id,
            self.config.max_depth_cap,
        )
        .await;

        self.publisher
            .publish_event(FeedEvent::CommentDeleted {
                comment_id: id,
                hard_delete,
            })
            .await;
        Ok(DeletionResult {
            id,
            hard_delete,
            comment,
        })
    }
}

/// Builds the tree below `record` out of the loaded replies, at most `depth` levels deep
fn assemble(
    record: CommentRecord,
    children: &mut HashMap<CommentId, Vec<CommentRecord>>,
    depth: u32,
) -> Comment {
    let replies = match depth {
        0 => Vec::new(),
        _ => children
            .remove(&record.id)
            .unwrap_or_default()
            .into_iter()
            .map(|r| assemble(r, children, depth - 1))
            .collect::<Vec<_>>(),
    };
    Comment {
        id: record.id,
        content: record.content,
        author: record.author,
        parent_id: record.parent_id,
        created_at: record.created_at,
        updated_at: record.updated_at,
        is_deleted: record.is_deleted,
        count: CommentCounts {
            replies: record.reply_count,
            likes: 0,
            dislikes: 0,
        },
        user_vote: None,
        has_more_replies: record.reply_count > replies.len() as u64,
        replies,
    }
}

/// Drops every cached view that may embed comment `id`
///
/// That is all list pages, the trees rooted at `id`, and the trees rooted at each of its
/// ancestors up to `max_ancestors` levels up. Never fails: a store error only cuts the walk
/// short, leaving the remaining entries to expire.
pub async fn invalidate_comment(
    store: &dyn Store,
    cache: &Cache,
    id: CommentId,
    parent: Option<CommentId>,
    max_ancestors: u32,
) {
    cache.del_pattern(&keys::comment_details_pattern(id)).await;
    cache.del_pattern(keys::LIST_PATTERN).await;
    let mut next = parent;
    for _ in 0..max_ancestors {
        let Some(ancestor) = next else {
            return;
        };
        cache
            .del_pattern(&keys::comment_details_pattern(ancestor))
            .await;
        next = match store.find_comment(ancestor).await {
            Ok(Some(c)) => c.parent_id,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(?err, %ancestor, "failed walking ancestors to invalidate the cache");
                return;
            }
        };
    }
}
