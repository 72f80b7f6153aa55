use std::sync::Arc;

use anyhow::{anyhow, Context};
use pulse_api::{
    CommentId, FeedEvent, Store, UserId, VoteAction, VoteConflict, VoteCounts, VoteFilter,
    VoteResult,
};

use crate::{cache::Cache, feeds::Publisher, tree::invalidate_comment, Error};

/// Number of times a vote is re-attempted when a concurrent vote of the same user won the race
const VOTE_ATTEMPTS: usize = 3;

/// Single vote per (user, comment) pair, toggled between none, like and dislike
#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn Store>,
    cache: Cache,
    publisher: Arc<dyn Publisher>,
    max_ancestors: u32,
}

impl VoteLedger {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Cache,
        publisher: Arc<dyn Publisher>,
        max_ancestors: u32,
    ) -> VoteLedger {
        VoteLedger {
            store,
            cache,
            publisher,
            max_ancestors,
        }
    }

    pub async fn toggle_vote(
        &self,
        comment: CommentId,
        user: UserId,
        is_like: bool,
    ) -> Result<VoteResult, Error> {
        let record = self
            .store
            .find_comment(comment)
            .await
            .with_context(|| format!("fetching comment {comment}"))?
            .ok_or_else(|| Error::comment_not_found(comment))?;

        let (previous, action, vote) = self.apply(comment, user, is_like).await?;
        tracing::info!(%comment, %user, ?action, "vote recorded");

        let vote_counts = self.vote_counts(comment).await;
        invalidate_comment(
            &*self.store,
            &self.cache,
            comment,
            record.parent_id,
            self.max_ancestors,
        )
        .await;
        self.publisher
            .publish_event(FeedEvent::VoteUpdated {
                comment_id: comment,
                action,
                new_vote: vote,
                previous_vote: previous,
                vote_counts,
                actor_user_id: user,
            })
            .await;
        Ok(VoteResult {
            action,
            vote,
            vote_counts,
        })
    }

    /// Runs one step of the state machine against the store
    ///
    /// The store's view may change between reading the current vote and writing the new one,
    /// when the same user votes concurrently. A lost creation settles as an update of the row
    /// that won, other lost writes are retried from the new current vote.
    async fn apply(
        &self,
        comment: CommentId,
        user: UserId,
        is_like: bool,
    ) -> anyhow::Result<(Option<bool>, VoteAction, Option<bool>)> {
        for attempt in 0..VOTE_ATTEMPTS {
            let current = self
                .store
                .find_vote(user, comment)
                .await
                .with_context(|| format!("fetching vote of {user} on {comment}"))?;
            let (action, vote) = VoteAction::transition(current, is_like);
            let applied = match action {
                VoteAction::Created => match self
                    .store
                    .create_vote(user, comment, is_like)
                    .await
                    .with_context(|| format!("creating vote of {user} on {comment}"))?
                {
                    Ok(()) => true,
                    Err(VoteConflict) => {
                        if let Some(res) = self.settle_conflict(comment, user, is_like).await? {
                            return Ok(res);
                        }
                        false
                    }
                },
                VoteAction::Updated => self
                    .store
                    .update_vote(user, comment, is_like)
                    .await
                    .with_context(|| format!("updating vote of {user} on {comment}"))?,
                VoteAction::Removed => self
                    .store
                    .delete_vote(user, comment)
                    .await
                    .with_context(|| format!("removing vote of {user} on {comment}"))?,
            };
            if applied {
                return Ok((current, action, vote));
            }
            tracing::debug!(%comment, %user, attempt, "vote raced with another one, retrying");
        }
        Err(anyhow!(
            "vote of {user} on {comment} kept racing with concurrent votes"
        ))
    }

    /// Turns a creation that lost against a concurrent vote into an update of the existing row
    ///
    /// Returns `None` if that row vanished too, in which case the whole step is retried.
    async fn settle_conflict(
        &self,
        comment: CommentId,
        user: UserId,
        is_like: bool,
    ) -> anyhow::Result<Option<(Option<bool>, VoteAction, Option<bool>)>> {
        let stored = self
            .store
            .find_vote(user, comment)
            .await
            .with_context(|| format!("fetching conflicting vote of {user} on {comment}"))?;
        match stored {
            None => Ok(None),
            Some(stored) if stored == is_like => {
                Ok(Some((None, VoteAction::Created, Some(is_like))))
            }
            Some(stored) => {
                let updated = self
                    .store
                    .update_vote(user, comment, is_like)
                    .await
                    .with_context(|| format!("updating vote of {user} on {comment}"))?;
                Ok(updated.then_some((Some(stored), VoteAction::Updated, Some(is_like))))
            }
        }
    }

    /// Current like and dislike totals, zero if they cannot be fetched
    pub async fn vote_counts(&self, comment: CommentId) -> VoteCounts {
        let tallies = match self
            .store
            .group_votes_by_comment(&VoteFilter {
                ids: Some(vec![comment]),
                polarity: None,
                roots_only: false,
            })
            .await
        {
            Ok(tallies) => tallies,
            Err(err) => {
                tracing::warn!(?err, %comment, "vote counts unavailable");
                return VoteCounts::default();
            }
        };
        let (mut likes, mut dislikes) = (0, 0);
        for t in tallies.into_iter().filter(|t| t.comment_id == comment) {
            match t.is_like {
                true => likes += t.count,
                false => dislikes += t.count,
            }
        }
        VoteCounts::new(likes, dislikes)
    }
}
