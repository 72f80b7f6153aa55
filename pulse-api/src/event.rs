use std::fmt;

use crate::{Comment, CommentId, Time, UserId, VoteAction, VoteCounts};

/// Named realtime channel
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Global comments feed, every session is in it
    Comments,

    /// Reply thread of one comment
    Thread(CommentId),

    /// Private channel of one user
    User(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Comments => f.write_str("comments"),
            Topic::Thread(c) => write!(f, "comment_{c}"),
            Topic::User(u) => write!(f, "user_{u}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationKind {
    NewComment,
    NewReply,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    #[serde(rename_all = "camelCase")]
    CommentCreated {
        kind: CreationKind,
        comment: Comment,
        parent_id: Option<CommentId>,
    },
    #[serde(rename_all = "camelCase")]
    CommentUpdated { comment: Comment },
    #[serde(rename_all = "camelCase")]
    CommentDeleted {
        comment_id: CommentId,
        hard_delete: bool,
    },
    #[serde(rename_all = "camelCase")]
    VoteUpdated {
        comment_id: CommentId,
        action: VoteAction,
        new_vote: Option<bool>,
        previous_vote: Option<bool>,
        vote_counts: VoteCounts,
        actor_user_id: UserId,
    },
}

impl FeedEvent {
    /// Comment whose thread topic also receives this event, on top of the global feed
    ///
    /// For replies this is the parent, as the reply joins the parent's thread.
    pub fn thread(&self) -> Option<CommentId> {
        match self {
            FeedEvent::CommentCreated { parent_id, .. } => *parent_id,
            FeedEvent::CommentUpdated { comment } => Some(comment.id),
            FeedEvent::CommentDeleted { comment_id, .. } => Some(*comment_id),
            FeedEvent::VoteUpdated { comment_id, .. } => Some(*comment_id),
        }
    }

    /// All topics this event is published to
    pub fn topics(&self) -> Vec<Topic> {
        let mut res = vec![Topic::Comments];
        res.extend(self.thread().map(Topic::Thread));
        res
    }
}

/// Message sent by the server on the realtime feed
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    /// `timestamp` is when the event was published, identical across the topics it went to
    Event {
        topic: Topic,
        event: FeedEvent,
        timestamp: Time,
    },
    Joined(Topic),
    Left(Topic),
    Pong,
}

/// Message sent by a client on the realtime feed, besides the `ping` keepalive
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Join(CommentId),
    Leave(CommentId),
}
