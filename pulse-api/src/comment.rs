use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use ammonia::Builder as AmmoniaBuilder;
use uuid::Uuid;

use crate::{Author, Error, Time, STUB_UUID};

/// Maximum number of characters of a comment, after trimming
pub const MAX_CONTENT_LEN: usize = 2000;

/// Content left in place of a comment that was deleted while it still had replies
pub const TOMBSTONE: &str = "[deleted]";

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A comment along with the replies that were loaded with it
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub content: String,
    pub author: Author,
    pub parent_id: Option<CommentId>,
    pub created_at: Time,
    pub updated_at: Time,
    pub is_deleted: bool,

    #[serde(rename = "_count")]
    pub count: CommentCounts,

    /// Vote of the requester on this comment, only ever set for authenticated requests
    pub user_vote: Option<bool>,

    /// Replies, oldest first
    pub replies: Vec<Comment>,

    /// Set when this comment has replies that were not loaded due to the depth limit
    pub has_more_replies: bool,
}

impl Comment {
    /// Calls `f` on this comment and all its loaded descendants
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Comment)) {
        f(self);
        for r in self.replies.iter_mut() {
            r.for_each_mut(&mut *f);
        }
    }

    pub fn ids(&self) -> Vec<CommentId> {
        let mut res = vec![self.id];
        for r in &self.replies {
            res.extend(r.ids());
        }
        res
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentCounts {
    pub replies: u64,
    pub likes: u64,
    pub dislikes: u64,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct CommentUpdate {
    pub content: String,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionResult {
    pub id: CommentId,
    pub hard_delete: bool,

    /// The tombstone that remains, for soft deletes
    pub comment: Option<Comment>,
}

/// Markup allowed to survive in a comment, everything else is stripped
fn sanitizer() -> AmmoniaBuilder<'static> {
    let mut builder = AmmoniaBuilder::default();
    builder.tags(HashSet::from(["a", "b", "br", "em", "i", "p", "strong"]));
    builder.generic_attributes(HashSet::new());
    builder.tag_attributes(HashMap::from([("a", HashSet::from(["href"]))]));
    builder.link_rel(None);
    builder
}

/// Sanitizes and trims `content`, then checks it is fit to be stored as a comment
pub fn validate_content(content: &str) -> Result<String, Error> {
    crate::validate_string(content)?;
    let content = sanitizer().clean(content).to_string();
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::InvalidContent(String::from(
            "comment content is required",
        )));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(Error::InvalidContent(format!(
            "comment must be at most {MAX_CONTENT_LEN} characters"
        )));
    }
    Ok(String::from(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed() {
        assert_eq!(validate_content("  hello \n"), Ok(String::from("hello")));
    }

    #[test]
    fn markup_is_sanitized() {
        assert_eq!(
            validate_content("<script>x</script><b>y</b>"),
            Ok(String::from("<b>y</b>"))
        );
        assert_eq!(
            validate_content(r#"<a href="https://example.com" onclick="evil()">link</a>"#),
            Ok(String::from(r#"<a href="https://example.com">link</a>"#))
        );
        assert_eq!(
            validate_content("<div><em>kept</em></div>"),
            Ok(String::from("<em>kept</em>"))
        );
    }

    #[test]
    fn markup_only_content_is_empty() {
        assert!(matches!(
            validate_content("  <script>alert(1)</script> "),
            Err(Error::InvalidContent(_))
        ));
    }

    #[test]
    fn content_length_bounds() {
        assert!(matches!(
            validate_content("   "),
            Err(Error::InvalidContent(_))
        ));
        let max = "é".repeat(MAX_CONTENT_LEN);
        assert_eq!(validate_content(&max), Ok(max.clone()));
        assert!(matches!(
            validate_content(&format!("{max}x")),
            Err(Error::InvalidContent(_))
        ));
    }

    #[test]
    fn counts_serialize_under_underscore_count() {
        let now = chrono::Utc::now();
        let c = Comment {
            id: CommentId::stub(),
            content: String::from("hi"),
            author: Author {
                id: crate::UserId::stub(),
                name: String::from("alice"),
            },
            parent_id: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            count: CommentCounts {
                replies: 1,
                likes: 2,
                dislikes: 0,
            },
            user_vote: None,
            replies: Vec::new(),
            has_more_replies: true,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["_count"]["replies"], 1);
        assert_eq!(json["hasMoreReplies"], true);
        assert!(json["parentId"].is_null());
    }
}
