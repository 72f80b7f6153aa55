use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::CommentId;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Comment {0} is not owned by the requester")]
    NotOwner(CommentId),

    #[error("Comment not found {0}")]
    CommentNotFound(CommentId),

    #[error("Parent comment not found {0}")]
    ParentNotFound(CommentId),

    #[error("Comment {0} was deleted")]
    CommentDeleted(CommentId),

    #[error("Invalid comment content: {0}")]
    InvalidContent(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::UNAUTHORIZED,
            Error::NotOwner(_) => StatusCode::FORBIDDEN,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::ParentNotFound(_) => StatusCode::NOT_FOUND,
            Error::CommentDeleted(_) => StatusCode::GONE,
            Error::InvalidContent(_) => StatusCode::BAD_REQUEST,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidPagination(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "success": false,
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "success": false,
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::NotOwner(id) => json!({
                "success": false,
                "message": "you can only modify your own comments",
                "type": "not-owner",
                "id": id,
            }),
            Error::CommentNotFound(id) => json!({
                "success": false,
                "message": "comment not found",
                "type": "comment-not-found",
                "id": id,
            }),
            Error::ParentNotFound(id) => json!({
                "success": false,
                "message": "parent comment not found",
                "type": "parent-not-found",
                "id": id,
            }),
            Error::CommentDeleted(id) => json!({
                "success": false,
                "message": "comment was deleted",
                "type": "comment-deleted",
                "id": id,
            }),
            Error::InvalidContent(msg) => json!({
                "success": false,
                "message": msg,
                "type": "invalid-content",
            }),
            Error::NullByteInString(s) => json!({
                "success": false,
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidPagination(msg) => json!({
                "success": false,
                "message": msg,
                "type": "invalid-pagination",
            }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let message = || {
            String::from(
                data.get("message")
                    .and_then(|msg| msg.as_str())
                    .unwrap_or(""),
            )
        };
        let id = || {
            data.get("id")
                .and_then(|id| id.as_str())
                .and_then(|id| Uuid::from_str(id).ok())
                .map(CommentId)
                .ok_or_else(|| anyhow!("error is about a comment but has no proper comment id"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(message()),
                "permission-denied" => Error::PermissionDenied,
                "not-owner" => Error::NotOwner(id()?),
                "comment-not-found" => Error::CommentNotFound(id()?),
                "parent-not-found" => Error::ParentNotFound(id()?),
                "comment-deleted" => Error::CommentDeleted(id()?),
                "invalid-content" => Error::InvalidContent(message()),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "invalid-pagination" => Error::InvalidPagination(message()),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_parse_back_from_their_body() {
        let id = CommentId(Uuid::new_v4());
        for err in [
            Error::Unknown(String::from("boom")),
            Error::PermissionDenied,
            Error::NotOwner(id),
            Error::CommentNotFound(id),
            Error::ParentNotFound(id),
            Error::CommentDeleted(id),
            Error::InvalidContent(String::from("too long")),
            Error::NullByteInString(String::from("a\0")),
            Error::InvalidPagination(String::from("page must be positive")),
        ] {
            assert_eq!(Error::parse(&err.contents()).unwrap(), err);
        }
    }

    #[test]
    fn bodies_carry_a_failure_flag() {
        let body: serde_json::Value =
            serde_json::from_slice(&Error::PermissionDenied.contents()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "permission denied");
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(Error::parse(br#"{"type": "nope"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }
}
