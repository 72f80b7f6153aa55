use pulse_api::{CommentId, Error as ApiError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn permission_denied() -> Error {
        Error::Api(ApiError::PermissionDenied)
    }

    pub fn not_owner(id: CommentId) -> Error {
        Error::Api(ApiError::NotOwner(id))
    }

    pub fn comment_not_found(id: CommentId) -> Error {
        Error::Api(ApiError::CommentNotFound(id))
    }

    pub fn parent_not_found(id: CommentId) -> Error {
        Error::Api(ApiError::ParentNotFound(id))
    }

    pub fn comment_deleted(id: CommentId) -> Error {
        Error::Api(ApiError::CommentDeleted(id))
    }

    pub fn invalid_pagination(msg: impl Into<String>) -> Error {
        Error::Api(ApiError::InvalidPagination(msg.into()))
    }

    /// The api-level error, as it would be sent to the client
    #[cfg(test)]
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Error::Anyhow(_) => None,
            Error::Api(err) => Some(err),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let err = match self {
            Error::Anyhow(err) => {
                tracing::error!(?err, "internal server error");
                #[cfg(not(test))]
                let err =
                    ApiError::Unknown(String::from("Internal server error, see logs for details"));
                #[cfg(test)]
                let err = ApiError::Unknown(format!("Internal server error: {err:?}"));
                err
            }
            Error::Api(err) => {
                tracing::info!("returning error to client: {err}");
                err
            }
        };
        (
            err.status_code(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            err.contents(),
        )
            .into_response()
    }
}
