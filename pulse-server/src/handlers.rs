use std::{future::Future, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{ws::Message, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    Json,
};
use futures::{SinkExt, StreamExt};
use pulse_api::{
    AuthToken, Comment, CommentId, CommentPage, CommentUpdate, DeletionResult, DetailQuery,
    ListQuery, NewComment, Store, UserId, Uuid, VoteCounts, VoteResult,
};

use crate::{extractors::*, feeds::Feeds, tree::CommentTree, votes::VoteLedger, Error};

/// Runs a mutation to completion even if the client goes away mid-request
///
/// Otherwise, a dropped request could leave the store written but the cache not invalidated.
async fn run_detached<T, F>(f: F) -> Result<T, Error>
where
    T: 'static + Send,
    F: 'static + Send + Future<Output = Result<T, Error>>,
{
    tokio::spawn(f).await.context("mutation task failed")?
}

pub async fn health(State(feeds): State<Feeds>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": feeds.session_count().await,
    }))
}

pub async fn whoami(Auth(user): Auth) -> Json<UserId> {
    Json(user)
}

pub async fn list_comments(
    MaybeAuth(user): MaybeAuth,
    State(comments): State<CommentTree>,
    Query(q): Query<ListQuery>,
) -> Result<Json<CommentPage>, Error> {
    Ok(Json(comments.list_comments(q, user).await?))
}

pub async fn get_comment(
    MaybeAuth(user): MaybeAuth,
    State(comments): State<CommentTree>,
    Path(id): Path<CommentId>,
    Query(q): Query<DetailQuery>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(comments.get_comment(id, user, q.max_depth).await?))
}

pub async fn create_comment(
    Auth(user): Auth,
    State(comments): State<CommentTree>,
    Json(data): Json<NewComment>,
) -> Result<(StatusCode, Json<Comment>), Error> {
    let comment = run_detached(async move { comments.create_comment(data, user).await }).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn update_comment(
    Auth(user): Auth,
    State(comments): State<CommentTree>,
    Path(id): Path<CommentId>,
    Json(data): Json<CommentUpdate>,
) -> Result<Json<Comment>, Error> {
    Ok(Json(
        run_detached(async move {
            comments.check_owner(id, user).await?;
            comments.update_comment(id, &data.content, user).await
        })
        .await?,
    ))
}

pub async fn delete_comment(
    Auth(user): Auth,
    State(comments): State<CommentTree>,
    Path(id): Path<CommentId>,
) -> Result<Json<DeletionResult>, Error> {
    Ok(Json(
        run_detached(async move {
            comments.check_owner(id, user).await?;
            comments.delete_comment(id, user).await
        })
        .await?,
    ))
}

async fn vote(
    votes: VoteLedger,
    id: CommentId,
    user: UserId,
    is_like: bool,
) -> Result<Json<VoteResult>, Error> {
    Ok(Json(
        run_detached(async move { votes.toggle_vote(id, user, is_like).await }).await?,
    ))
}

pub async fn like(
    Auth(user): Auth,
    State(votes): State<VoteLedger>,
    Path(id): Path<CommentId>,
) -> Result<Json<VoteResult>, Error> {
    vote(votes, id, user, true).await
}

pub async fn dislike(
    Auth(user): Auth,
    State(votes): State<VoteLedger>,
    Path(id): Path<CommentId>,
) -> Result<Json<VoteResult>, Error> {
    vote(votes, id, user, false).await
}

pub async fn vote_counts(
    State(votes): State<VoteLedger>,
    Path(id): Path<CommentId>,
) -> Json<VoteCounts> {
    Json(votes.vote_counts(id).await)
}

pub async fn feed(
    ws: WebSocketUpgrade,
    State(store): State<Arc<dyn Store>>,
    State(feeds): State<Feeds>,
) -> Result<axum::response::Response, Error> {
    Ok(ws.on_upgrade(move |sock| {
        let (write, read) = sock.split();
        feed_impl(write, read, store, feeds)
    }))
}

pub async fn feed_impl<W, R>(mut write: W, mut read: R, store: Arc<dyn Store>, feeds: Feeds)
where
    W: 'static + Send + Unpin + futures::Sink<Message>,
    <W as futures::Sink<Message>>::Error: Send,
    R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
{
    tracing::debug!("feed websocket connected");
    if let Some(Ok(Message::Text(token))) = read.next().await {
        if let Ok(token) = Uuid::try_from(&token as &str) {
            match store.recover_session(AuthToken(token)).await {
                Ok(Some(user)) => {
                    if let Ok(_) = write.send(Message::Text(String::from("ok"))).await {
                        tracing::debug!(?user, "feed websocket auth success");
                        feeds.add_session(user, write, read).await;
                        return;
                    }
                }
                Ok(None) => (),
                Err(err) => tracing::warn!(?err, "failed recovering session for feed websocket"),
            }
        }
        tracing::debug!(?token, "feed websocket auth failure");
        let _ = write
            .send(Message::Text(String::from("permission denied")))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{self, Request},
        Router,
    };
    use futures::channel::mpsc;
    use pulse_api::{Error as ApiError, FeedMessage, Topic, VoteAction};
    use pulse_mock_store::MockStore;
    use tower::ServiceExt;

    use super::*;
    use crate::{cache::Cache, tree::TreeConfig};

    struct TestApp {
        app: Router,
        store: Arc<MockStore>,
        feeds: Feeds,
        alice: Uuid,
        bob: Uuid,
    }

    async fn test_app() -> TestApp {
        let store = Arc::new(MockStore::new());
        let alice = store.test_add_user("alice").await;
        let bob = store.test_add_user("bob").await;
        let alice = store.test_open_session(alice).await.0;
        let bob = store.test_open_session(bob).await.0;
        let state = crate::state(store.clone(), Cache::noop(), TreeConfig::default());
        let feeds = state.feeds.clone();
        TestApp {
            app: crate::app(state),
            store,
            feeds,
            alice,
            bob,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<Uuid>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().method(method).uri(uri);
        let req = match token {
            Some(token) => req.header(http::header::AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        };
        let req = match body {
            Some(body) => req
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => req.body(Body::empty()),
        }
        .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let json = match body.is_empty() {
            true => serde_json::Value::Null,
            false => serde_json::from_slice(&body)
                .unwrap_or_else(|err| panic!("response {body:?} is not json: {err}")),
        };
        (status, json)
    }

    fn api_error(body: &serde_json::Value) -> ApiError {
        ApiError::parse(&serde_json::to_vec(body).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn comment_lifecycle() {
        let t = test_app().await;
        let (status, root) = call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.alice),
            Some(serde_json::json!({ "content": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let root: Comment = serde_json::from_value(root).unwrap();

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.bob),
            Some(serde_json::json!({ "content": "hi", "parentId": root.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, page) = call(
            &t.app,
            "GET",
            "/api/comments?page=1&limit=10&sortBy=newest",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["comments"][0]["content"], "hello");
        assert_eq!(page["comments"][0]["_count"]["replies"], 1);
        assert_eq!(page["comments"][0]["replies"][0]["content"], "hi");
        assert_eq!(page["pagination"]["totalComments"], 1);

        let uri = format!("/api/comments/{}", root.id);
        let (status, body) = call(
            &t.app,
            "PUT",
            &uri,
            Some(t.bob),
            Some(serde_json::json!({ "content": "hijacked" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(api_error(&body), ApiError::NotOwner(root.id));

        let (status, body) = call(
            &t.app,
            "PUT",
            &uri,
            Some(t.alice),
            Some(serde_json::json!({ "content": "edited" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "edited");

        let (status, body) = call(&t.app, "DELETE", &uri, Some(t.alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hardDelete"], false);

        let (status, body) = call(&t.app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isDeleted"], true);
        assert_eq!(t.store.test_num_comments().await, 2);
    }

    #[tokio::test]
    async fn votes() {
        let t = test_app().await;
        let (_, c) = call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.alice),
            Some(serde_json::json!({ "content": "vote" })),
        )
        .await;
        let id = c["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &t.app,
            "POST",
            &format!("/api/comments/{id}/like"),
            Some(t.bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let res: VoteResult = serde_json::from_value(body).unwrap();
        assert_eq!(res.action, VoteAction::Created);
        assert_eq!(res.vote_counts, VoteCounts::new(1, 0));

        let (_, body) = call(
            &t.app,
            "POST",
            &format!("/api/comments/{id}/dislike"),
            Some(t.bob),
            None,
        )
        .await;
        assert_eq!(body["action"], "updated");
        assert_eq!(body["voteCounts"]["dislikes"], 1);

        let (status, body) = call(
            &t.app,
            "GET",
            &format!("/api/comments/{id}/votes"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::from_value::<VoteCounts>(body).unwrap(),
            VoteCounts::new(0, 1)
        );

        let (_, body) = call(&t.app, "GET", &format!("/api/comments/{id}"), Some(t.bob), None).await;
        assert_eq!(body["userVote"], false);
        let (_, body) = call(&t.app, "GET", &format!("/api/comments/{id}"), None, None).await;
        assert_eq!(body["userVote"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn errors() {
        let t = test_app().await;
        let (status, body) = call(
            &t.app,
            "POST",
            "/api/comments",
            None,
            Some(serde_json::json!({ "content": "anonymous" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(api_error(&body), ApiError::PermissionDenied);

        // A bad credential is refused even on routes that allow anonymous access
        let (status, _) = call(&t.app, "GET", "/api/comments", Some(Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let ghost = CommentId(Uuid::new_v4());
        let (status, body) = call(&t.app, "GET", &format!("/api/comments/{ghost}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(api_error(&body), ApiError::CommentNotFound(ghost));

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.alice),
            Some(serde_json::json!({ "content": "orphan", "parentId": ghost })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(api_error(&body), ApiError::ParentNotFound(ghost));

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.alice),
            Some(serde_json::json!({ "content": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(api_error(&body), ApiError::InvalidContent(_)));

        let (status, body) = call(&t.app, "GET", "/api/comments?limit=1000", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(api_error(&body), ApiError::InvalidPagination(_)));

        t.store.set_unreachable(true);
        let (status, body) = call(&t.app, "GET", "/api/comments", None, None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn whoami_and_health() {
        let t = test_app().await;
        let (status, _) = call(&t.app, "GET", "/api/whoami", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = call(&t.app, "GET", "/api/whoami", Some(t.alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(serde_json::from_value::<UserId>(body).is_ok());

        let (status, body) = call(&t.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn feed_authentication() {
        let t = test_app().await;
        let store: Arc<dyn Store> = t.store.clone();

        for token in [String::from("garbage"), Uuid::new_v4().to_string()] {
            let (write, mut from_server) = mpsc::unbounded::<Message>();
            let (mut to_server, read) = mpsc::unbounded::<Result<Message, axum::Error>>();
            to_server.send(Ok(Message::Text(token))).await.unwrap();
            feed_impl(write, read, store.clone(), t.feeds.clone()).await;
            assert!(matches!(
                from_server.next().await,
                Some(Message::Text(m)) if m == "permission denied"
            ));
        }
        assert_eq!(t.feeds.session_count().await, 0);

        let (write, mut from_server) = mpsc::unbounded::<Message>();
        let (mut to_server, read) = mpsc::unbounded::<Result<Message, axum::Error>>();
        to_server
            .send(Ok(Message::Text(t.alice.to_string())))
            .await
            .unwrap();
        feed_impl(write, read, store, t.feeds.clone()).await;
        assert!(matches!(
            from_server.next().await,
            Some(Message::Text(m)) if m == "ok"
        ));
        assert_eq!(t.feeds.session_count().await, 1);

        // Mutations through the api reach the connected session
        call(
            &t.app,
            "POST",
            "/api/comments",
            Some(t.bob),
            Some(serde_json::json!({ "content": "live" })),
        )
        .await;
        let msg = match from_server.next().await {
            Some(Message::Text(msg)) => serde_json::from_str::<FeedMessage>(&msg).unwrap(),
            m => panic!("unexpected message {m:?}"),
        };
        match msg {
            FeedMessage::Event {
                topic: Topic::Comments,
                event: pulse_api::FeedEvent::CommentCreated { comment, .. },
                ..
            } => assert_eq!(comment.content, "live"),
            m => panic!("unexpected message {m:?}"),
        }
    }
}
