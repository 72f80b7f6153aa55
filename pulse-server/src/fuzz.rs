#![cfg(test)]

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    path::Path,
    sync::Arc,
};

use axum::{extract::FromRequestParts, http};
use bolero::generator::TypeGenerator;
use pulse_api::{
    Comment, CommentId, Error as ApiError, ListQuery, NewComment, SortBy, UserId, VoteAction,
    VoteCounts,
};
use pulse_mock_store::MockStore;

use crate::{
    cache::Cache,
    db::PostgresStore,
    extractors::*,
    testing::{fixture, RecordingPublisher},
    *,
};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    Some(postgresfixture::cluster::Cluster::new(data, runtime?))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                let _ = tracing_subscriber::fmt::try_init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let Some(cluster) = build_pg_cluster(datadir_path) else {
                eprintln!("postgresql is not installed in path, skipping {}", stringify!($name));
                return;
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

do_tokio_test!(
    vote_ledger_matches_model,
    Vec<(u8, u8, bool)>,
    |ops: Vec<(u8, u8, bool)>| async move {
        let f = fixture().await;
        let users = [f.alice, f.bob];
        let mut comments = Vec::new();
        for i in 0..2 {
            let c = f
                .tree
                .create_comment(
                    NewComment {
                        content: format!("comment {i}"),
                        parent_id: None,
                    },
                    f.alice,
                )
                .await
                .unwrap();
            comments.push(c.id);
        }

        let mut model = HashMap::<(UserId, CommentId), bool>::new();
        for (user, comment, is_like) in ops {
            let user = users[user as usize % users.len()];
            let comment = comments[comment as usize % comments.len()];
            let (action, vote) = VoteAction::transition(model.get(&(user, comment)).copied(), is_like);
            match vote {
                Some(v) => model.insert((user, comment), v),
                None => model.remove(&(user, comment)),
            };
            let likes = model
                .iter()
                .filter(|((_, c), v)| *c == comment && **v)
                .count() as u64;
            let dislikes = model
                .iter()
                .filter(|((_, c), v)| *c == comment && !**v)
                .count() as u64;

            let res = f.votes.toggle_vote(comment, user, is_like).await.unwrap();
            assert_eq!(res.action, action);
            assert_eq!(res.vote, vote);
            assert_eq!(res.vote_counts, VoteCounts::new(likes, dislikes));
            assert!(f.store.test_vote_rows(user, comment).await <= 1);
        }
    }
);

do_tokio_test!(
    pages_partition_roots,
    (u8, u8, SortBy, Vec<(u8, u8, bool)>),
    |(roots, limit, sort_by, votes): (u8, u8, SortBy, Vec<(u8, u8, bool)>)| async move {
        let f = fixture().await;
        let users = [f.alice, f.bob];
        let mut ids = Vec::new();
        for i in 0..(roots % 12) {
            let c = f
                .tree
                .create_comment(
                    NewComment {
                        content: format!("root {i}"),
                        parent_id: None,
                    },
                    f.bob,
                )
                .await
                .unwrap();
            ids.push(c.id);
        }
        if !ids.is_empty() {
            for (user, comment, is_like) in votes {
                let user = users[user as usize % users.len()];
                let comment = ids[comment as usize % ids.len()];
                f.votes.toggle_vote(comment, user, is_like).await.unwrap();
            }
        }

        let limit = u64::from(limit % 5) + 1;
        let query = |page| ListQuery {
            page: Some(page),
            limit: Some(limit),
            sort_by: Some(sort_by),
            max_depth: Some(0),
        };
        let first = f.tree.list_comments(query(1), None).await.unwrap();
        assert_eq!(first.pagination.total_comments, ids.len() as u64);
        let mut seen = Vec::new();
        for page in 1..=first.pagination.total_pages {
            let res = f.tree.list_comments(query(page), None).await.unwrap();
            assert_eq!(res.pagination.items_on_page, res.comments.len() as u64);
            seen.extend(res.comments.into_iter().map(|c| c.id));
        }
        assert_eq!(seen.len(), ids.len());
        assert_eq!(
            seen.into_iter().collect::<HashSet<_>>(),
            ids.into_iter().collect::<HashSet<_>>()
        );
    }
);

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    Post {
        user: u8,
        parent: Option<u8>,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        content: String,
    },
    Edit {
        comment: u8,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        content: String,
    },
    Delete {
        comment: u8,
    },
    Vote {
        user: u8,
        comment: u8,
        is_like: bool,
    },
    List {
        user: Option<u8>,
        page: u8,
        limit: u8,
        sort_by: SortBy,
    },
    Get {
        user: Option<u8>,
        comment: u8,
        depth: u8,
    },
}

/// Comment tree with its comment ids, in creation order
struct Side {
    tree: CommentTree,
    votes: VoteLedger,
    comments: Vec<CommentId>,
}

impl Side {
    fn new(store: Arc<dyn pulse_api::Store>) -> Side {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = TreeConfig::default();
        Side {
            votes: VoteLedger::new(
                store.clone(),
                Cache::noop(),
                publisher.clone(),
                config.max_depth_cap,
            ),
            tree: CommentTree::new(store, Cache::noop(), publisher, config),
            comments: Vec::new(),
        }
    }

    fn comment(&self, idx: u8) -> Option<CommentId> {
        match self.comments.len() {
            0 => None,
            n => Some(self.comments[idx as usize % n]),
        }
    }

    /// Strips the parts of a comment that legitimately differ between stores
    fn normalize(&self, c: &Comment) -> serde_json::Value {
        let index = |id: CommentId| self.comments.iter().position(|c| *c == id);
        serde_json::json!({
            "id": index(c.id),
            "parent": c.parent_id.map(index),
            "content": c.content,
            "author": c.author,
            "isDeleted": c.is_deleted,
            "count": c.count,
            "userVote": c.user_vote,
            "hasMoreReplies": c.has_more_replies,
            "replies": c.replies.iter().map(|r| self.normalize(r)).collect::<Vec<_>>(),
        })
    }
}

fn outcome<T>(res: Result<T, Error>) -> Result<T, String> {
    match res {
        Ok(v) => Ok(v),
        Err(Error::Api(e)) => {
            let body: serde_json::Value =
                serde_json::from_slice(&e.contents()).expect("error contents are json");
            Err(body["type"].to_string())
        }
        Err(Error::Anyhow(e)) => panic!("internal error: {e:?}"),
    }
}

struct ComparativeFuzzer {
    users: Vec<UserId>,
    app: Side,
    mock: Side,
}

impl ComparativeFuzzer {
    async fn new(pool: sqlx::PgPool) -> ComparativeFuzzer {
        let pg = PostgresStore::new(pool);
        let mock = MockStore::new();
        let mut users = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let id = mock.test_add_user(name).await;
            pg.test_add_user(id, name).await.expect("adding user to postgres");
            users.push(id);
        }
        ComparativeFuzzer {
            users,
            app: Side::new(Arc::new(pg)),
            mock: Side::new(Arc::new(mock)),
        }
    }

    fn user(&self, idx: u8) -> UserId {
        self.users[idx as usize % self.users.len()]
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Post {
                user,
                parent,
                content,
            } => {
                let user = self.user(user);
                let (app_parent, mock_parent) = match parent {
                    None => (None, None),
                    Some(p) => match (self.app.comment(p), self.mock.comment(p)) {
                        (Some(a), Some(m)) => (Some(a), Some(m)),
                        _ => (None, None),
                    },
                };
                let app = outcome(
                    self.app
                        .tree
                        .create_comment(
                            NewComment {
                                content: content.clone(),
                                parent_id: app_parent,
                            },
                            user,
                        )
                        .await,
                );
                let mock = outcome(
                    self.mock
                        .tree
                        .create_comment(
                            NewComment {
                                content,
                                parent_id: mock_parent,
                            },
                            user,
                        )
                        .await,
                );
                if let (Ok(a), Ok(m)) = (&app, &mock) {
                    self.app.comments.push(a.id);
                    self.mock.comments.push(m.id);
                }
                assert_eq!(
                    app.map(|c| self.app.normalize(&c)),
                    mock.map(|c| self.mock.normalize(&c)),
                    "app and mock did not return the same result for Post"
                );
            }
            FuzzOp::Edit { comment, content } => {
                let (Some(a), Some(m)) = (self.app.comment(comment), self.mock.comment(comment)) else {
                    return;
                };
                let user = self.users[0];
                let app = outcome(self.app.tree.update_comment(a, &content, user).await);
                let mock = outcome(self.mock.tree.update_comment(m, &content, user).await);
                assert_eq!(
                    app.map(|c| self.app.normalize(&c)),
                    mock.map(|c| self.mock.normalize(&c)),
                    "app and mock did not return the same result for Edit"
                );
            }
            FuzzOp::Delete { comment } => {
                let (Some(a), Some(m)) = (self.app.comment(comment), self.mock.comment(comment)) else {
                    return;
                };
                let user = self.users[0];
                let app = outcome(self.app.tree.delete_comment(a, user).await);
                let mock = outcome(self.mock.tree.delete_comment(m, user).await);
                assert_eq!(
                    app.map(|d| (d.hard_delete, d.comment.map(|c| self.app.normalize(&c)))),
                    mock.map(|d| (d.hard_delete, d.comment.map(|c| self.mock.normalize(&c)))),
                    "app and mock did not return the same result for Delete"
                );
            }
            FuzzOp::Vote {
                user,
                comment,
                is_like,
            } => {
                let (Some(a), Some(m)) = (self.app.comment(comment), self.mock.comment(comment)) else {
                    return;
                };
                let user = self.user(user);
                assert_eq!(
                    outcome(self.app.votes.toggle_vote(a, user, is_like).await),
                    outcome(self.mock.votes.toggle_vote(m, user, is_like).await),
                    "app and mock did not return the same result for Vote"
                );
            }
            FuzzOp::List {
                user,
                page,
                limit,
                sort_by,
            } => {
                let user = user.map(|u| self.user(u));
                let query = ListQuery {
                    page: Some(u64::from(page % 4)),
                    limit: Some(u64::from(limit % 6)),
                    sort_by: Some(sort_by),
                    max_depth: Some(2),
                };
                let app = outcome(self.app.tree.list_comments(query.clone(), user).await);
                let mock = outcome(self.mock.tree.list_comments(query, user).await);
                // Ties between equally-voted comments may be broken differently by each store,
                // so only the ranking is compared for vote-based orders
                let summarize = |side: &Side, p: pulse_api::CommentPage| {
                    let comments: Vec<serde_json::Value> = match sort_by {
                        SortBy::Newest | SortBy::Oldest => {
                            p.comments.iter().map(|c| side.normalize(c)).collect()
                        }
                        SortBy::MostLiked => p
                            .comments
                            .iter()
                            .map(|c| serde_json::json!(c.count.likes))
                            .collect(),
                        SortBy::MostDisliked => p
                            .comments
                            .iter()
                            .map(|c| serde_json::json!(c.count.dislikes))
                            .collect(),
                    };
                    (comments, p.pagination)
                };
                assert_eq!(
                    app.map(|p| summarize(&self.app, p)),
                    mock.map(|p| summarize(&self.mock, p)),
                    "app and mock did not return the same result for List"
                );
            }
            FuzzOp::Get {
                user,
                comment,
                depth,
            } => {
                let (Some(a), Some(m)) = (self.app.comment(comment), self.mock.comment(comment)) else {
                    return;
                };
                let user = user.map(|u| self.user(u));
                let depth = Some(u32::from(depth % 4));
                let app = outcome(self.app.tree.get_comment(a, user, depth).await);
                let mock = outcome(self.mock.tree.get_comment(m, user, depth).await);
                assert_eq!(
                    app.map(|c| self.app.normalize(&c)),
                    mock.map(|c| self.mock.normalize(&c)),
                    "app and mock did not return the same result for Get"
                );
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..50usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);
