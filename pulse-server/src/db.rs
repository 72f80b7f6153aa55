use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use pulse_api::{
    Author, AuthToken, CommentId, CommentRecord, CreationOrder, NewCommentRecord, RootFilter,
    Store, Time, UserId, Uuid, VoteConflict, VoteFilter, VoteTally,
};
use sqlx::{postgres::PgRow, Row};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const SELECT_COMMENTS: &str = "
    SELECT
        c.id,
        c.author_id,
        u.name AS author_name,
        c.parent_id,
        c.content,
        c.created_at,
        c.updated_at,
        c.is_deleted,
        (SELECT COUNT(*) FROM comments r WHERE r.parent_id = c.id) AS reply_count
    FROM comments c
    INNER JOIN users u
        ON u.id = c.author_id
";

#[derive(Clone)]
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> PostgresStore {
        PostgresStore { pool }
    }

    #[cfg(test)]
    pub async fn test_add_user(&self, id: UserId, name: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO users (id, name) VALUES ($1, $2)")
            .bind(id.0)
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting user {id}"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_open_session(&self, user: UserId) -> anyhow::Result<AuthToken> {
        let token = AuthToken(Uuid::new_v4());
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, login_time, last_active) VALUES ($1, $2, $3, $3)",
        )
        .bind(token.0)
        .bind(user.0)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("opening session for {user}"))?;
        Ok(token)
    }
}

fn ids(ids: &[CommentId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}

fn comment_record(r: &PgRow) -> anyhow::Result<CommentRecord> {
    let reply_count: i64 = r
        .try_get("reply_count")
        .context("retrieving reply_count field")?;
    Ok(CommentRecord {
        id: CommentId(r.try_get("id").context("retrieving id field")?),
        author: Author {
            id: UserId(r.try_get("author_id").context("retrieving author_id field")?),
            name: r
                .try_get("author_name")
                .context("retrieving author_name field")?,
        },
        parent_id: r
            .try_get::<Option<Uuid>, _>("parent_id")
            .context("retrieving parent_id field")?
            .map(CommentId),
        content: r.try_get("content").context("retrieving content field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving created_at field")?,
        updated_at: r
            .try_get("updated_at")
            .context("retrieving updated_at field")?,
        is_deleted: r
            .try_get("is_deleted")
            .context("retrieving is_deleted field")?,
        reply_count: u64::try_from(reply_count).context("negative reply count")?,
    })
}

fn is_db_error(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(e) => e.code().as_deref() == Some(code),
        _ => false,
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for PostgresStore {
    async fn recover_session(&self, token: AuthToken) -> anyhow::Result<Option<UserId>> {
        Ok(sqlx::query(
            "UPDATE sessions SET last_active = $2 WHERE id = $1 RETURNING user_id",
        )
        .bind(token.0)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .context("recovering session")?
        .map(|r| r.try_get("user_id").map(UserId))
        .transpose()
        .context("retrieving user_id field")?)
    }

    async fn find_comment(&self, id: CommentId) -> anyhow::Result<Option<CommentRecord>> {
        sqlx::query(&format!("{SELECT_COMMENTS} WHERE c.id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("querying comment {id}"))?
            .as_ref()
            .map(comment_record)
            .transpose()
    }

    async fn find_comments(&self, ids_: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        sqlx::query(&format!("{SELECT_COMMENTS} WHERE c.id = ANY($1)"))
            .bind(ids(ids_))
            .fetch_all(&self.pool)
            .await
            .context("querying comments by id")?
            .iter()
            .map(comment_record)
            .collect()
    }

    async fn list_root_comments(
        &self,
        filter: &RootFilter,
        order: CreationOrder,
        skip: u64,
        take: u64,
    ) -> anyhow::Result<Vec<CommentRecord>> {
        let order = match order {
            CreationOrder::NewestFirst => "c.created_at DESC, c.seq DESC",
            CreationOrder::OldestFirst => "c.created_at ASC, c.seq ASC",
        };
        sqlx::query(&format!(
            "
                {SELECT_COMMENTS}
                WHERE c.parent_id IS NULL
                AND NOT (c.id = ANY($1))
                ORDER BY {order}
                OFFSET $2
                LIMIT $3
            "
        ))
        .bind(ids(&filter.exclude))
        .bind(to_i64(skip))
        .bind(to_i64(take))
        .fetch_all(&self.pool)
        .await
        .context("listing root comments")?
        .iter()
        .map(comment_record)
        .collect()
    }

    async fn count_root_comments(&self, filter: &RootFilter) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM comments WHERE parent_id IS NULL AND NOT (id = ANY($1))",
        )
        .bind(ids(&filter.exclude))
        .fetch_one(&self.pool)
        .await
        .context("counting root comments")?
        .try_get("count")
        .context("retrieving count field")?;
        u64::try_from(count).context("negative root comment count")
    }

    async fn list_replies(&self, parents: &[CommentId]) -> anyhow::Result<Vec<CommentRecord>> {
        sqlx::query(&format!(
            "{SELECT_COMMENTS} WHERE c.parent_id = ANY($1) ORDER BY c.created_at, c.seq"
        ))
        .bind(ids(parents))
        .fetch_all(&self.pool)
        .await
        .context("listing replies")?
        .iter()
        .map(comment_record)
        .collect()
    }

    async fn create_comment(&self, c: NewCommentRecord) -> anyhow::Result<CommentRecord> {
        sqlx::query(
            "
                INSERT INTO comments (id, author_id, parent_id, content, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $5)
            ",
        )
        .bind(c.id.0)
        .bind(c.author_id.0)
        .bind(c.parent_id.map(|p| p.0))
        .bind(&c.content)
        .bind(c.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting comment {}", c.id))?;
        self.find_comment(c.id)
            .await?
            .ok_or_else(|| anyhow!("comment {} vanished right after its creation", c.id))
    }

    async fn update_comment(
        &self,
        id: CommentId,
        content: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        let res = sqlx::query(
            "UPDATE comments SET content = $2, updated_at = $3 WHERE id = $1 AND NOT is_deleted",
        )
        .bind(id.0)
        .bind(content)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating comment {id}"))?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_comment(id).await
    }

    async fn soft_delete_comment(
        &self,
        id: CommentId,
        tombstone: &str,
        now: Time,
    ) -> anyhow::Result<Option<CommentRecord>> {
        let res = sqlx::query(
            "UPDATE comments SET content = $2, updated_at = $3, is_deleted = true WHERE id = $1",
        )
        .bind(id.0)
        .bind(tombstone)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("tombstoning comment {id}"))?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_comment(id).await
    }

    async fn hard_delete_comment(&self, id: CommentId) -> anyhow::Result<bool> {
        // Votes go away with the comment, through ON DELETE CASCADE
        let res = sqlx::query(
            "
                DELETE FROM comments c
                WHERE c.id = $1
                AND NOT EXISTS (SELECT 1 FROM comments r WHERE r.parent_id = c.id)
            ",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await;
        match res {
            Ok(res) => Ok(res.rows_affected() > 0),
            // A reply was inserted concurrently
            Err(e) if is_db_error(&e, FOREIGN_KEY_VIOLATION) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting comment {id}")),
        }
    }

    async fn group_votes_by_comment(&self, filter: &VoteFilter) -> anyhow::Result<Vec<VoteTally>> {
        sqlx::query(
            "
                SELECT v.comment_id, v.is_like, COUNT(*) AS count
                    FROM votes v
                INNER JOIN comments c
                    ON c.id = v.comment_id
                WHERE ($1::UUID[] IS NULL OR v.comment_id = ANY($1))
                AND ($2::BOOLEAN IS NULL OR v.is_like = $2)
                AND (NOT $3 OR c.parent_id IS NULL)
                GROUP BY v.comment_id, v.is_like
            ",
        )
        .bind(filter.ids.as_deref().map(ids))
        .bind(filter.polarity)
        .bind(filter.roots_only)
        .fetch_all(&self.pool)
        .await
        .context("grouping votes by comment")?
        .iter()
        .map(|r| -> anyhow::Result<VoteTally> {
            let count: i64 = r.try_get("count").context("retrieving count field")?;
            Ok(VoteTally {
                comment_id: CommentId(
                    r.try_get("comment_id")
                        .context("retrieving comment_id field")?,
                ),
                is_like: r.try_get("is_like").context("retrieving is_like field")?,
                count: u64::try_from(count).context("negative vote count")?,
            })
        })
        .collect()
    }

    async fn find_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<Option<bool>> {
        sqlx::query("SELECT is_like FROM votes WHERE user_id = $1 AND comment_id = $2")
            .bind(user.0)
            .bind(comment.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("querying vote of {user} on {comment}"))?
            .map(|r| r.try_get("is_like"))
            .transpose()
            .context("retrieving is_like field")
    }

    async fn find_votes(
        &self,
        user: UserId,
        ids_: &[CommentId],
    ) -> anyhow::Result<Vec<(CommentId, bool)>> {
        sqlx::query(
            "SELECT comment_id, is_like FROM votes WHERE user_id = $1 AND comment_id = ANY($2)",
        )
        .bind(user.0)
        .bind(ids(ids_))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("querying votes of {user}"))?
        .iter()
        .map(|r| -> anyhow::Result<(CommentId, bool)> {
            Ok((
                CommentId(
                    r.try_get("comment_id")
                        .context("retrieving comment_id field")?,
                ),
                r.try_get("is_like").context("retrieving is_like field")?,
            ))
        })
        .collect()
    }

    async fn create_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<Result<(), VoteConflict>> {
        let res = sqlx::query("INSERT INTO votes (user_id, comment_id, is_like) VALUES ($1, $2, $3)")
            .bind(user.0)
            .bind(comment.0)
            .bind(is_like)
            .execute(&self.pool)
            .await;
        match res {
            Ok(_) => Ok(Ok(())),
            Err(e) if is_db_error(&e, UNIQUE_VIOLATION) => Ok(Err(VoteConflict)),
            Err(e) => Err(e).with_context(|| format!("inserting vote of {user} on {comment}")),
        }
    }

    async fn update_vote(
        &self,
        user: UserId,
        comment: CommentId,
        is_like: bool,
    ) -> anyhow::Result<bool> {
        Ok(
            sqlx::query("UPDATE votes SET is_like = $3 WHERE user_id = $1 AND comment_id = $2")
                .bind(user.0)
                .bind(comment.0)
                .bind(is_like)
                .execute(&self.pool)
                .await
                .with_context(|| format!("updating vote of {user} on {comment}"))?
                .rows_affected()
                > 0,
        )
    }

    async fn delete_vote(&self, user: UserId, comment: CommentId) -> anyhow::Result<bool> {
        Ok(
            sqlx::query("DELETE FROM votes WHERE user_id = $1 AND comment_id = $2")
                .bind(user.0)
                .bind(comment.0)
                .execute(&self.pool)
                .await
                .with_context(|| format!("removing vote of {user} on {comment}"))?
                .rows_affected()
                > 0,
        )
    }
}
