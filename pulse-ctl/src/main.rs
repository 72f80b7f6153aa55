use anyhow::Context;
use pulse_api::{
    AuthToken, Comment, CommentId, CommentPage, CommentUpdate, DeletionResult, ListQuery,
    NewComment, SortBy, Uuid, VoteCounts, VoteResult,
};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// List a page of top-level comments
    List {
        #[structopt(long)]
        page: Option<u64>,

        #[structopt(long)]
        limit: Option<u64>,

        /// One of newest, oldest, likes, dislikes
        #[structopt(long, parse(try_from_str = parse_sort))]
        sort: Option<SortBy>,

        #[structopt(long)]
        max_depth: Option<u32>,
    },

    /// Show a comment and its replies
    Show {
        id: Uuid,

        #[structopt(long)]
        max_depth: Option<u32>,
    },

    /// Post a comment, or a reply with --parent
    Post {
        content: String,

        #[structopt(long)]
        parent: Option<Uuid>,
    },

    /// Replace the content of a comment
    Edit { id: Uuid, content: String },

    /// Delete a comment
    Delete { id: Uuid },

    /// Toggle a like on a comment
    Like { id: Uuid },

    /// Toggle a dislike on a comment
    Dislike { id: Uuid },

    /// Show the vote counts of a comment
    Votes { id: Uuid },
}

fn parse_sort(s: &str) -> anyhow::Result<SortBy> {
    serde_json::from_value(serde_json::Value::String(String::from(s)))
        .with_context(|| format!("unknown sort order {s:?}"))
}

fn token() -> anyhow::Result<Option<AuthToken>> {
    match std::env::var("PULSE_TOKEN") {
        Err(std::env::VarError::NotPresent) => Ok(None),
        tok => {
            let tok = tok.context("retrieving PULSE_TOKEN environment variable")?;
            let tok = Uuid::try_parse(&tok).context("parsing PULSE_TOKEN as an auth token")?;
            Ok(Some(AuthToken(tok)))
        }
    }
}

struct Client {
    host: String,
    token: Option<AuthToken>,
    client: reqwest::Client,
}

impl Client {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.host, path));
        match &self.token {
            Some(tok) => req.bearer_auth(tok.0),
            None => req,
        }
    }

    fn authed(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        anyhow::ensure!(
            self.token.is_some(),
            "this command needs a session token in PULSE_TOKEN"
        );
        Ok(self.request(method, path))
    }
}

async fn send<T: serde::de::DeserializeOwned>(req: reqwest::RequestBuilder) -> anyhow::Result<T> {
    let resp = req.send().await.context("sending request")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.bytes().await.context("reading error body")?;
        let err = pulse_api::Error::parse(&body)
            .with_context(|| format!("server answered with status {status}"))?;
        return Err(err.into());
    }
    resp.json().await.context("parsing response")
}

fn print_tree(c: &Comment, indent: usize) {
    let deleted = if c.is_deleted { " [deleted]" } else { "" };
    println!(
        "{:indent$}{} {} (+{} -{}, {} replies){deleted}",
        "",
        c.id.0,
        c.author.name,
        c.count.likes,
        c.count.dislikes,
        c.count.replies,
    );
    for line in c.content.lines() {
        println!("{:indent$}  {line}", "");
    }
    for r in c.replies.iter() {
        print_tree(r, indent + 4);
    }
    if c.has_more_replies {
        println!("{:indent$}    ...", "");
    }
}

fn print_votes(v: &VoteCounts) {
    println!("{} likes, {} dislikes", v.likes, v.dislikes);
}

async fn vote(client: &Client, id: Uuid, action: &str) -> anyhow::Result<()> {
    let res: VoteResult = send(client.authed(
        reqwest::Method::POST,
        &format!("/api/comments/{id}/{action}"),
    )?)
    .await?;
    println!("{:?}", res.action);
    print_votes(&res.vote_counts);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = Client {
        host: opt.host,
        token: token()?,
        client: reqwest::Client::new(),
    };

    match opt.cmd {
        Command::List {
            page,
            limit,
            sort,
            max_depth,
        } => {
            let query = ListQuery {
                page,
                limit,
                sort_by: sort,
                max_depth,
            };
            let page: CommentPage =
                send(client.request(reqwest::Method::GET, "/api/comments").query(&query)).await?;
            for c in page.comments.iter() {
                print_tree(c, 0);
            }
            let p = page.pagination;
            println!(
                "page {}/{} ({} comments)",
                p.current_page, p.total_pages, p.total_comments
            );
        }
        Command::Show { id, max_depth } => {
            let mut req = client.request(reqwest::Method::GET, &format!("/api/comments/{id}"));
            if let Some(d) = max_depth {
                req = req.query(&[("maxDepth", d)]);
            }
            let c: Comment = send(req).await?;
            print_tree(&c, 0);
        }
        Command::Post { content, parent } => {
            let c: Comment = send(
                client
                    .authed(reqwest::Method::POST, "/api/comments")?
                    .json(&NewComment {
                        content,
                        parent_id: parent.map(CommentId),
                    }),
            )
            .await?;
            println!("{}", c.id.0);
        }
        Command::Edit { id, content } => {
            let c: Comment = send(
                client
                    .authed(reqwest::Method::PUT, &format!("/api/comments/{id}"))?
                    .json(&CommentUpdate { content }),
            )
            .await?;
            print_tree(&c, 0);
        }
        Command::Delete { id } => {
            let res: DeletionResult = send(
                client.authed(reqwest::Method::DELETE, &format!("/api/comments/{id}"))?,
            )
            .await?;
            if res.hard_delete {
                println!("deleted {}", res.id.0);
            } else {
                println!("{} replaced with a tombstone", res.id.0);
            }
        }
        Command::Like { id } => vote(&client, id, "like").await?,
        Command::Dislike { id } => vote(&client, id, "dislike").await?,
        Command::Votes { id } => {
            let v: VoteCounts = send(
                client.request(reqwest::Method::GET, &format!("/api/comments/{id}/votes")),
            )
            .await?;
            print_votes(&v);
        }
    }

    Ok(())
}
