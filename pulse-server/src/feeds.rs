use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use axum::extract::ws::Message;
use chrono::Utc;
use futures::{channel::mpsc, select, SinkExt, StreamExt};
use pulse_api::{ClientMessage, FeedEvent, FeedMessage, Time, Topic, UserId, Uuid};
use tokio::sync::RwLock;

/// Capability to fan events out to subscribers
///
/// Delivery is fire-and-forget: implementations drop messages for unreachable subscribers
/// and never report failure to the publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: Topic, event: FeedEvent, timestamp: Time);

    /// Sends `event` to the global feed and to the thread it concerns, if any
    async fn publish_event(&self, event: FeedEvent) {
        let timestamp = Utc::now();
        for topic in event.topics() {
            self.publish(topic, event.clone(), timestamp).await;
        }
    }
}

struct Session {
    user: UserId,
    sender: mpsc::UnboundedSender<FeedMessage>,
}

#[derive(Default)]
struct Hub {
    sessions: HashMap<Uuid, Session>,
    topics: HashMap<Topic, HashSet<Uuid>>,
}

impl Hub {
    fn join(&mut self, session: Uuid, topic: Topic) {
        self.topics.entry(topic).or_default().insert(session);
    }

    fn leave(&mut self, session: Uuid, topic: Topic) {
        if let Some(members) = self.topics.get_mut(&topic) {
            members.remove(&session);
            if members.is_empty() {
                self.topics.remove(&topic);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Feeds(Arc<RwLock<Hub>>);

impl Feeds {
    pub fn new() -> Feeds {
        Feeds::default()
    }

    /// Registers a new session for `user`, already joined to the global feed and its private topic
    pub async fn connect(&self, user: UserId) -> (Uuid, mpsc::UnboundedReceiver<FeedMessage>) {
        // Note: if this were bounded, there would be a deadlock between the write-lock to remove a
        // session and the read-lock to send an event to all interested sessions
        let (sender, receiver) = mpsc::unbounded();
        let id = Uuid::new_v4();
        let mut hub = self.0.write().await;
        hub.sessions.insert(id, Session { user, sender });
        hub.join(id, Topic::Comments);
        hub.join(id, Topic::User(user));
        tracing::debug!(session=?id, ?user, "feed session connected");
        (id, receiver)
    }

    /// Returns false if the session is not connected
    pub async fn join(&self, session: Uuid, topic: Topic) -> bool {
        let mut hub = self.0.write().await;
        if !hub.sessions.contains_key(&session) {
            return false;
        }
        hub.join(session, topic);
        tracing::debug!(?session, %topic, "joined topic");
        true
    }

    /// Leaving a topic one is not in is a no-op
    pub async fn leave(&self, session: Uuid, topic: Topic) {
        self.0.write().await.leave(session, topic);
        tracing::debug!(?session, %topic, "left topic");
    }

    pub async fn disconnect(&self, session: Uuid) {
        let mut hub = self.0.write().await;
        if hub.sessions.remove(&session).is_some() {
            hub.topics.retain(|_, members| {
                members.remove(&session);
                !members.is_empty()
            });
            tracing::debug!(?session, "feed session disconnected");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.0.read().await.sessions.len()
    }

    pub async fn topic_size(&self, topic: Topic) -> usize {
        self.0
            .read()
            .await
            .topics
            .get(&topic)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Relays messages between the hub and an authenticated websocket, until either side closes
    pub async fn add_session<W, R>(self, user: UserId, mut write: W, read: R)
    where
        W: 'static + Send + Unpin + futures::Sink<Message>,
        <W as futures::Sink<Message>>::Error: Send,
        R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
    {
        let (session, mut receiver) = self.connect(user).await;

        let this = self.clone();
        let mut read = read.fuse();
        tokio::spawn(async move {
            macro_rules! remove_self {
                () => {{
                    this.disconnect(session).await;
                    return;
                }};
            }
            macro_rules! send_message {
                ( $msg:expr ) => {{
                    let msg: FeedMessage = $msg;
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!(?err, ?msg, "failed serializing message to json");
                            continue;
                        }
                    };
                    if let Err(_) = write.send(Message::Text(json)).await {
                        remove_self!();
                    }
                }};
            }
            loop {
                select! {
                    msg = receiver.next() => match msg {
                        None => remove_self!(),
                        Some(msg) => send_message!(msg),
                    },
                    msg = read.next() => match msg {
                        None => remove_self!(),
                        Some(Ok(Message::Close(_))) => remove_self!(),
                        Some(Ok(Message::Text(msg))) if msg == "ping" => {
                            send_message!(FeedMessage::Pong);
                        }
                        Some(Ok(Message::Text(msg))) => {
                            match serde_json::from_str::<ClientMessage>(&msg) {
                                Ok(ClientMessage::Join(c)) => {
                                    this.join(session, Topic::Thread(c)).await;
                                    send_message!(FeedMessage::Joined(Topic::Thread(c)));
                                }
                                Ok(ClientMessage::Leave(c)) => {
                                    this.leave(session, Topic::Thread(c)).await;
                                    send_message!(FeedMessage::Left(Topic::Thread(c)));
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "received unexpected message from client: {msg:?}");
                                    remove_self!();
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => (),
                        Some(msg) => {
                            tracing::warn!("received unexpected message from client: {msg:?}");
                            remove_self!();
                        }
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Publisher for Feeds {
    async fn publish(&self, topic: Topic, event: FeedEvent, timestamp: Time) {
        let hub = self.0.read().await;
        let Some(members) = hub.topics.get(&topic) else {
            return;
        };
        let mut delivered = 0;
        for id in members {
            if let Some(s) = hub.sessions.get(id) {
                // Closed sessions get cleaned up by their relay loop
                if s.sender
                    .unbounded_send(FeedMessage::Event {
                        topic,
                        event: event.clone(),
                        timestamp,
                    })
                    .is_ok()
                {
                    delivered += 1;
                } else {
                    tracing::debug!(session=?id, user=?s.user, "dropping event for closed session");
                }
            }
        }
        tracing::debug!(%topic, delivered, "published event");
    }
}
