//! In-memory doubles for the pipeline's external dependencies
//!
//! Each double implements the same trait as its production counterpart and
//! mimics the backend semantics the pipeline relies on: the cache keeps an
//! ordered set per user with cap enforcement and key-level existence, the
//! stream keeps per-consumer pending lists with reclaim, the store applies
//! soft-delete filtering and tuple-cursor pagination.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use photofeed::cache::{CacheError, CacheResult, FeedCache};
use photofeed::config::{FeedConfig, FollowConfig};
use photofeed::db::{FollowStore, PostStore, UserStore};
use photofeed::error::{ServiceError, ServiceResult};
use photofeed::models::{FeedEntry, Post, PostMedia, PostScore, User};
use photofeed::services::{FeedService, FollowService, PostService};
use photofeed::stream::{
    EventConsumer, EventPublisher, FeedEvent, ReconcileHook, StreamError, StreamMessage,
    StreamResult, GROUP_FEED_WORKERS, STREAM_FEED,
};
use photofeed::workers::EventHandler;

fn injected_redis_error(message: &'static str) -> StreamError {
    StreamError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, message)))
}

// ---------------------------------------------------------------------------
// Feed cache double
// ---------------------------------------------------------------------------

pub struct MemoryFeedCache {
    cap: usize,
    feeds: Mutex<HashMap<i64, HashMap<i64, i64>>>,
    fail: AtomicBool,
}

impl MemoryFeedCache {
    pub fn new() -> Self {
        Self::with_cap(500)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            feeds: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every cache operation fail, simulating an outage.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CacheError::InvalidData("injected cache failure".into()))
        } else {
            Ok(())
        }
    }

    fn trim(cap: usize, feed: &mut HashMap<i64, i64>) {
        while feed.len() > cap {
            // Lowest score first, ties by lowest id, like rank-based trim
            let evict = feed
                .iter()
                .map(|(post_id, score)| (*score, *post_id))
                .min()
                .map(|(_, post_id)| post_id);
            match evict {
                Some(post_id) => {
                    feed.remove(&post_id);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl FeedCache for MemoryFeedCache {
    async fn add_post(&self, user_id: i64, post_id: i64, timestamp: i64) -> CacheResult<()> {
        self.check_available()?;
        let mut feeds = self.feeds.lock().unwrap();
        let feed = feeds.entry(user_id).or_default();
        feed.insert(post_id, timestamp);
        Self::trim(self.cap, feed);
        Ok(())
    }

    async fn remove_post(&self, user_id: i64, post_id: i64) -> CacheResult<()> {
        self.check_available()?;
        let mut feeds = self.feeds.lock().unwrap();
        if let Some(feed) = feeds.get_mut(&user_id) {
            feed.remove(&post_id);
            // Removing the last member removes the key, like the real store
            if feed.is_empty() {
                feeds.remove(&user_id);
            }
        }
        Ok(())
    }

    async fn get_feed(
        &self,
        user_id: i64,
        cursor_score: Option<f64>,
        limit: usize,
    ) -> CacheResult<Vec<FeedEntry>> {
        self.check_available()?;
        let feeds = self.feeds.lock().unwrap();
        let mut entries: Vec<FeedEntry> = feeds
            .get(&user_id)
            .map(|feed| {
                feed.iter()
                    .map(|(post_id, score)| FeedEntry {
                        post_id: *post_id,
                        score: *score,
                    })
                    .filter(|e| match cursor_score {
                        Some(cursor) => (e.score as f64) < cursor,
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default();

        entries.sort_by(|a, b| b.score.cmp(&a.score).then(b.post_id.cmp(&a.post_id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_score(&self, user_id: i64, post_id: i64) -> CacheResult<Option<i64>> {
        self.check_available()?;
        let feeds = self.feeds.lock().unwrap();
        Ok(feeds.get(&user_id).and_then(|feed| feed.get(&post_id)).copied())
    }

    async fn warm(&self, user_id: i64, posts: &[PostScore]) -> CacheResult<()> {
        self.check_available()?;
        if posts.is_empty() {
            return Ok(());
        }
        let mut feeds = self.feeds.lock().unwrap();
        let feed = feeds.entry(user_id).or_default();
        for post in posts {
            feed.insert(post.post_id, post.timestamp);
        }
        Self::trim(self.cap, feed);
        Ok(())
    }

    async fn size(&self, user_id: i64) -> CacheResult<i64> {
        self.check_available()?;
        let feeds = self.feeds.lock().unwrap();
        Ok(feeds.get(&user_id).map(|feed| feed.len() as i64).unwrap_or(0))
    }

    async fn exists(&self, user_id: i64) -> CacheResult<bool> {
        self.check_available()?;
        let feeds = self.feeds.lock().unwrap();
        Ok(feeds.contains_key(&user_id))
    }
}

// ---------------------------------------------------------------------------
// Stream double
// ---------------------------------------------------------------------------

struct StoredEntry {
    id: String,
    payload: String,
}

struct PendingMsg {
    id: String,
    entry_index: usize,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    next_index: usize,
    pending: HashMap<String, Vec<PendingMsg>>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

pub struct MemoryStream {
    state: Mutex<StreamState>,
    fail_publish: AtomicBool,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
            fail_publish: AtomicBool::new(false),
        }
    }

    /// Make publishing fail, simulating a stream outage after commit.
    pub fn set_publish_failing(&self, failing: bool) {
        self.fail_publish.store(failing, Ordering::SeqCst);
    }

    /// Append a raw payload that will not decode as an event.
    pub fn publish_raw(&self, payload: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push(StoredEntry {
            id: id.clone(),
            payload: payload.to_string(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Decoded copies of everything in the log, in append order.
    pub fn events(&self) -> Vec<FeedEvent> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter_map(|e| serde_json::from_str(&e.payload).ok())
            .collect()
    }

    fn group_key(stream: &str, group: &str) -> String {
        format!("{stream}/{group}")
    }

    fn decode(entry: &StoredEntry) -> StreamMessage {
        StreamMessage {
            id: entry.id.clone(),
            event: serde_json::from_str(&entry.payload).ok(),
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryStream {
    async fn publish(&self, _stream: &str, event: &FeedEvent) -> StreamResult<String> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(injected_redis_error("injected publish failure"));
        }
        let payload = serde_json::to_string(event)?;
        Ok(self.publish_raw(&payload))
    }
}

#[async_trait]
impl EventConsumer for MemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .groups
            .entry(Self::group_key(stream, group))
            .or_default();
        Ok(())
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamMessage>> {
        for attempt in 0..2 {
            {
                let mut state = self.state.lock().unwrap();
                let total = state.entries.len();
                let key = Self::group_key(stream, group);

                let (start, end) = {
                    let group_state = state
                        .groups
                        .get_mut(&key)
                        .ok_or_else(|| injected_redis_error("NOGROUP no such consumer group"))?;
                    let start = group_state.next_index;
                    let end = (start + count).min(total);
                    group_state.next_index = end;
                    (start, end)
                };

                if start < end {
                    let messages: Vec<StreamMessage> =
                        state.entries[start..end].iter().map(Self::decode).collect();

                    let now = Instant::now();
                    let group_state = state.groups.get_mut(&key).expect("group exists");
                    let pending = group_state.pending.entry(consumer.to_string()).or_default();
                    for (offset, message) in messages.iter().enumerate() {
                        pending.push(PendingMsg {
                            id: message.id.clone(),
                            entry_index: start + offset,
                            delivered_at: now,
                        });
                    }
                    return Ok(messages);
                }
            }

            if attempt == 0 && !block.is_zero() {
                tokio::time::sleep(block.min(Duration::from_millis(20))).await;
            } else {
                break;
            }
        }
        Ok(Vec::new())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let state = self.state.lock().unwrap();
        let key = Self::group_key(stream, group);
        let Some(group_state) = state.groups.get(&key) else {
            return Ok(Vec::new());
        };
        let Some(pending) = group_state.pending.get(consumer) else {
            return Ok(Vec::new());
        };

        Ok(pending
            .iter()
            .take(count)
            .map(|p| Self::decode(&state.entries[p.entry_index]))
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<i64> {
        let mut state = self.state.lock().unwrap();
        let key = Self::group_key(stream, group);
        let Some(group_state) = state.groups.get_mut(&key) else {
            return Ok(0);
        };

        let to_ack: HashSet<&String> = ids.iter().collect();
        let mut acked = 0;
        for pending in group_state.pending.values_mut() {
            let before = pending.len();
            pending.retain(|p| !to_ack.contains(&p.id));
            acked += (before - pending.len()) as i64;
        }
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StreamResult<i64> {
        let state = self.state.lock().unwrap();
        let key = Self::group_key(stream, group);
        Ok(state
            .groups
            .get(&key)
            .map(|g| g.pending.values().map(|p| p.len() as i64).sum())
            .unwrap_or(0))
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut state = self.state.lock().unwrap();
        let key = Self::group_key(stream, group);

        let indices: Vec<usize> = {
            let Some(group_state) = state.groups.get_mut(&key) else {
                return Ok(Vec::new());
            };

            let mut claimed: Vec<PendingMsg> = Vec::new();
            for (owner, pending) in group_state.pending.iter_mut() {
                if owner == consumer {
                    continue;
                }
                let mut keep = Vec::new();
                for msg in pending.drain(..) {
                    if claimed.len() < count && msg.delivered_at.elapsed() >= min_idle {
                        claimed.push(msg);
                    } else {
                        keep.push(msg);
                    }
                }
                *pending = keep;
            }

            let indices: Vec<usize> = claimed.iter().map(|m| m.entry_index).collect();
            let mine = group_state.pending.entry(consumer.to_string()).or_default();
            for mut msg in claimed {
                msg.delivered_at = Instant::now();
                mine.push(msg);
            }
            indices
        };

        Ok(indices
            .into_iter()
            .map(|index| Self::decode(&state.entries[index]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Primary-store double
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StoredPost {
    id: i64,
    user_id: i64,
    caption: Option<String>,
    like_count: i32,
    created_at_ts: i64,
    deleted: bool,
}

struct DbState {
    now_ts: i64,
    next_post_id: i64,
    posts: BTreeMap<i64, StoredPost>,
    media: HashMap<i64, Vec<PostMedia>>,
    next_media_id: i64,
    likes: HashSet<(i64, i64)>,
    follows: HashSet<(i64, i64)>,
    users: HashMap<i64, User>,
}

pub struct MemoryDb {
    state: Mutex<DbState>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DbState {
                now_ts: 1_700_000_000,
                next_post_id: 1,
                posts: BTreeMap::new(),
                media: HashMap::new(),
                next_media_id: 1,
                likes: HashSet::new(),
                follows: HashSet::new(),
                users: HashMap::new(),
            }),
        }
    }

    /// Clock used for rows created through the store.
    pub fn set_now(&self, ts: i64) {
        self.state.lock().unwrap().now_ts = ts;
    }

    /// Next id handed out by the store.
    pub fn set_next_post_id(&self, id: i64) {
        self.state.lock().unwrap().next_post_id = id;
    }

    pub fn add_user(&self, id: i64, username: &str) {
        self.state.lock().unwrap().users.insert(
            id,
            User {
                id,
                username: username.to_string(),
                display_name: None,
                avatar_url: None,
                follower_count: 0,
                following_count: 0,
                post_count: 0,
            },
        );
    }

    /// Seed a follow edge without going through the service (no event).
    pub fn add_follow(&self, follower_id: i64, followee_id: i64) {
        self.state.lock().unwrap().follows.insert((follower_id, followee_id));
    }

    /// Seed a post row directly with an explicit id and timestamp.
    pub fn insert_post(&self, id: i64, user_id: i64, ts: i64) {
        let mut state = self.state.lock().unwrap();
        state.posts.insert(
            id,
            StoredPost {
                id,
                user_id,
                caption: None,
                like_count: 0,
                created_at_ts: ts,
                deleted: false,
            },
        );
        state.next_post_id = state.next_post_id.max(id + 1);
    }

    pub fn user(&self, id: i64) -> Option<User> {
        self.state.lock().unwrap().users.get(&id).cloned()
    }

    fn to_post(stored: &StoredPost) -> Post {
        let created_at: DateTime<Utc> =
            DateTime::from_timestamp(stored.created_at_ts, 0).expect("valid test timestamp");
        Post {
            id: stored.id,
            user_id: stored.user_id,
            caption: stored.caption.clone(),
            like_count: stored.like_count,
            comment_count: 0,
            created_at,
            updated_at: created_at,
            deleted_at: stored.deleted.then_some(created_at),
            media: Vec::new(),
            author: None,
            is_liked: false,
        }
    }

    fn scores_desc(state: &DbState, filter: impl Fn(&StoredPost) -> bool) -> Vec<PostScore> {
        let mut scores: Vec<PostScore> = state
            .posts
            .values()
            .filter(|p| !p.deleted && filter(p))
            .map(|p| PostScore {
                post_id: p.id,
                timestamp: p.created_at_ts,
            })
            .collect();
        scores.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.post_id.cmp(&a.post_id)));
        scores
    }
}

#[async_trait]
impl PostStore for MemoryDb {
    async fn create(
        &self,
        author_id: i64,
        caption: Option<&str>,
        media_urls: &[String],
    ) -> ServiceResult<Post> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_post_id;
        state.next_post_id += 1;

        let stored = StoredPost {
            id,
            user_id: author_id,
            caption: caption.map(|c| c.to_string()),
            like_count: 0,
            created_at_ts: state.now_ts,
            deleted: false,
        };
        state.posts.insert(id, stored.clone());

        let mut media = Vec::new();
        for (position, url) in media_urls.iter().enumerate() {
            let media_id = state.next_media_id;
            state.next_media_id += 1;
            media.push(PostMedia {
                id: media_id,
                post_id: id,
                media_url: url.clone(),
                media_type: "image".to_string(),
                position: position as i32,
            });
        }
        state.media.insert(id, media.clone());

        if let Some(user) = state.users.get_mut(&author_id) {
            user.post_count += 1;
        }

        let mut post = Self::to_post(&stored);
        post.media = media;
        Ok(post)
    }

    async fn soft_delete(&self, post_id: i64, caller_id: i64) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.posts.get(&post_id) {
            Some(post) if !post.deleted && post.user_id == caller_id => {}
            Some(post) if !post.deleted => {
                return Err(ServiceError::Forbidden(format!(
                    "post {post_id} is not owned by user {caller_id}"
                )))
            }
            _ => return Err(ServiceError::NotFound(format!("post {post_id}"))),
        }

        state.posts.get_mut(&post_id).expect("checked above").deleted = true;
        if let Some(user) = state.users.get_mut(&caller_id) {
            user.post_count -= 1;
        }
        Ok(())
    }

    async fn get_by_id(&self, post_id: i64) -> ServiceResult<Post> {
        let state = self.state.lock().unwrap();
        state
            .posts
            .get(&post_id)
            .filter(|p| !p.deleted)
            .map(|p| {
                let mut post = Self::to_post(p);
                post.media = state.media.get(&post_id).cloned().unwrap_or_default();
                post
            })
            .ok_or_else(|| ServiceError::NotFound(format!("post {post_id}")))
    }

    async fn get_by_ids(&self, post_ids: &[i64]) -> ServiceResult<Vec<Post>> {
        let state = self.state.lock().unwrap();
        Ok(post_ids
            .iter()
            .filter_map(|id| state.posts.get(id))
            .filter(|p| !p.deleted)
            .map(|p| {
                let mut post = Self::to_post(p);
                post.media = state.media.get(&p.id).cloned().unwrap_or_default();
                post
            })
            .collect())
    }

    async fn recent_post_scores(&self, user_id: i64, limit: usize) -> ServiceResult<Vec<PostScore>> {
        let state = self.state.lock().unwrap();
        let mut scores = Self::scores_desc(&state, |p| p.user_id == user_id);
        scores.truncate(limit);
        Ok(scores)
    }

    async fn feed_post_scores(
        &self,
        author_ids: &[i64],
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        let authors: HashSet<i64> = author_ids.iter().copied().collect();
        let state = self.state.lock().unwrap();
        let mut scores = Self::scores_desc(&state, |p| authors.contains(&p.user_id));
        scores.truncate(limit);
        Ok(scores)
    }

    async fn fallback_page(
        &self,
        author_ids: &[i64],
        cursor: Option<(DateTime<Utc>, i64)>,
        limit: usize,
    ) -> ServiceResult<Vec<PostScore>> {
        let authors: HashSet<i64> = author_ids.iter().copied().collect();
        let state = self.state.lock().unwrap();
        let mut scores = Self::scores_desc(&state, |p| authors.contains(&p.user_id));

        if let Some((cursor_ts, cursor_id)) = cursor {
            let cursor_ts = cursor_ts.timestamp();
            scores.retain(|s| (s.timestamp, s.post_id) < (cursor_ts, cursor_id));
        }
        scores.truncate(limit);
        Ok(scores)
    }

    async fn check_likes(
        &self,
        viewer_id: i64,
        post_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>> {
        let state = self.state.lock().unwrap();
        Ok(post_ids
            .iter()
            .map(|id| (*id, state.likes.contains(&(*id, viewer_id))))
            .collect())
    }

    async fn like(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.posts.get(&post_id).map(|p| !p.deleted).unwrap_or(false) {
            return Err(ServiceError::NotFound(format!("post {post_id}")));
        }
        if !state.likes.insert((post_id, user_id)) {
            return Err(ServiceError::Conflict(format!(
                "user {user_id} already liked post {post_id}"
            )));
        }
        state.posts.get_mut(&post_id).expect("checked above").like_count += 1;
        Ok(())
    }

    async fn unlike(&self, post_id: i64, user_id: i64) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.likes.remove(&(post_id, user_id)) {
            return Err(ServiceError::NotFound(format!(
                "like by user {user_id} on post {post_id}"
            )));
        }
        if let Some(post) = state.posts.get_mut(&post_id) {
            post.like_count -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl FollowStore for MemoryDb {
    async fn create(&self, follower_id: i64, followee_id: i64) -> ServiceResult<bool> {
        let mut state = self.state.lock().unwrap();
        if !state.follows.insert((follower_id, followee_id)) {
            return Ok(false);
        }
        if let Some(followee) = state.users.get_mut(&followee_id) {
            followee.follower_count += 1;
        }
        if let Some(follower) = state.users.get_mut(&follower_id) {
            follower.following_count += 1;
        }
        Ok(true)
    }

    async fn delete(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.follows.remove(&(follower_id, followee_id)) {
            return Err(ServiceError::NotFound(format!(
                "follow edge {follower_id} -> {followee_id}"
            )));
        }
        if let Some(followee) = state.users.get_mut(&followee_id) {
            followee.follower_count -= 1;
        }
        if let Some(follower) = state.users.get_mut(&follower_id) {
            follower.following_count -= 1;
        }
        Ok(())
    }

    async fn follower_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .follows
            .iter()
            .filter(|(_, followee)| *followee == user_id)
            .map(|(follower, _)| *follower)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn followee_ids(&self, user_id: i64) -> ServiceResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .follows
            .iter()
            .filter(|(follower, _)| *follower == user_id)
            .map(|(_, followee)| *followee)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn check_follows(
        &self,
        viewer_id: i64,
        followee_ids: &[i64],
    ) -> ServiceResult<HashMap<i64, bool>> {
        let state = self.state.lock().unwrap();
        Ok(followee_ids
            .iter()
            .map(|id| (*id, state.follows.contains(&(viewer_id, *id))))
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryDb {
    async fn get_by_id(&self, user_id: i64) -> ServiceResult<User> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("user {user_id}")))
    }

    async fn get_by_ids(&self, user_ids: &[i64]) -> ServiceResult<Vec<User>> {
        let state = self.state.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.users.get(id).cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation hook double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CapturingReconcileHook {
    events: Mutex<Vec<FeedEvent>>,
}

impl CapturingReconcileHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> Vec<FeedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ReconcileHook for CapturingReconcileHook {
    fn on_publish_failure(&self, event: &FeedEvent, _error: &StreamError) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Wired environment
// ---------------------------------------------------------------------------

pub struct TestEnv {
    pub cache: Arc<MemoryFeedCache>,
    pub stream: Arc<MemoryStream>,
    pub db: Arc<MemoryDb>,
    pub feed: FeedService,
    pub posts: PostService,
    pub follows: FollowService,
    pub handler: Arc<EventHandler>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_cache(Arc::new(MemoryFeedCache::new())).await
    }

    pub async fn with_cache(cache: Arc<MemoryFeedCache>) -> Self {
        let stream = Arc::new(MemoryStream::new());
        let db = Arc::new(MemoryDb::new());

        let feed_cache: Arc<dyn FeedCache> = cache.clone();
        let post_store: Arc<dyn PostStore> = db.clone();
        let follow_store: Arc<dyn FollowStore> = db.clone();
        let user_store: Arc<dyn UserStore> = db.clone();
        let publisher: Arc<dyn EventPublisher> = stream.clone();
        let consumer: Arc<dyn EventConsumer> = stream.clone();

        let feed = FeedService::new(
            feed_cache.clone(),
            post_store.clone(),
            follow_store.clone(),
            user_store.clone(),
            FeedConfig::default(),
        );
        let posts = PostService::new(post_store.clone(), user_store.clone(), publisher.clone());
        let follows = FollowService::new(follow_store.clone(), user_store.clone(), publisher);

        let handler = Arc::new(EventHandler::new(
            feed_cache,
            post_store,
            follow_store,
            FollowConfig::default(),
        ));

        consumer
            .ensure_group(STREAM_FEED, GROUP_FEED_WORKERS)
            .await
            .expect("group creation");

        Self {
            cache,
            stream,
            db,
            feed,
            posts,
            follows,
            handler,
        }
    }

    /// Consume everything currently in the stream the way a worker would:
    /// read, handle, ack (malformed messages get acked too).
    pub async fn drain(&self) {
        let consumer: Arc<dyn EventConsumer> = self.stream.clone();
        loop {
            let messages = consumer
                .read(
                    STREAM_FEED,
                    GROUP_FEED_WORKERS,
                    "worker-1",
                    10,
                    Duration::ZERO,
                )
                .await
                .expect("stream read");
            if messages.is_empty() {
                return;
            }

            let mut ack_ids = Vec::new();
            for message in &messages {
                match &message.event {
                    None => ack_ids.push(message.id.clone()),
                    Some(event) => {
                        if self.handler.handle(event).await.is_ok() {
                            ack_ids.push(message.id.clone());
                        }
                    }
                }
            }
            consumer
                .ack(STREAM_FEED, GROUP_FEED_WORKERS, &ack_ids)
                .await
                .expect("ack");
        }
    }
}
