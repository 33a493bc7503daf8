use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::{
    db::user::User,
    error::Error,
    resolver::Segment,
};

const SEARCH_RESULT_CAP: usize = 50;

struct Stamped<T> {
    value: Arc<T>,
    loaded_at: Instant,
}

/// Refresh-ahead cache with a single-flight load: the value is reloaded
/// lazily once older than the TTL, concurrent callers during a load all
/// await the one in-flight loader, and a failed load installs the default
/// value so requests never block on a broken source.
pub struct Refreshing<T> {
    ttl: Duration,
    slot: RwLock<Option<Stamped<T>>>,
    refresh: Mutex<()>,
}

impl<T: Default> Refreshing<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub async fn get_with<F, Fut>(&self, loader: F) -> Arc<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        if let Some(value) = self.fresh().await {
            return value;
        }

        // Single-flight: whoever holds the refresh lock loads; everyone
        // else blocks here and then sees the fresh slot.
        let _guard = self.refresh.lock().await;

        if let Some(value) = self.fresh().await {
            return value;
        }

        let value = match loader().await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("cache load failed, serving empty data: {e}");
                T::default()
            }
        };

        let value = Arc::new(value);
        *self.slot.write().await = Some(Stamped {
            value: Arc::clone(&value),
            loaded_at: Instant::now(),
        });

        value
    }

    async fn fresh(&self) -> Option<Arc<T>> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.value))
    }
}

/// First-character index over usernames and first names. A user appears
/// in every bucket matching either field's first character, but never
/// twice within one bucket.
#[derive(Default)]
pub struct UserIndex {
    buckets: HashMap<char, Vec<User>>,
}

impl UserIndex {
    pub fn build(users: &[User]) -> Self {
        let mut buckets: HashMap<char, Vec<User>> = HashMap::new();

        for user in users {
            let mut keys = [None, None];
            keys[0] = first_char(user.username.as_deref());
            keys[1] = first_char(user.first_name.as_deref());

            if keys[1] == keys[0] {
                keys[1] = None;
            }

            for key in keys.into_iter().flatten() {
                buckets.entry(key).or_default().push(user.clone());
            }
        }

        Self { buckets }
    }

    /// Prefix search over one bucket: O(bucket size), not O(total users).
    /// Results preserve bucket insertion order and are capped.
    pub fn search(&self, query: &str) -> Vec<User> {
        let query = query.strip_prefix('@').unwrap_or(query).to_lowercase();

        let Some(first) = query.chars().next() else {
            return Vec::new();
        };

        let Some(bucket) = self.buckets.get(&first) else {
            return Vec::new();
        };

        bucket
            .iter()
            .filter(|user| {
                starts_with(user.username.as_deref(), &query)
                    || starts_with(user.first_name.as_deref(), &query)
            })
            .take(SEARCH_RESULT_CAP)
            .cloned()
            .collect()
    }
}

fn first_char(value: Option<&str>) -> Option<char> {
    value
        .and_then(|v| v.chars().next())
        .and_then(|c| c.to_lowercase().next())
}

fn starts_with(value: Option<&str>, prefix: &str) -> bool {
    value
        .map(|v| v.to_lowercase().starts_with(prefix))
        .unwrap_or(false)
}

/// Everything one refresh cycle loads. Sub-listings that fail to load
/// come back empty without failing the rest of the snapshot.
#[derive(Default)]
pub struct Snapshot {
    pub index: UserIndex,
    pub streams: HashMap<String, Vec<User>>,
    pub non_course: Vec<User>,
    pub hackathon: Vec<User>,
}

/// In-memory user search and segment listings, refreshed together on a
/// TTL so recipient-selection flows never hit the database per keystroke.
pub struct UserSearchCache {
    db: SqlitePool,
    snapshot: Refreshing<Snapshot>,
}

impl UserSearchCache {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self {
            db,
            snapshot: Refreshing::new(ttl),
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<User>, Error> {
        Ok(self.current().await.index.search(query))
    }

    pub async fn segment(&self, segment: &Segment) -> Result<Vec<User>, Error> {
        let snapshot = self.current().await;

        Ok(match segment {
            Segment::Stream { name } => snapshot.streams.get(name).cloned().unwrap_or_default(),
            Segment::NonCourse => snapshot.non_course.clone(),
            Segment::Hackathon => snapshot.hackathon.clone(),
            Segment::All => {
                let mut conn = match self.db.acquire().await {
                    Ok(conn) => conn,
                    Err(e) => return Err(e.into()),
                };
                User::list_all(&mut conn).await.map_err(Error::from)?
            }
        })
    }

    async fn current(&self) -> Arc<Snapshot> {
        let db = self.db.clone();
        self.snapshot.get_with(|| load_snapshot(db)).await
    }
}

async fn load_snapshot(db: SqlitePool) -> eyre::Result<Snapshot> {
    let mut conn = db.acquire().await?;

    let users = User::list_all(&mut conn).await.unwrap_or_else(|e| {
        tracing::warn!("user index load failed: {e}");
        Vec::new()
    });

    let mut streams = HashMap::new();
    match User::streams(&mut conn).await {
        Ok(names) => {
            for name in names {
                let members = User::by_stream(&mut conn, &name).await.unwrap_or_else(|e| {
                    tracing::warn!(stream = %name, "stream listing load failed: {e}");
                    Vec::new()
                });
                streams.insert(name, members);
            }
        }
        Err(e) => tracing::warn!("stream name load failed: {e}"),
    }

    let non_course = User::non_course(&mut conn).await.unwrap_or_else(|e| {
        tracing::warn!("non-course listing load failed: {e}");
        Vec::new()
    });

    let hackathon = User::hackathon_participants(&mut conn)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("hackathon listing load failed: {e}");
            Vec::new()
        });

    Ok(Snapshot {
        index: UserIndex::build(&users),
        streams,
        non_course,
        hackathon,
    })
}
