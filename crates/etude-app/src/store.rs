//! In-process relational-style store reached through the connection pool.
//!
//! A [`Database`] holds three tables (users, image metadata, blobs). Each
//! pooled connection is a [`Session`] on that database; sessions fail their
//! liveness probe once the database is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use etude_pool::ManageConnection;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is closed")]
    Closed,
    #[error("user {0} already exists")]
    UserExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMeta {
    pub id: u64,
    pub name: String,
    pub content_type: String,
    pub size: usize,
    pub description: String,
}

#[derive(Default)]
struct Tables {
    /// username -> password hash
    users: HashMap<String, String>,
    images: Vec<ImageMeta>,
    blobs: HashMap<u64, Vec<u8>>,
    next_image_id: u64,
}

pub struct Database {
    tables: Mutex<Tables>,
    open: AtomicBool,
    sessions: AtomicU64,
}

impl Database {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_image_id: 1,
                ..Tables::default()
            }),
            open: AtomicBool::new(true),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Takes the database offline; open sessions start failing.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if !self.is_open() {
            return Err(StoreError::Closed);
        }
        Ok(self.tables.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

/// One pooled connection to a [`Database`].
pub struct Session {
    db: Arc<Database>,
    id: u64,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Trivial round trip, the equivalent of `SELECT 1`.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.tables().map(|_| ())
    }

    pub fn create_user(&mut self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let mut t = self.db.tables()?;
        if t.users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        t.users.insert(username.to_string(), password_hash.to_string());
        Ok(())
    }

    pub fn password_hash(&self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self.db.tables()?.users.get(username).cloned())
    }

    pub fn insert_image(
        &mut self,
        name: &str,
        content_type: &str,
        description: &str,
        data: Vec<u8>,
    ) -> Result<ImageMeta, StoreError> {
        let mut t = self.db.tables()?;
        let id = t.next_image_id;
        t.next_image_id += 1;
        let meta = ImageMeta {
            id,
            name: name.to_string(),
            content_type: content_type.to_string(),
            size: data.len(),
            description: description.to_string(),
        };
        t.images.push(meta.clone());
        t.blobs.insert(id, data);
        Ok(meta)
    }

    pub fn list_images(&self) -> Result<Vec<ImageMeta>, StoreError> {
        Ok(self.db.tables()?.images.clone())
    }

    pub fn image(&self, id: u64) -> Result<Option<(ImageMeta, Vec<u8>)>, StoreError> {
        let t = self.db.tables()?;
        let Some(meta) = t.images.iter().find(|m| m.id == id) else {
            return Ok(None);
        };
        Ok(t.blobs.get(&id).map(|data| (meta.clone(), data.clone())))
    }
}

/// Opens [`Session`]s for the pool.
pub struct StoreManager {
    db: Arc<Database>,
}

impl StoreManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ManageConnection for StoreManager {
    type Connection = Session;
    type Error = StoreError;

    fn connect(&self) -> Result<Session, StoreError> {
        if !self.db.is_open() {
            return Err(StoreError::Closed);
        }
        let id = self.db.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Session {
            db: self.db.clone(),
            id,
        })
    }

    fn is_valid(&self, conn: &mut Session) -> Result<(), StoreError> {
        conn.ping()
    }
}
