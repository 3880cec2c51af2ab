//! Credential and image-upload demo served by etude-core.
//!
//! Handlers run on pool workers and reach the store through a shared
//! [`Pool<StoreManager>`]; an acquire timeout becomes a 503.

pub mod error;
pub mod password;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use etude_core::{Handler, Request, Response, Router};
use etude_pool::{Pool, PooledConnection};
use serde_json::json;
use tracing::info;

pub use error::{AppError, AppResult};
pub use store::{Database, ImageMeta, Session, StoreError, StoreManager};

/// Shared application state captured by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool<StoreManager>>,
    pub acquire_timeout: Duration,
}

impl AppState {
    pub fn new(pool: Arc<Pool<StoreManager>>, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    fn session(&self) -> AppResult<PooledConnection<'_, StoreManager>> {
        Ok(self.pool.acquire(self.acquire_timeout)?)
    }
}

fn handler<F>(state: &AppState, f: F) -> impl Handler
where
    F: Fn(&AppState, &Request) -> AppResult<Response> + Send + Sync + 'static,
{
    let state = state.clone();
    move |req: &Request| f(&state, req).unwrap_or_else(AppError::into_response)
}

/// Builds the application's routing table.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    router
        .get("/", |_: &Request| Response::ok("Hello, World!"))
        .get("/register", |_: &Request| Response::ok("Please use POST to register"))
        .get("/login", |_: &Request| Response::ok("Please use POST to login"))
        .post("/register", handler(&state, register))
        .post("/login", handler(&state, login))
        .post("/upload", handler(&state, upload))
        .get("/images", handler(&state, list_images))
        .get("/image", handler(&state, get_image))
        .get("/health", handler(&state, health));
    router
}

fn credentials(req: &Request) -> AppResult<(String, String)> {
    let mut form = req.parse_form_body();
    let username = form.remove("username").unwrap_or_default();
    let password = form.remove("password").unwrap_or_default();
    let username = username.trim().to_string();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::BadRequest("Missing username or password"));
    }
    Ok((username, password))
}

fn register(state: &AppState, req: &Request) -> AppResult<Response> {
    let (username, password) = credentials(req)?;
    let hash = password::hash_password(&password)?;
    state.session()?.create_user(&username, &hash)?;
    info!(%username, "user registered");
    Ok(Response::ok("Register Success!"))
}

fn login(state: &AppState, req: &Request) -> AppResult<Response> {
    let (username, password) = credentials(req)?;
    // release the connection before the slow hash check
    let stored = state.session()?.password_hash(&username)?;
    let Some(hash) = stored else {
        return Err(AppError::Unauthorized);
    };
    if password::verify_password(&password, &hash)? {
        Ok(Response::ok("Login Success!"))
    } else {
        Err(AppError::Unauthorized)
    }
}

fn upload(state: &AppState, req: &Request) -> AppResult<Response> {
    let file = req
        .file("image")
        .ok_or(AppError::BadRequest("Missing image file"))?;
    if file.data.is_empty() {
        return Err(AppError::BadRequest("Empty image file"));
    }

    let raw_name = file.filename.as_deref().unwrap_or("upload");
    let name = raw_name.rsplit(['/', '\\']).next().unwrap_or(raw_name);
    let content_type = file
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    let description = req.form_field("description").unwrap_or("");

    let meta = state
        .session()?
        .insert_image(name, content_type, description, file.data.clone())?;
    info!(id = meta.id, name = %meta.name, size = meta.size, "image uploaded");

    let body = serde_json::to_vec(&json!({
        "id": meta.id,
        "name": meta.name,
        "size": meta.size,
    }))?;
    Ok(Response {
        status: 201,
        ..Response::json(body)
    })
}

fn list_images(state: &AppState, _: &Request) -> AppResult<Response> {
    let images = state.session()?.list_images()?;
    Ok(Response::json(serde_json::to_vec(&images)?))
}

fn get_image(state: &AppState, req: &Request) -> AppResult<Response> {
    let id = req
        .parse_query()
        .get("id")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(AppError::BadRequest("Missing or invalid id"))?;
    let (meta, data) = state.session()?.image(id)?.ok_or(AppError::NotFound)?;
    Ok(Response::new(200)
        .with_header("Content-Type", meta.content_type)
        .with_body(data))
}

fn health(state: &AppState, _: &Request) -> AppResult<Response> {
    state
        .session()?
        .ping()
        .map_err(|e| AppError::Unavailable(etude_pool::PoolError::Backend(e)))?;
    Ok(Response::ok("OK"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etude_core::{Headers, Method, Part};
    use etude_pool::PoolConfig;

    fn state(max: usize) -> (Arc<Database>, AppState) {
        let db = Arc::new(Database::new());
        let pool = Pool::new(
            StoreManager::new(db.clone()),
            PoolConfig {
                min: 0,
                max,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        (db, AppState::new(Arc::new(pool), Duration::from_millis(50)))
    }

    fn form(path: &str, body: &str) -> Request {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/x-www-form-urlencoded");
        Request {
            method: Method::Post,
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: body.as_bytes().to_vec(),
            ..Request::default()
        }
    }

    fn get(path: &str, query: &str) -> Request {
        Request {
            method: Method::Get,
            path: path.to_string(),
            query: query.to_string(),
            version: "HTTP/1.1".to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn test_register_then_login() {
        let (_db, state) = state(2);
        let router = build_router(state);

        let res = router.route(&form("/register", "username=alice&password=s3cret"));
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"Register Success!");

        let res = router.route(&form("/register", "username=alice&password=other"));
        assert_eq!(res.status, 400);

        let res = router.route(&form("/login", "username=alice&password=s3cret"));
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"Login Success!");

        let res = router.route(&form("/login", "username=alice&password=wrong"));
        assert_eq!(res.status, 401);
        let res = router.route(&form("/login", "username=nobody&password=x"));
        assert_eq!(res.status, 401);
    }

    #[test]
    fn test_register_requires_fields() {
        let (_db, state) = state(1);
        let router = build_router(state);
        assert_eq!(router.route(&form("/register", "username=&password=x")).status, 400);
        assert_eq!(router.route(&form("/register", "username=bob")).status, 400);
    }

    #[test]
    fn test_pool_timeout_is_503() {
        let (_db, state) = state(1);
        let held = state.pool.acquire(Duration::from_millis(10)).unwrap();
        let router = build_router(state.clone());
        let res = router.route(&form("/register", "username=dave&password=pw"));
        assert_eq!(res.status, 503);
        assert_eq!(router.route(&get("/health", "")).status, 503);
        drop(held);
        assert_eq!(router.route(&get("/health", "")).status, 200);
    }

    #[test]
    fn test_upload_and_fetch() {
        let (_db, state) = state(2);
        let router = build_router(state);

        let mut req = get("/upload", "");
        req.method = Method::Post;
        req.parts = vec![
            Part {
                name: Some("description".into()),
                filename: None,
                content_type: None,
                data: b"a cat".to_vec(),
            },
            Part {
                name: Some("image".into()),
                filename: Some("../../cat.png".into()),
                content_type: Some("image/png".into()),
                data: vec![0x89, b'P', b'N', b'G'],
            },
        ];
        let res = router.route(&req);
        assert_eq!(res.status, 201);
        let v: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(v["id"], 1);
        assert_eq!(v["name"], "cat.png");
        assert_eq!(v["size"], 4);

        let res = router.route(&get("/images", ""));
        let list: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(list[0]["description"], "a cat");

        let res = router.route(&get("/image", "id=1"));
        assert_eq!(res.status, 200);
        assert_eq!(res.headers.get("Content-Type"), Some("image/png"));
        assert_eq!(res.body, vec![0x89, b'P', b'N', b'G']);

        assert_eq!(router.route(&get("/image", "id=7")).status, 404);
        assert_eq!(router.route(&get("/image", "id=x")).status, 400);
    }

    #[test]
    fn test_upload_without_file() {
        let (_db, state) = state(1);
        let router = build_router(state);
        let mut req = get("/upload", "");
        req.method = Method::Post;
        assert_eq!(router.route(&req).status, 400);
    }

    #[test]
    fn test_health_reports_closed_store() {
        let (db, state) = state(1);
        let router = build_router(state);
        assert_eq!(router.route(&get("/health", "")).status, 200);
        db.close();
        // the idle session is handed out and fails its ping
        assert_eq!(router.route(&get("/health", "")).status, 503);
        // it was discarded on release; opening a new one fails outright
        assert_eq!(router.route(&get("/health", "")).status, 500);
    }
}
