// src/router.rs
use std::collections::HashMap;
use std::fmt;

use crate::http::{Method, Request, Response};

/// Something that turns a request into a response.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, req: &Request) -> Response {
        self(req)
    }
}

/// Exact-match routing table keyed by `"METHOD|path"`.
///
/// Built before the server starts and shared read-only afterwards.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Box<dyn Handler>>,
}

fn route_key(method: Method, path: &str) -> String {
    let mut key = String::with_capacity(method.as_str().len() + 1 + path.len());
    key.push_str(method.as_str());
    key.push('|');
    key.push_str(path);
    key
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `(method, path)`, replacing any earlier one.
    pub fn add_route(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.routes.insert(route_key(method, path), Box::new(handler));
        self
    }

    pub fn find(&self, method: Method, path: &str) -> Option<&dyn Handler> {
        self.routes.get(&route_key(method, path)).map(|h| h.as_ref())
    }

    /// Runs the matching handler, or returns `404 Not Found`.
    pub fn route(&self, req: &Request) -> Response {
        match self.find(req.method, &req.path) {
            Some(handler) => handler.handle(req),
            None => Response::not_found(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    // Convenience methods
    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Get, path, handler) }
    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Post, path, handler) }
    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Put, path, handler) }
    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Delete, path, handler) }
    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Patch, path, handler) }
    pub fn head(&mut self, path: &str, handler: impl Handler) -> &mut Self { self.add_route(Method::Head, path, handler) }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.routes.keys().collect();
        keys.sort();
        f.debug_struct("Router").field("routes", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: Method, path: &str) -> Request {
        Request {
            method,
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn test_route_hit_and_miss() {
        let mut router = Router::new();
        router
            .get("/", |_: &Request| Response::ok("Hello, World!"))
            .post("/", |_: &Request| Response::ok("posted"));

        assert_eq!(router.len(), 2);
        assert_eq!(router.route(&req(Method::Get, "/")).body, b"Hello, World!");
        assert_eq!(router.route(&req(Method::Post, "/")).body, b"posted");

        let miss = router.route(&req(Method::Get, "/nope"));
        assert_eq!(miss.status, 404);
        assert_eq!(miss.body, b"Not Found");

        // method is part of the key
        assert_eq!(router.route(&req(Method::Put, "/")).status, 404);
    }

    #[test]
    fn test_query_does_not_affect_lookup() {
        let mut router = Router::new();
        router.get("/search", |r: &Request| Response::ok(r.parse_query()["q"].clone()));
        let mut r = req(Method::Get, "/search");
        r.query = "q=rust".to_string();
        assert_eq!(router.route(&r).body, b"rust");
    }

    #[test]
    fn test_later_registration_wins() {
        let mut router = Router::new();
        router.get("/a", |_: &Request| Response::ok("first"));
        router.get("/a", |_: &Request| Response::ok("second"));
        assert_eq!(router.len(), 1);
        assert_eq!(router.route(&req(Method::Get, "/a")).body, b"second");
    }

    #[test]
    fn test_repeated_route_is_stable() {
        let mut router = Router::new();
        router.get("/x", |r: &Request| Response::ok(r.path.clone()).with_header("X-Id", "7"));
        let r = req(Method::Get, "/x");
        assert_eq!(router.route(&r), router.route(&r));
    }

    struct Greeter(&'static str);

    impl Handler for Greeter {
        fn handle(&self, _req: &Request) -> Response {
            Response::ok(self.0)
        }
    }

    #[test]
    fn test_struct_handler() {
        let mut router = Router::new();
        router.add_route(Method::Head, "/hi", Greeter("hi"));
        assert!(router.find(Method::Head, "/hi").is_some());
        assert_eq!(router.route(&req(Method::Head, "/hi")).body, b"hi");
        assert!(format!("{router:?}").contains("HEAD|/hi"));
    }
}
