// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod multipart;
pub mod parser;
pub mod reactor;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
#[cfg(feature = "tls")]
pub mod tls;
pub mod worker;
pub mod writer;

// Re-exports for users
pub use config::Config;
pub use error::{EtudeError, EtudeResult, ParseError};
pub use http::{Headers, Method, Request, Response};
pub use multipart::Part;
pub use router::{Handler, Router};
pub use server::{Server, ShutdownHandle};
pub use worker::{WorkerPool, WorkerPoolConfig};
