#![cfg(feature = "tls")]

use etude_core::{Config, Request, Response, Router, Server, ShutdownHandle};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const BIG_LEN: usize = 300_000;

struct TlsServer {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
    files: [PathBuf; 2],
    handle: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        for f in &self.files {
            let _ = std::fs::remove_file(f);
        }
    }
}

fn big_body() -> Vec<u8> {
    (0..BIG_LEN).map(|i| b'a' + (i % 26) as u8).collect()
}

fn setup_tls_server(name: &str) -> TlsServer {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("etude-{}-{name}.crt", std::process::id()));
    let key_path = dir.join(format!("etude-{}-{name}.key", std::process::id()));
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let mut router = Router::new();
    router.get("/", |_: &Request| Response::ok("Hello, World!"));
    router.get("/big", |_: &Request| Response::ok(big_body()));

    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        worker_min: 1,
        worker_max: 2,
        metrics_interval_secs: 0,
        tls: true,
        tls_cert_path: cert_path.clone(),
        tls_key_path: key_path.clone(),
        ..Config::default()
    };
    let server = Server::bind(config, router).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve().unwrap());

    TlsServer {
        addr,
        cert: certified.cert.der().clone(),
        files: [cert_path, key_path],
        handle,
        thread: Some(thread),
    }
}

fn tls_connect(server: &TlsServer) -> StreamOwned<ClientConnection, TcpStream> {
    let mut roots = RootCertStore::empty();
    roots.add(server.cert.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = ServerName::try_from("localhost").unwrap().to_owned();
    let conn = ClientConnection::new(Arc::new(config), name).unwrap();

    let tcp = TcpStream::connect(server.addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    StreamOwned::new(conn, tcp)
}

/// Reads one response framed by `Content-Length`.
fn read_one(stream: &mut impl Read) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
            let len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            while buf.len() < pos + 4 + len {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed mid-response");
                buf.extend_from_slice(&chunk[..n]);
            }
            return (head, buf[pos + 4..pos + 4 + len].to_vec());
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before headers");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn test_tls_keep_alive_pair() {
    let server = setup_tls_server("pair");
    let mut stream = tls_connect(&server);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    stream.flush().unwrap();
    let (head, body) = read_one(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"Hello, World!");

    // same session, a response larger than one TLS record and one socket write
    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    stream.flush().unwrap();
    let (head, body) = read_one(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, big_body());
}

#[test]
fn test_plaintext_client_is_dropped() {
    let server = setup_tls_server("plain");
    let mut tcp = TcpStream::connect(server.addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let mut res = Vec::new();
    let _ = tcp.read_to_end(&mut res);
    assert!(!res.starts_with(b"HTTP/1.1"));

    // the server keeps serving TLS clients
    let mut stream = tls_connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (_, body) = read_one(&mut stream);
    assert_eq!(body, b"Hello, World!");
}
