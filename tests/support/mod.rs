#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tiny_http::{Header, Response, Server};

/// One request as the fake forum saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub url: String,
    pub body: String,
}

/// Minimal forum API on an ephemeral port. The handler maps
/// `(method, url, body)` to `(status, body)`.
pub struct ForumServer {
    pub base_url: String,
    server: Arc<Server>,
    seen: Arc<Mutex<Vec<Seen>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ForumServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &str) -> (u16, String) + Send + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind test server"));
        let port = server
            .server_addr()
            .to_ip()
            .expect("tcp listener")
            .port();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker = server.clone();
        let log = seen.clone();
        let handle = thread::spawn(move || {
            for mut request in worker.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let method = request.method().as_str().to_string();
                let url = request.url().to_string();
                let (status, reply) = handler(&method, &url, &body);
                log.lock().push(Seen { method, url, body });
                let response = Response::from_string(reply)
                    .with_status_code(status)
                    .with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                            .expect("header"),
                    );
                let _ = request.respond(response);
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}/"),
            server,
            seen,
            handle: Some(handle),
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

impl Drop for ForumServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
