use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

struct Object {
    data: Vec<u8>,
    etag: String,
}

#[derive(Default)]
struct Objects {
    entries: HashMap<String, Object>,
    version: u64,
}

impl Objects {
    fn store(&mut self, key: &str, data: Vec<u8>) -> String {
        self.version += 1;
        let etag = format!("\"v{}\"", self.version);
        self.entries.insert(
            key.to_string(),
            Object {
                data,
                etag: etag.clone(),
            },
        );
        etag
    }
}

/// Minimal HTTP object store: GET/HEAD/PUT/DELETE on `/{container}/{key}`
/// with ETags, `If-None-Match: *` and `If-Match`.
pub struct MockBlobServer {
    port: u16,
    objects: Arc<Mutex<Objects>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

struct Request {
    method: String,
    key: String,
    if_match: Option<String>,
    if_none_match: Option<String>,
    body: Vec<u8>,
}

impl MockBlobServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().unwrap().port();
        let shutdown = Arc::new(AtomicBool::new(false));
        let objects = Arc::new(Mutex::new(Objects::default()));

        listener
            .set_nonblocking(true)
            .expect("set_nonblocking on listener");

        let shutdown_clone = shutdown.clone();
        let objects_clone = objects.clone();
        let handle = thread::spawn(move || {
            Self::serve(listener, objects_clone, shutdown_clone);
        });

        MockBlobServer {
            port,
            objects,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Container URL to put in `[remote] url`.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/mailcache", self.port)
    }

    #[allow(dead_code)]
    pub fn put_object(&self, key: &str, data: &[u8]) -> String {
        self.objects.lock().unwrap().store(key, data.to_vec())
    }

    #[allow(dead_code)]
    pub fn get_object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|o| o.data.clone())
    }

    #[allow(dead_code)]
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    fn serve(listener: TcpListener, objects: Arc<Mutex<Objects>>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .expect("set blocking on stream");
                    stream
                        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
                        .ok();
                    Self::handle_connection(stream, &objects);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    }

    fn read_request(stream: &std::net::TcpStream) -> Option<Request> {
        let mut reader = BufReader::new(stream.try_clone().ok()?);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).ok()?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return None;
        }

        let mut content_length: usize = 0;
        let mut if_match = None;
        let mut if_none_match = None;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).ok()?;
            let trimmed = header.trim();
            if trimmed.is_empty() {
                break;
            }
            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "if-match" => if_match = Some(value),
                "if-none-match" => if_none_match = Some(value),
                _ => {}
            }
        }

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body).ok()?;
        }

        let key = parts[1].rsplit('/').next().unwrap_or("").to_string();
        Some(Request {
            method: parts[0].to_string(),
            key,
            if_match,
            if_none_match,
            body,
        })
    }

    fn handle_connection(mut stream: std::net::TcpStream, objects: &Mutex<Objects>) {
        let Some(req) = Self::read_request(&stream) else {
            return;
        };

        let mut objects = objects.lock().unwrap();
        let current = objects.entries.get(&req.key).map(|o| o.etag.clone());
        let precondition_ok = match (&req.if_none_match, &req.if_match) {
            (Some(v), _) if v == "*" => current.is_none(),
            (_, Some(tag)) => current.as_deref() == Some(tag.as_str()),
            _ => true,
        };

        let (status, etag, body): (&str, Option<String>, Vec<u8>) = match req.method.as_str() {
            "GET" | "HEAD" => match objects.entries.get(&req.key) {
                Some(o) => ("200 OK", Some(o.etag.clone()), o.data.clone()),
                None => ("404 Not Found", None, Vec::new()),
            },
            "PUT" if !precondition_ok => ("412 Precondition Failed", None, Vec::new()),
            "PUT" => {
                let created = current.is_none();
                let etag = objects.store(&req.key, req.body);
                let status = if created { "201 Created" } else { "204 No Content" };
                (status, Some(etag), Vec::new())
            }
            "DELETE" if current.is_none() => ("404 Not Found", None, Vec::new()),
            "DELETE" if !precondition_ok => ("412 Precondition Failed", None, Vec::new()),
            "DELETE" => {
                objects.entries.remove(&req.key);
                ("204 No Content", None, Vec::new())
            }
            _ => ("405 Method Not Allowed", None, Vec::new()),
        };
        drop(objects);

        let mut head = format!("HTTP/1.1 {}\r\n", status);
        if let Some(etag) = etag {
            head.push_str(&format!("ETag: {}\r\n", etag));
        }
        head.push_str(&format!(
            "Content-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        ));
        let _ = stream.write_all(head.as_bytes());
        if req.method != "HEAD" {
            let _ = stream.write_all(&body);
        }
        let _ = stream.flush();
    }
}

impl Drop for MockBlobServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
