use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::tcp::{App, Conn, Peer, State, SEGMENT_CAP};

/// Cap on accumulated request headers; a request that never terminates
/// inside it simply never completes.
const REQ_CAP: usize = 1024;

const HTTP_200: &str = "HTTP/1.0 200 OK\r\nContent-Type: ";
const HTTP_201: &str = "HTTP/1.0 201 Created\r\n\r\n";
const HTTP_404: &str = "HTTP/1.0 404 Not Found\r\nContent-Type: text/html\r\n\r\n\
                        <html><body><h1>404 Not Found</h1></body></html>";
const HTTP_405: &str = "HTTP/1.0 405 Method Not Allowed\r\n\r\n";
const CRLF_CRLF: &str = "\r\n\r\n";

const DIR_HEADER: &str = "<html><head><title>Directory</title></head><body><h1>Index of ";
const DIR_MID: &str = "</h1><hr><pre>\n";
const DIR_PARENT: &str = "<a href=\"..\">..</a> (parent directory)\n";
const DIR_FOOTER: &str = "</pre><hr></body></html>";

#[derive(Debug, PartialEq, Eq)]
enum Method {
    Get,
    Put,
}

struct Upload {
    file: File,
    expected: u64,
    received: u64,
}

/// HTTP/1.0 file server on top of the TCP callback contract. One request
/// per connection; responses stream out in segment-sized chunks and the
/// connection closes after each one.
pub struct HttpServer {
    root: PathBuf,
    allow_put: bool,
    req: Vec<u8>,
    requests: u64,
    upload: Option<Upload>,
}

impl HttpServer {
    pub fn new(root: PathBuf, allow_put: bool) -> Self {
        HttpServer {
            root,
            allow_put,
            req: Vec::new(),
            requests: 0,
            upload: None,
        }
    }

    /// Map a URL path to a filesystem path under the document root.
    fn resolve(&self, url_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in url_path.split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
        path
    }

    fn handle_get(&mut self, conn: &mut dyn Conn, url_path: &str) {
        let target = self.resolve(url_path);

        if target.is_dir() {
            let index = target.join("index.htm");
            if index.is_file() {
                self.send_file(conn, &index);
            } else {
                self.send_listing(conn, &target, url_path);
            }
        } else {
            self.send_file(conn, &target);
        }
    }

    fn send_file(&mut self, conn: &mut dyn Conn, path: &Path) {
        let Ok(mut file) = File::open(path) else {
            debug!("404: {}", path.display());
            send_all(conn, HTTP_404.as_bytes());
            conn.close();
            return;
        };

        info!("200: {}", path.display());

        send_all(conn, HTTP_200.as_bytes());
        send_all(conn, mime_type(path).as_bytes());
        send_all(conn, CRLF_CRLF.as_bytes());

        let mut buf = [0u8; SEGMENT_CAP];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => conn.send(&buf[..n]),
                Err(err) => {
                    warn!("read failed for {}: {err}", path.display());
                    break;
                }
            }
        }

        conn.close();
    }

    fn send_listing(&mut self, conn: &mut dyn Conn, dir: &Path, url_path: &str) {
        info!("dir: {}", dir.display());

        send_all(conn, HTTP_200.as_bytes());
        send_all(conn, b"text/html");
        send_all(conn, CRLF_CRLF.as_bytes());

        send_all(conn, DIR_HEADER.as_bytes());
        send_all(conn, url_path.as_bytes());
        send_all(conn, DIR_MID.as_bytes());

        if url_path != "/" {
            send_all(conn, DIR_PARENT.as_bytes());
        }

        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }

                let line = match entry.metadata() {
                    Ok(meta) if meta.is_dir() => {
                        format!("<a href=\"{name}/\">{name}/</a>\t\t(dir)\n")
                    }
                    Ok(meta) => format!("<a href=\"{name}\">{name}</a>\t\t{}\n", meta.len()),
                    Err(_) => continue,
                };
                send_all(conn, line.as_bytes());
            }
        }

        send_all(conn, DIR_FOOTER.as_bytes());
        conn.close();
    }

    fn handle_put(&mut self, conn: &mut dyn Conn, url_path: &str) {
        if !self.allow_put {
            send_all(conn, HTTP_405.as_bytes());
            conn.close();
            return;
        }

        let expected = content_length(&self.req);
        if expected == 0 {
            // An upload without a length is treated like a missing
            // resource rather than a client error.
            debug!("put without content-length rejected");
            send_all(conn, HTTP_404.as_bytes());
            conn.close();
            return;
        }

        let target = self.resolve(url_path);
        let file = match File::create(&target) {
            Ok(file) => file,
            Err(err) => {
                warn!("create failed for {}: {err}", target.display());
                send_all(conn, HTTP_404.as_bytes());
                conn.close();
                return;
            }
        };

        info!("upload to {} ({expected} bytes)", target.display());
        self.upload = Some(Upload {
            file,
            expected,
            received: 0,
        });

        // Body bytes that rode in behind the headers.
        if let Some(pos) = find_blank_line(&self.req) {
            let body = self.req[pos..].to_vec();
            if !body.is_empty() {
                self.upload_bytes(conn, &body);
            }
        }
    }

    fn upload_bytes(&mut self, conn: &mut dyn Conn, data: &[u8]) {
        let Some(upload) = self.upload.as_mut() else {
            return;
        };

        if let Err(err) = upload.file.write_all(data) {
            warn!("upload write failed: {err}");
        } else {
            upload.received += data.len() as u64;
        }

        if upload.received >= upload.expected {
            info!("upload complete ({} bytes)", upload.received);
            self.upload = None;
            self.req.clear();
            send_all(conn, HTTP_201.as_bytes());
            conn.close();
        }
    }
}

impl App for HttpServer {
    fn on_accept(&mut self, peer: Peer) -> bool {
        debug!("accepting {peer}");
        true
    }

    fn on_data(&mut self, conn: &mut dyn Conn, data: &[u8]) {
        if self.upload.is_some() {
            self.upload_bytes(conn, data);
            return;
        }

        let room = REQ_CAP.saturating_sub(self.req.len());
        self.req.extend_from_slice(&data[..data.len().min(room)]);

        if !self.req.ends_with(b"\r\n\r\n") {
            return;
        }

        self.requests += 1;

        match parse_request(&self.req) {
            Some((Method::Get, path)) => {
                info!("#{} GET {path}", self.requests);
                self.handle_get(conn, &path);
                self.req.clear();
            }
            Some((Method::Put, path)) => {
                info!("#{} PUT {path}", self.requests);
                self.handle_put(conn, &path);
                self.req.clear();
            }
            None => {
                info!("#{} bad request", self.requests);
                send_all(conn, HTTP_404.as_bytes());
                conn.close();
                self.req.clear();
            }
        }
    }

    fn on_state_change(&mut self, old: State, new: State, peer: Peer) {
        match new {
            State::SynReceived => info!("syn from {peer}"),
            State::Established => info!("connected to {peer}"),
            State::Listen => {
                info!("connection closed (was {old:?})");
                self.req.clear();
                if self.upload.take().is_some() {
                    warn!("upload aborted mid-transfer");
                }
            }
            _ => {}
        }
    }
}

/// Stream `data` through the segment-sized send window.
fn send_all(conn: &mut dyn Conn, data: &[u8]) {
    for chunk in data.chunks(SEGMENT_CAP) {
        conn.send(chunk);
    }
}

fn parse_request(req: &[u8]) -> Option<(Method, String)> {
    let text = std::str::from_utf8(req).ok()?;

    let (method, rest) = if let Some(rest) = text.strip_prefix("GET ") {
        (Method::Get, rest)
    } else if let Some(rest) = text.strip_prefix("PUT ") {
        (Method::Put, rest)
    } else {
        return None;
    };

    let (path, _) = rest.split_once(' ')?;
    Some((method, path.to_string()))
}

/// Pull a Content-Length value out of the raw header block, matching the
/// name case-insensitively. Absent or malformed counts as zero.
fn content_length(req: &[u8]) -> u64 {
    let text = String::from_utf8_lossy(req);

    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }

    0
}

/// Index of the first byte after the header-terminating blank line.
fn find_blank_line(req: &[u8]) -> Option<usize> {
    req.windows(4)
        .position(|win| win == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// MIME type from the filename extension; unknown extensions download as
/// raw bytes.
fn mime_type(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return "application/octet-stream";
    };

    if ext.eq_ignore_ascii_case("htm") || ext.eq_ignore_ascii_case("html") {
        "text/html"
    } else if ext.eq_ignore_ascii_case("txt") {
        "text/plain"
    } else if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") {
        "image/jpeg"
    } else if ext.eq_ignore_ascii_case("gif") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}
