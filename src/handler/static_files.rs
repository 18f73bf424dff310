use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use http::{header, Method, StatusCode};
use mime::Mime;
use tracing::debug;

use super::{ConnectionHandler, Disposition};
use crate::{net::Connection, Config};

const MAX_HEADERS: usize = 32;

/// Serves files below a root directory, one request per connection.
///
/// Whatever the first read contains is taken as the whole request. The
/// response always ends the connection.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index: String,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index: index.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.root.clone(), config.index.clone())
    }

    /// Build the complete response for one request.
    pub fn respond(&self, input: &[u8]) -> Vec<u8> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        // a partial head is fine as long as the request line made it
        let (method, path) = match req.parse(input) {
            Ok(_) => match (req.method, req.path) {
                (Some(method), Some(path)) => (method, path),
                _ => return error_response(StatusCode::BAD_REQUEST),
            },
            Err(e) => {
                debug!(cause = %e, "unparseable request");
                return error_response(StatusCode::BAD_REQUEST);
            }
        };

        let head_only = match Method::from_bytes(method.as_bytes()) {
            Ok(m) if m == Method::GET => false,
            Ok(m) if m == Method::HEAD => true,
            _ => return error_response(StatusCode::METHOD_NOT_ALLOWED),
        };

        let Some(file) = self.resolve(path) else {
            return error_response(StatusCode::FORBIDDEN);
        };

        match fs::read(&file) {
            Ok(body) => {
                let mut response = head(StatusCode::OK, &content_type(&file), body.len());
                if !head_only {
                    response.extend_from_slice(&body);
                }
                response
            }
            Err(e) => {
                debug!(file = %file.display(), cause = %e, "cannot serve file");
                error_response(match e.kind() {
                    io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                })
            }
        }
    }

    /// Map a request target onto a file below the root.
    ///
    /// `None` if the target tries to leave the root.
    fn resolve(&self, target: &str) -> Option<PathBuf> {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let relative = Path::new(path.trim_start_matches('/'));

        let mut file = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => file.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }

        if path.ends_with('/') || file.is_dir() || relative.as_os_str().is_empty() {
            file.push(&self.index);
        }
        Some(file)
    }
}

impl ConnectionHandler for StaticFiles {
    fn on_data(&mut self, conn: &mut Connection, input: &[u8]) -> Disposition {
        let response = self.respond(input);
        conn.send(&response);
        Disposition::Close
    }
}

fn head(status: StatusCode, content_type: &Mime, content_length: usize) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n{}: {}\r\n{}: {}\r\n{}: {}\r\n{}: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        header::CONTENT_TYPE,
        content_type,
        header::CONTENT_LENGTH,
        content_length,
        header::DATE,
        httpdate::fmt_http_date(SystemTime::now()),
        header::CONNECTION,
    )
    .into_bytes()
}

fn error_response(status: StatusCode) -> Vec<u8> {
    let body = format!("{status}\n");
    let mut response = head(status, &mime::TEXT_PLAIN_UTF_8, body.len());
    response.extend_from_slice(body.as_bytes());
    response
}

fn content_type(file: &Path) -> Mime {
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => mime::TEXT_HTML_UTF_8,
        Some("css") => mime::TEXT_CSS_UTF_8,
        Some("js") => mime::APPLICATION_JAVASCRIPT_UTF_8,
        Some("json") => mime::APPLICATION_JSON,
        Some("txt") => mime::TEXT_PLAIN_UTF_8,
        Some("png") => mime::IMAGE_PNG,
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("gif") => mime::IMAGE_GIF,
        Some("svg") => mime::IMAGE_SVG,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}
