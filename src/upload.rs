use serde::Deserialize;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{ImageConfig, ServerConfig};
use crate::error::TransportError;

/// Give up looking for the end of the reply head after this many bytes
const HEAD_LIMIT: usize = 8192;

/// Upper bound on how much of the server's reply is read
const RESPONSE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Enrollment samples for a known subject
    Detect,
    /// Single placements to be identified by the server
    Classify,
}

impl Mode {
    pub fn tag(self) -> &'static str {
        match self {
            Mode::Detect => "detect",
            Mode::Classify => "cls",
        }
    }
}

/// Metadata for one image upload: body length plus the X-* headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub content_length: usize,
    headers: Vec<(&'static str, String)>,
}

impl UploadRequest {
    /// Enrollment sample `sample` (1-based) of `subject_id`
    pub fn detect(image: &ImageConfig, subject_id: i64, sample: u32) -> Self {
        let mut request = Self::base(image, Mode::Detect, format!("{}_{}", subject_id, sample));
        request.headers.push(("X-Person-Id", subject_id.to_string()));
        request
    }

    /// Classification capture. Never carries a subject id: the server tells
    /// enrollment from inference by that header alone.
    pub fn classify(image: &ImageConfig, counter: u32) -> Self {
        Self::base(image, Mode::Classify, format!("test_img_{}", counter))
    }

    fn base(image: &ImageConfig, mode: Mode, filename: String) -> Self {
        let identify = match mode {
            Mode::Detect => "0",
            Mode::Classify => "1",
        };

        UploadRequest {
            content_length: image.packed_len(),
            headers: vec![
                ("X-Format", image.format.clone()),
                ("X-Width", image.width.to_string()),
                ("X-Height", image.height.to_string()),
                ("X-Mode", mode.tag().to_string()),
                ("X-Filename", filename),
                ("X-Identify", identify.to_string()),
            ],
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn filename(&self) -> &str {
        self.header("X-Filename").unwrap_or_default()
    }

    /// Request line and headers, terminated by the blank line
    pub fn head(&self, host: &str, port: u16, path: &str) -> String {
        let mut head = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            path, host, port, self.content_length
        );
        for (key, value) in &self.headers {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

/// Whatever the server managed to say before the connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReply {
    pub status: Option<u16>,
    pub body: String,
}

impl UploadReply {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let (head, body) = match text.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (&*text, ""),
        };

        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok());

        UploadReply {
            status,
            body: body.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }

    /// Identification result, if the body is the server's JSON verdict
    pub fn identification(&self) -> Option<Identification> {
        serde_json::from_str(self.body.trim()).ok()
    }
}

/// Server verdict for a classification upload
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Identification {
    #[serde(default)]
    match_id: Option<serde_json::Value>,
    #[serde(default, rename = "matchId")]
    match_id_camel: Option<serde_json::Value>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub threshold: f64,
}

impl Identification {
    /// Matched subject, `None` for "no match".
    ///
    /// `match_id` wins over `matchId` unless it is empty. Subject 0 is a real
    /// subject, so a numeric 0 is a match.
    pub fn matched(&self) -> Option<String> {
        [&self.match_id, &self.match_id_camel]
            .into_iter()
            .find_map(|value| subject_label(value.as_ref()?))
    }
}

fn subject_label(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Outbound channel for image bodies.
///
/// `begin` opens a request whose body length is fixed up front; the returned
/// writer receives exactly the image bytes. `finish` always closes the
/// request, whether or not the body was completed.
pub trait Uploader {
    type Body: Write;

    fn begin(&mut self, request: &UploadRequest) -> Result<Self::Body, TransportError>;

    fn finish(&mut self, body: Self::Body) -> Option<UploadReply>;
}

/// Plain HTTP/1.1 POST over a fresh TCP connection per image
pub struct HttpUploader {
    host: String,
    port: u16,
    path: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl HttpUploader {
    pub fn new(config: &ServerConfig) -> Self {
        HttpUploader {
            host: config.host.clone(),
            port: config.port,
            path: config.path.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(TransportError::Connect)?
            .next()
            .ok_or_else(|| {
                TransportError::Connect(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                ))
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(TransportError::Connect)?;
        stream
            .set_write_timeout(Some(self.connect_timeout))
            .map_err(TransportError::Connect)?;
        Ok(stream)
    }
}

impl Uploader for HttpUploader {
    type Body = TcpStream;

    fn begin(&mut self, request: &UploadRequest) -> Result<TcpStream, TransportError> {
        let mut stream = self.connect()?;
        let head = request.head(&self.host, self.port, &self.path);
        trace!("request head:\n{}", head);

        stream
            .write_all(head.as_bytes())
            .map_err(TransportError::Send)?;
        debug!("opened upload {} to {}:{}", request.filename(), self.host, self.port);
        Ok(stream)
    }

    fn finish(&mut self, mut stream: TcpStream) -> Option<UploadReply> {
        let mut response = Vec::new();
        let mut chunk = [0u8; 512];

        if stream.set_read_timeout(Some(self.response_timeout)).is_ok() {
            while !response_complete(&response) {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => response.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("response read ended: {}", TransportError::Receive(e));
                        break;
                    }
                }
            }
        }

        let _ = stream.shutdown(Shutdown::Both);

        if response.is_empty() {
            return None;
        }
        response.truncate(RESPONSE_LIMIT);
        Some(UploadReply::parse(&response))
    }
}

/// The reply is complete once its declared body has arrived. Without a
/// `Content-Length` only the server closing the connection ends it.
fn response_complete(response: &[u8]) -> bool {
    if response.len() >= RESPONSE_LIMIT {
        return true;
    }
    let Some(head_end) = response.windows(4).position(|w| w == b"\r\n\r\n") else {
        return response.len() >= HEAD_LIMIT;
    };

    let head = String::from_utf8_lossy(&response[..head_end]);
    match content_length(&head) {
        Some(length) => response.len() - (head_end + 4) >= length,
        None => false,
    }
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
