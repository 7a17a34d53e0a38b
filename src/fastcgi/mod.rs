//! FastCGI Client
//!
//! A minimal blocking responder client: dial a TCP or Unix-domain endpoint,
//! send one GET-style request with CGI parameters and collect the response.
//!
//! Connections are single-use. `get` consumes the client and the socket is
//! closed when the client is dropped, on success and on error alike.

pub mod record;

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::detect::Network;
use crate::error::{Error, Result};
use record::{EndRequest, ProtocolStatus, Record, RecordType, FCGI_RESPONDER};

/// CGI parameters sent with a request
pub type Params = BTreeMap<String, String>;

/// Identifier sent as SERVER_SOFTWARE
pub const SERVER_SOFTWARE: &str = concat!("fpm-probe/", env!("CARGO_PKG_VERSION"));

const REQUEST_ID: u16 = 1;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// An open connection to a FastCGI responder
pub struct Client {
    stream: Stream,
}

impl Client {
    /// Connect to `address` on `network`, giving up after `timeout`.
    pub fn dial(network: Network, address: &str, timeout: Duration) -> io::Result<Self> {
        let stream = match network {
            Network::Tcp => Stream::Tcp(dial_tcp(address, timeout)?),
            Network::Unix => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.connect_timeout(&SockAddr::unix(address)?, timeout)?;
                Stream::Unix(UnixStream::from(OwnedFd::from(socket)))
            }
        };
        Ok(Self { stream })
    }

    /// Bound every subsequent read and write on the connection.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_timeout(timeout)
    }

    /// Run `script_path` through the responder and return its output.
    ///
    /// `env` is layered over the minimal CGI parameter set, so callers can
    /// override any default.
    pub fn get(self, script_path: &Path, env: &Params) -> Result<FcgiResponse> {
        let mut params = cgi_params(script_path);
        params.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut payload = Vec::new();
        for (name, value) in &params {
            record::encode_param(&mut payload, name, value);
        }

        {
            let mut writer = BufWriter::new(self.stream.try_clone()?);
            Record::begin_request(REQUEST_ID, FCGI_RESPONDER, false).write_to(&mut writer)?;
            record::write_stream(&mut writer, RecordType::Params, REQUEST_ID, &payload)?;
            record::write_stream(&mut writer, RecordType::Stdin, REQUEST_ID, &[])?;
            writer.flush()?;
        }

        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let end = loop {
            let record = Record::read_from(&mut reader)?;
            if record.header.request_id != REQUEST_ID {
                debug!(
                    "Ignoring FastCGI record for request {}",
                    record.header.request_id
                );
                continue;
            }
            match record.record_type() {
                Some(RecordType::Stdout) => stdout.extend_from_slice(&record.content),
                Some(RecordType::Stderr) => stderr.extend_from_slice(&record.content),
                Some(RecordType::EndRequest) => {
                    break EndRequest::parse(&record.content).ok_or_else(|| {
                        Error::Protocol("END_REQUEST record too short".to_string())
                    })?;
                }
                other => debug!("Ignoring FastCGI record {:?}", other),
            }
        };

        if end.protocol_status != ProtocolStatus::RequestComplete {
            return Err(Error::Protocol(format!(
                "request rejected with status {:?}",
                end.protocol_status
            )));
        }

        if !stderr.is_empty() {
            debug!("FastCGI stderr: {}", String::from_utf8_lossy(&stderr).trim());
        }

        let mut response = FcgiResponse::from_stdout(&stdout);
        response.stderr = stderr;
        response.app_status = end.app_status;
        Ok(response)
    }

    /// Close the connection. Dropping the client has the same effect.
    pub fn close(self) {
        // The peer may already have hung up.
        let _ = self.stream.shutdown();
    }
}

fn dial_tcp(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} did not resolve to any address", address),
        )
    }))
}

/// Minimal CGI environment for a GET of `script_path`
pub fn cgi_params(script_path: &Path) -> Params {
    let mut env = Params::new();
    let script = script_path.to_string_lossy().to_string();

    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string());
    env.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    env.insert("REQUEST_METHOD".to_string(), "GET".to_string());
    env.insert("QUERY_STRING".to_string(), String::new());
    env.insert("SCRIPT_NAME".to_string(), script.clone());
    env.insert("SCRIPT_FILENAME".to_string(), script);
    env.insert("REMOTE_ADDR".to_string(), "127.0.0.1".to_string());

    env
}

/// Response collected from a responder
#[derive(Debug, Clone, Default)]
pub struct FcgiResponse {
    /// HTTP status from the `Status:` header, 200 when absent
    pub status: u16,
    /// CGI response headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body following the header block
    pub body: Vec<u8>,
    /// Everything the script wrote to FCGI_STDERR
    pub stderr: Vec<u8>,
    /// Application exit status from END_REQUEST
    pub app_status: u32,
}

impl FcgiResponse {
    /// Split raw STDOUT into CGI headers and body
    pub fn from_stdout(output: &[u8]) -> Self {
        let crlf = output.windows(4).position(|w| w == b"\r\n\r\n");
        let lf = output.windows(2).position(|w| w == b"\n\n");
        let split = match (crlf, lf) {
            (Some(a), Some(b)) if b < a => Some((b, 2)),
            (Some(a), _) => Some((a, 4)),
            (None, Some(b)) => Some((b, 2)),
            (None, None) => None,
        };

        let Some((pos, sep_len)) = split else {
            return Self {
                status: 200,
                body: output.to_vec(),
                ..Self::default()
            };
        };

        let mut headers = Vec::new();
        let mut status = 200;

        for line in String::from_utf8_lossy(&output[..pos]).lines() {
            if let Some(code_str) = line.strip_prefix("Status:").map(|s| s.trim()) {
                if let Some(code) = code_str.split_whitespace().next() {
                    status = code.parse().unwrap_or(200);
                }
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Self {
            status,
            headers,
            body: output[pos + sep_len..].to_vec(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeResponder;
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn echo_script(params: &Params) -> Vec<u8> {
        format!(
            "Content-type: text/plain\r\n\r\n{}|{}",
            params["SCRIPT_FILENAME"], params["SERVER_SOFTWARE"]
        )
        .into_bytes()
    }

    #[test]
    fn test_get_over_unix_socket() {
        let fpm = FakeResponder::unix(echo_script);
        let client = Client::dial(fpm.network, &fpm.address, TIMEOUT).unwrap();
        let resp = client
            .get(Path::new("/srv/scripts/version.php"), &Params::new())
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("text/plain"));
        assert_eq!(
            String::from_utf8(resp.body).unwrap(),
            format!("/srv/scripts/version.php|{}", SERVER_SOFTWARE)
        );
    }

    #[test]
    fn test_get_over_tcp_with_env_override() {
        let fpm = FakeResponder::tcp(|params| {
            format!("\r\n\r\n{}", params["REMOTE_ADDR"]).into_bytes()
        });
        let client = Client::dial(fpm.network, &fpm.address, TIMEOUT).unwrap();
        let mut env = Params::new();
        env.insert("REMOTE_ADDR".to_string(), "10.0.0.7".to_string());

        let resp = client.get(Path::new("/tmp/a.php"), &env).unwrap();
        assert_eq!(resp.body, b"10.0.0.7");
    }

    #[test]
    fn test_large_body_spans_records() {
        let fpm = FakeResponder::unix(|_| {
            let mut out = b"Content-type: text/html\r\n\r\n".to_vec();
            out.extend(std::iter::repeat(b'z').take(100_000));
            out
        });
        let client = Client::dial(fpm.network, &fpm.address, TIMEOUT).unwrap();
        let resp = client.get(Path::new("/tmp/big.php"), &Params::new()).unwrap();
        assert_eq!(resp.body.len(), 100_000);
    }

    #[test]
    fn test_dial_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.sock");
        let result = Client::dial(Network::Unix, &path.to_string_lossy(), TIMEOUT);
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_response_is_transport_error() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpm.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                // header promising 16 bytes, followed by only 3
                let _ = stream.write_all(&[1, 6, 0, 1, 0, 16, 0, 0, b'a', b'b', b'c']);
            }
        });

        let client = Client::dial(Network::Unix, &path.to_string_lossy(), TIMEOUT).unwrap();
        client.set_timeout(Some(TIMEOUT)).unwrap();
        let err = client.get(Path::new("/tmp/x.php"), &Params::new()).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_response_parsing() {
        let raw = b"Content-Type: text/html\r\nStatus: 200 OK\r\n\r\n<html>Hello</html>";
        let response = FcgiResponse::from_stdout(raw);

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"<html>Hello</html>");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn test_response_bare_lf_and_status() {
        let raw = b"Status: 404 Not Found\nContent-Type: text/html\n\nFile not found.";
        let response = FcgiResponse::from_stdout(raw);

        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        assert_eq!(response.body, b"File not found.");
    }

    #[test]
    fn test_response_no_headers() {
        let response = FcgiResponse::from_stdout(b"8.2.12");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"8.2.12");
        assert!(response.headers.is_empty());
    }
}
