//! Scripted HTTP server for store and credential tests.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub line: String,
    pub headers: Vec<String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|header| {
            let (key, value) = header.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then_some(value.trim())
        })
    }

    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|err| panic!("request body is not JSON: {err}; body={}", self.body))
    }
}

/// Answer one connection per scripted `(status line, body)` pair, in order,
/// and hand back every request that arrived.
pub(crate) fn serve_sequence(
    responses: Vec<(&'static str, String)>,
) -> (String, JoinHandle<Vec<RecordedRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("failed to bind fake server: {err}"));
    let addr =
        listener.local_addr().unwrap_or_else(|err| panic!("fake server has no address: {err}"));

    let handle = thread::spawn(move || {
        let mut recorded = Vec::with_capacity(responses.len());
        for (status_line, body) in responses {
            let (mut stream, _) =
                listener.accept().unwrap_or_else(|err| panic!("fake server accept failed: {err}"));
            let mut reader = BufReader::new(
                stream.try_clone().unwrap_or_else(|err| panic!("failed to clone stream: {err}")),
            );

            let mut line = String::new();
            let mut request_line = String::new();
            let mut headers = Vec::new();
            loop {
                line.clear();
                let read = reader
                    .read_line(&mut line)
                    .unwrap_or_else(|err| panic!("failed to read request: {err}"));
                if read == 0 || line == "\r\n" {
                    break;
                }
                if request_line.is_empty() {
                    request_line = line.trim().to_string();
                } else {
                    headers.push(line.trim().to_string());
                }
            }

            let mut request = RecordedRequest { line: request_line, headers, body: String::new() };
            let length = request
                .header("content-length")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(0);
            let mut bytes = vec![0_u8; length];
            reader
                .read_exact(&mut bytes)
                .unwrap_or_else(|err| panic!("failed to read request body: {err}"));
            request.body = String::from_utf8_lossy(&bytes).to_string();

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .unwrap_or_else(|err| panic!("failed to write response: {err}"));
            recorded.push(request);
        }
        recorded
    });

    (format!("http://{addr}"), handle)
}

pub(crate) fn finish(server: JoinHandle<Vec<RecordedRequest>>) -> Vec<RecordedRequest> {
    server.join().unwrap_or_else(|_| panic!("fake server thread panicked"))
}
