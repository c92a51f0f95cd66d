#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use image::RgbImage;

use crack_relay::detect::{BoundingBox, ClassNames, DetectedBox, Detection, ScriptedFrame};
use crack_relay::frame::Frame;
use crack_relay::sequence::BufferedFrame;

/// A request as seen by [`ScriptedServer`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

#[derive(Clone, Debug)]
pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// One-connection-per-request HTTP server that replies from a script and
/// records what it received. Stops listening once the script is used up.
pub struct ScriptedServer {
    listener: Option<TcpListener>,
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        Self {
            listener: Some(listener),
            addr,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(&mut self, responses: Vec<ScriptedResponse>) {
        let listener = self.listener.take().expect("serve called once");
        let requests = self.requests.clone();
        thread::spawn(move || {
            let mut script: VecDeque<ScriptedResponse> = responses.into();
            while let Some(response) = script.pop_front() {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                handle(stream, &response, &requests);
            }
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Records the request before replying, so a client that has its response
/// always finds its request recorded.
fn handle(
    mut stream: TcpStream,
    response: &ScriptedResponse,
    requests: &Mutex<Vec<RecordedRequest>>,
) -> Option<()> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).ok()?;
    requests.lock().unwrap().push(RecordedRequest {
        method,
        path,
        headers,
        body,
    });

    let mut reply = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        reply.push_str(&format!("{}: {}\r\n", name, value));
    }
    reply.push_str("\r\n");
    reply.push_str(&response.body);
    stream.write_all(reply.as_bytes()).ok()?;
    stream.flush().ok()
}

pub fn crack_names() -> Arc<ClassNames> {
    Arc::new(ClassNames::from_list([
        "Longitudinal".to_string(),
        "Transverse".to_string(),
    ]))
}

pub fn boxes(coords: &[(u32, u32, u32, u32)], class_id: u32) -> Vec<DetectedBox> {
    coords
        .iter()
        .map(|&(x1, y1, x2, y2)| DetectedBox {
            bbox: BoundingBox::new(x1, y1, x2, y2).expect("valid box"),
            class_id,
            score: 0.9,
        })
        .collect()
}

pub fn scripted(coords: &[(u32, u32, u32, u32)]) -> ScriptedFrame {
    ScriptedFrame::Boxes(boxes(coords, 0))
}

/// The three-frame crossing sequence at a 100px margin.
pub fn crossing_sequence() -> Vec<BufferedFrame> {
    [(5, 0, 20, 30), (50, 0, 70, 40), (120, 0, 140, 35)]
        .iter()
        .enumerate()
        .map(|(i, &coords)| BufferedFrame {
            frame: Frame::new(
                RgbImage::from_pixel(200, 60, image::Rgb([200, 200, 200])),
                i as u64 + 1,
                format!("frame-{}", i + 1),
            ),
            detection: Detection::new(boxes(&[coords], 0), crack_names()),
        })
        .collect()
}
