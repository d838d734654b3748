//! Debug video streaming.
//!
//! Each camera worker runs one small HTTP server. `GET /` is an HTML index
//! of the camera's streams; `GET /<name>.mjpg` serves the stream as
//! `multipart/x-mixed-replace` JPEG parts, paced at the camera's nominal
//! rate. The pipeline writes into a [`VideoStream`] slot that always holds
//! the latest encoded frame, so a slow viewer only ever costs itself
//! frames, never the pipeline.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::debug;

use crate::table::Table;

const MAX_REQUEST_BYTES: usize = 8192;
const MJPEG_BOUNDARY: &str = "facetframe";

/// Single-slot holder for the most recent encoded frame of one stream.
#[derive(Clone)]
pub struct VideoStream {
    name: Arc<str>,
    latest: Arc<Mutex<Option<Arc<Vec<u8>>>>>,
}

impl VideoStream {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, jpeg: Vec<u8>) -> Result<()> {
        let mut slot = self
            .latest
            .lock()
            .map_err(|_| anyhow!("stream slot lock poisoned"))?;
        *slot = Some(Arc::new(jpeg));
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Option<Arc<Vec<u8>>>> {
        let slot = self
            .latest
            .lock()
            .map_err(|_| anyhow!("stream slot lock poisoned"))?;
        Ok(slot.clone())
    }
}

#[derive(Debug)]
pub struct StreamHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Stops accepting and joins the accept thread. Client threads notice
    /// the flag and exit within roughly one frame period on their own.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StreamServer {
    addr: String,
    streams: Vec<VideoStream>,
    fps: f64,
}

impl StreamServer {
    pub fn new(addr: impl Into<String>, streams: Vec<VideoStream>, fps: f64) -> Self {
        Self {
            addr: addr.into(),
            streams,
            fps,
        }
    }

    pub fn spawn(self) -> Result<StreamHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let streams = self.streams;
        let fps = self.fps;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, streams, fps, shutdown_thread) {
                log::error!("stream server stopped: {err:#}");
            }
        });

        Ok(StreamHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    streams: Vec<VideoStream>,
    fps: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("stream viewer connected from {peer}");
                let streams = streams.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    if let Err(err) = serve_connection(stream, &streams, fps, &shutdown) {
                        debug!("stream viewer {peer} dropped: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn serve_connection(
    mut stream: TcpStream,
    streams: &[VideoStream],
    fps: f64,
    shutdown: &AtomicBool,
) -> Result<()> {
    let (method, path) = read_request(&mut stream)?;
    if method != "GET" {
        return write_response(
            &mut stream,
            "405 Method Not Allowed",
            "text/plain",
            b"method not allowed\n",
        );
    }
    if path == "/" {
        let body = index_page(streams);
        return write_response(&mut stream, "200 OK", "text/html", body.as_bytes());
    }
    let wanted = path.strip_prefix('/').and_then(|p| p.strip_suffix(".mjpg"));
    match wanted.and_then(|name| streams.iter().find(|s| s.name() == name)) {
        Some(video) => stream_mjpeg(&mut stream, video, fps, shutdown),
        None => write_response(&mut stream, "404 Not Found", "text/plain", b"not found\n"),
    }
}

fn stream_mjpeg(
    stream: &mut TcpStream,
    video: &VideoStream,
    fps: f64,
    shutdown: &AtomicBool,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nCache-Control: no-store\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(period);
        let Some(jpeg) = video.snapshot()? else {
            continue;
        };
        let part = format!(
            "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        // a failed write means the viewer went away, which is routine
        if stream.write_all(part.as_bytes()).is_err()
            || stream.write_all(&jpeg).is_err()
            || stream.write_all(b"\r\n").is_err()
        {
            break;
        }
    }
    Ok(())
}

fn index_page(streams: &[VideoStream]) -> String {
    let mut body = String::from(
        "<!DOCTYPE html>\n<html><head><title>facetd streams</title></head><body>\n",
    );
    for video in streams {
        let name = video.name();
        body.push_str(&format!(
            "<h2>{name}</h2>\n<img src=\"/{name}.mjpg\" alt=\"{name}\" />\n"
        ));
    }
    body.push_str("</body></html>\n");
    body
}

fn read_request(stream: &mut TcpStream) -> Result<(String, String)> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path);
    Ok((method.to_string(), path.to_string()))
}

fn write_response(
    stream: &mut TcpStream,
    status_line: &str,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

/// Camera record in the published table.
///
/// Dashboards key off `connected` and `streams`; the rest is description.
pub struct PublishedStream {
    table: Table,
}

#[derive(Clone, Debug)]
pub struct StreamRecord {
    pub description: String,
    pub source: String,
    pub modes: Vec<String>,
    pub mode: String,
    pub stream_urls: Vec<String>,
}

impl PublishedStream {
    pub fn publish(table: Table, record: &StreamRecord) -> Result<PublishedStream> {
        table.put("connected", true)?;
        table.put("description", record.description.as_str())?;
        table.put("source", record.source.as_str())?;
        table.put("modes", record.modes.clone())?;
        table.put("mode", record.mode.as_str())?;
        table.put("streams", record.stream_urls.clone())?;
        Ok(PublishedStream { table })
    }

    pub fn set_mode(&self, mode: &str) -> Result<()> {
        self.table.put("mode", mode)
    }

    /// Marks the camera gone without deleting the record, so dashboards
    /// show it greyed out rather than vanished.
    pub fn disable(&self) -> Result<()> {
        self.table.put("connected", false)?;
        self.table.put("streams", Vec::<String>::new())?;
        Ok(())
    }
}

/// Viewer-facing URLs for the given stream names.
pub fn stream_urls(host: &str, port: u16, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| format!("mjpg:http://{host}:{port}/{name}.mjpg"))
        .collect()
}
