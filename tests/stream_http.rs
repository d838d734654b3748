use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use facet_vision::stream::{StreamServer, VideoStream};

fn request(addr: SocketAddr, line: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect to stream server");
    stream
        .write_all(format!("{line}\r\nHost: test\r\n\r\n").as_bytes())
        .expect("send request");
    stream
}

/// Reads until the peer closes the connection or the deadline passes.
fn read_to_end(stream: &mut TcpStream, deadline: Duration) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let start = Instant::now();
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    while start.elapsed() < deadline {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue
            }
            Err(_) => break,
        }
    }
    data
}

/// Reads until `needle` shows up in the stream. MJPEG responses never end,
/// so plain read-to-EOF would hang on them.
fn read_until(stream: &mut TcpStream, needle: &[u8], deadline: Duration) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let start = Instant::now();
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    while start.elapsed() < deadline && !contains(&data, needle) {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue
            }
            Err(_) => break,
        }
    }
    data
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn index_links_every_stream() {
    let server = StreamServer::new(
        "127.0.0.1:0",
        vec![VideoStream::new("front"), VideoStream::new("rear")],
        30.0,
    );
    let handle = server.spawn().expect("spawn stream server");

    let mut conn = request(handle.addr, "GET / HTTP/1.1");
    let body = read_to_end(&mut conn, Duration::from_secs(2));
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.contains("Content-Type: text/html"));
    assert!(text.contains("/front.mjpg"));
    assert!(text.contains("/rear.mjpg"));

    handle.stop().unwrap();
}

#[test]
fn unknown_stream_name_is_a_404() {
    let server = StreamServer::new("127.0.0.1:0", vec![VideoStream::new("front")], 30.0);
    let handle = server.spawn().expect("spawn stream server");

    let mut conn = request(handle.addr, "GET /missing.mjpg HTTP/1.1");
    let body = read_to_end(&mut conn, Duration::from_secs(2));
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("HTTP/1.1 404 Not Found"), "got: {text}");
    assert!(text.contains("not found"));

    handle.stop().unwrap();
}

#[test]
fn non_get_method_is_rejected() {
    let server = StreamServer::new("127.0.0.1:0", vec![VideoStream::new("front")], 30.0);
    let handle = server.spawn().expect("spawn stream server");

    let mut conn = request(handle.addr, "POST / HTTP/1.1");
    let body = read_to_end(&mut conn, Duration::from_secs(2));
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed"), "got: {text}");

    handle.stop().unwrap();
}

#[test]
fn mjpeg_endpoint_multiplexes_published_frames() {
    let video = VideoStream::new("cam");
    let jpeg = b"\xff\xd8 not a real jpeg \xff\xd9".to_vec();
    video.publish(jpeg.clone()).unwrap();

    let server = StreamServer::new("127.0.0.1:0", vec![video.clone()], 30.0);
    let handle = server.spawn().expect("spawn stream server");

    let mut conn = request(handle.addr, "GET /cam.mjpg HTTP/1.1");
    let body = read_until(&mut conn, &jpeg, Duration::from_secs(5));
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.contains("multipart/x-mixed-replace; boundary=facetframe"));
    assert!(text.contains("--facetframe"));
    assert!(text.contains("Content-Type: image/jpeg"));
    assert!(text.contains(&format!("Content-Length: {}", jpeg.len())));
    assert!(contains(&body, &jpeg), "jpeg payload missing from stream");

    // The stream keeps running; a second part arrives with the same bytes.
    let more = read_until(&mut conn, &jpeg, Duration::from_secs(5));
    assert!(contains(&more, &jpeg), "stream stopped after one part");

    drop(conn);
    handle.stop().unwrap();
}

#[test]
fn query_strings_are_ignored_when_routing() {
    let video = VideoStream::new("cam");
    video.publish(vec![0xff, 0xd8, 0xff, 0xd9]).unwrap();
    let server = StreamServer::new("127.0.0.1:0", vec![video], 30.0);
    let handle = server.spawn().expect("spawn stream server");

    let mut conn = request(handle.addr, "GET /cam.mjpg?t=123 HTTP/1.1");
    let body = read_until(&mut conn, b"--facetframe", Duration::from_secs(5));
    assert!(
        contains(&body, b"multipart/x-mixed-replace"),
        "query string broke routing: {}",
        String::from_utf8_lossy(&body)
    );

    drop(conn);
    handle.stop().unwrap();
}
