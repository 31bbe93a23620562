//! End-to-end behaviour over real sockets.

mod common;

use common::{roundtrip, start, Fixture, TestClient};
use std::fs;
use std::time::{Duration, Instant};

fn site() -> Fixture {
    Fixture::new()
        .file("index.html", "<h1>home</h1>")
        .file("a.txt", "alpha")
        .file("b.txt", "bravo")
        .file("docs/readme.txt", "read me")
        .file("errors/404.html", "<p>custom missing page</p>")
        .dir("pub/empty")
        .file("pub/one.txt", "1")
}

fn config(fx: &Fixture, extra_routes: &str) -> String {
    format!(
        "\
timeout_seconds: 5
cgi_timeout_seconds: 2
servers:
  - host: 127.0.0.1
    port: 0
    server_names: [alpha.test]
    error_pages:
      404: {root}/errors/404.html
    routes:
      - path: /
        root: {root}
        methods: [GET]
        index: [index.html]
      - path: /pub
        root: {root}
        methods: [GET]
        autoindex: on
      - path: /files
        root: {root}
        methods: [GET, POST, PUT, DELETE]
        upload_dir: {root}/files
        client_max_body_size: 1000
      - path: /old
        root: {root}
        redirect: 301 http://example.com/
{extra}",
        root = fx.root().display(),
        extra = extra_routes
    )
}

#[test]
fn serves_index_and_files() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let r = roundtrip(addr, "GET / HTTP/1.1\r\nHost: alpha.test\r\n\r\n");
    assert_eq!(r.status, 200);
    assert_eq!(r.text(), "<h1>home</h1>");
    assert!(r.header("content-type").unwrap().starts_with("text/html"));
    assert!(r.header("date").is_some());

    let r = roundtrip(addr, "GET /a.txt HTTP/1.0\r\n\r\n");
    assert_eq!(r.status, 200);
    assert_eq!(r.text(), "alpha");
}

#[test]
fn missing_file_uses_custom_error_page() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let r = roundtrip(addr, "GET /nope.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 404);
    assert_eq!(r.text(), "<p>custom missing page</p>");
}

#[test]
fn host_header_selects_virtual_host() {
    let a = Fixture::new().file("index.html", "site a");
    let b = Fixture::new().file("index.html", "site b");
    let addr = start(&format!(
        "\
servers:
  - host: 127.0.0.1
    port: 0
    server_names: [a.test]
    routes:
      - path: /
        root: {}
        index: [index.html]
  - host: 127.0.0.1
    port: 0
    server_names: [b.test]
    routes:
      - path: /
        root: {}
        index: [index.html]
",
        a.root().display(),
        b.root().display()
    ));

    let get = |host: &str| roundtrip(addr, format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host)).text();
    assert_eq!(get("a.test"), "site a");
    assert_eq!(get("B.TEST:8080"), "site b");
    assert_eq!(get("unknown.test"), "site a");
}

#[test]
fn disallowed_and_unknown_methods_get_405() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let r = roundtrip(addr, "DELETE /a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 405);
    assert_eq!(r.header("allow"), Some("GET"));
    assert!(fx.path("a.txt").exists());

    let r = roundtrip(addr, "BREW /a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 405);
}

#[test]
fn body_limit_is_inclusive() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let body = "x".repeat(1000);
    let r = roundtrip(
        addr,
        format!("POST /files/ok.bin HTTP/1.1\r\nHost: x\r\nContent-Length: 1000\r\n\r\n{}", body),
    );
    assert_eq!(r.status, 201);
    assert_eq!(fs::read(fx.path("files/ok.bin")).unwrap().len(), 1000);

    let body = "x".repeat(1001);
    let mut client = TestClient::connect(addr);
    let r = client
        .send(format!(
            "POST /files/big.bin HTTP/1.1\r\nHost: x\r\nContent-Length: 1001\r\n\r\n{}",
            body
        ))
        .reply();
    assert_eq!(r.status, 413);
    assert_eq!(r.header("connection"), Some("close"));
    assert!(!fx.path("files/big.bin").exists());
}

#[test]
fn chunked_body_over_limit_is_rejected() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let r = roundtrip(
        addr,
        "POST /files/c.bin HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
         3E8\r\n"
            .to_string()
            + &"y".repeat(1000)
            + "\r\n1\r\nz\r\n0\r\n\r\n",
    );
    assert_eq!(r.status, 413);
}

#[test]
fn upload_get_delete_cycle() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let r = roundtrip(
        addr,
        "PUT /files/note.txt HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
         5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    assert_eq!(r.status, 201);

    let r = roundtrip(addr, "GET /files/note.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 200);
    assert_eq!(r.text(), "hello world");

    let r = roundtrip(addr, "DELETE /files/note.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 200);

    let r = roundtrip(addr, "GET /files/note.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 404);
    let r = roundtrip(addr, "DELETE /files/note.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 404);
}

#[test]
fn post_without_length_is_bad_request() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let r = roundtrip(addr, "POST /files/x HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 400);
}

#[test]
fn configured_redirect_wins_over_content() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let r = roundtrip(addr, "GET /old/anything HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 301);
    assert_eq!(r.header("location"), Some("http://example.com/"));
}

#[test]
fn directories_redirect_then_list() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let r = roundtrip(addr, "GET /pub HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 301);
    assert_eq!(r.header("location"), Some("/pub/"));

    let r = roundtrip(addr, "GET /pub/ HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 200);
    let html = r.text();
    assert!(html.contains("Index of /pub/"));
    assert!(html.find("empty/").unwrap() < html.find("one.txt").unwrap());

    // No index and no listing under `/`.
    let r = roundtrip(addr, "GET /docs/ HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 403);
}

#[test]
fn encoded_traversal_stays_inside_root() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let r = roundtrip(addr, "GET /%2E%2E%2F%2E%2E%2Fetc%2Fpasswd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 404);
    assert!(!r.text().contains("root:"));

    let r = roundtrip(addr, "GET /docs/../a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.text(), "alpha");

    let r = roundtrip(addr, "GET /a%zz HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 400);
    let r = roundtrip(addr, "GET /a%00.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 400);
}

#[test]
fn missing_host_on_http11_is_bad_request() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let r = roundtrip(addr, "GET / HTTP/1.1\r\n\r\n");
    assert_eq!(r.status, 400);
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let fx = site();
    let addr = start(&config(&fx, ""));

    let mut client = TestClient::connect(addr);
    client.send(
        "GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n\
         GET /missing HTTP/1.1\r\nHost: x\r\n\r\n\
         GET /b.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    let first = client.reply();
    let second = client.reply();
    let third = client.reply();
    assert_eq!((first.status, first.text().as_str()), (200, "alpha"));
    assert_eq!(second.status, 404);
    assert_eq!((third.status, third.text().as_str()), (200, "bravo"));
    assert!(client.is_closed());
}

#[test]
fn keep_alive_serves_several_requests() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let mut client = TestClient::connect(addr);
    for _ in 0..3 {
        let r = client.send("GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").reply();
        assert_eq!(r.status, 200);
        assert_eq!(r.header("connection"), Some("keep-alive"));
    }
}

#[test]
fn expect_continue_gets_interim_response() {
    let fx = site();
    let addr = start(&config(&fx, ""));
    let mut client = TestClient::connect(addr);
    client.send("POST /files/e.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n");

    let mut interim = [0u8; 25];
    std::io::Read::read_exact(&mut client.stream, &mut interim).unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    let r = client.send("data").reply();
    assert_eq!(r.status, 201);
    assert_eq!(fs::read(fx.path("files/e.txt")).unwrap(), b"data");
}

fn cgi_site() -> Fixture {
    site()
        .script(
            "cgi/info.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             printf 'method=%s query=%s info=%s script=%s\\n' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$PATH_INFO\" \"$SCRIPT_NAME\"\n",
        )
        .script("cgi/echo.sh", "printf 'Content-Type: text/plain\\n\\n'\ncat\n")
        .script(
            "cgi/big.sh",
            "printf 'Content-Type: text/plain\\n\\n'\nhead -c 3000000 /dev/zero | tr '\\000' 'a'\n",
        )
        .script("cgi/slow.sh", "sleep 10\n")
        .script(
            "cgi/endless.sh",
            "printf 'Content-Type: text/plain\\n\\n'\nexec yes 0123456789abcdef\n",
        )
        .script(
            "cgi/moved.sh",
            "printf 'Location: /a.txt\\n\\n'\n",
        )
        .script("cgi/broken.sh", "echo 'this is not a header block'\n")
        .script(
            "cgi/linger.sh",
            "echo $$ > linger.pid\nprintf 'Content-Type: text/plain\\n\\n'\nsleep 30\n",
        )
}

fn cgi_config(fx: &Fixture) -> String {
    config(
        fx,
        &format!(
            "      - path: /cgi
        root: {}
        methods: [GET, POST]
        cgi: {{ .sh: /bin/sh }}
",
            fx.root().display()
        ),
    )
}

#[test]
fn cgi_receives_request_metadata() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(addr, "GET /cgi/info.sh/extra/path?x=1&y=2 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 200);
    assert_eq!(r.header("transfer-encoding"), Some("chunked"));
    assert_eq!(
        r.text(),
        "method=GET query=x=1&y=2 info=/extra/path script=/cgi/info.sh\n"
    );
}

#[test]
fn cgi_reads_the_request_body() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(
        addr,
        "POST /cgi/echo.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello there",
    );
    assert_eq!(r.status, 200);
    assert_eq!(r.text(), "hello there");
}

#[test]
fn cgi_streams_large_output() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let mut client = TestClient::connect(addr);
    let r = client.send("GET /cgi/big.sh HTTP/1.1\r\nHost: x\r\n\r\n").reply();
    assert_eq!(r.status, 200);
    assert_eq!(r.body.len(), 3_000_000);
    assert!(r.body.iter().all(|&b| b == b'a'));

    // The connection survives for another request.
    let r = client.send("GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").reply();
    assert_eq!(r.text(), "alpha");
}

#[test]
fn cgi_output_for_http10_is_close_delimited() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(addr, "GET /cgi/info.sh?q HTTP/1.0\r\n\r\n");
    assert_eq!(r.status, 200);
    assert_eq!(r.header("connection"), Some("close"));
    assert!(r.header("content-length").is_none());
    assert!(r.text().starts_with("method=GET query=q"));
}

#[test]
fn cgi_location_header_redirects() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(addr, "GET /cgi/moved.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 302);
    assert_eq!(r.header("location"), Some("/a.txt"));
}

#[test]
fn cgi_without_header_block_is_500() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(addr, "GET /cgi/broken.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 500);
}

#[test]
fn missing_script_is_404() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let r = roundtrip(addr, "GET /cgi/nothing.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 404);
}

#[test]
fn silent_script_times_out_with_504() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let started = Instant::now();
    let r = roundtrip(addr, "GET /cgi/slow.sh HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(r.status, 504);
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[test]
fn stalled_reader_pauses_the_script_without_timing_it_out() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));

    let mut client = TestClient::connect(addr);
    client.send("GET /cgi/endless.sh HTTP/1.1\r\nHost: x\r\n\r\n");

    // Longer than the two-second script timeout; output is paused meanwhile.
    std::thread::sleep(Duration::from_secs(4));

    let mut received = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0;
    while total < 16 * 1024 * 1024 {
        let n = std::io::Read::read(&mut client.stream, &mut buf).unwrap();
        assert!(n > 0, "stream ended after {} bytes", total);
        if received.len() < 512 {
            received.extend_from_slice(&buf[..n.min(512)]);
        }
        total += n;
    }

    let head = String::from_utf8_lossy(&received);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("0123456789abcdef\n"));
}

#[test]
fn client_disconnect_kills_the_script() {
    let fx = cgi_site();
    let addr = start(&cgi_config(&fx));
    let pid_file = fx.path("cgi/linger.pid");

    let mut client = TestClient::connect(addr);
    client.send("GET /cgi/linger.sh HTTP/1.1\r\nHost: x\r\n\r\n");

    let deadline = Instant::now() + Duration::from_secs(5);
    let pid = loop {
        if let Some(pid) = fs::read_to_string(&pid_file)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
        {
            break pid;
        }
        assert!(Instant::now() < deadline, "script never started");
        std::thread::sleep(Duration::from_millis(20));
    };
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(5);
    // SAFETY: signal 0 only checks that the pid exists.
    while unsafe { libc::kill(pid, 0) } == 0 {
        assert!(Instant::now() < deadline, "script {} still alive", pid);
        std::thread::sleep(Duration::from_millis(20));
    }
}
