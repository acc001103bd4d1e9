use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt as _;
use tower::ServiceExt as _;

use clap::Parser as _;
use novelpress::app::server::{AppState, build_state, router};
use novelpress::cli::{Cli, Command};
use novelpress::epub::Book;

static LOGO_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

const CHAPTER_CSS: &str = ".Zq8xYw1B { display: none; }\n.line-break { height: 1em; }\n";

fn chapter_page(base_url: &str, title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
  <head>
    <link rel="stylesheet" href="/css/site.css">
    <link rel="stylesheet" href="/css/chapitre-42.css">
  </head>
  <body>
    <main><div><div><span>Foo</span><span>{title}</span></div></div></main>
    <div id="textContainer">
      <div class="chapter-obf">
        <p>{body}<span class="Zq8xYw1B">NOISE</span></p>
        <p><img src="{base_url}/img/logo.png" alt="logo"></p>
      </div>
    </div>
  </body>
</html>
"#
    )
}

fn spawn_upstream() -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let base_url = format!("http://{}", server.server_addr());
    let page_base = base_url.clone();

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };

            let url = request.url().to_string();
            let response = match url.as_str() {
                "/a" => tiny_http::Response::from_string(chapter_page(
                    &page_base,
                    "Chapitre 1 : Le début",
                    "Hello",
                )),
                "/b" => tiny_http::Response::from_string(chapter_page(
                    &page_base,
                    "Chapitre 2 : La suite",
                    "World",
                )),
                "/slow" => {
                    thread::sleep(Duration::from_millis(300));
                    tiny_http::Response::from_string(chapter_page(&page_base, "Chapitre 1", "Slow"))
                }
                "/css/chapitre-42.css" => tiny_http::Response::from_string(CHAPTER_CSS),
                "/css/site.css" => tiny_http::Response::from_string("body { margin: 0; }"),
                "/img/logo.png" => tiny_http::Response::from_data(LOGO_PNG.to_vec()),
                _ => tiny_http::Response::from_string("not found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });

    (base_url, shutdown_tx, handle)
}

fn app_state(root: &Path, upstream_url: &str) -> AppState {
    let cli = Cli::try_parse_from([
        "novelpress",
        "serve",
        "--root",
        root.to_str().expect("utf-8 root"),
        "--upstream-url",
        upstream_url,
        "--request-timeout-secs",
        "5",
        "--merge-delay-secs",
        "60",
    ])
    .expect("parse serve args");
    let Command::Serve(args) = cli.command else {
        panic!("expected serve");
    };
    build_state(&args).expect("build app state")
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router(state.clone())
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec();
    (status, headers, body)
}

fn dump(path: &str, json: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_string()))
        .expect("build request")
}

fn get(method: &str, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("build request")
}

async fn wait_until_idle(state: &AppState, novel: &str, volume: &str) {
    for _ in 0..1000 {
        if !state.controller.is_running(novel, volume) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {novel}/{volume} never finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dump_builds_chapters_and_merged_volume() {
    let (base_url, shutdown_tx, handle) = spawn_upstream();
    let root = tempfile::tempdir().expect("tempdir");
    let state = app_state(root.path(), &base_url);

    let request = r#"{
        "chapters": ["/a", "/b"],
        "creators": [{"name": "Author", "role": "aut"}],
        "description": "Synopsis",
        "subjects": ["Fantasy"]
    }"#;
    let (status, _, body) = send(&state, dump("/Foo/Bar", request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepted: Vec<String> = serde_json::from_slice(&body).expect("json body");
    assert_eq!(accepted, vec!["/a", "/b"]);

    wait_until_idle(&state, "Foo", "Bar").await;

    let folder = root.path().join("Foo").join("Bar");
    assert!(folder.join("a.epub").is_file());
    assert!(folder.join("b.epub").is_file());

    let chapter = Book::read(&folder.join("a.epub")).expect("read chapter book");
    assert_eq!(chapter.metadata().title, "Chapitre 1 : Le début");
    assert_eq!(chapter.metadata().collections[0].name, "Foo");
    assert_eq!(chapter.metadata().collections[0].number.as_deref(), Some("0.1"));
    let html = &chapter.pages()[0].html;
    assert!(html.contains("Hello"));
    assert!(!html.contains("NOISE"));
    assert!(html.contains("data:image/png;base64,"));

    let merged_path = root.path().join("Foo").join("Bar.epub");
    let merged = Book::read(&merged_path).expect("read merged volume");
    assert_eq!(merged.metadata().title, "Bar");
    let titles = merged
        .pages()
        .iter()
        .map(|p| p.title.as_str())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Chapitre 1 : Le début", "Chapitre 2 : La suite"]);
    assert_eq!(merged.metadata().subjects, vec!["Fantasy"]);

    let (status, _, body) = send(&state, dump("/Foo/Bar", r#"{"chapters": ["/a", "/b"]}"#)).await;
    assert_eq!(status, StatusCode::ALREADY_REPORTED);
    assert_eq!(body, b"[]");

    let _ = shutdown_tx.send(());
    handle.join().expect("join upstream");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_dump_of_same_volume_is_locked() {
    let (base_url, shutdown_tx, handle) = spawn_upstream();
    let root = tempfile::tempdir().expect("tempdir");
    let state = app_state(root.path(), &base_url);

    let (status, _, _) = send(&state, dump("/Foo/Slow", r#"{"chapters": ["/slow"]}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = send(&state, dump("/Foo/Slow", r#"{"chapters": ["/slow"]}"#)).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert!(body.is_empty());

    wait_until_idle(&state, "Foo", "Slow").await;
    assert!(root.path().join("Foo").join("Slow").join("slow.epub").is_file());

    let _ = shutdown_tx.send(());
    handle.join().expect("join upstream");
}

#[tokio::test]
async fn dump_rejects_bad_paths_and_bodies() {
    let root = tempfile::tempdir().expect("tempdir");
    let state = app_state(root.path(), "http://127.0.0.1:9/");

    let (status, _, _) = send(&state, dump("/Foo", r#"{"chapters": []}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&state, dump("/Foo/Bar/Baz", r#"{"chapters": []}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&state, dump("/Foo/Bar", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let foreign = r#"{"chapters": ["/a", "https://elsewhere.example/b"]}"#;
    let (status, _, body) = send(&state, dump("/Foo/Bar", foreign)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("elsewhere.example"));
    assert!(!root.path().join("Foo").join("Bar").exists());
}

#[tokio::test]
async fn dump_answers_cross_origin_preflight() {
    let root = tempfile::tempdir().expect("tempdir");
    let state = app_state(root.path(), "http://127.0.0.1:9/");

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/Foo/Bar")
        .header(header::ORIGIN, "https://world-novel.fr")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .expect("build request");
    let (status, headers, _) = send(&state, preflight).await;
    assert!(status.is_success());
    assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));

    let mut request = dump("/Foo/Bar", "not json");
    request
        .headers_mut()
        .insert(header::ORIGIN, "https://world-novel.fr".parse().expect("origin"));
    let (status, headers, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn browse_lists_directories_and_serves_files() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(root.path().join("Foo")).expect("mkdir");
    std::fs::write(root.path().join("Foo").join("Bar.epub"), b"PK").expect("write");
    let state = app_state(root.path(), "http://127.0.0.1:9/");

    let (status, _, body) = send(&state, get("GET", "/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("href=\"/Foo\""));

    let (status, _, body) = send(&state, get("GET", "/Foo")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("Bar.epub"));

    let (status, headers, body) = send(&state, get("GET", "/Foo/Bar.epub")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/epub+zip");
    assert_eq!(body, b"PK");

    let (status, _, _) = send(&state, get("HEAD", "/Foo/Bar.epub")).await;
    assert_eq!(status, StatusCode::FOUND);

    let (status, _, _) = send(&state, get("HEAD", "/Foo")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _, _) = send(&state, get("GET", "/Missing.epub")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

const BOUNDARY: &str = "novelpress-test-boundary";

fn multipart(parts: &[(&str, &str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, content_type, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("build request")
}

#[tokio::test]
async fn upload_builds_one_chapter_book() {
    let root = tempfile::tempdir().expect("tempdir");
    let state = app_state(root.path(), "http://127.0.0.1:9/");

    let metadata: &[u8] = br#"{
        "title": "Chapitre 3",
        "collections": [{"name": "Foo", "number": 2}],
        "volumeName": "Tome 2",
        "chapterCount": 12
    }"#;
    let html: &[u8] = b"<p>Uploaded</p><p><img src=\"images/pic.png\" /></p>";

    let (status, _, body) = send(&state, multipart(&[("chapter.html", "text/html", html)])).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(String::from_utf8_lossy(&body).contains("metadata.json"));

    let (status, _, _) = send(
        &state,
        multipart(&[
            ("chapter.html", "text/html", html),
            ("metadata.json", "text/plain", metadata),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);

    let (status, _, _) = send(
        &state,
        multipart(&[
            ("chapter.html", "text/html", html),
            ("metadata.json", "application/json", &b"{"[..]),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);

    let (status, _, _) = send(
        &state,
        multipart(&[
            ("chapter.html", "text/html", html),
            ("metadata.json", "application/json", metadata),
            ("pic.png", "application/octet-stream", LOGO_PNG),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);

    let valid = [
        ("chapter.html", "text/html", html),
        ("metadata.json", "application/json", metadata),
        ("pic.png", "image/png", LOGO_PNG),
    ];
    let (status, _, _) = send(&state, multipart(&valid)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let path = root.path().join("Foo").join("Tome_2").join("Chapitre 3.epub");
    let book = Book::read(&path).expect("read uploaded book");
    assert_eq!(book.metadata().title, "Chapitre 3");
    assert_eq!(book.metadata().collections[0].number.as_deref(), Some("2.03"));
    assert_eq!(book.images().len(), 1);
    assert!(book.pages()[0].html.contains("Uploaded"));

    let (status, _, _) = send(&state, multipart(&valid)).await;
    assert_eq!(status, StatusCode::ALREADY_REPORTED);
}
