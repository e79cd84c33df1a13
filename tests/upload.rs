use edumeet::toon::ToonClient;
use edumeet::Error;

use bytes::Bytes;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use warp::Filter;

type Seen = Arc<Mutex<Option<(String, String)>>>;

/// Backend stand-in that records the raw multipart body and answers with a
/// fixed generation result.
fn spawn_backend(status: warp::http::StatusCode) -> (SocketAddr, Seen) {
    let seen: Seen = Arc::new(Mutex::new(None));
    let record = seen.clone();
    let route = warp::post()
        .and(warp::path("upload"))
        .and(warp::header::<String>("content-type"))
        .and(warp::body::bytes())
        .map(move |content_type: String, body: Bytes| {
            *record.lock().unwrap() =
                Some((content_type, String::from_utf8_lossy(&body).into_owned()));
            let reply = warp::reply::json(&serde_json::json!({
                "summary": "Photosynthesis in brief.",
                "videoPaths": ["/static/v1.mp4", "/static/v2.mp4"],
                "audioPath": "/static/output.mp3",
            }));
            warp::reply::with_status(reply, status)
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, seen)
}

fn document() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    write!(file, "Plants turn light into sugar.").unwrap();
    file
}

#[tokio::test]
async fn test_upload_sends_document_and_username() {
    let (addr, seen) = spawn_backend(warp::http::StatusCode::OK);
    let client = ToonClient::new(&format!("http://{}", addr));
    let doc = document();

    let media = client.upload(doc.path(), "ada").await.unwrap();
    let playback = media.render(client.origin());

    assert_eq!(playback.summary, "Photosynthesis in brief.");
    assert_eq!(
        playback.videos,
        vec![
            format!("http://{}/static/v1.mp4", addr),
            format!("http://{}/static/v2.mp4", addr),
        ]
    );
    assert_eq!(
        playback.audio,
        Some(format!("http://{}/static/output.mp3", addr))
    );

    let (content_type, body) = seen.lock().unwrap().clone().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    assert!(body.contains("name=\"document\""));
    assert!(body.contains("Plants turn light into sugar."));
    assert!(body.contains("name=\"username\""));
    assert!(body.contains("ada"));
}

#[tokio::test]
async fn test_backend_error_is_upload_failure() {
    let (addr, _) = spawn_backend(warp::http::StatusCode::INTERNAL_SERVER_ERROR);
    let client = ToonClient::new(&format!("http://{}", addr));
    let doc = document();

    let err = client.upload(doc.path(), "ada").await.unwrap_err();
    assert!(matches!(err, Error::UploadFailure(_)));
}

#[tokio::test]
async fn test_unreachable_backend_is_upload_failure() {
    let client = ToonClient::new("http://127.0.0.1:1");
    let doc = document();

    let err = client.upload(doc.path(), "ada").await.unwrap_err();
    assert!(matches!(err, Error::UploadFailure(_)));
}
