use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};

use mockall::mock;
use prov_client::client::{BUILD_ENDPOINT, TAR_CONTENT_TYPE, UPLOAD_ACTION};
use prov_client::{
    BuildOptions, ClientError, EngineClient, ServerError, Transport, TransportError,
    UploadRequest, display_messages,
};
use prov_core::{LastOnly, ProgressEvent, ProgressSink, SharedBuffer, TextProgress};

mock! {
    Engine {}

    impl Transport for Engine {
        fn post(&self, request: UploadRequest) -> Result<Box<dyn Read + Send>, TransportError>;
    }
}

fn body(text: &str) -> Box<dyn Read + Send> {
    Box::new(Cursor::new(text.as_bytes().to_vec()))
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ProgressEvent>>>);

impl ProgressSink for Recorder {
    fn emit(&mut self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

// ── Request shape ──

#[test]
fn build_posts_tar_to_engine_endpoint() {
    let mut mock = MockEngine::new();
    mock.expect_post()
        .withf(|request| {
            request.endpoint == BUILD_ENDPOINT
                && request.content_type == TAR_CONTENT_TYPE
                && request.query
                    == vec![("enginefile".to_owned(), "engines/Enginefile".to_owned())]
        })
        .times(1)
        .returning(|_| Ok(body("")));

    let client = EngineClient::with_transport(mock);
    let options = BuildOptions::for_specfile(Path::new("engines/Enginefile"));
    let messages = client.build(body("tar"), &options).unwrap();
    assert_eq!(messages.count(), 0);
}

#[test]
fn request_body_is_the_archive() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let mut mock = MockEngine::new();
    mock.expect_post().times(1).returning(move |mut request| {
        request.body.read_to_end(&mut sink.lock().unwrap()).unwrap();
        Ok(body(""))
    });

    let client = EngineClient::with_transport(mock);
    client
        .upload(Cursor::new(b"archive-bytes".to_vec()), Path::new("Enginefile"), Recorder::default())
        .unwrap();
    assert_eq!(&*received.lock().unwrap(), b"archive-bytes");
}

// ── Upload progress ──

#[test]
fn upload_reports_single_final_event() {
    let recorder = Recorder::default();

    let mut mock = MockEngine::new();
    mock.expect_post().returning(|mut request| {
        std::io::copy(&mut request.body, &mut std::io::sink()).unwrap();
        Ok(body(""))
    });

    let client = EngineClient::with_transport(mock);
    client
        .upload(Cursor::new(vec![0u8; 4096]), Path::new("Enginefile"), recorder.clone())
        .unwrap();

    let events = recorder.0.lock().unwrap();
    let finals: Vec<_> = events.iter().filter(|e| e.is_final).collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].bytes_transferred, 4096);
    assert_eq!(finals[0].total_bytes, None);
    assert_eq!(finals[0].action, UPLOAD_ACTION);
}

#[test]
fn quiet_progress_keeps_only_final_line() {
    let buffer = SharedBuffer::new();
    let sink = LastOnly(TextProgress::new(buffer.clone()));

    let mut mock = MockEngine::new();
    mock.expect_post().returning(|mut request| {
        std::io::copy(&mut request.body, &mut std::io::sink()).unwrap();
        Ok(body(""))
    });

    EngineClient::with_transport(mock)
        .upload(Cursor::new(vec![0u8; 2 * 1024 * 1024]), Path::new("Enginefile"), sink)
        .unwrap();

    let text = String::from_utf8(buffer.contents()).unwrap();
    assert_eq!(text.lines().count(), 1, "got: {text:?}");
    assert!(text.starts_with(UPLOAD_ACTION));
}

// ── Failures ──

#[test]
fn transport_failure_is_returned() {
    let mut mock = MockEngine::new();
    mock.expect_post().returning(|_| {
        Err(TransportError::Status {
            status: 500,
            message: "engine exploded".to_owned(),
        })
    });

    let client = EngineClient::with_transport(mock);
    let err = client
        .build(body(""), &BuildOptions::for_specfile(Path::new("Enginefile")))
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::Status { status: 500, .. })));
    assert!(err.to_string().contains("engine exploded"));
}

#[test]
fn server_error_ends_the_build() {
    let mut mock = MockEngine::new();
    mock.expect_post().returning(|_| {
        Ok(body(concat!(
            "{\"stream\":\"Step 1/3 : RUN true\\n\"}\n",
            "{\"errorDetail\":{\"code\":2,\"message\":\"step failed\"},\"error\":\"step failed\"}\n",
        )))
    });

    let client = EngineClient::with_transport(mock);
    let messages = client
        .build(body(""), &BuildOptions::for_specfile(Path::new("Enginefile")))
        .unwrap();

    let mut out = Vec::new();
    let err = display_messages(messages, &mut out, false).unwrap_err();
    let ClientError::Server(server) = err else {
        panic!("expected server error, got {err}");
    };
    assert_eq!(server, ServerError::new("step failed", 2));
    assert_eq!(server.exit_code(), 2);
    assert_eq!(String::from_utf8(out).unwrap(), "Step 1/3 : RUN true\n");
}

#[test]
fn server_error_without_code_exits_one() {
    let mut mock = MockEngine::new();
    mock.expect_post()
        .returning(|_| Ok(body("{\"errorDetail\":{\"message\":\"nope\"}}\n")));

    let messages = EngineClient::with_transport(mock)
        .build(body(""), &BuildOptions::for_specfile(Path::new("Enginefile")))
        .unwrap();
    let err = display_messages(messages, &mut std::io::sink(), false).unwrap_err();
    let ClientError::Server(server) = err else {
        panic!("expected server error, got {err}");
    };
    assert_eq!(server.code, 0);
    assert_eq!(server.exit_code(), 1);
}

#[test]
fn successful_stream_is_mirrored() {
    let mut mock = MockEngine::new();
    mock.expect_post().returning(|_| {
        Ok(body(concat!(
            "{\"stream\":\"Step 1/1 : RUN true\\n\"}\n",
            "{\"aux\":{\"ID\":\"sha256:abc\"}}\n",
            "{\"stream\":\"sha256:abc\\n\"}\n",
        )))
    });

    let messages = EngineClient::with_transport(mock)
        .build(body(""), &BuildOptions::for_specfile(Path::new("Enginefile")))
        .unwrap();
    let mut out = Vec::new();
    let count = display_messages(messages, &mut out, false).unwrap();
    assert_eq!(count, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Step 1/1 : RUN true\nsha256:abc\n"
    );
}
