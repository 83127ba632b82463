//! Integration tests driving the filter the way a proxy pipeline would.

use bytes::{Bytes, BytesMut};
use inkfilter::{
    shared_headers, CallResult, ConfiguredClusters, Direction, Filter, FilterCallbacks,
    FilterConfig, FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, HeaderTable,
    ScriptSource, SharedHeaders,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every adapter interaction and emulates the proxy's body buffer.
#[derive(Debug, Default)]
struct RecordingCallbacks {
    buffer: Mutex<BytesMut>,
    continued: AtomicUsize,
    responses: Mutex<Vec<(HeaderTable, Option<Bytes>)>>,
}

impl RecordingCallbacks {
    fn continued(&self) -> usize {
        self.continued.load(Ordering::SeqCst)
    }

    fn responses(&self) -> Vec<(HeaderTable, Option<Bytes>)> {
        self.responses.lock().unwrap().clone()
    }
}

impl FilterCallbacks for RecordingCallbacks {
    fn add_data(&self, data: Bytes) {
        self.buffer.lock().unwrap().extend_from_slice(&data);
    }

    fn buffered_body(&self) -> Option<Bytes> {
        let buffer = self.buffer.lock().unwrap();
        if buffer.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(&buffer))
        }
    }

    fn continue_iteration(&self) {
        self.continued.fetch_add(1, Ordering::SeqCst);
    }

    fn respond(&self, headers: HeaderTable, body: Option<Bytes>) {
        self.responses.lock().unwrap().push((headers, body));
    }
}

struct Harness {
    filter: Filter,
    decoder: Arc<RecordingCallbacks>,
    encoder: Arc<RecordingCallbacks>,
    clusters: Arc<ConfiguredClusters>,
}

impl Harness {
    async fn new(script: &str) -> Self {
        Self::with_clusters(script, ["auth"]).await
    }

    async fn with_clusters<const N: usize>(script: &str, clusters: [&str; N]) -> Self {
        init_logging();
        let clusters = Arc::new(ConfiguredClusters::new(clusters));
        let config = FilterConfig::new(ScriptSource::inline(script), clusters.clone())
            .await
            .expect("script should compile");
        let mut filter = config.create_filter();
        let decoder = Arc::new(RecordingCallbacks::default());
        let encoder = Arc::new(RecordingCallbacks::default());
        filter.set_decoder_callbacks(decoder.clone());
        filter.set_encoder_callbacks(encoder.clone());
        Self {
            filter,
            decoder,
            encoder,
            clusters,
        }
    }

    /// Deliver a request body chunk, emulating the proxy's buffering rule:
    /// a StopIterationAndBuffer verdict parks the chunk in the buffer.
    fn decode_chunk(&mut self, chunk: &str, end_stream: bool) -> FilterDataStatus {
        let data = Bytes::copy_from_slice(chunk.as_bytes());
        let status = self.filter.decode_data(data.clone(), end_stream);
        if status == FilterDataStatus::StopIterationAndBuffer {
            self.decoder.add_data(data);
        }
        status
    }
}

fn request_headers() -> SharedHeaders {
    shared_headers(HeaderTable::from([
        (":method".to_string(), "GET".to_string()),
        (":path".to_string(), "/x".to_string()),
    ]))
}

fn header(shared: &SharedHeaders, name: &str) -> Option<String> {
    shared.lock().unwrap().get(name).cloned()
}

#[tokio::test]
async fn direction_without_entry_is_bypassed() {
    let mut h = Harness::new("fn on_response(stream) { }").await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers, false),
        FilterHeadersStatus::Continue
    );
    assert_eq!(h.decode_chunk("ignored", true), FilterDataStatus::Continue);
    assert_eq!(h.decoder.continued(), 0);
    assert!(h.decoder.responses().is_empty());
}

#[tokio::test]
async fn header_mutation_completes_synchronously() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            stream.headers().set("x-touched", "yes");
            stream.headers().remove(":path");
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::Continue
    );
    assert_eq!(header(&headers, "x-touched").as_deref(), Some("yes"));
    assert_eq!(header(&headers, ":path"), None);
    // Continue verdict already conveys resumption; no explicit resume.
    assert_eq!(h.decoder.continued(), 0);
}

#[tokio::test]
async fn full_body_is_the_ordered_concatenation_of_all_chunks() {
    let script = r#"
        fn on_request(stream) {
            let body = stream.body();
            stream.headers().set("x-body", body.text());
            stream.headers().set("x-len", body.len().to_string());
        }
    "#;

    // The same byte sequence under different chunkings.
    for chunks in [
        vec!["hello world"],
        vec!["hello ", "world"],
        vec!["h", "ello", " wor", "ld"],
    ] {
        let mut h = Harness::new(script).await;
        let headers = request_headers();
        assert_eq!(
            h.filter.decode_headers(headers.clone(), false),
            FilterHeadersStatus::StopIteration
        );

        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let status = h.decode_chunk(chunk, i == last);
            if i < last {
                assert_eq!(status, FilterDataStatus::StopIterationAndBuffer);
            } else {
                assert_eq!(status, FilterDataStatus::Continue);
            }
        }

        assert_eq!(header(&headers, "x-body").as_deref(), Some("hello world"));
        assert_eq!(header(&headers, "x-len").as_deref(), Some("11"));
        assert_eq!(h.decoder.continued(), 1, "resumes exactly once");
    }
}

#[tokio::test]
async fn body_on_an_already_ended_stream_is_the_empty_indication() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let body = stream.body();
            if body == () {
                stream.headers().set("x-body", "none");
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::Continue
    );
    assert_eq!(header(&headers, "x-body").as_deref(), Some("none"));
}

#[tokio::test]
async fn body_chunks_yield_in_delivery_order_without_buffering() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let seen = "";
            let count = 0;
            for chunk in stream.body_chunks() {
                seen += chunk.as_string();
                count += 1;
            }
            stream.headers().set("x-seen", seen);
            stream.headers().set("x-count", count.to_string());
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), false),
        FilterHeadersStatus::StopIteration
    );
    assert_eq!(h.decode_chunk("ab", false), FilterDataStatus::Continue);
    assert_eq!(h.decode_chunk("cd", false), FilterDataStatus::Continue);
    assert_eq!(h.decode_chunk("e", true), FilterDataStatus::Continue);

    assert_eq!(header(&headers, "x-seen").as_deref(), Some("abcde"));
    assert_eq!(header(&headers, "x-count").as_deref(), Some("3"));
    // Chunk iteration never asked the proxy to buffer.
    assert!(h.decoder.buffered_body().is_none());
    assert_eq!(h.decoder.continued(), 1);
}

#[tokio::test]
async fn trailers_deliver_payload_when_present() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let t = stream.trailers();
            if t == () {
                stream.headers().set("x-trailers", "none");
            } else {
                stream.headers().set("x-trailers", t.get("grpc-status"));
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), false),
        FilterHeadersStatus::StopIteration
    );
    let trailers = shared_headers(HeaderTable::from([(
        "grpc-status".to_string(),
        "0".to_string(),
    )]));
    assert_eq!(
        h.filter.decode_trailers(trailers),
        FilterTrailersStatus::Continue
    );
    assert_eq!(header(&headers, "x-trailers").as_deref(), Some("0"));
    assert_eq!(h.decoder.continued(), 1);
}

#[tokio::test]
async fn trailers_deliver_empty_indication_when_stream_ends_without_them() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let t = stream.trailers();
            if t == () {
                stream.headers().set("x-trailers", "none");
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), false),
        FilterHeadersStatus::StopIteration
    );
    // Stream ends on a data event: no trailers will arrive.
    assert_eq!(h.decode_chunk("tail", true), FilterDataStatus::Continue);
    assert_eq!(header(&headers, "x-trailers").as_deref(), Some("none"));
}

#[tokio::test]
async fn respond_halts_decoding_and_discards_later_events() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            stream.respond(#{":status": "403"}, "denied");
            stream.headers().set("x-after", "unreachable");
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), false),
        FilterHeadersStatus::StopIteration
    );

    let responses = h.decoder.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0.get(":status").unwrap(), "403");
    assert_eq!(responses[0].1.as_deref(), Some(&b"denied"[..]));

    // No script code runs after respond().
    assert_eq!(header(&headers, "x-after"), None);

    // Later events for this direction have no script-visible effect.
    assert_eq!(
        h.decode_chunk("late", false),
        FilterDataStatus::StopIterationNoBuffer
    );
    assert_eq!(
        h.filter.decode_trailers(shared_headers(HeaderTable::new())),
        FilterTrailersStatus::StopIteration
    );
    assert_eq!(h.decoder.responses().len(), 1);
    assert_eq!(h.decoder.continued(), 0);
}

#[tokio::test]
async fn http_call_suspends_until_the_injected_result() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let auth = stream.http_call("auth", #{
                ":method": "GET", ":path": "/check", ":authority": "auth",
            }, (), 250);
            if auth.error == () {
                stream.headers().set("x-auth", auth.headers[":status"]);
                stream.headers().set("x-auth-body", auth.body);
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::StopIteration
    );

    let pending = h.clusters.take_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.cluster, "auth");
    assert_eq!(pending[0].request.headers.get(":path").unwrap(), "/check");

    h.filter.on_call_result(
        Direction::Request,
        CallResult::Success {
            headers: HeaderTable::from([(":status".to_string(), "200".to_string())]),
            body: Some(Bytes::from_static(b"ok")),
        },
    );

    assert_eq!(header(&headers, "x-auth").as_deref(), Some("200"));
    assert_eq!(header(&headers, "x-auth-body").as_deref(), Some("ok"));
    assert_eq!(h.decoder.continued(), 1);
}

#[tokio::test]
async fn http_call_failure_is_recoverable_by_the_script() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let auth = stream.http_call("auth", #{
                ":method": "GET", ":path": "/check", ":authority": "auth",
            }, (), 250);
            if auth.error != () {
                stream.headers().set("x-call-error", auth.error);
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    h.filter.decode_headers(headers.clone(), true);
    h.filter.on_call_result(
        Direction::Request,
        CallResult::Failure {
            reason: "upstream reset".to_string(),
        },
    );
    assert_eq!(
        header(&headers, "x-call-error").as_deref(),
        Some("upstream reset")
    );
}

#[tokio::test]
async fn http_call_to_unconfigured_cluster_fails_immediately() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let result = stream.http_call("nope", #{
                ":method": "GET", ":path": "/", ":authority": "nope",
            }, (), 100);
            stream.headers().set("x-err", result.error);
        }
        "#,
    )
    .await;

    let headers = request_headers();
    // Fails inline: the script completes without suspending.
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::Continue
    );
    assert!(header(&headers, "x-err").unwrap().contains("unknown cluster"));
    assert_eq!(h.clusters.pending_len(), 0, "no network activity");
}

#[tokio::test]
async fn teardown_mid_call_cancels_without_resuming() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            stream.http_call("auth", #{
                ":method": "GET", ":path": "/check", ":authority": "auth",
            }, (), 250);
            stream.headers().set("x-resumed", "yes");
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::StopIteration
    );
    assert_eq!(h.clusters.pending_len(), 1);

    h.filter.on_destroy();
    h.filter.on_destroy(); // double teardown must not double-cancel or fault

    // The parked call was cancelled before dispatch.
    assert!(h.clusters.take_pending().is_empty());

    // A late completion never resumes the discarded context.
    h.filter.on_call_result(
        Direction::Request,
        CallResult::Success {
            headers: HeaderTable::new(),
            body: None,
        },
    );
    assert_eq!(header(&headers, "x-resumed"), None);
    assert_eq!(h.decoder.continued(), 0);
}

#[tokio::test]
async fn handle_captured_before_teardown_is_dead_after_it() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            let captured = stream.headers();
            captured.set("x-before", "1");
            try {
                stream.http_call("auth", #{
                    ":method": "GET", ":path": "/check", ":authority": "auth",
                }, (), 250);
                captured.set("x-after-call", "1");
            } catch (err) {
                // Teardown surfaced as an error; the captured handle must
                // now refuse access instead of writing through.
                try {
                    captured.set("x-stale-write", "1");
                } catch (stale) { }
            }
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), true),
        FilterHeadersStatus::StopIteration
    );
    // The handle worked while the stream was alive.
    assert_eq!(header(&headers, "x-before").as_deref(), Some("1"));

    h.filter.on_destroy();

    // The script thread observes teardown asynchronously; give its error
    // path time to run before checking for leaked writes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(header(&headers, "x-after-call"), None);
    assert_eq!(header(&headers, "x-stale-write"), None);
    assert_eq!(h.decoder.continued(), 0);
}

#[tokio::test]
async fn script_fault_fails_open() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            throw "boom";
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers, false),
        FilterHeadersStatus::Continue
    );
    // The direction passes through unmodified from then on.
    assert_eq!(h.decode_chunk("data", true), FilterDataStatus::Continue);
    assert!(h.decoder.responses().is_empty());
}

#[tokio::test]
async fn malformed_respond_table_is_a_script_error_not_a_host_fault() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            stream.respond(#{"x-no-status": "1"}, "nope");
        }
        "#,
    )
    .await;

    let headers = request_headers();
    // Fails open; nothing was sent.
    assert_eq!(
        h.filter.decode_headers(headers, false),
        FilterHeadersStatus::Continue
    );
    assert!(h.decoder.responses().is_empty());
}

#[tokio::test]
async fn response_direction_runs_independently() {
    let mut h = Harness::new(
        r#"
        fn on_response(stream) {
            stream.headers().set("x-served-by", "inkfilter");
        }
        "#,
    )
    .await;

    // Request direction bypassed.
    assert_eq!(
        h.filter.decode_headers(request_headers(), true),
        FilterHeadersStatus::Continue
    );

    let headers = shared_headers(HeaderTable::from([(
        ":status".to_string(),
        "200".to_string(),
    )]));
    assert_eq!(
        h.filter.encode_headers(headers.clone(), true),
        FilterHeadersStatus::Continue
    );
    assert_eq!(header(&headers, "x-served-by").as_deref(), Some("inkfilter"));
    assert_eq!(h.encoder.continued(), 0);
}

#[tokio::test]
async fn events_after_script_completion_pass_through() {
    let mut h = Harness::new(
        r#"
        fn on_request(stream) {
            stream.headers().set("x-done", "1");
        }
        "#,
    )
    .await;

    let headers = request_headers();
    assert_eq!(
        h.filter.decode_headers(headers.clone(), false),
        FilterHeadersStatus::Continue
    );
    // Extra data after the script already completed is inert.
    assert_eq!(h.decode_chunk("late", false), FilterDataStatus::Continue);
    assert_eq!(h.decode_chunk("", true), FilterDataStatus::Continue);
    assert_eq!(header(&headers, "x-done").as_deref(), Some("1"));
}
