//! Scenario tests for the request state machine, driven without any I/O.

use crate::base::neterror::NetError;
use crate::http::events::RequestEvent;
use crate::http::request::{AgentMode, ClientRequest, ConnAction, RequestOptions, RequestState};
use crate::socket::pool::{ClientSocketPool, PoolConfig};
use std::time::Duration;

fn pool() -> ClientSocketPool {
    ClientSocketPool::new(PoolConfig::default())
}

fn request(options: RequestOptions) -> ClientRequest {
    ClientRequest::new(options, &pool()).unwrap()
}

/// Play the driver: close the connection when asked to and collect what the
/// request produced.
fn settle(req: &mut ClientRequest) -> (Vec<RequestEvent>, Vec<ConnAction>) {
    let mut actions = Vec::new();
    while let Some(action) = req.poll_action() {
        if matches!(action, ConnAction::Destroy | ConnAction::Shutdown) {
            req.on_close();
        }
        actions.push(action);
    }
    let mut events = Vec::new();
    while let Some(event) = req.poll_event() {
        events.push(event);
    }
    (events, actions)
}

fn names(events: &[RequestEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

fn count(actions: &[ConnAction], wanted: &ConnAction) -> usize {
    actions.iter().filter(|a| *a == wanted).count()
}

fn written(actions: &[ConnAction]) -> Vec<u8> {
    actions
        .iter()
        .filter_map(|a| match a {
            ConnAction::Write(b) => Some(b.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

const OK_EMPTY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

#[test]
fn test_keep_alive_get() {
    let mut req = request(RequestOptions::new().path("/index.html"));
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "data", "end", "close", "response-close"]);
    assert_eq!(actions.last(), Some(&ConnAction::Release));
    assert_eq!(
        written(&actions),
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n"
    );
    assert_eq!(req.state(), RequestState::Completed);
    assert!(req.is_done());
}

#[test]
fn test_head_block_parses_back() {
    let mut req = request(
        RequestOptions::new()
            .method("post")
            .path("/submit?x=1")
            .header("X-First", "1")
            .header("content-type", "text/plain")
            .header("X-First", "2"),
    );
    req.on_socket(false);
    req.end(Some(b"body")).unwrap();
    let (_, actions) = settle(&mut req);
    let wire = written(&actions);

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut parsed = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(len) = parsed.parse(&wire).unwrap() else {
        panic!("incomplete head");
    };
    assert_eq!(parsed.method, Some("POST"));
    assert_eq!(parsed.path, Some("/submit?x=1"));
    let pairs: Vec<_> = parsed
        .headers
        .iter()
        .map(|h| (h.name, std::str::from_utf8(h.value).unwrap()))
        .collect();
    assert_eq!(
        pairs,
        [
            ("X-First", "1"),
            ("content-type", "text/plain"),
            ("X-First", "2"),
            ("Host", "localhost"),
            ("Connection", "keep-alive"),
            ("Content-Length", "4"),
        ]
    );
    assert_eq!(&wire[len..], b"body");
}

#[test]
fn test_invalid_input_fails_before_io() {
    for method in ["GE T", "GET\r\n", "\n"] {
        let err = ClientRequest::new(RequestOptions::new().method(method), &pool()).unwrap_err();
        assert!(err.is_construction_error());
    }
    for path in ["/a b", "/\u{7f}\u{1}", "/\u{263a}"] {
        let err = ClientRequest::new(RequestOptions::new().path(path), &pool()).unwrap_err();
        assert!(matches!(err, NetError::UnescapedCharacters { what: "Request path" }));
    }
    let err =
        ClientRequest::new(RequestOptions::new().header("Bad Name", "v"), &pool()).unwrap_err();
    assert!(matches!(err, NetError::InvalidToken { .. }));
}

#[test]
fn test_headers_frozen_once_sent() {
    let mut req = request(RequestOptions::new());
    req.set_header("Accept", "*/*").unwrap();
    req.on_socket(false);
    req.end(None).unwrap();
    assert!(matches!(
        req.set_header("Accept", "text/html"),
        Err(NetError::HeadersAlreadySent { .. })
    ));
}

#[test]
fn test_duplicate_response_destroys_connection() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(&[OK_EMPTY, OK_EMPTY].concat());

    let (events, actions) = settle(&mut req);
    let responses = events.iter().filter(|e| matches!(e, RequestEvent::Response(_))).count();
    assert_eq!(responses, 1);
    assert_eq!(count(&actions, &ConnAction::Destroy), 1);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
}

#[test]
fn test_release_after_request_then_response() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    let (_, actions) = settle(&mut req);
    assert_eq!(count(&actions, &ConnAction::Release), 0);

    req.on_data(OK_EMPTY);
    let (_, actions) = settle(&mut req);
    assert_eq!(count(&actions, &ConnAction::Release), 1);
}

#[test]
fn test_release_after_response_then_request() {
    let mut req = request(RequestOptions::new().method("POST"));
    req.on_socket(false);
    req.write(b"abc").unwrap();
    req.on_data(OK_EMPTY);
    let (events, actions) = settle(&mut req);
    assert!(names(&events).contains(&"end"));
    assert_eq!(count(&actions, &ConnAction::Release), 0, "request body still open");

    req.end(None).unwrap();
    let (events, actions) = settle(&mut req);
    assert_eq!(written(&actions), b"0\r\n\r\n");
    assert_eq!(count(&actions, &ConnAction::Release), 1);
    assert_eq!(names(&events), ["close", "response-close"]);

    req.on_data(OK_EMPTY);
    req.on_close();
    let (events, actions) = settle(&mut req);
    assert!(events.is_empty());
    assert!(actions.is_empty());
}

#[test]
fn test_abort_is_idempotent() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.abort();
    req.abort();

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "abort", "close"]);
    assert_eq!(count(&actions, &ConnAction::Destroy), 1);
    assert_eq!(req.state(), RequestState::Aborted);
}

#[test]
fn test_abort_before_socket_returns_it() {
    let mut req = request(RequestOptions::new());
    req.abort();
    req.on_socket(false);
    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["abort", "close"]);
    assert_eq!(actions, [ConnAction::Release]);

    let mut req = request(RequestOptions::new().agent(AgentMode::Exclusive));
    req.abort();
    req.on_socket(false);
    let (_, actions) = settle(&mut req);
    assert_eq!(actions, [ConnAction::Destroy]);
}

#[test]
fn test_abort_drops_response_body() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nabc");
    req.abort();
    req.on_data(b"def");

    let (events, _) = settle(&mut req);
    let data = events.iter().filter(|e| matches!(e, RequestEvent::Data(_))).count();
    assert_eq!(data, 1);
    assert!(!events.iter().any(|e| matches!(e, RequestEvent::Error(_))));
}

#[test]
fn test_client_keep_alive_off_wins() {
    let mut req = request(RequestOptions::new().keep_alive(false));
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert!(String::from_utf8(written(&actions)).unwrap().contains("Connection: close\r\n"));
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(count(&actions, &ConnAction::Shutdown), 1);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
}

#[test]
fn test_server_close_downgrades_keep_alive() {
    let mut req = request(RequestOptions::new());
    assert!(req.keep_alive());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    assert!(!req.keep_alive());
    let (_, actions) = settle(&mut req);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
}

#[test]
fn test_connect_hands_off_connection() {
    let mut req = request(RequestOptions::new().method("CONNECT").path("example.com:443"));
    req.set_connect_listener(true);
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 Connection Established\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "connect", "close"]);
    match &events[1] {
        RequestEvent::Connect(handoff) => {
            assert!(handoff.response.is_upgrade());
            assert_eq!(handoff.response.status().as_u16(), 200);
            assert!(handoff.body_head.is_empty());
        }
        other => panic!("expected connect, got {}", other.name()),
    }
    assert!(actions.contains(&ConnAction::Detach));
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(count(&actions, &ConnAction::Destroy), 0);
}

#[test]
fn test_upgrade_keeps_body_head() {
    let mut req = request(RequestOptions::new().header("Connection", "Upgrade").header("Upgrade", "ws"));
    req.set_upgrade_listener(true);
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: ws\r\nConnection: Upgrade\r\n\r\nhello");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "upgrade", "close"]);
    let RequestEvent::Upgrade(handoff) = &events[1] else { panic!("expected upgrade") };
    assert_eq!(&handoff.body_head[..], b"hello");
    assert!(actions.contains(&ConnAction::Detach));
}

#[test]
fn test_unhandled_upgrade_destroys_silently() {
    let mut req = request(RequestOptions::new().method("CONNECT").path("example.com:443"));
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 Connection Established\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert_eq!(count(&actions, &ConnAction::Destroy), 1);
    assert!(!actions.contains(&ConnAction::Detach));
    assert!(!events.iter().any(|e| matches!(e, RequestEvent::Error(_) | RequestEvent::Connect(_))));
    assert!(names(&events).contains(&"close"));
}

#[test]
fn test_informational_before_final() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 102 Processing\r\n\r\n");
    assert!(req.response().is_none());
    req.on_data(OK_EMPTY);

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "information", "response", "end", "close", "response-close"]);
    let RequestEvent::Information(info) = &events[1] else { panic!("expected information") };
    assert_eq!(info.status().as_u16(), 102);
    assert_eq!(count(&actions, &ConnAction::Release), 1);
}

#[test]
fn test_continue_then_body() {
    let mut req = request(RequestOptions::new().method("PUT").header("Expect", "100-continue"));
    assert!(req.headers_sent(), "Expect renders the head immediately");
    req.on_socket(false);
    let (_, actions) = settle(&mut req);
    assert!(String::from_utf8(written(&actions)).unwrap().starts_with("PUT / HTTP/1.1\r\n"));

    req.on_data(b"HTTP/1.1 100 Continue\r\n\r\n");
    let (events, _) = settle(&mut req);
    assert_eq!(names(&events), ["continue", "information"]);

    req.end(Some(b"data")).unwrap();
    let (_, actions) = settle(&mut req);
    assert_eq!(written(&actions), b"4\r\ndata\r\n0\r\n\r\n");
}

#[test]
fn test_head_skips_body() {
    let mut req = request(RequestOptions::new().method("HEAD"));
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
    assert_eq!(count(&actions, &ConnAction::Release), 1);
}

#[test]
fn test_end_before_response_is_hang_up() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_end();

    let (events, _) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "error", "close"]);
    assert!(matches!(events[1], RequestEvent::Error(NetError::ConnectionReset { .. })));
    assert_eq!(req.state(), RequestState::Errored);
}

#[test]
fn test_close_mid_body_aborts_response() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
    req.on_close();

    let (events, _) = settle(&mut req);
    assert_eq!(
        names(&events),
        ["socket", "response", "data", "aborted", "close", "response-close"]
    );
    assert_eq!(req.state(), RequestState::Errored);
}

#[test]
fn test_eof_delimited_body_completes_on_end() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\n\r\nuntil close");
    req.on_end();

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "data", "end", "close", "response-close"]);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(req.state(), RequestState::Completed);
}

#[test]
fn test_parse_error_reported_once() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"NOT HTTP\r\n\r\n");
    req.on_error(NetError::socket_hang_up());

    let (events, actions) = settle(&mut req);
    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RequestEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], NetError::ParseError { .. }));
    assert_eq!(count(&actions, &ConnAction::Destroy), 1);
    assert_eq!(names(&events).last(), Some(&"close"));
}

#[test]
fn test_socket_error_latched() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.on_error(NetError::ConnectionReset { message: "read ECONNRESET" });
    req.on_error(NetError::ConnectionAborted);

    let (events, _) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "error", "close"]);
}

#[test]
fn test_error_after_abort_suppressed() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.abort();
    req.on_error(NetError::ConnectionAborted);
    let (events, _) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "abort", "close"]);
}

#[test]
fn test_idle_connection_error_is_silent() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(OK_EMPTY);
    settle(&mut req);
    assert!(req.subscriptions().idle_error);
    assert!(!req.subscriptions().error);

    req.on_error(NetError::ConnectionAborted);
    let (events, actions) = settle(&mut req);
    assert!(events.is_empty());
    assert!(actions.is_empty());
}

#[test]
fn test_timeout_is_advisory() {
    let mut req = request(RequestOptions::new().timeout(Duration::from_secs(5)));
    req.on_socket(false);
    req.end(None).unwrap();
    let (_, actions) = settle(&mut req);
    assert!(actions.contains(&ConnAction::ArmTimer(Duration::from_secs(5))));

    req.on_timeout();
    req.on_timeout();
    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["timeout"]);
    assert!(actions.is_empty(), "timeout must not destroy the connection");

    req.set_timeout(Duration::from_secs(1));
    req.on_data(OK_EMPTY);
    let (_, actions) = settle(&mut req);
    assert!(actions.contains(&ConnAction::DisarmTimer));
    req.on_timeout();
    assert!(settle(&mut req).0.is_empty());
}

#[test]
fn test_write_after_end() {
    let mut req = request(RequestOptions::new().method("POST"));
    req.end(Some(b"x")).unwrap();
    assert!(matches!(req.write(b"y"), Err(NetError::WriteAfterEnd)));
}

#[test]
fn test_output_buffered_until_bound() {
    let mut req = request(RequestOptions::new().method("POST"));
    req.write(b"early").unwrap();
    assert!(settle(&mut req).1.is_empty());

    req.on_socket(true);
    let (events, actions) = settle(&mut req);
    assert!(matches!(events[0], RequestEvent::Socket { reused: true }));
    let wire = String::from_utf8(written(&actions)).unwrap();
    assert!(wire.contains("Transfer-Encoding: chunked\r\n\r\n5\r\nearly\r\n"));
    assert_eq!(req.state(), RequestState::HeadersSent);
}

#[test]
fn test_verbatim_headers() {
    let mut req = request(
        RequestOptions::new()
            .verbatim_headers(true)
            .auth("a:b")
            .header("host", "raw.example")
            .header("X-Z", "1"),
    );
    assert!(req.headers_sent());
    assert!(req.headers().get("Authorization").is_none());
    req.on_socket(false);
    let (_, actions) = settle(&mut req);
    assert_eq!(
        written(&actions),
        b"GET / HTTP/1.1\r\nhost: raw.example\r\nX-Z: 1\r\nConnection: keep-alive\r\n\r\n"
    );
}

#[test]
fn test_max_headers_count() {
    let mut req = request(RequestOptions::new().max_headers_count(2));
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\nC: 3\r\nContent-Length: 0\r\n\r\n");
    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
    let Some(RequestEvent::Response(head)) = events.get(1) else { panic!("expected response") };
    assert_eq!(head.headers().len(), 2);
    assert_eq!(head.headers().get("B"), Some("2"));
    assert_eq!(actions.last(), Some(&ConnAction::Release));
}

#[test]
fn test_garbage_after_complete_response() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhiGARBAGE\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert_eq!(
        names(&events),
        ["socket", "response", "data", "end", "error", "close", "response-close"]
    );
    let errors = events.iter().filter(|e| matches!(e, RequestEvent::Error(_))).count();
    assert_eq!(errors, 1);
    assert_eq!(count(&actions, &ConnAction::Destroy), 1);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
}

#[test]
fn test_leftover_bytes_close_connection() {
    let mut req = request(RequestOptions::new());
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 2");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(count(&actions, &ConnAction::Shutdown), 1);
}

#[test]
fn test_bare_switching_protocols_is_final_response() {
    let mut req = request(RequestOptions::new());
    req.set_upgrade_listener(true);
    req.on_socket(false);
    req.end(None).unwrap();
    req.on_data(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");

    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["socket", "response", "end", "close", "response-close"]);
    assert_eq!(count(&actions, &ConnAction::Release), 0);
    assert_eq!(count(&actions, &ConnAction::Detach), 0);
}

#[test]
fn test_path_is_sent_as_latin1() {
    let mut req = request(RequestOptions::new().path("/caf\u{e9}"));
    req.on_socket(false);
    req.end(None).unwrap();
    let (_, actions) = settle(&mut req);
    assert!(written(&actions).starts_with(b"GET /caf\xe9 HTTP/1.1\r\n"));
}

#[test]
fn test_acquire_failure() {
    let mut req = request(RequestOptions::new());
    req.on_acquire_failed(NetError::ConnectionAborted);
    let (events, actions) = settle(&mut req);
    assert_eq!(names(&events), ["error", "close"]);
    assert!(actions.is_empty());
    assert_eq!(req.state(), RequestState::Errored);
}
