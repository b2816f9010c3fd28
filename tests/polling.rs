//! Scheduler behaviour against a real HTTP server.

use pretty_assertions::assert_eq;
use std::time::Duration;
use subhub::{PollEvent, PollOptions, PollOutcome, PollPolicy, PollStatus, ReqwestTransport, Scheduler};
use tokio::sync::mpsc;
use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_policy() -> PollPolicy {
    PollPolicy {
        base_interval: Duration::from_millis(50),
        backoff_multiplier: 2,
        backoff_limit: 2,
    }
}

fn scheduler(policy: PollPolicy) -> (Scheduler<ReqwestTransport>, mpsc::Receiver<PollEvent>) {
    Scheduler::new(ReqwestTransport::new().unwrap(), policy)
}

async fn next_event(rx: &mut mpsc::Receiver<PollEvent>) -> PollEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for poll event")
        .expect("event channel closed")
}

#[tokio::test]
async fn server_errors_back_off_until_retries_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let (scheduler, mut rx) = scheduler(fast_policy());
    let url = format!("{}/feed", server.uri());
    scheduler.register(&url, PollOptions::default());

    // Two attempts: the first backs off (50 -> 100ms), the second would push
    // past the 100ms ceiling and stops. Each attempt fails, plus the final
    // "Retries exceeded".
    let mut reasons = Vec::new();
    for _ in 0..3 {
        match next_event(&mut rx).await {
            PollEvent::Failed { outcome, .. } => match outcome {
                PollOutcome::Error { reason, .. } => reasons.push(reason),
                other => panic!("expected Error outcome, got {other:?}"),
            },
            other => panic!("expected Failed, got {other:?}"),
        }
    }
    assert_eq!("Server error 503", reasons[0]);
    assert_eq!("Server error 503", reasons[1]);
    assert_eq!("Retries exceeded", reasons[2]);
    assert_eq!(PollStatus::Stopped, scheduler.state(&url).unwrap().status);

    // The .expect(2) on the mock verifies no further request went out.
    server.verify().await;
}

#[tokio::test]
async fn permanent_redirect_moves_the_registration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("location", "/new"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved content"))
        .mount(&server)
        .await;

    let (scheduler, mut rx) = scheduler(PollPolicy::default());
    let old_url = format!("{}/old", server.uri());
    let new_url = format!("{}/new", server.uri());
    scheduler.register(&old_url, PollOptions::default());

    match next_event(&mut rx).await {
        // Content arrives under the new registration.
        PollEvent::Updated { url, body, .. } => {
            assert_eq!(new_url, url);
            assert_eq!(bytes::Bytes::from_static(b"moved content"), body);
        }
        other => panic!("expected Updated, got {other:?}"),
    }

    let old_state = scheduler.state(&old_url).unwrap();
    assert_eq!(new_url, old_state.request_url);
    assert!(matches!(
        old_state.last_result,
        Some(PollOutcome::Redirect { .. })
    ));
    assert_eq!(PollStatus::Running, scheduler.state(&new_url).unwrap().status);
}

#[tokio::test]
async fn temporary_redirect_keeps_the_original_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "/mirror"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mirror"))
        .respond_with(ResponseTemplate::new(200).set_body_string("mirrored content"))
        .mount(&server)
        .await;

    let (scheduler, mut rx) = scheduler(PollPolicy::default());
    let url = format!("{}/feed", server.uri());
    scheduler.register(&url, PollOptions::default());

    match next_event(&mut rx).await {
        PollEvent::Updated {
            url: event_url,
            body,
            ..
        } => {
            // Attributed to the registered URL, not the mirror.
            assert_eq!(url, event_url);
            assert_eq!(bytes::Bytes::from_static(b"mirrored content"), body);
        }
        other => panic!("expected Updated, got {other:?}"),
    }

    let state = scheduler.state(&url).unwrap();
    assert_eq!(url, state.request_url);
    assert_eq!(None, state.next_request);
    assert!(scheduler.state(&format!("{}/mirror", server.uri())).is_none());
}

#[tokio::test]
async fn ok_response_records_validators_and_size() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("payload")
                .insert_header("etag", "\"abc123\"")
                .insert_header("last-modified", "Tue, 01 Jul 2025 00:00:00 GMT"),
        )
        .mount(&server)
        .await;

    let (scheduler, mut rx) = scheduler(PollPolicy::default());
    let url = format!("{}/feed", server.uri());
    scheduler.register(&url, PollOptions::default());

    assert!(matches!(next_event(&mut rx).await, PollEvent::Updated { .. }));

    let state = scheduler.state(&url).unwrap();
    assert_eq!(Some("\"abc123\"".to_owned()), state.etag);
    assert_eq!(
        Some("Tue, 01 Jul 2025 00:00:00 GMT".to_owned()),
        state.last_modified
    );
    assert!(matches!(
        state.last_result,
        Some(PollOutcome::Ok { size: Some(7), .. })
    ));
}
