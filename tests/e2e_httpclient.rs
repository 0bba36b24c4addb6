//! E2E tests for the safe HTTP client against a local inbox

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Reply, RemoteInbox, loopback_client, loopback_client_config};
use fedi_delivery::config::HttpClientConfig;
use fedi_delivery::error::ClientError;
use fedi_delivery::httpclient::{Client, Request, Signer, SigningError};
use http::Method;
use reqwest::header::{DATE, HeaderValue};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_concurrency_is_capped_at_max_open_conns() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/slow", Reply::accepted().delayed(Duration::from_millis(300)));

    let client = Arc::new(
        Client::new(&HttpClientConfig {
            max_open_conns: 3,
            ..loopback_client_config()
        })
        .unwrap(),
    );
    let ctx = CancellationToken::new();

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            let ctx = ctx.clone();
            let request = Request::new(Method::GET, inbox.url("/slow"));
            tokio::spawn(async move {
                let mut response = client.execute(&ctx, &request).await?;
                let status = response.status();
                response.close();
                Ok::<_, ClientError>(status)
            })
        })
        .collect();

    for call in calls {
        let status = call.await.unwrap().unwrap();
        assert_eq!(status, 202);
    }

    assert_eq!(inbox.count_for("/slow"), 4);
    assert_eq!(inbox.max_in_flight(), 3);
    assert_eq!(client.available_slots(), 3);
}

#[tokio::test]
async fn test_declared_oversized_body_is_rejected() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/big", Reply::status(200).sized_body(4096));

    let client = Client::new(&HttpClientConfig {
        max_open_conns: 1,
        max_body_size: 1024,
        ..loopback_client_config()
    })
    .unwrap();

    let error = client
        .execute(&CancellationToken::new(), &Request::new(Method::GET, inbox.url("/big")))
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::BodyTooLarge { limit: 1024 }));
    assert_eq!(client.available_slots(), 1);
}

#[tokio::test]
async fn test_streamed_body_is_truncated_at_limit() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/stream", Reply::status(200).streamed_body(1024, 10));

    let client = Client::new(&HttpClientConfig {
        max_open_conns: 1,
        max_body_size: 4096,
        ..loopback_client_config()
    })
    .unwrap();

    let response = client
        .execute(
            &CancellationToken::new(),
            &Request::new(Method::GET, inbox.url("/stream")),
        )
        .await
        .unwrap();
    assert_eq!(client.available_slots(), 0);

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 4096);
    assert_eq!(client.available_slots(), 1);
}

#[tokio::test]
async fn test_close_releases_slot_once() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/stream", Reply::status(200).streamed_body(1024, 4));

    let client = Client::new(&HttpClientConfig {
        max_open_conns: 2,
        ..loopback_client_config()
    })
    .unwrap();
    let ctx = CancellationToken::new();

    let mut response = client
        .execute(&ctx, &Request::new(Method::GET, inbox.url("/stream")))
        .await
        .unwrap();
    assert!(response.chunk().await.unwrap().is_some());

    response.close();
    response.close();
    assert!(response.is_closed());
    assert_eq!(client.available_slots(), 2);

    // Dropping without close releases as well
    let response = client
        .execute(&ctx, &Request::new(Method::GET, inbox.url("/stream")))
        .await
        .unwrap();
    assert_eq!(client.available_slots(), 1);
    drop(response);
    assert_eq!(client.available_slots(), 2);
}

#[tokio::test]
async fn test_loopback_is_reserved_without_allow_range() {
    let inbox = RemoteInbox::start().await;
    let client = Client::new(&HttpClientConfig::default()).unwrap();
    let ctx = CancellationToken::new();

    let literal = client
        .execute(&ctx, &Request::new(Method::GET, inbox.url("/inbox")))
        .await
        .unwrap_err();
    assert!(matches!(literal, ClientError::ReservedAddr(_)), "{literal:?}");

    let by_name = format!("http://localhost:{}/inbox", inbox.addr.port());
    let resolved = client
        .execute(
            &ctx,
            &Request::new(Method::GET, url::Url::parse(&by_name).unwrap()),
        )
        .await
        .unwrap_err();
    assert!(matches!(resolved, ClientError::ReservedAddr(_)), "{resolved:?}");

    assert_eq!(inbox.count(), 0);
    assert_eq!(client.available_slots(), client.max_open_conns());
}

#[tokio::test]
async fn test_allow_range_wins_over_block_range() {
    let inbox = RemoteInbox::start().await;
    let client = Client::new(&HttpClientConfig {
        allow_ranges: vec!["127.0.0.1/32".to_string()],
        block_ranges: vec!["127.0.0.0/8".to_string()],
        ..Default::default()
    })
    .unwrap();

    let mut response = client
        .execute(
            &CancellationToken::new(),
            &Request::new(Method::GET, inbox.url("/inbox")),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    response.close();
}

#[tokio::test]
async fn test_redirect_to_reserved_address_is_refused() {
    let inbox = RemoteInbox::start().await;
    inbox.route(
        "/moved",
        Reply::status(302).with_header("location", "http://10.0.0.1/inbox"),
    );

    let client = loopback_client();
    let error = client
        .execute(
            &CancellationToken::new(),
            &Request::new(Method::GET, inbox.url("/moved")),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::ReservedAddr(_)), "{error:?}");
    assert_eq!(inbox.count_for("/moved"), 1);
}

#[tokio::test]
async fn test_signer_runs_on_every_attempt() {
    let inbox = RemoteInbox::start().await;
    let client = loopback_client();
    let ctx = CancellationToken::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let signer = {
        let calls = calls.clone();
        move |request: &mut reqwest::Request| -> Result<(), SigningError> {
            assert!(request.headers().get("signature").is_none());
            assert!(request.headers().get(DATE).is_some());
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            request.headers_mut().insert(
                "signature",
                HeaderValue::from_str(&format!("attempt-{n}")).unwrap(),
            );
            Ok(())
        }
    };

    let request = Request::post_activity(inbox.url("/inbox"), r#"{"type":"Follow"}"#)
        .with_signer(Arc::new(signer));

    for _ in 0..2 {
        let mut response = client.execute(&ctx, &request).await.unwrap();
        response.close();
    }

    let received = inbox.received_for("/inbox");
    let signatures: Vec<_> = received
        .iter()
        .map(|r| r.headers.get("signature").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(signatures, vec!["attempt-1", "attempt-2"]);
    assert!(received.iter().all(|r| r.headers.contains_key("date")));
    assert_eq!(received[0].body.as_ref(), br#"{"type":"Follow"}"#);
}

/// Signer that records the path each signature was made for
fn path_signer(calls: Arc<AtomicUsize>) -> Arc<dyn Signer> {
    Arc::new(move |request: &mut reqwest::Request| -> Result<(), SigningError> {
        assert!(request.headers().get("signature").is_none());
        calls.fetch_add(1, Ordering::SeqCst);
        let value = format!("signed-for={}", request.url().path());
        request
            .headers_mut()
            .insert("signature", HeaderValue::from_str(&value).unwrap());
        Ok(())
    })
}

#[tokio::test]
async fn test_signed_redirect_is_signed_again_for_each_hop() {
    let inbox = RemoteInbox::start().await;
    inbox.route(
        "/moved",
        Reply::status(307).with_header("location", "/target"),
    );

    let client = loopback_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let request = Request::post_activity(inbox.url("/moved"), r#"{"type":"Undo"}"#)
        .with_signer(path_signer(calls.clone()));

    let mut response = client
        .execute(&CancellationToken::new(), &request)
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    response.close();

    let received = inbox.received();
    let hops: Vec<_> = received.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(hops, vec!["/moved", "/target"]);
    for hop in &received {
        assert_eq!(hop.method, Method::POST);
        assert_eq!(hop.body.as_ref(), br#"{"type":"Undo"}"#);
        assert_eq!(
            hop.headers["signature"].to_str().unwrap(),
            format!("signed-for={}", hop.path)
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.available_slots(), client.max_open_conns());
}

#[tokio::test]
async fn test_signed_see_other_is_followed_as_get() {
    let inbox = RemoteInbox::start().await;
    inbox.route(
        "/submit",
        Reply::status(303).with_header("location", "/status"),
    );

    let client = loopback_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let request = Request::post_activity(inbox.url("/submit"), r#"{"type":"Follow"}"#)
        .with_signer(path_signer(calls.clone()));

    let mut response = client
        .execute(&CancellationToken::new(), &request)
        .await
        .unwrap();
    response.close();

    let status = &inbox.received_for("/status")[0];
    assert_eq!(status.method, Method::GET);
    assert!(status.body.is_empty());
    assert!(!status.headers.contains_key("content-type"));
    assert_eq!(status.headers["signature"], "signed-for=/status");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_signed_redirect_loop_stops_after_limit() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/loop", Reply::status(308).with_header("location", "/loop"));

    let client = loopback_client();
    let request = Request::post_activity(inbox.url("/loop"), "{}")
        .with_signer(path_signer(Arc::new(AtomicUsize::new(0))));

    let error = client
        .execute(&CancellationToken::new(), &request)
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::InvalidRequest(_)), "{error:?}");
    assert_eq!(inbox.count_for("/loop"), 11);
    assert_eq!(client.available_slots(), client.max_open_conns());
}

#[tokio::test]
async fn test_signed_redirect_to_reserved_address_is_refused() {
    let inbox = RemoteInbox::start().await;
    inbox.route(
        "/moved",
        Reply::status(307).with_header("location", "http://169.254.169.254/inbox"),
    );

    let client = loopback_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let request = Request::post_activity(inbox.url("/moved"), "{}")
        .with_signer(path_signer(calls.clone()));

    let error = client
        .execute(&CancellationToken::new(), &request)
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::ReservedAddr(_)), "{error:?}");
    assert_eq!(inbox.count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_during_request() {
    let inbox = RemoteInbox::start().await;
    inbox.route("/hang", Reply::accepted().delayed(Duration::from_secs(5)));

    let client = Client::new(&HttpClientConfig {
        max_open_conns: 1,
        ..loopback_client_config()
    })
    .unwrap();
    let ctx = CancellationToken::new();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let error = client
        .execute(&ctx, &Request::new(Method::GET, inbox.url("/hang")))
        .await
        .unwrap_err();

    assert!(error.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.available_slots(), 1);
}
