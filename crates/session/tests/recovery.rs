//! Timeouts, transport failures, connectivity changes and token upkeep.

mod common;

use cl_protocol::{AuthGrant, CloudRequest, PublishScope};
use cl_session::{CloudStatus, FailureReason, SessionState};
use common::*;

#[tokio::test(start_paused = true)]
async fn sign_in_deadline_grows_to_ceiling_then_gives_up() {
    let mut h = HarnessBuilder::new().saved(saved_credentials()).start();

    let mut deadlines = Vec::new();
    loop {
        let req = h.next_request().await;
        assert_eq!(kind(&req), "sign_in");
        deadlines.push(req.timeout_secs());
        if req.timeout_secs() >= 20 {
            break;
        }
    }

    assert_eq!(h.expect_status(CloudStatus::FailedToRegister).await, Some(FailureReason::NoResponse));
    assert_eq!(deadlines[0], 2);
    assert_eq!(*deadlines.last().unwrap(), 20);
    assert!(deadlines.windows(2).all(|w| w[1] > w[0]), "{deadlines:?}");
    assert!(h.no_pending_request());
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn primary_publish_deadline_grows_to_ceiling_then_gives_up() {
    let mut h = HarnessBuilder::new().saved(saved_credentials()).start();
    h.next_request().await.ok();

    let mut deadlines = Vec::new();
    loop {
        let req = h.next_request().await;
        assert_eq!(publish_scope(&req), Some(PublishScope::Primary));
        deadlines.push(req.timeout_secs());
        if req.timeout_secs() >= 10 {
            break;
        }
    }

    assert_eq!(h.expect_status(CloudStatus::FailedToPublish).await, Some(FailureReason::NoResponse));
    assert_eq!(deadlines[0], 2);
    assert_eq!(*deadlines.last().unwrap(), 10);
    assert!(deadlines.windows(2).all(|w| w[1] > w[0]), "{deadlines:?}");
    assert!(h.no_pending_request());
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sign_up_timeout_is_retried_once() {
    let mut h = HarnessBuilder::new().start();
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();
    h.handle.provision(provisioning("code-1")).unwrap();

    let first = h.next_request().await;
    let second = h.next_request().await;
    assert_eq!(kind(&second), "sign_up");
    assert!(second.timeout_secs() > first.timeout_secs());

    assert_eq!(h.expect_status(CloudStatus::FailedToRegister).await, Some(FailureReason::NoResponse));
    assert!(h.no_pending_request());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_submissions_fail_with_no_connection() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.retry.transport_retry_limit = 2)
        .start();
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();

    h.transport.fail_next(10);
    h.handle.provision(provisioning("code-1")).unwrap();

    assert_eq!(
        h.expect_status(CloudStatus::FailedToRegister).await,
        Some(FailureReason::NoInternetConnection)
    );
    assert!(h.no_pending_request());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_refused_submission_is_retried() {
    let mut h = HarnessBuilder::new().saved(saved_credentials()).detached().start();

    h.transport.fail_next(1);
    h.network.set(true);
    h.handle.network_changed(true).unwrap();

    let sign_in = h.next_request().await;
    assert_eq!(kind(&sign_in), "sign_in");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn delivery_failures_resend_and_reset_after_an_answer() {
    let mut h = HarnessBuilder::new()
        .saved(saved_credentials())
        .config(|c| c.retry.transport_retry_limit = 2)
        .start();

    for _ in 0..2 {
        let sign_in = h.next_request().await;
        assert_eq!(kind(&sign_in), "sign_in");
        assert_eq!(sign_in.timeout_secs(), 2);
        sign_in.reply(comm_error());
    }
    h.next_request().await.ok();

    // A real answer cleared the count, so two more failures are tolerated.
    for _ in 0..2 {
        let primary = h.next_request().await;
        assert_eq!(publish_scope(&primary), Some(PublishScope::Primary));
        primary.reply(comm_error());
    }
    h.next_request().await.ok();

    assert_eq!(h.expect_status(CloudStatus::Published).await, None);
    assert!(!h.drain_statuses().contains(&CloudStatus::FailedToPublish));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_delivery_failures_fail_with_no_connection() {
    let mut h = HarnessBuilder::new()
        .saved(saved_credentials())
        .config(|c| c.retry.transport_retry_limit = 2)
        .start();

    for _ in 0..3 {
        let sign_in = h.next_request().await;
        assert_eq!(kind(&sign_in), "sign_in");
        sign_in.reply(comm_error());
    }

    assert_eq!(
        h.expect_status(CloudStatus::FailedToRegister).await,
        Some(FailureReason::NoInternetConnection)
    );
    assert!(h.no_pending_request());
    h.shutdown().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connectivity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn provisioning_while_detached_starts_on_attach() {
    let mut h = HarnessBuilder::new().detached().start();
    assert_eq!(h.handle.state(), SessionState::Disconnected);

    h.handle.provision(provisioning("code-1")).unwrap();
    h.network.set(true);
    h.handle.network_changed(true).unwrap();

    let sign_up = h.next_request().await;
    assert_eq!(kind(&sign_up), "sign_up");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn detach_mid_sign_up_restarts_it_on_reattach() {
    let mut h = HarnessBuilder::new().start();
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();
    let outcome = h.handle.await_outcome();
    h.handle.provision(provisioning("code-1")).unwrap();
    let interrupted = h.next_request().await;

    h.network.set(false);
    h.handle.network_changed(false).unwrap();
    assert!(!outcome.await.unwrap().success);
    h.handle
        .wait_for_state(|s| *s == SessionState::Disconnected)
        .await
        .unwrap();

    // The interrupted request no longer counts.
    interrupted.reply(sign_up_ok("at-stale"));

    h.network.set(true);
    h.handle.network_changed(true).unwrap();
    let retried = h.next_request().await;
    match &retried.request.request {
        CloudRequest::SignUp { grant, .. } => assert_eq!(
            grant,
            &AuthGrant::AuthCode {
                code: "code-1".into()
            }
        ),
        other => panic!("expected sign-up, got {other:?}"),
    }
    assert!(!h.drain_statuses().contains(&CloudStatus::SignedUp));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn detach_while_published_resumes_on_reattach() {
    let mut h = HarnessBuilder::new().saved(saved_credentials()).start();
    h.next_request().await.ok();
    h.next_request().await.ok();
    h.expect_status(CloudStatus::Published).await;
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();

    h.network.set(false);
    h.handle.network_changed(false).unwrap();
    h.handle
        .wait_for_state(|s| *s == SessionState::Disconnected)
        .await
        .unwrap();
    assert!(h.no_pending_request());

    h.network.set(true);
    h.handle.network_changed(true).unwrap();
    let sign_in = h.next_request().await;
    match &sign_in.request.request {
        CloudRequest::SignIn { access_token, .. } => assert_eq!(access_token, "at-saved"),
        other => panic!("expected sign-in, got {other:?}"),
    }
    sign_in.ok();
    let primary = h.next_request().await;
    assert_eq!(publish_scope(&primary), Some(PublishScope::Primary));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_connection_to_our_endpoint_signs_in_again() {
    let mut h = HarnessBuilder::new().saved(saved_credentials()).start();
    h.next_request().await.ok();
    h.next_request().await.ok();
    h.expect_status(CloudStatus::Published).await;
    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();

    h.handle.connection_lost("192.168.1.1", 5683).unwrap();
    h.handle.connection_lost("10.0.0.7", 5683).unwrap();

    let sign_in = h.next_request().await;
    assert_eq!(kind(&sign_in), "sign_in");
    sign_in.ok();
    let primary = h.next_request().await;
    assert_eq!(publish_scope(&primary), Some(PublishScope::Primary));
    assert!(h.no_pending_request());
    h.shutdown().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token upkeep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn token_near_expiry_is_refreshed_in_the_background() {
    let mut creds = saved_credentials();
    creds.expires_in = 120;
    let mut h = HarnessBuilder::new()
        .saved(creds)
        .config(|c| c.refresh.check_interval_secs = 30)
        .start();

    h.next_request().await.ok();
    h.next_request().await.ok();
    h.expect_status(CloudStatus::Published).await;

    let refresh = h.next_request().await;
    assert_eq!(kind(&refresh), "refresh_token");
    refresh.reply(refresh_ok("at-2"));

    h.handle.wait_for_state(|s| s.is_stopped()).await.unwrap();
    assert_eq!(h.storage.stored().unwrap().access_token, "at-2");
    let statuses = h.drain_statuses();
    assert!(statuses.contains(&CloudStatus::RefreshingToken));
    assert!(!statuses.contains(&CloudStatus::SigningIn));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn keep_alive_pings_once_the_interval_elapses() {
    let mut h = HarnessBuilder::new()
        .saved(saved_credentials())
        .config(|c| {
            c.refresh.check_interval_secs = 30;
            c.refresh.keepalive_interval_secs = 60;
        })
        .start();

    h.next_request().await.ok();
    h.next_request().await.ok();
    h.expect_status(CloudStatus::Published).await;

    let ping = h.next_request().await;
    assert_eq!(kind(&ping), "discover");
    ping.ok();
    assert_eq!(h.handle.state(), SessionState::Stopped);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_keep_alive_signs_in_again() {
    let mut h = HarnessBuilder::new()
        .saved(saved_credentials())
        .config(|c| {
            c.refresh.check_interval_secs = 50;
            c.refresh.keepalive_interval_secs = 100;
        })
        .start();

    h.next_request().await.ok();
    h.next_request().await.ok();
    h.expect_status(CloudStatus::Published).await;

    let mut ping = h.next_request().await;
    assert_eq!(kind(&ping), "discover");
    while ping.timeout_secs() < 10 {
        let next = h.next_request().await;
        assert_eq!(kind(&next), "discover");
        assert!(next.timeout_secs() > ping.timeout_secs());
        ping = next;
    }
    assert_eq!(ping.timeout_secs(), 10);

    let sign_in = h.next_request().await;
    assert_eq!(kind(&sign_in), "sign_in");
    assert!(h.drain_statuses().contains(&CloudStatus::SigningIn));
    h.shutdown().await;
}
