//! Retrieval loop behavior against a scripted mailbox.
//!
//! Time is paused, so the 20 second deadline elapses instantly.

mod common;

use common::{retriever, Inbox, SENDER};
use otp_keygate::Retrieval;
use std::time::Duration;
use tokio::time::Instant;

fn found(code: &str) -> Retrieval {
    Retrieval::Found(otp_keygate::OtpCode::parse(code).unwrap())
}

// ─────────────────────────────────────────────────────────────────────────────
// Fast path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_finds_code_in_text_section() {
    let inbox = Inbox::new();
    let uid = inbox.deliver_text(SENDER, "Your code is 6 2 8-0 1 8");
    let retriever = retriever(&inbox);

    assert_eq!(retriever.retrieve().await, found("628018"));
    assert_eq!(retriever.manager().watermark(), uid);
    assert_eq!(inbox.full_searches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_newest_message_wins() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Your code is 111111");
    inbox.deliver_text(SENDER, "Your code is 222222");

    assert_eq!(retriever(&inbox).retrieve().await, found("222222"));
}

#[tokio::test(start_paused = true)]
async fn test_ignores_other_senders() {
    let inbox = Inbox::new();
    inbox.deliver_text("someone@else.example", "Your code is 333333");
    let retriever = retriever(&inbox);

    let result = retriever
        .retrieve_within(Duration::from_secs(1), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_only_recent_window_is_searched() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Your code is 444444");
    // Thirteen newer messages push the first one out of the window
    for _ in 0..13 {
        inbox.deliver_text("news@else.example", "Weekly digest");
    }
    let retriever = retriever(&inbox);

    let result = retriever
        .retrieve_within(Duration::from_secs(1), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback parse
// ─────────────────────────────────────────────────────────────────────────────

fn html_only_message() -> Vec<u8> {
    format!(
        "From: {SENDER}\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
Verification code: <b>731905</b>\r\n"
    )
    .into_bytes()
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_full_message() {
    let inbox = Inbox::new();
    inbox.deliver(SENDER, Some("no digits here".into()), Some(html_only_message()));

    assert_eq!(retriever(&inbox).retrieve().await, found("731905"));
    assert_eq!(inbox.full_searches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_fallback_above_threshold() {
    let inbox = Inbox::new();
    inbox.deliver(SENDER, Some("no digits here".into()), Some(html_only_message()));
    for _ in 0..5 {
        inbox.deliver_text(SENDER, "Welcome aboard");
    }
    let retriever = retriever(&inbox);

    let result = retriever
        .retrieve_within(Duration::from_secs(1), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);
    assert_eq!(inbox.full_searches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_without_full_body_is_skipped() {
    let inbox = Inbox::new();
    inbox.deliver(SENDER, Some("nothing".into()), None);
    inbox.deliver_text(SENDER, "Your code is 555000");

    // The newest message answers before the empty one is reached
    assert_eq!(retriever(&inbox).retrieve().await, found("555000"));

    let inbox = Inbox::new();
    inbox.deliver(SENDER, Some("nothing".into()), None);
    let retriever = retriever(&inbox);
    let result = retriever
        .retrieve_within(Duration::from_secs(1), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);
    // A message that yields nothing is not a transport failure
    assert_eq!(inbox.connects(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Deadline and polling
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_empty_mailbox_runs_until_deadline() {
    let inbox = Inbox::new();
    let retriever = retriever(&inbox);

    let started = Instant::now();
    assert_eq!(retriever.retrieve().await, Retrieval::NotFound);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(20));
    assert!(elapsed < Duration::from_secs(21));
    // Nothing to search in a mailbox that never held mail
    assert_eq!(inbox.text_searches(), 0);
    assert_eq!(inbox.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_code_arriving_mid_wait() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Welcome aboard");
    let retriever = retriever(&inbox);

    let deliver_later = async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        inbox.deliver_text(SENDER, "Your code is 9-8-7-6-5-4");
    };

    let started = Instant::now();
    let (result, ()) = tokio::join!(retriever.retrieve(), deliver_later);

    assert_eq!(result, found("987654"));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_window_follows_watermark_without_uidnext() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Welcome aboard");
    let retriever = retriever(&inbox);

    // First retrieval learns the watermark from UIDNEXT
    let result = retriever
        .retrieve_within(Duration::from_millis(500), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);
    assert_eq!(retriever.manager().watermark(), 1);

    inbox.with(|state| state.report_next_uid = false);
    inbox.deliver_text(SENDER, "Your code is 121212");

    // Without UIDNEXT the window tops out at the watermark and misses UID 2
    let result = retriever
        .retrieve_within(Duration::from_millis(500), Duration::from_millis(200))
        .await;
    assert_eq!(result, Retrieval::NotFound);

    inbox.with(|state| state.report_next_uid = true);
    assert_eq!(retriever.retrieve().await, found("121212"));
    assert_eq!(retriever.manager().watermark(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failure recovery
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_recovers_from_connect_failures() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Your code is 246810");
    inbox.with(|state| state.fail_next_connects = 2);

    assert_eq!(retriever(&inbox).retrieve().await, found("246810"));
    assert_eq!(inbox.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_search_failure_reconnects() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Your code is 135791");
    inbox.with(|state| state.fail_next_searches = 1);
    let retriever = retriever(&inbox);

    assert_eq!(retriever.retrieve().await, found("135791"));
    assert_eq!(inbox.connects(), 2);
    assert!(retriever.manager().is_connected());

    // The discarded session was logged out in the background
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(inbox.with(|state| state.logouts), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_retrievals_share_one_connection() {
    let inbox = Inbox::new();
    inbox.deliver_text(SENDER, "Your code is 112233");
    let retriever = retriever(&inbox);

    let (a, b, c) = tokio::join!(
        retriever.retrieve(),
        retriever.retrieve(),
        retriever.retrieve()
    );

    assert_eq!(a, found("112233"));
    assert_eq!(b, found("112233"));
    assert_eq!(c, found("112233"));
    assert_eq!(inbox.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_uid_gaps_are_tolerated() {
    let inbox = Inbox::new();
    inbox.advance_uid(500);
    inbox.deliver_text(SENDER, "Your code is 808080");

    assert_eq!(retriever(&inbox).retrieve().await, found("808080"));
}
