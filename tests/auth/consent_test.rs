//! Tests for `src/auth/consent.rs`.

use std::sync::Arc;
use std::time::Duration;

use forcequit::auth::consent::ConsentResolution;
use forcequit::auth::{ConsentBroker, ConsentDecision, ConsentPrompt, ConsentRequest};
use forcequit::policy::{Capability, PrivilegeTier};

fn request() -> ConsentRequest {
    ConsentRequest {
        capability: Capability::InstallHelper,
        summary: "Install the helper?".to_owned(),
        elevates_to: PrivilegeTier::UserElevated,
    }
}

#[tokio::test]
async fn approval_reaches_the_requester() {
    let (broker, mut notices) = ConsentBroker::new(Duration::from_secs(30));
    let broker = Arc::new(broker);

    let asking = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.request(request()).await })
    };

    let notice = notices.recv().await.expect("notice delivered");
    assert_eq!(notice.request.capability, Capability::InstallHelper);
    assert_eq!(broker.pending_count(), 1);
    assert_eq!(broker.resolve(&notice.id, true), ConsentResolution::Resolved);

    let decision = asking.await.expect("task joins");
    assert_eq!(decision, ConsentDecision::Approved);
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn answers_are_single_use() {
    let (broker, mut notices) = ConsentBroker::new(Duration::from_secs(30));
    let broker = Arc::new(broker);

    let asking = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.request(request()).await })
    };
    let notice = notices.recv().await.expect("notice delivered");
    assert_eq!(broker.resolve(&notice.id, false), ConsentResolution::Resolved);
    assert_eq!(broker.resolve(&notice.id, true), ConsentResolution::NotFound);
    assert_eq!(asking.await.expect("task joins"), ConsentDecision::Denied);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_expires() {
    let (broker, mut notices) = ConsentBroker::new(Duration::from_secs(5));
    let broker = Arc::new(broker);

    let asking = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.request(request()).await })
    };
    let _notice = notices.recv().await.expect("notice delivered");
    tokio::time::advance(Duration::from_secs(6)).await;

    let decision = asking.await.expect("task joins");
    assert_eq!(decision, ConsentDecision::Expired);
    assert!(!decision.approved());
}

#[tokio::test]
async fn no_listener_means_refusal() {
    let (broker, notices) = ConsentBroker::new(Duration::from_secs(30));
    drop(notices);
    assert_eq!(broker.request(request()).await, ConsentDecision::Denied);
    assert_eq!(broker.pending_count(), 0);
}
