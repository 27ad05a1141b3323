use std::time::Duration;

use blobmirror::proxy::{Flight, Group};

#[tokio::test]
async fn test_first_caller_leads() {
    let group = Group::new();
    let Flight::Leader(guard) = group.join("abc") else {
        panic!("first join must lead");
    };
    assert_eq!(guard.key(), "abc");
    assert!(matches!(group.join("abc"), Flight::Follower(_)));
    assert!(matches!(group.join("def"), Flight::Leader(_)));
    assert_eq!(group.in_flight(), 1);
    drop(guard);
    assert_eq!(group.in_flight(), 0);
    assert!(group.try_lead("abc").is_some());
}

#[tokio::test]
async fn test_waiter_wakes_when_leader_finishes() {
    let group = Group::new();
    let Flight::Leader(guard) = group.join("abc") else {
        panic!("first join must lead");
    };
    let Flight::Follower(waiter) = group.join("abc") else {
        panic!("second join must follow");
    };
    let wait = tokio::spawn(waiter.wait(Duration::from_secs(5)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(guard);
    assert!(wait.await.unwrap());
    assert!(group.try_lead("abc").is_some());
}

#[tokio::test]
async fn test_waiter_times_out() {
    let group = Group::new();
    let _guard = group.try_lead("abc").unwrap();
    let Flight::Follower(waiter) = group.join("abc") else {
        panic!("second join must follow");
    };
    assert!(!waiter.wait(Duration::from_millis(50)).await);
    assert!(group.try_lead("abc").is_none());
}

#[tokio::test]
async fn test_waiter_observes_without_leading() {
    let group = Group::new();
    assert!(group.waiter("abc").is_none());
    let guard = group.try_lead("abc").unwrap();
    let waiter = group.waiter("abc").unwrap();
    assert_eq!(group.in_flight(), 1);
    drop(guard);
    assert!(waiter.wait(Duration::from_secs(1)).await);
    assert!(group.waiter("abc").is_none());
}
