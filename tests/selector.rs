use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use blobmirror::proxy::{DynamicWeight, UpstreamSelector, WeightPolicy, MIN_WEIGHT};

fn selector(urls: &[&str]) -> UpstreamSelector {
    let selector = UpstreamSelector::new(1);
    for url in urls {
        selector.register(url);
    }
    selector
}

fn load_of(selector: &UpstreamSelector, url: &str) -> usize {
    selector
        .snapshot()
        .into_iter()
        .find(|m| m.url == url)
        .map(|m| m.load)
        .unwrap()
}

#[test]
fn test_empty_selector_is_unavailable() {
    let selector = UpstreamSelector::new(1);
    assert!(selector.is_empty());
    assert_eq!(selector.acquire(), None);
}

#[test]
fn test_register_defaults_and_dedup() {
    let selector = selector(&["https://a.example/", "https://a.example", "https://b.example"]);
    let snapshot = selector.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].url, "https://a.example");
    assert!(snapshot.iter().all(|m| m.alive && m.load == 0 && m.weight == 1.0));
}

#[test]
fn test_acquire_prefers_least_loaded() {
    // Two mirrors at weight 1: three acquires split 2/1 between them.
    let selector = selector(&["https://a.example", "https://b.example"]);
    let first = selector.acquire().unwrap();
    let second = selector.acquire().unwrap();
    assert_ne!(first, second);
    let third = selector.acquire().unwrap();
    assert_eq!(load_of(&selector, &third), 2);
    let other = if third == first { &second } else { &first };
    assert_eq!(load_of(&selector, other), 1);
}

#[test]
fn test_release_recomputes_weight() {
    let selector = selector(&["https://a.example"]);
    let url = selector.acquire().unwrap();
    selector.acquire().unwrap();

    // 10 MB in one second: throughput tier 1e5, weight = 0.7 * 1 + 0.3 * 100.
    selector.release(&url, Duration::from_secs(1), 10_000_000);
    let status = &selector.snapshot()[0];
    assert_eq!(status.load, 1);
    assert!((status.weight - 30.7).abs() < 1e-9, "weight {}", status.weight);
}

#[test]
fn test_heavier_mirror_takes_more_load() {
    let selector = selector(&["https://fast.example", "https://slow.example"]);
    for url in ["https://fast.example", "https://slow.example"] {
        while selector.acquire().as_deref() != Some(url) {}
    }
    // Reset both to zero load with very different weights.
    for status in selector.snapshot() {
        for _ in 0..status.load {
            let bytes = if status.url.contains("fast") { 1_000_000_000 } else { 1_000 };
            selector.release(&status.url, Duration::from_secs(1), bytes);
        }
    }
    let picks: Vec<String> = (0..5).map(|_| selector.acquire().unwrap()).collect();
    let fast = picks.iter().filter(|u| u.contains("fast")).count();
    assert!(fast >= 4, "picks {picks:?}");
}

#[test]
fn test_dead_mirror_is_skipped_until_resurrection() {
    let selector = selector(&["https://a.example", "https://b.example"]);
    selector.mark_dead("https://a.example");
    for _ in 0..10 {
        let url = selector.acquire().unwrap();
        assert_eq!(url, "https://b.example");
        selector.release(&url, Duration::from_millis(10), 1024);
    }

    selector.mark_dead("https://b.example");
    let revived = selector.acquire().unwrap();
    assert!(revived == "https://a.example" || revived == "https://b.example");
    assert!(selector.snapshot().iter().all(|m| m.alive));
}

#[test]
fn test_only_live_mirror_serves_and_drains() {
    let selector = selector(&["https://a.example", "https://b.example", "https://c.example"]);
    selector.mark_dead("https://a.example");
    selector.mark_dead("https://c.example");
    for _ in 0..10 {
        let url = selector.acquire().unwrap();
        assert_eq!(url, "https://b.example");
        assert_eq!(load_of(&selector, &url), 1);
        selector.release(&url, Duration::from_millis(20), 4096);
        assert_eq!(load_of(&selector, &url), 0);
    }
    let snapshot = selector.snapshot();
    assert_eq!(snapshot.iter().filter(|m| m.alive).count(), 1);
    assert!(snapshot.iter().all(|m| m.load == 0));
}

#[test]
fn test_mark_dead_clears_load() {
    let selector = selector(&["https://a.example"]);
    let url = selector.acquire().unwrap();
    selector.acquire().unwrap();
    selector.mark_dead(&url);
    let status = &selector.snapshot()[0];
    assert!(!status.alive);
    assert_eq!(status.load, 0);

    // A late release for a request sent before the mirror died must not underflow.
    selector.release(&url, Duration::from_millis(5), 0);
    assert_eq!(selector.snapshot()[0].load, 0);
}

#[test]
fn test_unknown_urls_are_ignored() {
    let selector = selector(&["https://a.example"]);
    selector.release("https://nope.example", Duration::from_secs(1), 10);
    selector.mark_dead("https://nope.example");
    let status = &selector.snapshot()[0];
    assert!(status.alive);
    assert_eq!(status.load, 0);
}

#[test]
fn test_zero_resurrections_gives_up() {
    let selector = UpstreamSelector::new(0);
    selector.register("https://a.example");
    selector.mark_dead("https://a.example");
    assert_eq!(selector.acquire(), None);
}

#[test]
fn test_ties_spread_across_mirrors() {
    let urls = ["https://a.example", "https://b.example", "https://c.example"];
    let selector = selector(&urls);
    let mut seen = HashSet::new();
    for _ in 0..200 {
        let url = selector.acquire().unwrap();
        selector.release(&url, Duration::ZERO, 0);
        seen.insert(url);
    }
    assert_eq!(seen.len(), urls.len());
}

#[test]
fn test_load_never_negative_under_concurrency() {
    let selector = Arc::new(selector(&["https://a.example", "https://b.example", "https://c.example"]));
    let mut handles = Vec::new();
    for worker in 0..8 {
        let selector = Arc::clone(&selector);
        handles.push(std::thread::spawn(move || {
            for i in 0..500 {
                let Some(url) = selector.acquire() else { continue };
                match (worker + i) % 7 {
                    0 => selector.mark_dead(&url),
                    1 => {
                        selector.release(&url, Duration::from_millis(1), 0);
                        selector.release(&url, Duration::from_millis(1), 0);
                    }
                    _ => selector.release(&url, Duration::from_millis(3), 4096),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for status in selector.snapshot() {
        assert!(status.weight > 0.0);
        assert!(status.load <= 8);
    }
}

#[test]
fn test_weight_tiers() {
    assert_eq!(DynamicWeight::normalizer(2e9), 1e3);
    assert_eq!(DynamicWeight::normalizer(2e6), 1e5);
    assert_eq!(DynamicWeight::normalizer(1e6), 1e6);

    let policy = DynamicWeight::default();
    let w = policy.weight(0, Duration::from_secs(1), 2_000_000_000);
    assert!((w - 0.3 * 2e6).abs() < 1e-6);
    assert_eq!(policy.weight(0, Duration::ZERO, 0), MIN_WEIGHT);
}
