// Update detector: heuristics, cache TTL, rate budget and stale fallback

mod common;

use chrono::{Duration, Utc};
use common::*;
use futures_util::future::join_all;
use stackpilot::detector::{DetectorConfig, UpdateDetector};
use stackpilot::error::RemoteError;
use stackpilot::models::*;
use stackpilot::remote::ImageMetadata;
use std::sync::Arc;

fn detector(fake: &Arc<FakeRemote>, max_checks: u32) -> UpdateDetector {
    UpdateDetector::new(
        fake.clone(),
        DetectorConfig {
            cache_ttl: Duration::hours(6),
            max_checks,
            window: Duration::hours(1),
        },
        None,
    )
}

#[tokio::test]
async fn test_latest_tag_needs_no_registry_call() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 3);
    let image = ImageRef::parse("repo:latest");

    let first = d.check_update(ENDPOINT, &image, None).await;
    assert_eq!(
        (first.available, first.stale, first.source),
        (true, false, UpdateSource::LatestTag)
    );
    assert_eq!(fake.count("get_image_metadata"), 0);

    // Many more than the budget maximum.
    for _ in 0..10 {
        let check = d.check_update(ENDPOINT, &image, None).await;
        assert!(check.available && !check.stale);
    }
    assert_eq!(d.budget_used(ENDPOINT), 0);
    assert_eq!(fake.count("get_image_metadata"), 0);
}

#[tokio::test]
async fn test_untagged_image_counts_as_latest() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 1);
    let check = d.check_update(ENDPOINT, &ImageRef::parse("nginx"), None).await;
    assert_eq!(check.source, UpdateSource::LatestTag);
    assert_eq!(fake.count("get_image_metadata"), 0);
}

#[tokio::test]
async fn test_multi_tag_heuristic() {
    let fake = FakeRemote::new();
    fake.set_image(
        "team/app:v2",
        ImageMetadata {
            tags: vec!["v2".into(), "v3".into(), "v4".into()],
            created_at: None,
            digest: None,
        },
    );
    let d = detector(&fake, 5);
    let check = d
        .check_update(ENDPOINT, &ImageRef::parse("team/app:v2"), None)
        .await;
    assert_eq!(
        (check.available, check.stale, check.source),
        (true, false, UpdateSource::MultiTag)
    );
    assert_eq!(check.current_version.as_deref(), Some("v2"));
    assert_eq!(check.available_version.as_deref(), Some("v4"));
    assert_eq!(d.budget_used(ENDPOINT), 1);

    // Served from cache with the same versions.
    let cached = d
        .check_update(ENDPOINT, &ImageRef::parse("team/app:v2"), None)
        .await;
    assert_eq!(cached.available_version.as_deref(), Some("v4"));
    assert_eq!(cached.current_version.as_deref(), Some("v2"));
    assert_eq!(fake.count("get_image_metadata"), 1);
}

#[tokio::test]
async fn test_creation_date_heuristic() {
    let fake = FakeRemote::new();
    let now = Utc::now();
    fake.set_image(
        "postgres:16",
        ImageMetadata {
            tags: vec!["16".into()],
            created_at: Some(now),
            digest: Some("sha256:abc".into()),
        },
    );
    let d = detector(&fake, 5);
    let image = ImageRef::parse("postgres:16");

    let older_container = d
        .check_update(ENDPOINT, &image, Some(now - Duration::days(2)))
        .await;
    assert_eq!(older_container.source, UpdateSource::CreationDate);
    assert!(older_container.available);
    assert_eq!(older_container.available_version.as_deref(), Some("16 (abc)"));

    let d = detector(&fake, 5);
    let newer_container = d
        .check_update(ENDPOINT, &image, Some(now + Duration::minutes(1)))
        .await;
    assert!(!newer_container.available);
    assert_eq!(newer_container.source, UpdateSource::NoSignal);
    assert_eq!(newer_container.available_version, newer_container.current_version);
}

#[tokio::test]
async fn test_digest_pinned_image_needs_no_registry_call() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 5);
    let image = ImageRef::parse("team/app@sha256:0123456789abcdef");

    let check = d.check_update(ENDPOINT, &image, None).await;

    assert_eq!(
        (check.available, check.stale, check.source),
        (false, false, UpdateSource::NoSignal)
    );
    assert_eq!(check.current_version.as_deref(), Some("0123456789ab"));
    assert_eq!(fake.count("get_image_metadata"), 0);
    assert_eq!(d.budget_used(ENDPOINT), 0);
}

#[tokio::test]
async fn test_fresh_cache_entry_is_served_without_registry_call() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 5);
    let image = ImageRef::parse("postgres:16");
    let t0 = Utc::now();

    d.check_update_at(ENDPOINT, &image, None, t0).await;
    let cached = d
        .check_update_at(ENDPOINT, &image, None, t0 + Duration::hours(5))
        .await;
    assert!(!cached.stale);
    assert_eq!(cached.checked_at, Some(t0));
    assert_eq!(fake.count("get_image_metadata"), 1);

    // Past the TTL a budget unit is spent again.
    let rechecked = d
        .check_update_at(ENDPOINT, &image, None, t0 + Duration::hours(7))
        .await;
    assert_eq!(rechecked.checked_at, Some(t0 + Duration::hours(7)));
    assert_eq!(fake.count("get_image_metadata"), 2);
}

#[tokio::test]
async fn test_exhausted_budget_returns_stale_without_registry_calls() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 2);
    let t0 = Utc::now();

    for tag in ["1", "2"] {
        let check = d
            .check_update_at(ENDPOINT, &ImageRef::parse(&format!("app:{tag}")), None, t0)
            .await;
        assert!(!check.stale);
    }
    assert_eq!(d.budget_used_at(ENDPOINT, t0), 2);

    for tag in ["3", "4", "5"] {
        let check = d
            .check_update_at(ENDPOINT, &ImageRef::parse(&format!("app:{tag}")), None, t0)
            .await;
        assert_eq!(
            (check.available, check.stale, check.source),
            (false, true, UpdateSource::Unchecked)
        );
    }
    assert_eq!(fake.count("get_image_metadata"), 2);
    assert_eq!(d.budget_used_at(ENDPOINT, t0), 2);

    // Window rolled over.
    let later = t0 + Duration::hours(1) + Duration::seconds(1);
    let check = d
        .check_update_at(ENDPOINT, &ImageRef::parse("app:3"), None, later)
        .await;
    assert!(!check.stale);
    assert_eq!(fake.count("get_image_metadata"), 3);
}

#[tokio::test]
async fn test_expired_entry_is_stale_fallback_when_budget_exhausted() {
    let fake = FakeRemote::new();
    fake.set_image(
        "team/app:v1",
        ImageMetadata {
            tags: vec!["v1".into(), "v2".into()],
            ..Default::default()
        },
    );
    let d = UpdateDetector::new(
        fake.clone(),
        DetectorConfig {
            cache_ttl: Duration::hours(1),
            max_checks: 1,
            window: Duration::hours(6),
        },
        None,
    );
    let image = ImageRef::parse("team/app:v1");
    let t0 = Utc::now();

    let first = d.check_update_at(ENDPOINT, &image, None, t0).await;
    assert!(first.available && !first.stale);

    let expired = d
        .check_update_at(ENDPOINT, &image, None, t0 + Duration::hours(2))
        .await;
    assert_eq!(
        (expired.available, expired.stale, expired.source),
        (true, true, UpdateSource::MultiTag)
    );
    assert_eq!(expired.checked_at, Some(t0));
    assert_eq!(fake.count("get_image_metadata"), 1);
}

#[tokio::test]
async fn test_registry_failure_refreshes_ttl_and_flags_stale() {
    let fake = FakeRemote::new();
    fake.fail_next(
        "get_image_metadata",
        RemoteError::RateLimited("toomanyrequests".into()),
    );
    let d = detector(&fake, 10);
    let image = ImageRef::parse("team/app:v1");
    let t0 = Utc::now();

    let failed = d.check_update_at(ENDPOINT, &image, None, t0).await;
    assert!(failed.stale);
    assert!(!failed.available);
    let entry = d.cached(ENDPOINT, &image).unwrap();
    assert!(entry.last_error.is_some());
    assert_eq!(entry.expires_at, t0 + Duration::hours(6));

    // No hammering a failing registry: the failed entry holds until its TTL.
    let again = d
        .check_update_at(ENDPOINT, &image, None, t0 + Duration::minutes(30))
        .await;
    assert!(again.stale);
    assert_eq!(fake.count("get_image_metadata"), 1);
    assert_eq!(d.budget_used_at(ENDPOINT, t0), 1);
}

#[tokio::test]
async fn test_registry_failure_keeps_previous_decision() {
    let fake = FakeRemote::new();
    fake.set_image(
        "team/app:v1",
        ImageMetadata {
            tags: vec!["v1".into(), "v9".into()],
            ..Default::default()
        },
    );
    let d = detector(&fake, 10);
    let image = ImageRef::parse("team/app:v1");
    let t0 = Utc::now();
    d.check_update_at(ENDPOINT, &image, None, t0).await;

    fake.fail_next("get_image_metadata", RemoteError::Network("timeout".into()));
    let failed = d
        .check_update_at(ENDPOINT, &image, None, t0 + Duration::hours(7))
        .await;
    assert_eq!(
        (failed.available, failed.stale, failed.source),
        (true, true, UpdateSource::MultiTag)
    );
}

#[tokio::test]
async fn test_budget_is_per_endpoint() {
    let fake = FakeRemote::new();
    let d = detector(&fake, 1);
    let t0 = Utc::now();
    d.check_update_at(1, &ImageRef::parse("app:1"), None, t0).await;
    let other = d.check_update_at(2, &ImageRef::parse("app:2"), None, t0).await;
    assert!(!other.stale);
    let exhausted = d.check_update_at(1, &ImageRef::parse("app:3"), None, t0).await;
    assert!(exhausted.stale);
    assert_eq!(d.budget_used_at(1, t0), 1);
    assert_eq!(d.budget_used_at(2, t0), 1);
}

#[tokio::test]
async fn test_concurrent_checks_never_exceed_budget() {
    let fake = FakeRemote::new();
    let d = Arc::new(detector(&fake, 5));
    let t0 = Utc::now();

    let checks = join_all((0..20).map(|i| {
        let d = d.clone();
        async move {
            d.check_update_at(ENDPOINT, &ImageRef::parse(&format!("app:{i}")), None, t0)
                .await
        }
    }))
    .await;

    assert_eq!(fake.count("get_image_metadata"), 5);
    assert_eq!(checks.iter().filter(|c| !c.stale).count(), 5);
    assert_eq!(checks.iter().filter(|c| c.stale).count(), 15);
    assert_eq!(d.budget_used_at(ENDPOINT, t0), 5);
}

#[tokio::test]
async fn test_request_update_check_by_container() {
    let fake = FakeRemote::new();
    fake.add_container(ENDPOINT, "proxy", "traefik:latest");
    let pilot = pilot(&fake);
    pilot.force_refresh(ENDPOINT).await.unwrap();

    let check = pilot.request_update_check(ENDPOINT, "proxy").await.unwrap();
    assert!(check.available);
    assert_eq!(check.source, UpdateSource::LatestTag);
    assert!(pilot.request_update_check(ENDPOINT, "nope").await.is_err());
}

#[tokio::test]
async fn test_check_all_images_dedupes_images() {
    let fake = FakeRemote::new();
    fake.add_container(ENDPOINT, "a", "redis:7");
    fake.add_container(ENDPOINT, "b", "redis:7");
    fake.add_container(ENDPOINT, "c", "postgres:16");
    let pilot = pilot(&fake);
    pilot.force_refresh(ENDPOINT).await.unwrap();

    pilot.check_all_images(ENDPOINT).await.unwrap();
    assert_eq!(fake.count("get_image_metadata"), 2);
}
