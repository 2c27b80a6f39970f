//! Entry setup and lifecycle tests

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use wemo_config::WemoConfig;
use wemo_config_entries::{
    ConfigEntry, ConfigEntrySource, ConfigEntryState, MigrationOutcome, WemoEntryData,
};
use wemo_core::{FunctionalCategory, DOMAIN};
use wemo_integration::SetupError;
use wemo_registries::DeviceIdentifier;

async fn add_entry(wemo: &TestWemo, host: &str, port: u16) -> String {
    let entry = ConfigEntry::new(DOMAIN, NAME)
        .with_wemo_data(&WemoEntryData::new(&endpoint(host, port)))
        .with_unique_id(SERIAL);
    wemo.entries().add(entry).await.unwrap().entry_id
}

async fn add_v1_entry(wemo: &TestWemo, version: u32) -> String {
    let entry = ConfigEntry::new(DOMAIN, "WeMo").with_version(version, 1);
    wemo.entries().add(entry).await.unwrap().entry_id
}

#[tokio::test]
async fn test_setup_entry() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;

    wemo.integration.setup_entry(&entry_id).await.unwrap();

    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
    let device = wemo.integration.loaded_device(&entry_id).unwrap();
    assert_eq!(device.serial_number, SERIAL);
    assert!(wemo.subscriptions.is_registered(SERIAL));
    assert!(wemo.integration.tracker().is_available(SERIAL));

    let registered = wemo.devices().get_by_identifier(DOMAIN, SERIAL).unwrap();
    assert_eq!(registered.name.as_deref(), Some(NAME));
    assert_eq!(
        registered.manufacturer.as_deref(),
        Some("Belkin International Inc.")
    );
    assert_eq!(registered.model.as_deref(), Some("Socket"));
    assert_eq!(registered.config_entries, vec![entry_id.clone()]);

    // A second setup is a no-op
    wemo.integration.setup_entry(&entry_id).await.unwrap();
    assert_eq!(wemo.fetcher.calls(), 1);
}

#[tokio::test]
async fn test_setup_fixes_category() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let mut data = WemoEntryData::new(&endpoint(HOST, PORT));
    data.category = Some(FunctionalCategory::BinarySensor);
    let entry = ConfigEntry::new(DOMAIN, NAME)
        .with_wemo_data(&data)
        .with_unique_id(SERIAL);
    let entry_id = wemo.entries().add(entry).await.unwrap().entry_id;

    wemo.integration.setup_entry(&entry_id).await.unwrap();

    let data = wemo.entry(&entry_id).wemo_data().unwrap();
    assert_eq!(data.category, Some(FunctionalCategory::Switch));
}

#[tokio::test(start_paused = true)]
async fn test_setup_retries_unreachable_device() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    wemo.fetcher.fail_times(HOST, PORT, 2);
    let entry_id = add_entry(&wemo, HOST, PORT).await;

    let err = wemo.integration.setup_entry(&entry_id).await.unwrap_err();
    let SetupError::NotReady { retry_in, .. } = err else {
        panic!("expected not ready, got {:?}", err);
    };
    assert!(retry_in >= Duration::from_secs(5));
    assert!(retry_in <= Duration::from_millis(5100));

    wemo.assert_state(&entry_id, ConfigEntryState::SetupRetry);
    assert_eq!(wemo.entry(&entry_id).tries, 1);
    assert!(wemo.integration.has_pending_retry(&entry_id));
    assert!(!wemo.integration.tracker().is_available(SERIAL));

    wemo.wait_for_state(&entry_id, ConfigEntryState::Loaded).await;
    assert_eq!(wemo.fetcher.calls(), 3);
    assert_eq!(wemo.entry(&entry_id).tries, 0);
    assert!(wemo.integration.tracker().is_available(SERIAL));
}

#[tokio::test]
async fn test_setup_without_auto_retry() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.integration.set_auto_retry(false);
    let entry_id = add_entry(&wemo, HOST, PORT).await;

    let err = wemo.integration.setup_entry(&entry_id).await.unwrap_err();
    assert!(err.is_not_ready());
    wemo.assert_state(&entry_id, ConfigEntryState::SetupRetry);
    assert!(!wemo.integration.has_pending_retry(&entry_id));

    // Manual retry once the device is back
    wemo.fetcher.add_socket(HOST, PORT);
    wemo.integration.setup_entry(&entry_id).await.unwrap();
    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
}

#[tokio::test]
async fn test_rediscovered_device_skips_retry_backoff() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    let err = wemo.integration.setup_entry(&entry_id).await.unwrap_err();
    assert!(err.is_not_ready());
    assert!(wemo.integration.has_pending_retry(&entry_id));

    wemo.fetcher.add_socket(HOST, 49153);
    let result = wemo
        .integration
        .start_flow(
            ConfigEntrySource::Ssdp,
            json!({
                "ssdp_location": format!("http://{}:49153/setup.xml", HOST),
                "serial": SERIAL,
                "friendly_name": NAME,
            }),
        )
        .await
        .unwrap();

    assert_eq!(result.reason(), Some("already_configured"));
    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
    assert!(!wemo.integration.has_pending_retry(&entry_id));
    assert_eq!(wemo.stored_endpoint(&entry_id), endpoint(HOST, 49153));
}

#[tokio::test]
async fn test_reload_entry_leaves_not_loaded_alone() {
    let wemo = TestWemo::new();
    wemo.fetcher.add_socket(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;

    wemo.integration.reload_entry(&entry_id).await.unwrap();

    wemo.assert_state(&entry_id, ConfigEntryState::NotLoaded);
    assert_eq!(wemo.fetcher.calls(), 0);
}

#[tokio::test]
async fn test_setup_invalid_description_is_not_retried() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_invalid(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;

    let err = wemo.integration.setup_entry(&entry_id).await.unwrap_err();

    assert!(matches!(err, SetupError::Device { .. }));
    wemo.assert_state(&entry_id, ConfigEntryState::SetupError);
    assert!(!wemo.integration.has_pending_retry(&entry_id));
}

#[tokio::test]
async fn test_setup_skips_ignored_entry() {
    let wemo = TestWemo::new();
    let entry = ConfigEntry::new(DOMAIN, NAME)
        .with_unique_id(SERIAL)
        .with_source(ConfigEntrySource::Ignore);
    let entry_id = wemo.entries().add(entry).await.unwrap().entry_id;

    wemo.integration.setup_entry(&entry_id).await.unwrap();

    wemo.assert_state(&entry_id, ConfigEntryState::NotLoaded);
    assert_eq!(wemo.fetcher.calls(), 0);
}

#[tokio::test]
async fn test_v1_entry_superseded_is_removed() {
    let wemo = TestWemo::new();
    let old_id = add_v1_entry(&wemo, 1).await;
    wemo.devices().get_or_create(
        &[DeviceIdentifier::new(DOMAIN, SERIAL)],
        Some(old_id.as_str()),
        Some(NAME),
    );
    wemo.devices().get_or_create(
        &[DeviceIdentifier::new(DOMAIN, SERIAL)],
        Some("new-entry"),
        Some(NAME),
    );

    let err = wemo.integration.setup_entry(&old_id).await.unwrap_err();

    assert!(matches!(
        err,
        SetupError::NotMigrated {
            outcome: MigrationOutcome::Superseded,
            ..
        }
    ));
    assert!(wemo.entries().get(&old_id).is_none());
    let device = wemo.devices().get_by_identifier(DOMAIN, SERIAL).unwrap();
    assert_eq!(device.config_entries, vec!["new-entry".to_string()]);
}

#[tokio::test]
async fn test_v1_entry_with_unmigrated_device_is_kept() {
    let wemo = TestWemo::new();
    let old_id = add_v1_entry(&wemo, 1).await;
    wemo.devices().get_or_create(
        &[DeviceIdentifier::new(DOMAIN, SERIAL)],
        Some(old_id.as_str()),
        Some(NAME),
    );

    let err = wemo.integration.setup_entry(&old_id).await.unwrap_err();

    assert!(matches!(
        err,
        SetupError::NotMigrated {
            outcome: MigrationOutcome::Retain,
            ..
        }
    ));
    wemo.assert_state(&old_id, ConfigEntryState::MigrationError);
    assert!(wemo.devices().get_by_identifier(DOMAIN, SERIAL).is_some());
}

#[tokio::test]
async fn test_unsupported_version_fails_setup() {
    let wemo = TestWemo::new();
    let entry_id = add_v1_entry(&wemo, 0).await;

    let err = wemo.integration.setup_entry(&entry_id).await.unwrap_err();

    assert!(matches!(err, SetupError::Migration(_)));
    wemo.assert_state(&entry_id, ConfigEntryState::MigrationError);
}

#[tokio::test]
async fn test_newer_version_sets_up() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let entry = ConfigEntry::new(DOMAIN, NAME)
        .with_version(3, 1)
        .with_wemo_data(&WemoEntryData::new(&endpoint(HOST, PORT)))
        .with_unique_id(SERIAL);
    let entry_id = wemo.entries().add(entry).await.unwrap().entry_id;

    wemo.integration.setup_entry(&entry_id).await.unwrap();

    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
}

#[tokio::test]
async fn test_unload_entry() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    wemo.integration.setup_entry(&entry_id).await.unwrap();

    wemo.integration.unload_entry(&entry_id).await.unwrap();

    wemo.assert_state(&entry_id, ConfigEntryState::NotLoaded);
    assert!(!wemo.subscriptions.is_registered(SERIAL));
    assert!(wemo.integration.loaded_device(&entry_id).is_none());
    assert!(wemo.integration.tracker().get(SERIAL).is_none());

    // And back again
    wemo.integration.setup_entry(&entry_id).await.unwrap();
    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
}

#[tokio::test]
async fn test_unload_failure() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    wemo.integration.setup_entry(&entry_id).await.unwrap();
    wemo.subscriptions.set_fail_unregister(true);

    let err = wemo.integration.unload_entry(&entry_id).await.unwrap_err();

    assert!(matches!(err, SetupError::Subscription(_)));
    wemo.assert_state(&entry_id, ConfigEntryState::FailedUnload);
}

#[tokio::test]
async fn test_remove_entry() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    wemo.integration.setup_entry(&entry_id).await.unwrap();

    let removed = wemo.integration.remove_entry(&entry_id).await.unwrap();

    assert_eq!(removed.entry_id, entry_id);
    assert!(wemo.entries().get(&entry_id).is_none());
    assert!(wemo.devices().get_by_identifier(DOMAIN, SERIAL).is_none());
    assert!(!wemo.subscriptions.is_registered(SERIAL));
}

#[tokio::test]
async fn test_static_config_duplicates_collapse() {
    let wemo = TestWemo::new();
    wemo.fetcher.add_socket(HOST, PORT);
    let config = WemoConfig {
        static_hosts: vec![endpoint(HOST, PORT), endpoint(HOST, PORT)],
        discovery: true,
    };

    wemo.integration.async_setup(&config).await.unwrap();

    assert!(wemo.subscriptions.is_running());
    let entries = wemo.wemo_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, ConfigEntrySource::Import);
    wemo.assert_state(&entries[0].entry_id, ConfigEntryState::Loaded);
    assert_eq!(wemo.integration.flows().in_progress_count(), 0);
}

#[tokio::test]
async fn test_static_config_updates_address() {
    let wemo = TestWemo::new();
    wemo.fetcher.add_socket(HOST, PORT + 1);
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    let config = WemoConfig {
        static_hosts: vec![endpoint(HOST, PORT + 1)],
        discovery: true,
    };

    wemo.integration.async_setup(&config).await.unwrap();
    assert_eq!(wemo.stored_endpoint(&entry_id), endpoint(HOST, PORT + 1));

    assert_eq!(wemo.integration.setup_all().await, 1);
    wemo.assert_state(&entry_id, ConfigEntryState::Loaded);
}

#[tokio::test]
async fn test_static_config_without_port_unreachable() {
    let wemo = TestWemo::new();
    let config = WemoConfig {
        static_hosts: vec![endpoint(HOST, 0)],
        discovery: false,
    };

    wemo.integration.async_setup(&config).await.unwrap();

    assert!(wemo.wemo_entries().is_empty());
    assert_eq!(wemo.integration.flows().in_progress_count(), 0);
}

#[tokio::test]
async fn test_setup_all_after_restart() {
    let wemo = TestWemo::new();
    wemo.start_subscriptions().await;
    wemo.fetcher.add_socket(HOST, PORT);
    wemo.fetcher
        .add_device("10.0.0.2", PORT, "Motion", "MotionSerial", "Motion");
    let entry_id = add_entry(&wemo, HOST, PORT).await;
    let ignored = ConfigEntry::new(DOMAIN, "Ignored")
        .with_unique_id("IgnoredSerial")
        .with_source(ConfigEntrySource::Ignore);
    wemo.entries().add(ignored).await.unwrap();
    let motion = ConfigEntry::new(DOMAIN, "Motion")
        .with_wemo_data(&WemoEntryData::new(&endpoint("10.0.0.2", PORT)))
        .with_unique_id("MotionSerial");
    wemo.entries().add(motion).await.unwrap();

    assert_eq!(wemo.integration.setup_all().await, 2);
    wemo.integration.shutdown().await;

    let restarted = wemo.restart().await;
    assert_eq!(restarted.entries().len(), 3);
    assert_eq!(
        restarted.entries().get(&entry_id).unwrap().state,
        ConfigEntryState::NotLoaded
    );
    assert!(restarted.devices().get_by_identifier(DOMAIN, SERIAL).is_some());

    wemo.start_subscriptions().await;
    assert_eq!(restarted.setup_all().await, 2);
}
