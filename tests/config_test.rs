use std::time::Duration;

use workq::{Error, SchedulerConfig};

#[test]
fn toml_scheduler_table_is_parsed() {
    let config = SchedulerConfig::from_toml_str(
        r#"
        [scheduler]
        consumer_count = 8
        due_time_secs = 30
        max_queue_items = 100
        "#,
    )
    .unwrap();

    assert_eq!(config.consumer_count, 8);
    assert_eq!(config.due_time(), Duration::from_secs(30));
    assert_eq!(config.capacity(), Some(100));
}

#[test]
fn missing_keys_fall_back_to_defaults() {
    let config = SchedulerConfig::from_toml_str("[scheduler]\nconsumer_count = 2\n").unwrap();
    assert_eq!(config.consumer_count, 2);
    assert_eq!(config.due_time_secs, 5);
    assert_eq!(config.max_queue_items, -1);

    let empty = SchedulerConfig::from_toml_str("").unwrap();
    assert_eq!(empty, SchedulerConfig::default());
}

#[test]
fn toml_with_zero_due_time_is_rejected() {
    let result = SchedulerConfig::from_toml_str("[scheduler]\ndue_time_secs = 0\n");
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let result = SchedulerConfig::from_toml_str("[scheduler]\nconsumer_count = \"many\"\n");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn config_round_trips_through_toml() {
    let config = SchedulerConfig {
        consumer_count: 4,
        due_time_secs: 12,
        max_queue_items: 9,
    };
    let rendered = format!("[scheduler]\n{}", toml::to_string(&config).unwrap());
    assert_eq!(SchedulerConfig::from_toml_str(&rendered).unwrap(), config);
}

// Environment variables are process-wide, so every env case lives in one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("WORKQ_CONSUMER_COUNT");
        std::env::remove_var("WORKQ_DUE_TIME_SECS");
        std::env::remove_var("WORKQ_MAX_QUEUE_ITEMS");
    }
    assert_eq!(SchedulerConfig::from_env().unwrap(), SchedulerConfig::default());

    unsafe {
        std::env::set_var("WORKQ_CONSUMER_COUNT", "6");
        std::env::set_var("WORKQ_DUE_TIME_SECS", " 2 ");
        std::env::set_var("WORKQ_MAX_QUEUE_ITEMS", "50");
    }
    let config = SchedulerConfig::from_env().unwrap();
    assert_eq!(config.consumer_count, 6);
    assert_eq!(config.due_time_secs, 2);
    assert_eq!(config.capacity(), Some(50));

    unsafe {
        std::env::set_var("WORKQ_CONSUMER_COUNT", "lots");
    }
    assert!(matches!(SchedulerConfig::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("WORKQ_CONSUMER_COUNT", "0");
    }
    assert!(matches!(
        SchedulerConfig::from_env(),
        Err(Error::InvalidArgument(_))
    ));

    unsafe {
        std::env::remove_var("WORKQ_CONSUMER_COUNT");
        std::env::remove_var("WORKQ_DUE_TIME_SECS");
        std::env::remove_var("WORKQ_MAX_QUEUE_ITEMS");
    }
}
