//! Tests for process configuration.
//!
//! Configuration is built from a lookup closure, so no test mutates the real
//! process environment.

use std::collections::HashMap;
use streamproc::{ENV_LOG_FILTER, ENV_MEDIA_TYPE, ENV_PAYLOAD_PIPE, PayloadChannel, ProcessConfig};

fn config_from(vars: &[(&str, &str)]) -> ProcessConfig {
    let map: HashMap<&str, &str> = vars.iter().copied().collect();
    ProcessConfig::from_lookup(|name| map.get(name).map(|v| v.to_string()))
}

#[test]
fn test_both_variables_captured() {
    let config = config_from(&[
        (ENV_MEDIA_TYPE, "application/vnd.oci.image.layer.v1.tar+gzip"),
        (ENV_PAYLOAD_PIPE, r"\\.\pipe\sp-1234"),
    ]);
    assert_eq!(
        config.media_type.as_deref(),
        Some("application/vnd.oci.image.layer.v1.tar+gzip")
    );
    assert_eq!(
        config.payload_pipe.as_ref().map(|h| h.address()),
        Some(r"\\.\pipe\sp-1234")
    );
}

#[test]
fn test_unset_pipe_means_no_channel() {
    let config = config_from(&[(ENV_MEDIA_TYPE, "application/vnd.oci.image.layer.v1.tar")]);
    assert!(config.payload_pipe.is_none());
    assert!(PayloadChannel::from_config(&config).handle().is_none());
}

#[test]
fn test_forwarded_env_round_trips_through_lookup() {
    let sent = config_from(&[
        (ENV_MEDIA_TYPE, "application/vnd.oci.image.layer.v1.tar"),
        (ENV_PAYLOAD_PIPE, "/run/sp.sock"),
        (ENV_LOG_FILTER, "debug"),
        ("USERPROFILE", "C:\\Users\\admin"),
    ]);

    // What the child reads back from its environment equals what the parent had.
    let forwarded = sent.forwarded_env();
    let child = ProcessConfig::from_lookup(|name| {
        forwarded
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    });
    assert_eq!(child, sent);
    assert!(forwarded.iter().all(|(k, _)| k != "USERPROFILE"));
}

#[test]
fn test_log_filter_forwarded() {
    let config = config_from(&[(ENV_LOG_FILTER, "streamproc=trace")]);
    assert!(
        config
            .forwarded_env()
            .contains(&(ENV_LOG_FILTER.to_string(), "streamproc=trace".to_string()))
    );
}
