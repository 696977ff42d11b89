//! API key resolution from the environment
//!
//! The precedence is: explicit `env_var_name`, then the channel-scoped
//! variable, then the service-scoped variable. Key components are
//! uppercased, non-alphanumerics collapse to single underscores and edge
//! underscores are trimmed. These tests mutate process environment
//! variables, so they are serialised.

use relay_pulse::config::Config;
use serial_test::serial;

fn config_with_monitor(extra: &str) -> Config {
    let yaml = format!(
        r#"
monitors:
  - provider: "open.ai"
    service: relay-eu
    channel: "ch 1"
    model: m1
    url: https://api.test/ping
    headers:
      x-api-key: "{{{{API_KEY}}}}"
{extra}
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn clear_env() {
    for name in [
        "EXPLICIT_PROBE_KEY",
        "MONITOR_OPEN_AI_RELAY_EU_CH_1_API_KEY",
        "MONITOR_OPEN_AI_RELAY_EU_API_KEY",
    ] {
        unsafe { std::env::remove_var(name) };
    }
}

#[test]
#[serial]
fn test_explicit_env_var_wins() {
    clear_env();
    unsafe {
        std::env::set_var("EXPLICIT_PROBE_KEY", "sk-explicit");
        std::env::set_var("MONITOR_OPEN_AI_RELAY_EU_CH_1_API_KEY", "sk-channel");
        std::env::set_var("MONITOR_OPEN_AI_RELAY_EU_API_KEY", "sk-service");
    }

    let config = config_with_monitor("    env_var_name: EXPLICIT_PROBE_KEY");
    let resolved = config.resolve().unwrap();
    assert_eq!(resolved.monitors[0].api_key.as_deref(), Some("sk-explicit"));

    clear_env();
}

#[test]
#[serial]
fn test_channel_scoped_variable_beats_service_scoped() {
    clear_env();
    unsafe {
        std::env::set_var("MONITOR_OPEN_AI_RELAY_EU_CH_1_API_KEY", "sk-channel");
        std::env::set_var("MONITOR_OPEN_AI_RELAY_EU_API_KEY", "sk-service");
    }

    let config = config_with_monitor("");
    let resolved = config.resolve().unwrap();
    assert_eq!(resolved.monitors[0].api_key.as_deref(), Some("sk-channel"));

    clear_env();
}

#[test]
#[serial]
fn test_service_scoped_fallback() {
    clear_env();
    unsafe {
        std::env::set_var("MONITOR_OPEN_AI_RELAY_EU_API_KEY", "sk-service");
    }

    let config = config_with_monitor("");
    let resolved = config.resolve().unwrap();
    assert_eq!(resolved.monitors[0].api_key.as_deref(), Some("sk-service"));

    clear_env();
}

#[test]
#[serial]
fn test_no_variable_resolves_to_none() {
    clear_env();

    let config = config_with_monitor("");
    let resolved = config.resolve().unwrap();
    assert_eq!(resolved.monitors[0].api_key, None);
}
