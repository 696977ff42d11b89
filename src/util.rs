use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Normalise one monitor key component for use inside an environment variable
/// name: uppercase, non-alphanumerics mapped to `_`, runs of `_` collapsed,
/// edge `_` trimmed.
pub fn env_key_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_component_normalises() {
        assert_eq!(env_key_component("openai"), "OPENAI");
        assert_eq!(env_key_component("api.relay-eu"), "API_RELAY_EU");
        assert_eq!(env_key_component("a  b--c"), "A_B_C");
        assert_eq!(env_key_component("-edge-"), "EDGE");
        assert_eq!(env_key_component(""), "");
    }

    #[test]
    fn test_unix_now_is_positive() {
        assert!(unix_now() > 1_500_000_000);
    }
}
