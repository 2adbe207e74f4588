//! Subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Set to `true` to emit JSON log lines.
pub const JSON_ENV: &str = "WB_OPCUA_LOG_JSON";

const GATEWAY_TARGETS: &[&str] = &[
    "wb_mqtt_opcua",
    "opcua_gateway_core",
    "opcua_gateway_sync",
    "opcua_gateway_server",
    "opcua",
    "opcua_server",
    "opcua_core",
];

const MQTT_TARGETS: &[&str] = &["opcua_gateway_devices", "rumqttc"];

fn push_targets(directives: &mut Vec<String>, targets: &[&str], level: &str) {
    directives.extend(targets.iter().map(|target| format!("{target}={level}")));
}

/// Filter directives for a `-d` level combined with the config `debug` flag.
///
/// `1` enables gateway debug, `2` MQTT debug, `3` both. Negative values
/// drop the matching targets to warnings.
pub fn filter_directives(debug_level: i8, config_debug: bool) -> String {
    let mut directives = vec!["info".to_string()];

    let gateway_level = match debug_level {
        1 | 3 => Some("debug"),
        -1 | -3 => Some("warn"),
        _ if config_debug => Some("debug"),
        _ => None,
    };
    let mqtt_level = match debug_level {
        2 | 3 => Some("debug"),
        -2 | -3 => Some("warn"),
        _ => None,
    };

    if let Some(level) = gateway_level {
        push_targets(&mut directives, GATEWAY_TARGETS, level);
    }
    if let Some(level) = mqtt_level {
        push_targets(&mut directives, MQTT_TARGETS, level);
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the levels.
pub fn init(debug_level: i8, config_debug: bool) {
    let json = std::env::var(JSON_ENV)
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(debug_level, config_debug)));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(filter_directives(0, false), "info");
    }

    #[test]
    fn test_debug_levels() {
        let gateway = filter_directives(1, false);
        assert!(gateway.contains("opcua_gateway_sync=debug"));
        assert!(!gateway.contains("rumqttc"));

        let mqtt = filter_directives(2, false);
        assert!(mqtt.contains("rumqttc=debug"));
        assert!(!mqtt.contains("opcua_gateway_sync"));

        let both = filter_directives(3, false);
        assert!(both.contains("opcua_gateway_sync=debug"));
        assert!(both.contains("opcua_gateway_devices=debug"));
    }

    #[test]
    fn test_negative_levels_silence_info() {
        let quiet = filter_directives(-3, true);
        assert!(quiet.contains("opcua_gateway_sync=warn"));
        assert!(quiet.contains("rumqttc=warn"));
        assert!(!quiet.contains("=debug"));

        assert!(filter_directives(-2, false).contains("opcua_gateway_devices=warn"));
    }

    #[test]
    fn test_config_debug_flag() {
        assert!(filter_directives(0, true).contains("wb_mqtt_opcua=debug"));
        assert!(filter_directives(2, true).contains("opcua=debug"));
    }
}
