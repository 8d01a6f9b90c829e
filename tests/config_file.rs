//! Loading configuration files from disk with environment expansion.
//!
//! Each test uses its own env var names so they can run in parallel.

use std::io::Write;

use llm_router::config::{AuthType, Config, ConfigError, KeySource};
use llm_router::router::RoutingStrategy;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

#[test]
fn test_file_with_env_expanded_secrets() {
    std::env::set_var("LLM_ROUTER_TEST_CFG_OPENAI", "sk-from-env");
    std::env::set_var("LLM_ROUTER_TEST_CFG_SECRET", "hmac-from-env");

    let file = write_config(
        r#"
[server]
port = 9090

[router]
routingStrategy = "cost"

[[clusters]]
name = "gpu-a"
endpoint = "https://gpu-a.internal"
costPerHour = 2.5
authType = "hmac"
sharedSecret = "${LLM_ROUTER_TEST_CFG_SECRET}"

[[externalProviders]]
name = "openai"
type = "openai"
apiKey = "${LLM_ROUTER_TEST_CFG_OPENAI}"
"#,
    );

    let (config, sources) = Config::from_file(file.path()).unwrap();
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.router.routing_strategy, RoutingStrategy::Cost);
    assert_eq!(config.clusters[0].auth_type, Some(AuthType::Hmac));
    assert_eq!(
        config.clusters[0].shared_secret.as_ref().unwrap().expose_secret(),
        "hmac-from-env"
    );
    assert_eq!(
        config.external_providers[0].api_key.as_ref().unwrap().expose_secret(),
        "sk-from-env"
    );
    assert_eq!(sources, vec![("openai".to_string(), KeySource::EnvExpanded)]);
}

#[test]
fn test_convention_variable_supplies_missing_key() {
    std::env::set_var("LLM_ROUTER_CONVENTION_CLAUDE_API_KEY", "c-from-convention");

    let file = write_config(
        r#"
[[externalProviders]]
name = "convention-claude"
type = "claude"
"#,
    );

    let (config, sources) = Config::from_file(file.path()).unwrap();
    assert_eq!(
        config.external_providers[0].api_key.as_ref().unwrap().expose_secret(),
        "c-from-convention"
    );
    assert_eq!(
        sources[0].1,
        KeySource::Convention("LLM_ROUTER_CONVENTION_CLAUDE_API_KEY".to_string())
    );
}

#[test]
fn test_missing_variable_names_the_owner() {
    let file = write_config(
        r#"
[[externalProviders]]
name = "gemini"
type = "gemini"
apiKey = "${LLM_ROUTER_TEST_CFG_DOES_NOT_EXIST}"
"#,
    );

    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::EnvVar { .. }));
    let message = err.to_string();
    assert!(message.contains("LLM_ROUTER_TEST_CFG_DOES_NOT_EXIST"), "{}", message);
    assert!(message.contains("gemini"), "{}", message);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = Config::from_file("/nonexistent/llm-router.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_secrets_are_redacted_in_debug() {
    let file = write_config(
        r#"
[[clusters]]
name = "gpu-a"
endpoint = "https://gpu-a.internal"
authType = "hmac"
sharedSecret = "super-secret-value"
"#,
    );

    let (config, _) = Config::from_file(file.path()).unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("super-secret-value"));
    assert!(debug.contains("[REDACTED]"));
}
