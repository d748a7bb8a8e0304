use std::time::Duration;

use assert_matches::assert_matches;

use crate::config::AssemblyConfig;
use crate::error::AssemblyError;

#[test]
fn test_empty_config_uses_defaults() {
    let config = AssemblyConfig::from_toml_str("").unwrap();
    assert_eq!(config, AssemblyConfig::default());
    assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
}

#[test]
fn test_partial_config_overrides() {
    let raw = r#"
        min_participants = 4
        auto_accept = true

        [ballot]
        max_text_size = 280
    "#;
    let config = AssemblyConfig::from_toml_str(raw).unwrap();

    assert_eq!(config.min_participants, 4);
    assert!(config.auto_accept);
    assert_eq!(config.ballot.max_text_size, 280);
    assert_eq!(config.ballot.min_random_padding, 32);
}

#[test]
fn test_invalid_config_rejected() {
    assert_matches!(AssemblyConfig::from_toml_str("min_participants = 0"), Err(AssemblyError::Config(_)));
    assert_matches!(
        AssemblyConfig::from_toml_str("[ballot]\nmin_random_padding = 0"),
        Err(AssemblyError::Config(_))
    );
    assert_matches!(AssemblyConfig::from_toml_str("min_participants = \"two\""), Err(AssemblyError::Config(_)));
}

#[test]
fn test_missing_file_is_config_error() {
    assert_matches!(AssemblyConfig::load("/nonexistent/assembly.toml"), Err(AssemblyError::Config(_)));
}
