use sb_domain::config::{Config, ProviderKind};

#[test]
fn empty_file_is_a_valid_config() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.server.port, 3210);
    assert_eq!(config.server.host, "127.0.0.1");
    assert!(config.compaction.enabled);
    assert_eq!(config.tools.max_tool_loops, 25);
}

#[test]
fn default_cors_allows_only_localhost() {
    let config = Config::default();
    assert!(config
        .server
        .cors
        .allowed_origins
        .contains(&"http://localhost:*".to_string()));
    assert!(config
        .server
        .cors
        .allowed_origins
        .contains(&"http://127.0.0.1:*".to_string()));
}

#[test]
fn compaction_thresholds_parse() {
    let toml_str = r#"
[compaction]
token_ceiling = 80000
idle_lifespan_minutes = 30
idle_token_floor = 5000
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.compaction.token_ceiling, 80_000);
    assert_eq!(config.compaction.idle_lifespan_minutes, 30);
    assert_eq!(config.compaction.idle_token_floor, 5_000);
    // Untouched fields keep their defaults.
    assert_eq!(config.compaction.summary_tool_result_chars, 2000);
}

#[test]
fn truncation_defaults_leave_room_for_marker() {
    let config = Config::default();
    let t = &config.tools;
    assert!(t.truncate_head_chars + t.truncate_tail_chars < t.max_result_chars);
}

#[test]
fn full_llm_section_parses() {
    let toml_str = r#"
[[llm.providers]]
id = "anthropic"
kind = "anthropic"
default_model = "claude-sonnet-4-5"
auth = { env = "ANTHROPIC_API_KEY" }

[llm.roles.executor]
model = "anthropic/claude-sonnet-4-5"

[llm.roles.summarizer]
model = "anthropic/claude-haiku-4-5"

[llm.pricing."claude-sonnet-4-5"]
input_per_1m = 3.0
output_per_1m = 15.0
cache_read_per_1m = 0.3
cache_write_per_1m = 3.75
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.llm.providers.len(), 1);
    assert_eq!(config.llm.providers[0].kind, ProviderKind::Anthropic);
    assert_eq!(
        config.llm.providers[0].auth.env.as_deref(),
        Some("ANTHROPIC_API_KEY")
    );
    assert_eq!(config.llm.roles.len(), 2);
    assert!(config.validate().iter().all(|e| e.field != "llm.roles.executor.model"));
}

#[test]
fn system_prompt_file_overrides_nothing_by_default() {
    let config = Config::default();
    assert!(config.sessions.system_prompt_file.is_none());
    assert!(!config.sessions.system_prompt.is_empty());
}
