use runner_domain::config::RunnerConfig;

#[test]
fn default_ralph_max_iterations_is_ten() {
    let config = RunnerConfig::default();
    assert_eq!(config.ralph.max_iterations, 10);
}

#[test]
fn explicit_max_iterations_parses_from_toml() {
    let toml_str = r#"
[ralph]
max_iterations = 25
promise_tag_open = "<done>"
promise_tag_close = "</done>"
"#;
    let config: RunnerConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.ralph.max_iterations, 25);
    assert_eq!(config.ralph.promise_tag_open, "<done>");
}

#[test]
fn default_config_validates_clean() {
    let config = RunnerConfig::default();
    assert!(!config.has_errors());
}
