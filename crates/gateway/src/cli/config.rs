use sb_domain::config::{Config, ConfigSeverity};

/// Counts of validation issues by severity.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub errors: usize,
    pub warnings: usize,
}

pub fn summarize(config: &Config) -> (ValidationSummary, Vec<String>) {
    let issues = config.validate();
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    let summary = ValidationSummary {
        errors,
        warnings: issues.len() - errors,
    };
    (summary, issues.iter().map(ToString::to_string).collect())
}

/// Print validation issues.  Returns `false` when any error was found.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let (summary, lines) = summarize(config);
    if lines.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }
    for line in &lines {
        println!("{line}");
    }
    println!(
        "\n{} error(s), {} warning(s) in {config_path}",
        summary.errors, summary.warnings
    );
    summary.errors == 0
}

/// Dump the resolved config, defaults filled in, as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("serializing config: {e}"))?;
    print!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_only_warn_about_providers() {
        let (summary, lines) = summarize(&Config::default());
        assert_eq!(summary.errors, 0);
        assert!(lines.iter().any(|l| l.contains("llm.providers")));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = Config::default();
        config.server.port = 0;
        let (summary, _) = summarize(&config);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn shown_config_parses_back() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.compaction.token_ceiling, 150_000);
    }
}
