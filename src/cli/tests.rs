#[cfg(test)]
mod tests {
    use crate::cli::Args;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    const NO_ENV: [(&str, &str); 0] = [];

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["deepresearch-rs"]).unwrap();

        assert!(args.query.is_none());
        assert!(args.run_id.is_none());
        assert!(args.output_path.is_none());
        assert!(!args.no_cache);
        assert!(!args.no_draft);
        assert!(!args.list_runs);
        assert!(!args.verbose);
        assert!(args.run_request().is_none());
    }

    #[test]
    fn test_args_query_and_options() {
        let args = Args::try_parse_from([
            "deepresearch-rs",
            "How do tides work?",
            "--run-id",
            "tides-1",
            "-o",
            "/tmp/report.md",
            "--recursion-limit",
            "4",
            "--max-concurrent-researchers",
            "2",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.query.as_deref(), Some("How do tides work?"));
        assert_eq!(args.output_path, Some(PathBuf::from("/tmp/report.md")));
        assert!(args.verbose);

        let request = args.run_request().unwrap();
        assert_eq!(request.query, "How do tides work?");
        assert_eq!(request.run_id, "tides-1");
        assert_eq!(request.recursion_limit, Some(4));
        assert_eq!(request.max_concurrent_researchers, Some(2));
    }

    #[test]
    fn test_run_request_generates_run_id() {
        let args = Args::try_parse_from(["deepresearch-rs", "question"]).unwrap();
        let first = args.run_request().unwrap();
        let second = args.run_request().unwrap();
        assert!(!first.run_id.is_empty());
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn test_blank_query_is_no_request() {
        let args = Args::try_parse_from(["deepresearch-rs", "   "]).unwrap();
        assert!(args.run_request().is_none());
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[research]
max_concurrent_researchers = 5
recursion_limit = 7
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::try_parse_from([
            "deepresearch-rs",
            "q",
            "--config",
            &path,
            "--max-concurrent-researchers",
            "1",
            "--writer-model",
            "anthropic:claude-opus-4",
            "--no-cache",
            "--no-draft",
        ])
        .unwrap();
        let config = args
            .into_config_with_env([("RECURSION_LIMIT", "3"), ("MAX_CONCURRENT_RESEARCHERS", "9")])
            .unwrap();

        assert_eq!(config.research.max_concurrent_researchers, 1);
        assert_eq!(config.research.recursion_limit, 3);
        assert_eq!(config.llm.writer_model, "anthropic:claude-opus-4");
        assert_eq!(config.llm.supervisor_model, "openai:gpt-5");
        assert!(!config.cache.enabled);
        assert!(!config.research.enable_draft);
    }

    #[test]
    fn test_model_flag_sets_every_role() {
        let args = Args::try_parse_from([
            "deepresearch-rs",
            "--model",
            "deepseek:deepseek-chat",
            "--compress-model",
            "openai:gpt-5-mini",
        ])
        .unwrap();
        let config = args.into_config_with_env(NO_ENV).unwrap();

        assert_eq!(config.llm.supervisor_model, "deepseek:deepseek-chat");
        assert_eq!(config.llm.summarization_model, "deepseek:deepseek-chat");
        assert_eq!(config.llm.compress_model, "openai:gpt-5-mini");
    }

    #[test]
    fn test_invalid_model_fails_at_startup() {
        let args = Args::try_parse_from(["deepresearch-rs", "--writer-model", "gpt-5"]).unwrap();
        assert!(args.into_config_with_env(NO_ENV).is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let args =
            Args::try_parse_from(["deepresearch-rs", "--config", "/nonexistent/deepresearch.toml"])
                .unwrap();
        assert!(args.into_config_with_env(NO_ENV).is_err());
    }
}
