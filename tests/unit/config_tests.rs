use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use acp_bridge::acp::codec::MAX_LINE_BYTES;
use acp_bridge::acp::transport::TransportOptions;
use acp_bridge::{AppError, BridgeConfig};

fn full_toml(workspace: &str) -> String {
    format!(
        r#"
transport = "stdio"
command = "claude-code-acp"
args = ["--verbose"]
working_directory = '{workspace}'
auth_method = "api-key"
max_line_bytes = 65536

[env]
ANTHROPIC_LOG = "debug"

[[mcp_servers]]
name = "tools"
url = "http://127.0.0.1:8080/mcp"

[mcp_servers.headers]
X-Session = "abc"

[transport_queue]
capacity = 256

[sessions]
idle_ttl_seconds = 900
"#
    )
}

#[test]
fn full_config_parses() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = temp.path().to_string_lossy().to_string();

    let config = BridgeConfig::from_toml_str(&full_toml(&workspace)).expect("valid config");

    assert_eq!(config.command, "claude-code-acp");
    assert_eq!(config.args, vec!["--verbose".to_owned()]);
    assert_eq!(config.working_directory, Some(PathBuf::from(&workspace)));
    assert_eq!(config.env.get("ANTHROPIC_LOG").map(String::as_str), Some("debug"));
    assert_eq!(config.auth_method.as_deref(), Some("api-key"));
    assert_eq!(config.mcp_servers.len(), 1);
    assert_eq!(config.mcp_servers[0].name, "tools");
    assert_eq!(
        config.mcp_servers[0].headers.get("X-Session").map(String::as_str),
        Some("abc")
    );
    assert_eq!(config.max_line_bytes, 65536);
    assert_eq!(config.transport_queue.capacity, Some(256));
    assert_eq!(config.sessions.idle_ttl(), Some(Duration::from_secs(900)));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = BridgeConfig::from_toml_str("command = \"agent\"").expect("valid config");

    assert_eq!(config.transport, "stdio");
    assert!(config.args.is_empty());
    assert!(config.working_directory.is_none());
    assert!(config.auth_method.is_none());
    assert!(config.mcp_servers.is_empty());
    assert_eq!(config.max_line_bytes, MAX_LINE_BYTES);
    assert_eq!(config.transport_queue.capacity, None);
    assert_eq!(config.sessions.idle_ttl(), None);
}

#[test]
fn missing_command_is_rejected() {
    let err = BridgeConfig::from_toml_str("args = []").expect_err("command is required");

    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn blank_command_is_rejected() {
    let err = BridgeConfig::from_toml_str("command = \"   \"").expect_err("blank command");

    assert!(matches!(err, AppError::Config(msg) if msg.contains("command")));
}

#[test]
fn non_stdio_transport_is_rejected() {
    let err = BridgeConfig::from_toml_str("transport = \"http\"\ncommand = \"agent\"")
        .expect_err("only stdio");

    assert!(matches!(err, AppError::Config(msg) if msg.contains("stdio")));
}

#[test]
fn zero_queue_capacity_is_rejected() {
    let raw = "command = \"agent\"\n[transport_queue]\ncapacity = 0\n";

    assert!(matches!(BridgeConfig::from_toml_str(raw), Err(AppError::Config(_))));
}

#[test]
fn zero_line_limit_is_rejected() {
    let raw = "command = \"agent\"\nmax_line_bytes = 0\n";

    assert!(matches!(BridgeConfig::from_toml_str(raw), Err(AppError::Config(_))));
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "command = \"agent\"").expect("write");

    let config = BridgeConfig::load_from_path(file.path()).expect("load");

    assert_eq!(config.command, "agent");
}

#[test]
fn load_from_missing_path_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");

    let err = BridgeConfig::load_from_path(temp.path().join("missing.toml")).expect_err("missing");

    assert!(matches!(err, AppError::Config(msg) if msg.contains("failed to read config")));
}

#[test]
fn working_directory_falls_back_to_current_dir() {
    let config = BridgeConfig::for_command("agent");

    let resolved = config.resolved_working_directory().expect("cwd");

    assert_eq!(resolved, std::env::current_dir().expect("cwd"));
}

#[test]
fn transport_options_follow_config() {
    let mut config = BridgeConfig::for_command("agent");
    config.transport_queue.capacity = Some(8);
    config.max_line_bytes = 1024;

    let options = TransportOptions::from_config(&config);

    assert_eq!(options.queue_capacity, Some(8));
    assert_eq!(options.max_line_bytes, 1024);
}
