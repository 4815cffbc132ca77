use clap::Parser;

use super::*;

#[test]
fn test_parse_send() {
    let cmd = Command::try_parse_from([
        "personal-agent",
        "send",
        "--project",
        "Work",
        "--voice",
        "hello there",
    ])
    .unwrap();

    let Some(Commands::Send(args)) = cmd.subcommand() else {
        panic!("expected send, got {:?}", cmd.subcommand());
    };
    assert_eq!(args.project.as_deref(), Some("Work"));
    assert_eq!(args.chat, None);
    assert!(args.voice);
    assert!(!args.stream);
    assert_eq!(args.text, "hello there");
}

#[test]
fn test_send_chat_conflicts_with_project() {
    let res = Command::try_parse_from([
        "personal-agent",
        "send",
        "--chat",
        "3",
        "--project",
        "Work",
        "hi",
    ]);
    assert!(res.is_err());
}

#[test]
fn test_parse_project_context() {
    let cmd = Command::try_parse_from([
        "personal-agent",
        "--config",
        "./testdata/config.toml",
        "project",
        "context",
        "Work",
        "--clear",
    ])
    .unwrap();

    assert!(matches!(
        cmd.subcommand(),
        Some(Commands::Project(ProjectCommand::Context { name, text: None, clear: true })) if name == "Work"
    ));
    let config = cmd.get_config().unwrap();
    assert_eq!(config.backend.connection.model(), "llama-2-7b-chat");
}

#[test]
fn test_version_without_command() {
    let cmd = Command::try_parse_from(["personal-agent", "--version"]).unwrap();
    assert!(cmd.version());
    assert!(cmd.subcommand().is_none());
}

#[test]
fn test_cli_definition() {
    <Command as clap::CommandFactory>::command().debug_assert();
}
