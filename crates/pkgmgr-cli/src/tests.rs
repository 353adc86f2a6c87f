use super::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::error::ErrorKind;
use ed25519_dalek::{Signer, SigningKey};
use pkgmgr_core::{InstallLocation, InstallOutcome};
use pkgmgr_installer::{
    ArchiveSigner, InstallResult, LifecycleEvent, PackageManagerService, SignaturesFile,
    MANIFEST_FILE, SIGNATURES_FILE,
};

use crate::completion::{detect_shell_from_env, resolve_completion_shell, write_completions_script};
use crate::dispatch::{install_flags, parse_install_location, run_command};
use crate::render::{
    format_event, format_install_result, format_list_summary, format_package_list,
    output_style_for, render_status_line, OutputStyle, TerminalRenderer,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "pkgmgr-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}

fn write_archive(dir: &Path, name: &str, version: u64) -> PathBuf {
    let manifest = format!("name = \"{name}\"\nversion_code = {version}\n");
    fs::create_dir_all(dir).expect("must create archive dir");
    fs::write(dir.join(MANIFEST_FILE), &manifest).expect("must write manifest");

    let key = SigningKey::from_bytes(&[7; 32]);
    let payload = pkgmgr_security::archive_signing_payload(manifest.as_bytes(), None);
    let signatures = SignaturesFile {
        signers: vec![ArchiveSigner {
            public_key: hex::encode(key.verifying_key().to_bytes()),
            signature: hex::encode(key.sign(&payload).to_bytes()),
        }],
    };
    fs::write(
        dir.join(SIGNATURES_FILE),
        toml::to_string(&signatures).expect("must encode signers"),
    )
    .expect("must write signers");
    dir.to_path_buf()
}

#[test]
fn cli_parses_install_with_placement_flags() {
    let cli = Cli::try_parse_from([
        "pkgmgr",
        "--root",
        "/tmp/device",
        "install",
        "notes",
        "-r",
        "--volume",
        "vol1",
        "--grant-runtime",
        "--installer",
        "com.example.store",
        "--user",
        "10",
    ])
    .expect("command must parse");

    assert_eq!(cli.root.as_deref(), Some(Path::new("/tmp/device")));
    match cli.command {
        Commands::Install { archive, options } => {
            assert_eq!(archive, PathBuf::from("notes"));
            assert_eq!(options.user, UserTarget::User(10));
            assert_eq!(options.installer.as_deref(), Some("com.example.store"));
            let flags = install_flags(&options);
            assert!(flags.replace_existing);
            assert!(flags.grant_runtime_permissions);
            assert!(flags.from_shell);
            assert_eq!(flags.volume_uuid.as_deref(), Some("vol1"));
            assert!(!flags.allow_downgrade);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_install_defaults_to_all_users() {
    let cli = Cli::try_parse_from(["pkgmgr", "install", "notes"]).expect("command must parse");

    match cli.command {
        Commands::Install { options, .. } => assert_eq!(options.user, UserTarget::All),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_conflicting_install_locations() {
    let err = Cli::try_parse_from(["pkgmgr", "install", "notes", "--internal", "--external"])
        .expect_err("conflicting locations must fail");
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);

    let err = Cli::try_parse_from(["pkgmgr", "install", "notes", "--external", "--volume", "vol1"])
        .expect_err("volume with external must fail");
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
}

#[test]
fn cli_rejects_malformed_user_target() {
    let err = Cli::try_parse_from(["pkgmgr", "uninstall", "notes", "--user", "owner"])
        .expect_err("user must be numeric or all");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
}

#[test]
fn cli_parses_uninstall_for_one_user_keeping_data() {
    let cli = Cli::try_parse_from(["pkgmgr", "uninstall", "notes", "--user", "10", "-k"])
        .expect("command must parse");

    match cli.command {
        Commands::Uninstall {
            name,
            user,
            keep_data,
            dont_kill,
        } => {
            assert_eq!(name, "notes");
            assert_eq!(user, UserTarget::User(10));
            assert!(keep_data);
            assert!(!dont_kill);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_install_location_accepts_known_targets() {
    assert_eq!(
        parse_install_location("internal").expect("must parse"),
        InstallLocation::Internal
    );
    assert_eq!(
        parse_install_location("external").expect("must parse"),
        InstallLocation::External
    );
    assert_eq!(
        parse_install_location("volume:abcd-1234").expect("must parse"),
        InstallLocation::Volume("abcd-1234".to_string())
    );
    for invalid in ["volume:", "sdcard", ""] {
        let err = parse_install_location(invalid).expect_err("must reject location");
        assert!(err.to_string().contains("invalid location"), "{err}");
    }
}

#[test]
fn output_style_is_plain_off_terminal_or_with_no_color() {
    assert_eq!(output_style_for(true, false), OutputStyle::Rich);
    assert_eq!(output_style_for(false, false), OutputStyle::Plain);
    assert_eq!(output_style_for(true, true), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "INSTALL_SUCCEEDED: notes"),
        "INSTALL_SUCCEEDED: notes"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "INSTALL_SUCCEEDED: notes"),
        "[OK] INSTALL_SUCCEEDED: notes"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "DELETE_FAILED_OWNER_BLOCKED"),
        "[ERR] DELETE_FAILED_OWNER_BLOCKED"
    );
}

#[test]
fn format_install_result_reports_outcome_token_and_code() {
    let failed = InstallResult {
        token: 3,
        outcome: InstallOutcome::UpdateIncompatible,
        message: "signatures do not match".to_string(),
        name: Some("com.example.notes".to_string()),
        app_id: None,
        removed: None,
    };
    let (status, line) = format_install_result(&failed);
    assert_eq!(status, "err");
    assert_eq!(
        line,
        format!(
            "{} code={} signatures do not match",
            InstallOutcome::UpdateIncompatible.as_str(),
            InstallOutcome::UpdateIncompatible.code()
        )
    );

    let installed = InstallResult {
        outcome: InstallOutcome::Succeeded,
        message: String::new(),
        app_id: Some(10_000),
        ..failed
    };
    let (status, line) = format_install_result(&installed);
    assert_eq!(status, "ok");
    assert_eq!(line, "INSTALL_SUCCEEDED: com.example.notes app_id=10000");
}

#[test]
fn format_event_names_the_user_and_app_id() {
    let line = format_event(&LifecycleEvent::PackageRemoved {
        name: "com.example.notes".to_string(),
        user: 10,
        app_id: 10_001,
        data_removed: true,
        replacing: false,
    });
    assert_eq!(
        line,
        "removed com.example.notes user=10 app_id=10001 data_removed=true replacing=false"
    );
    assert_eq!(
        format_event(&LifecycleEvent::PackageMoved {
            name: "com.example.notes".to_string(),
            volume_uuid: None,
        }),
        "moved com.example.notes volume=internal"
    );
}

#[test]
fn format_list_summary_pluralizes() {
    assert_eq!(format_list_summary(1, 0), "1 package installed for user 0");
    assert_eq!(format_list_summary(1200, 10), "1,200 packages installed for user 10");
}

#[test]
fn completion_shell_resolution_prefers_explicit_then_env() {
    assert_eq!(
        resolve_completion_shell(Some(CliCompletionShell::Fish), Some("/bin/zsh"), false),
        CliCompletionShell::Fish
    );
    assert_eq!(
        resolve_completion_shell(None, Some("/usr/bin/zsh"), false),
        CliCompletionShell::Zsh
    );
    assert_eq!(
        resolve_completion_shell(None, Some("/bin/tcsh"), true),
        CliCompletionShell::Powershell
    );
    assert_eq!(resolve_completion_shell(None, None, false), CliCompletionShell::Bash);
    assert_eq!(detect_shell_from_env(Some("pwsh")), Some(CliCompletionShell::Powershell));
}

#[test]
fn completion_script_mentions_subcommands() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must write completion script");
    let script = String::from_utf8(output).expect("script must be utf-8");
    assert!(script.contains("pkgmgr"));
    assert!(script.contains("install-staged"));
    assert!(script.contains("clear-data"));
}

#[tokio::test]
async fn install_list_and_uninstall_drive_the_service() {
    let root = test_root();
    let archive = write_archive(&root.join("incoming").join("notes"), "com.example.notes", 1);
    let service = PackageManagerService::open_local(&root).expect("must open device");
    let renderer = TerminalRenderer::current();

    let install = Cli::try_parse_from(["pkgmgr", "install", &archive.display().to_string()])
        .expect("command must parse");
    run_command(&service, renderer, install.command)
        .await
        .expect("install must succeed");
    let entry = service.package("com.example.notes").expect("must register");
    assert!(entry.is_installed_for(SYSTEM_USER));
    assert_eq!(
        format_package_list(&service.installed_packages(SYSTEM_USER)),
        vec![format!("com.example.notes version=1 app_id={}", entry.app_id)]
    );

    let again = Cli::try_parse_from(["pkgmgr", "install", &archive.display().to_string()])
        .expect("command must parse");
    let err = run_command(&service, renderer, again.command)
        .await
        .expect_err("install without replace must fail");
    assert!(
        err.to_string().contains(InstallOutcome::AlreadyExists.as_str()),
        "{err}"
    );

    let uninstall = Cli::try_parse_from(["pkgmgr", "uninstall", "com.example.notes"])
        .expect("command must parse");
    run_command(&service, renderer, uninstall.command)
        .await
        .expect("uninstall must succeed");
    assert!(service.package("com.example.notes").is_none());

    let missing = Cli::try_parse_from(["pkgmgr", "move", "com.example.notes", "external"])
        .expect("command must parse");
    assert!(run_command(&service, renderer, missing.command)
        .await
        .is_err());

    let _ = fs::remove_dir_all(&root);
}
