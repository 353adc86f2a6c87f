use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pkgmgr_core::{InstallFlags, InstallLocation, Origin, UninstallFlags, UserTarget};
use pkgmgr_installer::{
    default_device_root, InstallHandle, InstallRequest, InstallResult, LifecycleEvent,
    PackageManagerService,
};
use tokio::sync::broadcast::Receiver;
use tracing::debug;

use crate::completion::{resolve_completion_shell, write_completions_script};
use crate::render::{
    format_boot_report_lines, format_event, format_info_lines, format_install_result,
    format_list_summary, format_move_result, format_package_list, format_uninstall_result,
    TerminalRenderer,
};
use crate::{Cli, Commands, InstallArgs};

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = cli.command {
        let shell_env = std::env::var("SHELL").ok();
        let shell = resolve_completion_shell(shell, shell_env.as_deref(), cfg!(windows));
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let root = match cli.root {
        Some(root) => root,
        None => default_device_root()?,
    };
    debug!(root = %root.display(), "opening device root");
    let service = PackageManagerService::open_local(&root)
        .with_context(|| format!("failed to open device root {}", root.display()))?;
    let mut events = service.subscribe();
    let renderer = TerminalRenderer::current();

    let result = run_command(&service, renderer, cli.command).await;
    service
        .flush()
        .with_context(|| format!("failed to write registry under {}", root.display()))?;
    if let Some(events) = events.as_mut() {
        print_events(renderer, events);
    }
    result
}

pub(crate) async fn run_command(
    service: &PackageManagerService,
    renderer: TerminalRenderer,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::BootScan => {
            let report = service.boot_scan().await?;
            renderer.print_status("ok", "boot scan finished");
            renderer.print_lines(&format_boot_report_lines(&report));
        }
        Commands::Install { archive, options } => {
            let archive = absolute_archive_path(&archive)?;
            let handle = service.install_from_origin(InstallRequest {
                origin: Origin::File(archive),
                flags: install_flags(&options),
                installer: options.installer.clone(),
                user: options.user,
                expected_name: None,
                expected_certificates: None,
            });
            let result = track_session(service, renderer, "install", handle).await;
            report_install(renderer, &result)?;
        }
        Commands::InstallStaged { name, dir, options } => {
            let dir = absolute_archive_path(&dir)?;
            let handle = service.install_from_staged(
                &name,
                dir,
                install_flags(&options),
                options.installer.clone(),
                options.user,
                None,
            );
            let result = track_session(service, renderer, "install", handle).await;
            report_install(renderer, &result)?;
        }
        Commands::Uninstall {
            name,
            user,
            keep_data,
            dont_kill,
        } => {
            let flags = UninstallFlags {
                keep_data,
                all_users: user == UserTarget::All,
                dont_kill_app: dont_kill,
                ..UninstallFlags::default()
            };
            let result = service.uninstall(&name, user, flags).await;
            let (status, line) = format_uninstall_result(&name, &result);
            renderer.print_status(status, &line);
            if !result.outcome.is_success() {
                return Err(anyhow!("uninstall of {name} failed ({})", result.outcome.as_str()));
            }
        }
        Commands::Move { name, location } => {
            let location = parse_install_location(&location)?;
            let result = service.move_package(&name, location.clone()).await;
            let (status, line) = format_move_result(&name, &location, &result);
            renderer.print_status(status, &line);
            if !result.outcome.is_success() {
                return Err(anyhow!("move of {name} failed ({})", result.outcome.as_str()));
            }
        }
        Commands::List { user } => {
            let entries = service.installed_packages(user);
            renderer.print_lines(&format_package_list(&entries));
            renderer.print_status("ok", &format_list_summary(entries.len(), user));
        }
        Commands::Info { name, user } => {
            let Some(entry) = service.package(&name) else {
                println!("No package found: {name}");
                return Ok(());
            };
            let granted = service.permission_state(&name, user).unwrap_or_default();
            let lines = format_info_lines(&entry, user, &granted, |permission| {
                service
                    .permission_flags(&name, permission, user)
                    .unwrap_or_default()
            });
            renderer.print_lines(&lines);
        }
        Commands::Grant {
            name,
            permission,
            user,
        } => {
            let changed = service.grant_runtime_permission(&name, &permission, user)?;
            let message = if changed {
                format!("granted {permission} to {name} for user {user}")
            } else {
                format!("{name} already holds {permission} for user {user}")
            };
            renderer.print_status("ok", &message);
        }
        Commands::Revoke {
            name,
            permission,
            user,
        } => {
            let changed = service.revoke_runtime_permission(&name, &permission, user)?;
            let message = if changed {
                format!("revoked {permission} from {name} for user {user}")
            } else {
                format!("{name} does not hold {permission} for user {user}")
            };
            renderer.print_status("ok", &message);
        }
        Commands::ClearData { name, user } => {
            if let Err(err) = service.clear_application_data(&name, user).await {
                renderer.print_status("err", &err.to_string());
                return Err(anyhow!("clearing data of {name} failed ({})", err.outcome.as_str()));
            }
            renderer.print_status("ok", &format!("cleared data of {name} for user {user}"));
        }
        Commands::CreateUser { id } => {
            if service.create_user(id).await? {
                renderer.print_status("ok", &format!("created user {id}"));
            } else {
                renderer.print_status("warn", &format!("user {id} already exists"));
            }
        }
        Commands::RemoveUser { id } => {
            if service.remove_user(id).await? {
                renderer.print_status("ok", &format!("removed user {id}"));
            } else {
                renderer.print_status("warn", &format!("user {id} cannot be removed"));
            }
        }
        Commands::Completion { .. } => {}
    }

    Ok(())
}

/// Waits for an install, feeding the session state into the spinner.
async fn track_session(
    service: &PackageManagerService,
    renderer: TerminalRenderer,
    label: &str,
    handle: InstallHandle,
) -> InstallResult {
    let progress = renderer.start_session(label);
    let token = handle.token();
    let wait = handle.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(SESSION_POLL_INTERVAL);
    debug!(token, label, "tracking install session");
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = ticker.tick() => {
                if let Some(state) = service.session_state(token) {
                    progress.set_state(state);
                }
            }
        }
    };
    progress.finish();
    result
}

fn report_install(renderer: TerminalRenderer, result: &InstallResult) -> Result<()> {
    let (status, line) = format_install_result(result);
    renderer.print_status(status, &line);
    if result.is_success() {
        return Ok(());
    }
    Err(anyhow!("install failed ({})", result.outcome.as_str()))
}

fn print_events(renderer: TerminalRenderer, events: &mut Receiver<LifecycleEvent>) {
    let mut lines = Vec::new();
    while let Ok(event) = events.try_recv() {
        lines.push(format_event(&event));
    }
    if lines.is_empty() {
        return;
    }
    renderer.print_section("events");
    renderer.print_lines(&lines);
}

/// Requests from the command line always count as shell installs.
pub(crate) fn install_flags(options: &InstallArgs) -> InstallFlags {
    InstallFlags {
        replace_existing: options.replace,
        allow_test: options.test,
        allow_downgrade: options.downgrade,
        internal: options.internal,
        external: options.external,
        volume_uuid: options.volume.clone(),
        forward_locked: options.forward_locked,
        from_shell: true,
        grant_runtime_permissions: options.grant_runtime,
        dont_kill_app: options.dont_kill,
        ..InstallFlags::default()
    }
}

pub(crate) fn parse_install_location(value: &str) -> Result<InstallLocation> {
    match value.trim() {
        "internal" => Ok(InstallLocation::Internal),
        "external" => Ok(InstallLocation::External),
        other => match other.strip_prefix("volume:") {
            Some(uuid) if !uuid.trim().is_empty() => {
                Ok(InstallLocation::Volume(uuid.trim().to_string()))
            }
            _ => Err(anyhow!(
                "invalid location '{value}': expected internal, external or volume:<uuid>"
            )),
        },
    }
}

fn absolute_archive_path(path: &Path) -> Result<std::path::PathBuf> {
    path.canonicalize()
        .with_context(|| format!("failed to resolve archive path {}", path.display()))
}
