use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use pkgmgr_core::{InstallLocation, PermissionFlags, UserId};
use pkgmgr_installer::{
    BootReport, InstallResult, LifecycleEvent, MoveResult, SessionState, UninstallResult,
};
use pkgmgr_registry::RegistryEntry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    output_style_for(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub(crate) fn output_style_for(is_terminal: bool, no_color: bool) -> OutputStyle {
    if is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// Spinner that follows an install session through its states.
pub(crate) struct SessionProgress {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{line}");
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_session(self, label: &str) -> SessionProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan.bold} {prefix:<10} {msg} {elapsed}") {
                progress_bar.set_style(style.tick_chars(".oO@* "));
            }
            progress_bar.set_prefix(label.to_string());
            progress_bar.set_message(session_state_label(SessionState::Staging));
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        SessionProgress {
            style: self.style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl SessionProgress {
    pub(crate) fn set_state(&self, state: SessionState) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_message(session_state_label(state));
        }
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if self.style == OutputStyle::Rich {
            println!(
                "{} finished in {}",
                colorize(label_style(), &self.label),
                format_elapsed(self.started_at.elapsed())
            );
        }
    }
}

pub(crate) fn session_state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Staging => "staging",
        SessionState::Verifying => "waiting for verifiers",
        SessionState::Copying => "copying",
        SessionState::Scanning => "scanning",
        SessionState::Committing => "committing",
        SessionState::Done => "done",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub(crate) fn format_install_result(result: &InstallResult) -> (&'static str, String) {
    if result.is_success() {
        let name = result.name.as_deref().unwrap_or("package");
        let app_id = result
            .app_id
            .map(|app_id| format!(" app_id={app_id}"))
            .unwrap_or_default();
        let replaced = result
            .removed
            .as_ref()
            .map(|removed| format!(" replaced_version={}", removed.previous_version))
            .unwrap_or_default();
        return ("ok", format!("{}: {name}{app_id}{replaced}", result.outcome.as_str()));
    }
    (
        "err",
        format!("{} code={} {}", result.outcome.as_str(), result.outcome.code(), result.message),
    )
}

pub(crate) fn format_uninstall_result(name: &str, result: &UninstallResult) -> (&'static str, String) {
    if result.outcome.is_success() {
        let data = match &result.removed {
            Some(removed) if removed.data_removed => " data=removed",
            Some(_) => " data=kept",
            None => "",
        };
        return ("ok", format!("{}: {name}{data}", result.outcome.as_str()));
    }
    (
        "err",
        format!("{} code={} {}", result.outcome.as_str(), result.outcome.code(), result.message),
    )
}

pub(crate) fn format_move_result(
    name: &str,
    location: &InstallLocation,
    result: &MoveResult,
) -> (&'static str, String) {
    if result.outcome.is_success() {
        return (
            "ok",
            format!("{}: {name} -> {}", result.outcome.as_str(), format_location(location)),
        );
    }
    (
        "err",
        format!("{} code={} {}", result.outcome.as_str(), result.outcome.code(), result.message),
    )
}

pub(crate) fn format_location(location: &InstallLocation) -> String {
    match location {
        InstallLocation::Internal => "internal".to_string(),
        InstallLocation::External => "external".to_string(),
        InstallLocation::Volume(uuid) => format!("volume:{uuid}"),
    }
}

pub(crate) fn format_boot_report_lines(report: &BootReport) -> Vec<String> {
    let mut lines = vec![format!(
        "factory={} shadowed={} data={} recovered={} vanished={} incomplete={} abandoned={} cleanups={} failures={}",
        report.factory_committed.len(),
        report.shadowed.len(),
        report.data_committed.len(),
        report.recovered.len(),
        report.vanished.len(),
        report.incomplete_removed.len(),
        report.abandoned_installs.len(),
        report.cleanups_retried,
        report.failures.len()
    )];
    for (label, names) in [
        ("shadowed", &report.shadowed),
        ("recovered", &report.recovered),
        ("vanished", &report.vanished),
        ("incomplete", &report.incomplete_removed),
    ] {
        for name in names {
            lines.push(format!("{label}: {name}"));
        }
    }
    for failure in &report.failures {
        lines.push(format!("failed: {} ({})", failure.path.display(), failure.message));
    }
    lines
}

pub(crate) fn format_package_list(entries: &[RegistryEntry]) -> Vec<String> {
    let mut sorted = entries.iter().collect::<Vec<_>>();
    sorted.sort_by(|left, right| left.name.cmp(&right.name));
    sorted
        .into_iter()
        .map(|entry| {
            let mut kinds = Vec::new();
            if entry.flags.system {
                kinds.push("system");
            }
            if entry.flags.updated_system {
                kinds.push("updated-system");
            }
            if entry.flags.external {
                kinds.push("external");
            }
            let kinds = if kinds.is_empty() {
                String::new()
            } else {
                format!(" [{}]", kinds.join(","))
            };
            format!(
                "{} version={} app_id={}{kinds}",
                entry.name, entry.version_code, entry.app_id
            )
        })
        .collect()
}

pub(crate) fn format_list_summary(count: usize, user: UserId) -> String {
    match count {
        1 => format!("1 package installed for user {user}"),
        count => format!("{} packages installed for user {user}", HumanCount(count as u64)),
    }
}

pub(crate) fn format_info_lines(
    entry: &RegistryEntry,
    user: UserId,
    granted: &BTreeSet<String>,
    flags_of: impl Fn(&str) -> PermissionFlags,
) -> Vec<String> {
    let mut lines = vec![
        format!("Package: {}", entry.name),
        format!(
            "Version: {}{}",
            entry.version_code,
            entry
                .version_name
                .as_deref()
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        ),
        format!("App id: {}", entry.app_id),
        format!("Code: {}", entry.code_path.display()),
        format!("Volume: {}", entry.volume_uuid.as_deref().unwrap_or("internal")),
        format!("Target SDK: {}", entry.target_sdk),
        format!("Installer: {}", entry.installer.as_deref().unwrap_or("-")),
        format!(
            "Users: {}",
            entry
                .installed_users()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        ),
    ];
    if let Some(shared) = &entry.shared_user {
        lines.push(format!("Shared user: {shared}"));
    }
    if let Some(abi) = &entry.primary_abi {
        lines.push(format!("Primary ABI: {abi}"));
    }
    if !entry.children.is_empty() {
        lines.push(format!("Sub-packages: {}", entry.children.join(",")));
    }
    if !entry.requested_permissions.is_empty() {
        lines.push(format!("Permissions (user {user}):"));
        for permission in &entry.requested_permissions {
            let state = if granted.contains(permission) {
                "granted"
            } else {
                "denied"
            };
            let flags = flags_of(permission).describe();
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(","))
            };
            lines.push(format!("- {permission}: {state}{flags}"));
        }
    }
    lines
}

pub(crate) fn format_event(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::PackageAdded {
            name,
            user,
            app_id,
            replacing,
        } => format!("added {name} user={user} app_id={app_id} replacing={replacing}"),
        LifecycleEvent::PackageReplaced { name, user, app_id } => {
            format!("replaced {name} user={user} app_id={app_id}")
        }
        LifecycleEvent::FirstLaunch {
            name,
            user,
            installer,
        } => format!(
            "first-launch {name} user={user} installer={}",
            installer.as_deref().unwrap_or("-")
        ),
        LifecycleEvent::PackageRemoved {
            name,
            user,
            app_id,
            data_removed,
            replacing,
        } => format!(
            "removed {name} user={user} app_id={app_id} data_removed={data_removed} replacing={replacing}"
        ),
        LifecycleEvent::PackageFullyRemoved { name, app_id } => {
            format!("fully-removed {name} app_id={app_id}")
        }
        LifecycleEvent::PackageDataCleared { name, user } => {
            format!("data-cleared {name} user={user}")
        }
        LifecycleEvent::PackageMoved { name, volume_uuid } => format!(
            "moved {name} volume={}",
            volume_uuid.as_deref().unwrap_or("internal")
        ),
        LifecycleEvent::PermissionsChanged { name, app_id } => {
            format!("permissions-changed {name} app_id={app_id}")
        }
    }
}
