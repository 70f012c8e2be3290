//! Service supervisor registration
//!
//! Installs the rotator as a per-user service so it starts at login and is
//! restarted on crash:
//! - Linux: systemd user unit, driven with `systemctl --user`
//! - macOS: launchd agent, driven with `launchctl`
//!
//! Unit rendering and command plans are pure so they can be tested without a
//! service manager; [`ServiceManager`] only executes them.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{EXIT_ALREADY_RUNNING, EXIT_AUTH, EXIT_CONFIG, Error};

pub const SYSTEMD_UNIT: &str = "pgtoken-rotator.service";
pub const LAUNCHD_LABEL: &str = "io.pgtoken.rotator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Systemd,
    Launchd,
}

impl Platform {
    pub fn current() -> Result<Self, Error> {
        if cfg!(target_os = "macos") {
            Ok(Platform::Launchd)
        } else if cfg!(target_os = "linux") {
            Ok(Platform::Systemd)
        } else {
            Err(Error::ServiceManager(format!(
                "no supported service manager on {}",
                std::env::consts::OS
            )))
        }
    }
}

/// Supervisor's view of the process, distinct from the engine's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub installed: bool,
    pub running: bool,
    pub detail: String,
}

/// Where the unit or agent definition lives under `home`.
pub fn definition_path(platform: Platform, home: &Path) -> PathBuf {
    match platform {
        Platform::Systemd => home.join(".config/systemd/user").join(SYSTEMD_UNIT),
        Platform::Launchd => home
            .join("Library/LaunchAgents")
            .join(format!("{LAUNCHD_LABEL}.plist")),
    }
}

/// Quote a path for a systemd `ExecStart=` line.
fn systemd_quote(path: &Path) -> String {
    let s = path.display().to_string();
    if s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Exit codes after which a supervisor must not restart `run`: rejected
/// credentials, bad config, another instance already running.
const NO_RESTART_EXIT_CODES: [i32; 3] = [EXIT_AUTH, EXIT_CONFIG, EXIT_ALREADY_RUNNING];

/// Minimum seconds between launchd relaunches.
const LAUNCHD_THROTTLE_SECS: u32 = 30;

pub fn render_systemd_unit(exe: &Path, config: &Path) -> String {
    let no_restart = NO_RESTART_EXIT_CODES
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "[Unit]\n\
         Description=Rotating PostgreSQL OAuth credential\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={} --config {} run\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         RestartPreventExitStatus={}\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        systemd_quote(exe),
        systemd_quote(config),
        no_restart
    )
}

pub fn render_launchd_plist(exe: &Path, config: &Path, log_dir: &Path) -> String {
    let exe = xml_escape(&exe.display().to_string());
    let config = xml_escape(&config.display().to_string());
    let log = xml_escape(&log_dir.join("pgtoken-rotator.log").display().to_string());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>--config</string>
        <string>{config}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <dict>
        <key>Crashed</key>
        <true/>
    </dict>
    <key>ThrottleInterval</key>
    <integer>{LAUNCHD_THROTTLE_SECS}</integer>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#
    )
}

/// One external command: program plus arguments.
pub type CommandPlan = Vec<String>;

fn plan(args: &[&str]) -> CommandPlan {
    args.iter().map(|s| s.to_string()).collect()
}

pub fn install_commands(platform: Platform, definition: &Path) -> Vec<CommandPlan> {
    match platform {
        Platform::Systemd => vec![
            plan(&["systemctl", "--user", "daemon-reload"]),
            plan(&["systemctl", "--user", "enable", "--now", SYSTEMD_UNIT]),
        ],
        Platform::Launchd => vec![plan(&[
            "launchctl",
            "load",
            "-w",
            &definition.display().to_string(),
        ])],
    }
}

pub fn uninstall_commands(platform: Platform, definition: &Path) -> Vec<CommandPlan> {
    match platform {
        Platform::Systemd => vec![plan(&[
            "systemctl",
            "--user",
            "disable",
            "--now",
            SYSTEMD_UNIT,
        ])],
        Platform::Launchd => vec![plan(&[
            "launchctl",
            "unload",
            "-w",
            &definition.display().to_string(),
        ])],
    }
}

pub fn restart_command(platform: Platform, uid: Option<u32>) -> CommandPlan {
    match platform {
        Platform::Systemd => plan(&["systemctl", "--user", "restart", SYSTEMD_UNIT]),
        Platform::Launchd => {
            let target = match uid {
                Some(uid) => format!("gui/{uid}/{LAUNCHD_LABEL}"),
                None => LAUNCHD_LABEL.to_string(),
            };
            plan(&["launchctl", "kickstart", "-k", &target])
        }
    }
}

pub fn status_command(platform: Platform) -> CommandPlan {
    match platform {
        Platform::Systemd => plan(&["systemctl", "--user", "is-active", SYSTEMD_UNIT]),
        Platform::Launchd => plan(&["launchctl", "list", LAUNCHD_LABEL]),
    }
}

/// Interpret the output of [`status_command`].
pub fn parse_status(platform: Platform, success: bool, stdout: &str) -> (bool, String) {
    match platform {
        // `is-active` exits non-zero for anything but "active"
        Platform::Systemd => {
            let state = stdout.trim();
            let state = if state.is_empty() { "unknown" } else { state };
            (success && state == "active", state.to_string())
        }
        Platform::Launchd => {
            if !success {
                return (false, "not loaded".to_string());
            }
            let running = stdout
                .lines()
                .any(|l| l.trim_start().starts_with("\"PID\" ="));
            let detail = if running { "running" } else { "loaded, not running" };
            (running, detail.to_string())
        }
    }
}

/// Executes command plans against the host's service manager.
pub struct ServiceManager {
    platform: Platform,
    home: PathBuf,
}

impl ServiceManager {
    pub fn detect() -> Result<Self, Error> {
        let platform = Platform::current()?;
        let home = dirs::home_dir()
            .ok_or_else(|| Error::ServiceManager("cannot determine home directory".into()))?;
        Ok(Self { platform, home })
    }

    pub fn definition_path(&self) -> PathBuf {
        definition_path(self.platform, &self.home)
    }

    /// Write the unit/agent definition and start it.
    pub fn install(&self, exe: &Path, config: &Path) -> Result<PathBuf, Error> {
        let path = self.definition_path();
        let contents = match self.platform {
            Platform::Systemd => render_systemd_unit(exe, config),
            Platform::Launchd => {
                let log_dir = self.home.join("Library/Logs");
                render_launchd_plist(exe, config, &log_dir)
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }
        std::fs::write(&path, contents).map_err(|e| self.io_error(&path, e))?;
        info!(path = %path.display(), "service definition written");

        for command in install_commands(self.platform, &path) {
            run(&command)?;
        }
        Ok(path)
    }

    /// Stop the service and delete its definition. A missing definition is
    /// not an error.
    pub fn uninstall(&self) -> Result<(), Error> {
        let path = self.definition_path();
        if !path.exists() {
            info!(path = %path.display(), "service not installed");
            return Ok(());
        }
        for command in uninstall_commands(self.platform, &path) {
            run(&command)?;
        }
        std::fs::remove_file(&path).map_err(|e| self.io_error(&path, e))?;
        if self.platform == Platform::Systemd {
            run(&plan(&["systemctl", "--user", "daemon-reload"]))?;
        }
        info!(path = %path.display(), "service removed");
        Ok(())
    }

    pub fn restart(&self) -> Result<(), Error> {
        run(&restart_command(self.platform, self.uid()))
    }

    pub fn status(&self) -> Result<ServiceStatus, Error> {
        let installed = self.definition_path().exists();
        if !installed {
            return Ok(ServiceStatus {
                installed,
                running: false,
                detail: "not installed".into(),
            });
        }
        let command = status_command(self.platform);
        let output = Command::new(&command[0])
            .args(&command[1..])
            .output()
            .map_err(|e| Error::ServiceManager(format!("cannot run {}: {e}", command[0])))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let (running, detail) = parse_status(self.platform, output.status.success(), &stdout);
        Ok(ServiceStatus {
            installed,
            running,
            detail,
        })
    }

    /// Owner of the home directory, used as the launchd GUI domain.
    #[cfg(unix)]
    fn uid(&self) -> Option<u32> {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(&self.home).ok().map(|m| m.uid())
    }

    #[cfg(not(unix))]
    fn uid(&self) -> Option<u32> {
        None
    }

    fn io_error(&self, path: &Path, e: std::io::Error) -> Error {
        Error::ServiceManager(format!("{}: {e}", path.display()))
    }
}

fn run(command: &CommandPlan) -> Result<(), Error> {
    debug!(command = command.join(" "), "running service manager command");
    let output = Command::new(&command[0])
        .args(&command[1..])
        .output()
        .map_err(|e| Error::ServiceManager(format!("cannot run {}: {e}", command[0])))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::ServiceManager(format!(
            "`{}` exited with {}: {}",
            command.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
