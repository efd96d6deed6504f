//! Helper installation as a system service: systemd (Linux) or launchd (macOS).
//!
//! Privileged steps run through the platform's own authentication prompt
//! (`pkexec` on Linux, `osascript ... with administrator privileges` on
//! macOS). Scripts are constant strings; every path is passed as a
//! positional argument, never interpolated. Child processes are killed if
//! the install future is dropped, so cancelling an install stops the prompt.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::helper::{HelperError, HelperInstaller, HelperProbe, HelperServiceStatus};
use crate::process::signature::{sha256_file, system_owned};

/// systemd unit name of the helper.
pub const SYSTEMD_UNIT: &str = "forcequit-helper.service";

/// Path of the installed systemd unit.
const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/forcequit-helper.service";

/// launchd label of the helper.
pub const LAUNCHD_LABEL: &str = "com.forcequit.helper";

/// Path of the installed launchd plist.
const LAUNCHD_PLIST_PATH: &str = "/Library/LaunchDaemons/com.forcequit.helper.plist";

/// pkexec exit code when the authentication dialog was dismissed.
const PKEXEC_DISMISSED: i32 = 126;

/// osascript error number for "User canceled".
const OSASCRIPT_CANCELED: &str = "-128";

/// Linux install script. `$1` source, `$2` dest, `$3` staged config,
/// `$4` config path, `$5` staged unit, `$6` unit path.
const LINUX_INSTALL_SCRIPT: &str = r#"set -e
install -m 0755 -o root -g root "$1" "$2"
install -D -m 0644 -o root -g root "$3" "$4"
install -m 0644 -o root -g root "$5" "$6"
systemctl daemon-reload
systemctl enable forcequit-helper.service
systemctl restart forcequit-helper.service"#;

/// Linux uninstall script. `$1` binary, `$2` config, `$3` unit path.
const LINUX_UNINSTALL_SCRIPT: &str = r#"systemctl disable --now forcequit-helper.service || true
rm -f "$1" "$2" "$3"
systemctl daemon-reload"#;

/// macOS install. argv: source, dest, staged config, config path, staged plist, plist path.
const MACOS_INSTALL_SCRIPT: &str = r#"on run argv
do shell script "/bin/mkdir -p /Library/PrivilegedHelperTools " & quoted form of (do shell script "/usr/bin/dirname " & quoted form of item 4 of argv) & " && /usr/bin/install -m 0755 -o root -g wheel " & quoted form of item 1 of argv & " " & quoted form of item 2 of argv & " && /usr/bin/install -m 0644 -o root -g wheel " & quoted form of item 3 of argv & " " & quoted form of item 4 of argv & " && /usr/bin/install -m 0644 -o root -g wheel " & quoted form of item 5 of argv & " " & quoted form of item 6 of argv & " && (/bin/launchctl bootout system/com.forcequit.helper || true) && /bin/launchctl bootstrap system " & quoted form of item 6 of argv with administrator privileges
end run"#;

/// macOS uninstall. argv: binary, config, plist.
const MACOS_UNINSTALL_SCRIPT: &str = r#"on run argv
do shell script "(/bin/launchctl bootout system/com.forcequit.helper || true) && /bin/rm -f " & quoted form of item 1 of argv & " " & quoted form of item 2 of argv & " " & quoted form of item 3 of argv with administrator privileges
end run"#;

/// Seed written to the helper's config file at install time.
///
/// Only the keys the caller knows are written; the helper fills in its own
/// defaults for the rest.
#[derive(Debug, Clone, Serialize)]
pub struct HelperConfigSeed {
    /// `[server]` section.
    pub server: SeedServer,
    /// `[clients]` section.
    pub clients: SeedClients,
}

/// `[server]` keys written by the installer.
#[derive(Debug, Clone, Serialize)]
pub struct SeedServer {
    /// Socket path the helper listens on.
    pub socket_path: PathBuf,
}

/// `[clients]` keys written by the installer.
#[derive(Debug, Clone, Serialize)]
pub struct SeedClients {
    /// Code identifiers allowed to connect.
    pub allowed: Vec<String>,
}

/// Installer settings.
#[derive(Debug, Clone)]
pub struct ServiceInstallerConfig {
    /// Helper binary shipped alongside the caller.
    pub source_binary: PathBuf,
    /// Where the helper binary is installed.
    pub install_path: PathBuf,
    /// Where the helper config is written.
    pub config_path: PathBuf,
    /// Socket path written into the helper config.
    pub socket_path: PathBuf,
    /// Code identifier of the caller binary, recorded as the allowed client.
    pub client_identifier: String,
}

/// Installs the helper as a system service.
#[derive(Debug, Clone)]
pub struct ServiceInstaller {
    config: ServiceInstallerConfig,
}

impl ServiceInstaller {
    /// Create an installer.
    pub fn new(config: ServiceInstallerConfig) -> Self {
        Self { config }
    }

    /// Render the helper config seed as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_helper_config(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(&HelperConfigSeed {
            server: SeedServer {
                socket_path: self.config.socket_path.clone(),
            },
            clients: SeedClients {
                allowed: vec![self.config.client_identifier.clone()],
            },
        })
    }

    fn stage(&self, name: &str, contents: &str) -> Result<StagedFile, HelperError> {
        let path = std::env::temp_dir().join(format!(
            "forcequit-{}-{name}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, contents).map_err(|source| HelperError::Io {
            context: format!("failed to stage {}", path.display()),
            source,
        })?;
        Ok(StagedFile(path))
    }
}

/// Temporary staging file removed on drop.
struct StagedFile(PathBuf);

impl StagedFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "failed to remove staged file");
        }
    }
}

#[async_trait]
impl HelperInstaller for ServiceInstaller {
    async fn install(&self) -> Result<(), HelperError> {
        let cfg = &self.config;
        if !cfg.source_binary.is_file() {
            return Err(HelperError::SourceMissing(cfg.source_binary.clone()));
        }

        let helper_toml = self
            .render_helper_config()
            .map_err(|e| HelperError::Io {
                context: "failed to render helper config".to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
        let staged_config = self.stage("helper.toml", &helper_toml)?;

        info!(
            source = %cfg.source_binary.display(),
            dest = %cfg.install_path.display(),
            "installing privileged helper"
        );

        if cfg!(target_os = "macos") {
            let plist = launchd_plist(&cfg.install_path, &cfg.config_path);
            let staged_plist = self.stage("helper.plist", &plist)?;
            let mut cmd = Command::new("osascript");
            cmd.args(["-e", MACOS_INSTALL_SCRIPT])
                .arg(&cfg.source_binary)
                .arg(&cfg.install_path)
                .arg(staged_config.path())
                .arg(&cfg.config_path)
                .arg(staged_plist.path())
                .arg(LAUNCHD_PLIST_PATH);
            run_elevated(cmd, "osascript").await
        } else if cfg!(target_os = "linux") {
            let unit = systemd_unit(&cfg.install_path, &cfg.config_path);
            let staged_unit = self.stage("helper.service", &unit)?;
            let mut cmd = Command::new("pkexec");
            cmd.args(["/bin/sh", "-c", LINUX_INSTALL_SCRIPT, "forcequit-install"])
                .arg(&cfg.source_binary)
                .arg(&cfg.install_path)
                .arg(staged_config.path())
                .arg(&cfg.config_path)
                .arg(staged_unit.path())
                .arg(SYSTEMD_UNIT_PATH);
            run_elevated(cmd, "pkexec").await
        } else {
            Err(HelperError::Unsupported)
        }
    }

    async fn uninstall(&self) -> Result<(), HelperError> {
        let cfg = &self.config;
        info!(path = %cfg.install_path.display(), "uninstalling privileged helper");

        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("osascript");
            cmd.args(["-e", MACOS_UNINSTALL_SCRIPT])
                .arg(&cfg.install_path)
                .arg(&cfg.config_path)
                .arg(LAUNCHD_PLIST_PATH);
            run_elevated(cmd, "osascript").await
        } else if cfg!(target_os = "linux") {
            let mut cmd = Command::new("pkexec");
            cmd.args(["/bin/sh", "-c", LINUX_UNINSTALL_SCRIPT, "forcequit-uninstall"])
                .arg(&cfg.install_path)
                .arg(&cfg.config_path)
                .arg(SYSTEMD_UNIT_PATH);
            run_elevated(cmd, "pkexec").await
        } else {
            Err(HelperError::Unsupported)
        }
    }

    async fn probe(&self) -> HelperProbe {
        let installed = self.config.install_path.clone();
        let source = self.config.source_binary.clone();
        let probe = tokio::task::spawn_blocking(move || probe_installed(&installed, &source)).await;
        match probe {
            Ok(probe) => probe,
            Err(e) => {
                warn!(error = %e, "helper probe task panicked");
                HelperProbe::new(HelperServiceStatus::Compromised, "probe failed")
            }
        }
    }
}

/// Derive helper status from the installed binary.
///
/// Missing binary is `NotInstalled`; a binary that is not root-owned or is
/// group/world-writable is `Compromised`; a digest that differs from the
/// shipped helper is `Outdated`.
pub fn probe_installed(installed: &Path, source: &Path) -> HelperProbe {
    if !installed.exists() {
        return HelperProbe::new(HelperServiceStatus::NotInstalled, "helper binary not present");
    }
    if !system_owned(installed) {
        return HelperProbe::new(
            HelperServiceStatus::Compromised,
            format!("{} is not root-owned or is writable by others", installed.display()),
        );
    }
    let installed_digest = match sha256_file(installed) {
        Ok(d) => d,
        Err(e) => {
            return HelperProbe::new(HelperServiceStatus::Compromised, e.to_string());
        }
    };
    match sha256_file(source) {
        Ok(source_digest) if source_digest != installed_digest => HelperProbe::new(
            HelperServiceStatus::Outdated,
            "installed helper differs from the shipped build",
        ),
        Ok(_) => HelperProbe::new(HelperServiceStatus::Installed, "helper matches shipped build"),
        // Nothing to compare against; ownership checks passed.
        Err(_) => HelperProbe::new(HelperServiceStatus::Installed, "shipped helper unavailable"),
    }
}

async fn run_elevated(mut cmd: Command, program: &'static str) -> Result<(), HelperError> {
    cmd.kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped());

    let output = cmd.output().await.map_err(|source| HelperError::Io {
        context: format!("failed to run {program}"),
        source,
    })?;

    if output.status.success() {
        info!(program, "privileged step completed");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    let code = output.status.code();
    let declined = match program {
        "pkexec" => code == Some(PKEXEC_DISMISSED),
        "osascript" => stderr.contains(OSASCRIPT_CANCELED),
        _ => false,
    };
    if declined {
        return Err(HelperError::ElevationDeclined);
    }
    Err(HelperError::CommandFailed {
        command: program,
        code,
        stderr,
    })
}

fn systemd_unit(binary: &Path, config: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=ForceQuit privileged helper\n\
         After=local-fs.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={} serve --config {}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        binary.display(),
        config.display()
    )
}

fn launchd_plist(binary: &Path, config: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{}</string>
        <string>serve</string>
        <string>--config</string>
        <string>{}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
        binary.display(),
        config.display()
    )
}
