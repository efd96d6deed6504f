//! Per-platform policy tables: deny-lists, protected roots, and naming hints.
//!
//! Tables are built once at startup. The only way to change them is through
//! the consuming `with_*` builders, which can add entries but never remove
//! built-ins; there is no `&mut` accessor.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Pid of the init / launch supervisor.
pub const INIT_PID: u32 = 1;

/// Pid of the Linux kernel thread daemon (`kthreadd`).
pub const KTHREADD_PID: u32 = 2;

const MACOS_CRITICAL_NAMES: &[&str] = &[
    "kernel_task",
    "launchd",
    "WindowServer",
    "loginwindow",
    "SystemUIServer",
    "Dock",
    "Finder",
    "cfprefsd",
    "distnoted",
    "coreaudiod",
    "bluetoothd",
    "airportd",
    "configd",
    "mDNSResponder",
    "syslogd",
    "UserEventAgent",
    "WiFiAgent",
    "networkd",
    "kextd",
    "securityd",
    "opendirectoryd",
    "logd",
    "notifyd",
    "powerd",
    "forcequit",
    "forcequit-helper",
];

const LINUX_CRITICAL_NAMES: &[&str] = &[
    "init",
    "systemd",
    "kthreadd",
    "systemd-journald",
    "systemd-logind",
    "systemd-udevd",
    "systemd-resolved",
    "dbus-daemon",
    "dbus-broker",
    "polkitd",
    "Xorg",
    "Xwayland",
    "gnome-shell",
    "kwin_wayland",
    "plasmashell",
    "gdm",
    "sddm",
    "sshd",
    "login",
    "agetty",
    "NetworkManager",
    "wpa_supplicant",
    "forcequit",
    "forcequit-helper",
];

const MACOS_PROTECTED_ROOTS: &[&str] = &[
    "/System",
    "/usr/bin",
    "/usr/sbin",
    "/usr/libexec",
    "/usr/lib",
    "/bin",
    "/sbin",
];

const LINUX_PROTECTED_ROOTS: &[&str] = &["/usr/lib/systemd", "/lib/systemd", "/usr/lib/polkit-1"];

const MACOS_SYSTEM_ROOTS: &[&str] = &["/Library", "/private"];

const LINUX_SYSTEM_ROOTS: &[&str] = &["/usr/sbin", "/sbin", "/usr/libexec"];

const MACOS_USER_ROOTS: &[&str] = &["/Applications", "/Users", "/opt/homebrew", "/usr/local"];

const LINUX_USER_ROOTS: &[&str] = &[
    "/home",
    "/opt",
    "/usr/local",
    "/snap",
    "/var/lib/flatpak",
    "/tmp",
];

/// Name fragments that mark a launch-supervisor child as an essential service.
const ESSENTIAL_KEYWORDS: &[&str] = &[
    "system",
    "kernel",
    "apple",
    "com.apple",
    "security",
    "audio",
    "bluetooth",
    "wifi",
    "network",
    "login",
    "window",
    "dock",
    "finder",
    "spotlight",
    "notification",
];

/// Interactive tools a sweep leaves running.
const PRESERVED_NAMES: &[&str] = &[
    "Terminal",
    "iTerm2",
    "gnome-terminal-server",
    "konsole",
    "alacritty",
    "kitty",
    "wezterm",
    "tmux",
    "screen",
    "ssh",
];

/// Target platform of a policy table set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS.
    MacOs,
    /// Linux.
    Linux,
}

/// Read-only policy tables consulted by the classifier and sweep planner.
#[derive(Debug, Clone)]
pub struct PolicyTables {
    platform: Platform,
    critical_names: BTreeSet<String>,
    protected_roots: Vec<PathBuf>,
    system_roots: Vec<PathBuf>,
    user_roots: Vec<PathBuf>,
    essential_keywords: Vec<String>,
    preserved_names: BTreeSet<String>,
}

impl PolicyTables {
    /// Built-in macOS tables.
    pub fn macos() -> Self {
        Self::build(
            Platform::MacOs,
            MACOS_CRITICAL_NAMES,
            MACOS_PROTECTED_ROOTS,
            MACOS_SYSTEM_ROOTS,
            MACOS_USER_ROOTS,
        )
    }

    /// Built-in Linux tables.
    pub fn linux() -> Self {
        Self::build(
            Platform::Linux,
            LINUX_CRITICAL_NAMES,
            LINUX_PROTECTED_ROOTS,
            LINUX_SYSTEM_ROOTS,
            LINUX_USER_ROOTS,
        )
    }

    /// Tables for the platform this binary was compiled for.
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            Self::macos()
        } else {
            Self::linux()
        }
    }

    fn build(
        platform: Platform,
        critical: &[&str],
        protected: &[&str],
        system: &[&str],
        user: &[&str],
    ) -> Self {
        Self {
            platform,
            critical_names: critical.iter().map(|n| n.to_lowercase()).collect(),
            protected_roots: protected.iter().map(PathBuf::from).collect(),
            system_roots: system.iter().map(PathBuf::from).collect(),
            user_roots: user.iter().map(PathBuf::from).collect(),
            essential_keywords: ESSENTIAL_KEYWORDS.iter().map(|k| (*k).to_owned()).collect(),
            preserved_names: PRESERVED_NAMES.iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    /// Add names to the critical deny-list. Built-in names always remain.
    pub fn with_protected_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.critical_names.extend(
            names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty()),
        );
        self
    }

    /// Add names a sweep must leave running.
    pub fn with_preserved_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.preserved_names.extend(
            names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty()),
        );
        self
    }

    /// Platform these tables target.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Case-insensitive exact match against the critical deny-list.
    pub fn is_critical_name(&self, name: &str) -> bool {
        self.critical_names.contains(&name.to_lowercase())
    }

    /// Executable lives under an immutable system-protection root.
    pub fn is_protected_path(&self, path: &Path) -> bool {
        under_any(path, &self.protected_roots)
    }

    /// Executable lives under a general system-binary root.
    pub fn is_system_path(&self, path: &Path) -> bool {
        under_any(path, &self.system_roots)
    }

    /// Executable lives under a user-application root.
    pub fn is_user_path(&self, path: &Path) -> bool {
        under_any(path, &self.user_roots)
    }

    /// Name contains one of the essential-service keywords.
    pub fn has_essential_keyword(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.essential_keywords
            .iter()
            .any(|k| lower.contains(k.as_str()))
    }

    /// A sweep leaves this name running: it contains an essential keyword,
    /// a critical name or a preserved name, case-insensitively.
    pub fn is_sweep_essential(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.has_essential_keyword(&lower)
            || self
                .critical_names
                .iter()
                .chain(self.preserved_names.iter())
                .any(|n| !n.is_empty() && lower.contains(n.as_str()))
    }

    /// A process with no executable that is the kernel itself or one of its
    /// threads.
    pub fn is_kernel_thread(&self, pid: u32, parent_pid: Option<u32>, has_executable: bool) -> bool {
        if has_executable {
            return false;
        }
        match self.platform {
            Platform::Linux => pid <= KTHREADD_PID || parent_pid == Some(KTHREADD_PID),
            Platform::MacOs => pid == 0,
        }
    }

    /// SHA-256 over every table entry, used to detect in-memory tampering.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut section = |label: &str, items: &mut dyn Iterator<Item = String>| {
            hasher.update(label.as_bytes());
            for item in items {
                hasher.update(item.as_bytes());
                hasher.update([0u8]);
            }
        };
        section("critical", &mut self.critical_names.iter().cloned());
        section("protected", &mut paths(&self.protected_roots));
        section("system", &mut paths(&self.system_roots));
        section("user", &mut paths(&self.user_roots));
        section("keywords", &mut self.essential_keywords.iter().cloned());
        section("preserved", &mut self.preserved_names.iter().cloned());
        hex::encode(hasher.finalize())
    }
}

fn paths(roots: &[PathBuf]) -> impl Iterator<Item = String> + '_ {
    roots.iter().map(|p| p.display().to_string())
}

/// Component-wise prefix match, so `/Applications2` is not under `/Applications`.
fn under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}
