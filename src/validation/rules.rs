//! Built-in security rules.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{RuleOutcome, RulePriority, SecurityRule};
use crate::audit::AuditLog;
use crate::auth::{HelperInstaller, HelperServiceStatus};
use crate::policy::{capability, SafetyClassifier};
use crate::process::signature::{sha256_file, SignatureVerifier};

/// Rule id of [`HelperIntegrityRule`]; a failure marks the helper compromised.
pub const HELPER_INTEGRITY: &str = "helper-integrity";

/// Run blocking filesystem work off the runtime; a panic is a failure.
async fn blocking<F>(f: F) -> RuleOutcome
where
    F: FnOnce() -> RuleOutcome + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| RuleOutcome::fail(format!("check panicked: {e}")))
}

// ---------------------------------------------------------------------------
// self-binary-integrity (critical)
// ---------------------------------------------------------------------------

/// The running executable's digest is unchanged since startup.
#[derive(Debug)]
pub struct SelfBinaryIntegrityRule {
    path: PathBuf,
    expected: Option<String>,
}

impl SelfBinaryIntegrityRule {
    /// Record the digest of `path` now; later cycles compare against it.
    pub fn capture(path: PathBuf) -> Self {
        let expected = sha256_file(&path).ok();
        Self { path, expected }
    }
}

#[async_trait]
impl SecurityRule for SelfBinaryIntegrityRule {
    fn id(&self) -> &str {
        "self-binary-integrity"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Critical
    }

    fn description(&self) -> &str {
        "own executable unchanged since startup"
    }

    async fn evaluate(&self) -> RuleOutcome {
        let Some(expected) = self.expected.clone() else {
            return RuleOutcome::fail("executable digest could not be captured at startup");
        };
        let path = self.path.clone();
        blocking(move || match sha256_file(&path) {
            Ok(digest) if digest == expected => RuleOutcome::pass("digest unchanged"),
            Ok(_) => RuleOutcome::fail(format!("{} changed on disk", path.display())),
            Err(e) => RuleOutcome::fail(e.to_string()),
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// policy-table-integrity (critical)
// ---------------------------------------------------------------------------

/// Deny-lists and capability registry match their startup fingerprint.
#[derive(Debug)]
pub struct PolicyTableIntegrityRule {
    classifier: Arc<SafetyClassifier>,
    expected: String,
}

impl PolicyTableIntegrityRule {
    /// Record the fingerprint of the tables in use.
    pub fn capture(classifier: Arc<SafetyClassifier>) -> Self {
        let expected = combined_fingerprint(&classifier);
        Self {
            classifier,
            expected,
        }
    }
}

fn combined_fingerprint(classifier: &SafetyClassifier) -> String {
    format!(
        "{}:{}",
        classifier.tables().fingerprint(),
        capability::fingerprint()
    )
}

#[async_trait]
impl SecurityRule for PolicyTableIntegrityRule {
    fn id(&self) -> &str {
        "policy-table-integrity"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Critical
    }

    fn description(&self) -> &str {
        "policy tables unchanged since startup"
    }

    async fn evaluate(&self) -> RuleOutcome {
        if combined_fingerprint(&self.classifier) == self.expected {
            RuleOutcome::pass("fingerprint matches")
        } else {
            RuleOutcome::fail("policy table fingerprint changed")
        }
    }
}

// ---------------------------------------------------------------------------
// helper-integrity (high)
// ---------------------------------------------------------------------------

/// The installed helper has not been tampered with.
pub struct HelperIntegrityRule {
    installer: Arc<dyn HelperInstaller>,
}

impl HelperIntegrityRule {
    /// Check the helper through `installer`'s probe.
    pub fn new(installer: Arc<dyn HelperInstaller>) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl SecurityRule for HelperIntegrityRule {
    fn id(&self) -> &str {
        HELPER_INTEGRITY
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn description(&self) -> &str {
        "installed helper passes integrity checks"
    }

    async fn evaluate(&self) -> RuleOutcome {
        let probe = self.installer.probe().await;
        match probe.status {
            HelperServiceStatus::Compromised => RuleOutcome::fail(probe.detail),
            status => RuleOutcome::pass(format!("helper {status}")),
        }
    }
}

// ---------------------------------------------------------------------------
// code-signature (high)
// ---------------------------------------------------------------------------

/// The running executable's code signature verifies.
pub struct CodeSignatureRule {
    verifier: Arc<dyn SignatureVerifier>,
    path: PathBuf,
    enforce: bool,
}

impl CodeSignatureRule {
    /// Verify `path`. When `enforce` is false an unsigned build passes with a
    /// note, for platforms without mandatory code signing.
    pub fn new(verifier: Arc<dyn SignatureVerifier>, path: PathBuf, enforce: bool) -> Self {
        Self {
            verifier,
            path,
            enforce,
        }
    }
}

#[async_trait]
impl SecurityRule for CodeSignatureRule {
    fn id(&self) -> &str {
        "code-signature"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn description(&self) -> &str {
        "own executable's code signature verifies"
    }

    async fn evaluate(&self) -> RuleOutcome {
        let verifier = Arc::clone(&self.verifier);
        let path = self.path.clone();
        let enforce = self.enforce;
        blocking(move || {
            if verifier.verify(&path) {
                RuleOutcome::pass("signature valid")
            } else if enforce {
                RuleOutcome::fail(format!("{} does not verify", path.display()))
            } else {
                RuleOutcome::pass("unsigned build; signature not enforced on this platform")
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// system-protection (high)
// ---------------------------------------------------------------------------

/// Platform process protection is active: SIP on macOS, Yama ptrace
/// restrictions on Linux.
#[derive(Debug, Default)]
pub struct SystemProtectionRule;

#[async_trait]
impl SecurityRule for SystemProtectionRule {
    fn id(&self) -> &str {
        "system-protection"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn description(&self) -> &str {
        "platform process protection is enabled"
    }

    async fn evaluate(&self) -> RuleOutcome {
        if cfg!(target_os = "macos") {
            let output = tokio::process::Command::new("csrutil")
                .arg("status")
                .kill_on_drop(true)
                .output()
                .await;
            match output {
                Ok(out) => sip_outcome(&String::from_utf8_lossy(&out.stdout)),
                Err(e) => RuleOutcome::fail(format!("failed to run csrutil: {e}")),
            }
        } else {
            match tokio::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope").await {
                Ok(scope) => yama_outcome(&scope),
                Err(e) => RuleOutcome::fail(format!("Yama LSM unavailable: {e}")),
            }
        }
    }
}

/// Interpret `csrutil status` output.
pub fn sip_outcome(output: &str) -> RuleOutcome {
    if output.contains("status: enabled") {
        RuleOutcome::pass("System Integrity Protection enabled")
    } else {
        RuleOutcome::fail("System Integrity Protection is disabled")
    }
}

/// Interpret the Yama `ptrace_scope` value; 0 means unrestricted.
pub fn yama_outcome(scope: &str) -> RuleOutcome {
    match scope.trim().parse::<u8>() {
        Ok(0) => RuleOutcome::fail("ptrace is unrestricted (ptrace_scope=0)"),
        Ok(n) => RuleOutcome::pass(format!("ptrace_scope={n}")),
        Err(_) => RuleOutcome::fail(format!("unreadable ptrace_scope '{}'", scope.trim())),
    }
}

// ---------------------------------------------------------------------------
// runtime-dir-permissions (medium)
// ---------------------------------------------------------------------------

/// The state directory is not world-writable.
#[derive(Debug)]
pub struct RuntimeDirPermissionsRule {
    dir: PathBuf,
}

impl RuntimeDirPermissionsRule {
    /// Check `dir`.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl SecurityRule for RuntimeDirPermissionsRule {
    fn id(&self) -> &str {
        "runtime-dir-permissions"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Medium
    }

    fn description(&self) -> &str {
        "state directory is not world-writable"
    }

    async fn evaluate(&self) -> RuleOutcome {
        let dir = self.dir.clone();
        blocking(move || dir_outcome(&dir)).await
    }
}

#[cfg(unix)]
fn dir_outcome(dir: &Path) -> RuleOutcome {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(dir) {
        Ok(meta) if meta.permissions().mode() & 0o002 != 0 => {
            RuleOutcome::fail(format!("{} is world-writable", dir.display()))
        }
        Ok(_) => RuleOutcome::pass("permissions ok"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            RuleOutcome::pass("state directory not created yet")
        }
        Err(e) => RuleOutcome::fail(format!("cannot stat {}: {e}", dir.display())),
    }
}

#[cfg(not(unix))]
fn dir_outcome(_dir: &Path) -> RuleOutcome {
    RuleOutcome::pass("permission bits not applicable")
}

// ---------------------------------------------------------------------------
// audit-sink (low)
// ---------------------------------------------------------------------------

/// The audit log accepts writes.
pub struct AuditSinkRule {
    audit: Arc<AuditLog>,
}

impl AuditSinkRule {
    /// Check `audit`.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl SecurityRule for AuditSinkRule {
    fn id(&self) -> &str {
        "audit-sink"
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Low
    }

    fn description(&self) -> &str {
        "audit log is writable"
    }

    async fn evaluate(&self) -> RuleOutcome {
        if self.audit.sink_healthy() {
            RuleOutcome::pass("audit sink writable")
        } else {
            RuleOutcome::fail("audit sink rejected a flush")
        }
    }
}

// ---------------------------------------------------------------------------
// Static rule
// ---------------------------------------------------------------------------

/// Rule with a switchable answer, for simulation and tests.
#[derive(Debug)]
pub struct StaticRule {
    id: String,
    priority: RulePriority,
    passing: AtomicBool,
    delay: Option<Duration>,
}

impl StaticRule {
    /// A rule that initially returns `passing`.
    pub fn new(id: impl Into<String>, priority: RulePriority, passing: bool) -> Self {
        Self {
            id: id.into(),
            priority,
            passing: AtomicBool::new(passing),
            delay: None,
        }
    }

    /// Sleep for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Change the answer for future cycles.
    pub fn set_passing(&self, passing: bool) {
        self.passing.store(passing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecurityRule for StaticRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> RulePriority {
        self.priority
    }

    fn description(&self) -> &str {
        "static rule"
    }

    async fn evaluate(&self) -> RuleOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.passing.load(Ordering::SeqCst) {
            RuleOutcome::pass("ok")
        } else {
            RuleOutcome::fail("configured to fail")
        }
    }
}

// ---------------------------------------------------------------------------
// Default battery
// ---------------------------------------------------------------------------

/// Inputs for the built-in battery.
pub struct RuleInputs {
    /// Path of the running executable.
    pub self_exe: PathBuf,
    /// Classifier whose tables are fingerprinted.
    pub classifier: Arc<SafetyClassifier>,
    /// Helper installer used for probing.
    pub installer: Arc<dyn HelperInstaller>,
    /// Signature verifier.
    pub verifier: Arc<dyn SignatureVerifier>,
    /// State directory.
    pub runtime_dir: PathBuf,
    /// Audit sink.
    pub audit: Arc<AuditLog>,
}

/// The built-in rule battery, critical rules first.
pub fn default_rules(inputs: RuleInputs) -> Vec<Arc<dyn SecurityRule>> {
    vec![
        Arc::new(SelfBinaryIntegrityRule::capture(inputs.self_exe.clone())),
        Arc::new(PolicyTableIntegrityRule::capture(inputs.classifier)),
        Arc::new(HelperIntegrityRule::new(inputs.installer)),
        Arc::new(CodeSignatureRule::new(
            inputs.verifier,
            inputs.self_exe,
            cfg!(target_os = "macos"),
        )),
        Arc::new(SystemProtectionRule),
        Arc::new(RuntimeDirPermissionsRule::new(inputs.runtime_dir)),
        Arc::new(AuditSinkRule::new(inputs.audit)),
    ]
}
