//! kwokctl-backed provisioner
//!
//! Each backend is a kwok cluster named after the backend name, with its
//! apiserver bound to the allocated port. kwokctl keeps per-cluster state under
//! `~/.kwok/clusters/<name>/`, which doubles as the on-disk inventory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_yaml::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{BackendCredential, BackendProvisioner};
use crate::allocator::BACKEND_PREFIX;
use crate::{Error, Result};

const KUBECONFIG_FILE_NAME: &str = "kubeconfig.yaml";

/// Paths and timings for [`KwokProvisioner`]
#[derive(Clone, Debug)]
pub struct KwokConfig {
    /// kwokctl binary
    pub kwokctl_path: String,
    /// kubectl binary
    pub kubectl_path: String,
    /// Directory kwokctl keeps cluster state in
    pub clusters_dir: PathBuf,
    /// Interval between readiness checks
    pub ready_poll_interval: Duration,
}

/// [`BackendProvisioner`] driving kwokctl and kubectl
#[derive(Clone, Debug)]
pub struct KwokProvisioner {
    config: KwokConfig,
}

/// Where a kubeconfig says the CA lives
#[derive(Clone, Debug, PartialEq, Eq)]
enum CaSource {
    Inline(String),
    File(PathBuf),
    Missing,
}

fn parse_kubeconfig(text: &str) -> Result<(CaSource, String)> {
    let doc: Value = serde_yaml::from_str(text)?;

    let cluster = &doc["clusters"][0]["cluster"];
    let ca = if let Some(data) = cluster["certificate-authority-data"].as_str() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::serialization(format!("invalid certificate-authority-data: {}", e)))?;
        CaSource::Inline(String::from_utf8_lossy(&bytes).into_owned())
    } else if let Some(path) = cluster["certificate-authority"].as_str() {
        CaSource::File(PathBuf::from(path))
    } else {
        CaSource::Missing
    };

    let token = doc["users"][0]["user"]["token"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    Ok((ca, token))
}

async fn run_tool(program: &str, args: &[&str]) -> std::result::Result<String, String> {
    debug!(program, ?args, "Executing");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to execute {}: {}", program, e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

impl KwokProvisioner {
    /// Create a provisioner
    pub fn new(config: KwokConfig) -> Self {
        Self { config }
    }

    fn cluster_dir(&self, name: &str) -> PathBuf {
        self.config.clusters_dir.join(name)
    }

    fn kubeconfig(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(KUBECONFIG_FILE_NAME)
    }

    async fn answers_version(&self, kubeconfig: &Path) -> bool {
        let kubeconfig = kubeconfig.to_string_lossy();
        run_tool(
            &self.config.kubectl_path,
            &["--kubeconfig", &kubeconfig, "get", "--raw", "/version"],
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl BackendProvisioner for KwokProvisioner {
    async fn provision(&self, name: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        info!(backend = %name, port = %port, "Creating kwok cluster");
        run_tool(
            &self.config.kwokctl_path,
            &[
                "create",
                "cluster",
                "--name",
                name,
                "--kube-apiserver-port",
                &port,
            ],
        )
        .await
        .map_err(|e| Error::provision_failed(name, e))?;
        Ok(())
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let kubeconfig = self.kubeconfig(name);
        let poll = self.config.ready_poll_interval;

        let ready = tokio::time::timeout(timeout, async {
            loop {
                if self.answers_version(&kubeconfig).await {
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match ready {
            Ok(()) => {
                info!(backend = %name, "kwok cluster ready");
                Ok(())
            }
            Err(_) => Err(Error::not_ready(
                name,
                format!("apiserver did not answer within {}s", timeout.as_secs()),
            )),
        }
    }

    async fn fetch_credential(&self, name: &str) -> Result<BackendCredential> {
        let path = self.kubeconfig(name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::not_ready(name, format!("read {}: {}", path.display(), e)))?;
        let (ca, token) = parse_kubeconfig(&text).map_err(|e| Error::not_ready(name, e.to_string()))?;

        let ca_cert = match ca {
            CaSource::Inline(pem) => pem,
            CaSource::File(ca_path) => {
                let ca_path = if ca_path.is_relative() {
                    self.cluster_dir(name).join(ca_path)
                } else {
                    ca_path
                };
                tokio::fs::read_to_string(&ca_path).await.map_err(|e| {
                    Error::not_ready(name, format!("read {}: {}", ca_path.display(), e))
                })?
            }
            CaSource::Missing => String::new(),
        };

        Ok(BackendCredential { ca_cert, token })
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        info!(backend = %name, "Deleting kwok cluster");
        if let Err(e) = run_tool(
            &self.config.kwokctl_path,
            &["delete", "cluster", "--name", name],
        )
        .await
        {
            if tokio::fs::metadata(self.cluster_dir(name)).await.is_err() {
                debug!(backend = %name, "kwok cluster already gone");
                return Ok(());
            }
            return Err(Error::provision_failed(name, format!("teardown failed: {}", e)));
        }
        Ok(())
    }

    async fn inventory(&self) -> Result<Vec<String>> {
        let dir = &self.config.clusters_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::persistence(
                    dir.display().to_string(),
                    e.to_string(),
                ))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::persistence(dir.display().to_string(), e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(BACKEND_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn restore(&self, name: &str) -> Result<bool> {
        if tokio::fs::metadata(self.cluster_dir(name)).await.is_err() {
            return Ok(false);
        }
        if self.answers_version(&self.kubeconfig(name)).await {
            return Ok(true);
        }
        match run_tool(
            &self.config.kwokctl_path,
            &["start", "cluster", "--name", name],
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(backend = %name, error = %e, "Failed to restart kwok cluster");
                Err(Error::provision_failed(name, e))
            }
        }
    }

    fn kubeconfig_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.kubeconfig(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner(dir: &Path) -> KwokProvisioner {
        KwokProvisioner::new(KwokConfig {
            kwokctl_path: "kwokctl".to_string(),
            kubectl_path: "kubectl".to_string(),
            clusters_dir: dir.to_path_buf(),
            ready_poll_interval: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_parse_kubeconfig_inline_ca() {
        let ca = base64::engine::general_purpose::STANDARD.encode("-----BEGIN CERTIFICATE-----\n");
        let text = format!(
            r#"
apiVersion: v1
kind: Config
clusters:
- name: kwok
  cluster:
    server: https://127.0.0.1:8001
    certificate-authority-data: {ca}
users:
- name: kwok
  user:
    token: sekret
"#
        );
        let (source, token) = parse_kubeconfig(&text).unwrap();
        assert_eq!(
            source,
            CaSource::Inline("-----BEGIN CERTIFICATE-----\n".to_string())
        );
        assert_eq!(token, "sekret");
    }

    #[test]
    fn test_parse_kubeconfig_ca_file_and_cert_auth() {
        let text = r#"
clusters:
- cluster:
    certificate-authority: pki/ca.crt
users:
- user:
    client-certificate: pki/admin.crt
"#;
        let (source, token) = parse_kubeconfig(text).unwrap();
        assert_eq!(source, CaSource::File(PathBuf::from("pki/ca.crt")));
        assert!(token.is_empty());
    }

    #[tokio::test]
    async fn test_inventory_lists_backends_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("backend-c1-8001")).unwrap();
        std::fs::create_dir(dir.path().join("backend-c2-8011")).unwrap();
        std::fs::create_dir(dir.path().join("dev")).unwrap();

        let names = provisioner(dir.path()).inventory().await.unwrap();
        assert_eq!(names, vec!["backend-c1-8001", "backend-c2-8011"]);
    }

    #[tokio::test]
    async fn test_inventory_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let names = provisioner(&dir.path().join("absent"))
            .inventory()
            .await
            .unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_state_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let restored = provisioner(dir.path())
            .restore("backend-c1-8001")
            .await
            .unwrap();
        assert!(!restored);
    }

    #[tokio::test]
    async fn test_fetch_credential_reads_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_dir = dir.path().join("backend-c1-8001");
        std::fs::create_dir_all(cluster_dir.join("pki")).unwrap();
        std::fs::write(cluster_dir.join("pki/ca.crt"), "CA PEM").unwrap();
        std::fs::write(
            cluster_dir.join(KUBECONFIG_FILE_NAME),
            "clusters:\n- cluster:\n    certificate-authority: pki/ca.crt\n",
        )
        .unwrap();

        let credential = provisioner(dir.path())
            .fetch_credential("backend-c1-8001")
            .await
            .unwrap();
        assert_eq!(credential.ca_cert, "CA PEM");
        assert!(credential.token.is_empty());
    }

    /// Story: a tool call abandoned by a timed-out step does not leave the
    /// child running
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn story_abandoned_tool_call_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let args = ["-c", script.as_str()];
        let call = run_tool("sh", &args);
        let outcome = tokio::time::timeout(Duration::from_millis(500), call).await;
        assert!(outcome.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        for _ in 0..100 {
            // Gone, or a zombie waiting to be reaped
            match std::fs::read_to_string(&stat) {
                Err(_) => return,
                Ok(line) if line.contains(") Z ") => return,
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("child {} still running", pid.trim());
    }
}
