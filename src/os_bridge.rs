use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct NetworkInterfaceInfo {
    pub name: String,
    pub intf_type: String,
    pub available: bool,
}

/// RPC surface to the OS plugin: filesystem access, command execution, and
/// network interface enumeration on the node this runtime manages.
#[async_trait]
pub trait OsBridge: Send + Sync {
    async fn dir_exists(&self, path: &Path) -> Result<bool>;
    async fn create_dir(&self, path: &Path) -> Result<()>;
    async fn store_file(&self, path: &Path, contents: &[u8]) -> Result<()>;
    async fn remove_file(&self, path: &Path) -> Result<()>;
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    async fn download_file(&self, source: &str, dest: &Path) -> Result<()>;
    async fn execute_command(&self, command: &str, args: &[String]) -> Result<Output>;
    async fn get_network_informations(&self) -> Result<Vec<NetworkInterfaceInfo>>;
    async fn get_intf_type(&self, name: &str) -> Result<String>;
    async fn set_interface_unaviable(&self, name: &str) -> Result<()>;
}

/// Real implementation, backed directly by the node's filesystem and
/// `/sys/class/net`. Interface availability (as opposed to interface type,
/// which is kernel-reported) is plugin-local bookkeeping, not a change to
/// the kernel's own state.
pub struct LocalOsBridge {
    unavailable: Arc<Mutex<HashSet<String>>>,
    http: reqwest::Client,
}

impl LocalOsBridge {
    pub fn new() -> Self {
        Self {
            unavailable: Arc::new(Mutex::new(HashSet::new())),
            http: reqwest::Client::new(),
        }
    }
}

impl Default for LocalOsBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsBridge for LocalOsBridge {
    async fn dir_exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("creating {}", path.display()))
    }

    async fn store_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    async fn download_file(&self, source: &str, dest: &Path) -> Result<()> {
        if let Some(local) = source.strip_prefix("file://") {
            tokio::fs::copy(local, dest).await?;
            return Ok(());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            let bytes = self.http.get(source).send().await?.bytes().await?;
            tokio::fs::write(dest, &bytes).await?;
            return Ok(());
        }
        bail!("unsupported image source scheme: {source}")
    }

    async fn execute_command(&self, command: &str, args: &[String]) -> Result<Output> {
        tokio::process::Command::new(command)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {command}"))
    }

    async fn get_network_informations(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        let mut infos = Vec::new();
        let mut entries = tokio::fs::read_dir("/sys/class/net").await?;
        let unavailable = self.unavailable.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let intf_type = classify_interface(&name).await;
            infos.push(NetworkInterfaceInfo {
                available: !unavailable.contains(&name),
                name,
                intf_type,
            });
        }
        Ok(infos)
    }

    async fn get_intf_type(&self, name: &str) -> Result<String> {
        Ok(classify_interface(name).await)
    }

    async fn set_interface_unaviable(&self, name: &str) -> Result<()> {
        self.unavailable.lock().await.insert(name.to_string());
        Ok(())
    }
}

async fn classify_interface(name: &str) -> String {
    let wireless_marker: PathBuf = ["/sys/class/net", name, "wireless"].iter().collect();
    if tokio::fs::try_exists(&wireless_marker).await.unwrap_or(false) {
        "wireless".to_string()
    } else {
        "ethernet".to_string()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    /// In-memory fake: a virtual filesystem plus a fixed interface table,
    /// used by lifecycle engine tests so no real host state is touched.
    pub struct MockOsBridge {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
        dirs: Mutex<HashSet<PathBuf>>,
        pub interfaces: Mutex<Vec<NetworkInterfaceInfo>>,
        pub commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockOsBridge {
        pub fn new(interfaces: Vec<NetworkInterfaceInfo>) -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
                dirs: Mutex::new(HashSet::new()),
                interfaces: Mutex::new(interfaces),
                commands: Mutex::new(Vec::new()),
            }
        }

        pub async fn file(&self, path: &Path) -> Option<Vec<u8>> {
            self.files.lock().await.get(path).cloned()
        }
    }

    #[async_trait]
    impl OsBridge for MockOsBridge {
        async fn dir_exists(&self, path: &Path) -> Result<bool> {
            Ok(self.dirs.lock().await.contains(path))
        }

        async fn create_dir(&self, path: &Path) -> Result<()> {
            self.dirs.lock().await.insert(path.to_path_buf());
            Ok(())
        }

        async fn store_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
            self.files
                .lock()
                .await
                .insert(path.to_path_buf(), contents.to_vec());
            Ok(())
        }

        async fn remove_file(&self, path: &Path) -> Result<()> {
            self.files.lock().await.remove(path);
            Ok(())
        }

        async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
            self.files
                .lock()
                .await
                .get(path)
                .cloned()
                .with_context(|| format!("{} not found", path.display()))
        }

        async fn download_file(&self, source: &str, dest: &Path) -> Result<()> {
            self.files
                .lock()
                .await
                .insert(dest.to_path_buf(), source.as_bytes().to_vec());
            Ok(())
        }

        async fn execute_command(&self, command: &str, args: &[String]) -> Result<Output> {
            self.commands
                .lock()
                .await
                .push((command.to_string(), args.to_vec()));
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Ok(Output {
                    status: std::process::ExitStatus::from_raw(0),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                })
            }
        }

        async fn get_network_informations(&self) -> Result<Vec<NetworkInterfaceInfo>> {
            Ok(self.interfaces.lock().await.clone())
        }

        async fn get_intf_type(&self, name: &str) -> Result<String> {
            Ok(self
                .interfaces
                .lock()
                .await
                .iter()
                .find(|i| i.name == name)
                .map(|i| i.intf_type.clone())
                .unwrap_or_else(|| "ethernet".to_string()))
        }

        async fn set_interface_unaviable(&self, name: &str) -> Result<()> {
            let mut ifaces = self.interfaces.lock().await;
            if let Some(iface) = ifaces.iter_mut().find(|i| i.name == name) {
                iface.available = false;
            }
            Ok(())
        }
    }
}
