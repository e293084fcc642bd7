//! Project archive handling
//!
//! A project is a zip archive carrying the topology document plus any
//! saved per-node configuration. Opening a project extracts it into a
//! temp working directory; `save` zips the working directory back over
//! the archive.

use crate::config::EmulatorConfig;
use crate::daemon::DaemonClient;
use crate::error::{Error, Result};
use crate::manager::TopologyManager;
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Topology document name inside the archive
pub const TOPOLOGY_FILE: &str = "network.toml";

const EMPTY_TOPOLOGY: &str = r#"[config]
image_dir = "images"
config_dir = "configs"

[nodes]

[switches]

[bridges]
"#;

/// Write an empty project skeleton
pub fn create_project(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut archive = ZipWriter::new(file);
    archive.start_file(TOPOLOGY_FILE, SimpleFileOptions::default())?;
    archive.write_all(EMPTY_TOPOLOGY.as_bytes())?;
    archive.finish()?;
    Ok(())
}

pub struct Project {
    id: String,
    path: PathBuf,
    tmp: tempfile::TempDir,
    daemon: DaemonClient,
    manager: TopologyManager,
}

impl Project {
    /// Extract an archive into a working directory and wrap it in a
    /// topology manager
    pub fn open(
        daemon: DaemonClient,
        config: EmulatorConfig,
        id: &str,
        path: &Path,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file).map_err(|e| Error::ArchiveRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let tmp = tempfile::Builder::new().prefix(id).tempdir()?;
        archive.extract(tmp.path())?;

        let topology_file = tmp.path().join(TOPOLOGY_FILE);
        if !topology_file.is_file() {
            return Err(Error::TopologyFileMissing(path.to_path_buf()));
        }

        info!("Open project {} as {}", path.display(), id);
        let manager = TopologyManager::new(
            daemon.clone(),
            config,
            id,
            topology_file,
            tmp.path().to_path_buf(),
        );
        Ok(Self {
            id: id.to_string(),
            path: path.to_path_buf(),
            tmp,
            daemon,
            manager,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manager(&self) -> &TopologyManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut TopologyManager {
        &mut self.manager
    }

    pub fn topology_file(&self) -> PathBuf {
        self.tmp.path().join(TOPOLOGY_FILE)
    }

    /// Aggregated project/node state for `status` answers
    pub fn status(&self) -> serde_json::Value {
        json!({
            "project": {
                "path": self.path.display().to_string(),
                "running": self.manager.is_loaded(),
            },
            "nodes": self.manager.nodes_status(),
        })
    }

    /// Whether the working topology differs from the archived one
    pub fn is_topology_modified(&self) -> bool {
        // a corrupted archive is not worth failing over here
        let Ok(file) = File::open(&self.path) else {
            return false;
        };
        let Ok(mut archive) = ZipArchive::new(file) else {
            return false;
        };
        let Ok(mut entry) = archive.by_name(TOPOLOGY_FILE) else {
            return false;
        };
        let mut archived = String::new();
        if std::io::Read::read_to_string(&mut entry, &mut archived).is_err() {
            return false;
        }
        let working =
            std::fs::read_to_string(self.tmp.path().join(TOPOLOGY_FILE)).unwrap_or_default();
        archived != working
    }

    /// Persist flagged node configurations, then zip the working
    /// directory back over the archive
    pub fn save(&mut self) -> Result<()> {
        self.manager.save(None)?;
        self.rezip()
    }

    /// Persist flagged node configurations into an external directory
    pub fn save_config(&mut self, conf_path: &Path) -> Result<()> {
        if !conf_path.is_dir() {
            return Err(Error::Protocol(format!(
                "{} is not a valid path",
                conf_path.display()
            )));
        }
        self.manager.save(Some(conf_path))
    }

    fn rezip(&self) -> Result<()> {
        let file = File::create(&self.path)?;
        let mut archive = ZipWriter::new(file);
        add_dir(&mut archive, self.tmp.path(), self.tmp.path())?;
        archive.finish()?;
        Ok(())
    }

    /// Tear the topology down and release every project resource
    pub fn close(&mut self) {
        self.manager.close_instances();
        // whatever happened before, ask the daemon to sweep the project
        if let Err(e) = self.daemon.clean(&self.id) {
            error!("Unable to clean the project properly: {}", e);
        }
    }
}

fn add_dir(archive: &mut ZipWriter<File>, base: &Path, dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            add_dir(archive, base, &path)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            archive.start_file(rel, SimpleFileOptions::default())?;
            let mut file = File::open(&path)?;
            std::io::copy(&mut file, archive)?;
        }
    }
    Ok(())
}
