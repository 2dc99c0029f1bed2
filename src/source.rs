//! Source acquisition: git checkouts, archive extraction, workspace layout

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DeployError;

/// On-disk layout of per-service workspaces
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(services_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: services_dir.into(),
        }
    }

    pub fn service_dir(&self, service_id: &str) -> PathBuf {
        self.root.join(service_id)
    }

    /// Checked-out or extracted source for a service
    pub fn source_dir(&self, service_id: &str) -> PathBuf {
        self.service_dir(service_id).join("source")
    }

    /// Directory handed to the image builder, honouring the service's root
    /// directory offset
    pub fn build_context(&self, service_id: &str, root_directory: &str) -> Result<PathBuf, DeployError> {
        let source = self.source_dir(service_id);
        let relative = validate_root_directory(root_directory)?;
        let context = source.join(relative);
        if !context.is_dir() {
            return Err(DeployError::SourceAcquisition(format!(
                "root directory '{}' does not exist in the source",
                root_directory
            )));
        }
        Ok(context)
    }

    pub async fn remove(&self, service_id: &str) -> std::io::Result<()> {
        let dir = self.service_dir(service_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Accept only relative paths that stay inside the source tree
pub fn validate_root_directory(root_directory: &str) -> Result<PathBuf, DeployError> {
    let trimmed = root_directory.trim();
    let trimmed = if trimmed.is_empty() { "." } else { trimmed };
    let path = Path::new(trimmed);

    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(DeployError::SourceAcquisition(format!(
                    "invalid root directory '{}'",
                    root_directory
                )))
            }
        }
    }
    Ok(clean)
}

/// Shallow-clone `branch` of `url` into `dest`, replacing anything already
/// there. Returns the checked-out commit.
pub async fn clone_repo(url: &str, branch: &str, dest: &Path) -> Result<String, DeployError> {
    if dest.exists() {
        tokio::fs::remove_dir_all(dest).await.map_err(|e| {
            DeployError::SourceAcquisition(format!("failed to clear workspace: {}", e))
        })?;
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DeployError::SourceAcquisition(format!("failed to create workspace: {}", e))
        })?;
    }

    info!(url, branch, dest = %dest.display(), "Cloning repository");

    let output = Command::new("git")
        .arg("clone")
        .arg(format!("--branch={}", branch))
        .args(["--depth", "1", "--single-branch", "--"])
        .arg(url)
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .map_err(|e| DeployError::SourceAcquisition(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeployError::SourceAcquisition(format!(
            "git clone failed: {}",
            stderr.trim()
        )));
    }

    head_commit(dest).await
}

async fn head_commit(repo: &Path) -> Result<String, DeployError> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| DeployError::SourceAcquisition(format!("failed to run git: {}", e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Ok("unknown".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
    Plain,
}

fn archive_format(filename: &str) -> ArchiveFormat {
    let lower = filename.to_lowercase();
    if lower.ends_with(".zip") {
        ArchiveFormat::Zip
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveFormat::TarGz
    } else if lower.ends_with(".tar") {
        ArchiveFormat::Tar
    } else {
        ArchiveFormat::Plain
    }
}

/// Unpack an uploaded file into `dest`. Non-archives are stored as-is under
/// their file name. A lone top-level directory is flattened one level.
pub async fn extract_archive(archive: &Path, filename: &str, dest: &Path) -> Result<(), DeployError> {
    let fail = |e: std::io::Error| DeployError::SourceAcquisition(format!("failed to extract upload: {}", e));

    if dest.exists() {
        tokio::fs::remove_dir_all(dest).await.map_err(fail)?;
    }
    tokio::fs::create_dir_all(dest).await.map_err(fail)?;

    let format = archive_format(filename);
    debug!(file = filename, ?format, dest = %dest.display(), "Extracting upload");

    match format {
        ArchiveFormat::Zip => {
            let output = Command::new("unzip")
                .arg("-o")
                .arg("-q")
                .arg(archive)
                .arg("-d")
                .arg(dest)
                .output()
                .await
                .map_err(|e| DeployError::SourceAcquisition(format!("failed to run unzip: {}", e)))?;
            if !output.status.success() {
                return Err(DeployError::SourceAcquisition(format!(
                    "unzip failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        ArchiveFormat::TarGz | ArchiveFormat::Tar => {
            let archive = archive.to_path_buf();
            let target = dest.to_path_buf();
            tokio::task::spawn_blocking(move || unpack_tar(&archive, &target, format == ArchiveFormat::TarGz))
                .await
                .map_err(|e| DeployError::Internal(format!("extract task failed: {}", e)))?
                .map_err(fail)?;
        }
        ArchiveFormat::Plain => {
            let name = Path::new(filename)
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_else(|| "upload".into());
            tokio::fs::copy(archive, dest.join(name)).await.map_err(fail)?;
            return Ok(());
        }
    }

    let target = dest.to_path_buf();
    tokio::task::spawn_blocking(move || flatten_single_dir(&target))
        .await
        .map_err(|e| DeployError::Internal(format!("extract task failed: {}", e)))?
        .map_err(fail)?;

    Ok(())
}

fn unpack_tar(path: &Path, dest: &Path, gzip: bool) -> std::io::Result<()> {
    let file = File::open(path)?;
    // `unpack` refuses entries that would land outside `dest`
    if gzip {
        Archive::new(GzDecoder::new(file)).unpack(dest)
    } else {
        Archive::new(file).unpack(dest)
    }
}

/// If `dir` holds exactly one directory and nothing else, move that
/// directory's children up into `dir`.
fn flatten_single_dir(dir: &Path) -> std::io::Result<()> {
    let entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "__MACOSX")
        .collect();

    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }

    // Move aside first so a child sharing the directory's name cannot collide
    let staging = dir.join(".hostdeck-flatten");
    fs::rename(entries[0].path(), &staging)?;
    for child in fs::read_dir(&staging)? {
        let child = child?;
        fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    fs::remove_dir(&staging)?;

    let macosx = dir.join("__MACOSX");
    if macosx.exists() {
        let _ = fs::remove_dir_all(macosx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_validate_root_directory() {
        assert_eq!(validate_root_directory(".").unwrap(), PathBuf::new());
        assert_eq!(validate_root_directory("").unwrap(), PathBuf::new());
        assert_eq!(validate_root_directory("./web/app").unwrap(), PathBuf::from("web/app"));
        assert!(validate_root_directory("../etc").is_err());
        assert!(validate_root_directory("web/../../x").is_err());
        assert!(validate_root_directory("/etc").is_err());
    }

    #[test]
    fn test_build_context_requires_directory() {
        let tmp = tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        fs::create_dir_all(ws.source_dir("svc").join("frontend")).unwrap();

        assert!(ws.build_context("svc", "frontend").unwrap().ends_with("source/frontend"));
        assert!(matches!(
            ws.build_context("svc", "backend"),
            Err(DeployError::SourceAcquisition(_))
        ));
    }

    #[test]
    fn test_archive_format() {
        assert_eq!(archive_format("site.ZIP"), ArchiveFormat::Zip);
        assert_eq!(archive_format("site.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(archive_format("site.tgz"), ArchiveFormat::TarGz);
        assert_eq!(archive_format("site.tar"), ArchiveFormat::Tar);
        assert_eq!(archive_format("index.html"), ArchiveFormat::Plain);
    }

    #[tokio::test]
    async fn test_extract_tar_gz_flattens_single_dir() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("upload.tgz");
        write_tar_gz(
            &archive,
            &[("site/index.html", "<h1>hi</h1>"), ("site/css/app.css", "body{}")],
        );

        let dest = tmp.path().join("source");
        extract_archive(&archive, "site.tar.gz", &dest).await.unwrap();

        assert!(dest.join("index.html").exists());
        assert!(dest.join("css/app.css").exists());
        assert!(!dest.join("site").exists());
    }

    #[tokio::test]
    async fn test_extract_keeps_multiple_top_level_entries() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("upload.tgz");
        write_tar_gz(&archive, &[("a/index.html", "x"), ("README.md", "y")]);

        let dest = tmp.path().join("source");
        extract_archive(&archive, "upload.tgz", &dest).await.unwrap();

        assert!(dest.join("a/index.html").exists());
        assert!(dest.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_flatten_handles_name_collision() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("upload.tgz");
        write_tar_gz(&archive, &[("app/app/main.py", "print()")]);

        let dest = tmp.path().join("source");
        extract_archive(&archive, "upload.tgz", &dest).await.unwrap();

        assert!(dest.join("app/main.py").exists());
    }

    #[tokio::test]
    async fn test_plain_file_stored_as_is() {
        let tmp = tempdir().unwrap();
        let upload = tmp.path().join("blob");
        fs::write(&upload, "<p>single page</p>").unwrap();

        let dest = tmp.path().join("source");
        extract_archive(&upload, "index.html", &dest).await.unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("index.html")).unwrap(),
            "<p>single page</p>"
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_source_error() {
        let tmp = tempdir().unwrap();
        let upload = tmp.path().join("bad.tgz");
        fs::write(&upload, "definitely not gzip").unwrap();

        let err = extract_archive(&upload, "bad.tgz", &tmp.path().join("source"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::SourceAcquisition(_)));
    }

    #[tokio::test]
    async fn test_workspace_remove() {
        let tmp = tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        fs::create_dir_all(ws.source_dir("svc")).unwrap();

        ws.remove("svc").await.unwrap();
        assert!(!ws.service_dir("svc").exists());
        ws.remove("svc").await.unwrap();
    }
}
