use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const PACKAGE_PREFIX: &str = "image_package_";
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// JSON bundle of image files, keyed by file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePackage {
    pub created: String,
    pub total_files: usize,
    pub images: BTreeMap<String, PackagedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedImage {
    pub filename: String,
    pub size_bytes: u64,
    /// File contents, standard base64.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: usize,
    pub total: usize,
    pub failed: Vec<String>,
}

/// Files in `dir` with the given extension (case-insensitive), sorted by name.
pub fn list_images(dir: &Path, extension: &str) -> Result<Vec<ImageFile>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("unable to list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(OsStr::to_str)
            .map_or(false, |ext| ext.eq_ignore_ascii_case(extension));
        if !matches || !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(OsStr::to_str) {
            Some(name) => name.to_string(),
            None => {
                warn!("skipping non UTF-8 file name {}", path.display());
                continue;
            }
        };
        images.push(ImageFile {
            size_bytes: fs::metadata(&path)?.len(),
            dimensions: png_dimensions(&path),
            name,
            path,
        });
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// Bundles every matching image in `dir` into a timestamped JSON package
/// next to them. Returns `None` when there is nothing to package.
pub fn create_package(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let images = list_images(dir, extension)?;
    if images.is_empty() {
        return Ok(None);
    }
    info!("packaging {} files", images.len());

    let now = Local::now();
    let mut package = ImagePackage {
        created: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        total_files: images.len(),
        images: BTreeMap::new(),
    };
    for image in images {
        let bytes = fs::read(&image.path)
            .with_context(|| format!("unable to read {}", image.path.display()))?;
        info!("processing {} ({:.1} KB)", image.name, bytes.len() as f64 / 1024.0);
        package.images.insert(
            image.name.clone(),
            PackagedImage {
                filename: image.name,
                size_bytes: bytes.len() as u64,
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            },
        );
    }

    let package_path = dir.join(now.format("image_package_%Y%m%d_%H%M%S.json").to_string());
    let file = File::create(&package_path)
        .with_context(|| format!("unable to create {}", package_path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &package)?;
    writer.flush()?;
    info!(
        "created {} ({:.1} MB)",
        package_path.display(),
        fs::metadata(&package_path)?.len() as f64 / 1024.0 / 1024.0
    );
    Ok(Some(package_path))
}

/// The `image_package_*.json` in `dir` with the newest modification time.
pub fn latest_package(dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("unable to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let is_package = name
            .to_str()
            .map_or(false, |name| name.starts_with(PACKAGE_PREFIX) && name.ends_with(".json"));
        if !is_package {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let path = entry.path();
        let is_newer = newest
            .as_ref()
            .map_or(true, |(time, best)| (modified, &path) > (*time, best));
        if is_newer {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Writes every image of `package` into `dest`. Entries that cannot be
/// decoded or written are reported, not fatal. The package file is removed
/// afterwards unless `keep` is set.
pub fn extract_package(package: &Path, dest: &Path, keep: bool) -> Result<ExtractReport> {
    let file =
        File::open(package).with_context(|| format!("unable to open {}", package.display()))?;
    let contents: ImagePackage = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("unable to parse {}", package.display()))?;
    info!(
        "package created {}, {} files",
        contents.created, contents.total_files
    );

    let mut report = ExtractReport {
        total: contents.images.len(),
        ..ExtractReport::default()
    };
    for (name, image) in &contents.images {
        match extract_image(name, image, dest) {
            Ok(size) => {
                info!("extracted {} ({:.1} KB)", name, size as f64 / 1024.0);
                report.extracted += 1;
            }
            Err(e) => {
                warn!("unable to extract {}: {:#}", name, e);
                report.failed.push(name.clone());
            }
        }
    }

    if !keep {
        match fs::remove_file(package) {
            Ok(()) => info!("removed {}", package.display()),
            Err(e) => warn!("unable to remove {}: {}", package.display(), e),
        }
    }
    Ok(report)
}

fn extract_image(name: &str, image: &PackagedImage, dest: &Path) -> Result<usize> {
    if !is_plain_file_name(name) {
        anyhow::bail!("refusing to write outside the destination directory");
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&image.data)
        .context("invalid base64 data")?;
    let path = dest.join(name);
    fs::write(&path, &bytes).with_context(|| format!("unable to write {}", path.display()))?;
    Ok(bytes.len())
}

fn is_plain_file_name(name: &str) -> bool {
    Path::new(name).file_name() == Some(OsStr::new(name))
}

/// Width and height from the IHDR chunk, if the file is a PNG.
fn png_dimensions(path: &Path) -> Option<(u32, u32)> {
    let mut header = [0u8; 24];
    File::open(path).ok()?.read_exact(&mut header).ok()?;
    if header[..8] != PNG_SIGNATURE || &header[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    let height = u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn lists_images_with_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b_histogram.png"), fake_png(1500, 900)).unwrap();
        fs::write(dir.path().join("a_box.PNG"), b"not really a png").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let images = list_images(dir.path(), "png").unwrap();
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a_box.PNG", "b_histogram.png"]);
        assert_eq!(images[0].dimensions, None);
        assert_eq!(images[1].dimensions, Some((1500, 900)));
        assert_eq!(images[1].size_bytes, 33);
    }

    #[test]
    fn package_then_extract_restores_files() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let png = fake_png(10, 20);
        fs::write(source.path().join("cdf_plot.png"), &png).unwrap();
        fs::write(source.path().join("qq_plot.png"), b"\x00\x01\x02").unwrap();

        let package = create_package(source.path(), "png").unwrap().unwrap();
        assert_eq!(latest_package(source.path()).unwrap(), Some(package.clone()));

        let parsed: ImagePackage =
            serde_json::from_str(&fs::read_to_string(&package).unwrap()).unwrap();
        assert_eq!(parsed.total_files, 2);
        assert_eq!(parsed.images["qq_plot.png"].size_bytes, 3);
        assert_eq!(parsed.images["qq_plot.png"].data, "AAEC");

        let report = extract_package(&package, dest.path(), false).unwrap();
        assert_eq!(report.extracted, 2);
        assert_eq!(report.total, 2);
        assert!(report.failed.is_empty());
        assert_eq!(fs::read(dest.path().join("cdf_plot.png")).unwrap(), png);
        assert!(!package.exists());
    }

    #[test]
    fn nothing_to_package() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(create_package(dir.path(), "png").unwrap(), None);
        assert_eq!(latest_package(dir.path()).unwrap(), None);
    }

    #[test]
    fn bad_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut images = BTreeMap::new();
        for (name, data) in [("../escape.png", "AAEC"), ("broken.png", "@@@"), ("ok.png", "AAEC")] {
            images.insert(
                name.to_string(),
                PackagedImage {
                    filename: name.to_string(),
                    size_bytes: 3,
                    data: data.to_string(),
                },
            );
        }
        let package = ImagePackage {
            created: "2024-01-01T00:00:00.000000".to_string(),
            total_files: 3,
            images,
        };
        let path = dir.path().join("image_package_20240101_000000.json");
        fs::write(&path, serde_json::to_string(&package).unwrap()).unwrap();

        let report = extract_package(&path, dir.path(), true).unwrap();
        assert_eq!(report.extracted, 1);
        assert_eq!(report.failed, vec!["../escape.png", "broken.png"]);
        assert!(path.exists());
        assert!(!dir.path().parent().unwrap().join("escape.png").exists());
    }

    #[test]
    fn newest_package_wins_by_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("image_package_20990101_000000.json");
        let newer = dir.path().join("image_package_20000101_000000.json");
        fs::write(&older, "{}").unwrap();
        fs::write(&newer, "{}").unwrap();
        fs::write(dir.path().join("image_package_notes.txt"), "").unwrap();

        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(past)
            .unwrap();

        assert_eq!(latest_package(dir.path()).unwrap(), Some(newer));
    }

    #[test]
    fn plain_file_names_only() {
        assert!(is_plain_file_name("histogram.png"));
        assert!(!is_plain_file_name("../histogram.png"));
        assert!(!is_plain_file_name("nested/histogram.png"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }
}
