//! Archive extraction: tarballs (plain, gzip, xz, bzip2) and zip files.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::Archive;
use xz2::read::XzDecoder;
use zip::ZipArchive;

/// Top-level names that are artifact layout directories and are never
/// treated as a wrapper to strip.
const LAYOUT_DIRS: [&str; 4] = ["include", "lib", "bin", "share"];

/// Unix file type bits for a symlink, as stored in zip external attributes.
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

/// Archive formats an artifact mirror may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from a file name or URL path.
    pub fn detect(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let formats = [
            (".tar.gz", ArchiveFormat::TarGz),
            (".tgz", ArchiveFormat::TarGz),
            (".tar.xz", ArchiveFormat::TarXz),
            (".txz", ArchiveFormat::TarXz),
            (".tar.bz2", ArchiveFormat::TarBz2),
            (".tbz2", ArchiveFormat::TarBz2),
            (".tar", ArchiveFormat::Tar),
            (".zip", ArchiveFormat::Zip),
        ];
        formats
            .into_iter()
            .find_map(|(suffix, format)| name.ends_with(suffix).then_some(format))
    }

    /// Decompressed tar stream over `data`. `None` for zip.
    fn tar_stream<'a>(self, data: &'a [u8]) -> Option<Box<dyn Read + 'a>> {
        let cursor = Cursor::new(data);
        Some(match self {
            ArchiveFormat::Tar => Box::new(cursor),
            ArchiveFormat::TarGz => Box::new(GzDecoder::new(cursor)),
            ArchiveFormat::TarXz => Box::new(XzDecoder::new(cursor)),
            ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(cursor)),
            ArchiveFormat::Zip => return None,
        })
    }
}

/// Extract an archive into `dest`.
///
/// When every entry lives under one top-level directory (as in
/// `zlib-1.3.1/include/...`), that directory is stripped. Entries that
/// would land outside `dest` are rejected.
pub fn extract_archive(format: ArchiveFormat, data: &[u8], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create destination directory: {}", dest.display()))?;

    match format {
        ArchiveFormat::Zip => extract_zip(data, dest),
        _ => extract_tar(format, data, dest),
    }
}

fn tar_archive(format: ArchiveFormat, data: &[u8]) -> Result<Archive<Box<dyn Read + '_>>> {
    format
        .tar_stream(data)
        .map(Archive::new)
        .with_context(|| format!("{:?} is not a tar format", format))
}

fn extract_tar(format: ArchiveFormat, data: &[u8], dest: &Path) -> Result<()> {
    let mut paths = Vec::new();
    for entry in tar_archive(format, data)?
        .entries()
        .context("failed to read tarball entries")?
    {
        let entry = entry.context("failed to read tarball entry")?;
        paths.push(safe_relative(&entry.path().context("failed to get entry path")?)?);
    }
    let strip = wrapper_dir(&paths);

    for entry in tar_archive(format, data)?
        .entries()
        .context("failed to read tarball entries")?
    {
        let mut entry = entry.context("failed to read tarball entry")?;
        let entry_path = entry.path().context("failed to get entry path")?.into_owned();
        let Some(output_path) = entry_destination(dest, &entry_path, strip.as_deref())? else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        match entry_type {
            tar::EntryType::Directory => {
                fs::create_dir_all(&output_path).with_context(|| {
                    format!("failed to create directory: {}", output_path.display())
                })?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::Link => {
                entry.unpack(&output_path).with_context(|| {
                    format!("failed to extract file: {}", output_path.display())
                })?;
            }
            tar::EntryType::Symlink => {
                let Some(target) = entry.link_name().context("failed to read link target")?
                else {
                    continue;
                };
                crate::util::fs::symlink(&target, &output_path).with_context(|| {
                    format!("failed to create symlink: {}", output_path.display())
                })?;
            }
            _ => {
                tracing::debug!(
                    "Skipping unsupported entry type {:?}: {}",
                    entry_type,
                    entry_path.display()
                );
            }
        }
    }

    Ok(())
}

fn extract_zip(data: &[u8], dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("failed to read zip archive")?;

    let paths = archive
        .file_names()
        .map(|name| safe_relative(Path::new(name)))
        .collect::<Result<Vec<_>>>()?;
    let strip = wrapper_dir(&paths);

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("failed to read zip entry")?;
        let entry_path = PathBuf::from(file.name());
        let Some(output_path) = entry_destination(dest, &entry_path, strip.as_deref())? else {
            continue;
        };

        if file.is_dir() {
            fs::create_dir_all(&output_path).with_context(|| {
                format!("failed to create directory: {}", output_path.display())
            })?;
            continue;
        }

        let mode = file.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            file.read_to_string(&mut target)
                .with_context(|| format!("failed to read link target of {}", file.name()))?;
            crate::util::fs::symlink(Path::new(&target), &output_path).with_context(|| {
                format!("failed to create symlink: {}", output_path.display())
            })?;
            continue;
        }

        let mut out = fs::File::create(&output_path)
            .with_context(|| format!("failed to create {}", output_path.display()))?;
        std::io::copy(&mut file, &mut out)
            .with_context(|| format!("failed to extract file: {}", output_path.display()))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&output_path, fs::Permissions::from_mode(mode & 0o777))
                .with_context(|| format!("failed to set mode of {}", output_path.display()))?;
        }
    }

    Ok(())
}

/// Where an entry lands under `dest`, creating its parent. `None` for the
/// stripped wrapper directory itself.
fn entry_destination(
    dest: &Path,
    entry_path: &Path,
    strip: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let mut relative = safe_relative(entry_path)?;
    if let Some(prefix) = strip {
        if let Ok(rest) = relative.strip_prefix(prefix) {
            relative = rest.to_path_buf();
        }
    }
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }

    let output_path = dest.join(&relative);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(Some(output_path))
}

/// The single top-level directory shared by every entry, if any.
fn wrapper_dir(paths: &[PathBuf]) -> Option<PathBuf> {
    let mut tops = BTreeSet::new();
    let mut nested = false;

    for path in paths {
        let mut components = path.components();
        if let Some(first) = components.next() {
            tops.insert(first.as_os_str().to_os_string());
            nested |= components.next().is_some();
        }
    }

    if tops.len() != 1 || !nested {
        return None;
    }
    let top = tops.into_iter().next().map(PathBuf::from);
    top.filter(|t| !LAYOUT_DIRS.iter().any(|d| t.as_os_str() == *d))
}

/// Normalize an entry path, rejecting absolute paths and `..`.
fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => bail!("archive entry escapes destination directory: {}", path.display()),
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn tar_bytes<W: Write>(inner: W, files: &[(&str, &str)]) -> W {
        let mut builder = tar::Builder::new(inner);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Build a gzipped tarball from (path, content) pairs.
    pub(crate) fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        tar_bytes(GzEncoder::new(Vec::new(), Compression::default()), files)
            .finish()
            .unwrap()
    }

    /// Build a zip archive from (path, content) pairs.
    pub(crate) fn zipball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, content) in files {
            writer
                .start_file(*path, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const ZLIB: [(&str, &str); 2] = [
        ("zlib-1.3.1/include/zlib.h", "#pragma once\n"),
        ("zlib-1.3.1/lib/libz.a", "archive"),
    ];

    fn assert_zlib_layout(dest: &Path) {
        assert_eq!(
            fs::read_to_string(dest.join("include/zlib.h")).unwrap(),
            "#pragma once\n"
        );
        assert!(dest.join("lib/libz.a").is_file());
        assert!(!dest.join("zlib-1.3.1").exists());
    }

    #[test]
    fn test_strips_wrapper_directory() {
        let tmp = TempDir::new().unwrap();
        extract_archive(ArchiveFormat::TarGz, &tarball(&ZLIB), tmp.path()).unwrap();
        assert_zlib_layout(tmp.path());
    }

    #[test]
    fn test_keeps_layout_top_level() {
        let tmp = TempDir::new().unwrap();
        let data = tarball(&[("include/fmt/core.h", "// fmt\n")]);

        extract_archive(ArchiveFormat::TarGz, &data, tmp.path()).unwrap();
        assert!(tmp.path().join("include/fmt/core.h").is_file());
    }

    #[test]
    fn test_plain_tar() {
        let tmp = TempDir::new().unwrap();
        let data = tar_bytes(Vec::new(), &ZLIB);
        extract_archive(ArchiveFormat::Tar, &data, tmp.path()).unwrap();
        assert_zlib_layout(tmp.path());
    }

    #[test]
    fn test_xz_tarball() {
        let tmp = TempDir::new().unwrap();
        let data = tar_bytes(xz2::write::XzEncoder::new(Vec::new(), 6), &ZLIB)
            .finish()
            .unwrap();
        extract_archive(ArchiveFormat::TarXz, &data, tmp.path()).unwrap();
        assert_zlib_layout(tmp.path());
    }

    #[test]
    fn test_bzip2_tarball() {
        let tmp = TempDir::new().unwrap();
        let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        let data = tar_bytes(encoder, &ZLIB).finish().unwrap();
        extract_archive(ArchiveFormat::TarBz2, &data, tmp.path()).unwrap();
        assert_zlib_layout(tmp.path());
    }

    #[test]
    fn test_zip_archive() {
        let tmp = TempDir::new().unwrap();
        extract_archive(ArchiveFormat::Zip, &zipball(&ZLIB), tmp.path()).unwrap();
        assert_zlib_layout(tmp.path());
    }

    #[test]
    fn test_zip_rejects_escaping_entries() {
        let tmp = TempDir::new().unwrap();
        let data = zipball(&[("../evil.h", "boom")]);
        assert!(extract_archive(ArchiveFormat::Zip, &data, &tmp.path().join("out")).is_err());
        assert!(!tmp.path().join("evil.h").exists());
    }

    #[test]
    fn test_rejects_escaping_entries() {
        assert!(safe_relative(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative(Path::new("/abs/path")).is_err());
        assert_eq!(
            safe_relative(Path::new("./include/a.h")).unwrap(),
            PathBuf::from("include/a.h")
        );
    }

    #[test]
    fn test_detect_format() {
        let detect = ArchiveFormat::detect;
        assert_eq!(detect("https://mirror/zlib-1.3.1.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(detect("fmt.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(detect("/dl/cmake-3.28.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(detect("bzip2-1.0.8.TBZ2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(detect("boost.tar.bz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(detect("sqlite.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(detect("fmt.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(detect("fmt.rar"), None);
    }
}
