use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use rand::Rng;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Result;

/// A directory packed into a staged zip file, plus the numbers the offer
/// message reports about it.
pub struct ZippedDir {
    pub path: PathBuf,
    pub num_files: u64,
    pub total_bytes: u64,
}

/// Pack a directory tree into a deflated zip in the system temp directory.
///
/// Entry names are relative to `src`. POSIX file modes are stored in each
/// entry's external attributes so the receiving side can restore them.
/// `total_bytes` counts the uncompressed file sizes, which is what the
/// directory offer advertises as `numbytes`.
pub fn zip_dir(src: &Path) -> Result<ZippedDir> {
    let suffix: u32 = rand::thread_rng().gen();
    let staged = std::env::temp_dir().join(format!("portal-{:08x}.zip", suffix));

    let mut writer = ZipWriter::new(File::create(&staged)?);
    let mut num_files: u64 = 0;
    let mut total_bytes: u64 = 0;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under the root")
            .to_string_lossy()
            .into_owned();
        let metadata = entry.metadata().map_err(io::Error::from)?;
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(entry_mode(&metadata));

        if entry.file_type().is_dir() {
            writer.add_directory(rel, options)?;
        } else {
            writer.start_file(rel, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut writer)?;
            num_files += 1;
            total_bytes += metadata.len();
        }
    }
    writer.finish()?;

    debug!(
        "zipped {} file(s), {} byte(s) into {}",
        num_files,
        total_bytes,
        staged.display()
    );
    Ok(ZippedDir {
        path: staged,
        num_files,
        total_bytes,
    })
}

/// Extract a zip archive into `dest`, restoring the POSIX mode kept in the
/// upper 16 bits of each entry's external attributes. Entries that would
/// escape the destination directory are skipped.
pub fn unzip_into(dest: &Path, archive: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    std::fs::create_dir_all(dest)?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let out = match entry.enclosed_name() {
            Some(rel) => dest.join(rel),
            None => {
                debug!("skipping unsafe zip entry {:?}", entry.name());
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&out)?;
            io::copy(&mut entry, &mut file)?;
        }

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn entry_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_base(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("portal_archive_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_zip_unzip_roundtrip() {
        let base = temp_base("roundtrip");
        let source = base.join("source");
        std::fs::create_dir_all(source.join("data/nested")).unwrap();

        std::fs::File::create(source.join("readme.txt"))
            .unwrap()
            .write_all(b"This is the readme file")
            .unwrap();
        std::fs::File::create(source.join("data/data.bin"))
            .unwrap()
            .write_all(&[0xAA; 1000])
            .unwrap();
        std::fs::File::create(source.join("data/nested/deep.txt"))
            .unwrap()
            .write_all(b"Nested file content")
            .unwrap();

        let zipped = zip_dir(&source).expect("should zip folder");
        assert_eq!(zipped.num_files, 3);
        assert_eq!(zipped.total_bytes, 23 + 1000 + 19);
        assert!(std::fs::metadata(&zipped.path).unwrap().len() > 0);

        let dest = base.join("destination");
        unzip_into(&dest, &zipped.path).expect("should unzip");

        assert_eq!(
            std::fs::read_to_string(dest.join("readme.txt")).unwrap(),
            "This is the readme file"
        );
        let data = std::fs::read(dest.join("data/data.bin")).unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data.iter().all(|&b| b == 0xAA));
        assert_eq!(
            std::fs::read_to_string(dest.join("data/nested/deep.txt")).unwrap(),
            "Nested file content"
        );

        let _ = std::fs::remove_file(&zipped.path);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes_survive_roundtrip() {
        use std::os::unix::fs::PermissionsExt;

        let base = temp_base("modes");
        let source = base.join("source");
        std::fs::create_dir_all(&source).unwrap();

        std::fs::File::create(source.join("script.sh"))
            .unwrap()
            .write_all(b"#!/bin/sh\necho hi\n")
            .unwrap();
        std::fs::File::create(source.join("notes.txt"))
            .unwrap()
            .write_all(b"plain")
            .unwrap();
        std::fs::set_permissions(
            source.join("script.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::fs::set_permissions(
            source.join("notes.txt"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let zipped = zip_dir(&source).unwrap();
        let dest = base.join("destination");
        unzip_into(&dest, &zipped.path).unwrap();

        let script_mode = std::fs::metadata(dest.join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        let notes_mode = std::fs::metadata(dest.join("notes.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(script_mode & 0o777, 0o755);
        assert_eq!(notes_mode & 0o777, 0o644);

        let _ = std::fs::remove_file(&zipped.path);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn test_empty_directory_zips() {
        let base = temp_base("empty");
        let source = base.join("source");
        std::fs::create_dir_all(&source).unwrap();

        let zipped = zip_dir(&source).unwrap();
        assert_eq!(zipped.num_files, 0);
        assert_eq!(zipped.total_bytes, 0);
        // even an empty zip has an end-of-directory marker
        assert!(std::fs::metadata(&zipped.path).unwrap().len() > 0);

        let _ = std::fs::remove_file(&zipped.path);
        let _ = std::fs::remove_dir_all(&base);
    }
}
