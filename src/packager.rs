use crate::rewriter;
use easy_error::{Error, ResultExt};
use log::debug;
use scraper::Html;
use std::ffi::OsString;
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

pub const INDEX_FILE: &str = "index.html";

/// Serializes the page into `index.html` of the bundle, minus third-party tracking scripts.
pub fn write_document(doc: &Html, bundle_dir: &Path) -> Result<PathBuf, Error> {
    let path = bundle_dir.join(INDEX_FILE);
    let html = rewriter::strip_trackers(&doc.html());
    std::fs::write(&path, html).context(format!("Could not write {path:?}"))?;
    Ok(path)
}

/// Relative paths (with `/` separators) of all files below `dir`, sorted.
fn collect_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    fn walk(dir: &Path, prefix: &str, files: &mut Vec<(String, PathBuf)>) -> Result<(), Error> {
        for entry in std::fs::read_dir(dir).context(format!("Could not list {dir:?}"))? {
            let entry = entry.context(format!("Could not list {dir:?}"))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
            let path = entry.path();
            if path.is_dir() {
                walk(&path, &relative, files)?;
            } else {
                files.push((relative, path));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, "", &mut files)?;
    files.sort();
    Ok(files)
}

/// Zips the contents of `dir` so that the archive depends on nothing but file names and bytes:
/// entries are sorted, and timestamps and permissions are fixed.
pub fn write_predictable_zip<W: Write + Seek>(dir: &Path, writer: W) -> Result<W, Error> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(writer);
    for (name, path) in collect_files(dir)? {
        let contents = std::fs::read(&path).context(format!("Could not read {path:?}"))?;
        zip.start_file(name.as_str(), options).context(format!("Could not add {name} to archive"))?;
        zip.write_all(&contents).context(format!("Could not add {name} to archive"))?;
    }
    zip.finish().context(format!("Could not finish archive of {dir:?}"))
}

/// Archives the bundle next to it as `<bundle>.zip` and returns the archive path.
pub fn create_predictable_zip(bundle_dir: &Path) -> Result<PathBuf, Error> {
    let mut zip_path = OsString::from(bundle_dir.as_os_str());
    zip_path.push(".zip");
    let zip_path = PathBuf::from(zip_path);

    let file = File::create(&zip_path).context(format!("Could not create {zip_path:?}"))?;
    write_predictable_zip(bundle_dir, file)?;
    debug!("Archived {bundle_dir:?} to {zip_path:?}");

    Ok(zip_path)
}

/// Writes the page and archives the bundle.
pub fn package(doc: &Html, bundle_dir: &Path) -> Result<PathBuf, Error> {
    write_document(doc, bundle_dir)?;
    create_predictable_zip(bundle_dir)
}

#[cfg(test)]
fn fill_bundle(dir: &Path, files: &[(&str, &str)]) {
    for (name, contents) in files {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}

#[test]
fn test_archive_is_reproducible() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    // Written in different orders and at different times.
    fill_bundle(first.path(), &[("index.html", "<html></html>"), ("0_app.css", "body {}"), ("fonts/Foo.ttf", "font")]);
    std::thread::sleep(std::time::Duration::from_millis(1100));
    fill_bundle(second.path(), &[("fonts/Foo.ttf", "font"), ("0_app.css", "body {}"), ("index.html", "<html></html>")]);

    let a = write_predictable_zip(first.path(), std::io::Cursor::new(Vec::new())).unwrap().into_inner();
    let b = write_predictable_zip(second.path(), std::io::Cursor::new(Vec::new())).unwrap().into_inner();
    assert_eq!(a, b);

    let again = write_predictable_zip(first.path(), std::io::Cursor::new(Vec::new())).unwrap().into_inner();
    assert_eq!(a, again);
}

#[test]
fn test_archive_entries_sorted() {
    let dir = tempfile::tempdir().unwrap();
    fill_bundle(dir.path(), &[("index.html", "x"), ("1_b.png", "b"), ("0_a.png", "a"), ("fonts/Foo.ttf", "f")]);

    let bytes = write_predictable_zip(dir.path(), std::io::Cursor::new(Vec::new())).unwrap().into_inner();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let names: Vec<_> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();

    assert_eq!(vec!["0_a.png", "1_b.png", "fonts/Foo.ttf", "index.html"], names);
}

#[test]
fn test_package_writes_index_and_zip() {
    let scratch = tempfile::tempdir().unwrap();
    let bundle_dir = scratch.path().join("book-1");
    std::fs::create_dir(&bundle_dir).unwrap();
    let doc = Html::parse_document(
        r#"<html><head><script src="//connect.facebook.net/en_US/sdk.js"></script></head><body>Hi</body></html>"#,
    );

    let zip_path = package(&doc, &bundle_dir).unwrap();

    assert_eq!(scratch.path().join("book-1.zip"), zip_path);
    let index = std::fs::read_to_string(bundle_dir.join(INDEX_FILE)).unwrap();
    assert!(!index.contains("facebook"));
    assert!(index.contains("<body>Hi</body>"));
    assert!(zip_path.exists());
}
