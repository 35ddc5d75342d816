use crate::cached_client::CachedClient;
use crate::site::Site;
use easy_error::{Error, ResultExt};
use log::{info, warn};
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "asb";

/// Download area for the site's own EPUB exports.
/// Files are named `{prefix}{book id}.epub`, so an interrupted run resumes where it stopped.
pub struct EbookDownloads<'a> {
    client: &'a CachedClient,
    site: &'a Site,
    dir: PathBuf,
    prefix: String,
}

impl<'a> EbookDownloads<'a> {
    pub fn new<P: AsRef<Path>>(client: &'a CachedClient, site: &'a Site, dir: P, prefix: &str) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context(format!("Could not create download directory {dir:?}"))?;
        Ok(Self {
            client,
            site,
            dir,
            prefix: prefix.to_string(),
        })
    }

    pub fn path_of(&self, book_id: &str) -> PathBuf {
        self.dir.join(format!("{}{book_id}.epub", self.prefix))
    }

    /// Path of the EPUB for `book_id`, downloading it unless an earlier run already did.
    /// Returns `None` when the site has no EPUB for the book.
    pub fn fetch(&self, book_id: &str) -> Result<Option<PathBuf>, Error> {
        let path = self.path_of(book_id);
        if path.exists() {
            info!("Already downloaded {path:?}, skipping");
            return Ok(Some(path));
        }

        let url = self.site.epub_url(book_id)?;
        match self.client.fetch::<Vec<u8>>(&url)?.into_contents() {
            Some(contents) if !contents.is_empty() => {
                std::fs::write(&path, contents).context(format!("Could not write {path:?}"))?;
                info!("Downloaded {url} to {path:?}");
                Ok(Some(path))
            }
            _ => {
                warn!("No EPUB for book {book_id} at {url}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
use crate::cached_client::test_client;
#[cfg(test)]
use mockito::Matcher;

#[test]
fn test_download_then_resume() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/myspace/publish/epub.php")
        .match_query(Matcher::UrlEncoded("id".into(), "12".into()))
        .with_body("PK epub")
        .expect(1)
        .create();
    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let dir = tempfile::tempdir().unwrap();
    let downloads = EbookDownloads::new(&client, &site, dir.path(), DEFAULT_PREFIX).unwrap();

    let path = downloads.fetch("12").unwrap().unwrap();
    assert_eq!(dir.path().join("asb12.epub"), path);
    assert_eq!(b"PK epub".to_vec(), std::fs::read(&path).unwrap());

    // Second call finds the file and does not hit the site again.
    assert_eq!(Some(path), downloads.fetch("12").unwrap());
    mock.assert();
}

#[test]
fn test_missing_epub() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/myspace/publish/epub.php")
        .match_query(Matcher::Any)
        .with_status(404)
        .create();
    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let dir = tempfile::tempdir().unwrap();
    let downloads = EbookDownloads::new(&client, &site, dir.path(), "x").unwrap();

    assert_eq!(None, downloads.fetch("3").unwrap());
    assert!(!downloads.path_of("3").exists());
}
