use crate::cached_client::CachedClient;
use crate::dom_manipulation::{html_attr_name, DomOperation, MutableDom};
use crate::localizer::{Bundle, Localizer};
use crate::navigation::{add_page_flippers, has_view_container};
use crate::packager;
use crate::site::Site;
use easy_error::{Error, ResultExt};
use log::{info, warn};
use reqwest::Url;
use scraper::{Html, Node, Selector};
use serde::Serialize;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref BODY_SELECTOR: Selector = Selector::parse("body").unwrap();
    static ref COPYRIGHT_SELECTOR: Selector = Selector::parse(".backcover_copyright").unwrap();
    static ref HEADER_SELECTOR: Selector = Selector::parse("#headerBar").unwrap();
}

/// Body text of reader pages for books the site no longer carries.
pub const REMOVED_MARKER: &str = "The storybook you wanted is not part of the African Storybook website";

pub const DEFAULT_COPYRIGHT_HOLDER: &str = "African Storybook Initiative";

/// Longest title, author or copyright holder accepted downstream.
pub const MAX_METADATA_CHARS: usize = 190;

/// Everything known about a book before its page is downloaded.
#[derive(Clone, Debug)]
pub struct BookRequest {
    pub id: String,
    pub url: Url,
    pub title: String,
    pub author: String,
    pub description: String,
    pub language: String,
}

/// A localized and archived book, ready to be placed in the topic tree.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PackagedBook {
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub description: String,
    pub license_holder: String,
    pub language: String,
    /// The zipped bundle, or the downloaded EPUB.
    pub archive: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

impl PackagedBook {
    pub fn new(request: &BookRequest, license_holder: &str, archive: PathBuf, thumbnail: Option<PathBuf>) -> Self {
        Self {
            source_id: format!("{}|{}", request.id, request.language),
            title: truncate_metadata(&request.title),
            author: truncate_metadata(&request.author),
            description: request.description.clone(),
            license_holder: truncate_metadata(license_holder),
            language: request.language.clone(),
            archive,
            thumbnail,
        }
    }
}

/// Cuts `data` to `MAX_METADATA_CHARS` characters, marking the cut with `" ..."`.
pub fn truncate_metadata(data: &str) -> String {
    if data.chars().count() > MAX_METADATA_CHARS {
        data.chars().take(MAX_METADATA_CHARS).collect::<String>() + " ..."
    } else {
        data.to_string()
    }
}

pub fn is_removed(doc: &Html) -> bool {
    doc.select(&BODY_SELECTOR)
        .next()
        .map_or(false, |body| body.text().collect::<String>().contains(REMOVED_MARKER))
}

/// The holder named on the back cover, e.g. `© Jane Doe` becomes `Jane Doe`.
pub fn copyright_holder(doc: &Html) -> Option<String> {
    let back_cover = doc.select(&COPYRIGHT_SELECTOR).next()?;
    let first = back_cover.children().next()?;
    let text = match first.value() {
        Node::Text(text) => String::from(&**text),
        Node::Element(_) => first
            .descendants()
            .filter_map(|node| node.value().as_text())
            .map(|text| &**text)
            .collect(),
        _ => return None,
    };
    let holder = text.trim_matches(|c| matches!(c, ' ' | 'Â' | '©')).to_string();
    if holder.is_empty() {
        None
    } else {
        Some(holder)
    }
}

/// The site's own navigation bar is useless inside a bundle.
fn hide_header(doc: &mut Html) {
    let header = doc.select(&HEADER_SELECTOR).next().map(|header| header.id());
    match header {
        Some(header) => doc.perform_operation(DomOperation::SetAttribute {
            node_id: header,
            attr_name: html_attr_name("style"),
            value: String::from("display: none;"),
        }),
        None => warn!("No #headerBar to hide"),
    }
}

/// Turns reader pages into self-contained HTML bundles.
pub struct BookDownloader<'a> {
    client: &'a CachedClient,
    site: &'a Site,
    scratch_dir: PathBuf,
}

impl<'a> BookDownloader<'a> {
    pub fn new<P: AsRef<Path>>(client: &'a CachedClient, site: &'a Site, scratch_dir: P) -> Self {
        Self {
            client,
            site,
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
        }
    }

    /// Downloads a single book and packages it.
    /// Returns `None` for books the site does not serve any more.
    pub fn download_book(&self, request: &BookRequest) -> Result<Option<PackagedBook>, Error> {
        let resource = self.client.fetch::<String>(&request.url)?;
        if resource.is_cached() {
            info!("Using book {} from cache", request.id);
        }
        let status = resource.status();
        let page = match resource.into_contents() {
            Some(page) => page,
            None => {
                warn!("Book {} is unavailable at {} (HTTP {})", request.id, request.url, status.as_u16());
                return Ok(None);
            }
        };
        let mut doc = Html::parse_document(&page);

        if is_removed(&doc) {
            info!("Book {} has been removed from the site", request.id);
            return Ok(None);
        }

        let license_holder = copyright_holder(&doc).unwrap_or_else(|| {
            warn!("Failed to find backcover_copyright for url: {}", request.url);
            DEFAULT_COPYRIGHT_HOLDER.to_string()
        });

        let mut bundle = Bundle::create(&self.scratch_dir)?;
        let localizer = Localizer::new(self.client, self.site);
        let thumbnail = localizer.localize(&mut doc, &mut bundle)?;

        hide_header(&mut doc);

        if has_view_container(&doc) {
            let left_icon = self.localize_icon(&localizer, &mut bundle, "img/left.png")?;
            let right_icon = self.localize_icon(&localizer, &mut bundle, "img/right.png")?;
            add_page_flippers(&mut doc, &left_icon, &right_icon);
        } else {
            warn!("Book {} has no .views container, page flippers not added", request.id);
        }

        let archive = packager::package(&doc, bundle.dir())
            .context(format!("Could not package book {}", request.id))?;

        Ok(Some(PackagedBook::new(request, &license_holder, archive, thumbnail)))
    }

    /// Stores one of the site's flipper icons in the bundle under its bare name.
    fn localize_icon(&self, localizer: &Localizer, bundle: &mut Bundle, path: &str) -> Result<String, Error> {
        let url = self.site.resolve(path)?;
        let name = url
            .path_segments()
            .and_then(|segments| segments.last())
            .unwrap_or(path)
            .to_string();
        let name = bundle.claim(name, &url);
        let contents = localizer.download(&url).unwrap_or_default();
        bundle.write(&name, &contents)?;
        Ok(name)
    }
}

#[test]
fn test_truncate_long_title() {
    let title = "a".repeat(250);
    let truncated = truncate_metadata(&title);
    assert_eq!(format!("{} ...", "a".repeat(190)), truncated);
    assert_eq!(194, truncated.chars().count());
}

#[test]
fn test_truncate_short_title() {
    let title = "b".repeat(100);
    assert_eq!(title, truncate_metadata(&title));
    assert_eq!("é".repeat(190), truncate_metadata(&"é".repeat(190)));
}

#[test]
fn test_copyright_holder() {
    let doc = Html::parse_document("<div class='backcover_copyright'>© Book Dash 2015<br>Some rights reserved</div>");
    assert_eq!(Some("Book Dash 2015".to_string()), copyright_holder(&doc));

    let mangled = Html::parse_document("<div class='backcover_copyright'> Â© Saide </div>");
    assert_eq!(Some("Saide".to_string()), copyright_holder(&mangled));

    let missing = Html::parse_document("<div class='backcover'>Nothing</div>");
    assert_eq!(None, copyright_holder(&missing));
}

#[test]
fn test_hide_header() {
    let mut doc = Html::parse_document("<div id='headerBar'>Menu</div>");
    hide_header(&mut doc);
    let header = doc.select(&HEADER_SELECTOR).next().unwrap();
    assert_eq!(Some("display: none;"), header.value().attr("style"));
}

#[cfg(test)]
use crate::cached_client::test_client;
#[cfg(test)]
use mockito::Matcher;

#[cfg(test)]
const READER_PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<script src="/js/reader.js"></script>
<script>(function(){var ga=document.createElement('script');ga.src='//www.google-analytics.com/analytics.js';})();</script>
</head><body>
<div id="headerBar">African Storybook</div>
<div class="views">
<div class="page cover-image" style="background-image:url(/upload/cover.jpg)"></div>
<div class="page"><img src="/upload/page1.png"></div>
<div class="backcover_copyright">© Jane Doe</div>
</div>
</body></html>"#;

#[cfg(test)]
fn request(site: &Site, title: &str) -> BookRequest {
    BookRequest {
        id: "16451".to_string(),
        url: site.reader_url("16451").unwrap(),
        title: title.to_string(),
        author: "Jane Doe; Others: John Roe".to_string(),
        description: "A story.".to_string(),
        language: "English".to_string(),
    }
}

#[test]
fn test_download_book() {
    let mut server = mockito::Server::new();
    let _page = server
        .mock("GET", "/reader.php")
        .match_query(Matcher::UrlEncoded("id".into(), "16451".into()))
        .with_body(READER_PAGE)
        .create();
    let _js = server.mock("GET", "/js/reader.js").with_body("go()").create();
    let _cover = server.mock("GET", "/upload/cover.jpg").with_body("cover").create();
    let _png = server.mock("GET", "/upload/page1.png").with_body("png").create();
    let _left = server.mock("GET", "/img/left.png").with_body("left").create();
    let _right = server.mock("GET", "/img/right.png").with_body("right").create();

    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();
    let downloader = BookDownloader::new(&client, &site, scratch.path());

    let book = downloader
        .download_book(&request(&site, &"x".repeat(250)))
        .unwrap()
        .expect("book should be packaged");

    assert_eq!("16451|English", book.source_id);
    assert_eq!(format!("{} ...", "x".repeat(190)), book.title);
    assert_eq!("Jane Doe", book.license_holder);
    assert!(book.archive.exists());

    let bundle_dir = book.thumbnail.as_ref().unwrap().parent().unwrap().to_path_buf();
    assert_eq!(bundle_dir.join("0_cover.jpg"), book.thumbnail.clone().unwrap());
    for name in ["index.html", "0_page1.png", "0_reader.js", "left.png", "right.png"] {
        assert!(bundle_dir.join(name).exists(), "{name} missing from bundle");
    }

    let index = std::fs::read_to_string(bundle_dir.join("index.html")).unwrap();
    assert!(!index.contains("google-analytics"));
    assert!(!index.contains("/upload/"));
    assert!(index.contains(r#"id="left-flipper""#));
    assert!(index.contains(r#"style="display: none;""#));
}

#[test]
fn test_removed_book_is_skipped() {
    let mut server = mockito::Server::new();
    let _page = server
        .mock("GET", "/reader.php")
        .match_query(Matcher::Any)
        .with_body(format!("<html><body><p>{REMOVED_MARKER}.</p></body></html>"))
        .create();

    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();
    let downloader = BookDownloader::new(&client, &site, scratch.path());

    assert_eq!(None, downloader.download_book(&request(&site, "Gone")).unwrap());
    assert_eq!(0, std::fs::read_dir(scratch.path()).unwrap().count());
}

#[test]
fn test_unreachable_site_yields_no_book() {
    let site = Site::parse("http://127.0.0.1:1/").unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();
    let downloader = BookDownloader::new(&client, &site, scratch.path());
    let request = BookRequest {
        id: "1".to_string(),
        url: site.reader_url("1").unwrap(),
        title: "Title".to_string(),
        author: String::new(),
        description: String::new(),
        language: "English".to_string(),
    };

    assert_eq!(None, downloader.download_book(&request).unwrap());
}

#[test]
fn test_no_flipper_icons_without_view_container() {
    let mut server = mockito::Server::new();
    let _page = server
        .mock("GET", "/reader.php")
        .match_query(Matcher::Any)
        .with_body("<html><body><div class='page'><img src='/upload/page1.png'></div></body></html>")
        .create();
    let _png = server.mock("GET", "/upload/page1.png").with_body("png").create();
    let icons = server.mock("GET", Matcher::Regex(r"^/img/".to_string())).expect(0).create();

    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();
    let downloader = BookDownloader::new(&client, &site, scratch.path());

    let book = downloader.download_book(&request(&site, "Plain")).unwrap().expect("book should be packaged");

    let archive = std::fs::File::open(&book.archive).unwrap();
    let mut names: Vec<_> = zip::ZipArchive::new(archive).unwrap().file_names().map(String::from).collect();
    names.sort();
    assert_eq!(vec!["0_page1.png", "index.html"], names);
    icons.assert();
}
