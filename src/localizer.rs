use crate::cached_client::CachedClient;
use crate::dom_manipulation::{html_attr_name, select_ids, DomOperation, MutableDom};
use crate::rewriter::{self, FontReference};
use crate::site::Site;
use easy_error::{Error, ResultExt};
use log::{debug, info, warn};
use regex::{NoExpand, Regex};
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref IMAGE_SELECTOR: Selector = Selector::parse("img[src]").unwrap();
    static ref STYLESHEET_SELECTOR: Selector = Selector::parse("link[href]").unwrap();
    static ref SCRIPT_SELECTOR: Selector = Selector::parse("script[src]").unwrap();
    static ref BACKGROUND_SELECTOR: Selector = Selector::parse(r#"[style*="background-image"]"#).unwrap();
    static ref BACKGROUND_IMAGE_REGEX: Regex =
        Regex::new(r#"background-image:\s*url\(\s*['"]?([^'")]*)['"]?\s*\)"#).unwrap();
}

/// Class marking the page whose picture doubles as the book's thumbnail.
pub const COVER_IMAGE_CLASS: &str = "cover-image";

/// The kinds of external references a book page carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Stylesheet,
    Script,
    BackgroundImage,
}

impl AssetKind {
    fn selector(&self) -> &'static Selector {
        match self {
            AssetKind::Image => &IMAGE_SELECTOR,
            AssetKind::Stylesheet => &STYLESHEET_SELECTOR,
            AssetKind::Script => &SCRIPT_SELECTOR,
            AssetKind::BackgroundImage => &BACKGROUND_SELECTOR,
        }
    }

    fn attribute(&self) -> &'static str {
        match self {
            AssetKind::Image | AssetKind::Script => "src",
            AssetKind::Stylesheet => "href",
            AssetKind::BackgroundImage => "style",
        }
    }

    /// Adjustment of the resolved URL before it is fetched.
    fn rewrite_url(&self, url: Url) -> Url {
        match self {
            AssetKind::Stylesheet => rewriter::prefer_unminified_stylesheet(url),
            _ => url,
        }
    }
}

/// A reference to an external resource found in a page.
#[derive(Debug)]
pub struct AssetReference {
    pub kind: AssetKind,
    pub node_id: ego_tree::NodeId,
    /// For background images this is the URL inside `url(...)`, not the whole `style`.
    pub original: String,
    pub is_cover: bool,
}

/// All references of one kind, in document order.
pub fn collect_references(doc: &Html, kind: AssetKind) -> Vec<AssetReference> {
    select_ids(doc, kind.selector())
        .into_iter()
        .filter_map(|node_id| {
            let node = doc.tree.get(node_id)?;
            let elem = node.value().as_element()?;
            let value = elem.attr(kind.attribute())?;
            let original = match kind {
                AssetKind::BackgroundImage => BACKGROUND_IMAGE_REGEX.captures(value)?.get(1)?.as_str(),
                _ => value,
            };
            Some(AssetReference {
                kind,
                node_id,
                original: original.trim().to_string(),
                is_cover: elem.classes().any(|class| class == COVER_IMAGE_CLASS),
            })
        })
        .collect()
}

/// Keeps only characters that are safe both in a file name and in an unescaped URL.
fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if sanitized.trim_matches('.').is_empty() {
        "asset".to_string()
    } else {
        sanitized
    }
}

/// `{ordinal}_{basename}`, the basename taken from the URL path without query or fragment.
pub fn local_filename(ordinal: usize, url: &Url) -> String {
    let basename = url
        .path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .unwrap_or("");
    format!("{ordinal}_{}", sanitize_filename(basename))
}

/// Staging directory holding a book's rewritten page and every asset it references.
pub struct Bundle {
    dir: PathBuf,
    /// File name → URL it was downloaded from.
    files: HashMap<String, Url>,
}

impl Bundle {
    /// Opens a fresh, uniquely named bundle directory inside `scratch_dir`.
    /// The directory is kept on disk; the caller decides when to discard it.
    pub fn create(scratch_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(scratch_dir).context(format!("Could not create scratch directory {scratch_dir:?}"))?;
        let dir = tempfile::Builder::new()
            .prefix("book-")
            .tempdir_in(scratch_dir)
            .context(format!("Could not create bundle directory in {scratch_dir:?}"))?
            .keep();
        Ok(Self::at(dir))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self {
            dir,
            files: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves `name` for `url`. Should the name already belong to a different URL,
    /// an extra numeric prefix is added until it is unique.
    pub fn claim(&mut self, name: String, url: &Url) -> String {
        let mut candidate = name.clone();
        let mut counter = 0;
        loop {
            match self.files.get(&candidate) {
                None => {
                    self.files.insert(candidate.clone(), url.clone());
                    return candidate;
                }
                Some(owner) if owner == url => return candidate,
                Some(_) => {
                    candidate = format!("{counter}_{name}");
                    counter += 1;
                }
            }
        }
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf, Error> {
        let path = self.dir.join(name);
        std::fs::write(&path, contents).context(format!("Could not write {path:?}"))?;
        Ok(path)
    }
}

/// Downloads everything a book page references into its bundle and points the page at the copies.
pub struct Localizer<'a> {
    client: &'a CachedClient,
    site: &'a Site,
}

impl<'a> Localizer<'a> {
    pub fn new(client: &'a CachedClient, site: &'a Site) -> Self {
        Self { client, site }
    }

    /// Localizes images, stylesheets, scripts and background images, in that order.
    /// Returns the path of the cover picture, if the page has one.
    pub fn localize(&self, doc: &mut Html, bundle: &mut Bundle) -> Result<Option<PathBuf>, Error> {
        for kind in [AssetKind::Image, AssetKind::Stylesheet, AssetKind::Script] {
            self.localize_kind(doc, bundle, kind)?;
        }
        self.localize_backgrounds(doc, bundle)
    }

    fn resolve(&self, reference: &AssetReference) -> Option<Url> {
        if rewriter::TRACKER_URLS.iter().any(|tracker| reference.original.contains(tracker)) {
            // Left for the packager to strip.
            return None;
        }
        match self.site.resolve(&reference.original) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Some(reference.kind.rewrite_url(url)),
            // data: URIs and the like are already self-contained.
            Ok(_) => None,
            Err(err) => {
                warn!("Skipping {:?} reference '{}': {err}", reference.kind, reference.original);
                None
            }
        }
    }

    fn localize_kind(&self, doc: &mut Html, bundle: &mut Bundle, kind: AssetKind) -> Result<(), Error> {
        let mut ops = Vec::new();

        for (ordinal, reference) in collect_references(doc, kind).into_iter().enumerate() {
            let url = match self.resolve(&reference) {
                Some(url) => url,
                None => continue,
            };
            let filename = bundle.claim(local_filename(ordinal, &url), &url);

            let contents = match kind {
                AssetKind::Stylesheet => self.download_stylesheet(&url, bundle),
                AssetKind::Script => self
                    .download_text(&url)
                    .map(|script| rewriter::polyfill_local_storage(&script).into_bytes()),
                _ => self.download(&url),
            };
            // A failed download leaves an empty file so the page still only refers to the bundle.
            let contents = contents.unwrap_or_default();
            bundle.write(&filename, &contents)?;

            ops.push(DomOperation::SetAttribute {
                node_id: reference.node_id,
                attr_name: html_attr_name(kind.attribute()),
                value: filename,
            });
        }

        doc.perform_operations(ops);
        Ok(())
    }

    fn localize_backgrounds(&self, doc: &mut Html, bundle: &mut Bundle) -> Result<Option<PathBuf>, Error> {
        let mut ops = Vec::new();
        let mut thumbnail = None;

        for (ordinal, reference) in collect_references(doc, AssetKind::BackgroundImage).into_iter().enumerate() {
            let url = match self.resolve(&reference) {
                Some(url) => url,
                None => continue,
            };
            if !self.client.probe(&url) {
                warn!("Could not get image from url={url}");
                continue;
            }

            let contents = match self.download(&url) {
                Some(contents) => contents,
                None => continue,
            };
            let filename = bundle.claim(local_filename(ordinal, &url), &url);
            let path = bundle.write(&filename, &contents)?;

            let style = doc
                .tree
                .get(reference.node_id)
                .and_then(|node| node.value().as_element())
                .and_then(|elem| elem.attr("style"))
                .unwrap_or_default();
            let replacement = format!("background-image:url({filename})");
            ops.push(DomOperation::SetAttribute {
                node_id: reference.node_id,
                attr_name: html_attr_name("style"),
                value: BACKGROUND_IMAGE_REGEX.replace(style, NoExpand(&replacement)).into_owned(),
            });

            if reference.is_cover && thumbnail.is_none() {
                debug!("Using {url} as the thumbnail");
                thumbnail = Some(path);
            }
        }

        doc.perform_operations(ops);
        Ok(thumbnail)
    }

    /// Fetches a binary asset; `None` when it is unavailable.
    pub fn download(&self, url: &Url) -> Option<Vec<u8>> {
        match self.client.fetch::<Vec<u8>>(url) {
            Ok(resource) => resource.into_contents(),
            Err(err) => {
                warn!("Could not download {url}: {err}");
                None
            }
        }
    }

    fn download_text(&self, url: &Url) -> Option<String> {
        match self.client.fetch::<String>(url) {
            Ok(resource) => resource.into_contents(),
            Err(err) => {
                warn!("Could not download {url}: {err}");
                None
            }
        }
    }

    fn download_stylesheet(&self, url: &Url, bundle: &mut Bundle) -> Option<Vec<u8>> {
        let css = self.download_text(url)?;
        if !rewriter::is_primary_stylesheet(url) {
            return Some(css.into_bytes());
        }

        let rewritten = rewriter::rewrite_stylesheet(&css, |font| self.localize_font(url, font, bundle));
        Some(rewritten.into_bytes())
    }

    /// Stores a font referenced by the stylesheet at `stylesheet_url` under its bare name.
    fn localize_font(&self, stylesheet_url: &Url, font: FontReference, bundle: &mut Bundle) -> String {
        let url = match stylesheet_url.join(font.source) {
            Ok(url) => url,
            Err(err) => {
                warn!("Could not resolve font '{}' of {stylesheet_url}: {err}", font.source);
                return font.filename.to_string();
            }
        };
        let filename = bundle.claim(sanitize_filename(font.filename), &url);
        if bundle.dir().join(&filename).exists() {
            return filename;
        }

        info!("Downloading font {url}");
        let contents = self.download(&url).unwrap_or_default();
        if let Err(err) = bundle.write(&filename, &contents) {
            warn!("{err}");
        }
        filename
    }
}

#[cfg(test)]
use crate::cached_client::test_client;

#[cfg(test)]
const PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<link rel="stylesheet" href="/css/app.min.css">
<link rel="stylesheet" href="css/extra/theme.css">
<script src="//SERVER/js/app.js"></script>
<script>inline()</script>
</head><body>
<div class="views">
<img src="/img/logo.png">
<img src="/img/other/logo.png">
<img src="data:image/png;base64,AAAA">
<div class="page" style="background-image:url('/upload/page1.jpg'); background-size: cover"></div>
<div class="page cover-image" style="background-image:url(/upload/cover.jpg)"></div>
<div class="page cover-image" style="background-image:url(/upload/second.jpg)"></div>
<div class="page" style="background-image:url(/upload/gone.jpg)"></div>
</div>
</body></html>"#;

#[cfg(test)]
fn mock_site(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
    vec![
        server
            .mock("GET", "/css/app.css")
            .with_body("@font-face { src: url(../fonts/Foo.ttf) }\n.x { background: url(../images/x.png) }")
            .create(),
        server.mock("GET", "/css/extra/theme.css").with_body("body { margin: 0 }").create(),
        server.mock("GET", "/fonts/Foo.ttf").with_body("font").create(),
        server.mock("GET", "/js/app.js").with_body("window.localStorage.setItem('a', 1);").create(),
        server.mock("GET", "/img/logo.png").with_body("logo-a").create(),
        server.mock("GET", "/img/other/logo.png").with_body("logo-b").create(),
        server.mock("GET", "/upload/page1.jpg").with_body("page1").create(),
        server.mock("GET", "/upload/cover.jpg").with_body("cover").create(),
        server.mock("GET", "/upload/second.jpg").with_body("second").create(),
        server.mock("GET", "/upload/gone.jpg").with_status(404).create(),
    ]
}

#[cfg(test)]
fn localize_page() -> (Html, tempfile::TempDir, Option<PathBuf>) {
    let mut server = mockito::Server::new();
    let _mocks = mock_site(&mut server);
    let host = server.host_with_port();
    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();

    let mut doc = Html::parse_document(&PAGE.replace("SERVER", &host));
    let mut bundle = Bundle::at(scratch.path().to_path_buf());
    let thumbnail = Localizer::new(&client, &site).localize(&mut doc, &mut bundle).unwrap();

    (doc, scratch, thumbnail)
}

#[cfg(test)]
fn attr_values(doc: &Html, selector: &str, attr: &str) -> Vec<String> {
    doc.select(&Selector::parse(selector).unwrap())
        .filter_map(|elem| elem.value().attr(attr).map(String::from))
        .collect()
}

#[test]
fn test_local_filename() {
    let url = Url::parse("http://www.africanstorybook.org/upload/Big%20Cat.jpg?w=3").unwrap();
    assert_eq!("4_Big_20Cat.jpg", local_filename(4, &url));
    let root = Url::parse("http://www.africanstorybook.org/").unwrap();
    assert_eq!("0_asset", local_filename(0, &root));
}

#[test]
fn test_claim_avoids_collisions() {
    let mut bundle = Bundle::at(PathBuf::from("/nonexistent"));
    let a = Url::parse("http://x.org/a/left.png").unwrap();
    let b = Url::parse("http://x.org/b/left.png").unwrap();

    assert_eq!("left.png", bundle.claim("left.png".to_string(), &a));
    assert_eq!("left.png", bundle.claim("left.png".to_string(), &a));
    assert_eq!("0_left.png", bundle.claim("left.png".to_string(), &b));
}

#[test]
fn test_references_point_into_bundle() {
    let (doc, scratch, _) = localize_page();

    let mut references = attr_values(&doc, "img[src]", "src");
    references.retain(|src| !src.starts_with("data:"));
    references.extend(attr_values(&doc, "link[href]", "href"));
    references.extend(attr_values(&doc, "script[src]", "src"));
    assert_eq!(
        vec!["0_logo.png", "1_logo.png", "0_app.css", "1_theme.css", "0_app.js"],
        references
    );
    for name in &references {
        assert!(scratch.path().join(name).exists(), "{name} missing from bundle");
    }

    assert_eq!(b"logo-a".to_vec(), std::fs::read(scratch.path().join("0_logo.png")).unwrap());
    assert_eq!(b"logo-b".to_vec(), std::fs::read(scratch.path().join("1_logo.png")).unwrap());
    assert_eq!(vec!["data:image/png;base64,AAAA"], attr_values(&doc, "img[src^='data:']", "src"));
}

#[test]
fn test_primary_stylesheet_is_rewritten() {
    let (_, scratch, _) = localize_page();

    let css = std::fs::read_to_string(scratch.path().join("0_app.css")).unwrap();
    assert!(css.starts_with("@font-face { src: url('Foo.ttf') }\n.x { background: url(\"\") }"));
    assert_eq!(b"font".to_vec(), std::fs::read(scratch.path().join("Foo.ttf")).unwrap());

    let other = std::fs::read_to_string(scratch.path().join("1_theme.css")).unwrap();
    assert_eq!("body { margin: 0 }", other);
}

#[test]
fn test_scripts_are_polyfilled() {
    let (_, scratch, _) = localize_page();

    let js = std::fs::read_to_string(scratch.path().join("0_app.js")).unwrap();
    assert_eq!(format!("{}.setItem('a', 1);", rewriter::LOCAL_STORAGE_STUB), js);
}

#[test]
fn test_background_images_and_thumbnail() {
    let (doc, scratch, thumbnail) = localize_page();

    assert_eq!(
        vec![
            "background-image:url(0_page1.jpg); background-size: cover",
            "background-image:url(1_cover.jpg)",
            "background-image:url(2_second.jpg)",
            "background-image:url(/upload/gone.jpg)",
        ],
        attr_values(&doc, "div.page", "style")
    );
    assert!(scratch.path().join("0_page1.jpg").exists());
    assert!(!scratch.path().join("3_gone.jpg").exists());
    assert_eq!(Some(scratch.path().join("1_cover.jpg")), thumbnail);
}

#[test]
fn test_failed_downloads_leave_empty_placeholders() {
    let mut server = mockito::Server::new();
    let _ok = server.mock("GET", "/img/ok.png").with_body("ok").create();
    let _missing = server.mock("GET", "/img/missing.png").with_status(404).create();
    let _css = server.mock("GET", "/css/theme.css").with_body("p {}").create();
    let site = Site::parse(&format!("{}/", server.url())).unwrap();
    let client = test_client(None);
    let scratch = tempfile::tempdir().unwrap();

    // Nothing listens on port 1, so the script is refused on every attempt.
    let mut doc = Html::parse_document(
        r#"<html><head><link rel="stylesheet" href="/css/theme.css"><script src="http://127.0.0.1:1/js/app.js"></script></head>
<body><img src="/img/ok.png"><img src="/img/missing.png"></body></html>"#,
    );
    let mut bundle = Bundle::at(scratch.path().to_path_buf());
    let thumbnail = Localizer::new(&client, &site).localize(&mut doc, &mut bundle).unwrap();

    assert_eq!(None, thumbnail);
    assert_eq!(vec!["0_ok.png", "1_missing.png"], attr_values(&doc, "img[src]", "src"));
    assert_eq!(vec!["0_app.js"], attr_values(&doc, "script[src]", "src"));
    assert_eq!(vec!["0_theme.css"], attr_values(&doc, "link[href]", "href"));

    assert_eq!(b"ok".to_vec(), std::fs::read(scratch.path().join("0_ok.png")).unwrap());
    assert_eq!(b"p {}".to_vec(), std::fs::read(scratch.path().join("0_theme.css")).unwrap());
    assert!(std::fs::read(scratch.path().join("1_missing.png")).unwrap().is_empty());
    assert!(std::fs::read(scratch.path().join("0_app.js")).unwrap().is_empty());
}
