use easy_error::{Error, ResultExt};
use reqwest::Url;

pub const DEFAULT_ORIGIN: &str = "http://www.africanstorybook.org/";

/// Sent with every request; the site serves a degraded page to unknown agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:20.0) Gecko/20100101 Firefox/20.0";

/// The storybook site all relative references are resolved against.
#[derive(Clone, Debug)]
pub struct Site {
    origin: Url,
}

impl Site {
    pub fn new(origin: Url) -> Self {
        Self { origin }
    }

    pub fn parse(origin: &str) -> Result<Self, Error> {
        let origin = Url::parse(origin).context(format!("Invalid site origin '{origin}'"))?;
        Ok(Self::new(origin))
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Turns a reference found in a page into a fully-qualified URL:
    ///  - `//host/path` takes the scheme of the origin,
    ///  - `/path` and bare `path` are both taken from the root of the origin,
    ///  - absolute URLs are kept as they are.
    pub fn resolve(&self, reference: &str) -> Result<Url, Error> {
        let reference = reference.trim();
        let root = self.origin.join("/").context(format!("Cannot find root of {}", self.origin))?;
        root.join(reference).context(format!("Could not resolve url '{reference}'"))
    }

    /// Location of the interactive reader for one book.
    pub fn reader_url(&self, book_id: &str) -> Result<Url, Error> {
        self.resolve(&format!("reader.php?id={book_id}"))
    }

    /// Location of the site's own EPUB export for one book.
    pub fn epub_url(&self, book_id: &str) -> Result<Url, Error> {
        self.resolve(&format!("myspace/publish/epub.php?id={book_id}"))
    }
}

impl Default for Site {
    fn default() -> Self {
        // The constant is known to be a valid absolute URL.
        Self::parse(DEFAULT_ORIGIN).unwrap()
    }
}

#[test]
fn test_resolve_protocol_relative() {
    let site = Site::default();
    assert_eq!(
        "http://fonts.googleapis.com/css?family=Andika",
        site.resolve("//fonts.googleapis.com/css?family=Andika").unwrap().as_str()
    );
}

#[test]
fn test_resolve_root_relative() {
    let site = Site::default();
    assert_eq!(
        "http://www.africanstorybook.org/img/left.png",
        site.resolve("/img/left.png").unwrap().as_str()
    );
}

#[test]
fn test_resolve_bare_relative() {
    let site = Site::parse("http://www.africanstorybook.org/some/deep/page.php").unwrap();
    assert_eq!(
        "http://www.africanstorybook.org/css/app.min.css",
        site.resolve("css/app.min.css").unwrap().as_str()
    );
}

#[test]
fn test_resolve_absolute() {
    let site = Site::default();
    assert_eq!(
        "https://cdn.example.org/x.js",
        site.resolve(" https://cdn.example.org/x.js ").unwrap().as_str()
    );
}

#[test]
fn test_reader_url() {
    let site = Site::default();
    assert_eq!(
        "http://www.africanstorybook.org/reader.php?id=16451",
        site.reader_url("16451").unwrap().as_str()
    );
}
