//! Text-level transforms applied to downloaded stylesheets, scripts and the final page.
//!
//! The site uses one fixed template, so a handful of regular expressions
//! covers everything that needs patching; no CSS or JavaScript parser is involved.

use regex::{Captures, Regex};
use reqwest::Url;

/// File name of the application stylesheet that gets the font and sizing treatment.
pub const PRIMARY_STYLESHEET: &str = "app.css";

const MINIFIED_STYLESHEET: &str = "app.min.css";

/// Appended to the primary stylesheet so pages fit on short screens.
const FONT_SIZING_CSS: &str = include_str!("../resources/font_sizing.css");

/// Stands in for `window.localStorage`, which framed content cannot access.
pub const LOCAL_STORAGE_STUB: &str = "({setItem: function(){}, removeItem: function(){}})";

/// Third-party scripts removed from the final page.
pub const TRACKER_URLS: &[&str] = &[
    "//www.google-analytics.com/analytics.js",
    "js-agent.newrelic.com/nr-1044.min.js",
    "//connect.facebook.net/en_US/sdk.js",
];

lazy_static! {
    /// `url(../fonts/Foo.ttf)`, quoted or not. Group 1 is everything inside `url(...)`,
    /// group 2 the part after `fonts/`.
    static ref FONT_URL_REGEX: Regex =
        Regex::new(r#"url\(\s*['"]?([^'")]*?fonts/([^'")]+?))['"]?\s*\)"#).unwrap();
    /// `url(../images/...)` and friends; those do not exist in the bundle.
    static ref UP_DIR_IMAGE_REGEX: Regex = Regex::new(r#"url\(\s*['"]?\.\./im[^)]*\)"#).unwrap();
}

/// The minified stylesheet lacks the image rules the pages need, fetch the original instead.
pub fn prefer_unminified_stylesheet(mut url: Url) -> Url {
    if url.path().ends_with(MINIFIED_STYLESHEET) {
        let path = url.path().replace(MINIFIED_STYLESHEET, PRIMARY_STYLESHEET);
        url.set_path(&path);
    }
    url
}

pub fn is_primary_stylesheet(url: &Url) -> bool {
    url.path_segments()
        .and_then(|segments| segments.last())
        .map_or(false, |name| name == PRIMARY_STYLESHEET)
}

/// A font referenced from a stylesheet.
#[derive(Debug, PartialEq, Eq)]
pub struct FontReference<'a> {
    /// The reference as written inside `url(...)`, relative to the stylesheet.
    pub source: &'a str,
    /// Bare file name the font will be stored under.
    pub filename: &'a str,
}

/// Rewrites the primary stylesheet:
///  1. every font `url(...fonts/X)` becomes `url('X')`, where `X` is whatever
///     `localize_font` decided to store the font as,
///  2. `url(../images/...)` rules are emptied to `url("")`,
///  3. the font sizing rules are appended.
pub fn rewrite_stylesheet<F>(css: &str, mut localize_font: F) -> String
where
    F: FnMut(FontReference) -> String,
{
    let with_fonts = FONT_URL_REGEX.replace_all(css, |captures: &Captures| {
        let source = captures.get(1).map_or("", |m| m.as_str());
        let full_name = captures.get(2).map_or("", |m| m.as_str());
        // `Foo.eot?#iefix` is stored as `Foo.eot`; the suffix stays in the stylesheet.
        let filename = full_name.split(['?', '#']).next().unwrap_or(full_name);
        let local = localize_font(FontReference { source, filename });
        let suffix = &full_name[filename.len()..];
        format!("url('{local}{suffix}')")
    });

    let without_images = UP_DIR_IMAGE_REGEX.replace_all(&with_fonts, r#"url("")"#);

    without_images.into_owned() + FONT_SIZING_CSS
}

/// Replaces every use of the browser's local storage with a harmless stand-in.
pub fn polyfill_local_storage(script: &str) -> String {
    script.replace("window.localStorage", LOCAL_STORAGE_STUB)
}

/// Literal removal of third-party script locations from serialized markup.
pub fn strip_trackers(html: &str) -> String {
    TRACKER_URLS
        .iter()
        .fold(html.to_string(), |html, tracker| html.replace(tracker, ""))
}

#[test]
fn test_prefer_unminified_stylesheet() {
    let url = Url::parse("http://www.africanstorybook.org/css/app.min.css?v=2").unwrap();
    assert_eq!(
        "http://www.africanstorybook.org/css/app.css?v=2",
        prefer_unminified_stylesheet(url).as_str()
    );

    let other = Url::parse("http://www.africanstorybook.org/css/framework7.min.css").unwrap();
    assert_eq!(
        "http://www.africanstorybook.org/css/framework7.min.css",
        prefer_unminified_stylesheet(other).as_str()
    );
}

#[test]
fn test_is_primary_stylesheet() {
    assert!(is_primary_stylesheet(&Url::parse("http://x.org/css/app.css").unwrap()));
    assert!(!is_primary_stylesheet(&Url::parse("http://x.org/css/myapp.css").unwrap()));
    assert!(!is_primary_stylesheet(&Url::parse("http://x.org/app.css/other.css").unwrap()));
}

#[test]
fn test_rewrite_font_face() {
    let css = "@font-face { font-family: Foo; src: url(../fonts/Foo.ttf) }";
    let mut seen = Vec::new();
    let rewritten = rewrite_stylesheet(css, |font| {
        seen.push((font.source.to_string(), font.filename.to_string()));
        font.filename.to_string()
    });

    assert!(rewritten.starts_with("@font-face { font-family: Foo; src: url('Foo.ttf') }"));
    assert_eq!(vec![("../fonts/Foo.ttf".to_string(), "Foo.ttf".to_string())], seen);
}

#[test]
fn test_rewrite_font_keeps_query_suffix() {
    let css = r#"src: url("../fonts/Andika.eot?#iefix") format("embedded-opentype"), url('../fonts/Andika.woff') format("woff");"#;
    let rewritten = rewrite_stylesheet(css, |font| font.filename.to_string());

    assert!(rewritten.starts_with(
        r#"src: url('Andika.eot?#iefix') format("embedded-opentype"), url('Andika.woff') format("woff");"#
    ));
}

#[test]
fn test_rewrite_strips_up_dir_images_and_appends_sizing() {
    let css = ".cover { background: url('../images/cover.png') no-repeat; }\n.logo { background: url(../img/logo.png); }";
    let rewritten = rewrite_stylesheet(css, |font| font.filename.to_string());

    assert!(rewritten.starts_with(".cover { background: url(\"\") no-repeat; }\n.logo { background: url(\"\"); }"));
    assert!(rewritten.ends_with(FONT_SIZING_CSS));
}

#[test]
fn test_polyfill_local_storage() {
    let js = "var s = window.localStorage; window.localStorage.setItem('a', 1);";
    assert_eq!(
        "var s = ({setItem: function(){}, removeItem: function(){}}); ({setItem: function(){}, removeItem: function(){}}).setItem('a', 1);",
        polyfill_local_storage(js)
    );
}

#[test]
fn test_strip_trackers() {
    let html = r#"<script src="//www.google-analytics.com/analytics.js"></script><script src="https://js-agent.newrelic.com/nr-1044.min.js"></script><script src="0_app.js"></script>"#;
    assert_eq!(
        r#"<script src=""></script><script src="https://"></script><script src="0_app.js"></script>"#,
        strip_trackers(html)
    );
}
