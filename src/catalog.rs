//! The site's list of books.
//!
//! The home page materializes the catalog in page-global script variables:
//! `bookItems` holds the book records and `languages` the markup of the language picker.
//! Both are read straight out of the page source, no script is executed.

use crate::cached_client::CachedClient;
use crate::site::Site;
use easy_error::{err_msg, Error, ResultExt};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use scraper::{Html, Selector};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref OPTION_SELECTOR: Selector = Selector::parse("option[value]").unwrap();
    static ref LEVEL_IN_TITLE_REGEX: Regex = Regex::new(r"\(Level .\)").unwrap();
}

/// Seed used when subsampling, so test runs pick the same books every time.
pub const SAMPLE_SEED: u64 = 42;

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(string) => string,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => flag,
        Value::Number(number) => number.as_i64().map_or(false, |n| n != 0),
        Value::String(string) => matches!(string.trim(), "1" | "true" | "yes"),
        _ => false,
    })
}

/// One entry of `bookItems`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BookRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub people: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub level: String,
    /// Comma separated language ids.
    #[serde(default)]
    pub lang: String,
    #[serde(default, deserialize_with = "flag")]
    pub approved: bool,
}

impl BookRecord {
    /// Unescaped title without the `(Level N)` the site appends.
    pub fn display_title(&self) -> String {
        let title = html_escape::decode_html_entities(&self.title);
        LEVEL_IN_TITLE_REGEX.replace_all(&title, "").trim().to_string()
    }

    pub fn display_author(&self) -> String {
        format!("{}; Others: {}", self.author, self.people)
    }

    pub fn description(&self) -> String {
        html_escape::decode_html_entities(&self.summary).to_string()
    }

    pub fn language_ids(&self) -> impl Iterator<Item = &str> {
        self.lang.split(',').map(str::trim).filter(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub books: Vec<BookRecord>,
    /// Site language id → language name.
    pub languages: HashMap<String, String>,
}

impl Catalog {
    /// Names of the languages `record` is available in; unknown ids are skipped.
    pub fn languages_of(&self, record: &BookRecord) -> Vec<String> {
        record
            .language_ids()
            .filter_map(|id| match self.languages.get(id) {
                Some(name) => Some(name.clone()),
                None => {
                    warn!("Book {} has unknown language id {id}", record.id);
                    None
                }
            })
            .collect()
    }
}

/// Anything able to list the books of the site.
pub trait CatalogSource {
    fn fetch_catalog(&self) -> Result<Catalog, Error>;
}

/// Reads the catalog from the script variables embedded in the home page.
pub struct ScriptCatalog<'a> {
    client: &'a CachedClient,
    site: &'a Site,
}

impl<'a> ScriptCatalog<'a> {
    pub fn new(client: &'a CachedClient, site: &'a Site) -> Self {
        Self { client, site }
    }
}

impl<'a> CatalogSource for ScriptCatalog<'a> {
    fn fetch_catalog(&self) -> Result<Catalog, Error> {
        let home = self.site.origin();
        // The catalog changes over time, unlike the books themselves.
        let (status, body) = self.client.fetch_uncached(home)?;
        if !status.is_success() {
            return Err(err_msg(format!("Could not load the catalog from {home}: HTTP {status}")));
        }
        let catalog = parse_catalog(&String::from_utf8_lossy(&body))?;
        info!("Catalog lists {} books in {} languages", catalog.books.len(), catalog.languages.len());
        Ok(catalog)
    }
}

/// Parses the JSON literal assigned to the page-global script variable `name`.
pub fn script_variable<T: DeserializeOwned>(page: &str, name: &str) -> Result<T, Error> {
    let pattern = Regex::new(&format!(r#"\b{}\s*=\s*[\[{{"]"#, regex::escape(name)))
        .context(format!("Invalid variable name {name}"))?;
    let assignment = pattern
        .find(page)
        .ok_or_else(|| err_msg(format!("No assignment to {name} in page")))?;
    // The match ends with the first character of the literal.
    let literal = &page[assignment.end() - 1..];

    serde_json::Deserializer::from_str(literal)
        .into_iter::<T>()
        .next()
        .ok_or_else(|| err_msg(format!("Empty value of {name}")))?
        .context(format!("Could not parse value of {name}"))
}

/// Site language id → name, from `<option value="id">Name</option>` markup.
pub fn parse_languages(options: &str) -> HashMap<String, String> {
    Html::parse_fragment(options)
        .select(&OPTION_SELECTOR)
        .filter_map(|option| {
            let id = option.value().attr("value")?.trim().to_string();
            let name = option.text().collect::<String>().trim().to_string();
            Some((id, name))
        })
        .collect()
}

pub fn parse_catalog(page: &str) -> Result<Catalog, Error> {
    let books = script_variable::<Vec<BookRecord>>(page, "bookItems")?;
    let languages = parse_languages(&script_variable::<String>(page, "languages")?);
    Ok(Catalog { books, languages })
}

/// Drops repeated ids. The first record wins, unless a later duplicate is approved
/// and the kept one is not, in which case the approved one takes its place.
pub fn dedup_records(records: Vec<BookRecord>) -> Vec<BookRecord> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<BookRecord> = Vec::new();

    for record in records {
        match positions.get(&record.id) {
            Some(&position) => {
                if record.approved && !unique[position].approved {
                    unique[position] = record;
                }
            }
            None => {
                positions.insert(record.id.clone(), unique.len());
                unique.push(record);
            }
        }
    }

    unique
}

/// A reproducible random subset of `size` records.
pub fn sample_records(records: Vec<BookRecord>, size: usize) -> Vec<BookRecord> {
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let amount = size.min(records.len());
    let chosen: HashSet<usize> = rand::seq::index::sample(&mut rng, records.len(), amount).into_iter().collect();
    records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| chosen.contains(index))
        .map(|(_, record)| record)
        .collect()
}

#[cfg(test)]
fn record(id: &str, approved: bool, level: &str) -> BookRecord {
    BookRecord {
        id: id.to_string(),
        title: format!("Book {id}"),
        author: String::new(),
        people: String::new(),
        summary: String::new(),
        level: level.to_string(),
        lang: "1".to_string(),
        approved,
    }
}

#[test]
fn test_parse_catalog_from_home_page() {
    let page = r#"<html><head><script>
        var total = 2;
        var bookItems = [{"id": 16451, "title": "Tortoise &amp; Hare (Level 2)", "author": "Jane", "people": "John",
                          "summary": "Fast &amp; slow", "level": 2, "lang": "1, 7,"},
                         {"id": "99", "title": "Ants [x]", "level": "1", "lang": "7", "approved": "1"}];
        if (bookItems == null) {}
        var languages = "<option value=\"1\">English</option><option value=\"7\"> isiZulu </option>";
    </script></head></html>"#;

    let catalog = parse_catalog(page).unwrap();
    assert_eq!(2, catalog.books.len());

    let first = &catalog.books[0];
    assert_eq!("16451", first.id);
    assert_eq!("2", first.level);
    assert_eq!("Tortoise & Hare", first.display_title());
    assert_eq!("Jane; Others: John", first.display_author());
    assert_eq!("Fast & slow", first.description());
    assert_eq!(vec!["English", "isiZulu"], catalog.languages_of(first));
    assert!(!first.approved);

    let second = &catalog.books[1];
    assert_eq!("Ants [x]", second.display_title());
    assert!(second.approved);
}

#[test]
fn test_missing_catalog_is_an_error() {
    assert!(parse_catalog("<html><body>Maintenance</body></html>").is_err());
}

#[test]
fn test_unknown_language_skipped() {
    let catalog = Catalog {
        books: Vec::new(),
        languages: HashMap::from([("1".to_string(), "English".to_string())]),
    };
    let mut book = record("5", false, "1");
    book.lang = "1,42".to_string();
    assert_eq!(vec!["English"], catalog.languages_of(&book));
}

#[test]
fn test_dedup_first_seen_wins() {
    let records = vec![record("1", false, "1"), record("2", false, "1"), record("1", false, "3")];
    let unique = dedup_records(records);
    assert_eq!(vec![record("1", false, "1"), record("2", false, "1")], unique);
}

#[test]
fn test_dedup_approved_overrides() {
    let records = vec![record("1", false, "1"), record("2", true, "1"), record("1", true, "3"), record("2", false, "4")];
    let unique = dedup_records(records);
    assert_eq!(vec![record("1", true, "3"), record("2", true, "1")], unique);
}

#[test]
fn test_sample_is_reproducible() {
    let records: Vec<_> = (0..50).map(|i| record(&i.to_string(), false, "1")).collect();
    let first = sample_records(records.clone(), 5);
    let second = sample_records(records.clone(), 5);
    assert_eq!(5, first.len());
    assert_eq!(first, second);
    assert_eq!(50, sample_records(records, 80).len());
}
