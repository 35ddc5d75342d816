use crate::book::PackagedBook;
use easy_error::{Error, ResultExt};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const CHANNEL_SOURCE_DOMAIN: &str = "www.africanstorybook.org";
pub const CHANNEL_SOURCE_ID: &str = "african-storybook";
pub const CHANNEL_TITLE: &str = "African Storybook Library (multiple languages)";
pub const CHANNEL_DESCRIPTION: &str = "Library of picture storybooks in all the languages of African countries, designed to promote basic literacy and reading for learners of young ages and varying literacy levels.";

/// The site lists a couple of books under a language literally called "0".
const BOGUS_LANGUAGE: &str = "0";

#[derive(Debug, Serialize, PartialEq)]
pub struct LevelTopic {
    pub source_id: String,
    pub title: String,
    pub books: Vec<PackagedBook>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LanguageTopic {
    pub source_id: String,
    pub title: String,
    pub levels: Vec<LevelTopic>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Channel {
    pub source_domain: &'static str,
    pub source_id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub language: &'static str,
    pub languages: Vec<LanguageTopic>,
}

/// Collects packaged books by language and reading level.
#[derive(Debug, Default)]
pub struct TopicTree {
    books: BTreeMap<String, BTreeMap<String, Vec<PackagedBook>>>,
}

impl TopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, level: &str, book: PackagedBook) {
        self.books
            .entry(book.language.clone())
            .or_default()
            .entry(level.to_string())
            .or_default()
            .push(book);
    }

    pub fn len(&self) -> usize {
        self.books.values().flat_map(|levels| levels.values()).map(Vec::len).sum()
    }

    /// The channel with languages and levels in sorted order.
    pub fn build(self) -> Channel {
        let languages = self
            .books
            .into_iter()
            .filter(|(language, _)| {
                if language == BOGUS_LANGUAGE {
                    info!("Skipping language {BOGUS_LANGUAGE}");
                }
                language != BOGUS_LANGUAGE
            })
            .map(|(language, levels)| {
                debug!("LANGUAGE {language}");
                LanguageTopic {
                    source_id: language.clone(),
                    title: language,
                    levels: levels
                        .into_iter()
                        .map(|(level, books)| LevelTopic {
                            title: format!("Level {level}"),
                            source_id: level,
                            books,
                        })
                        .collect(),
                }
            })
            .collect();

        Channel {
            source_domain: CHANNEL_SOURCE_DOMAIN,
            source_id: CHANNEL_SOURCE_ID,
            title: CHANNEL_TITLE,
            description: CHANNEL_DESCRIPTION,
            language: "mul",
            languages,
        }
    }
}

/// Stores the channel as pretty JSON for the upload step.
pub fn write_manifest(channel: &Channel, path: &Path) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(channel).context("Could not serialize channel")?;
    std::fs::write(path, json).context(format!("Could not write {path:?}"))?;
    info!("Wrote channel tree to {path:?}");
    Ok(())
}

#[cfg(test)]
fn packaged(id: &str, language: &str) -> PackagedBook {
    PackagedBook {
        source_id: format!("{id}|{language}"),
        title: format!("Book {id}"),
        author: String::new(),
        description: String::new(),
        license_holder: String::new(),
        language: language.to_string(),
        archive: format!("/tmp/{id}.zip").into(),
        thumbnail: None,
    }
}

#[test]
fn test_tree_sorted_by_language_and_level() {
    let mut tree = TopicTree::new();
    tree.add("2", packaged("1", "isiZulu"));
    tree.add("1", packaged("2", "English"));
    tree.add("3", packaged("3", "English"));
    tree.add("1", packaged("4", "English"));
    tree.add("1", packaged("5", "0"));
    assert_eq!(5, tree.len());

    let channel = tree.build();
    let languages: Vec<_> = channel.languages.iter().map(|language| language.title.as_str()).collect();
    assert_eq!(vec!["English", "isiZulu"], languages);

    let english = &channel.languages[0];
    let levels: Vec<_> = english.levels.iter().map(|level| level.title.as_str()).collect();
    assert_eq!(vec!["Level 1", "Level 3"], levels);
    let ids: Vec<_> = english.levels[0].books.iter().map(|book| book.source_id.as_str()).collect();
    assert_eq!(vec!["2|English", "4|English"], ids);
}

#[test]
fn test_write_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = TopicTree::new();
    tree.add("1", packaged("7", "English"));
    let path = dir.path().join("channel_tree.json");

    write_manifest(&tree.build(), &path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!("mul", json["language"]);
    assert_eq!("7|English", json["languages"][0]["levels"][0]["books"][0]["source_id"]);
    assert_eq!("/tmp/7.zip", json["languages"][0]["levels"][0]["books"][0]["archive"]);
}
