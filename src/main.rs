#[macro_use]
extern crate lazy_static;

mod book;
mod cached_client;
mod catalog;
mod dom_manipulation;
mod ebook;
mod localizer;
mod navigation;
mod packager;
mod rewriter;
mod site;
mod tree;

use book::{BookDownloader, BookRequest, PackagedBook};
use cached_client::{CachedClient, RetryPolicy};
use catalog::{BookRecord, Catalog, CatalogSource, ScriptCatalog};
use directories::ProjectDirs;
use easy_error::{err_msg, Error, ResultExt};
use ebook::EbookDownloads;
use log::{error, info, warn};
use site::Site;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;
use tree::TopicTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// Zipped HTML bundle built from the interactive reader.
    Html,
    /// The EPUB export offered by the site.
    Epub,
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(format: &str) -> Result<Self, Error> {
        match format {
            "html" => Ok(Format::Html),
            "epub" => Ok(Format::Epub),
            other => Err(err_msg(format!("Unknown format '{other}', expected html or epub"))),
        }
    }
}

/// Packages the picture storybooks of the African Storybook website for offline use,
/// organised by language and reading level.
#[derive(StructOpt)]
struct Args {
    /// Only process a random sample of this many books (the same sample on every run).
    #[structopt(short, long)]
    sample: Option<usize>,
    /// Package format: html or epub.
    #[structopt(short, long, default_value = "html")]
    format: Format,
    /// Site to scrape.
    #[structopt(long, default_value = "http://www.africanstorybook.org/")]
    origin: String,
    /// Where HTTP responses are cached. Defaults to the user's cache directory.
    #[structopt(long, parse(from_os_str))]
    cache_dir: Option<PathBuf>,
    /// Do not cache HTTP responses at all.
    #[structopt(long)]
    no_cache: bool,
    /// Output directory for bundles, downloads and the channel tree.
    #[structopt(short, long, parse(from_os_str), default_value = "chefdata")]
    output: PathBuf,
    /// Request timeout in seconds.
    #[structopt(long, default_value = "60")]
    timeout: u64,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Args::from_args())
}

fn cache_dir(args: &Args) -> Option<PathBuf> {
    if args.no_cache {
        return None;
    }
    args.cache_dir.clone().or_else(|| {
        ProjectDirs::from("org", "africanstorybook", "storybook-scraper").map(|dirs| dirs.cache_dir().to_path_buf())
    })
}

fn run(args: Args) -> Result<(), Error> {
    let cache_dir = cache_dir(&args);
    if let Some(ref cache_path) = cache_dir {
        info!("Using cache directory: {:?}", cache_path);
    }

    let site = Site::parse(&args.origin)?;
    let client = CachedClient::new(cache_dir, Duration::from_secs(args.timeout), RetryPolicy::default())?;
    std::fs::create_dir_all(&args.output).context(format!("Could not create {:?}", args.output))?;

    // Without a catalog there is nothing to build.
    let catalog = ScriptCatalog::new(&client, &site)
        .fetch_catalog()
        .context("Could not read the book catalog")?;

    let mut records = catalog::dedup_records(catalog.books.clone());
    if let Some(size) = args.sample {
        records = catalog::sample_records(records, size);
    }

    let tree = match args.format {
        Format::Html => {
            let downloader = BookDownloader::new(&client, &site, args.output.join("tmp"));
            build_tree(&catalog, &records, &site, |request| downloader.download_book(request))
        }
        Format::Epub => {
            let downloads = EbookDownloads::new(&client, &site, args.output.join("epub"), ebook::DEFAULT_PREFIX)?;
            build_tree(&catalog, &records, &site, |request| {
                Ok(downloads
                    .fetch(&request.id)?
                    .map(|path| PackagedBook::new(request, book::DEFAULT_COPYRIGHT_HOLDER, path, None)))
            })
        }
    };

    info!("Packaged {} books", tree.len());
    tree::write_manifest(&tree.build(), &args.output.join("channel_tree.json"))
}

/// Processes the books one after the other; a failing book is logged and left out.
fn build_tree<F>(catalog: &Catalog, records: &[BookRecord], site: &Site, mut package: F) -> TopicTree
where
    F: FnMut(&BookRequest) -> Result<Option<PackagedBook>, Error>,
{
    let mut tree = TopicTree::new();
    let total = records.len();

    for (i, record) in records.iter().enumerate() {
        let url = match site.reader_url(&record.id) {
            Ok(url) => url,
            Err(err) => {
                error!("Skipping book {}: {err}", record.id);
                continue;
            }
        };
        info!("Downloading book {} of {total} from url {url}", i + 1);

        let title = record.display_title();
        for language in catalog.languages_of(record) {
            let request = BookRequest {
                id: record.id.clone(),
                url: url.clone(),
                title: title.clone(),
                author: record.display_author(),
                description: record.description(),
                language: language.clone(),
            };
            match package(&request) {
                Ok(Some(book)) => {
                    info!("... downloaded a Level {} {language} book titled {title}", record.level);
                    tree.add(&record.level, book);
                }
                Ok(None) => warn!("... book {} not found in {language}", record.id),
                Err(err) => error!("... book {} in {language} failed: {err}", record.id),
            }
        }
    }

    tree
}

#[test]
fn test_format_from_str() {
    assert_eq!(Format::Html, "html".parse().unwrap());
    assert_eq!(Format::Epub, "epub".parse().unwrap());
    assert!("pdf".parse::<Format>().is_err());
}

#[test]
fn test_failing_book_does_not_stop_the_batch() {
    let site = Site::default();
    let catalog = Catalog {
        books: Vec::new(),
        languages: std::collections::HashMap::from([
            ("1".to_string(), "English".to_string()),
            ("2".to_string(), "Kiswahili".to_string()),
        ]),
    };
    let records: Vec<BookRecord> = serde_json::from_str(
        r#"[{"id": 1, "title": "Broken", "level": 1, "lang": "1"},
            {"id": 2, "title": "Gone", "level": 1, "lang": "1"},
            {"id": 3, "title": "Fine", "level": 2, "lang": "1,2"}]"#,
    )
    .unwrap();

    let tree = build_tree(&catalog, &records, &site, |request| match request.id.as_str() {
        "1" => Err(err_msg("network down")),
        "2" => Ok(None),
        _ => Ok(Some(PackagedBook::new(request, "Someone", PathBuf::from("/tmp/3.zip"), None))),
    });

    assert_eq!(2, tree.len());
    let channel = tree.build();
    let languages: Vec<_> = channel.languages.iter().map(|language| language.title.as_str()).collect();
    assert_eq!(vec!["English", "Kiswahili"], languages);
    assert_eq!("Level 2", channel.languages[0].levels[0].title);
}
