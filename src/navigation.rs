use crate::dom_manipulation::{DomOperation, MutableDom};
use log::warn;
use scraper::{Html, Selector};

lazy_static! {
    static ref VIEWS_SELECTOR: Selector = Selector::parse(".views").unwrap();
}

/// Share of the viewport each flipper occupies.
pub const FLIPPER_WIDTH: &str = "6%";

const ICON_STYLE: &str =
    "display: block; position: absolute; top: 50%; margin-top: -16px; left: 50%; margin-left: -16px;";

struct Flipper<'a> {
    id: &'a str,
    edge_style: &'a str,
    /// Id of the reader control the flipper clicks.
    control: &'a str,
    icon: &'a str,
}

impl<'a> Flipper<'a> {
    fn style(&self) -> String {
        format!(
            "display: block; position: absolute; top: 0; bottom: 0; width: {FLIPPER_WIDTH}; z-index: 9001; background: #757575; {}",
            self.edge_style
        )
    }

    fn onclick(&self) -> String {
        format!("$$('#{}').click();", self.control)
    }

    /// Builds the panel with its icon, detached from the tree.
    fn create(&self, doc: &mut Html) -> ego_tree::NodeId {
        let panel = doc.create_html_element(
            "div",
            &[("id", self.id), ("style", self.style().as_str()), ("onclick", self.onclick().as_str())],
        );
        let icon = doc.create_html_element("img", &[("style", ICON_STYLE), ("src", self.icon)]);
        doc.perform_operation(DomOperation::AppendChild {
            parent_id: panel,
            child_id: icon,
        });
        panel
    }
}

pub fn has_view_container(doc: &Html) -> bool {
    doc.select(&VIEWS_SELECTOR).next().is_some()
}

/// Adds "previous page" and "next page" overlays to the reader's view container,
/// wired to its `#go-back` and `#go-next` controls, and pads the container so
/// they never cover the pages.
pub fn add_page_flippers(doc: &mut Html, left_icon: &str, right_icon: &str) {
    let views = match doc.select(&VIEWS_SELECTOR).next() {
        Some(views) => views.id(),
        None => {
            warn!("No .views container, page flippers not added");
            return;
        }
    };

    let flippers = [
        Flipper {
            id: "left-flipper",
            edge_style: "left: 0; cursor: pointer;",
            control: "go-back",
            icon: left_icon,
        },
        Flipper {
            id: "right-flipper",
            edge_style: "right: 0; cursor: pointer;",
            control: "go-next",
            icon: right_icon,
        },
    ];

    let mut ops = vec![DomOperation::ExtendStyle {
        node_id: views,
        declarations: format!(
            "padding-left: {FLIPPER_WIDTH}; padding-right: {FLIPPER_WIDTH}; box-sizing: border-box;"
        ),
    }];
    for flipper in &flippers {
        let panel = flipper.create(doc);
        ops.push(DomOperation::AppendChild {
            parent_id: views,
            child_id: panel,
        });
    }
    doc.perform_operations(ops);
}

#[test]
fn test_page_flippers_added() {
    let mut doc = Html::parse_document(
        "<html><body><div class='views'><div class='page'>One</div></div><a id='go-back'></a><a id='go-next'></a></body></html>",
    );

    assert!(has_view_container(&doc));
    add_page_flippers(&mut doc, "left.png", "right.png");

    let views = doc.select(&VIEWS_SELECTOR).next().unwrap();
    assert_eq!(
        Some("padding-left: 6%; padding-right: 6%; box-sizing: border-box;"),
        views.value().attr("style")
    );

    let children: Vec<_> = views
        .children()
        .filter_map(|child| child.value().as_element().map(|elem| elem.attr("id").unwrap_or("")))
        .collect();
    assert_eq!(vec!["", "left-flipper", "right-flipper"], children);

    let left = doc.select(&Selector::parse("#left-flipper").unwrap()).next().unwrap();
    assert_eq!(Some("$$('#go-back').click();"), left.value().attr("onclick"));
    assert!(left.value().attr("style").unwrap().contains("left: 0; cursor: pointer;"));
    assert!(left.value().attr("style").unwrap().contains("z-index: 9001"));

    let right_icon = doc.select(&Selector::parse("#right-flipper > img").unwrap()).next().unwrap();
    assert_eq!(Some("right.png"), right_icon.value().attr("src"));
    let right = doc.select(&Selector::parse("#right-flipper").unwrap()).next().unwrap();
    assert_eq!(Some("$$('#go-next').click();"), right.value().attr("onclick"));
}

#[test]
fn test_page_flippers_without_views() {
    let mut doc = Html::parse_document("<html><body><p>Nothing here</p></body></html>");
    let before = doc.html();

    assert!(!has_view_container(&doc));
    add_page_flippers(&mut doc, "left.png", "right.png");
    assert_eq!(before, doc.html());
}
