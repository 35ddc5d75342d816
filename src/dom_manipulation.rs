use ego_tree::NodeId;
use html5ever::tree_builder::{Attribute, ElementFlags, NodeOrText, TreeSink};
use markup5ever::{LocalName, Namespace, QualName};
use scraper::{Html, Node, Selector};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

/// Creates a qualified name for a HTML element.
pub fn html_elem_name(name: &str) -> QualName {
    QualName::new(None, Namespace::from(HTML_NAMESPACE), LocalName::from(name))
}

/// Creates a qualified name for an attribute of a HTML element.
pub fn html_attr_name(name: &str) -> QualName {
    QualName::new(None, Namespace::from(""), LocalName::from(name))
}

pub(crate) enum DomOperation<Handle> {
    /// Will set the value of attribute `attr_name` of element `node_id` to `value`.
    SetAttribute {
        node_id: Handle,
        attr_name: QualName,
        value: String,
    },
    /// Will add `declarations` after the current value of the `style` attribute of element `node_id`.
    ExtendStyle {
        node_id: Handle,
        declarations: String,
    },
    /// Will add an element with `child_id` as the last child of element with `parent_id`.
    /// If the child already has a parent, it will be moved.
    AppendChild {
        parent_id: Handle,
        child_id: Handle,
    },
}

pub(crate) trait MutableDom: TreeSink {
    /// Performs given operation to mutate the tree.
    fn perform_operation(&mut self, op: DomOperation<Self::Handle>);

    /// Performs a sequence of scheduled operations.
    fn perform_operations(&mut self, ops: Vec<DomOperation<Self::Handle>>) {
        for op in ops {
            self.perform_operation(op);
        }
    }

    /// Creates a detached element that can be attached with `DomOperation::AppendChild`.
    fn create_html_element(&mut self, name: &str, attrs: &[(&str, &str)]) -> Self::Handle {
        let attrs = attrs
            .iter()
            .map(|(name, value)| Attribute {
                name: html_attr_name(name),
                value: (*value).into(),
            })
            .collect();
        self.create_element(html_elem_name(name), attrs, ElementFlags::default())
    }
}

impl MutableDom for Html {
    fn perform_operation(&mut self, op: DomOperation<Self::Handle>) {
        match op {
            DomOperation::SetAttribute {
                node_id,
                attr_name,
                value,
            } => {
                if let Some(mut node) = self.tree.get_mut(node_id) {
                    if let Node::Element(ref mut elem) = node.value() {
                        elem.attrs.insert(attr_name, value.into());
                    }
                }
            }
            DomOperation::ExtendStyle { node_id, declarations } => {
                if let Some(mut node) = self.tree.get_mut(node_id) {
                    if let Node::Element(ref mut elem) = node.value() {
                        let style = match elem.attr("style").map(str::trim) {
                            Some(existing) if !existing.is_empty() => {
                                let separator = if existing.ends_with(';') { " " } else { "; " };
                                format!("{existing}{separator}{declarations}")
                            }
                            _ => declarations,
                        };
                        elem.attrs.insert(html_attr_name("style"), style.into());
                    }
                }
            }
            DomOperation::AppendChild { parent_id, child_id } => {
                if self.tree.get(parent_id).is_some() {
                    self.append(&parent_id, NodeOrText::AppendNode(child_id));
                }
            }
        }
    }
}

/// Ids of all elements matching `selector`, in document order.
/// Collecting them first releases the borrow of the document so it can be mutated.
pub(crate) fn select_ids(doc: &Html, selector: &Selector) -> Vec<NodeId> {
    doc.select(selector).map(|elem| elem.id()).collect()
}

#[cfg(test)]
fn fragment_html(doc: &Html) -> Html {
    Html::parse_fragment(&doc.root_element().inner_html())
}

#[test]
fn test_set_attribute() {
    let mut doc = Html::parse_fragment("<img class='cover' src='/upload/a.jpg'> <img src='/upload/b.jpg'>");
    let img = doc.select(&Selector::parse("img.cover").unwrap()).next().expect("Image not found.");

    doc.perform_operation(DomOperation::SetAttribute {
        node_id: img.id(),
        attr_name: html_attr_name("src"),
        value: String::from("0_a.jpg"),
    });

    assert_eq!(
        Html::parse_fragment("<img class='cover' src='0_a.jpg'> <img src='/upload/b.jpg'>"),
        fragment_html(&doc),
    );
}

#[test]
fn test_set_attribute_missing() {
    let mut doc = Html::parse_fragment("<div id='headerBar'>Menu</div>");
    let header = doc.select(&Selector::parse("#headerBar").unwrap()).next().expect("Header not found.");

    doc.perform_operation(DomOperation::SetAttribute {
        node_id: header.id(),
        attr_name: html_attr_name("style"),
        value: String::from("display: none;"),
    });

    assert_eq!(
        Html::parse_fragment("<div id='headerBar' style='display: none;'>Menu</div>"),
        fragment_html(&doc),
    );
}

#[test]
fn test_extend_style() {
    let mut doc = Html::parse_fragment("<div class='views' style='color: red'></div><div class='bare'></div>");
    let views = doc.select(&Selector::parse(".views").unwrap()).next().unwrap().id();
    let bare = doc.select(&Selector::parse(".bare").unwrap()).next().unwrap().id();

    doc.perform_operations(vec![
        DomOperation::ExtendStyle {
            node_id: views,
            declarations: String::from("padding-left: 6%;"),
        },
        DomOperation::ExtendStyle {
            node_id: bare,
            declarations: String::from("padding-left: 6%;"),
        },
    ]);

    assert_eq!(
        Html::parse_fragment("<div class='views' style='color: red; padding-left: 6%;'></div><div class='bare' style='padding-left: 6%;'></div>"),
        fragment_html(&doc),
    );
}

#[test]
fn test_append_created_element() {
    let mut doc = Html::parse_fragment("<div class='views'><p>Page</p></div>");
    let views = doc.select(&Selector::parse(".views").unwrap()).next().unwrap().id();

    let panel = doc.create_html_element("div", &[("id", "left-flipper")]);
    let icon = doc.create_html_element("img", &[("src", "left.png")]);
    doc.perform_operations(vec![
        DomOperation::AppendChild {
            parent_id: panel,
            child_id: icon,
        },
        DomOperation::AppendChild {
            parent_id: views,
            child_id: panel,
        },
    ]);

    assert_eq!(
        Html::parse_fragment("<div class='views'><p>Page</p><div id='left-flipper'><img src='left.png'></div></div>"),
        fragment_html(&doc),
    );
}

#[test]
fn test_select_ids_in_document_order() {
    let doc = Html::parse_fragment("<script src='a.js'></script><p><script src='b.js'></script></p><script></script>");
    let ids = select_ids(&doc, &Selector::parse("script[src]").unwrap());
    let sources: Vec<_> = ids
        .into_iter()
        .filter_map(|id| doc.tree.get(id))
        .filter_map(|node| node.value().as_element().and_then(|elem| elem.attr("src")).map(String::from))
        .collect();

    assert_eq!(vec!["a.js", "b.js"], sources);
}
