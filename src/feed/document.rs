//! Loosely structured document tree for parsed feed entries.
//!
//! RSS, RSS with media/job-board extensions and Atom all disagree on where a
//! field lives and whether it carries attributes. Rather than a typed struct per
//! dialect, every element becomes a [`Node`]:
//!
//! - an element with only text becomes [`Node::Text`]
//! - repeated sibling elements with the same name collapse into [`Node::List`]
//! - an element with attributes or children becomes [`Node::Map`]; its text (if
//!   any) lives under `value` and its attributes under `attributes`
//!
//! The accessor helpers never panic and never fail: a missing or oddly shaped
//! field simply yields `None`.

use serde_json::Value;

/// Key holding an element's own text when it also has attributes or children.
pub const VALUE_KEY: &str = "value";
/// Key holding an element's attributes.
pub const ATTRIBUTES_KEY: &str = "attributes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    List(Vec<Node>),
    Map(Fields),
}

/// Ordered name → node pairs, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, Node)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Insert a child, folding repeated names into a [`Node::List`].
    pub fn push(&mut self, name: String, node: Node) {
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, Node::List(items))) => items.push(node),
            Some((_, existing)) => {
                let first = std::mem::replace(existing, Node::List(Vec::new()));
                *existing = Node::List(vec![first, node]);
            }
            None => self.0.push((name, node)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for Fields {
    type Item = (String, Node);
    type IntoIter = std::vec::IntoIter<(String, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, Node)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (name, node) in iter {
            fields.push(name, node);
        }
        fields
    }
}

impl Node {
    pub fn text_node(s: impl Into<String>) -> Self {
        Node::Text(s.into())
    }

    /// Look up a named child. Lists delegate to their first element so that
    /// `channel.item` works whether or not `channel` was repeated.
    pub fn get(&self, name: &str) -> Option<&Node> {
        match self {
            Node::Map(fields) => fields.get(name),
            Node::List(items) => items.first().and_then(|n| n.get(name)),
            Node::Text(_) => None,
        }
    }

    /// The first element of a list, or the node itself.
    pub fn first(&self) -> &Node {
        match self {
            Node::List(items) => items.first().unwrap_or(self),
            other => other,
        }
    }

    /// Every occurrence of this node: list elements, or the node itself.
    pub fn items(&self) -> &[Node] {
        match self {
            Node::List(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// All occurrences of a named child, in document order.
    pub fn get_all(&self, name: &str) -> &[Node] {
        self.get(name).map(Node::items).unwrap_or(&[])
    }

    /// An attribute value, unwrapping a list to its first element.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.first()
            .get(ATTRIBUTES_KEY)
            .and_then(|attrs| attrs.get(name))
            .and_then(Node::text)
    }

    /// Trimmed, non-empty text of this node.
    ///
    /// A `{value, attributes}` wrapper yields its `value`; a list yields the
    /// text of its first element.
    pub fn text(&self) -> Option<&str> {
        match self {
            Node::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Node::List(items) => items.first().and_then(Node::text),
            Node::Map(fields) => fields.get(VALUE_KEY).and_then(Node::text),
        }
    }

    /// Text of the first candidate field that is present and non-empty.
    pub fn first_text<'a>(&'a self, candidates: &[&str]) -> Option<&'a str> {
        candidates
            .iter()
            .find_map(|name| self.get(name).and_then(Node::text))
    }

    /// Convert to JSON, preserving field order.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Text(s) => Value::String(s.clone()),
            Node::List(items) => Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Map(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Node)>) -> Node {
        Node::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn test_repeated_names_fold_into_list() {
        let mut fields = Fields::new();
        fields.push("category".into(), Node::text_node("a"));
        fields.push("category".into(), Node::text_node("b"));
        fields.push("category".into(), Node::text_node("c"));

        let node = Node::Map(fields);
        let texts: Vec<_> = node
            .get_all("category")
            .iter()
            .filter_map(Node::text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_text_unwraps_value_attribute_wrapper() {
        let guid = map(vec![
            ("value", Node::text_node("  abc-123  ")),
            (
                "attributes",
                map(vec![("isPermaLink", Node::text_node("false"))]),
            ),
        ]);
        assert_eq!(guid.text(), Some("abc-123"));
        assert_eq!(guid.attribute("isPermaLink"), Some("false"));
    }

    #[test]
    fn test_blank_text_is_absent() {
        assert_eq!(Node::text_node("   ").text(), None);
        assert_eq!(Node::List(vec![]).text(), None);
        assert_eq!(map(vec![]).text(), None);
    }

    #[test]
    fn test_first_text_skips_empty_candidates() {
        let entry = map(vec![
            ("description", Node::text_node("")),
            ("content:encoded", Node::text_node("<p>Full</p>")),
        ]);
        assert_eq!(
            entry.first_text(&["description", "content:encoded"]),
            Some("<p>Full</p>")
        );
        assert_eq!(entry.first_text(&["summary"]), None);
    }

    #[test]
    fn test_to_json_preserves_order() {
        let entry = map(vec![
            ("title", Node::text_node("Engineer")),
            ("guid", Node::text_node("1")),
            (
                "category",
                Node::List(vec![Node::text_node("a"), Node::text_node("b")]),
            ),
        ]);
        let json = entry.to_json();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["title", "guid", "category"]);
        assert_eq!(json["category"][1], "b");
    }
}
