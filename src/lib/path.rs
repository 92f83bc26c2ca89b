use crate::xml_tree::{Element, Node};
use lazy_static::lazy_static;
use regex::Regex;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref SEGMENT_REGEX: Regex = Regex::new(
        r#"^(?P<tag>\w+)\[(?:@(?P<attr>\w+)=['"](?P<value>[^'"]+)['"]|(?P<index>[0-9]+))\]$"#
    )
    .unwrap();
}

/// One step of a path below a start element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// First child with this tag.
    Tag(String),
    /// First child with this tag whose `attr` equals `value`; created with that attribute set.
    Attr {
        tag: String,
        attr: String,
        value: String,
    },
    /// The `index`-th (1-based) child with this tag.
    Nth { tag: String, index: usize },
}

impl Segment {
    pub fn child(tag: impl Into<String>) -> Segment {
        Segment::Tag(tag.into())
    }

    pub fn with_attr(
        tag: impl Into<String>,
        attr: impl Into<String>,
        value: impl ToString,
    ) -> Segment {
        Segment::Attr {
            tag: tag.into(),
            attr: attr.into(),
            value: value.to_string(),
        }
    }

    pub fn nth(tag: impl Into<String>, index: usize) -> Segment {
        Segment::Nth {
            tag: tag.into(),
            index,
        }
    }

    /// Parses `tag`, `tag[@attr='value']` or `tag[N]`.
    /// Anything else is kept as a literal tag name.
    pub fn parse(segment: &str) -> Segment {
        let Some(caps) = SEGMENT_REGEX.captures(segment) else {
            return Segment::Tag(segment.to_string());
        };
        let tag = caps["tag"].to_string();
        match (caps.name("attr"), caps.name("value"), caps.name("index")) {
            (Some(attr), Some(value), _) => Segment::Attr {
                tag,
                attr: attr.as_str().to_string(),
                value: value.as_str().to_string(),
            },
            (_, _, Some(index)) => Segment::Nth {
                tag,
                index: index.as_str().parse().unwrap_or(0),
            },
            _ => Segment::Tag(segment.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Segment::Tag(tag) => tag,
            Segment::Attr { tag, .. } => tag,
            Segment::Nth { tag, .. } => tag,
        }
    }

    /// Index, among the parent's child nodes, of the element this segment addresses.
    fn select(&self, parent: &Element) -> Option<usize> {
        let mut same_tag = parent
            .nodes()
            .iter()
            .enumerate()
            .filter_map(|(index, node)| match node {
                Node::Element(element) if element.tag() == self.name() => Some((index, element)),
                _ => None,
            });
        match self {
            Segment::Tag(_) => same_tag.next().map(|(index, _)| index),
            Segment::Attr { attr, value, .. } => same_tag
                .find(|(_, element)| element.attr(attr) == Some(value.as_str()))
                .map(|(index, _)| index),
            Segment::Nth { index, .. } => index
                .checked_sub(1)
                .and_then(|n| same_tag.nth(n))
                .map(|(index, _)| index),
        }
    }

    fn create(&self) -> Element {
        let mut element = Element::new(self.name());
        if let Segment::Attr { attr, value, .. } = self {
            element.set_attr(attr, value.as_str());
        }
        element
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Tag(tag) => write!(f, "{tag}"),
            Segment::Attr { tag, attr, value } => write!(f, "{tag}[@{attr}='{value}']"),
            Segment::Nth { tag, index } => write!(f, "{tag}[{index}]"),
        }
    }
}

impl FromStr for Segment {
    type Err = Infallible;

    fn from_str(segment: &str) -> Result<Self, Self::Err> {
        Ok(Segment::parse(segment))
    }
}

impl From<&str> for Segment {
    fn from(segment: &str) -> Self {
        Segment::parse(segment)
    }
}

/// Returns the element at `path` below `root`, appending any missing element on the way.
pub fn resolve<'a>(root: &'a mut Element, path: &[Segment]) -> &'a mut Element {
    let mut node = root;
    for segment in path {
        node = match segment.select(node) {
            Some(index) => match node.child_at_mut(index) {
                Some(child) => child,
                None => unreachable!("selected nodes are elements"),
            },
            None => {
                trace!("creating <{}> for {segment} under <{}>", segment.name(), node.tag());
                node.push_child(segment.create())
            }
        };
    }
    node
}

/// Looks up the element at `path` without creating anything.
pub fn find<'a>(root: &'a Element, path: &[Segment]) -> Option<&'a Element> {
    let mut node = root;
    for segment in path {
        node = node.child_at(segment.select(node)?)?;
    }
    Some(node)
}

pub fn find_mut<'a>(root: &'a mut Element, path: &[Segment]) -> Option<&'a mut Element> {
    let mut node = root;
    for segment in path {
        let index = segment.select(node)?;
        node = node.child_at_mut(index)?;
    }
    Some(node)
}

/// Parses a `/`-separated path such as `cpu/feature[@name='pcid']`.
pub fn parse_path(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(Segment::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml_tree::Document;

    fn doc() -> Document {
        Document::parse(
            "<domain>
      <cpu mode='custom' match='exact' check='none'>
        <model fallback='forbid'>qemu64</model>
      </cpu>
    </domain>",
        )
        .unwrap()
    }

    fn count(root: &Element) -> usize {
        1 + root.elements().map(count).sum::<usize>()
    }

    #[test]
    fn parse_segments() {
        assert_eq!(Segment::parse("cpu"), Segment::child("cpu"));
        assert_eq!(
            Segment::parse("feature[@name='pcid']"),
            Segment::with_attr("feature", "name", "pcid")
        );
        assert_eq!(
            Segment::parse(r#"timer[@name="rtc"]"#),
            Segment::with_attr("timer", "name", "rtc")
        );
        assert_eq!(Segment::parse("page[2]"), Segment::nth("page", 2));
        assert_eq!(Segment::parse("hint-dedicated"), Segment::child("hint-dedicated"));
        assert_eq!(Segment::parse("feature[@name=]"), Segment::child("feature[@name=]"));
        assert_eq!(Segment::parse("feature[x"), Segment::child("feature[x"));
    }

    #[test]
    fn display_matches_parse() {
        for raw in ["cpu", "feature[@name='pcid']", "page[3]"] {
            assert_eq!(Segment::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn resolve_existing() {
        let mut doc = doc();
        let before = count(doc.root());
        let model: *const Element = resolve(doc.root_mut(), &parse_path("cpu/model"));
        let by_attr: *const Element =
            resolve(doc.root_mut(), &parse_path("cpu/model[@fallback='forbid']"));
        let by_index: *const Element = resolve(doc.root_mut(), &parse_path("cpu/model[1]"));
        assert_eq!(model, by_attr);
        assert_eq!(model, by_index);
        assert_eq!(count(doc.root()), before);
        assert_eq!(
            find(doc.root(), &parse_path("cpu/model")).unwrap().text().as_deref(),
            Some("qemu64")
        );
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut doc = doc();
        let path = parse_path("cpu/feature[@name='pcid']");
        let first: *const Element = resolve(doc.root_mut(), &path);
        let after_first = doc.clone();
        let second: *const Element = resolve(doc.root_mut(), &path);
        assert_eq!(first, second);
        assert_eq!(doc, after_first);
    }

    #[test]
    fn resolve_new() {
        let mut doc = doc();
        resolve(doc.root_mut(), &parse_path("cpu/feature"));
        resolve(doc.root_mut(), &parse_path("cpu/feature[@name='pcid']"));
        let second: *const Element = resolve(doc.root_mut(), &parse_path("cpu/feature[2]"));

        let cpu = find(doc.root(), &parse_path("cpu")).unwrap();
        let features: Vec<&Element> = cpu.elements().filter(|e| e.tag() == "feature").collect();
        assert_eq!(
            features.iter().map(|e| e.attr("name")).collect::<Vec<_>>(),
            vec![None, Some("pcid")]
        );
        assert_eq!(second, features[1] as *const Element);
        // appended after the pre-existing model
        assert_eq!(cpu.elements().next().unwrap().tag(), "model");
    }

    #[test]
    fn resolve_creates_one_element_per_segment() {
        let mut doc = Document::parse("<domain/>").unwrap();
        resolve(
            doc.root_mut(),
            &parse_path("cpu/numa/cell[@id='2']/distances/sibling[@id='0']"),
        );
        assert_eq!(count(doc.root()), 6);
        let sibling = find(
            doc.root(),
            &[
                Segment::child("cpu"),
                Segment::child("numa"),
                Segment::with_attr("cell", "id", 2),
                Segment::child("distances"),
                Segment::with_attr("sibling", "id", 0),
            ],
        )
        .unwrap();
        assert_eq!(sibling.attr("id"), Some("0"));
    }

    #[test]
    fn nth_beyond_existing_appends_a_single_element() {
        let mut doc = Document::parse("<hugepages/>").unwrap();
        resolve(doc.root_mut(), &[Segment::nth("page", 3)]);
        assert_eq!(doc.root().elements().count(), 1);
        assert!(find(doc.root(), &[Segment::nth("page", 1)]).is_some());
        assert!(find(doc.root(), &[Segment::nth("page", 2)]).is_none());
        assert!(find(doc.root(), &[Segment::nth("page", 0)]).is_none());
    }

    #[test]
    fn find_does_not_create() {
        let doc = doc();
        assert!(find(doc.root(), &parse_path("cpu/feature")).is_none());
        assert!(find(doc.root(), &parse_path("cpu/model[@fallback='allow']")).is_none());
        assert_eq!(doc, self::doc());
    }
}
