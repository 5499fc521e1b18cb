//! Radix tree node.

use crate::params::Params;
use crate::TemplateError;

/// Type of a path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal segment (e.g. `users`)
    Static,
    /// Single-segment capture (e.g. `{id}`)
    Param(String),
    /// Greedy capture of the rest of the path (e.g. `{file+}`)
    Greedy(String),
}

/// A node of the tree. Nodes at the end of a template hold a value.
#[derive(Debug, Clone)]
pub struct Node<T> {
    segment: String,
    kind: SegmentKind,
    value: Option<T>,
    /// Sorted by segment for binary search
    static_children: Vec<Node<T>>,
    param_child: Option<Box<Node<T>>>,
    greedy_child: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    fn new(segment: &str, kind: SegmentKind) -> Self {
        Self {
            segment: segment.to_string(),
            kind,
            value: None,
            static_children: Vec::new(),
            param_child: None,
            greedy_child: None,
        }
    }

    /// Creates an empty root node.
    #[must_use]
    pub fn root() -> Self {
        Self::new("", SegmentKind::Static)
    }

    /// Parses a template into its segments.
    pub fn parse_template(template: &str) -> Result<Vec<(String, SegmentKind)>, TemplateError> {
        let raw: Vec<&str> = template.split('/').filter(|s| !s.is_empty()).collect();
        let last = raw.len().saturating_sub(1);
        raw.iter()
            .enumerate()
            .map(|(i, s)| {
                let Some(inner) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
                    if s.contains('{') || s.contains('}') {
                        return Err(TemplateError::PartialCapture(template.to_string()));
                    }
                    return Ok(((*s).to_string(), SegmentKind::Static));
                };
                let (name, greedy) = match inner.strip_suffix('+') {
                    Some(name) => (name, true),
                    None => (inner, false),
                };
                if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(TemplateError::InvalidName(template.to_string()));
                }
                if greedy && i != last {
                    return Err(TemplateError::GreedyNotLast(template.to_string()));
                }
                let kind = if greedy {
                    SegmentKind::Greedy(name.to_string())
                } else {
                    SegmentKind::Param(name.to_string())
                };
                Ok(((*s).to_string(), kind))
            })
            .collect()
    }

    /// Inserts a value at the end of the segments, returning the value it
    /// replaced.
    pub fn insert_segments(&mut self, segments: &[(String, SegmentKind)], value: T) -> Option<T> {
        let Some(((segment, kind), remaining)) = segments.split_first() else {
            return self.value.replace(value);
        };

        let child = match kind {
            SegmentKind::Static => {
                match self
                    .static_children
                    .binary_search_by(|c| c.segment.as_str().cmp(segment))
                {
                    Ok(i) => &mut self.static_children[i],
                    Err(i) => {
                        self.static_children
                            .insert(i, Node::new(segment, SegmentKind::Static));
                        &mut self.static_children[i]
                    }
                }
            }
            SegmentKind::Param(_) => &mut **self
                .param_child
                .get_or_insert_with(|| Box::new(Node::new(segment, kind.clone()))),
            SegmentKind::Greedy(_) => &mut **self
                .greedy_child
                .get_or_insert_with(|| Box::new(Node::new(segment, kind.clone()))),
        };
        // A later template may rename a capture at the same position
        if child.kind != *kind {
            child.kind = kind.clone();
            child.segment.clone_from(segment);
        }
        child.insert_segments(remaining, value)
    }

    /// Removes the value at the end of the segments and prunes empty nodes.
    pub fn remove_segments(&mut self, segments: &[(String, SegmentKind)]) -> Option<T> {
        let Some(((segment, kind), remaining)) = segments.split_first() else {
            return self.value.take();
        };

        match kind {
            SegmentKind::Static => {
                let i = self
                    .static_children
                    .binary_search_by(|c| c.segment.as_str().cmp(segment))
                    .ok()?;
                let removed = self.static_children[i].remove_segments(remaining);
                if self.static_children[i].is_empty() {
                    self.static_children.remove(i);
                }
                removed
            }
            SegmentKind::Param(_) => {
                let child = self.param_child.as_mut()?;
                let removed = child.remove_segments(remaining);
                if child.is_empty() {
                    self.param_child = None;
                }
                removed
            }
            SegmentKind::Greedy(_) => {
                let child = self.greedy_child.as_mut()?;
                let removed = child.remove_segments(remaining);
                if child.is_empty() {
                    self.greedy_child = None;
                }
                removed
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.static_children.is_empty()
            && self.param_child.is_none()
            && self.greedy_child.is_none()
    }

    /// Matches path segments. Static beats param beats greedy, with
    /// backtracking when a more specific branch dead-ends.
    pub fn match_segments<'a>(&'a self, segments: &[&str], params: &mut Params) -> Option<&'a T> {
        let Some((segment, remaining)) = segments.split_first() else {
            return self.value.as_ref();
        };

        if let Ok(i) = self
            .static_children
            .binary_search_by(|c| c.segment.as_str().cmp(segment))
        {
            if let Some(found) = self.static_children[i].match_segments(remaining, params) {
                return Some(found);
            }
        }

        if let Some(child) = &self.param_child {
            if let SegmentKind::Param(name) = &child.kind {
                let mark = params.len();
                params.push(name.clone(), *segment);
                if let Some(found) = child.match_segments(remaining, params) {
                    return Some(found);
                }
                params.truncate(mark);
            }
        }

        if let Some(child) = &self.greedy_child {
            if let SegmentKind::Greedy(name) = &child.kind {
                if let Some(value) = &child.value {
                    params.push(name.clone(), segments.join("/"));
                    return Some(value);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template() {
        let segments = Node::<()>::parse_template("/files/{dir}/{file+}").unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].1, SegmentKind::Static);
        assert_eq!(segments[1].1, SegmentKind::Param("dir".into()));
        assert_eq!(segments[2].1, SegmentKind::Greedy("file".into()));
    }

    #[test]
    fn test_parse_template_errors() {
        assert!(matches!(
            Node::<()>::parse_template("/{rest+}/more"),
            Err(TemplateError::GreedyNotLast(_))
        ));
        assert!(matches!(
            Node::<()>::parse_template("/{}"),
            Err(TemplateError::InvalidName(_))
        ));
        assert!(matches!(
            Node::<()>::parse_template("/user-{id}"),
            Err(TemplateError::PartialCapture(_))
        ));
    }

    #[test]
    fn test_backtracking_restores_params() {
        let mut root = Node::root();
        let a = Node::<&str>::parse_template("/{x}/left").unwrap();
        let b = Node::<&str>::parse_template("/{y+}").unwrap();
        root.insert_segments(&a, "a");
        root.insert_segments(&b, "b");

        let mut params = Params::new();
        assert_eq!(root.match_segments(&["k", "right"], &mut params), Some(&"b"));
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("y"), Some("k/right"));
    }

    #[test]
    fn test_remove_prunes() {
        let mut root = Node::root();
        let segments = Node::<u8>::parse_template("/a/b/c").unwrap();
        root.insert_segments(&segments, 1);
        assert_eq!(root.remove_segments(&segments), Some(1));
        assert!(root.is_empty());
    }
}
