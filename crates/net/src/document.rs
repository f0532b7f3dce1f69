//! Tagged document trees exchanged with the modeller as XML text.
//!
//! The modeller only reads and writes small, flat documents, so the parser covers elements,
//! attributes, text, entity escapes, CDATA, comments and declarations, and nothing else.

use std::fmt::Write as _;
use thiserror::Error;

/// Deepest element nesting the parser accepts.
pub const MAX_DEPTH: usize = 64;

/// Errors raised while parsing a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Input ended inside a construct.
    #[error("unexpected end of document")]
    UnexpectedEnd,
    /// A character did not fit the grammar.
    #[error("expected {expected} at byte {at}")]
    Unexpected {
        /// Byte offset.
        at: usize,
        /// What the parser was looking for.
        expected: &'static str,
    },
    /// A closing tag did not match its opening tag.
    #[error("closing tag `{found}` does not match `{expected}`")]
    MismatchedClose {
        /// Name of the open element.
        expected: String,
        /// Name in the closing tag.
        found: String,
    },
    /// An entity reference was not recognised.
    #[error("unknown entity `&{0};`")]
    UnknownEntity(String),
    /// Exactly one root element was required.
    #[error("expected one root element, found {0}")]
    RootCount(usize),
    /// Elements nested deeper than [`MAX_DEPTH`].
    #[error("elements nested too deeply at byte {0}")]
    TooDeep(usize),
}

type Result<T> = std::result::Result<T, DocumentError>;

/// One element of a document tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Tag name.
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Trimmed text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Leaf element holding `text`.
    pub fn leaf(name: impl Into<String>, text: impl ToString) -> Self {
        Self {
            name: name.into(),
            text: text.to_string(),
            ..Self::default()
        }
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Append a child.
    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// First child named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Text of the first child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|child| child.text.as_str())
    }

    /// Attribute value by name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Render as indented XML.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, 0);
        out
    }

    fn write_xml(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = write!(out, "{indent}<{}", self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {key}=\"{}\"", escape(value));
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push('>');
        if self.children.is_empty() {
            out.push_str(&escape(&self.text));
        } else {
            out.push('\n');
            if !self.text.is_empty() {
                let _ = writeln!(out, "{indent}  {}", escape(&self.text));
            }
            for child in &self.children {
                child.write_xml(out, depth + 1);
            }
            out.push_str(&indent);
        }
        let _ = writeln!(out, "</{}>", self.name);
    }
}

/// Parse a document with exactly one root element.
pub fn parse_document(input: &str) -> Result<Element> {
    let mut roots = parse_fragment(input)?;
    if roots.len() != 1 {
        return Err(DocumentError::RootCount(roots.len()));
    }
    Ok(roots.remove(0))
}

/// Parse zero or more consecutive root elements.
///
/// The modeller may append several documents to a file between two polls; each root is one
/// record.
pub fn parse_fragment(input: &str) -> Result<Vec<Element>> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };
    let mut roots = Vec::new();
    loop {
        parser.skip_misc()?;
        if parser.at_end() {
            return Ok(roots);
        }
        roots.push(parser.element()?);
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find(';').ok_or(DocumentError::UnexpectedEnd)?;
        let entity = &after[..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        out.push(decoded.ok_or_else(|| DocumentError::UnknownEntity(entity.to_string()))?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<()> {
        let end = self
            .rest()
            .find(terminator)
            .ok_or(DocumentError::UnexpectedEnd)?;
        self.pos += end + terminator.len();
        Ok(())
    }

    fn expect(&mut self, token: &'static str) -> Result<()> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else if self.at_end() {
            Err(DocumentError::UnexpectedEnd)
        } else {
            Err(DocumentError::Unexpected {
                at: self.pos,
                expected: token,
            })
        }
    }

    /// Whitespace, declarations, comments and doctypes between elements.
    fn skip_misc(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> Result<String> {
        let rest = self.rest();
        let len = rest
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '/' | '>' | '=' | '<'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(if self.at_end() {
                DocumentError::UnexpectedEnd
            } else {
                DocumentError::Unexpected {
                    at: self.pos,
                    expected: "a name",
                }
            });
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn attribute_value(&mut self) -> Result<String> {
        let quote = match self.rest().chars().next() {
            Some(quote @ ('"' | '\'')) => quote,
            Some(_) => {
                return Err(DocumentError::Unexpected {
                    at: self.pos,
                    expected: "a quoted attribute value",
                })
            }
            None => return Err(DocumentError::UnexpectedEnd),
        };
        self.pos += 1;
        let end = self
            .rest()
            .find(quote)
            .ok_or(DocumentError::UnexpectedEnd)?;
        let value = unescape(&self.rest()[..end])?;
        self.pos += end + 1;
        Ok(value)
    }

    fn element(&mut self) -> Result<Element> {
        if self.depth >= MAX_DEPTH {
            return Err(DocumentError::TooDeep(self.pos));
        }
        self.depth += 1;
        let element = self.element_body();
        self.depth -= 1;
        element
    }

    fn element_body(&mut self) -> Result<Element> {
        self.expect("<")?;
        let mut element = Element::new(self.name()?);

        loop {
            self.skip_ws();
            if self.rest().starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if self.rest().starts_with('>') {
                self.pos += 1;
                break;
            }
            let key = self.name()?;
            self.skip_ws();
            self.expect("=")?;
            self.skip_ws();
            let value = self.attribute_value()?;
            element.attributes.push((key, value));
        }

        let mut text = String::new();
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(DocumentError::UnexpectedEnd);
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let found = self.name()?;
                self.skip_ws();
                self.expect(">")?;
                if found != element.name {
                    return Err(DocumentError::MismatchedClose {
                        expected: element.name,
                        found,
                    });
                }
                element.text = text.trim().to_string();
                return Ok(element);
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if let Some(cdata) = rest.strip_prefix("<![CDATA[") {
                let end = cdata.find("]]>").ok_or(DocumentError::UnexpectedEnd)?;
                text.push_str(&cdata[..end]);
                self.pos += "<![CDATA[".len() + end + "]]>".len();
            } else if rest.starts_with('<') {
                let child = self.element()?;
                element.children.push(child);
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                text.push_str(&unescape(&rest[..end])?);
                self.pos += end;
            }
        }
    }
}
