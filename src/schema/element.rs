//! Parsed markup elements.
//!
//! Data-source declarations are handed to their source as a parsed element
//! tree rather than raw markup text, so each source variant reads its
//! configuration without re-parsing. The streaming compiler builds these for
//! `<datasource>` subtrees; [`XmlElement::parse`] exists for standalone
//! fragments (tests, ad hoc source construction).

use crate::error::{WriterError, WriterResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

/// One parsed markup element.
#[derive(Clone, Debug, Default)]
pub struct XmlElement {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// An empty element with the given tag.
    pub fn new(tag: &str) -> Self {
        XmlElement {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// First child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// All children with the given tag.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Parse a standalone fragment into its root element.
    pub fn parse(xml: &str) -> WriterResult<XmlElement> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(element_from_start(&start)?);
                }
                Ok(Event::Empty(start)) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(text)) => {
                    if let Some(top) = stack.last_mut() {
                        let chunk = text
                            .unescape()
                            .map_err(|e| WriterError::Schema(e.to_string()))?;
                        if !top.text.is_empty() {
                            top.text.push('\n');
                        }
                        top.text.push_str(chunk.trim());
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        WriterError::Schema("unbalanced close tag in fragment".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(WriterError::Schema(e.to_string())),
            }
        }
        if !stack.is_empty() {
            return Err(WriterError::Schema(
                "unterminated element in fragment".to_string(),
            ));
        }
        root.ok_or_else(|| WriterError::Schema("empty markup fragment".to_string()))
    }
}

pub(crate) fn element_from_start(
    start: &quick_xml::events::BytesStart<'_>,
) -> WriterResult<XmlElement> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = XmlElement::new(&tag);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| WriterError::Schema(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| WriterError::Schema(e.to_string()))?
            .into_owned();
        element.attrs.insert(key, value);
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> WriterResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err(WriterError::Schema(
            "multiple root elements in fragment".to_string(),
        ))
    }
}
