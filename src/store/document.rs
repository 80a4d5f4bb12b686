//! In-memory form of the settings file
//!
//! The on-disk layout is a single `configurations` root holding
//! self-closing `setting` elements:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <configurations>
//!   <setting name="key1" value="val1"/>
//!   <setting name="key2" value="val2"/>
//! </configurations>
//! ```
//!
//! Loading is lenient about individual entries (a `setting` without a
//! `value`, or with a blank `name`, is skipped) but strict about the
//! document as a whole: malformed XML or a foreign root is rejected.

use crate::types::{Result, StoreError};
use quick_xml::escape::escape;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use tracing::{debug, warn};

pub const ROOT_ELEMENT: &str = "configurations";
pub const ITEM_ELEMENT: &str = "setting";
pub const NAME_ATTRIBUTE: &str = "name";
pub const VALUE_ATTRIBUTE: &str = "value";

/// One named setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of entries mirroring the `setting` elements of the file.
///
/// Names are unique within a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    entries: Vec<ConfigEntry>,
}

impl ConfigDocument {
    /// An empty document: just the root element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings document.
    ///
    /// A leading byte-order mark is accepted. Comments, processing
    /// instructions and child elements other than `setting` are ignored.
    /// When a name occurs more than once the last value wins and the entry
    /// keeps the position of its first occurrence.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut document = Self::new();
        let mut depth = 0usize;
        let mut seen_root = false;

        loop {
            let event = reader.read_event().map_err(|e| {
                StoreError::InvalidFormat(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            })?;

            match event {
                Event::Start(element) => {
                    match depth {
                        0 => check_root(&element, &mut seen_root)?,
                        1 => document.read_entry(&element)?,
                        _ => {}
                    }
                    depth += 1;
                }
                Event::Empty(element) => match depth {
                    0 => check_root(&element, &mut seen_root)?,
                    1 => document.read_entry(&element)?,
                    _ => {}
                },
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                }
                Event::Text(_) | Event::CData(_) if depth == 0 => {
                    return Err(StoreError::InvalidFormat(
                        "text content outside the root element".to_string(),
                    ));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(StoreError::InvalidFormat(format!(
                "missing <{}> root element",
                ROOT_ELEMENT
            )));
        }
        if depth != 0 {
            return Err(StoreError::InvalidFormat(
                "unexpected end of document".to_string(),
            ));
        }

        Ok(document)
    }

    /// Render the document as XML text.
    pub fn to_xml(&self) -> io::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(io::Error::other)?;

        if self.entries.is_empty() {
            writer
                .write_event(Event::Empty(BytesStart::new(ROOT_ELEMENT)))
                .map_err(io::Error::other)?;
        } else {
            writer
                .write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))
                .map_err(io::Error::other)?;
            for entry in &self.entries {
                let element = BytesStart::new(ITEM_ELEMENT).with_attributes([
                    attribute(NAME_ATTRIBUTE, &entry.name),
                    attribute(VALUE_ATTRIBUTE, &entry.value),
                ]);
                writer
                    .write_event(Event::Empty(element))
                    .map_err(io::Error::other)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
                .map_err(io::Error::other)?;
        }

        let mut xml = String::from_utf8(writer.into_inner()).map_err(io::Error::other)?;
        xml.push('\n');
        Ok(xml)
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].value.as_str())
    }

    /// Append a new entry. The caller guarantees `name` is not present yet.
    pub fn push(&mut self, name: &str, value: &str) {
        debug_assert!(self.position(name).is_none());
        self.entries.push(ConfigEntry::new(name, value));
    }

    /// Rewrite the value of an existing entry in place.
    pub fn set_value(&mut self, name: &str, value: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries[i].value = value.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Name to value projection of the entries.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn read_entry(&mut self, element: &BytesStart<'_>) -> Result<()> {
        if element.name().as_ref() != ITEM_ELEMENT.as_bytes() {
            return Ok(());
        }

        let mut name = None;
        let mut value = None;
        for attr in element.attributes() {
            let attr = attr
                .map_err(|e| StoreError::InvalidFormat(format!("malformed attribute: {}", e)))?;
            let text = attr
                .unescape_value()
                .map_err(|e| StoreError::InvalidFormat(format!("malformed attribute: {}", e)))?;
            match attr.key.as_ref() {
                k if k == NAME_ATTRIBUTE.as_bytes() => name = Some(text.into_owned()),
                k if k == VALUE_ATTRIBUTE.as_bytes() => value = Some(text.into_owned()),
                _ => {}
            }
        }

        let (name, value) = match (name, value) {
            (Some(name), Some(value)) if !name.trim().is_empty() => (name, value),
            (name, _) => {
                debug!("Skipping incomplete setting entry (name: {:?})", name);
                return Ok(());
            }
        };

        if self.set_value(&name, &value) {
            warn!("Duplicate setting '{}' in document, keeping the last value", name);
        } else {
            self.entries.push(ConfigEntry { name, value });
        }
        Ok(())
    }
}

fn check_root(element: &BytesStart<'_>, seen_root: &mut bool) -> Result<()> {
    if *seen_root {
        return Err(StoreError::InvalidFormat(
            "more than one root element".to_string(),
        ));
    }
    if element.name().as_ref() != ROOT_ELEMENT.as_bytes() {
        return Err(StoreError::InvalidFormat(format!(
            "expected <{}> root element, found <{}>",
            ROOT_ELEMENT,
            String::from_utf8_lossy(element.name().as_ref())
        )));
    }
    *seen_root = true;
    Ok(())
}

/// Build an attribute whose value survives attribute-value normalization.
///
/// Besides the usual markup escapes, tab, line feed and carriage return are
/// written as character references; conforming readers would otherwise turn
/// them into spaces.
fn attribute<'a>(key: &'a str, value: &str) -> Attribute<'a> {
    let mut escaped = String::with_capacity(value.len());
    for c in escape(value).chars() {
        match c {
            '\t' => escaped.push_str("&#x9;"),
            '\n' => escaped.push_str("&#xA;"),
            '\r' => escaped.push_str("&#xD;"),
            c => escaped.push(c),
        }
    }
    Attribute {
        key: QName(key.as_bytes()),
        value: Cow::Owned(escaped.into_bytes()),
    }
}

/// True when every character of `text` may appear in an XML 1.0 document.
pub fn is_xml_text(text: &str) -> bool {
    text.chars().all(|c| {
        matches!(c, '\t' | '\n' | '\r')
            || (c >= '\u{20}' && c != '\u{fffe}' && c != '\u{ffff}')
    })
}
