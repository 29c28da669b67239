//! Fragment Assembly - HTML page wrapped as a gateway policy fragment
//!
//! Shape: `<fragment><set-body><![CDATA[...]]></set-body></fragment>`,
//! with the CDATA payload split wherever the page contains `]]>`.

use quick_xml::events::{BytesCData, BytesEnd, BytesRef, BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use serde::Serialize;
use std::io::Cursor;
use std::sync::LazyLock;
use thiserror::Error;

use crate::content::PageId;
use crate::escape::cdata_sections;
use crate::hashing::sha256_hex;
use crate::templates::ResolvedDocument;

pub const ROOT_ELEMENT: &str = "fragment";
pub const BODY_ELEMENT: &str = "set-body";

/// The only named entities a document without a DTD may reference.
const PREDEFINED_ENTITIES: [&str; 5] = ["amp", "lt", "gt", "apos", "quot"];

pub static FILE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^page-(\d{3})\.xml$").expect("file name pattern is valid"));

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("character U+{code:04X} at byte {offset} cannot appear in XML")]
    InvalidXmlChar { code: u32, offset: usize },

    #[error("XML writer failed: {0}")]
    Write(String),

    #[error("assembled fragment is not UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// The publishable artifact for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub page: PageId,
    pub file_name: String,
    pub xml: String,
    pub byte_len: usize,
}

impl Fragment {
    pub fn digest(&self) -> String {
        sha256_hex(self.xml.as_bytes())
    }
}

pub fn file_name_for(page: PageId) -> String {
    format!("page-{page}.xml")
}

/// Wrap a resolved document into a fragment.
pub fn assemble(doc: &ResolvedDocument) -> Result<Fragment, AssemblyError> {
    if let Some((offset, c)) = doc.html.char_indices().find(|(_, c)| !is_xml_char(*c)) {
        return Err(AssemblyError::InvalidXmlChar {
            code: u32::from(c),
            offset,
        });
    }

    let mut writer = Writer::new(Cursor::new(Vec::with_capacity(doc.html.len() + 64)));
    writer
        .write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))
        .map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new(BODY_ELEMENT)))
        .map_err(write_err)?;
    for section in cdata_sections(&doc.html) {
        writer
            .write_event(Event::CData(BytesCData::new(section)))
            .map_err(write_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(BODY_ELEMENT)))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
        .map_err(write_err)?;

    let xml = String::from_utf8(writer.into_inner().into_inner())?;
    Ok(Fragment {
        page: doc.page,
        file_name: file_name_for(doc.page),
        byte_len: xml.len(),
        xml,
    })
}

fn is_xml_char(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => true,
        '\u{0}'..='\u{1F}' | '\u{FFFE}' | '\u{FFFF}' => false,
        _ => true,
    }
}

fn write_err(e: impl std::fmt::Display) -> AssemblyError {
    AssemblyError::Write(e.to_string())
}

/// What a parser sees in a fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentOutline {
    /// Top-level element names, in order.
    pub roots: Vec<String>,
    /// Element children of the first root.
    pub root_children: Vec<String>,
    /// Elements or non-blank text inside the body element besides CDATA.
    pub body_extras: usize,
    /// Concatenated CDATA contents of the body element.
    pub payload: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at byte {position}")]
pub struct OutlineError {
    pub position: u64,
    pub message: String,
}

/// Parse a fragment, rejecting anything that is not well-formed.
pub fn outline(xml: &str) -> Result<FragmentOutline, OutlineError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut outline = FragmentOutline::default();
    let mut stack: Vec<String> = vec![];

    loop {
        let in_body = stack.len() == 2 && stack[1] == BODY_ELEMENT;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                check_attributes(&e).map_err(|m| malformed(&reader, m))?;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                record_element(&mut outline, stack.len(), in_body, &name);
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                check_attributes(&e).map_err(|m| malformed(&reader, m))?;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                record_element(&mut outline, stack.len(), in_body, &name);
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c);
                check_chars(&text).map_err(|m| malformed(&reader, m))?;
                if in_body {
                    outline.payload.push_str(&text);
                }
            }
            Ok(Event::Text(t)) => {
                check_chars(&String::from_utf8_lossy(&t)).map_err(|m| malformed(&reader, m))?;
                let blank = t.iter().all(u8::is_ascii_whitespace);
                if stack.is_empty() && !blank {
                    return Err(malformed(&reader, "text outside the root element"));
                }
                if in_body && !blank {
                    outline.body_extras += 1;
                }
            }
            Ok(Event::GeneralRef(r)) => {
                if stack.is_empty() {
                    return Err(malformed(&reader, "entity reference outside the root element"));
                }
                check_reference(&r).map_err(|m| malformed(&reader, m))?;
                if in_body {
                    outline.body_extras += 1;
                }
            }
            Ok(Event::Comment(c)) => {
                if c.windows(2).any(|w| w == b"--") || c.ends_with(b"-") {
                    return Err(malformed(&reader, "`--` inside a comment"));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(OutlineError {
                    position: reader.error_position(),
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(OutlineError {
            position: reader.buffer_position(),
            message: format!("element <{open}> is never closed"),
        });
    }
    if outline.roots.is_empty() {
        return Err(OutlineError {
            position: 0,
            message: "document has no root element".to_string(),
        });
    }
    Ok(outline)
}

fn malformed(reader: &Reader<&[u8]>, message: impl Into<String>) -> OutlineError {
    OutlineError {
        position: reader.buffer_position(),
        message: message.into(),
    }
}

fn check_chars(text: &str) -> Result<(), String> {
    match text.chars().find(|c| !is_xml_char(*c)) {
        Some(c) => Err(format!("character U+{:04X} cannot appear in XML", u32::from(c))),
        None => Ok(()),
    }
}

/// Duplicate names, bad quoting and undefined entities in attribute values.
fn check_attributes(tag: &BytesStart<'_>) -> Result<(), String> {
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        check_chars(&value)?;
    }
    Ok(())
}

fn check_reference(r: &BytesRef<'_>) -> Result<(), String> {
    let name = String::from_utf8_lossy(r);
    if r.is_char_ref() {
        return match r.resolve_char_ref() {
            Ok(Some(c)) if is_xml_char(c) => Ok(()),
            Ok(Some(c)) => Err(format!("&{name}; refers to U+{:04X}, not an XML character", u32::from(c))),
            _ => Err(format!("invalid character reference &{name};")),
        };
    }
    if PREDEFINED_ENTITIES.contains(&name.as_ref()) {
        Ok(())
    } else {
        Err(format!("undefined entity &{name};"))
    }
}

fn record_element(outline: &mut FragmentOutline, depth: usize, in_body: bool, name: &str) {
    match depth {
        0 => outline.roots.push(name.to_string()),
        1 if outline.roots.len() == 1 => outline.root_children.push(name.to_string()),
        _ if in_body => outline.body_extras += 1,
        _ => {}
    }
}

/// Raw text between the body element's tags, CDATA markers included.
pub fn raw_body(xml: &str) -> Option<&str> {
    let open = format!("<{BODY_ELEMENT}>");
    let close = format!("</{BODY_ELEMENT}>");
    let start = xml.find(&open)? + open.len();
    let end = xml.rfind(&close)?;
    xml.get(start..end)
}
