//! `PROPFIND` multistatus parsing.
//!
//! Servers disagree on namespace prefixes (`d:`, `D:`, `lp1:`, none), so
//! elements are matched by local name only.

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::macros::format_description;

use crate::paths;

#[derive(Debug, Error)]
pub enum MultistatusError {
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("response entry has no href")]
    MissingHref,
}

/// One `<response>` entry of a multistatus body.
#[derive(Debug, Clone, Default)]
pub struct DavEntry {
    /// URL-decoded href, as sent by the server.
    pub href: String,
    pub display_name: String,
    pub content_type: Option<String>,
    pub content_length: i64,
    pub last_modified: Option<OffsetDateTime>,
    pub etag: Option<String>,
    pub is_collection: bool,
}

impl DavEntry {
    /// Canonical backend-absolute path derived from the href.
    pub fn abs_path(&self) -> String {
        paths::normalize(&self.href, self.is_collection)
    }
}

/// Parse a `207 Multi-Status` body into its response entries.
pub fn parse_multistatus(body: &str) -> Result<Vec<DavEntry>, MultistatusError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut element = String::new();
    let mut in_resourcetype = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().local_name().as_ref());
                match name.as_str() {
                    "response" => current = Some(DavEntry::default()),
                    "resourcetype" => in_resourcetype = true,
                    _ => element = name,
                }
            }
            // self-closing elements carry no text; only <collection/>
            // inside a resourcetype matters
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().local_name().as_ref());
                if name == "collection" && in_resourcetype {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(quick_xml::Error::from)?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(entry) = current.as_mut() {
                    match element.as_str() {
                        "href" => {
                            entry.href = urlencoding::decode(&text)
                                .map(|s| s.into_owned())
                                .unwrap_or(text);
                        }
                        "displayname" => entry.display_name = text,
                        "getcontenttype" => entry.content_type = Some(text),
                        "getcontentlength" => {
                            entry.content_length = text.parse().unwrap_or(0);
                        }
                        "getlastmodified" => entry.last_modified = parse_http_date(&text),
                        "getetag" => entry.etag = Some(normalize_etag(&text)),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().local_name().as_ref());
                match name.as_str() {
                    "response" => {
                        if let Some(entry) = current.take() {
                            if entry.href.is_empty() {
                                return Err(MultistatusError::MissingHref);
                            }
                            entries.push(entry);
                        }
                    }
                    "resourcetype" => in_resourcetype = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(err.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

fn local_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

/// Strip the weak marker and surrounding quotes from an etag value.
pub fn normalize_etag(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

/// `getlastmodified` arrives as an HTTP date; some servers send RFC 3339.
pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc2822) {
        return Some(parsed);
    }
    let gmt = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    if let Ok(parsed) = time::PrimitiveDateTime::parse(raw, gmt) {
        return Some(parsed.assume_utc());
    }
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}
