//! Maps one parsed feed entry onto a [`NormalizedPosting`].
//!
//! Every output field has an ordered list of candidate element names drawn from
//! the vocabularies seen in practice (plain RSS, `content:`/`dc:`/`media:`
//! extensions, WordPress job-board `job_listing:` fields, and Atom). The first
//! candidate that is present and non-empty wins.
//!
//! Canonicalization is total: it never fails and never panics. An entry with no
//! usable identity yields `None` and is dropped by the caller.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use super::document::Node;
use crate::storage::NormalizedPosting;

const IDENTITY_FIELDS: &[&str] = &["guid", "link", "id"];
const TITLE_FIELDS: &[&str] = &["title"];
const DESCRIPTION_FIELDS: &[&str] = &["description", "content:encoded", "summary", "content"];
const COMPANY_FIELDS: &[&str] = &["job_listing:company", "dc:creator", "creator"];
const LOCATION_FIELDS: &[&str] = &["job_listing:location", "location", "job:location"];
const EMPLOYMENT_TYPE_FIELDS: &[&str] = &["job_listing:job_type", "job:job_type"];
const DATE_FIELDS: &[&str] = &["pubDate", "published", "updated", "dc:date"];
const MEDIA_FIELDS: &[&str] = &["media:content", "media:thumbnail"];
const CATEGORY_FIELD: &str = "category";

/// Canonicalize one feed entry fetched from `source_url`.
pub fn canonicalize(source_url: &str, entry: &Node) -> Option<NormalizedPosting> {
    let external_id = identity(entry)?.to_string();

    Some(NormalizedPosting {
        external_id,
        source_url: source_url.to_string(),
        title: owned(entry.first_text(TITLE_FIELDS)).unwrap_or_default(),
        description: owned(entry.first_text(DESCRIPTION_FIELDS)).unwrap_or_default(),
        company: owned(entry.first_text(COMPANY_FIELDS)),
        location: owned(entry.first_text(LOCATION_FIELDS)),
        employment_type: owned(entry.first_text(EMPLOYMENT_TYPE_FIELDS)),
        link: entry.get("link").and_then(link_href).map(str::to_string),
        image_url: image_url(entry).map(str::to_string),
        categories: categories(entry),
        publish_date: entry.first_text(DATE_FIELDS).and_then(parse_date),
        raw: entry.to_json(),
    })
}

fn owned(s: Option<&str>) -> Option<String> {
    s.map(str::to_string)
}

/// `guid`, then `link`, then `id`; the first non-empty candidate wins.
fn identity(entry: &Node) -> Option<&str> {
    IDENTITY_FIELDS.iter().find_map(|name| {
        let node = entry.get(name)?;
        if *name == "link" {
            link_href(node)
        } else {
            node.text()
        }
    })
}

/// Text of a `link` element, or the `href` of an Atom link.
///
/// Among several Atom links the one without `rel` (or `rel="alternate"`) is
/// preferred, falling back to the first with an href.
fn link_href(node: &Node) -> Option<&str> {
    let links = node.items();
    links
        .iter()
        .filter(|l| matches!(l.attribute("rel"), None | Some("alternate")))
        .find_map(href)
        .or_else(|| links.iter().find_map(href))
}

fn href(link: &Node) -> Option<&str> {
    link.text().or_else(|| link.attribute("href"))
}

/// `url` attribute of the first media attachment.
///
/// The attachment (and its `url`) may appear repeated; the first value wins.
fn image_url(entry: &Node) -> Option<&str> {
    MEDIA_FIELDS.iter().find_map(|name| {
        let media = entry.get(name)?.first();
        media.attribute("url").or_else(|| media.get("url").and_then(Node::text))
    })
}

/// Every category in document order; Atom categories carry a `term` attribute.
fn categories(entry: &Node) -> Vec<String> {
    entry
        .get_all(CATEGORY_FIELD)
        .iter()
        .filter_map(|c| c.text().or_else(|| c.attribute("term")))
        .map(str::to_string)
        .collect()
}

/// Parse a feed timestamp. Unparseable input yields `None`.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
