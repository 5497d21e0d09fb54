//! Atom feed and entry codec for contacts and groups.

use chrono::{DateTime, SecondsFormat};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::error::{SyncError, SyncResult};
use crate::model::{fields, ContactRecord, GroupRecord, RemoteId, SystemGroup, Timestamp};

const NS_ATOM: &str = "http://www.w3.org/2005/Atom";
const NS_GD: &str = "http://schemas.google.com/g/2005";
const NS_GCONTACT: &str = "http://schemas.google.com/contact/2008";
const KIND_SCHEME: &str = "http://schemas.google.com/g/2005#kind";
const KIND_CONTACT: &str = "http://schemas.google.com/contact/2008#contact";
const KIND_GROUP: &str = "http://schemas.google.com/contact/2008#group";
const REL_PREFIX: &str = "http://schemas.google.com/g/2005#";
const REL_PHOTO: &str = "http://schemas.google.com/contacts/2008/rel#photo";

/// Format a timestamp the way the feeds do: RFC 3339 UTC with milliseconds.
pub fn format_timestamp(ts: Timestamp) -> String {
    DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp to whole seconds.
pub fn parse_timestamp(raw: &str) -> SyncResult<Timestamp> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp())
        .map_err(|e| SyncError::parse(format!("Invalid timestamp '{raw}': {e}")))
}

/// Everything collected from one `<entry>`.
#[derive(Debug, Default)]
struct RawEntry {
    id: Option<String>,
    updated: Option<String>,
    title: Option<String>,
    content: Option<String>,
    full_name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    /// (address, primary)
    emails: Vec<(String, bool)>,
    /// (rel suffix, number)
    phones: Vec<(String, String)>,
    address: Option<String>,
    org_name: Option<String>,
    org_title: Option<String>,
    photo_etag: Option<String>,
    groups: BTreeSet<String>,
    system_group: Option<String>,
    deleted: bool,
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().into_inner()).to_string()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().into_inner() == name.as_bytes() {
            a.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn rel_suffix(rel: &str) -> String {
    rel.rsplit('#').next().unwrap_or(rel).to_string()
}

/// Apply the attributes of an opening or empty element inside an entry.
fn open_element(entry: &mut RawEntry, name: &str, e: &BytesStart<'_>, pending_rel: &mut String) {
    match name {
        "email" => {
            if let Some(address) = attr(e, "address") {
                let primary = attr(e, "primary").is_some_and(|p| p == "true");
                entry.emails.push((address, primary));
            }
        }
        "phoneNumber" => {
            *pending_rel = attr(e, "rel").map(|r| rel_suffix(&r)).unwrap_or_default();
        }
        "groupMembershipInfo" => {
            let deleted = attr(e, "deleted").is_some_and(|d| d == "true");
            if let (Some(href), false) = (attr(e, "href"), deleted) {
                entry.groups.insert(RemoteId::new(href).to_string());
            }
        }
        "systemGroup" => entry.system_group = attr(e, "id"),
        "link" => {
            if attr(e, "rel").as_deref() == Some(REL_PHOTO) {
                entry.photo_etag = attr(e, "etag");
            }
        }
        "deleted" => entry.deleted = true,
        _ => {}
    }
}

fn close_element(entry: &mut RawEntry, name: &str, parent: Option<&str>, text: String, rel: &str) {
    if text.is_empty() {
        return;
    }
    match (name, parent) {
        ("id", Some("entry")) => entry.id = Some(text),
        ("updated", Some("entry")) => entry.updated = Some(text),
        ("title", Some("entry")) => entry.title = Some(text),
        ("content", Some("entry")) => entry.content = Some(text),
        ("fullName", _) => entry.full_name = Some(text),
        ("givenName", _) => entry.given_name = Some(text),
        ("familyName", _) => entry.family_name = Some(text),
        ("phoneNumber", _) => entry.phones.push((rel.to_string(), text)),
        ("formattedAddress", _) => entry.address = Some(text),
        ("orgName", _) => entry.org_name = Some(text),
        ("orgTitle", _) => entry.org_title = Some(text),
        _ => {}
    }
}

/// Collect every `<entry>` of a feed, or the root entry of a single-entry document.
fn parse_entries(xml: &str) -> SyncResult<Vec<RawEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut pending_rel = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e);
                text.clear();
                if name == "entry" {
                    current = Some(RawEntry::default());
                } else if let Some(entry) = current.as_mut() {
                    open_element(entry, &name, e, &mut pending_rel);
                }
                stack.push(name);
            }
            Ok(Event::Empty(ref e)) => {
                let name = local_name(e);
                if let Some(entry) = current.as_mut() {
                    open_element(entry, &name, e, &mut pending_rel);
                }
            }
            Ok(Event::Text(ref e)) => {
                let value = e
                    .unescape()
                    .map_err(|e| SyncError::parse(format!("XML text error: {e}")))?;
                text.push_str(&value);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                let value = std::mem::take(&mut text).trim().to_string();
                if name == "entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                } else if let Some(entry) = current.as_mut() {
                    close_element(
                        entry,
                        &name,
                        stack.last().map(String::as_str),
                        value,
                        &pending_rel,
                    );
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SyncError::parse(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn required_id(entry: &RawEntry) -> SyncResult<RemoteId> {
    entry
        .id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .map(RemoteId::new)
        .ok_or_else(|| SyncError::parse("Entry without <id>"))
}

fn required_updated(entry: &RawEntry) -> SyncResult<Timestamp> {
    let raw = entry
        .updated
        .as_deref()
        .ok_or_else(|| SyncError::parse("Entry without <updated>"))?;
    parse_timestamp(raw)
}

fn contact_from(entry: RawEntry) -> SyncResult<ContactRecord> {
    let mut record = ContactRecord::new(required_updated(&entry)?);
    record.remote_id = Some(required_id(&entry)?);

    let mut set = |name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            record.fields.insert(name.to_string(), value);
        }
    };

    set(fields::DISPLAY_NAME, entry.full_name.or(entry.title));
    set(fields::GIVEN_NAME, entry.given_name);
    set(fields::FAMILY_NAME, entry.family_name);

    let mut emails = entry.emails;
    if let Some(pos) = emails.iter().position(|(_, primary)| *primary) {
        let primary = emails.remove(pos);
        emails.insert(0, primary);
    }
    let mut emails = emails.into_iter().map(|(address, _)| address);
    set(fields::PRIMARY_EMAIL, emails.next());
    set(fields::SECOND_EMAIL, emails.next());

    for (rel, number) in entry.phones {
        let field = match rel.as_str() {
            "work" => fields::WORK_PHONE,
            "home" => fields::HOME_PHONE,
            "mobile" => fields::MOBILE_PHONE,
            _ => continue,
        };
        set(field, Some(number));
    }

    set(fields::ADDRESS, entry.address);
    set(fields::ORGANIZATION, entry.org_name);
    set(fields::JOB_TITLE, entry.org_title);
    set(fields::NOTES, entry.content);
    set(fields::PHOTO_ETAG, entry.photo_etag);

    record.groups = entry.groups;
    Ok(record)
}

fn group_from(entry: RawEntry) -> SyncResult<GroupRecord> {
    let mut group = GroupRecord::new(
        entry.title.clone().unwrap_or_default(),
        required_updated(&entry)?,
    );
    group.remote_id = Some(required_id(&entry)?);
    group.system_group = entry
        .system_group
        .as_deref()
        .and_then(|id| id.parse::<SystemGroup>().ok());
    if let Some(kind) = group.system_group {
        if group.name.is_empty() {
            group.name = kind.as_str().to_string();
        }
    }
    Ok(group)
}

/// An entry of a feed page that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableEntry {
    /// The entry's id, when it carried a usable one.
    pub id: Option<RemoteId>,
    pub reason: String,
}

/// One decoded feed page.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed<T> {
    pub records: Vec<T>,
    pub unreadable: Vec<UnreadableEntry>,
    /// Entries on the page, including deleted and unreadable ones.
    pub entries: usize,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            unreadable: Vec::new(),
            entries: 0,
        }
    }
}

impl<T> Feed<T> {
    /// Append the entries of a following page.
    pub fn extend(&mut self, page: Feed<T>) {
        self.records.extend(page.records);
        self.unreadable.extend(page.unreadable);
        self.entries += page.entries;
    }
}

/// Decode every live entry of a feed. A malformed document is an error; a
/// single entry that cannot be decoded is reported in [`Feed::unreadable`].
fn parse_feed<T>(xml: &str, decode: fn(RawEntry) -> SyncResult<T>) -> SyncResult<Feed<T>> {
    let raw = parse_entries(xml)?;
    let mut feed = Feed {
        entries: raw.len(),
        ..Feed::default()
    };
    for entry in raw.into_iter().filter(|e| !e.deleted) {
        let id = required_id(&entry).ok();
        match decode(entry) {
            Ok(record) => feed.records.push(record),
            Err(err) => feed.unreadable.push(UnreadableEntry {
                id,
                reason: err.to_string(),
            }),
        }
    }
    Ok(feed)
}

/// Parse a contacts feed. Entries marked deleted are skipped.
pub fn parse_contact_feed(xml: &str) -> SyncResult<Feed<ContactRecord>> {
    parse_feed(xml, contact_from)
}

/// Parse a single contact entry, as returned by create and update.
pub fn parse_contact_entry(xml: &str) -> SyncResult<ContactRecord> {
    parse_entries(xml)?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::parse("Response contains no entry"))
        .and_then(contact_from)
}

/// Parse a groups feed. Entries marked deleted are skipped.
pub fn parse_group_feed(xml: &str) -> SyncResult<Feed<GroupRecord>> {
    parse_feed(xml, group_from)
}

/// Parse a single group entry.
pub fn parse_group_entry(xml: &str) -> SyncResult<GroupRecord> {
    parse_entries(xml)?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::parse("Response contains no entry"))
        .and_then(group_from)
}

fn open_entry(out: &mut String, kind: &str, id: Option<&RemoteId>, updated: Timestamp) {
    let _ = write!(
        out,
        r#"<entry xmlns="{NS_ATOM}" xmlns:gd="{NS_GD}" xmlns:gContact="{NS_GCONTACT}"><category scheme="{KIND_SCHEME}" term="{kind}"/>"#
    );
    if let Some(id) = id {
        let _ = write!(out, "<id>{}</id>", escape(id.as_str()));
    }
    let _ = write!(out, "<updated>{}</updated>", format_timestamp(updated));
}

/// Serialize a contact whose `groups` already hold remote group ids.
pub fn contact_entry_xml(record: &ContactRecord) -> String {
    let mut out = String::new();
    open_entry(&mut out, KIND_CONTACT, record.remote_id.as_ref(), record.last_modified);

    let field = |name: &str| record.field(name).map(|v| escape(v).into_owned());

    if let Some(name) = field(fields::DISPLAY_NAME) {
        let _ = write!(out, "<title>{name}</title>");
    }
    if let Some(notes) = field(fields::NOTES) {
        let _ = write!(out, r#"<content type="text">{notes}</content>"#);
    }

    let (full, given, family) = (
        field(fields::DISPLAY_NAME),
        field(fields::GIVEN_NAME),
        field(fields::FAMILY_NAME),
    );
    if full.is_some() || given.is_some() || family.is_some() {
        out.push_str("<gd:name>");
        if let Some(v) = full {
            let _ = write!(out, "<gd:fullName>{v}</gd:fullName>");
        }
        if let Some(v) = given {
            let _ = write!(out, "<gd:givenName>{v}</gd:givenName>");
        }
        if let Some(v) = family {
            let _ = write!(out, "<gd:familyName>{v}</gd:familyName>");
        }
        out.push_str("</gd:name>");
    }

    if let Some(email) = field(fields::PRIMARY_EMAIL) {
        let _ = write!(
            out,
            r#"<gd:email rel="{REL_PREFIX}home" address="{email}" primary="true"/>"#
        );
    }
    if let Some(email) = field(fields::SECOND_EMAIL) {
        let _ = write!(out, r#"<gd:email rel="{REL_PREFIX}other" address="{email}"/>"#);
    }

    for (name, rel) in [
        (fields::WORK_PHONE, "work"),
        (fields::HOME_PHONE, "home"),
        (fields::MOBILE_PHONE, "mobile"),
    ] {
        if let Some(number) = field(name) {
            let _ = write!(
                out,
                r#"<gd:phoneNumber rel="{REL_PREFIX}{rel}">{number}</gd:phoneNumber>"#
            );
        }
    }

    if let Some(address) = field(fields::ADDRESS) {
        let _ = write!(
            out,
            r#"<gd:structuredPostalAddress rel="{REL_PREFIX}home"><gd:formattedAddress>{address}</gd:formattedAddress></gd:structuredPostalAddress>"#
        );
    }

    let (org, title) = (field(fields::ORGANIZATION), field(fields::JOB_TITLE));
    if org.is_some() || title.is_some() {
        let _ = write!(out, r#"<gd:organization rel="{REL_PREFIX}work">"#);
        if let Some(v) = org {
            let _ = write!(out, "<gd:orgName>{v}</gd:orgName>");
        }
        if let Some(v) = title {
            let _ = write!(out, "<gd:orgTitle>{v}</gd:orgTitle>");
        }
        out.push_str("</gd:organization>");
    }

    for group in &record.groups {
        let _ = write!(
            out,
            r#"<gContact:groupMembershipInfo deleted="false" href="{}"/>"#,
            escape(group.as_str())
        );
    }

    out.push_str("</entry>");
    out
}

/// Serialize a group entry.
pub fn group_entry_xml(group: &GroupRecord) -> String {
    let mut out = String::new();
    open_entry(&mut out, KIND_GROUP, group.remote_id.as_ref(), group.last_modified);
    let _ = write!(out, "<title>{}</title>", escape(group.name.as_str()));
    if let Some(kind) = group.system_group {
        let _ = write!(out, r#"<gContact:systemGroup id="{}"/>"#, kind.as_str());
    }
    out.push_str("</entry>");
    out
}
