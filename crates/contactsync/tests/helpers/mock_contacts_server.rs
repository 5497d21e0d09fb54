//! Mock contacts service using wiremock for integration testing.
//!
//! Keeps contacts and groups in memory, serves the Atom feed and entry
//! endpoints plus the OAuth2 token endpoint, and can inject a status, an
//! undecodable body or a cancellation on a chosen call of any operation.

#![allow(dead_code)]

use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{header, method, path, path_regex};
use tokio_util::sync::CancellationToken;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use contactsync::atom;
use contactsync::{ContactRecord, Endpoints, GroupRecord, RemoteId, SystemGroup};

pub const ACCOUNT: &str = "user@example.com";
const ENCODED_ACCOUNT: &str = "user%40example.com";

const CONTACT_FEED: &str = r"^/m8/feeds/contacts/[^/]+/full$";
const CONTACT_ENTRY: &str = r"^/m8/feeds/contacts/[^/]+/full/[^/]+$";
const GROUP_FEED: &str = r"^/m8/feeds/groups/[^/]+/full$";
const GROUP_ENTRY: &str = r"^/m8/feeds/groups/[^/]+/full/[^/]+$";
const TOKEN_PATH: &str = "/o/oauth2/token";

/// Remote operations the mock distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListContacts,
    GetContact,
    AddContact,
    UpdateContact,
    DeleteContact,
    ListGroups,
    AddGroup,
    UpdateGroup,
    DeleteGroup,
    Token,
}

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub op: MockOp,
    pub authorization: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Default)]
struct MockState {
    contacts: BTreeMap<String, ContactRecord>,
    groups: BTreeMap<String, GroupRecord>,
    next_id: u64,
    counts: HashMap<MockOp, usize>,
    faults: HashMap<(MockOp, usize), u16>,
    garbled: HashSet<(MockOp, usize)>,
    cancel_on: HashMap<(MockOp, usize), CancellationToken>,
    raw_contact_entries: Vec<String>,
    update_stamp: Option<i64>,
    calls: Vec<RecordedCall>,
    tokens_issued: u64,
    rotate_refresh_token: bool,
}

/// A mock contacts service tracking every mutation.
pub struct MockContactsServer {
    server: MockServer,
    state: Arc<Mutex<MockState>>,
}

impl MockContactsServer {
    /// Start the server and mount every endpoint.
    pub async fn start() -> Self {
        let mock = Self {
            server: MockServer::start().await,
            state: Arc::new(Mutex::new(MockState::default())),
        };

        mock.mount(Mock::given(method("GET")).and(path_regex(CONTACT_FEED)), MockOp::ListContacts)
            .await;
        mock.mount(Mock::given(method("GET")).and(path_regex(CONTACT_ENTRY)), MockOp::GetContact)
            .await;
        mock.mount(Mock::given(method("POST")).and(path_regex(CONTACT_FEED)), MockOp::AddContact)
            .await;
        mock.mount(
            Mock::given(method("POST"))
                .and(path_regex(CONTACT_ENTRY))
                .and(header("X-HTTP-Method-Override", "PUT")),
            MockOp::UpdateContact,
        )
        .await;
        mock.mount(
            Mock::given(method("POST"))
                .and(path_regex(CONTACT_ENTRY))
                .and(header("X-HTTP-Method-Override", "DELETE")),
            MockOp::DeleteContact,
        )
        .await;
        mock.mount(Mock::given(method("GET")).and(path_regex(GROUP_FEED)), MockOp::ListGroups)
            .await;
        mock.mount(Mock::given(method("POST")).and(path_regex(GROUP_FEED)), MockOp::AddGroup)
            .await;
        mock.mount(
            Mock::given(method("POST"))
                .and(path_regex(GROUP_ENTRY))
                .and(header("X-HTTP-Method-Override", "PUT")),
            MockOp::UpdateGroup,
        )
        .await;
        mock.mount(
            Mock::given(method("POST"))
                .and(path_regex(GROUP_ENTRY))
                .and(header("X-HTTP-Method-Override", "DELETE")),
            MockOp::DeleteGroup,
        )
        .await;
        mock.mount(Mock::given(method("POST")).and(path(TOKEN_PATH)), MockOp::Token)
            .await;

        mock
    }

    async fn mount(&self, builder: wiremock::MockBuilder, op: MockOp) {
        let state = Arc::clone(&self.state);
        let base = self.uri();
        builder
            .respond_with(move |req: &Request| handle(&state, &base, op, req))
            .mount(&self.server)
            .await;
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Endpoints pointing at this server.
    pub fn endpoints(&self) -> Endpoints {
        Endpoints::loopback(&self.uri())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Id for a new contact entry.
    pub fn contact_id(&self, key: &str) -> RemoteId {
        RemoteId::new(format!(
            "{}/m8/feeds/contacts/{ENCODED_ACCOUNT}/base/{key}",
            self.uri()
        ))
    }

    pub fn group_id(&self, key: &str) -> RemoteId {
        RemoteId::new(format!(
            "{}/m8/feeds/groups/{ENCODED_ACCOUNT}/base/{key}",
            self.uri()
        ))
    }

    /// Store a contact remotely without going through the API.
    pub fn seed_contact(&self, mut record: ContactRecord) -> RemoteId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = self.contact_id(&format!("seed{}", state.next_id));
        record.local_id = None;
        record.remote_id = Some(id.clone());
        state.contacts.insert(id.as_str().to_string(), record);
        id
    }

    pub fn seed_group(&self, mut group: GroupRecord) -> RemoteId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = match group.system_group {
            Some(kind) => self.group_id(kind.builtin_id()),
            None => self.group_id(&format!("g{}", state.next_id)),
        };
        group.local_id = None;
        group.remote_id = Some(id.clone());
        state.groups.insert(id.as_str().to_string(), group);
        id
    }

    /// Seed the built-in `kind` group.
    pub fn seed_system_group(&self, kind: SystemGroup, updated: i64) -> RemoteId {
        self.seed_group(GroupRecord::new(kind.as_str(), updated).system(kind))
    }

    pub fn contacts(&self) -> Vec<ContactRecord> {
        self.lock().contacts.values().cloned().collect()
    }

    pub fn contact(&self, id: &RemoteId) -> Option<ContactRecord> {
        self.lock().contacts.get(id.as_str()).cloned()
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        self.lock().groups.values().cloned().collect()
    }

    /// Edit a stored contact as another client would.
    pub fn edit_contact(&self, id: &RemoteId, edit: impl FnOnce(&mut ContactRecord)) {
        if let Some(record) = self.lock().contacts.get_mut(id.as_str()) {
            edit(record);
        }
    }

    pub fn remove_contact(&self, id: &RemoteId) {
        self.lock().contacts.remove(id.as_str());
    }

    /// Answer the `nth` (1-based) call of `op` with `status`.
    pub fn fail_call(&self, op: MockOp, nth: usize, status: u16) {
        self.lock().faults.insert((op, nth), status);
    }

    /// Apply the `nth` call of `op` but answer 200 with a body that is not Atom.
    pub fn garble_reply(&self, op: MockOp, nth: usize) {
        self.lock().garbled.insert((op, nth));
    }

    /// Cancel `token` once the `nth` call of `op` has been answered.
    pub fn cancel_on(&self, op: MockOp, nth: usize, token: CancellationToken) {
        self.lock().cancel_on.insert((op, nth), token);
    }

    /// Append a verbatim `<entry>` to every contacts feed.
    pub fn seed_raw_contact_entry(&self, xml: impl Into<String>) {
        self.lock().raw_contact_entries.push(xml.into());
    }

    /// Stamp every updated contact with `updated` instead of the client's time.
    pub fn stamp_updates_at(&self, updated: i64) {
        self.lock().update_stamp = Some(updated);
    }

    /// Include a new refresh token in every token response.
    pub fn rotate_refresh_tokens(&self) {
        self.lock().rotate_refresh_token = true;
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.lock().counts.get(&op).copied().unwrap_or(0)
    }

    pub fn recorded(&self, op: MockOp) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Every mutating contact or group call.
    pub fn mutation_count(&self) -> usize {
        [
            MockOp::AddContact,
            MockOp::UpdateContact,
            MockOp::DeleteContact,
            MockOp::AddGroup,
            MockOp::UpdateGroup,
            MockOp::DeleteGroup,
        ]
        .iter()
        .map(|op| self.calls(*op))
        .sum()
    }

    pub fn tokens_issued(&self) -> u64 {
        self.lock().tokens_issued
    }
}

fn handle(state: &Mutex<MockState>, base: &str, op: MockOp, req: &Request) -> ResponseTemplate {
    let mut state = state.lock().unwrap();
    let nth = {
        let count = state.counts.entry(op).or_default();
        *count += 1;
        *count
    };

    let body = String::from_utf8_lossy(&req.body).into_owned();
    let headers: HashMap<String, String> = req
        .headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let query: Vec<(String, String)> = req
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    state.calls.push(RecordedCall {
        op,
        authorization: headers.get("authorization").cloned(),
        query: query.clone(),
        headers,
        body: body.clone(),
    });

    if let Some(token) = state.cancel_on.remove(&(op, nth)) {
        token.cancel();
    }
    if let Some(status) = state.faults.remove(&(op, nth)) {
        return ResponseTemplate::new(status).set_body_string("injected fault");
    }
    let response = respond(&mut state, base, op, req, &body, &query);
    if state.garbled.remove(&(op, nth)) {
        return ResponseTemplate::new(200).set_body_string("Updated");
    }
    response
}

fn respond(
    state: &mut MockState,
    base: &str,
    op: MockOp,
    req: &Request,
    body: &str,
    query: &[(String, String)],
) -> ResponseTemplate {
    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    let entry_key = || RemoteId::new(format!("{base}{}", req.url.path().replace("/full/", "/base/")));

    match op {
        MockOp::Token => {
            state.tokens_issued += 1;
            let mut response = json!({
                "access_token": format!("access-{}", state.tokens_issued),
                "token_type": "Bearer",
                "expires_in": 3600,
            });
            if state.rotate_refresh_token || body.contains("grant_type=authorization_code") {
                response["refresh_token"] = json!(format!("refresh-{}", state.tokens_issued));
            }
            ResponseTemplate::new(200).set_body_json(response)
        }
        MockOp::ListContacts => {
            let group = param("group").map(RemoteId::new);
            let records: Vec<&ContactRecord> = state
                .contacts
                .values()
                .filter(|c| match &group {
                    Some(g) => c.groups.contains(g.as_str()),
                    None => true,
                })
                .collect();
            let xml: Vec<String> = records
                .into_iter()
                .map(atom::contact_entry_xml)
                .chain(state.raw_contact_entries.iter().cloned())
                .collect();
            let entries: Vec<&String> = xml.iter().collect();
            let window = page(&entries, param("start-index"), param("max-results"));
            atom_response(200, feed(window.into_iter().cloned()))
        }
        MockOp::ListGroups => {
            let groups: Vec<&GroupRecord> = state.groups.values().collect();
            let entries = page(&groups, param("start-index"), param("max-results"))
                .into_iter()
                .map(atom::group_entry_xml);
            atom_response(200, feed(entries))
        }
        MockOp::GetContact => match state.contacts.get(entry_key().as_str()) {
            Some(record) => atom_response(200, atom::contact_entry_xml(record)),
            None => ResponseTemplate::new(404).set_body_string("no such contact"),
        },
        MockOp::AddContact => {
            state.next_id += 1;
            let id = RemoteId::new(format!(
                "{base}/m8/feeds/contacts/{ENCODED_ACCOUNT}/base/c{}",
                state.next_id
            ));
            match atom::parse_contact_entry(&with_id(&body, &id)) {
                Ok(record) => {
                    let xml = atom::contact_entry_xml(&record);
                    state.contacts.insert(id.as_str().to_string(), record);
                    atom_response(201, xml)
                }
                Err(e) => ResponseTemplate::new(422).set_body_string(e.to_string()),
            }
        }
        MockOp::UpdateContact => {
            let key = entry_key();
            if !state.contacts.contains_key(key.as_str()) {
                return ResponseTemplate::new(404).set_body_string("no such contact");
            }
            match atom::parse_contact_entry(&ensure_id(&body, &key)) {
                Ok(mut record) => {
                    record.remote_id = Some(key.clone());
                    if let Some(updated) = state.update_stamp {
                        record.last_modified = updated;
                    }
                    let xml = atom::contact_entry_xml(&record);
                    state.contacts.insert(key.as_str().to_string(), record);
                    atom_response(200, xml)
                }
                Err(e) => ResponseTemplate::new(422).set_body_string(e.to_string()),
            }
        }
        MockOp::DeleteContact => match state.contacts.remove(entry_key().as_str()) {
            Some(_) => ResponseTemplate::new(200),
            None => ResponseTemplate::new(404).set_body_string("no such contact"),
        },
        MockOp::AddGroup => {
            state.next_id += 1;
            let id = RemoteId::new(format!(
                "{base}/m8/feeds/groups/{ENCODED_ACCOUNT}/base/g{}",
                state.next_id
            ));
            match atom::parse_group_entry(&with_id(&body, &id)) {
                Ok(group) => {
                    let xml = atom::group_entry_xml(&group);
                    state.groups.insert(id.as_str().to_string(), group);
                    atom_response(201, xml)
                }
                Err(e) => ResponseTemplate::new(422).set_body_string(e.to_string()),
            }
        }
        MockOp::UpdateGroup => {
            let key = entry_key();
            if !state.groups.contains_key(key.as_str()) {
                return ResponseTemplate::new(404).set_body_string("no such group");
            }
            match atom::parse_group_entry(&ensure_id(&body, &key)) {
                Ok(mut group) => {
                    group.remote_id = Some(key.clone());
                    let xml = atom::group_entry_xml(&group);
                    state.groups.insert(key.as_str().to_string(), group);
                    atom_response(200, xml)
                }
                Err(e) => ResponseTemplate::new(422).set_body_string(e.to_string()),
            }
        }
        MockOp::DeleteGroup => match state.groups.remove(entry_key().as_str()) {
            Some(_) => ResponseTemplate::new(200),
            None => ResponseTemplate::new(404).set_body_string("no such group"),
        },
    }
}

fn page<'a, T>(items: &[&'a T], start: Option<String>, max: Option<String>) -> Vec<&'a T> {
    let start: usize = start.and_then(|s| s.parse().ok()).unwrap_or(1);
    let max: usize = max.and_then(|s| s.parse().ok()).unwrap_or(usize::MAX);
    items
        .iter()
        .skip(start.saturating_sub(1))
        .take(max)
        .copied()
        .collect()
}

/// Give a new entry the id the server assigned; the client never sends one.
fn with_id(body: &str, id: &RemoteId) -> String {
    body.replacen("<updated>", &format!("<id>{id}</id><updated>"), 1)
}

fn ensure_id(body: &str, id: &RemoteId) -> String {
    if body.contains("<id>") {
        body.to_string()
    } else {
        with_id(body, id)
    }
}

fn feed(entries: impl Iterator<Item = String>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><feed xmlns="http://www.w3.org/2005/Atom" xmlns:gd="http://schemas.google.com/g/2005" xmlns:gContact="http://schemas.google.com/contact/2008">{}</feed>"#,
        entries.collect::<String>()
    )
}

fn atom_response(status: u16, xml: String) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_raw(xml, "application/atom+xml")
}
