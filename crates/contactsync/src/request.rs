//! Request descriptors for every remote operation.
//!
//! A [`RequestFactory`] fixes the URL template, verb and headers of each
//! operation. Sending is left to [`crate::client::RequestEngine`].

use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::config::{Endpoints, OAuthClientConfig};
use crate::error::SyncResult;
use crate::model::RemoteId;
use crate::secret::Secret;

pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_GDATA_VERSION: &str = "GData-Version";
pub const HEADER_METHOD_OVERRIDE: &str = "X-HTTP-Method-Override";
pub const HEADER_IF_MATCH: &str = "If-Match";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";

pub const GDATA_VERSION: &str = "3";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
pub const CONTENT_TYPE_ATOM: &str = "application/atom+xml";

/// Named remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Authenticate,
    TokenRequest,
    RefreshRequest,
    ListAll,
    ListByGroup,
    ListGroups,
    Get,
    Add,
    Update,
    Delete,
    AddGroup,
    UpdateGroup,
    DeleteGroup,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Authenticate => "authenticate",
            Operation::TokenRequest => "token_request",
            Operation::RefreshRequest => "refresh_request",
            Operation::ListAll => "list_all",
            Operation::ListByGroup => "list_by_group",
            Operation::ListGroups => "list_groups",
            Operation::Get => "get",
            Operation::Add => "add",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::AddGroup => "add_group",
            Operation::UpdateGroup => "update_group",
            Operation::DeleteGroup => "delete_group",
        }
    }

    /// Operations against the OAuth2 token endpoint.
    #[must_use]
    pub fn is_token_exchange(&self) -> bool {
        matches!(self, Operation::TokenRequest | Operation::RefreshRequest)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verb put on the wire. PUT and DELETE travel as tunneled POSTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Everything needed to issue one request.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub operation: Operation,
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    pub content_type: Option<&'static str>,
    pub headers: BTreeMap<String, String>,
    /// Account the request is made for.
    pub account: String,
}

impl RequestDescriptor {
    fn new(operation: Operation, method: Method, url: Url, account: &str) -> Self {
        Self {
            operation,
            method,
            url: url.into(),
            body: None,
            content_type: None,
            headers: BTreeMap::new(),
            account: account.to_string(),
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    fn body(mut self, content_type: &'static str, body: String) -> Self {
        self.content_type = Some(content_type);
        self.body = Some(body);
        self
    }

    fn bearer(self, token: &Secret) -> Self {
        self.header(HEADER_AUTHORIZATION, format!("Bearer {}", token.expose()))
            .header(HEADER_GDATA_VERSION, GDATA_VERSION)
    }

    /// Tunnel `verb` through POST. Every tunneled request mutates an existing entry.
    fn tunnel(self, verb: &str) -> Self {
        self.header(HEADER_METHOD_OVERRIDE, verb)
            .header(HEADER_IF_MATCH, "*")
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case(HEADER_AUTHORIZATION) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("RequestDescriptor")
            .field("operation", &self.operation)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("headers", &headers)
            .field("account", &self.account)
            .field("body_len", &self.body.as_ref().map(String::len))
            .finish()
    }
}

/// Builds descriptors against a fixed set of endpoints.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    endpoints: Endpoints,
}

impl RequestFactory {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Parse `raw` and upgrade `http` to `https`, except loopback hosts when allowed.
    pub fn normalize_url(&self, raw: &str) -> SyncResult<Url> {
        let mut url = Url::parse(raw.trim())?;
        if url.scheme() == "http" && !self.keeps_plain_http(&url) {
            // http and https are both special schemes, so the switch cannot fail.
            let _ = url.set_scheme("https");
        }
        Ok(url)
    }

    fn keeps_plain_http(&self, url: &Url) -> bool {
        self.endpoints.allow_insecure_loopback
            && matches!(url.host_str(), Some("127.0.0.1" | "localhost" | "[::1]"))
    }

    fn api_url(&self, path: &str) -> SyncResult<Url> {
        let base = self.endpoints.api_base.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        self.normalize_url(&format!("{base}/{path}"))
    }

    fn auth_url(&self, endpoint: &str) -> SyncResult<Url> {
        let base = self.endpoints.auth_base.trim_end_matches('/');
        self.normalize_url(&format!("{base}/{endpoint}"))
    }

    fn contacts_feed(&self, account: &str) -> SyncResult<Url> {
        self.api_url(&format!(
            "m8/feeds/contacts/{}/full",
            urlencoding::encode(account)
        ))
    }

    fn groups_feed(&self, account: &str) -> SyncResult<Url> {
        self.api_url(&format!(
            "m8/feeds/groups/{}/full",
            urlencoding::encode(account)
        ))
    }

    /// URL of an existing entry, always in the `full` projection.
    pub fn entry_url(&self, id: &RemoteId) -> SyncResult<Url> {
        self.api_url(&id.full_projection_path())
    }

    fn paged(mut url: Url, start_index: u32, max_results: u32) -> Url {
        url.query_pairs_mut()
            .append_pair("max-results", &max_results.to_string())
            .append_pair("start-index", &start_index.to_string());
        url
    }

    /// Consent page the user opens to grant access.
    pub fn authenticate(
        &self,
        oauth: &OAuthClientConfig,
        account: &str,
    ) -> SyncResult<RequestDescriptor> {
        let mut url = self.auth_url("auth")?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &oauth.client_id)
            .append_pair("redirect_uri", &oauth.redirect_uri)
            .append_pair("scope", &oauth.scope)
            .append_pair("access_type", "offline")
            .append_pair("login_hint", account);
        Ok(RequestDescriptor::new(
            Operation::Authenticate,
            Method::Get,
            url,
            account,
        ))
    }

    /// Authorization code exchange.
    pub fn token_request(
        &self,
        oauth: &OAuthClientConfig,
        account: &str,
        code: &str,
    ) -> SyncResult<RequestDescriptor> {
        let form = form_encode(&[
            ("code", code),
            ("client_id", &oauth.client_id),
            ("client_secret", oauth.client_secret.expose()),
            ("redirect_uri", &oauth.redirect_uri),
            ("grant_type", "authorization_code"),
        ]);
        Ok(RequestDescriptor::new(
            Operation::TokenRequest,
            Method::Post,
            self.auth_url("token")?,
            account,
        )
        .body(CONTENT_TYPE_FORM, form))
    }

    /// Refresh token exchange.
    pub fn refresh_request(
        &self,
        oauth: &OAuthClientConfig,
        account: &str,
        refresh_token: &Secret,
    ) -> SyncResult<RequestDescriptor> {
        let form = form_encode(&[
            ("refresh_token", refresh_token.expose()),
            ("client_id", &oauth.client_id),
            ("client_secret", oauth.client_secret.expose()),
            ("grant_type", "refresh_token"),
        ]);
        Ok(RequestDescriptor::new(
            Operation::RefreshRequest,
            Method::Post,
            self.auth_url("token")?,
            account,
        )
        .body(CONTENT_TYPE_FORM, form))
    }

    /// One page of the account's contacts.
    pub fn list_all(
        &self,
        account: &str,
        token: &Secret,
        start_index: u32,
        max_results: u32,
    ) -> SyncResult<RequestDescriptor> {
        let url = Self::paged(self.contacts_feed(account)?, start_index, max_results);
        Ok(RequestDescriptor::new(Operation::ListAll, Method::Get, url, account).bearer(token))
    }

    /// One page of the members of `group`.
    pub fn list_by_group(
        &self,
        account: &str,
        token: &Secret,
        group: &RemoteId,
        start_index: u32,
        max_results: u32,
    ) -> SyncResult<RequestDescriptor> {
        let mut url = Self::paged(self.contacts_feed(account)?, start_index, max_results);
        url.query_pairs_mut().append_pair("group", group.as_str());
        Ok(RequestDescriptor::new(Operation::ListByGroup, Method::Get, url, account).bearer(token))
    }

    /// One page of the account's groups.
    pub fn list_groups(
        &self,
        account: &str,
        token: &Secret,
        start_index: u32,
        max_results: u32,
    ) -> SyncResult<RequestDescriptor> {
        let url = Self::paged(self.groups_feed(account)?, start_index, max_results);
        Ok(RequestDescriptor::new(Operation::ListGroups, Method::Get, url, account).bearer(token))
    }

    pub fn get(
        &self,
        account: &str,
        token: &Secret,
        id: &RemoteId,
    ) -> SyncResult<RequestDescriptor> {
        Ok(
            RequestDescriptor::new(Operation::Get, Method::Get, self.entry_url(id)?, account)
                .bearer(token),
        )
    }

    /// Create a contact from a serialized Atom entry.
    pub fn add(
        &self,
        account: &str,
        token: &Secret,
        entry: String,
    ) -> SyncResult<RequestDescriptor> {
        Ok(
            RequestDescriptor::new(Operation::Add, Method::Post, self.contacts_feed(account)?, account)
                .bearer(token)
                .body(CONTENT_TYPE_ATOM, entry),
        )
    }

    pub fn update(
        &self,
        account: &str,
        token: &Secret,
        id: &RemoteId,
        entry: String,
    ) -> SyncResult<RequestDescriptor> {
        Ok(
            RequestDescriptor::new(Operation::Update, Method::Post, self.entry_url(id)?, account)
                .bearer(token)
                .tunnel("PUT")
                .body(CONTENT_TYPE_ATOM, entry),
        )
    }

    pub fn delete(
        &self,
        account: &str,
        token: &Secret,
        id: &RemoteId,
    ) -> SyncResult<RequestDescriptor> {
        Ok(
            RequestDescriptor::new(Operation::Delete, Method::Post, self.entry_url(id)?, account)
                .bearer(token)
                .tunnel("DELETE")
                .header(HEADER_CONTENT_LENGTH, "0"),
        )
    }

    pub fn add_group(
        &self,
        account: &str,
        token: &Secret,
        entry: String,
    ) -> SyncResult<RequestDescriptor> {
        Ok(RequestDescriptor::new(
            Operation::AddGroup,
            Method::Post,
            self.groups_feed(account)?,
            account,
        )
        .bearer(token)
        .body(CONTENT_TYPE_ATOM, entry))
    }

    pub fn update_group(
        &self,
        account: &str,
        token: &Secret,
        id: &RemoteId,
        entry: String,
    ) -> SyncResult<RequestDescriptor> {
        Ok(RequestDescriptor::new(
            Operation::UpdateGroup,
            Method::Post,
            self.entry_url(id)?,
            account,
        )
        .bearer(token)
        .tunnel("PUT")
        .body(CONTENT_TYPE_ATOM, entry))
    }

    pub fn delete_group(
        &self,
        account: &str,
        token: &Secret,
        id: &RemoteId,
    ) -> SyncResult<RequestDescriptor> {
        Ok(RequestDescriptor::new(
            Operation::DeleteGroup,
            Method::Post,
            self.entry_url(id)?,
            account,
        )
        .bearer(token)
        .tunnel("DELETE")
        .header(HEADER_CONTENT_LENGTH, "0"))
    }
}

fn form_encode(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().copied())
        .finish()
}
