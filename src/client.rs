//! Outbound HTTP: signed fetches, activity delivery and nodeinfo discovery.
use crate::{
    activity::{Actor, Message},
    cache::{Cache, CacheType, RESPONSE_MAX_AGE_HOURS},
    signer::{SigAlgorithm, Signer},
    store::Instance,
    util::host_from_uri,
    Error, Result,
};
use axum::http::StatusCode;
use reqwest::header;
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Cache namespace for raw GET response bodies.
const REQUEST_NS: &str = "request";

const ACCEPT: &str = "application/activity+json, application/json;q=0.9";
const USER_AGENT: &str = concat!("FediRelay/", env!("CARGO_PKG_VERSION"));

pub struct HttpClient {
    client: reqwest::Client,
    signer: Arc<Signer>,
    cache: Arc<dyn Cache>,
    limit: Semaphore,
}

impl HttpClient {
    pub fn new(
        signer: Arc<Signer>,
        cache: Arc<dyn Cache>,
        limit: usize,
        timeout: u64,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, ACCEPT.parse().expect("valid accept header"));

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::key(format!("unable to build http client: {e}")))?;

        Ok(Self {
            client,
            signer,
            cache,
            limit: Semaphore::new(limit),
        })
    }

    /// Fetch a JSON resource. Absence of any kind (non-200, parse failure,
    /// TLS or connection error, timeout) is `None`; callers must handle it.
    ///
    /// Successful bodies are cached for [`RESPONSE_MAX_AGE_HOURS`] unless
    /// `force` skips the cache.
    pub async fn get(&self, url: &str, sign: bool, force: bool) -> Option<Value> {
        let url = url.split('#').next().unwrap_or(url);

        if !force {
            if let Ok(item) = self.cache.get(REQUEST_NS, url) {
                if !item.older_than(RESPONSE_MAX_AGE_HOURS) {
                    return serde_json::from_str(&item.value).ok();
                }
            }
        }

        let _permit = self.limit.acquire().await.ok()?;

        let mut req = self.client.get(url);

        if sign {
            match self
                .signer
                .sign_headers("GET", url, None, SigAlgorithm::Original)
            {
                Ok(headers) => req = req.headers(headers),
                Err(e) => {
                    error!(%url, error=%e, "unable to sign request");
                    return None;
                }
            }
        }

        debug!(%url, "fetching resource");

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                log_request_error(url, &e);
                return None;
            }
        };

        // Not expecting a body with 202s, so just return
        if resp.status() == StatusCode::ACCEPTED {
            return None;
        }

        if resp.status() != StatusCode::OK {
            info!(%url, status=%resp.status(), "received error when requesting resource");
            return None;
        }

        let body = resp.text().await.ok()?;
        let parsed: Value = match serde_json::from_str(&body) {
            Ok(val) => val,
            Err(e) => {
                info!(%url, error=%e, "failed to parse response body");
                return None;
            }
        };

        if let Err(e) = self.cache.set(REQUEST_NS, url, &body, CacheType::Str) {
            warn!(%url, error=%e, "unable to cache response");
        }

        Some(parsed)
    }

    pub async fn get_actor(&self, uri: &str) -> Result<Actor> {
        let value = self
            .get(uri, true, false)
            .await
            .ok_or(Error::StatusAndMessage {
                status: StatusCode::BAD_REQUEST,
                message: "failed to fetch actor",
            })?;

        serde_json::from_value(value).map_err(|e| {
            info!(%uri, error=%e, "actor document is malformed");
            Error::StatusAndMessage {
                status: StatusCode::BAD_REQUEST,
                message: "failed to fetch actor",
            }
        })
    }

    /// Deliver an activity to a peer inbox. Outcomes are logged; nothing
    /// propagates to the worker loop.
    pub async fn post(&self, inbox: &str, message: &Message, instance: Option<&Instance>) {
        let algorithm = SigAlgorithm::for_software(instance.and_then(|i| i.software.as_deref()));
        let body = message.to_json();

        let headers = match self.signer.sign_headers("POST", inbox, Some(&body), algorithm) {
            Ok(headers) => headers,
            Err(e) => {
                error!(%inbox, error=%e, "unable to sign activity");
                return;
            }
        };

        let Ok(_permit) = self.limit.acquire().await else {
            return;
        };

        info!(kind=?message.kind(), %inbox, "sending activity");

        let res = self
            .client
            .post(inbox)
            .headers(headers)
            .header(header::CONTENT_TYPE, "application/activity+json")
            .body(body)
            .send()
            .await;

        match res {
            Ok(resp) if resp.status() == StatusCode::OK || resp.status() == StatusCode::ACCEPTED => {
                debug!(kind=?message.kind(), %inbox, "successfully sent activity");
            }

            Ok(resp) => {
                let status = resp.status();
                warn!(%inbox, %status, "received error when pushing activity");
                let body = resp.text().await.ok();
                debug!(?body, "error response");
            }

            Err(e) => log_request_error(inbox, &e),
        }
    }

    /// Discover the software a domain runs by walking its well-known
    /// nodeinfo document.
    pub async fn fetch_nodeinfo(&self, domain: &str, force: bool) -> Option<Nodeinfo> {
        let wk_url = format!("https://{domain}/.well-known/nodeinfo");
        let wk: WellKnownNodeinfo = match self.get(&wk_url, false, force).await {
            Some(value) => serde_json::from_value(value).ok()?,
            None => {
                info!(%domain, "failed to fetch well-known nodeinfo");
                return None;
            }
        };

        let url = match wk.schema_url() {
            Some(url) => url.to_owned(),
            None => {
                info!(%domain, "no supported nodeinfo schema advertised");
                return None;
            }
        };

        let value = self.get(&url, false, force).await?;
        serde_json::from_value(value).ok()
    }
}

fn log_request_error(url: &str, e: &reqwest::Error) {
    let domain = host_from_uri(url).unwrap_or_else(|_| url.to_owned());

    if e.is_timeout() {
        warn!(%domain, "request timed out");
    } else if e.is_connect() {
        warn!(%domain, "failed to connect");
    } else {
        warn!(%domain, error=%e, "request failed");
    }
}

/// `/.well-known/nodeinfo`: a list of links to versioned schema documents.
#[derive(Debug, Clone, Deserialize)]
pub struct WellKnownNodeinfo {
    pub links: Vec<NodeinfoLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeinfoLink {
    pub rel: String,
    pub href: String,
}

impl WellKnownNodeinfo {
    /// The document for the highest supported schema (2.1 preferred over 2.0).
    pub fn schema_url(&self) -> Option<&str> {
        for version in ["2.1", "2.0"] {
            if let Some(link) = self
                .links
                .iter()
                .find(|l| l.rel.ends_with(&format!("/schema/{version}")))
            {
                return Some(&link.href);
            }
        }

        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Nodeinfo {
    #[serde(default)]
    pub version: Option<String>,
    pub software: NodeinfoSoftware,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeinfoSoftware {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl Nodeinfo {
    pub fn sw_name(&self) -> String {
        self.software.name.to_lowercase()
    }
}
