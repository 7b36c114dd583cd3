//! Serving nodeinfo on /nodeinfo/2.0 and /nodeinfo/2.1
//!
//! The schema for the response format can be found here:
//!   http://nodeinfo.diaspora.software/ns/schema/2.0#
use crate::{Context, Error, Result};
use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn get(
    Path(version): Path<String>,
    Extension(ctx): Extension<Arc<Context>>,
) -> Result<impl IntoResponse> {
    if version != "2.0" && version != "2.1" {
        return Err(Error::StatusAndMessage {
            status: StatusCode::NOT_FOUND,
            message: "unsupported nodeinfo schema",
        });
    }

    let (open_regs, peers) = {
        let mut session = ctx.store.session();
        let settings = session.get_config_all()?;
        let peers: Vec<String> = session
            .get_inboxes()?
            .into_iter()
            .map(|i| i.domain)
            .collect();

        (!settings.whitelist_enabled, peers)
    };

    let headers = [(
        header::CONTENT_TYPE,
        format!(
            "application/json; profile=http://nodeinfo.diaspora.software/ns/schema/{version}#"
        ),
    )];

    Ok((headers, Json(NodeInfo::new(&version, open_regs, peers))))
}

/// NodeInfo schema versions 2.0 and 2.1
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    version: String,
    software: Software,
    protocols: Vec<&'static str>,
    services: Services,
    open_registrations: bool,
    usage: UsageStats,
    metadata: Value,
}

impl NodeInfo {
    pub fn new(version: &str, open_regs: bool, peers: Vec<String>) -> Self {
        Self {
            version: version.to_owned(),
            software: Software::new(version == "2.1"),
            protocols: vec!["activitypub"],
            services: Services::default(),
            open_registrations: open_regs,
            usage: UsageStats {
                users: UserStats {
                    total: 1,
                    active_month: peers.len() as u32,
                },
            },
            metadata: json!({ "peers": peers }),
        }
    }
}

/// Metadata about the server software in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Software {
    name: &'static str,
    version: &'static str,
    /// Only part of the 2.1 schema
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<&'static str>,
}

impl Software {
    fn new(with_repo: bool) -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            repository: with_repo.then_some("https://github.com/fedirelay/fedirelay"),
        }
    }
}

/// Third party services this server can exchange messages with. Always
/// empty for a relay but required by the schema.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Services {
    inbound: Vec<String>,
    outbound: Vec<String>,
}

/// Usage statistics for this server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    users: UserStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    total: u32,
    active_month: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_is_only_advertised_for_two_one() {
        let v20 = serde_json::to_value(NodeInfo::new("2.0", true, vec![])).unwrap();
        let v21 = serde_json::to_value(NodeInfo::new("2.1", true, vec![])).unwrap();

        assert!(v20["software"].get("repository").is_none());
        assert!(v21["software"].get("repository").is_some());
    }

    #[test]
    fn open_registrations_mirror_the_whitelist_setting() {
        let doc = serde_json::to_value(NodeInfo::new(
            "2.0",
            false,
            vec!["a.example".to_owned()],
        ))
        .unwrap();

        assert_eq!(doc["openRegistrations"], json!(false));
        assert_eq!(doc["protocols"], json!(["activitypub"]));
        assert_eq!(doc["metadata"]["peers"], json!(["a.example"]));
    }

    #[tokio::test]
    async fn unknown_schema_versions_are_not_found() {
        let (ctx, _rx) = Context::test();

        let res = get(Path("1.0".to_owned()), Extension(ctx)).await;
        assert!(matches!(
            res.map(|_| ()),
            Err(Error::StatusAndMessage {
                status: StatusCode::NOT_FOUND,
                ..
            })
        ));
    }
}
