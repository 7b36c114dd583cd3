//! The `.well-known` discovery endpoints.
use crate::{routes::extractors::Jrd, Context, Error, Result};
use axum::{
    extract::{Extension, Query},
    http::{header, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const NODEINFO_NS_20: &str = "http://nodeinfo.diaspora.software/ns/schema/2.0";
pub const NODEINFO_NS_21: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

pub async fn host_meta(Extension(ctx): Extension<Arc<Context>>) -> impl IntoResponse {
    let headers = [(header::CONTENT_TYPE, "application/xrd+xml")];
    let domain = &ctx.config.domain;
    let body = format!(
        r#"<?xml version="1.0"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/xrd+xml" template="https://{domain}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#
    );

    (headers, body)
}

pub async fn nodeinfo(Extension(ctx): Extension<Arc<Context>>) -> Jrd<Value> {
    let domain = &ctx.config.domain;

    Jrd(json!({
        "links": [
            {
                "rel": NODEINFO_NS_20,
                "href": format!("https://{domain}/nodeinfo/2.0"),
            },
            {
                "rel": NODEINFO_NS_21,
                "href": format!("https://{domain}/nodeinfo/2.1"),
            }
        ]
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub aliases: Vec<String>,
    pub links: Vec<Link>,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Deserialize)]
pub struct Params {
    resource: String,
}

// https://tools.ietf.org/html/rfc7033
pub async fn webfinger(
    Extension(ctx): Extension<Arc<Context>>,
    Query(Params { resource }): Query<Params>,
) -> Result<Jrd<Resource>> {
    let (user, domain) = parse_webfinger_resource(&resource)?;

    if user != "relay" || domain != ctx.config.domain {
        return Err(Error::StatusAndMessage {
            status: StatusCode::NOT_FOUND,
            message: "user not found",
        });
    }

    let href = ctx.config.actor();

    Ok(Jrd(Resource {
        aliases: vec![href.clone()],
        subject: resource.clone(),
        links: vec![
            Link {
                href: href.clone(),
                rel: "self".to_owned(),
                ty: r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#
                    .to_owned(),
            },
            Link {
                href,
                rel: "self".to_owned(),
                ty: "application/activity+json".to_owned(),
            },
        ],
    }))
}

// parse a resource param of the form: /.well-known/webfinger?resource=acct:relay@relay.example.com
fn parse_webfinger_resource(resource: &str) -> Result<(&str, &str)> {
    let uri = match resource.strip_prefix("acct:") {
        Some(s) => s,

        None => {
            return Err(Error::MalformedWebfingerResource {
                resource: resource.to_owned(),
            })
        }
    };

    let parts: Vec<&str> = uri.split('@').collect();
    if parts.len() != 2 {
        return Err(Error::MalformedWebfingerUri {
            uri: uri.to_owned(),
        });
    };

    Ok((parts[0], parts[1]))
}
