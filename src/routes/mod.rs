//! Routes available on this server.
//!
//! We implement the subset of the activitypub API needed to function as a
//! relay: the relay actor surface plus the inbox.
use crate::{activity::Message, Context, Result};
use axum::{
    extract::{Extension, OriginalUri},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub mod extractors;
mod inbox;
mod nodeinfo;
mod well_known;

use extractors::Activity;

pub fn build_routes(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/actor", get(actor).post(inbox::post))
        .route("/inbox", get(actor).post(inbox::post))
        .route("/outbox", get(outbox))
        .route("/followers", get(collection))
        .route("/following", get(collection))
        .route("/.well-known/webfinger", get(well_known::webfinger))
        .route("/.well-known/host-meta", get(well_known::host_meta))
        .route("/.well-known/nodeinfo", get(well_known::nodeinfo))
        .route("/nodeinfo/:version", get(nodeinfo::get))
        .layer(Extension(ctx))
}

/// The relay actor document, served on /actor and /inbox.
pub async fn actor(Extension(ctx): Extension<Arc<Context>>) -> Result<Activity<Value>> {
    let settings = {
        let mut session = ctx.store.session();
        session.get_config_all()?
    };

    let doc = Message::new_actor(
        &ctx.config.domain,
        &ctx.signer.public_pem(),
        &settings.name,
        &render_markdown(&settings.note),
    );

    Ok(Activity(doc.as_value().clone()))
}

/// `/followers` and `/following`: both are the set of subscribed instances.
pub async fn collection(
    OriginalUri(uri): OriginalUri,
    Extension(ctx): Extension<Arc<Context>>,
) -> Result<Activity<Value>> {
    let items: Vec<String> = {
        let mut session = ctx.store.session();
        session
            .get_inboxes()?
            .into_iter()
            .filter_map(|i| i.actor)
            .collect()
    };

    Ok(Activity(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("https://{}{}", ctx.config.domain, uri.path()),
        "type": "Collection",
        "totalItems": items.len(),
        "items": items,
    })))
}

/// The relay never originates content of its own.
pub async fn outbox(Extension(ctx): Extension<Arc<Context>>) -> Activity<Value> {
    Activity(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("https://{}/outbox", ctx.config.domain),
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": [],
    }))
}

fn render_markdown(src: &str) -> String {
    let parser = pulldown_cmark::Parser::new(src);
    let mut out = String::new();
    pulldown_cmark::html::push_html(&mut out, parser);

    out.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;

    #[test]
    fn markdown_notes_render_to_html()  {
        assert_eq!(
            render_markdown("make a *note* here"),
            "<p>make a <em>note</em> here</p>"
        );
    }

    #[tokio::test]
    async fn actor_document_exposes_the_public_key() {
        let (ctx, _rx) = Context::test();

        let Activity(doc) = actor(Extension(ctx.clone())).await.unwrap();

        assert_eq!(doc["type"], json!("Application"));
        assert_eq!(doc["preferredUsername"], json!("relay"));
        assert_eq!(doc["id"], json!("https://relay.example.net/actor"));
        assert_eq!(
            doc["publicKey"]["id"],
            json!("https://relay.example.net/actor#main-key")
        );
        assert_eq!(
            doc["publicKey"]["publicKeyPem"],
            json!(ctx.signer.public_pem())
        );
        assert_eq!(
            doc["endpoints"]["sharedInbox"],
            json!("https://relay.example.net/inbox")
        );
    }

    #[tokio::test]
    async fn collections_list_accepted_actors_only() {
        let (ctx, _rx) = Context::test();

        {
            let mut session = ctx.store.session();
            for (domain, accepted) in [("a.example", true), ("p.example", false)] {
                session
                    .put_inbox(
                        domain,
                        Some(&format!("https://{domain}/inbox")),
                        Some(&format!("https://{domain}/actor")),
                        None,
                        None,
                        Some(accepted),
                    )
                    .unwrap();
            }
        }

        let Activity(doc) = collection(
            OriginalUri(Uri::from_static("/followers")),
            Extension(ctx),
        )
        .await
        .unwrap();

        assert_eq!(doc["id"], json!("https://relay.example.net/followers"));
        assert_eq!(doc["totalItems"], json!(1));
        assert_eq!(doc["items"], json!(["https://a.example/actor"]));
    }

    #[tokio::test]
    async fn outbox_is_empty() {
        let (ctx, _rx) = Context::test();

        let Activity(doc) = outbox(Extension(ctx)).await;
        assert_eq!(doc["type"], json!("OrderedCollection"));
        assert_eq!(doc["totalItems"], json!(0));
    }
}
