//! The inbox endpoint: signature verification, policy enforcement and
//! admission control for `POST /inbox` (and `POST /actor`).
//!
//! Admission returns 202 immediately; processing happens in a spawned task.
use crate::{
    activity::Message,
    processor::{run_processor, InboxData},
    signature::{validate_request, Signature},
    Context, Error, Result,
};
use axum::{
    body::Bytes,
    extract::{Extension, OriginalUri},
    http::{header::HeaderMap, StatusCode},
};
use std::sync::Arc;
use tracing::{debug, error, info};

pub async fn post(
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
    Extension(ctx): Extension<Arc<Context>>,
    body: Bytes,
) -> Result<StatusCode> {
    let Some(raw_sig) = headers.get("signature") else {
        info!("missing signature header");
        return Err(Error::MissingSignature);
    };

    let sig = raw_sig
        .to_str()
        .map_err(|_| invalid("invalid signature header"))
        .and_then(|raw| Signature::parse(raw).map_err(|_| invalid("invalid signature header")))?;

    let message = Message::parse(&body).map_err(|_| {
        info!("failed to parse inbox message");
        invalid("failed to parse message")
    })?;

    if message.actor().is_none() {
        info!("actor not in message");
        return Err(invalid("no actor in message"));
    }

    let actor = match ctx.client.get_actor(&sig.key_id).await {
        Ok(actor) => actor,

        // ld signatures aren't handled, so silently drop tombstones from
        // actors that no longer resolve
        Err(_) if message.kind() == Some("Delete") => {
            info!(key_id = %sig.key_id, "delete from unresolvable actor dropped");
            return Ok(StatusCode::ACCEPTED);
        }

        Err(e) => {
            info!(key_id = %sig.key_id, "failed to fetch actor");
            return Err(e);
        }
    };

    validate_request(&actor, &sig, "post", uri.path(), &headers, &body).map_err(|e| {
        info!(actor = %actor.id, error = %e, "signature validation failed");
        e
    })?;

    let instance = {
        let mut session = ctx.store.session();

        // reject if the actor's domain is banned
        if session.get_domain_ban(&actor.domain()?)?.is_some() {
            info!(actor = %actor.id, "ignored request from banned actor");
            return Err(Error::StatusAndMessage {
                status: StatusCode::FORBIDDEN,
                message: "access denied",
            });
        }

        let instance = session.get_inbox(actor.shared_inbox()?)?;

        // only followers may post anything other than a follow
        if message.kind() != Some("Follow") && instance.is_none() {
            info!(actor = %actor.id, "rejected actor for trying to post while not following");
            return Err(Error::StatusAndMessage {
                status: StatusCode::UNAUTHORIZED,
                message: "access denied",
            });
        }

        instance
    };

    debug!(payload = %message.to_json(), "admitted inbox payload");

    let data = InboxData {
        message,
        actor,
        instance,
    };
    let ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if let Err(e) = run_processor(&ctx, data).await {
            error!(error = %e, "processor failed");
        }
    });

    Ok(StatusCode::ACCEPTED)
}

fn invalid(message: &'static str) -> Error {
    Error::StatusAndMessage {
        status: StatusCode::BAD_REQUEST,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CacheType,
        signer::{tests::TEST_PRIV_KEY, SigAlgorithm, Signer},
    };
    use axum::http::Uri;
    use serde_json::json;

    const INBOX: &str = "https://relay.example.net/inbox";

    fn seed_actor(ctx: &Context, domain: &str) {
        let doc = json!({
            "id": format!("https://{domain}/actor"),
            "type": "Application",
            "preferredUsername": "relay",
            "inbox": format!("https://{domain}/inbox"),
            "publicKey": {
                "id": format!("https://{domain}/actor#main-key"),
                "owner": format!("https://{domain}/actor"),
                "publicKeyPem": crate::signer::tests::TEST_PUB_KEY,
            },
        });

        // get() consults the response cache before the network
        ctx.cache
            .set(
                "request",
                &format!("https://{domain}/actor"),
                &doc.to_string(),
                CacheType::Str,
            )
            .expect("to seed the actor document");
    }

    fn signed_request(domain: &str, body: &str) -> HeaderMap {
        let signer = Signer::from_pem(
            format!("https://{domain}/actor#main-key"),
            TEST_PRIV_KEY,
        )
        .expect("test key to be valid");

        let mut headers = signer
            .sign_headers("post", INBOX, Some(body), SigAlgorithm::Original)
            .expect("to sign");

        headers.insert("host", "relay.example.net".parse().unwrap());
        headers.insert("content-length", body.len().to_string().parse().unwrap());

        headers
    }

    fn follow_body(domain: &str) -> String {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("https://{domain}/follows/F1"),
            "type": "Follow",
            "actor": format!("https://{domain}/actor"),
            "object": "https://relay.example.net/actor",
        })
        .to_string()
    }

    async fn run(
        ctx: Arc<Context>,
        headers: HeaderMap,
        body: &str,
    ) -> Result<StatusCode> {
        post(
            headers,
            OriginalUri(Uri::from_static("/inbox")),
            Extension(ctx),
            Bytes::from(body.as_bytes().to_vec()),
        )
        .await
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let (ctx, _rx) = Context::test();

        let res = run(ctx, HeaderMap::new(), &follow_body("a.example")).await;
        assert!(matches!(res, Err(Error::MissingSignature)));
    }

    #[tokio::test]
    async fn unparseable_body_is_a_bad_request() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");

        let headers = signed_request("a.example", "not json");
        let res = run(ctx, headers, "not json").await;

        assert!(matches!(
            res,
            Err(Error::StatusAndMessage {
                status: StatusCode::BAD_REQUEST,
                message: "failed to parse message",
            })
        ));
    }

    #[tokio::test]
    async fn missing_actor_field_is_a_bad_request() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");

        let body = json!({ "type": "Follow", "id": "https://a.example/f/1" }).to_string();
        let headers = signed_request("a.example", &body);
        let res = run(ctx, headers, &body).await;

        assert!(matches!(
            res,
            Err(Error::StatusAndMessage {
                status: StatusCode::BAD_REQUEST,
                message: "no actor in message",
            })
        ));
    }

    #[tokio::test]
    async fn tampered_body_fails_authentication() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");

        let body = follow_body("a.example");
        let headers = signed_request("a.example", &body);

        let tampered = body.replace("F1", "F2");
        let res = run(ctx, headers, &tampered).await;

        assert!(matches!(res, Err(Error::SignatureFailure(_))));
    }

    #[tokio::test]
    async fn banned_domains_are_forbidden() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "b.example");
        ctx.store
            .session()
            .put_domain_ban("b.example", Some("spam"), None)
            .unwrap();

        let body = follow_body("b.example");
        let headers = signed_request("b.example", &body);
        let res = run(ctx, headers, &body).await;

        assert!(matches!(
            res,
            Err(Error::StatusAndMessage {
                status: StatusCode::FORBIDDEN,
                message: "access denied",
            })
        ));
    }

    #[tokio::test]
    async fn non_followers_may_only_follow() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");

        let body = json!({
            "id": "https://a.example/activities/1",
            "type": "Announce",
            "actor": "https://a.example/actor",
            "object": "https://a.example/obj/1",
        })
        .to_string();
        let headers = signed_request("a.example", &body);
        let res = run(ctx, headers, &body).await;

        assert!(matches!(
            res,
            Err(Error::StatusAndMessage {
                status: StatusCode::UNAUTHORIZED,
                message: "access denied",
            })
        ));
    }

    #[tokio::test]
    async fn valid_follow_is_admitted() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");

        let body = follow_body("a.example");
        let headers = signed_request("a.example", &body);
        let res = run(ctx, headers, &body).await;

        assert_eq!(res.unwrap(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn announce_from_a_follower_is_admitted() {
        let (ctx, _rx) = Context::test();
        seed_actor(&ctx, "a.example");
        ctx.store
            .session()
            .put_inbox(
                "a.example",
                Some("https://a.example/inbox"),
                Some("https://a.example/actor"),
                None,
                None,
                Some(true),
            )
            .unwrap();

        let body = json!({
            "id": "https://a.example/activities/1",
            "type": "Announce",
            "actor": "https://a.example/actor",
            "object": "https://a.example/obj/1",
        })
        .to_string();
        let headers = signed_request("a.example", &body);
        let res = run(ctx, headers, &body).await;

        assert_eq!(res.unwrap(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn delete_from_unresolvable_actor_is_silently_dropped() {
        let (ctx, _rx) = Context::test();
        // no seeded actor document and no reachable network target

        let body = json!({
            "id": "https://gone.invalid/activities/1",
            "type": "Delete",
            "actor": "https://gone.invalid/actor",
            "object": "https://gone.invalid/users/old",
        })
        .to_string();
        let headers = signed_request("gone.invalid", &body);
        let res = run(ctx, headers, &body).await;

        assert_eq!(res.unwrap(), StatusCode::ACCEPTED);
    }
}
