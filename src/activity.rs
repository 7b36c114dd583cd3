//! The subset of the activitypub vocabulary needed to run a relay.
//!
//! Inbound activities are arbitrary JSON-LD documents so [`Message`] wraps a
//! raw [`Value`] and exposes typed accessors for the handful of fields the
//! processor dispatches on.
use crate::{
    util::host_from_uri,
    Error, Result,
};
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const AP_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Accept,
    Announce,
    Create,
    Delete,
    Follow,
    Reject,
    Undo,
    Update,
}

impl ActivityType {
    pub fn parse(s: &str) -> Option<Self> {
        use ActivityType::*;

        match s {
            "Accept" => Some(Accept),
            "Announce" => Some(Announce),
            "Create" => Some(Create),
            "Delete" => Some(Delete),
            "Follow" => Some(Follow),
            "Reject" => Some(Reject),
            "Undo" => Some(Undo),
            "Update" => Some(Update),
            _ => None,
        }
    }
}

/// An activitypub activity as received on (or pushed out of) the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Value);

impl Message {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let val: Value = serde_json::from_slice(body).map_err(|e| Error::InvalidJson {
            uri: String::new(),
            raw: e.to_string(),
        })?;

        if !val.is_object() {
            return Err(Error::InvalidJson {
                uri: String::new(),
                raw: "expected a JSON object".to_owned(),
            });
        }

        Ok(Self(val))
    }

    pub fn from_value(val: Value) -> Self {
        Self(val)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }

    pub fn id(&self) -> Option<&str> {
        self.0["id"].as_str()
    }

    pub fn kind(&self) -> Option<&str> {
        self.0["type"].as_str()
    }

    pub fn activity_type(&self) -> Option<ActivityType> {
        self.kind().and_then(ActivityType::parse)
    }

    pub fn actor(&self) -> Option<&str> {
        self.0["actor"].as_str()
    }

    pub fn object(&self) -> &Value {
        &self.0["object"]
    }

    /// `object.id` when the object is nested, otherwise the object itself as
    /// a plain string id.
    pub fn object_id(&self) -> Option<&str> {
        let obj = self.object();

        match obj.get("id") {
            Some(id) => id.as_str(),
            None => obj.as_str(),
        }
    }

    pub fn object_type(&self) -> Option<&str> {
        self.object()["type"].as_str()
    }

    /// Host of the activity's own id.
    pub fn domain(&self) -> Result<String> {
        let id = self.id().ok_or_else(|| Error::InvalidUri {
            uri: String::new(),
        })?;

        host_from_uri(id)
    }

    pub fn new_actor(host: &str, pubkey: &str, name: &str, summary: &str) -> Self {
        Self(json!({
            "@context": AP_CONTEXT,
            "id": format!("https://{host}/actor"),
            "type": "Application",
            "preferredUsername": "relay",
            "name": name,
            "summary": summary,
            "followers": format!("https://{host}/followers"),
            "following": format!("https://{host}/following"),
            "inbox": format!("https://{host}/inbox"),
            "outbox": format!("https://{host}/outbox"),
            "url": format!("https://{host}/actor"),
            "endpoints": {
                "sharedInbox": format!("https://{host}/inbox"),
            },
            "publicKey": {
                "id": format!("https://{host}/actor#main-key"),
                "owner": format!("https://{host}/actor"),
                "publicKeyPem": pubkey,
            },
        }))
    }

    /// `object` is either a plain id string or a full nested activity.
    pub fn new_announce(host: &str, object: Value) -> Self {
        Self(json!({
            "@context": AP_CONTEXT,
            "id": format!("https://{host}/activities/{}", Uuid::new_v4()),
            "type": "Announce",
            "to": [format!("https://{host}/followers")],
            "actor": format!("https://{host}/actor"),
            "object": object,
        }))
    }

    pub fn new_follow(host: &str, actor: &str) -> Self {
        Self(json!({
            "@context": AP_CONTEXT,
            "id": format!("https://{host}/activities/{}", Uuid::new_v4()),
            "type": "Follow",
            "to": [actor],
            "actor": format!("https://{host}/actor"),
            "object": actor,
        }))
    }

    pub fn new_unfollow(host: &str, actor: &str, follow: Value) -> Self {
        Self(json!({
            "@context": AP_CONTEXT,
            "id": format!("https://{host}/activities/{}", Uuid::new_v4()),
            "type": "Undo",
            "to": [actor],
            "actor": format!("https://{host}/actor"),
            "object": follow,
        }))
    }

    pub fn new_response(host: &str, actor: &str, followid: &str, accept: bool) -> Self {
        Self(json!({
            "@context": AP_CONTEXT,
            "id": format!("https://{host}/activities/{}", Uuid::new_v4()),
            "type": if accept { "Accept" } else { "Reject" },
            "to": [actor],
            "actor": format!("https://{host}/actor"),
            "object": {
                "id": followid,
                "type": "Follow",
                "object": format!("https://{host}/actor"),
                "actor": actor,
            },
        }))
    }
}

/// A remote actor document, as fetched from the `keyId` of a signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub inbox: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(default)]
    pub public_key: Option<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

impl Actor {
    pub fn domain(&self) -> Result<String> {
        host_from_uri(&self.id)
    }

    /// Prefer the shared inbox when the peer publishes one.
    pub fn shared_inbox(&self) -> Result<&str> {
        if let Some(endpoints) = &self.endpoints {
            if let Some(shared) = endpoints.shared_inbox.as_deref() {
                return Ok(shared);
            }
        }

        self.inbox.as_deref().ok_or_else(|| Error::InvalidUri {
            uri: self.id.clone(),
        })
    }

    /// The actor's embedded public key. Accepts both SPKI ("BEGIN PUBLIC
    /// KEY") and PKCS#1 ("BEGIN RSA PUBLIC KEY") PEM encodings.
    pub fn key(&self) -> Result<RsaPublicKey> {
        let pem = &self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::key(format!("actor missing public key: {}", self.id)))?
            .public_key_pem;

        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::key(format!("unable to parse actor key: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn test_actor(id: &str) -> Self {
        let domain = host_from_uri(id).expect("test actor id to be a valid uri");

        Self {
            id: id.to_owned(),
            kind: Some("Application".to_owned()),
            inbox: Some(format!("https://{domain}/inbox")),
            preferred_username: Some("relay".to_owned()),
            endpoints: None,
            public_key: Some(PublicKey {
                id: format!("{id}#main-key"),
                owner: id.to_owned(),
                public_key_pem: crate::signer::tests::TEST_PUB_KEY.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "relay.example.net";

    #[test]
    fn object_id_handles_both_shapes() {
        let flat = Message::from_value(json!({ "object": "https://a.example/obj/1" }));
        let nested = Message::from_value(json!({ "object": { "id": "https://a.example/obj/1" } }));

        assert_eq!(flat.object_id(), Some("https://a.example/obj/1"));
        assert_eq!(nested.object_id(), Some("https://a.example/obj/1"));
    }

    #[test]
    fn announce_matches_the_wire_template() {
        let msg = Message::new_announce(HOST, json!("https://a.example/obj/1"));
        let val = msg.as_value();

        assert_eq!(val["@context"], json!(AP_CONTEXT));
        assert_eq!(val["type"], json!("Announce"));
        assert_eq!(val["actor"], json!(format!("https://{HOST}/actor")));
        assert_eq!(val["to"], json!([format!("https://{HOST}/followers")]));
        assert!(val["id"]
            .as_str()
            .unwrap()
            .starts_with(&format!("https://{HOST}/activities/")));
    }

    #[test]
    fn response_wraps_the_follow() {
        let msg = Message::new_response(HOST, "https://a.example/actor", "https://a.example/follows/1", false);
        let val = msg.as_value();

        assert_eq!(val["type"], json!("Reject"));
        assert_eq!(val["object"]["type"], json!("Follow"));
        assert_eq!(val["object"]["id"], json!("https://a.example/follows/1"));
        assert_eq!(val["object"]["actor"], json!("https://a.example/actor"));
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(Message::parse(b"[1, 2, 3]").is_err());
        assert!(Message::parse(b"not json").is_err());
        assert!(Message::parse(b"{\"type\": \"Follow\"}").is_ok());
    }

    #[test]
    fn shared_inbox_prefers_endpoints() {
        let mut actor = Actor::test_actor("https://a.example/actor");
        assert_eq!(actor.shared_inbox().unwrap(), "https://a.example/inbox");

        actor.endpoints = Some(Endpoints {
            shared_inbox: Some("https://a.example/shared".to_owned()),
        });
        assert_eq!(actor.shared_inbox().unwrap(), "https://a.example/shared");
    }
}
