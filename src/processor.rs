//! Maps admitted inbound activities to relay/forward/follow/undo behaviour.
use crate::{
    activity::{ActivityType, Actor, Message},
    cache::CacheType,
    store::{Instance, RelaySettings},
    Context, Error, Result,
};
use serde_json::Value;
use tracing::{debug, info};

/// Cache namespace for de-duplicating relayed and forwarded activities.
const DEDUP_NS: &str = "handle-relay";

/// Everything the inbox endpoint admitted for one activity.
#[derive(Debug, Clone)]
pub struct InboxData {
    pub message: Message,
    pub actor: Actor,
    pub instance: Option<Instance>,
}

/// Single entrypoint: dispatches on the activity type.
pub async fn run_processor(ctx: &Context, mut data: InboxData) -> Result<()> {
    use ActivityType::*;

    let Some(kind) = data.message.activity_type() else {
        info!(
            kind = ?data.message.kind(),
            actor = %data.actor.id,
            "activity type cannot be handled"
        );
        return Ok(());
    };

    backfill_instance(ctx, &mut data).await?;

    info!(?kind, actor = %data.actor.id, "new activity from actor");

    match kind {
        Announce | Create => handle_relay(ctx, &data).await,
        Delete | Update => handle_forward(ctx, &data).await,
        Follow => handle_follow(ctx, &mut data).await,
        Undo => handle_undo(ctx, &data).await,
        Accept | Reject => Ok(()),
    }
}

/// Fill in `software` and `actor` for senders that followed before we
/// started recording them.
async fn backfill_instance(ctx: &Context, data: &mut InboxData) -> Result<()> {
    let Some(instance) = data.instance.clone() else {
        return Ok(());
    };

    if instance.software.is_none() {
        if let Some(nodeinfo) = ctx.client.fetch_nodeinfo(&instance.domain, false).await {
            let mut session = ctx.store.session();
            data.instance = Some(session.put_inbox(
                &instance.domain,
                None,
                None,
                None,
                Some(&nodeinfo.sw_name()),
                None,
            )?);
        }
    }

    if data.instance.as_ref().is_some_and(|i| i.actor.is_none()) {
        let mut session = ctx.store.session();
        data.instance = Some(session.put_inbox(
            &instance.domain,
            None,
            Some(&data.actor.id),
            None,
            None,
            None,
        )?);
    }

    Ok(())
}

/// Rebroadcast an `Announce`/`Create` as a relay-actor `Announce` of the
/// object id. De-duplicated by `object.id`.
async fn handle_relay(ctx: &Context, data: &InboxData) -> Result<()> {
    let object_id = data
        .message
        .object_id()
        .ok_or_else(|| Error::key("activity has no object id"))?
        .to_owned();

    if let Ok(item) = ctx.cache.get(DEDUP_NS, &object_id) {
        info!(%object_id, previous = %item.value, "already relayed");
        return Ok(());
    }

    let message = Message::new_announce(&ctx.config.domain, Value::String(object_id.clone()));
    debug!(relay = %message.to_json(), "relaying activity");

    ctx.cache.set(
        DEDUP_NS,
        &object_id,
        message.id().unwrap_or_default(),
        CacheType::Str,
    )?;

    let inboxes = {
        let mut session = ctx.store.session();
        session.distill_inboxes(&data.message)?
    };

    for instance in inboxes {
        ctx.push_message(instance.inbox.clone(), message.clone(), Some(instance));
    }

    Ok(())
}

/// Forward a `Delete`/`Update` by announcing the entire inbound activity.
/// De-duplicated by the activity's own id.
async fn handle_forward(ctx: &Context, data: &InboxData) -> Result<()> {
    let message_id = data
        .message
        .id()
        .ok_or_else(|| Error::key("activity has no id"))?
        .to_owned();

    if let Ok(item) = ctx.cache.get(DEDUP_NS, &message_id) {
        info!(%message_id, previous = %item.value, "already forwarded");
        return Ok(());
    }

    let message = Message::new_announce(&ctx.config.domain, data.message.as_value().clone());
    debug!(forward = %message.to_json(), "forwarding activity");

    ctx.cache.set(
        DEDUP_NS,
        &message_id,
        message.id().unwrap_or_default(),
        CacheType::Str,
    )?;

    let inboxes = {
        let mut session = ctx.store.session();
        session.distill_inboxes(&data.message)?
    };

    for instance in inboxes {
        ctx.push_message(instance.inbox.clone(), message.clone(), Some(instance));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Accept,
    Reject,
    Pending,
}

/// The §follow decision tree, kept pure so the full acceptance matrix is
/// testable.
pub fn follow_decision(
    settings: &RelaySettings,
    whitelisted: bool,
    software_banned: bool,
    actor_is_application: bool,
) -> FollowOutcome {
    if software_banned || !actor_is_application {
        return FollowOutcome::Reject;
    }

    if whitelisted {
        return FollowOutcome::Accept;
    }

    if settings.approval_required {
        return FollowOutcome::Pending;
    }

    if settings.whitelist_enabled {
        return FollowOutcome::Reject;
    }

    FollowOutcome::Accept
}

/// Instance actors must be of type `Application`. akkoma (< 3.6.0) and
/// pleroma use `Person` but publish the relay actor at a canonical URL.
pub fn actor_type_check(actor: &Actor, software: Option<&str>) -> bool {
    if actor.kind.as_deref() == Some("Application") {
        return true;
    }

    if matches!(software, Some("akkoma") | Some("pleroma")) {
        if let Ok(domain) = actor.domain() {
            return actor.id == format!("https://{domain}/relay");
        }
    }

    false
}

async fn handle_follow(ctx: &Context, data: &mut InboxData) -> Result<()> {
    let domain = data.actor.domain()?;
    let software = ctx
        .client
        .fetch_nodeinfo(&domain, true)
        .await
        .map(|n| n.sw_name());

    finish_follow(ctx, data, software).await
}

/// The follow handling that remains once the sender's software is known.
async fn finish_follow(
    ctx: &Context,
    data: &mut InboxData,
    software: Option<String>,
) -> Result<()> {
    let domain = data.actor.domain()?;
    let shared_inbox = data.actor.shared_inbox()?.to_owned();
    let followid = data
        .message
        .id()
        .ok_or_else(|| Error::key("follow has no id"))?
        .to_owned();

    let decision = {
        let mut session = ctx.store.session();
        let settings = session.get_config_all()?;
        let whitelisted = session.get_domain_whitelist(&domain)?.is_some();
        let software_banned = match software.as_deref() {
            Some(sw) => session.get_software_ban(sw)?.is_some(),
            None => false,
        };

        follow_decision(
            &settings,
            whitelisted,
            software_banned,
            actor_type_check(&data.actor, software.as_deref()),
        )
    };

    match decision {
        FollowOutcome::Reject => {
            info!(actor = %data.actor.id, ?software, "rejected follow");
            ctx.push_message(
                shared_inbox,
                Message::new_response(&ctx.config.domain, &data.actor.id, &followid, false),
                data.instance.clone(),
            );
        }

        FollowOutcome::Pending => {
            info!(actor = %data.actor.id, "new follow request from actor");
            let mut session = ctx.store.session();
            data.instance = Some(session.put_inbox(
                &domain,
                Some(&shared_inbox),
                Some(&data.actor.id),
                Some(&followid),
                software.as_deref(),
                Some(false),
            )?);
            // no response until an admin decides
        }

        FollowOutcome::Accept => {
            {
                let mut session = ctx.store.session();
                data.instance = Some(session.put_inbox(
                    &domain,
                    Some(&shared_inbox),
                    Some(&data.actor.id),
                    Some(&followid),
                    software.as_deref(),
                    Some(true),
                )?);
            }

            ctx.push_message(
                shared_inbox.clone(),
                Message::new_response(&ctx.config.domain, &data.actor.id, &followid, true),
                data.instance.clone(),
            );

            // mastodon does not expect a follow back
            if software.as_deref() != Some("mastodon") {
                ctx.push_message(
                    shared_inbox,
                    Message::new_follow(&ctx.config.domain, &data.actor.id),
                    data.instance.clone(),
                );
            }
        }
    }

    Ok(())
}

async fn handle_undo(ctx: &Context, data: &InboxData) -> Result<()> {
    if data.message.object_type() != Some("Follow") {
        // forwarding deletes does not work reliably, so don't bother
        return Ok(());
    }

    let instance = data
        .instance
        .as_ref()
        .ok_or_else(|| Error::not_found(format!("instance for {}", data.actor.id)))?;

    // prevent a late unfollow for a superseded follow from removing the row
    if let Some(followid) = &instance.followid {
        if data.message.object_id() != Some(followid.as_str()) {
            info!(
                actor = %data.actor.id,
                %followid,
                undone = ?data.message.object_id(),
                "ignoring undo for a superseded follow"
            );
            return Ok(());
        }
    }

    {
        let mut session = ctx.store.session();
        if !session.del_inbox(&data.actor.id)? {
            info!(actor = %data.actor.id, "no instance row to delete on unfollow");
        }
    }

    ctx.push_message(
        data.actor.shared_inbox()?.to_owned(),
        Message::new_unfollow(
            &ctx.config.domain,
            &data.actor.id,
            data.message.as_value().clone(),
        ),
        data.instance.clone(),
    );

    Ok(())
}
