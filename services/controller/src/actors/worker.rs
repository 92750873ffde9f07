//! Keyed worker actor.
//!
//! One worker exists per role (scale, delete and template events) and per
//! instance (resource events). A worker applies its events to the lifecycle
//! engine strictly in arrival order. An instance worker stops as soon as its
//! instance is unknown to the store.

use std::sync::Arc;

use async_trait::async_trait;
use ensemble_id::{InstanceKey, Revision, RoleKey};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::engine::{EngineResult, LifecycleEngine, RoleTemplate};

/// Input events of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// New or updated instance template for a role.
    ApplyTemplate { role: RoleKey, template: RoleTemplate },

    /// Bring a role to `desired` live instances.
    ScaleRequest { role: RoleKey, desired: u32 },

    /// Delete one instance.
    DeleteRequest { instance: InstanceKey },

    /// One backing resource of an instance became ready.
    ResourceReady {
        instance: InstanceKey,
        revision: Revision,
    },

    /// One backing resource of an instance failed.
    ResourceError {
        instance: InstanceKey,
        revision: Revision,
    },

    /// All backing resources of an instance are gone.
    TeardownComplete { instance: InstanceKey },
}

/// Serialization domain of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Role(RoleKey),
    Instance(InstanceKey),
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Role(role) => write!(f, "role:{role}"),
            Self::Instance(instance) => write!(f, "instance:{instance}"),
        }
    }
}

impl ControllerEvent {
    /// Events with the same key are handled in order, one at a time.
    pub fn dispatch_key(&self) -> DispatchKey {
        match self {
            Self::ApplyTemplate { role, .. } | Self::ScaleRequest { role, .. } => {
                DispatchKey::Role(role.clone())
            }
            Self::DeleteRequest { instance } => DispatchKey::Role(instance.role.clone()),
            Self::ResourceReady { instance, .. }
            | Self::ResourceError { instance, .. }
            | Self::TeardownComplete { instance } => DispatchKey::Instance(instance.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApplyTemplate { .. } => "apply_template",
            Self::ScaleRequest { .. } => "scale_request",
            Self::DeleteRequest { .. } => "delete_request",
            Self::ResourceReady { .. } => "resource_ready",
            Self::ResourceError { .. } => "resource_error",
            Self::TeardownComplete { .. } => "teardown_complete",
        }
    }
}

/// An event plus an optional completion channel.
#[derive(Debug)]
pub struct Envelope {
    pub event: ControllerEvent,
    pub reply: Option<oneshot::Sender<EngineResult<()>>>,
}

impl Envelope {
    pub fn new(event: ControllerEvent) -> Self {
        Self { event, reply: None }
    }

    pub fn with_reply(event: ControllerEvent) -> (Self, oneshot::Receiver<EngineResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Applies the events of one dispatch key to the engine.
pub struct KeyedWorker {
    key: DispatchKey,
    engine: Arc<LifecycleEngine>,
}

impl KeyedWorker {
    pub fn new(key: DispatchKey, engine: Arc<LifecycleEngine>) -> Self {
        Self { key, engine }
    }

    /// Apply one event to the engine.
    async fn apply(&self, event: ControllerEvent) -> EngineResult<()> {
        match event {
            ControllerEvent::ApplyTemplate { role, template } => {
                self.engine.apply_template(&role, &template).await;
                Ok(())
            }
            ControllerEvent::ScaleRequest { role, desired } => {
                self.engine.scale(&role, desired).await
            }
            ControllerEvent::DeleteRequest { instance } => {
                self.engine.delete_instance(&instance).await
            }
            ControllerEvent::ResourceReady { instance, revision } => self
                .engine
                .handle_resource_ready(&instance, revision)
                .await
                .map(|_| ()),
            ControllerEvent::ResourceError { instance, revision } => {
                self.engine.handle_resource_error(&instance, revision).await
            }
            ControllerEvent::TeardownComplete { instance } => self
                .engine
                .handle_teardown_complete(&instance)
                .await
                .map(|_| ()),
        }
    }

    /// An instance worker has nothing left to do once its instance is gone,
    /// whether it was removed, rolled back or never registered.
    async fn instance_gone(&self) -> bool {
        match &self.key {
            DispatchKey::Role(_) => false,
            DispatchKey::Instance(instance) => {
                self.engine.store().get_status(instance).await.is_none()
            }
        }
    }
}

#[async_trait]
impl Actor for KeyedWorker {
    type Message = Envelope;

    fn name(&self) -> &str {
        match self.key {
            DispatchKey::Role(_) => "role_worker",
            DispatchKey::Instance(_) => "instance_worker",
        }
    }

    async fn handle(&mut self, msg: Envelope, ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let Envelope { event, reply } = msg;
        let kind = event.kind();

        let result = self.apply(event).await;

        if let Err(e) = &result {
            warn!(
                actor_id = %ctx.actor_id,
                key = %self.key,
                event = kind,
                error = %e,
                "Event handling failed"
            );
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }

        if self.instance_gone().await {
            debug!(actor_id = %ctx.actor_id, key = %self.key, "Instance gone, worker stopping");
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_id::{GroupName, InstanceId, RoleName};

    fn role_key() -> RoleKey {
        RoleKey::new(
            "inference/llama".parse().unwrap(),
            GroupName::parse("llama-0").unwrap(),
            RoleName::parse("prefill").unwrap(),
        )
    }

    #[test]
    fn test_dispatch_keys() {
        let role = role_key();
        let instance = role.instance(InstanceId::generate(&role.role));

        let scale = ControllerEvent::ScaleRequest {
            role: role.clone(),
            desired: 2,
        };
        let delete = ControllerEvent::DeleteRequest {
            instance: instance.clone(),
        };
        let ready = ControllerEvent::ResourceReady {
            instance: instance.clone(),
            revision: Revision::FIRST,
        };
        let done = ControllerEvent::TeardownComplete {
            instance: instance.clone(),
        };

        assert_eq!(scale.dispatch_key(), DispatchKey::Role(role.clone()));
        assert_eq!(delete.dispatch_key(), DispatchKey::Role(role));
        assert_eq!(ready.dispatch_key(), DispatchKey::Instance(instance.clone()));
        assert_eq!(done.dispatch_key(), DispatchKey::Instance(instance));
        assert_eq!(ready.kind(), "resource_ready");
    }

    #[test]
    fn test_dispatch_key_display() {
        let key = DispatchKey::Role(role_key());
        assert_eq!(key.to_string(), "role:inference/llama/llama-0/prefill");
    }
}
