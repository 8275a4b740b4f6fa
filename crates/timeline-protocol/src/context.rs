//! Request context: the scope every read and write is checked against.

use crate::error::{TimelineError, TimelineResult};
use crate::event::{ActorType, RoutingKeys};
use crate::ids::{ProjectId, TenantId, ThreadId, is_valid_tenant_id};
use serde::{Deserialize, Serialize};

/// Resolved identity and scope of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<ActorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<TenantId>, project_id: impl Into<ProjectId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            mode: None,
            env: None,
            workspace_id: None,
            actor_id: None,
            actor_type: None,
            session_id: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id.into());
        self.actor_type = Some(actor_type);
        self
    }

    /// Tenant and project must match exactly; mode must match when both carry one.
    pub fn ensure_scope(&self, routing: &RoutingKeys) -> TimelineResult<()> {
        if routing.tenant_id != self.tenant_id {
            return Err(TimelineError::scope(
                "tenant_id",
                self.tenant_id.as_str(),
                routing.tenant_id.as_str(),
            ));
        }
        if routing.project_id != self.project_id {
            return Err(TimelineError::scope(
                "project_id",
                self.project_id.as_str(),
                routing.project_id.as_str(),
            ));
        }
        if let (Some(expected), Some(actual)) = (&self.mode, &routing.mode)
            && expected != actual
        {
            return Err(TimelineError::scope("mode", expected.as_str(), actual.as_str()));
        }
        Ok(())
    }

    pub fn ensure_tenant(&self, tenant_id: &str) -> TimelineResult<()> {
        if self.tenant_id.as_str() != tenant_id {
            return Err(TimelineError::scope(
                "tenant_id",
                self.tenant_id.as_str(),
                tenant_id,
            ));
        }
        Ok(())
    }

    /// Routing keys addressing `thread_id` within this scope.
    pub fn routing_for_thread(&self, thread_id: impl Into<ThreadId>) -> RoutingKeys {
        let mut routing = RoutingKeys::new(self.tenant_id.clone(), self.project_id.clone())
            .with_thread(thread_id);
        routing.mode = self.mode.clone();
        routing.env = self.env.clone();
        routing.workspace_id = self.workspace_id.clone();
        routing.actor_id = self.actor_id.clone();
        routing.actor_type = self.actor_type;
        routing.session_id = self.session_id.clone();
        routing
    }
}

/// A partially specified context, e.g. a WebSocket hello block or ticket claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPatch {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub actor_type: Option<ActorType>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ContextPatch {
    /// Fields set on `self` win; gaps are filled from `fallback`.
    pub fn merge(self, fallback: ContextPatch) -> ContextPatch {
        ContextPatch {
            tenant_id: present(self.tenant_id).or(present(fallback.tenant_id)),
            project_id: present(self.project_id).or(present(fallback.project_id)),
            mode: present(self.mode).or(present(fallback.mode)),
            env: present(self.env).or(present(fallback.env)),
            workspace_id: present(self.workspace_id).or(present(fallback.workspace_id)),
            actor_id: present(self.actor_id).or(present(fallback.actor_id)),
            actor_type: self.actor_type.or(fallback.actor_type),
            session_id: present(self.session_id).or(present(fallback.session_id)),
        }
    }

    /// Finalize into a context. `tenant_id` and `project_id` are mandatory;
    /// `mode` falls back to `default_mode` when absent.
    pub fn into_context(self, default_mode: Option<&str>) -> TimelineResult<RequestContext> {
        let tenant_id = present(self.tenant_id)
            .ok_or_else(|| TimelineError::protocol("missing_context", "tenant_id is required"))?;
        let project_id = present(self.project_id)
            .ok_or_else(|| TimelineError::protocol("missing_context", "project_id is required"))?;
        if !is_valid_tenant_id(&tenant_id) {
            return Err(TimelineError::InvalidRouting(format!(
                "tenant_id {tenant_id:?} does not match t_[a-z0-9_-]+"
            )));
        }

        Ok(RequestContext {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            mode: present(self.mode).or_else(|| default_mode.map(str::to_owned)),
            env: present(self.env),
            workspace_id: present(self.workspace_id),
            actor_id: present(self.actor_id),
            actor_type: self.actor_type,
            session_id: present(self.session_id),
        })
    }
}

impl From<RequestContext> for ContextPatch {
    fn from(context: RequestContext) -> Self {
        Self {
            tenant_id: Some(context.tenant_id.into_inner()),
            project_id: Some(context.project_id.into_inner()),
            mode: context.mode,
            env: context.env,
            workspace_id: context.workspace_id,
            actor_id: context.actor_id,
            actor_type: context.actor_type,
            session_id: context.session_id,
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
