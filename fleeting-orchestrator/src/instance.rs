use fleeting_providers::{CreateServerRequest, ProviderError, Server};
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use crate::errors::GroupError;

/// Identifies an instance outside of the group: `<name>:<server id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iid {
    pub name: String,
    pub id: String,
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

impl FromStr for Iid {
    type Err = GroupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(id), None) if !name.is_empty() && !id.is_empty() => Ok(Iid {
                name: name.to_string(),
                id: id.to_string(),
            }),
            _ => Err(GroupError::InvalidIid(value.to_string())),
        }
    }
}

/// Deferred completion registered by a stage, e.g. "server reaches running".
///
/// Stages start long operations for every instance of a batch and register
/// the wait here, so a batch of three costs one boot time instead of three.
pub struct PendingOperation {
    description: String,
    fut: BoxFuture<'static, Result<(), ProviderError>>,
}

impl PendingOperation {
    pub fn new<F>(description: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        Self {
            description: description.into(),
            fut: Box::pin(fut),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// One compute instance under construction or teardown.
///
/// A non-empty `id` means the server exists, or existed, at the provider.
#[derive(Debug, Default)]
pub struct Instance {
    /// Name of the server and of every resource tagged for it.
    pub name: String,
    /// Provider server id, empty until the server stage succeeds.
    pub id: String,
    /// Provider snapshot, never partially populated.
    pub server: Option<Server>,

    pending: Option<PendingOperation>,
    pub(crate) opts: Option<CreateServerRequest>,
}

impl Instance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_server(server: Server) -> Self {
        Self {
            name: server.name.clone(),
            id: server.id.clone(),
            server: Some(server),
            ..Default::default()
        }
    }

    pub fn from_iid(value: &str) -> Result<Self, GroupError> {
        let iid: Iid = value.parse()?;
        Ok(Self {
            name: iid.name,
            id: iid.id,
            ..Default::default()
        })
    }

    pub fn iid(&self) -> Iid {
        Iid {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }

    /// Registers the completion to await before the next stage. Replaces any
    /// earlier one.
    pub fn set_pending(&mut self, op: PendingOperation) {
        self.pending = Some(op);
    }

    pub fn pending(&self) -> Option<&PendingOperation> {
        self.pending.as_ref()
    }

    /// Awaits and clears the pending completion. No-op when there is none.
    pub async fn wait(&mut self) -> Result<(), GroupError> {
        let Some(op) = self.pending.take() else {
            return Ok(());
        };
        op.fut.await.map_err(|source| GroupError::WaitFailed {
            instance: self.name.clone(),
            source,
        })
    }
}
