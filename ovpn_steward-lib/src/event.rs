//! Change notifications emitted towards the administrative layer.

use serde::Serialize;

use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    ServersUpdated,
    ServerOrgsUpdated,
    ServerOutputUpdated,
    UsersUpdated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: Kind,
    pub resource_id: Option<String>,
}

/// Write-only handle onto the event bus, cloned into every worker.
#[derive(Clone)]
pub struct Bus {
    sender: crossbeam_channel::Sender<Event>,
}

impl Bus {
    pub fn channel() -> (Self, crossbeam_channel::Receiver<Event>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Bus { sender }, receiver)
    }

    pub fn emit(&self, kind: Kind, resource_id: Option<&str>) {
        let event = Event {
            kind,
            resource_id: resource_id.map(Into::into),
        };
        if let Err(e) = self.sender.send(event) {
            tracing::warn!(error = ?e, "event bus receiver is gone");
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::ServersUpdated => "SERVERS_UPDATED",
            Kind::ServerOrgsUpdated => "SERVER_ORGS_UPDATED",
            Kind::ServerOutputUpdated => "SERVER_OUTPUT_UPDATED",
            Kind::UsersUpdated => "USERS_UPDATED",
        };
        write!(f, "{name}")
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource_id {
            Some(resource_id) => write!(f, "{} ({resource_id})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}
