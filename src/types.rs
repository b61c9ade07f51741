//! Data structures shared by both controllers.
//!
//! Everything the cluster or the load balancer hands us arrives as loosely
//! typed strings.  Those records are validated once, at the boundary, into
//! the types below; the rest of the daemon only ever sees a [`ListenerKey`]
//! or a [`WorkItem`].

use std::fmt;

use crate::error::SyncError;

/// Transport protocol of a listener.  Only raw TCP is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    /// Parses a protocol name case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            other => Err(SyncError::UnsupportedProtocol(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(port, protocol)` pair.  This is the element of every desired and live
/// set; equality and ordering are by port, then protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl ListenerKey {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// Builds a key from a raw port-mapping record.
    ///
    /// The port must be a decimal integer in `1..=65535`; the protocol is
    /// normalised to upper case before matching.
    pub fn from_raw(port: &str, protocol: &str) -> Result<Self, SyncError> {
        let malformed = |reason: &str| SyncError::MalformedMapping {
            port: port.to_string(),
            protocol: protocol.to_string(),
            reason: reason.to_string(),
        };

        let number: u32 = port
            .trim()
            .parse()
            .map_err(|_| malformed("port is not a number"))?;
        let port_number = u16::try_from(number)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| malformed("port is outside 1-65535"))?;
        let protocol = Protocol::parse(protocol)?;

        Ok(Self {
            port: port_number,
            protocol,
        })
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.port, self.protocol)
    }
}

/// A published port as reported by the cluster, before validation.
///
/// Service endpoints and container port maps both reduce to this shape.
/// `host_ip` is only known for container bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub published_port: Option<String>,
    pub protocol: String,
}

impl PortMapping {
    /// Validates the mapping.  Returns `Ok(None)` for an unpublished mapping.
    pub fn listener_key(&self) -> Result<Option<ListenerKey>, SyncError> {
        match self.published_port.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(port) => ListenerKey::from_raw(port, &self.protocol).map(Some),
        }
    }
}

/// A listener key together with the bind address it came from; the bind
/// address picks the target load balancer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerTarget {
    pub key: ListenerKey,
    pub host_ip: Option<String>,
}

/// Container lifecycle actions the event controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Kill,
}

impl Action {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Action::Start),
            "kill" => Some(Action::Kill),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => f.write_str("start"),
            Action::Kill => f.write_str("kill"),
        }
    }
}

/// A raw notification from the cluster event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterEvent {
    /// Object type, e.g. `container`, `network`, `service`.
    pub scope: String,
    pub action: String,
    pub id: Option<String>,
}

/// One container lifecycle notification queued for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub container_id: String,
    pub action: Action,
}

impl WorkItem {
    /// Keeps container-scoped `start`/`kill` events that name a container.
    pub fn from_event(event: &ClusterEvent) -> Option<Self> {
        if event.scope != "container" {
            return None;
        }
        let action = Action::parse(&event.action)?;
        let container_id = event.id.as_deref().filter(|id| !id.is_empty())?;
        Some(Self {
            container_id: container_id.to_string(),
            action,
        })
    }
}
